use std::{
    sync::{
        Arc, Barrier,
        atomic::{AtomicUsize, Ordering},
    },
    thread,
    time::Duration,
};

use parking_lot::Mutex;
use pvpool::{
    Backpressure, Pv, PvBackend, PvCore, PvError, PvPool, Value,
    providers::{LocalFactory, PvFactory},
};
use tokio::select;
use tracing::level_filters::LevelFilter;
use tracing_subscriber::fmt::TestWriter;

fn init_logging() {
    let _ = tracing_subscriber::fmt()
        .with_max_level(LevelFilter::TRACE)
        .with_writer(TestWriter::new())
        .try_init();
}

/// Factory that takes its time, to widen the window for racing creators
#[derive(Clone, Default)]
struct SlowFactory {
    created: Arc<AtomicUsize>,
    closed: Arc<AtomicUsize>,
}

struct SlowBackend(Arc<AtomicUsize>);

impl PvBackend for SlowBackend {
    fn close(&self, _core: &PvCore) {
        self.0.fetch_add(1, Ordering::SeqCst);
    }
}

impl PvFactory for SlowFactory {
    fn pv_type(&self) -> &str {
        "slow"
    }
    fn create_pv(&self, _pool: &PvPool, name: &str, _base_name: &str) -> Result<Arc<Pv>, PvError> {
        thread::sleep(Duration::from_millis(20));
        self.created.fetch_add(1, Ordering::SeqCst);
        Ok(Pv::new(
            PvCore::new(name, true),
            SlowBackend(self.closed.clone()),
        ))
    }
}

#[test]
fn one_pv_for_many_threads() {
    init_logging();
    let factory = SlowFactory::default();
    let pool = PvPool::builder().add_factory(factory.clone()).build();
    let start = Arc::new(Barrier::new(16));

    let workers: Vec<_> = (0..16)
        .map(|_| {
            let pool = pool.clone();
            let start = start.clone();
            thread::spawn(move || {
                start.wait();
                pool.get_pv("slow://shared").unwrap()
            })
        })
        .collect();
    let pvs: Vec<Arc<Pv>> = workers.into_iter().map(|w| w.join().unwrap()).collect();

    assert_eq!(factory.created.load(Ordering::SeqCst), 1);
    assert!(pvs.iter().all(|pv| Arc::ptr_eq(pv, &pvs[0])));
    assert_eq!(pool.pv_references()[0].1, 16);

    for pv in &pvs[1..] {
        pool.release_pv(pv);
        assert!(!pv.is_closed());
    }
    pool.release_pv(&pvs[0]);
    assert!(pvs[0].is_closed());
    assert_eq!(factory.closed.load(Ordering::SeqCst), 1);
    assert!(pool.pv_references().is_empty());

    // A new request after the last release gets a fresh PV
    let again = pool.get_pv("slow://shared").unwrap();
    assert!(!Arc::ptr_eq(&again, &pvs[0]));
    assert_eq!(factory.created.load(Ordering::SeqCst), 2);
    pool.release_pv(&again);
}

/// Local PVs, counting how often one is created
#[derive(Clone, Default)]
struct CountingLocalFactory {
    created: Arc<AtomicUsize>,
}

impl PvFactory for CountingLocalFactory {
    fn pv_type(&self) -> &str {
        LocalFactory.pv_type()
    }
    fn core_name(&self, name: &str) -> String {
        LocalFactory.core_name(name)
    }
    fn create_pv(&self, pool: &PvPool, name: &str, base_name: &str) -> Result<Arc<Pv>, PvError> {
        thread::sleep(Duration::from_millis(20));
        self.created.fetch_add(1, Ordering::SeqCst);
        LocalFactory.create_pv(pool, name, base_name)
    }
}

#[test]
fn spellings_of_one_name_share_a_pv() {
    init_logging();
    let factory = CountingLocalFactory::default();
    let pool = PvPool::builder()
        .default_type("loc")
        .add_factory(factory.clone())
        .build();
    let spellings = ["loc://x(1)", "loc://x(2)", "x"];
    let start = Arc::new(Barrier::new(24));

    let workers: Vec<_> = (0..24)
        .map(|i| {
            let pool = pool.clone();
            let start = start.clone();
            let name = spellings[i % spellings.len()];
            thread::spawn(move || {
                start.wait();
                pool.get_pv(name).unwrap()
            })
        })
        .collect();
    let pvs: Vec<Arc<Pv>> = workers.into_iter().map(|w| w.join().unwrap()).collect();

    assert_eq!(factory.created.load(Ordering::SeqCst), 1);
    assert!(pvs.iter().all(|pv| Arc::ptr_eq(pv, &pvs[0])));
    let references = pool.pv_references();
    assert_eq!(references.len(), 1);
    assert_eq!(references[0].1, 24);

    for pv in &pvs {
        pool.release_pv(pv);
    }
    assert!(pvs[0].is_closed());
    assert!(pool.pv_references().is_empty());
}

#[test]
fn unknown_type_leaves_no_entry() {
    init_logging();
    let pool = PvPool::builder().build();
    let Err(PvError::UnknownType(pv_type)) = pool.get_pv("bogus://x") else {
        panic!("Expected an unknown type");
    };
    assert_eq!(pv_type, "bogus");
    assert!(pool.pv_references().is_empty());
    assert!(matches!(
        pool.get_pv("loc://x(1, \"mixed\""),
        Err(PvError::Create { .. })
    ));
    assert!(pool.pv_references().is_empty());
}

#[test]
fn local_pvs_notify_on_the_writing_thread() {
    init_logging();
    let pool = PvPool::builder().build();
    let pv = pool.get_pv("loc://sync(0)").unwrap();
    let threads = Arc::new(Mutex::new(Vec::new()));
    let seen = threads.clone();
    let handle = pv.on_value(move |_| {
        seen.lock()
            .push(thread::current().name().map(str::to_owned));
    });

    let writer_pv = pv.clone();
    thread::Builder::new()
        .name("local-writer".into())
        .spawn(move || {
            writer_pv.write(1.0).unwrap();
            writer_pv.write(2.0).unwrap();
        })
        .unwrap()
        .join()
        .unwrap();

    let threads = threads.lock();
    assert_eq!(threads.len(), 3);
    assert!(
        threads[1..]
            .iter()
            .all(|name| name.as_deref() == Some("local-writer")),
        "{threads:?}"
    );
    assert_eq!(pv.read().unwrap().value, Value::Double(2.0));
    handle.remove();
    pool.release_pv(&pv);
}

#[test]
fn every_subscriber_gets_the_current_value_once() {
    init_logging();
    let pool = PvPool::builder().build();
    let pv = pool.get_pv("loc://counter<VLong>(0)").unwrap();

    let writer_pv = pv.clone();
    let writer = thread::spawn(move || {
        for i in 1..=5000i64 {
            writer_pv.write(i).unwrap();
        }
    });
    let subscribers: Vec<_> = (0..10)
        .map(|_| {
            let pv = pv.clone();
            thread::spawn(move || {
                for _ in 0..100 {
                    let seen = Arc::new(Mutex::new(Vec::new()));
                    let inner = seen.clone();
                    let handle = pv.on_value(move |v| {
                        let Value::Long(i) = v.value else {
                            panic!("Unexpected value {v}");
                        };
                        inner.lock().push(i);
                    });
                    handle.remove();
                    let seen = seen.lock();
                    assert!(!seen.is_empty());
                    assert!(seen.windows(2).all(|w| w[0] < w[1]), "{seen:?}");
                }
            })
        })
        .collect();
    writer.join().unwrap();
    for subscriber in subscribers {
        subscriber.join().unwrap();
    }
    assert_eq!(pv.listener_count(), 0);
    pool.release_pv(&pv);
}

#[test]
fn name_variants() {
    let pool = PvPool::builder().equivalent_prefixes(&["ca", "pva"]).build();
    let variants: Vec<_> = pool.name_variants("ca://motor").into_iter().collect();
    assert_eq!(variants, ["ca://motor", "motor", "pva://motor"]);
    assert_eq!(pool.name_variants("motor").len(), 1);
    let variants: Vec<_> = pool.name_variants("loc://x").into_iter().collect();
    assert_eq!(variants, ["loc://x"]);
}

#[test]
fn formula_keeps_other_references() {
    init_logging();
    let pool = PvPool::builder().build();
    let a = pool.get_pv("loc://a(1)").unwrap();
    let b = pool.get_pv("loc://b(2)").unwrap();
    let sum = pool.get_pv("=`loc://a` + `loc://b`").unwrap();
    assert!(sum.is_readonly());
    assert_eq!(sum.read().unwrap().value, Value::Double(3.0));

    a.write(10.0).unwrap();
    assert_eq!(sum.read().unwrap().value, Value::Double(12.0));

    let references = |pv: &Arc<Pv>| {
        pool.pv_references()
            .into_iter()
            .find(|(pooled, _)| Arc::ptr_eq(pooled, pv))
            .map(|(_, count)| count)
    };
    assert_eq!(references(&a), Some(2));
    assert_eq!(references(&b), Some(2));

    pool.release_pv(&sum);
    assert!(sum.is_closed());
    assert_eq!(references(&a), Some(1));
    assert_eq!(references(&b), Some(1));
    assert!(!a.is_closed());
    assert_eq!(a.listener_count(), 0);

    pool.release_pv(&a);
    pool.release_pv(&b);
    assert!(pool.pv_references().is_empty());
}

#[tokio::test]
async fn simulated_pv_through_pool() {
    init_logging();
    let pool = PvPool::builder().build();
    let pv = pool.get_pv("sim://ramp(0, 10, 1, 0.5)").unwrap();
    let same = pool.get_pv("sim://ramp(0, 10, 1, 0.5)").unwrap();
    assert!(Arc::ptr_eq(&pv, &same));
    pool.release_pv(&same);

    let mut values = pv.on_value_event(Backpressure::Unbounded);
    assert_eq!(values.recv().await.unwrap().value, Value::Double(0.0));
    select! {
        _ = tokio::time::sleep(Duration::from_secs(4)) => panic!("Did not get a simulated update"),
        v = values.recv() => assert_eq!(v.unwrap().value, Value::Double(1.0)),
    }
    assert!(matches!(pv.write(3.0), Err(PvError::ReadOnly(_))));

    pool.release_pv(&pv);
    assert!(pv.is_closed());
}

#[test]
fn global_pool_is_shared() {
    init_logging();
    let pool = PvPool::global();
    assert!(std::ptr::eq(pool, PvPool::global()));
    let pv = PvPool::global().get_pv("loc://global_test(7)").unwrap();
    let again = pool.get_pv("loc://global_test").unwrap();
    assert!(Arc::ptr_eq(&pv, &again));
    assert_eq!(again.read().unwrap().value, Value::Double(7.0));
    pool.release_pv(&again);
    pool.release_pv(&pv);
    assert!(pv.is_closed());
}
