//! The pool of shared PV connections
//!
//! Every request for a PV goes through [`PvPool::get_pv`]. The name is split
//! into its type and the rest (see [`TypedName`]), the factory for that type
//! decides on the core name that identifies the PV, and the pool hands out the
//! one PV that exists for that core name, creating it if needed. Each
//! successful `get_pv` must be matched by one [`PvPool::release_pv`]; the PV is
//! closed by the release that drops the last reference.
//!
//! ```
//! use pvpool::PvPool;
//!
//! let pool = PvPool::builder().default_type("loc").build();
//! let a = pool.get_pv("loc://counter(0)").unwrap();
//! let b = pool.get_pv("counter").unwrap();
//! assert!(std::sync::Arc::ptr_eq(&a, &b));
//! a.write(5.0).unwrap();
//! assert_eq!(b.read().unwrap().value, 5.0.into());
//! pool.release_pv(&a);
//! pool.release_pv(&b);
//! assert!(a.is_closed());
//! ```

use std::{
    backtrace::Backtrace,
    collections::{BTreeSet, HashMap},
    fmt,
    sync::{Arc, OnceLock, Weak},
};

use tracing::{debug, debug_span, error, trace, warn};

use crate::{
    name::{TypedName, name_variants},
    providers::{PvFactory, default_factories},
    pv::{Pv, PvError},
    refcount::{RefCountMap, Released},
    utils::{get_default_pv_type, get_equivalent_prefixes},
};

struct PoolInner {
    factories: HashMap<String, Arc<dyn PvFactory>>,
    pvs: RefCountMap<String, Arc<Pv>>,
    default_type: String,
    equivalent_prefixes: Vec<String>,
}

/// Shared registry of PVs, see the [module documentation](self)
///
/// Cloning gives another handle to the same pool.
#[derive(Clone)]
pub struct PvPool {
    inner: Arc<PoolInner>,
}

/// A handle to a pool that does not keep it alive
#[derive(Clone)]
pub struct WeakPvPool {
    inner: Weak<PoolInner>,
}

impl WeakPvPool {
    pub fn upgrade(&self) -> Option<PvPool> {
        self.inner.upgrade().map(|inner| PvPool { inner })
    }
}

pub struct PvPoolBuilder {
    default_type: String,
    equivalent_prefixes: Vec<String>,
    builtin_factories: bool,
    factories: Vec<Arc<dyn PvFactory>>,
}

impl Default for PvPoolBuilder {
    fn default() -> Self {
        PvPoolBuilder {
            default_type: get_default_pv_type(),
            equivalent_prefixes: get_equivalent_prefixes(),
            builtin_factories: true,
            factories: Vec::new(),
        }
    }
}

impl PvPoolBuilder {
    pub fn new() -> Self {
        PvPoolBuilder::default()
    }
    /// Type used for names without a `type://` prefix
    pub fn default_type(mut self, pv_type: &str) -> Self {
        self.default_type = pv_type.to_owned();
        self
    }
    pub fn equivalent_prefixes<S: AsRef<str>>(mut self, prefixes: &[S]) -> Self {
        self.equivalent_prefixes = prefixes.iter().map(|p| p.as_ref().to_owned()).collect();
        self
    }
    /// Whether to register the `loc`, `sim` and `eq` factories
    pub fn builtin_factories(mut self, enabled: bool) -> Self {
        self.builtin_factories = enabled;
        self
    }
    /// Register a factory, replacing any earlier one for the same type
    pub fn add_factory(mut self, factory: impl PvFactory) -> Self {
        self.factories.push(Arc::new(factory));
        self
    }
    pub fn build(self) -> PvPool {
        let builtin = if self.builtin_factories {
            default_factories()
        } else {
            Vec::new()
        };
        let mut factories: HashMap<String, Arc<dyn PvFactory>> = HashMap::new();
        for factory in builtin.into_iter().chain(self.factories) {
            let pv_type = factory.pv_type().to_owned();
            if factories.insert(pv_type.clone(), factory).is_some() {
                warn!("Replacing earlier factory for PV type '{pv_type}'");
            }
        }
        if !factories.contains_key(&self.default_type) {
            warn!("No factory for the default PV type '{}'", self.default_type);
        }
        debug!(
            "New PV pool with types {:?}, default '{}'",
            factories.keys().collect::<BTreeSet<_>>(),
            self.default_type
        );
        PvPool {
            inner: Arc::new(PoolInner {
                factories,
                pvs: RefCountMap::new(),
                default_type: self.default_type,
                equivalent_prefixes: self.equivalent_prefixes,
            }),
        }
    }
}

impl PvPool {
    pub fn builder() -> PvPoolBuilder {
        PvPoolBuilder::new()
    }

    /// The process wide pool, configured from the environment on first use
    pub fn global() -> &'static PvPool {
        static GLOBAL: OnceLock<PvPool> = OnceLock::new();
        GLOBAL.get_or_init(|| PvPoolBuilder::new().build())
    }

    pub fn default_type(&self) -> &str {
        &self.inner.default_type
    }

    pub fn downgrade(&self) -> WeakPvPool {
        WeakPvPool {
            inner: Arc::downgrade(&self.inner),
        }
    }

    /// The pool key for a name, and the parts needed to create it
    fn resolve(&self, name: &str) -> Result<(String, TypedName, &Arc<dyn PvFactory>), PvError> {
        let typed = TypedName::analyze(name, &self.inner.default_type);
        let factory = self
            .inner
            .factories
            .get(&typed.pv_type)
            .ok_or_else(|| PvError::UnknownType(typed.pv_type.clone()))?;
        let core_name = factory.core_name(&typed.to_string());
        Ok((core_name, typed, factory))
    }

    /// Get a reference to the PV for `name`, creating it if necessary
    ///
    /// Every name with the same core name gives the same PV object. The
    /// reference must be handed back with [`PvPool::release_pv`].
    pub fn get_pv(&self, name: &str) -> Result<Arc<Pv>, PvError> {
        if name.trim().is_empty() {
            return Err(PvError::BlankName);
        }
        let (core_name, typed, factory) = self.resolve(name)?;
        let _span = debug_span!("get_pv", pv = %core_name).entered();
        let entry = self
            .inner
            .pvs
            .create_or_get(&core_name, || {
                debug!("Creating '{name}' with factory '{}'", typed.pv_type);
                factory.create_pv(self, name, &typed.name)
            })
            .map_err(|e| {
                error!("Cannot create PV '{name}': {}", e.source);
                PvError::from(e)
            })?;
        trace!("'{core_name}' now has {} references", entry.references());
        Ok(entry.entry().clone())
    }

    /// Hand back a reference obtained from [`PvPool::get_pv`]
    ///
    /// The PV is closed when its last reference is released. Releasing a PV
    /// that the pool does not hold is logged, and otherwise ignored.
    pub fn release_pv(&self, pv: &Pv) {
        let core_name = match self.resolve(pv.name()) {
            Ok((core_name, _, _)) => core_name,
            Err(e) => {
                warn!("Cannot release PV '{}': {e}", pv.name());
                return;
            }
        };
        let _span = debug_span!("release_pv", pv = %core_name).entered();
        match self
            .inner
            .pvs
            .release_if(&core_name, |pooled| std::ptr::eq(Arc::as_ptr(pooled), pv))
        {
            Released::Remaining(count) => trace!("'{core_name}' has {count} references left"),
            Released::Removed(entry) => {
                debug!("Last reference to '{core_name}' released");
                entry.entry().close();
            }
            Released::Unknown => warn!(
                "Stale release of PV '{}', which is not in the pool\n{}",
                pv.name(),
                Backtrace::capture()
            ),
        }
    }

    /// Registered PV types
    pub fn supported_prefixes(&self) -> BTreeSet<String> {
        self.inner.factories.keys().cloned().collect()
    }

    /// Snapshot of the pooled PVs with their reference counts
    pub fn pv_references(&self) -> Vec<(Arc<Pv>, usize)> {
        self.inner
            .pvs
            .entries()
            .into_iter()
            .map(|(_, entry)| (entry.entry().clone(), entry.references()))
            .collect()
    }

    /// Spellings of `name` under a list of equivalent prefixes
    ///
    /// `get_name_variants("ca://fred", &["ca", "pva"])` gives `ca://fred`,
    /// `fred` and `pva://fred`. A name that doesn't use one of the prefixes
    /// only gives itself.
    pub fn get_name_variants<S: AsRef<str>>(name: &str, equivalent_prefixes: &[S]) -> BTreeSet<String> {
        name_variants(name, equivalent_prefixes)
    }

    /// Spellings of `name` under the equivalent prefixes configured for this pool
    pub fn name_variants(&self, name: &str) -> BTreeSet<String> {
        name_variants(name, &self.inner.equivalent_prefixes)
    }
}

impl fmt::Debug for PvPool {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PvPool")
            .field("types", &self.supported_prefixes())
            .field("default_type", &self.inner.default_type)
            .field("pvs", &self.inner.pvs.len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};

    use super::*;
    use crate::pv::{PvBackend, PvCore};

    /// Counts how many PVs it created and closed
    #[derive(Clone, Default)]
    struct CountingFactory {
        created: Arc<AtomicUsize>,
        closed: Arc<AtomicUsize>,
    }

    struct CountingBackend(Arc<AtomicUsize>);

    impl PvBackend for CountingBackend {
        fn close(&self, _core: &PvCore) {
            self.0.fetch_add(1, Ordering::SeqCst);
        }
    }

    impl PvFactory for CountingFactory {
        fn pv_type(&self) -> &str {
            "test"
        }
        fn core_name(&self, name: &str) -> String {
            name.split('(').next().unwrap_or(name).to_owned()
        }
        fn create_pv(&self, _pool: &PvPool, name: &str, base_name: &str) -> Result<Arc<Pv>, PvError> {
            if base_name.starts_with("fail") {
                return Err(PvError::InvalidValue("Told to fail".into()));
            }
            self.created.fetch_add(1, Ordering::SeqCst);
            Ok(Pv::new(PvCore::new(name, true), CountingBackend(self.closed.clone())))
        }
    }

    fn counting_pool() -> (PvPool, CountingFactory) {
        let factory = CountingFactory::default();
        let pool = PvPool::builder()
            .builtin_factories(false)
            .default_type("test")
            .add_factory(factory.clone())
            .build();
        (pool, factory)
    }

    #[test]
    fn errors() {
        let (pool, factory) = counting_pool();
        assert!(matches!(pool.get_pv(""), Err(PvError::BlankName)));
        assert!(matches!(pool.get_pv("  "), Err(PvError::BlankName)));
        assert!(matches!(pool.get_pv("loc://x"), Err(PvError::UnknownType(t)) if t == "loc"));
        let Err(PvError::Create { name, source }) = pool.get_pv("fail") else {
            panic!("Expected creation to fail");
        };
        assert_eq!(name, "test://fail");
        assert!(matches!(*source, PvError::InvalidValue(_)));
        assert!(pool.pv_references().is_empty());
        assert_eq!(factory.created.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn core_names_share_a_pv() {
        let (pool, factory) = counting_pool();
        let a = pool.get_pv("test://x(1)").unwrap();
        let b = pool.get_pv("x(2)").unwrap();
        assert!(Arc::ptr_eq(&a, &b));
        assert_eq!(a.name(), "test://x(1)");
        assert_eq!(factory.created.load(Ordering::SeqCst), 1);
        let refs = pool.pv_references();
        assert_eq!(refs.len(), 1);
        assert_eq!(refs[0].1, 2);

        pool.release_pv(&b);
        assert!(!a.is_closed());
        pool.release_pv(&a);
        assert!(a.is_closed());
        assert_eq!(factory.closed.load(Ordering::SeqCst), 1);
        // Stale
        pool.release_pv(&a);
        assert_eq!(factory.closed.load(Ordering::SeqCst), 1);
        assert!(pool.pv_references().is_empty());
    }

    #[test]
    fn stale_release_does_not_touch_new_pv() {
        let (pool, factory) = counting_pool();
        let old = pool.get_pv("x").unwrap();
        pool.release_pv(&old);
        let new = pool.get_pv("x").unwrap();
        assert!(!Arc::ptr_eq(&old, &new));
        pool.release_pv(&old);
        assert!(!new.is_closed());
        assert_eq!(pool.pv_references()[0].1, 1);
        assert_eq!(factory.created.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn prefixes_and_variants() {
        let (pool, _) = counting_pool();
        assert_eq!(pool.supported_prefixes(), BTreeSet::from(["test".to_owned()]));
        let pool = PvPool::builder()
            .equivalent_prefixes(&["ca", "pva"])
            .build();
        assert_eq!(
            pool.supported_prefixes(),
            BTreeSet::from(["eq".to_owned(), "loc".to_owned(), "sim".to_owned()])
        );
        assert_eq!(pool.name_variants("pva://x").len(), 3);
        assert_eq!(PvPool::get_name_variants("x", &["ca", "pva"]).len(), 1);
    }

    #[test]
    fn later_factory_replaces_earlier() {
        let factory = CountingFactory::default();
        struct Other;
        impl PvFactory for Other {
            fn pv_type(&self) -> &str {
                "test"
            }
            fn create_pv(&self, _: &PvPool, _: &str, _: &str) -> Result<Arc<Pv>, PvError> {
                Err(PvError::InvalidValue("Replaced".into()))
            }
        }
        let pool = PvPool::builder()
            .builtin_factories(false)
            .add_factory(Other)
            .add_factory(factory.clone())
            .build();
        pool.get_pv("test://x").unwrap();
        assert_eq!(factory.created.load(Ordering::SeqCst), 1);
    }
}
