//! Map of shared entries with an explicit reference count per key
//!
//! An entry is created by the first caller asking for its key, handed out to every
//! later caller, and removed when the last reference is released. Creation for one
//! key is serialized: concurrent callers for the same key wait for the in-flight
//! creator and then share its entry. The creator only holds the lock for its own
//! key while it runs, so it may itself create entries for other keys.

use std::{
    collections::HashMap,
    fmt::Display,
    hash::Hash,
    sync::{
        Arc,
        atomic::{AtomicUsize, Ordering},
    },
};

use parking_lot::Mutex;
use thiserror::Error;
use tracing::{debug, trace, warn};

/// Error returned when the creator for a new entry failed
#[derive(Debug, Error)]
#[error("Cannot create entry for '{key}'")]
pub struct CreateError<E> {
    pub key: String,
    #[source]
    pub source: E,
}

/// A pooled entry with its reference count
#[derive(Debug)]
pub struct ReferencedEntry<E> {
    entry: E,
    references: AtomicUsize,
}

impl<E> ReferencedEntry<E> {
    pub fn entry(&self) -> &E {
        &self.entry
    }

    /// The number of outstanding references, at the time of reading
    pub fn references(&self) -> usize {
        self.references.load(Ordering::Acquire)
    }
}

/// Outcome of releasing a reference
#[derive(Debug)]
pub enum Released<E> {
    /// The entry is still referenced this many times
    Remaining(usize),
    /// That was the last reference. The entry is no longer in the map.
    Removed(Arc<ReferencedEntry<E>>),
    /// There was no matching entry to release
    Unknown,
}

enum SlotState<E> {
    /// Nobody has created the entry yet; the next caller to lock will
    Vacant,
    Live(Arc<ReferencedEntry<E>>),
    /// Released or failed. Callers holding this slot must look again.
    Removed,
}

struct Slot<E> {
    state: Mutex<SlotState<E>>,
}

pub struct RefCountMap<K, E> {
    slots: Mutex<HashMap<K, Arc<Slot<E>>>>,
}

impl<K, E> Default for RefCountMap<K, E> {
    fn default() -> Self {
        RefCountMap {
            slots: Mutex::new(HashMap::new()),
        }
    }
}

impl<K, E> std::fmt::Debug for RefCountMap<K, E> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RefCountMap")
            .field("slots", &self.slots.lock().len())
            .finish()
    }
}

impl<K, E> RefCountMap<K, E>
where
    K: Eq + Hash + Clone + Display,
{
    pub fn new() -> Self {
        Self::default()
    }

    /// Get the entry for `key`, creating it if absent, and take one reference
    ///
    /// `create` is called at most once, and only if no live entry exists. If it
    /// fails nothing is kept in the map, and the error is returned along with the
    /// key. Callers that were waiting on the failed creation will attempt their own.
    pub fn create_or_get<F, Er>(
        &self,
        key: &K,
        create: F,
    ) -> Result<Arc<ReferencedEntry<E>>, CreateError<Er>>
    where
        F: FnOnce() -> Result<E, Er>,
    {
        let mut create = Some(create);
        loop {
            let slot = self
                .slots
                .lock()
                .entry(key.clone())
                .or_insert_with(|| {
                    Arc::new(Slot {
                        state: Mutex::new(SlotState::Vacant),
                    })
                })
                .clone();
            // The map lock is released here; only this key is held from now on
            let mut state = slot.state.lock();
            match &*state {
                SlotState::Live(entry) => {
                    let count = entry.references.fetch_add(1, Ordering::AcqRel) + 1;
                    trace!("Reference to '{key}' now {count}");
                    return Ok(entry.clone());
                }
                SlotState::Removed => continue,
                SlotState::Vacant => {}
            }
            let Some(create) = create.take() else {
                unreachable!("Creator is only consumed by a returning branch");
            };
            return match create() {
                Ok(value) => {
                    debug!("Created entry for '{key}'");
                    let entry = Arc::new(ReferencedEntry {
                        entry: value,
                        references: AtomicUsize::new(1),
                    });
                    *state = SlotState::Live(entry.clone());
                    Ok(entry)
                }
                Err(source) => {
                    *state = SlotState::Removed;
                    self.forget_slot(key, &slot);
                    Err(CreateError {
                        key: key.to_string(),
                        source,
                    })
                }
            };
        }
    }

    /// Drop one reference to `key`, returning the number of references left
    ///
    /// Reaching zero removes the entry. Releasing a key that isn't present is
    /// logged and reports zero.
    pub fn release(&self, key: &K) -> usize {
        match self.release_if(key, |_| true) {
            Released::Remaining(count) => count,
            Released::Removed(_) => 0,
            Released::Unknown => {
                warn!("Stale release of '{key}'");
                0
            }
        }
    }

    /// Drop one reference to `key`, if the live entry matches `predicate`
    ///
    /// Reporting an [`Released::Unknown`] release is left to the caller.
    pub fn release_if<P>(&self, key: &K, predicate: P) -> Released<E>
    where
        P: FnOnce(&E) -> bool,
    {
        let Some(slot) = self.slots.lock().get(key).cloned() else {
            debug!("Release of '{key}' which has no entry");
            return Released::Unknown;
        };
        let mut state = slot.state.lock();
        let SlotState::Live(entry) = &*state else {
            debug!("Release of '{key}' which is not live");
            return Released::Unknown;
        };
        if !predicate(&entry.entry) {
            debug!("Release of '{key}' does not match the pooled entry");
            return Released::Unknown;
        }
        // Counts only change under the slot lock, and a live entry holds at least one
        let remaining = entry.references.fetch_sub(1, Ordering::AcqRel) - 1;
        trace!("Reference to '{key}' now {remaining}");
        if remaining > 0 {
            return Released::Remaining(remaining);
        }
        let entry = entry.clone();
        *state = SlotState::Removed;
        self.forget_slot(key, &slot);
        debug!("Removed entry for '{key}'");
        Released::Removed(entry)
    }

    /// Snapshot of the live entries
    ///
    /// Waits for any in-flight creation or release of each key, and leaves out
    /// entries whose creation failed. Must not be called from inside a creator.
    pub fn entries(&self) -> Vec<(K, Arc<ReferencedEntry<E>>)> {
        let slots: Vec<_> = self
            .slots
            .lock()
            .iter()
            .map(|(k, s)| (k.clone(), s.clone()))
            .collect();
        slots
            .into_iter()
            .filter_map(|(key, slot)| match &*slot.state.lock() {
                SlotState::Live(entry) => Some((key, entry.clone())),
                _ => None,
            })
            .collect()
    }

    pub fn len(&self) -> usize {
        self.entries().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Remove the slot from the map, unless it has already been replaced
    fn forget_slot(&self, key: &K, slot: &Arc<Slot<E>>) {
        let mut slots = self.slots.lock();
        if slots.get(key).is_some_and(|s| Arc::ptr_eq(s, slot)) {
            slots.remove(key);
        }
    }
}

#[cfg(test)]
mod tests {
    use std::{
        sync::{Barrier, atomic::AtomicUsize},
        thread,
        time::Duration,
    };

    use super::*;

    #[test]
    fn count_up_and_down() {
        let map = RefCountMap::<String, i32>::new();
        let key = "a".to_string();
        let first = map.create_or_get(&key, || Ok::<_, ()>(42)).unwrap();
        let second = map
            .create_or_get(&key, || -> Result<i32, ()> { panic!("Should not create twice") })
            .unwrap();
        assert!(Arc::ptr_eq(&first, &second));
        assert_eq!(first.references(), 2);
        assert_eq!(map.release(&key), 1);
        assert_eq!(map.len(), 1);
        assert_eq!(map.release(&key), 0);
        assert!(map.is_empty());
        // Stale
        assert_eq!(map.release(&key), 0);
    }

    #[test]
    fn failed_creation_leaves_nothing() {
        let map = RefCountMap::<String, i32>::new();
        let key = "bad".to_string();
        let err = map
            .create_or_get(&key, || Err::<i32, _>("nope"))
            .unwrap_err();
        assert_eq!(err.key, "bad");
        assert_eq!(err.source, "nope");
        assert!(map.is_empty());
        // And can be created afterwards
        assert_eq!(*map.create_or_get(&key, || Ok::<_, ()>(1)).unwrap().entry(), 1);
    }

    #[test]
    fn creator_may_use_other_keys() {
        let map = RefCountMap::<String, i32>::new();
        let outer = map
            .create_or_get(&"outer".to_string(), || {
                let inner = map.create_or_get(&"inner".to_string(), || Ok::<_, ()>(1))?;
                Ok::<_, CreateError<()>>(*inner.entry() + 1)
            })
            .unwrap();
        assert_eq!(*outer.entry(), 2);
        assert_eq!(map.len(), 2);
    }

    #[test]
    fn release_if_checks_entry() {
        let map = RefCountMap::<String, i32>::new();
        let key = "k".to_string();
        map.create_or_get(&key, || Ok::<_, ()>(7)).unwrap();
        assert!(matches!(map.release_if(&key, |v| *v == 8), Released::Unknown));
        let Released::Removed(entry) = map.release_if(&key, |v| *v == 7) else {
            panic!("Expected removal");
        };
        assert_eq!(*entry.entry(), 7);
        assert_eq!(entry.references(), 0);
    }

    #[test]
    fn concurrent_create_runs_once() {
        let map = Arc::new(RefCountMap::<String, usize>::new());
        let created = Arc::new(AtomicUsize::new(0));
        let barrier = Arc::new(Barrier::new(16));
        let handles: Vec<_> = (0..16)
            .map(|_| {
                let map = map.clone();
                let created = created.clone();
                let barrier = barrier.clone();
                thread::spawn(move || {
                    barrier.wait();
                    map.create_or_get(&"shared".to_string(), || {
                        Ok::<_, ()>(created.fetch_add(1, Ordering::SeqCst))
                    })
                    .unwrap()
                })
            })
            .collect();
        let entries: Vec<_> = handles.into_iter().map(|h| h.join().unwrap()).collect();
        assert_eq!(created.load(Ordering::SeqCst), 1);
        assert!(entries.iter().all(|e| Arc::ptr_eq(e, &entries[0])));
        assert_eq!(entries[0].references(), 16);
    }

    #[test]
    fn entries_wait_for_busy_slots() {
        let map = Arc::new(RefCountMap::<String, i32>::new());
        let key = "busy".to_string();
        map.create_or_get(&key, || Ok::<_, ()>(3)).unwrap();
        let slot = map.slots.lock().get(&key).cloned().unwrap();
        let held = slot.state.lock();
        let reader = {
            let map = map.clone();
            thread::spawn(move || map.entries().len())
        };
        thread::sleep(Duration::from_millis(50));
        drop(held);
        assert_eq!(reader.join().unwrap(), 1);
    }

    #[test]
    fn interleaved_create_and_release() {
        let map = Arc::new(RefCountMap::<String, usize>::new());
        let created = Arc::new(AtomicUsize::new(0));
        let handles: Vec<_> = (0..8)
            .map(|_| {
                let map = map.clone();
                let created = created.clone();
                thread::spawn(move || {
                    let key = "churn".to_string();
                    for _ in 0..500 {
                        map.create_or_get(&key, || {
                            Ok::<_, ()>(created.fetch_add(1, Ordering::SeqCst))
                        })
                        .unwrap();
                        map.release(&key);
                    }
                })
            })
            .collect();
        for h in handles {
            h.join().unwrap();
        }
        assert!(map.is_empty());
        assert!(created.load(Ordering::SeqCst) >= 1);
    }
}
