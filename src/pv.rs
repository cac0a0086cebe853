//! A single live PV connection, shared by everyone who asked for its name
//!
//! A [`Pv`] is split in two halves:
//! - [`PvCore`] holds everything common to all protocols: the name, the last
//!   received value, the read-only flag, and the list of listeners. Transport code
//!   feeds it through [`PvCore::notify_listeners_of_value`] and
//!   [`PvCore::notify_listeners_of_permissions`].
//! - A [`PvBackend`] supplies whatever is protocol specific: writing, active
//!   reads, and releasing transport resources on close. Factories pick the backend
//!   when they construct the PV.
//!
//! Listener registration and every notification pass go through the same per-PV
//! delivery lock. Registering a listener therefore delivers the cached state to it
//! exactly once, and never out of order with a concurrent update. The lock is
//! re-entrant, so a listener may write back to the PV that is notifying it.

use std::{
    fmt,
    panic::{AssertUnwindSafe, catch_unwind},
    sync::{
        Arc, Weak,
        atomic::{AtomicBool, AtomicU64, Ordering},
    },
};

use arc_swap::ArcSwap;
use futures::{
    FutureExt,
    future::{self, BoxFuture},
};
use parking_lot::{Mutex, ReentrantMutex};
use thiserror::Error;
use tracing::{debug, error, trace};

use crate::{
    refcount::CreateError,
    subscription::{AccessRightsStream, Backpressure, ValueStream},
    vtype::{VType, Value},
};

#[derive(Debug, Error)]
pub enum PvError {
    #[error("PV name is empty")]
    BlankName,
    #[error("Unknown PV type '{0}'")]
    UnknownType(String),
    #[error("Cannot create PV '{name}'")]
    Create {
        name: String,
        #[source]
        source: Box<PvError>,
    },
    #[error("Invalid PV name '{name}': {reason}")]
    InvalidName { name: String, reason: String },
    #[error("{0}")]
    InvalidValue(String),
    #[error("PV '{0}' is read-only")]
    ReadOnly(String),
    #[error("PV '{0}' has been closed")]
    Closed(String),
    #[error("PV '{0}' is disconnected")]
    Disconnected(String),
    #[error("Cannot parse formula '{expression}': {reason}")]
    Formula { expression: String, reason: String },
    #[error("PV '{0}' needs a running tokio runtime")]
    NoRuntime(String),
}

impl From<CreateError<PvError>> for PvError {
    fn from(err: CreateError<PvError>) -> Self {
        PvError::Create {
            name: err.key,
            source: Box::new(err.source),
        }
    }
}

/// Receives updates from a PV
///
/// Callbacks run on whichever thread produced the update. A panicking callback
/// is logged and does not stop delivery to the other listeners.
pub trait PvListener: Send + Sync + 'static {
    #[allow(unused_variables)]
    fn value_changed(&self, pv_name: &str, value: &VType) {}

    #[allow(unused_variables)]
    fn permissions_changed(&self, pv_name: &str, readonly: bool) {}
}

struct ValueFn<F>(F);

impl<F> PvListener for ValueFn<F>
where
    F: Fn(&VType) + Send + Sync + 'static,
{
    fn value_changed(&self, _pv_name: &str, value: &VType) {
        (self.0)(value)
    }
}

/// Protocol specific behaviour of a PV
///
/// Every method has a default suited to a read-only PV whose data only arrives
/// through notifications.
pub trait PvBackend: Send + Sync + 'static {
    /// Fetch a value. The default completes immediately with the cached value.
    fn async_read(&self, core: &PvCore) -> BoxFuture<'static, Result<Option<VType>, PvError>> {
        future::ready(Ok(core.read())).boxed()
    }

    #[allow(unused_variables)]
    fn write(&self, core: &PvCore, value: Value) -> Result<(), PvError> {
        Err(PvError::ReadOnly(core.name().to_owned()))
    }

    /// Write with completion. The default writes, then completes immediately.
    fn async_write(&self, core: &PvCore, value: Value) -> BoxFuture<'static, Result<(), PvError>> {
        future::ready(self.write(core, value)).boxed()
    }

    /// Release transport resources. Called exactly once.
    #[allow(unused_variables)]
    fn close(&self, core: &PvCore) {}
}

struct ListenerEntry {
    id: u64,
    active: AtomicBool,
    listener: Arc<dyn PvListener>,
}

#[derive(Default)]
struct PvState {
    last_value: Option<VType>,
    readonly: bool,
}

/// Protocol independent state of a PV, and the fan-out to its listeners
pub struct PvCore {
    name: String,
    state: Mutex<PvState>,
    /// Serializes notification passes with listener registration and removal
    delivery: ReentrantMutex<()>,
    listeners: ArcSwap<Vec<Arc<ListenerEntry>>>,
    next_listener_id: AtomicU64,
}

impl PvCore {
    pub fn new(name: impl Into<String>, readonly: bool) -> Arc<PvCore> {
        Arc::new(PvCore {
            name: name.into(),
            state: Mutex::new(PvState {
                last_value: None,
                readonly,
            }),
            delivery: ReentrantMutex::new(()),
            listeners: ArcSwap::from_pointee(Vec::new()),
            next_listener_id: AtomicU64::new(0),
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// The last value received, if there has been one
    pub fn read(&self) -> Option<VType> {
        self.state.lock().last_value.clone()
    }

    pub fn is_readonly(&self) -> bool {
        self.state.lock().readonly
    }

    /// Record a new value and pass it to every listener
    pub fn notify_listeners_of_value(&self, value: VType) {
        let _delivery = self.delivery.lock();
        self.state.lock().last_value = Some(value.clone());
        let listeners = self.listeners.load_full();
        trace!("'{}' update to {} listeners: {value}", self.name, listeners.len());
        for entry in listeners.iter() {
            self.deliver(entry, |l| l.value_changed(&self.name, &value));
        }
    }

    /// Replace the value with one computed from the cached value, and publish it
    ///
    /// Runs inside the delivery lock, so no other update or listener flush can
    /// come between reading the old value and publishing the new one. Returning
    /// `Ok(None)` or an error leaves the value unchanged.
    pub fn update<F>(&self, compute: F) -> Result<(), PvError>
    where
        F: FnOnce(Option<&VType>) -> Result<Option<VType>, PvError>,
    {
        let _delivery = self.delivery.lock();
        let old = self.read();
        if let Some(value) = compute(old.as_ref())? {
            self.notify_listeners_of_value(value);
        }
        Ok(())
    }

    /// Record a change in write access and pass it to every listener
    pub fn notify_listeners_of_permissions(&self, readonly: bool) {
        let _delivery = self.delivery.lock();
        self.state.lock().readonly = readonly;
        let listeners = self.listeners.load_full();
        for entry in listeners.iter() {
            self.deliver(entry, |l| l.permissions_changed(&self.name, readonly));
        }
    }

    pub(crate) fn add_listener(self: &Arc<Self>, listener: Arc<dyn PvListener>) -> ListenerHandle {
        let _delivery = self.delivery.lock();
        let entry = Arc::new(ListenerEntry {
            id: self.next_listener_id.fetch_add(1, Ordering::Relaxed),
            active: AtomicBool::new(true),
            listener,
        });
        self.listeners.rcu(|current| {
            let mut listeners = Vec::clone(current);
            listeners.push(entry.clone());
            listeners
        });
        // Flush the current state while still holding the delivery lock
        let (readonly, last_value) = {
            let state = self.state.lock();
            (state.readonly, state.last_value.clone())
        };
        self.deliver(&entry, |l| l.permissions_changed(&self.name, readonly));
        if let Some(value) = last_value {
            self.deliver(&entry, |l| l.value_changed(&self.name, &value));
        }
        ListenerHandle {
            core: Arc::downgrade(self),
            entry: Arc::downgrade(&entry),
            id: entry.id,
        }
    }

    fn remove_listener(&self, id: u64) {
        let _delivery = self.delivery.lock();
        self.listeners.rcu(|current| {
            current
                .iter()
                .filter(|e| e.id != id)
                .cloned()
                .collect::<Vec<_>>()
        });
    }

    fn clear_listeners(&self) {
        let _delivery = self.delivery.lock();
        let listeners = self.listeners.swap(Arc::new(Vec::new()));
        for entry in listeners.iter() {
            entry.active.store(false, Ordering::Release);
        }
    }

    pub fn listener_count(&self) -> usize {
        self.listeners.load().len()
    }

    fn deliver(&self, entry: &ListenerEntry, call: impl FnOnce(&dyn PvListener)) {
        if !entry.active.load(Ordering::Acquire) {
            return;
        }
        if catch_unwind(AssertUnwindSafe(|| call(entry.listener.as_ref()))).is_err() {
            error!("Listener {} of PV '{}' panicked", entry.id, self.name);
        }
    }
}

impl fmt::Debug for PvCore {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let state = self.state.lock();
        f.debug_struct("PvCore")
            .field("name", &self.name)
            .field("last_value", &state.last_value)
            .field("readonly", &state.readonly)
            .field("listeners", &self.listeners.load().len())
            .finish()
    }
}

/// Registration of a [`PvListener`] with a PV
///
/// Removing is idempotent, and once [`ListenerHandle::remove`] returns the
/// listener will not be called again. Dropping the handle removes the listener.
#[must_use = "Dropping the handle removes the listener"]
pub struct ListenerHandle {
    core: Weak<PvCore>,
    entry: Weak<ListenerEntry>,
    id: u64,
}

impl ListenerHandle {
    pub fn remove(&self) {
        // Gone if the PV was closed and dropped its listeners
        let Some(entry) = self.entry.upgrade() else {
            return;
        };
        if !entry.active.swap(false, Ordering::AcqRel) {
            return;
        }
        if let Some(core) = self.core.upgrade() {
            core.remove_listener(self.id);
        }
    }

    pub fn is_active(&self) -> bool {
        self.entry
            .upgrade()
            .is_some_and(|e| e.active.load(Ordering::Acquire))
    }
}

impl Drop for ListenerHandle {
    fn drop(&mut self) {
        self.remove();
    }
}

impl fmt::Debug for ListenerHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ListenerHandle")
            .field("id", &self.id)
            .field("active", &self.is_active())
            .finish()
    }
}

/// Handle to one live PV connection
pub struct Pv {
    core: Arc<PvCore>,
    backend: Box<dyn PvBackend>,
    closed: AtomicBool,
}

impl Pv {
    pub fn new(core: Arc<PvCore>, backend: impl PvBackend) -> Arc<Pv> {
        Arc::new(Pv {
            core,
            backend: Box::new(backend),
            closed: AtomicBool::new(false),
        })
    }

    /// The name as given by the caller that created this PV
    pub fn name(&self) -> &str {
        self.core.name()
    }

    /// The cached value, without any communication
    pub fn read(&self) -> Option<VType> {
        self.core.read()
    }

    pub fn async_read(&self) -> BoxFuture<'static, Result<Option<VType>, PvError>> {
        if self.is_closed() {
            return future::ready(Err(PvError::Closed(self.name().to_owned()))).boxed();
        }
        self.backend.async_read(&self.core)
    }

    pub fn is_readonly(&self) -> bool {
        self.core.is_readonly()
    }

    pub fn write(&self, value: impl Into<Value>) -> Result<(), PvError> {
        if self.is_closed() {
            return Err(PvError::Closed(self.name().to_owned()));
        }
        self.backend.write(&self.core, value.into())
    }

    pub fn async_write(&self, value: impl Into<Value>) -> BoxFuture<'static, Result<(), PvError>> {
        if self.is_closed() {
            return future::ready(Err(PvError::Closed(self.name().to_owned()))).boxed();
        }
        self.backend.async_write(&self.core, value.into())
    }

    /// Register a listener, which immediately receives the current permissions
    /// and the cached value (if any)
    pub fn add_listener(&self, listener: impl PvListener) -> ListenerHandle {
        self.core.add_listener(Arc::new(listener))
    }

    /// Register a closure for value updates only
    pub fn on_value<F>(&self, callback: F) -> ListenerHandle
    where
        F: Fn(&VType) + Send + Sync + 'static,
    {
        self.add_listener(ValueFn(callback))
    }

    /// Subscribe to values as a stream
    pub fn on_value_event(&self, backpressure: Backpressure) -> ValueStream {
        ValueStream::new(&self.core, backpressure)
    }

    /// Subscribe to write access as a stream of "is writable" flags
    pub fn on_access_rights_event(&self) -> AccessRightsStream {
        AccessRightsStream::new(&self.core)
    }

    pub fn listener_count(&self) -> usize {
        self.core.listener_count()
    }

    /// Release the connection
    ///
    /// Only the first call does anything. All listeners are dropped, which ends
    /// every stream taken from this PV.
    pub fn close(&self) {
        if self.closed.swap(true, Ordering::AcqRel) {
            return;
        }
        debug!("Closing PV '{}'", self.name());
        self.backend.close(&self.core);
        self.core.clear_listeners();
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }
}

impl Drop for Pv {
    fn drop(&mut self) {
        self.close();
    }
}

impl fmt::Debug for Pv {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Pv")
            .field("core", &self.core)
            .field("closed", &self.is_closed())
            .finish()
    }
}

impl fmt::Display for Pv {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.read() {
            Some(value) => write!(f, "{} = {value}", self.name()),
            None => write!(f, "{} (no value)", self.name()),
        }
    }
}
