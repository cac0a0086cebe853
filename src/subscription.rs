//! Streams of PV updates, built on [`PvListener`] registrations
//!
//! Each stream owns a private channel fed by a listener on the PV. The channel
//! kind is chosen by [`Backpressure`]:
//! - [`Backpressure::Latest`] keeps only the newest value (a `watch` channel), so
//!   a slow consumer skips superseded values.
//! - [`Backpressure::Buffer`] queues up to the given number of values (a
//!   `broadcast` channel), dropping the oldest when full.
//! - [`Backpressure::Unbounded`] queues everything.
//!
//! A new stream always starts with the PV's cached value, if there is one.

use std::sync::{
    Arc,
    atomic::{AtomicBool, Ordering},
};

use futures::{StreamExt, stream::BoxStream};
use parking_lot::Mutex;
use thiserror::Error;
use tokio::sync::{broadcast, mpsc, watch};
use tracing::{debug, trace};

use crate::{
    pv::{ListenerHandle, PvCore, PvListener},
    utils::get_default_subscription_buffer,
    vtype::VType,
};

/// Largest number of values a [`Backpressure::Buffer`] stream holds
pub const MAX_BUFFER: usize = 1 << 16;

/// How a stream treats values that arrive faster than they are consumed
///
/// Buffer sizes are rounded up to the next power of two, and capped at
/// [`MAX_BUFFER`].
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum Backpressure {
    #[default]
    Latest,
    Buffer(usize),
    Unbounded,
}

impl Backpressure {
    /// A bounded buffer of the configured default size
    pub fn buffered() -> Self {
        Backpressure::Buffer(get_default_subscription_buffer())
    }
}

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum SubscriptionError {
    #[error("Subscription closed")]
    Closed,
    #[error("PV '{0}' disconnected")]
    Disconnected(String),
}

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum SubscriptionTryRecvError {
    #[error("No values outstanding")]
    Empty,
    #[error("Subscription closed")]
    Closed,
    #[error("PV '{0}' disconnected")]
    Disconnected(String),
}

impl From<SubscriptionError> for SubscriptionTryRecvError {
    fn from(err: SubscriptionError) -> Self {
        match err {
            SubscriptionError::Closed => Self::Closed,
            SubscriptionError::Disconnected(name) => Self::Disconnected(name),
        }
    }
}

enum TryRecv {
    Empty,
    Closed,
}

/// Sending half of a per-subscriber channel
enum Outbox<T> {
    Latest(watch::Sender<Option<T>>),
    Buffer(broadcast::Sender<T>),
    Unbounded(mpsc::UnboundedSender<T>),
}

/// Receiving half of a per-subscriber channel
enum Inbox<T> {
    Latest(watch::Receiver<Option<T>>),
    Buffer(broadcast::Receiver<T>),
    Unbounded(mpsc::UnboundedReceiver<T>),
}

fn channel<T: Clone>(backpressure: Backpressure) -> (Outbox<T>, Inbox<T>) {
    match backpressure {
        Backpressure::Latest => {
            let (tx, rx) = watch::channel(None);
            (Outbox::Latest(tx), Inbox::Latest(rx))
        }
        Backpressure::Buffer(capacity) => {
            let (tx, rx) = broadcast::channel(capacity.clamp(1, MAX_BUFFER));
            (Outbox::Buffer(tx), Inbox::Buffer(rx))
        }
        Backpressure::Unbounded => {
            let (tx, rx) = mpsc::unbounded_channel();
            (Outbox::Unbounded(tx), Inbox::Unbounded(rx))
        }
    }
}

impl<T: Clone> Outbox<T> {
    fn send(&self, value: T) {
        // A closed receiver just means the stream was dropped before we were removed
        match self {
            Outbox::Latest(tx) => {
                tx.send_replace(Some(value));
            }
            Outbox::Buffer(tx) => {
                let _ = tx.send(value);
            }
            Outbox::Unbounded(tx) => {
                let _ = tx.send(value);
            }
        }
    }
}

impl<T: Clone> Inbox<T> {
    async fn recv(&mut self) -> Option<T> {
        match self {
            Inbox::Latest(rx) => loop {
                rx.changed().await.ok()?;
                if let Some(value) = rx.borrow_and_update().clone() {
                    return Some(value);
                }
            },
            Inbox::Buffer(rx) => loop {
                match rx.recv().await {
                    Ok(value) => return Some(value),
                    Err(broadcast::error::RecvError::Lagged(n)) => {
                        trace!("Subscriber lagged, dropped {n} oldest values");
                        continue;
                    }
                    Err(broadcast::error::RecvError::Closed) => return None,
                }
            },
            Inbox::Unbounded(rx) => rx.recv().await,
        }
    }

    fn try_recv(&mut self) -> Result<T, TryRecv> {
        match self {
            Inbox::Latest(rx) => match rx.has_changed() {
                Ok(true) => rx.borrow_and_update().clone().ok_or(TryRecv::Empty),
                Ok(false) => Err(TryRecv::Empty),
                Err(_) => Err(TryRecv::Closed),
            },
            Inbox::Buffer(rx) => loop {
                match rx.try_recv() {
                    Ok(value) => return Ok(value),
                    Err(broadcast::error::TryRecvError::Lagged(_)) => continue,
                    Err(broadcast::error::TryRecvError::Empty) => return Err(TryRecv::Empty),
                    Err(broadcast::error::TryRecvError::Closed) => return Err(TryRecv::Closed),
                }
            },
            Inbox::Unbounded(rx) => rx.try_recv().map_err(|e| match e {
                mpsc::error::TryRecvError::Empty => TryRecv::Empty,
                mpsc::error::TryRecvError::Disconnected => TryRecv::Closed,
            }),
        }
    }
}

struct ValueForwarder {
    outbox: Outbox<VType>,
}

impl PvListener for ValueForwarder {
    fn value_changed(&self, _pv_name: &str, value: &VType) {
        self.outbox.send(value.clone());
    }
}

/// Stream of values from a PV
///
/// A disconnection is reported once as [`SubscriptionError::Disconnected`] and
/// ends the stream. After [`ValueStream::cancel`], or once the PV is closed, every
/// receive reports [`SubscriptionError::Closed`]. Dropping the stream cancels it.
pub struct ValueStream {
    pv_name: String,
    inbox: Inbox<VType>,
    handle: ListenerHandle,
    cancelled: AtomicBool,
}

impl ValueStream {
    pub(crate) fn new(core: &Arc<PvCore>, backpressure: Backpressure) -> Self {
        let (outbox, inbox) = channel(backpressure);
        debug!("New {backpressure:?} value subscription to '{}'", core.name());
        let handle = core.add_listener(Arc::new(ValueForwarder { outbox }));
        ValueStream {
            pv_name: core.name().to_owned(),
            inbox,
            handle,
            cancelled: AtomicBool::new(false),
        }
    }

    pub fn pv_name(&self) -> &str {
        &self.pv_name
    }

    fn check(&mut self, value: VType) -> Result<VType, SubscriptionError> {
        if value.is_disconnected() {
            self.cancel();
            return Err(SubscriptionError::Disconnected(self.pv_name.clone()));
        }
        Ok(value)
    }

    /// Receive the next value
    pub async fn recv(&mut self) -> Result<VType, SubscriptionError> {
        if self.is_cancelled() {
            return Err(SubscriptionError::Closed);
        }
        match self.inbox.recv().await {
            Some(value) if !self.is_cancelled() => self.check(value),
            _ => {
                self.cancel();
                Err(SubscriptionError::Closed)
            }
        }
    }

    /// Try to receive a value without waiting
    pub fn try_recv(&mut self) -> Result<VType, SubscriptionTryRecvError> {
        if self.is_cancelled() {
            return Err(SubscriptionTryRecvError::Closed);
        }
        match self.inbox.try_recv() {
            Ok(value) => Ok(self.check(value)?),
            Err(TryRecv::Empty) => Err(SubscriptionTryRecvError::Empty),
            Err(TryRecv::Closed) => {
                self.cancel();
                Err(SubscriptionTryRecvError::Closed)
            }
        }
    }

    /// Blocking receive for synchronous contexts
    pub fn blocking_recv(&mut self) -> Result<VType, SubscriptionError> {
        futures::executor::block_on(self.recv())
    }

    /// Stop receiving. Nothing is delivered once this returns.
    pub fn cancel(&self) {
        if !self.cancelled.swap(true, Ordering::AcqRel) {
            trace!("Cancelling value subscription to '{}'", self.pv_name);
        }
        self.handle.remove();
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancelled.load(Ordering::Acquire)
    }

    /// Convert into a [`futures::Stream`], which ends when the subscription closes
    pub fn into_stream(self) -> BoxStream<'static, Result<VType, SubscriptionError>> {
        futures::stream::unfold(self, |mut stream| async move {
            match stream.recv().await {
                Err(SubscriptionError::Closed) => None,
                item => Some((item, stream)),
            }
        })
        .boxed()
    }
}

impl Drop for ValueStream {
    fn drop(&mut self) {
        self.cancel();
    }
}

struct AccessForwarder {
    outbox: watch::Sender<Option<bool>>,
    readonly: Mutex<bool>,
}

impl AccessForwarder {
    fn publish(&self, writable: bool) {
        self.outbox.send_if_modified(|current| {
            if *current == Some(writable) {
                return false;
            }
            *current = Some(writable);
            true
        });
    }
}

impl PvListener for AccessForwarder {
    fn permissions_changed(&self, _pv_name: &str, readonly: bool) {
        *self.readonly.lock() = readonly;
        self.publish(!readonly);
    }

    fn value_changed(&self, _pv_name: &str, value: &VType) {
        if value.is_disconnected() {
            self.publish(false);
        } else {
            // Back from a disconnect
            let readonly = *self.readonly.lock();
            self.publish(!readonly);
        }
    }
}

/// Stream of write access to a PV, `true` meaning writable
///
/// Only the latest state is kept. A disconnected PV reports `false`.
pub struct AccessRightsStream {
    pv_name: String,
    inbox: Inbox<bool>,
    handle: ListenerHandle,
    cancelled: AtomicBool,
}

impl AccessRightsStream {
    pub(crate) fn new(core: &Arc<PvCore>) -> Self {
        let (outbox, rx) = watch::channel(None);
        let handle = core.add_listener(Arc::new(AccessForwarder {
            outbox,
            readonly: Mutex::new(core.is_readonly()),
        }));
        AccessRightsStream {
            pv_name: core.name().to_owned(),
            inbox: Inbox::Latest(rx),
            handle,
            cancelled: AtomicBool::new(false),
        }
    }

    pub fn pv_name(&self) -> &str {
        &self.pv_name
    }

    pub async fn recv(&mut self) -> Result<bool, SubscriptionError> {
        if self.is_cancelled() {
            return Err(SubscriptionError::Closed);
        }
        match self.inbox.recv().await {
            Some(writable) if !self.is_cancelled() => Ok(writable),
            _ => {
                self.cancel();
                Err(SubscriptionError::Closed)
            }
        }
    }

    pub fn try_recv(&mut self) -> Result<bool, SubscriptionTryRecvError> {
        if self.is_cancelled() {
            return Err(SubscriptionTryRecvError::Closed);
        }
        self.inbox.try_recv().map_err(|e| match e {
            TryRecv::Empty => SubscriptionTryRecvError::Empty,
            TryRecv::Closed => SubscriptionTryRecvError::Closed,
        })
    }

    pub fn blocking_recv(&mut self) -> Result<bool, SubscriptionError> {
        futures::executor::block_on(self.recv())
    }

    pub fn cancel(&self) {
        self.cancelled.store(true, Ordering::Release);
        self.handle.remove();
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancelled.load(Ordering::Acquire)
    }

    pub fn into_stream(self) -> BoxStream<'static, bool> {
        futures::stream::unfold(self, |mut stream| async move {
            stream.recv().await.ok().map(|writable| (writable, stream))
        })
        .boxed()
    }
}

impl Drop for AccessRightsStream {
    fn drop(&mut self) {
        self.cancel();
    }
}
