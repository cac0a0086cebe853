// #![warn(missing_docs)]

//! A shared, reference counted pool of connections to process variables (PVs).
//!
//! Control system clients address data by name: `ca://BL01:MOTOR.RBV`,
//! `loc://setpoint(5)`, `sim://sine`. Many parts of one application tend to
//! ask for the same names, and each connection has a real cost on the other
//! end. This crate makes sure that every name maps to exactly one live
//! connection per process, shared by everyone who asked for it, and closed when
//! the last user hands it back.
//!
//! The crate is separated into:
//!
//! - [`PvPool`]: the registry. It parses names, dispatches to the factory for
//!   the name's type, and counts references to each PV.
//! - [`Pv`]: one connection. It caches the last value and the write access, and
//!   fans updates out to listeners. The protocol specific parts are supplied by
//!   a [`PvBackend`].
//! - [`providers`]: the [`PvFactory`](providers::PvFactory) trait that creates
//!   PVs, and the built-in factories:
//!   - `loc://` PVs that live inside this process ([`providers::LocalFactory`]),
//!   - `sim://` generated signals ([`providers::SimFactory`]),
//!   - `=` formulas computed from other PVs ([`providers::FormulaFactory`]).
//! - Streams of updates, with a choice of [`Backpressure`], in module
//!   [`subscription`].
//! - The values themselves, [`VType`], in module [`vtype`].
//!
//! ## Example
//!
//! ```
//! use pvpool::{Backpressure, PvPool};
//!
//! let pool = PvPool::builder().build();
//! let setpoint = pool.get_pv("loc://setpoint(5)").unwrap();
//! let doubled = pool.get_pv("=`loc://setpoint` * 2").unwrap();
//!
//! let mut updates = doubled.on_value_event(Backpressure::Latest);
//! assert_eq!(updates.blocking_recv().unwrap().value, 10.0.into());
//!
//! // Local PVs notify synchronously, so the formula is already updated
//! setpoint.write(21.0).unwrap();
//! assert_eq!(updates.blocking_recv().unwrap().value, 42.0.into());
//!
//! pool.release_pv(&doubled);
//! pool.release_pv(&setpoint);
//! ```
//!
//! ## Names
//!
//! A name is `type://name`. Without a `type://` prefix the pool's default type
//! is used, and a name that starts with `=` is always a formula. What follows
//! the prefix is up to the factory; several spellings may share one PV, e.g.
//! `loc://x(1)` and `loc://x(2)` are both the PV `loc://x`, initialised by
//! whichever request came first.
//!
//! ## Configuration
//!
//! [`PvPool::global`] and [`PvPool::builder`] take their defaults from the
//! environment:
//!
//! - `PVPOOL_DEFAULT_TYPE`: type for names without a prefix (`loc`)
//! - `PVPOOL_EQUIVALENT_PREFIXES`: prefixes used by [`PvPool::name_variants`]
//!   (`ca pva`)
//! - `PVPOOL_SUBSCRIPTION_BUFFER`: size of [`Backpressure::buffered`] (`16`)

pub mod name;
pub mod pool;
pub mod providers;
pub mod pv;
pub mod refcount;
pub mod subscription;
pub mod utils;
pub mod vtype;

pub use crate::name::TypedName;
pub use crate::pool::{PvPool, PvPoolBuilder, WeakPvPool};
pub use crate::pv::{ListenerHandle, Pv, PvBackend, PvCore, PvError, PvListener};
pub use crate::subscription::{
    AccessRightsStream, Backpressure, SubscriptionError, SubscriptionTryRecvError, ValueStream,
};
pub use crate::vtype::{Alarm, AlarmSeverity, AlarmStatus, VType, Value, ValueKind};
