//! PVs whose values live in this process
//!
//! A local PV is created by the first request for its name, and holds whatever
//! is written to it. The name may carry a type and an initial value:
//!
//! - `loc://x` - an undefined number, which takes the type of the first value
//!   written to it
//! - `loc://x(3.14)`, `loc://x("text")`, `loc://x(1, 2, 3)` - inferred type
//! - `loc://x<VLong>(42)`, `loc://x<VEnum>(0, "Off", "On")` - explicit type
//!
//! The type and initial value are only used when the PV is created; later
//! requests that spell them differently share the existing PV.
//!
//! Writes are adapted to the type of the PV, then delivered to every listener
//! on the writing thread before [`Pv::write`] returns.

use std::{
    marker::PhantomData,
    sync::{
        Arc,
        atomic::{AtomicBool, Ordering},
    },
};

use tracing::debug;

use super::{
    PvFactory, base_of,
    initializer::{identifier, initial_value, parse_local_name},
};
use crate::{
    PvError, PvPool,
    name::TypedName,
    pv::{Pv, PvBackend, PvCore},
    vtype::{VType, Value},
};

pub const LOCAL_TYPE: &str = "loc";

#[derive(Clone, Copy, Debug, Default)]
pub struct LocalFactory;

impl PvFactory for LocalFactory {
    fn pv_type(&self) -> &str {
        LOCAL_TYPE
    }

    fn core_name(&self, name: &str) -> String {
        let base = base_of(name, LOCAL_TYPE);
        match identifier(base) {
            Ok((_, core)) => TypedName::format(LOCAL_TYPE, core),
            // Creating will report the problem
            Err(_) => name.to_owned(),
        }
    }

    fn create_pv(&self, _pool: &PvPool, name: &str, base_name: &str) -> Result<Arc<Pv>, PvError> {
        let parsed = parse_local_name(base_name)?;
        let initial = initial_value(parsed.initial.as_deref(), parsed.kind)?;
        debug!("New local PV '{}' = {initial}", parsed.name);
        let core = PvCore::new(name, false);
        core.notify_listeners_of_value(initial);
        Ok(Pv::new(
            core,
            LocalBackend {
                untyped: AtomicBool::new(parsed.kind.is_none() && parsed.initial.is_none()),
            },
        ))
    }
}

struct LocalBackend {
    /// Set until the first write to a PV that was created without a type.
    /// Only changed inside [`PvCore::update`], which serializes writes.
    untyped: AtomicBool,
}

impl PvBackend for LocalBackend {
    fn write(&self, core: &PvCore, value: Value) -> Result<(), PvError> {
        core.update(|old| {
            let value = match old {
                Some(old) => Value::adapt(value, &old.value, self.untyped.load(Ordering::Acquire))?,
                None => value,
            };
            self.untyped.store(false, Ordering::Release);
            Ok(Some(VType::new(value)))
        })
    }
}

/// Typed access to a PV
///
/// Wraps a PV whose value converts to and from `T`, typically a local PV
/// owned by the application.
#[derive(Debug)]
pub struct Intercom<T> {
    pv: Arc<Pv>,
    _marker: PhantomData<fn() -> T>,
}

impl<T> Intercom<T>
where
    T: for<'a> TryFrom<&'a Value, Error = PvError>,
    Value: From<T>,
{
    /// Wrap a PV, checking that its current value converts to `T`
    pub fn new(pv: Arc<Pv>) -> Result<Self, PvError> {
        let intercom = Intercom {
            pv,
            _marker: PhantomData,
        };
        intercom.load()?;
        Ok(intercom)
    }

    pub fn load(&self) -> Result<T, PvError> {
        let value = self
            .pv
            .read()
            .ok_or_else(|| PvError::Disconnected(self.pv.name().to_owned()))?;
        T::try_from(&value.value)
    }

    pub fn store(&self, value: T) -> Result<(), PvError> {
        self.pv.write(Value::from(value))
    }

    pub fn pv(&self) -> &Arc<Pv> {
        &self.pv
    }
}
