//! Factories that construct PVs for each supported name type
//!
//! A [`PvPool`] holds one [`PvFactory`] per type prefix, fixed when the pool is
//! built. The factories shipped with this crate are:
//! - [`LocalFactory`] (`loc://`): values that live in this process, written by
//!   the application itself.
//! - [`SimFactory`] (`sim://`): generated signals, updated by a tokio task.
//! - [`FormulaFactory`] (`eq://`, or a leading `=`): arithmetic over other PVs.

pub mod formula;
pub(crate) mod initializer;
pub mod local;
pub mod sim;

pub use formula::FormulaFactory;
pub use local::{Intercom, LocalFactory};
pub use sim::SimFactory;

use std::sync::Arc;

use crate::{PvError, PvPool, pv::Pv};

/// Constructs PVs for one type prefix
pub trait PvFactory: Send + Sync + 'static {
    /// The type prefix handled by this factory, e.g. "loc"
    fn pv_type(&self) -> &str;

    /// The name used as the pool key
    ///
    /// `name` is always given in its full `type://name` form. Factories whose
    /// names carry parameters that should not create a separate PV, like the
    /// initial value in `loc://x(42)`, strip them here.
    fn core_name(&self, name: &str) -> String {
        name.to_owned()
    }

    /// Create a new PV
    ///
    /// `name` is the name as requested by the caller, and `base_name` the part
    /// of it after the type prefix. The pool is passed in so that factories can
    /// request other PVs that the new one depends on. Must not block
    /// indefinitely.
    fn create_pv(&self, pool: &PvPool, name: &str, base_name: &str) -> Result<Arc<Pv>, PvError>;
}

/// The factories that every pool registers unless told otherwise
pub fn default_factories() -> Vec<Arc<dyn PvFactory>> {
    vec![
        Arc::new(LocalFactory),
        Arc::new(SimFactory),
        Arc::new(FormulaFactory),
    ]
}

/// Strip `type://` from a full name, for factories that parse their own part
pub(crate) fn base_of<'a>(name: &'a str, pv_type: &str) -> &'a str {
    name.strip_prefix(pv_type)
        .and_then(|rest| rest.strip_prefix(crate::name::SEPARATOR))
        .unwrap_or(name)
}
