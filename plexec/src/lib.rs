//! Plexec's top level crate.
//! Reexports all others.

#![deny(missing_docs)]
#![deny(missing_debug_implementations)]
#![deny(unused_must_use)]

#[cfg(feature = "interval")]
#[doc(inline)]
pub use plexec_interval as interval;

#[cfg(feature = "relations")]
#[doc(inline)]
pub use plexec_relations as relations;

#[cfg(feature = "plan")]
#[doc(inline)]
pub use plexec_plan as plan;

#[cfg(feature = "temporal")]
#[doc(inline)]
pub use plexec_temporal as temporal;

#[cfg(feature = "sched")]
#[doc(inline)]
pub use plexec_sched as sched;

#[cfg(feature = "engine")]
#[doc(inline)]
pub use plexec_engine as engine;
