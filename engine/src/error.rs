//! Errors surfaced by the engine.

use plexec_plan::PlanError;
use plexec_temporal::TemporalError;

/// Engine error: a structural failure, a temporal violation, or a defect
/// of the propagation graph itself.
#[derive(Clone, Debug, PartialEq, Fail)]
pub enum EngineError {
    /// Structural plan error; the failing call left the plan unchanged.
    #[fail(display = "{}", _0)]
    Structural(#[fail(cause)] PlanError),

    /// Temporal or occurrence violation, or a missed deadline.
    #[fail(display = "{}", _0)]
    Temporal(#[fail(cause)] TemporalError),

    /// Event propagation did not settle within the configured number of
    /// rounds; the signal/forward graph almost certainly contains a loop.
    #[fail(display = "Propagation did not settle within {} rounds", _0)]
    PropagationLoop(usize),
}

impl From<PlanError> for EngineError {
    fn from(error: PlanError) -> Self {
        EngineError::Structural(error)
    }
}

impl From<TemporalError> for EngineError {
    fn from(error: TemporalError) -> Self {
        EngineError::Temporal(error)
    }
}
