//! Cooperative task bodies.
//!
//! The kernel never runs task logic itself. A body is polled once per
//! tick while its task is running and answers with the emissions it wants
//! delivered on the next tick.

use plexec_plan::{EventId, Plan, TaskId, Value};

/// One emission a body asks the engine to deliver.
#[derive(Clone, Debug, PartialEq)]
pub struct EmissionRequest {
    /// Event to command.
    pub event: EventId,

    /// Payload to attach.
    pub payload: Option<Value>,
}

/// The emissions requested by one body poll.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct Emissions {
    requests: Vec<EmissionRequest>,
}

impl Emissions {
    /// Request nothing this tick.
    pub fn none() -> Self {
        Emissions::default()
    }

    /// Request an emission without payload.
    pub fn emit(mut self, event: EventId) -> Self {
        self.requests.push(EmissionRequest {
            event,
            payload: None,
        });
        self
    }

    /// Request an emission carrying a payload.
    pub fn emit_with(mut self, event: EventId, payload: Value) -> Self {
        self.requests.push(EmissionRequest {
            event,
            payload: Some(payload),
        });
        self
    }

    pub(crate) fn into_requests(self) -> Vec<EmissionRequest> {
        self.requests
    }
}

/// What a body sees while being polled.
#[derive(Clone, Copy, Debug)]
pub struct BodyContext<'a> {
    /// The task this body belongs to.
    pub task: TaskId,

    /// Read-only view of the plan.
    pub plan: &'a Plan,

    /// The tick's clock value.
    pub now: f64,
}

/// A cooperative task body. `poll` must return promptly; any I/O belongs
/// to external collaborators that enqueue their results.
pub trait TaskBody {
    /// Advance the body one step.
    fn poll(&mut self, ctx: BodyContext<'_>) -> Emissions;
}
