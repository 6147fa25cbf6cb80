//! Task records.

use std::collections::BTreeMap;

use crate::{value::Value, EventId, TaskId};

/// Life-cycle state of a task.
///
/// Transitions are driven exclusively by emissions of the task's standard
/// events; external code never sets the state directly.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[cfg_attr(feature = "serde-1", derive(serde::Serialize, serde::Deserialize))]
pub enum TaskState {
    /// Added to the plan, `start` not yet emitted.
    Pending,

    /// The scheduler committed to starting the task; `start` is on its way.
    Starting,

    /// `start` emitted.
    Running,

    /// A terminal event emitted, `stop` not yet.
    Finishing,

    /// Stopped after `success`.
    Succeeded,

    /// Stopped without `success`.
    Failed,
}

impl TaskState {
    /// Check if the task may still be picked up by the scheduler.
    pub fn is_pending(&self) -> bool {
        *self == TaskState::Pending
    }

    /// Check if the task reached one of the terminal states.
    pub fn is_finished(&self) -> bool {
        matches!(self, TaskState::Succeeded | TaskState::Failed)
    }
}

/// A task owned by a plan.
#[derive(Debug)]
pub struct Task {
    pub(crate) id: TaskId,
    pub(crate) state: TaskState,
    pub(crate) executable: bool,
    pub(crate) addition_time: f64,
    pub(crate) finalized_at: Option<f64>,
    pub(crate) arguments: BTreeMap<String, Value>,
    pub(crate) start: EventId,
    pub(crate) success: EventId,
    pub(crate) failed: EventId,
    pub(crate) stop: EventId,
    pub(crate) bound_events: BTreeMap<String, EventId>,
}

impl Task {
    /// Get the task id.
    pub fn id(&self) -> TaskId {
        self.id
    }

    /// Get the current life-cycle state.
    pub fn state(&self) -> TaskState {
        self.state
    }

    /// Check if the task may be started at all.
    pub fn executable(&self) -> bool {
        self.executable
    }

    /// Get the time at which the task was added to its plan.
    pub fn addition_time(&self) -> f64 {
        self.addition_time
    }

    /// Get the finalization time, or `None` while the task is in the plan.
    pub fn finalized_at(&self) -> Option<f64> {
        self.finalized_at
    }

    /// Check if the task has been finalized.
    pub fn is_finalized(&self) -> bool {
        self.finalized_at.is_some()
    }

    /// Get the argument mapping.
    pub fn arguments(&self) -> &BTreeMap<String, Value> {
        &self.arguments
    }

    /// Get the `start` event.
    pub fn start_event(&self) -> EventId {
        self.start
    }

    /// Get the `success` event.
    pub fn success_event(&self) -> EventId {
        self.success
    }

    /// Get the `failed` event.
    pub fn failed_event(&self) -> EventId {
        self.failed
    }

    /// Get the `stop` event.
    pub fn stop_event(&self) -> EventId {
        self.stop
    }

    /// Get a bound event by name. Standard events are reachable here too.
    pub fn event(&self, name: &str) -> Option<EventId> {
        self.bound_events.get(name).copied()
    }

    /// Iterate over all bound events in name order.
    pub fn events(&self) -> impl Iterator<Item = (&str, EventId)> {
        self.bound_events
            .iter()
            .map(|(name, &event)| (name.as_str(), event))
    }
}
