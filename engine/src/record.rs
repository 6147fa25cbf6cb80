//! The observability stream.

use plexec_plan::{EventId, ObjectRef, RelationKind, TaskId, Value};
use plexec_sched::SchedulingGroup;

use crate::error::EngineError;

/// Result of one engine tick.
#[derive(Clone, Debug)]
pub struct TickReport {
    /// Clock value the tick ran at.
    pub now: f64,

    /// Tasks whose start was commanded, in start order.
    pub started: Vec<TaskId>,

    /// Errors collected during the tick: emission failures from queued
    /// deliveries and missed deadlines. Nothing is silently swallowed.
    pub errors: Vec<EngineError>,

    /// Groups the scheduler refused to start, with their reasons.
    pub refused: Vec<SchedulingGroup>,
}

impl TickReport {
    /// Check if the tick started nothing and reported no error.
    pub fn is_quiet(&self) -> bool {
        self.started.is_empty() && self.errors.is_empty()
    }
}

/// One record of the read-only observability stream.
///
/// Subscribers receive records as the engine performs the corresponding
/// action; they must not block and cannot mutate the core.
#[derive(Clone, Debug)]
pub enum Record {
    /// A task was added to the plan.
    TaskAdded {
        /// The new task.
        task: TaskId,
    },

    /// A task was finalized.
    TaskRemoved {
        /// The finalized task.
        task: TaskId,
    },

    /// An event emitted.
    Emitted {
        /// The emitting event.
        event: EventId,

        /// Emission time.
        time: f64,

        /// Attached payload.
        payload: Option<Value>,
    },

    /// A relation edge was added.
    RelationAdded {
        /// Relation kind.
        kind: RelationKind,

        /// Edge source.
        source: ObjectRef,

        /// Edge target.
        target: ObjectRef,
    },

    /// A relation edge was removed.
    RelationRemoved {
        /// Relation kind.
        kind: RelationKind,

        /// Edge source.
        source: ObjectRef,

        /// Edge target.
        target: ObjectRef,
    },

    /// A tick completed.
    TickReport(TickReport),
}
