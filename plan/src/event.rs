//! Event generators and their emission histories.

use std::rc::Rc;

use derivative::Derivative;
use smallvec::SmallVec;

use crate::{value::Value, EventId, TaskId};

bitflags! {
    /// Properties of an event generator.
    pub struct EventFlags: u32 {
        /// The event may be commanded by external callers. Events without
        /// this flag are only reachable through propagation.
        const CONTROLLABLE = 0x1;

        /// Emitting the event ends the owning task.
        const TERMINAL = 0x2;
    }
}

/// Ownership of an event generator.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum EventOwner {
    /// The event belongs to the plan itself.
    Free,

    /// The event is bound to a task under a name unique within that task.
    Bound {
        /// Owning task.
        task: TaskId,

        /// Name of the event within the task.
        name: String,
    },
}

impl EventOwner {
    /// Get the owning task for bound events.
    pub fn task(&self) -> Option<TaskId> {
        match self {
            EventOwner::Free => None,
            EventOwner::Bound { task, .. } => Some(*task),
        }
    }
}

/// How an event generator decides to emit.
///
/// New behaviours extend this union; there is no open-ended generator
/// hierarchy.
#[derive(Derivative, Clone)]
#[derivative(Debug)]
pub enum GeneratorKind {
    /// Emits when commanded or propagated to.
    Plain,

    /// Emits once every parent feeding it has emitted.
    And {
        /// Parents that emitted since the generator last fired.
        seen: SmallVec<[EventId; 4]>,
    },

    /// Emits on the first parent emission, then stays quiet.
    Or {
        /// Set once the generator fired.
        fired: bool,
    },

    /// Forwards parent emissions whose payload passes the predicate.
    Filter {
        /// Pure predicate over the emission payload.
        #[derivative(Debug = "ignore")]
        predicate: Rc<dyn Fn(Option<&Value>) -> bool>,
    },

    /// Forwards parent emissions until the limit event emits.
    Until {
        /// Event whose first emission shuts the gate.
        limit: EventId,

        /// Set once the limit emitted.
        expired: bool,
    },
}

/// Immutable record of one event emission.
#[derive(Clone, Debug, PartialEq)]
pub struct Emission {
    /// Time of the emission.
    pub time: f64,

    /// Optional payload handed to downstream generators.
    pub payload: Option<Value>,

    /// Events whose emissions propagated into this one. Empty for commanded
    /// emissions.
    pub sources: SmallVec<[EventId; 2]>,
}

impl Emission {
    /// Create a commanded emission record.
    pub fn commanded(time: f64, payload: Option<Value>) -> Self {
        Emission {
            time,
            payload,
            sources: SmallVec::new(),
        }
    }

    /// Create a propagated emission record.
    pub fn propagated(time: f64, payload: Option<Value>, source: EventId) -> Self {
        let mut sources = SmallVec::new();
        sources.push(source);
        Emission {
            time,
            payload,
            sources,
        }
    }
}

/// An event generator owned by a plan.
#[derive(Clone, Debug)]
pub struct Event {
    pub(crate) id: EventId,
    pub(crate) owner: EventOwner,
    pub(crate) flags: EventFlags,
    pub(crate) kind: GeneratorKind,
    pub(crate) history: Vec<Emission>,
    pub(crate) finalized_at: Option<f64>,
    pub(crate) unreachable: bool,
}

impl Event {
    /// Get the event id.
    pub fn id(&self) -> EventId {
        self.id
    }

    /// Get the event ownership.
    pub fn owner(&self) -> &EventOwner {
        &self.owner
    }

    /// Get the event flags.
    pub fn flags(&self) -> EventFlags {
        self.flags
    }

    /// Check if the event may be commanded.
    pub fn controllable(&self) -> bool {
        self.flags.contains(EventFlags::CONTROLLABLE)
    }

    /// Check if emitting the event ends the owning task.
    pub fn terminal(&self) -> bool {
        self.flags.contains(EventFlags::TERMINAL)
    }

    /// Get the generator behaviour.
    pub fn kind(&self) -> &GeneratorKind {
        &self.kind
    }

    /// Get the full emission history, oldest first.
    pub fn history(&self) -> &[Emission] {
        &self.history
    }

    /// Get the most recent emission.
    pub fn last(&self) -> Option<&Emission> {
        self.history.last()
    }

    /// Get the number of emissions so far.
    pub fn count(&self) -> usize {
        self.history.len()
    }

    /// Check if the event emitted at least once.
    pub fn emitted(&self) -> bool {
        !self.history.is_empty()
    }

    /// Get the finalization time, or `None` while the event is live.
    pub fn finalized_at(&self) -> Option<f64> {
        self.finalized_at
    }

    /// Check if the event has been finalized.
    pub fn is_finalized(&self) -> bool {
        self.finalized_at.is_some()
    }

    /// Check if the event can no longer emit.
    pub fn is_unreachable(&self) -> bool {
        self.unreachable
    }
}
