//! Relation tables of a plan.
//!
//! One `RelationSet` per relation kind, all keyed by handles. Event-space
//! and task-space kinds are kept apart; enumeration across kinds follows
//! the declaration order of `RelationKind`, which is part of the
//! deterministic-order contract.

use plexec_interval::IntervalSet;
use plexec_relations::{RelationFlags, RelationSet};

use crate::{EventId, TaskId};

/// Every relation kind the kernel knows about.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[cfg_attr(feature = "serde-1", derive(serde::Serialize, serde::Deserialize))]
pub enum RelationKind {
    /// Event → event. Emission of the source commands the target.
    Signal,

    /// Event → event. Emission of the source is replayed on the target.
    Forward,

    /// Event → event. Records that the source caused the target.
    CausalLink,

    /// Event → event. Declares emission ordering without propagation.
    Precedence,

    /// Event → event. Allowed time offsets between emissions.
    TemporalConstraint,

    /// Event → event. Bounds on source emissions per target emission.
    OccurrenceConstraint,

    /// Event → event. The source's start is coupled to the target's start.
    SchedulingConstraint,

    /// Task → task. The source depends on the target.
    Dependency,

    /// Task → task. The target plans the source.
    PlannedBy,

    /// Task → task. The source may start only after the carried event.
    ShouldStartAfter,
}

impl RelationKind {
    /// Get the structural properties of the kind.
    pub fn flags(&self) -> RelationFlags {
        match self {
            RelationKind::PlannedBy => RelationFlags::STRONG,
            _ => RelationFlags::empty(),
        }
    }
}

/// Event-space relation kinds carrying no per-edge data.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum EventLink {
    /// See [`RelationKind::Signal`].
    Signal,

    /// See [`RelationKind::Forward`].
    Forward,

    /// See [`RelationKind::CausalLink`].
    CausalLink,

    /// See [`RelationKind::Precedence`].
    Precedence,

    /// See [`RelationKind::SchedulingConstraint`].
    SchedulingConstraint,
}

impl EventLink {
    /// Get the corresponding relation kind.
    pub fn kind(&self) -> RelationKind {
        match self {
            EventLink::Signal => RelationKind::Signal,
            EventLink::Forward => RelationKind::Forward,
            EventLink::CausalLink => RelationKind::CausalLink,
            EventLink::Precedence => RelationKind::Precedence,
            EventLink::SchedulingConstraint => RelationKind::SchedulingConstraint,
        }
    }
}

/// Task-space relation kinds carrying no per-edge data.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum TaskLink {
    /// See [`RelationKind::Dependency`].
    Dependency,

    /// See [`RelationKind::PlannedBy`].
    PlannedBy,
}

impl TaskLink {
    /// Get the corresponding relation kind.
    pub fn kind(&self) -> RelationKind {
        match self {
            TaskLink::Dependency => RelationKind::Dependency,
            TaskLink::PlannedBy => RelationKind::PlannedBy,
        }
    }
}

/// Per-edge data of an occurrence constraint `source -> target`.
///
/// When the target fires, the number of source emissions since the epoch
/// must lie in `[min, max]`. Recurrent edges advance the epoch on every
/// target emission; otherwise the epoch is the beginning of time.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[cfg_attr(feature = "serde-1", derive(serde::Serialize, serde::Deserialize))]
pub struct OccurrenceData {
    /// Least number of source emissions required.
    pub min: u32,

    /// Greatest number of source emissions allowed. Excess emissions
    /// poison the target.
    pub max: u32,

    /// Whether the epoch advances on each target emission.
    pub recurrent: bool,

    /// Source emissions already consumed by past epochs.
    pub(crate) epoch_count: usize,
}

impl OccurrenceData {
    /// Create new data with the epoch at the beginning of time.
    pub fn new(min: u32, max: u32, recurrent: bool) -> Self {
        OccurrenceData {
            min,
            max,
            recurrent,
            epoch_count: 0,
        }
    }

    /// Get the number of source emissions consumed by past epochs.
    pub fn epoch_count(&self) -> usize {
        self.epoch_count
    }

    /// Move the epoch forward so that `consumed` source emissions are
    /// accounted for.
    pub fn advance_epoch(&mut self, consumed: usize) {
        self.epoch_count = consumed;
    }
}

/// All relation tables of one plan.
#[derive(Debug)]
pub struct PlanRelations {
    pub(crate) signal: RelationSet<EventId, ()>,
    pub(crate) forward: RelationSet<EventId, ()>,
    pub(crate) causal_link: RelationSet<EventId, ()>,
    pub(crate) precedence: RelationSet<EventId, ()>,
    pub(crate) temporal: RelationSet<EventId, IntervalSet>,
    pub(crate) occurrence: RelationSet<EventId, OccurrenceData>,
    pub(crate) scheduling: RelationSet<EventId, ()>,
    pub(crate) dependency: RelationSet<TaskId, ()>,
    pub(crate) planned_by: RelationSet<TaskId, ()>,
    pub(crate) should_start_after: RelationSet<TaskId, EventId>,
}

impl PlanRelations {
    pub(crate) fn new() -> Self {
        PlanRelations {
            signal: RelationSet::new(RelationKind::Signal.flags()),
            forward: RelationSet::new(RelationKind::Forward.flags()),
            causal_link: RelationSet::new(RelationKind::CausalLink.flags()),
            precedence: RelationSet::new(RelationKind::Precedence.flags()),
            temporal: RelationSet::new(RelationKind::TemporalConstraint.flags()),
            occurrence: RelationSet::new(RelationKind::OccurrenceConstraint.flags()),
            scheduling: RelationSet::new(RelationKind::SchedulingConstraint.flags()),
            dependency: RelationSet::new(RelationKind::Dependency.flags()),
            planned_by: RelationSet::new(RelationKind::PlannedBy.flags()),
            should_start_after: RelationSet::new(RelationKind::ShouldStartAfter.flags()),
        }
    }

    /// Get the signal table.
    pub fn signal(&self) -> &RelationSet<EventId, ()> {
        &self.signal
    }

    /// Get the forward table.
    pub fn forward(&self) -> &RelationSet<EventId, ()> {
        &self.forward
    }

    /// Get the causal-link table.
    pub fn causal_link(&self) -> &RelationSet<EventId, ()> {
        &self.causal_link
    }

    /// Get the precedence table.
    pub fn precedence(&self) -> &RelationSet<EventId, ()> {
        &self.precedence
    }

    /// Get the temporal-constraint table.
    pub fn temporal(&self) -> &RelationSet<EventId, IntervalSet> {
        &self.temporal
    }

    /// Get the occurrence-constraint table.
    pub fn occurrence(&self) -> &RelationSet<EventId, OccurrenceData> {
        &self.occurrence
    }

    /// Get the scheduling-constraint table.
    pub fn scheduling(&self) -> &RelationSet<EventId, ()> {
        &self.scheduling
    }

    /// Get the dependency table.
    pub fn dependency(&self) -> &RelationSet<TaskId, ()> {
        &self.dependency
    }

    /// Get the planned-by table.
    pub fn planned_by(&self) -> &RelationSet<TaskId, ()> {
        &self.planned_by
    }

    /// Get the should-start-after table.
    pub fn should_start_after(&self) -> &RelationSet<TaskId, EventId> {
        &self.should_start_after
    }

    pub(crate) fn event_set_mut(&mut self, link: EventLink) -> &mut RelationSet<EventId, ()> {
        match link {
            EventLink::Signal => &mut self.signal,
            EventLink::Forward => &mut self.forward,
            EventLink::CausalLink => &mut self.causal_link,
            EventLink::Precedence => &mut self.precedence,
            EventLink::SchedulingConstraint => &mut self.scheduling,
        }
    }

    pub(crate) fn task_set_mut(&mut self, link: TaskLink) -> &mut RelationSet<TaskId, ()> {
        match link {
            TaskLink::Dependency => &mut self.dependency,
            TaskLink::PlannedBy => &mut self.planned_by,
        }
    }

    /// Sever every edge incident to the event, across all event-space
    /// kinds, in kind declaration order.
    pub(crate) fn sever_event(&mut self, event: EventId) -> Vec<(RelationKind, EventId, EventId)> {
        let mut severed = Vec::new();
        let PlanRelations {
            signal,
            forward,
            causal_link,
            precedence,
            temporal,
            occurrence,
            scheduling,
            ..
        } = self;
        for (source, target) in signal.remove_vertex(event) {
            severed.push((RelationKind::Signal, source, target));
        }
        for (source, target) in forward.remove_vertex(event) {
            severed.push((RelationKind::Forward, source, target));
        }
        for (source, target) in causal_link.remove_vertex(event) {
            severed.push((RelationKind::CausalLink, source, target));
        }
        for (source, target) in precedence.remove_vertex(event) {
            severed.push((RelationKind::Precedence, source, target));
        }
        for (source, target) in temporal.remove_vertex(event) {
            severed.push((RelationKind::TemporalConstraint, source, target));
        }
        for (source, target) in occurrence.remove_vertex(event) {
            severed.push((RelationKind::OccurrenceConstraint, source, target));
        }
        for (source, target) in scheduling.remove_vertex(event) {
            severed.push((RelationKind::SchedulingConstraint, source, target));
        }
        severed
    }

    /// Sever every edge incident to the task, across all task-space kinds,
    /// in kind declaration order.
    pub(crate) fn sever_task(&mut self, task: TaskId) -> Vec<(RelationKind, TaskId, TaskId)> {
        let mut severed = Vec::new();
        for (source, target) in self.dependency.remove_vertex(task) {
            severed.push((RelationKind::Dependency, source, target));
        }
        for (source, target) in self.planned_by.remove_vertex(task) {
            severed.push((RelationKind::PlannedBy, source, target));
        }
        for (source, target) in self.should_start_after.remove_vertex(task) {
            severed.push((RelationKind::ShouldStartAfter, source, target));
        }
        severed
    }
}
