//! Scheduling groups and the per-tick resolution they form.

use smallvec::SmallVec;

use plexec_plan::{EventId, TaskId};

/// Scheduling verdict for one group, most restrictive last.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord)]
pub enum GroupState {
    /// Every member may start this tick.
    Schedulable,

    /// A temporal prerequisite has not emitted yet.
    PendingTemporal,

    /// A member is not individually startable.
    NonSchedulable,
}

/// Why a task is not individually startable.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum StartabilityIssue {
    /// The task's `executable` flag is unset.
    NotExecutable,

    /// A planner attached through `planned_by` has not succeeded.
    PlannerNotSucceeded {
        /// The planner in question.
        planner: TaskId,
    },

    /// A temporal window on the start event is unsatisfied.
    TemporalWindow {
        /// Source of the failing constraint edge.
        source: EventId,
    },

    /// An occurrence bound on the start event is unmet.
    OccurrenceBound {
        /// Source of the failing constraint edge.
        source: EventId,
    },
}

/// A set of tasks that start together or not at all.
///
/// Groups hold indices into [`Resolution::groups`]; the `held_*` sets
/// name the groups whose state blocked this one.
#[derive(Clone, Debug)]
pub struct SchedulingGroup {
    /// Member tasks, in id order.
    pub tasks: SmallVec<[TaskId; 2]>,

    /// Final verdict for this tick.
    pub state: GroupState,

    /// Groups blocking this one through unmet temporal prerequisites.
    pub held_by_temporal: Vec<usize>,

    /// Groups blocking this one because a member is not startable.
    pub held_non_schedulable: Vec<usize>,

    /// Prerequisite events that have not emitted yet.
    pub unmet_prerequisites: Vec<EventId>,

    /// Members that are not individually startable, with the reason.
    pub not_startable: Vec<(TaskId, StartabilityIssue)>,
}

impl SchedulingGroup {
    pub(crate) fn new(tasks: SmallVec<[TaskId; 2]>) -> Self {
        SchedulingGroup {
            tasks,
            state: GroupState::Schedulable,
            held_by_temporal: Vec::new(),
            held_non_schedulable: Vec::new(),
            unmet_prerequisites: Vec::new(),
            not_startable: Vec::new(),
        }
    }

    /// Check if the group may start this tick.
    pub fn is_schedulable(&self) -> bool {
        self.state == GroupState::Schedulable
    }

    fn raise(&mut self, state: GroupState) {
        if state > self.state {
            self.state = state;
        }
    }

    pub(crate) fn hold_temporal(&mut self, by: Option<usize>, prerequisite: EventId) {
        if let Some(by) = by {
            if !self.held_by_temporal.contains(&by) {
                self.held_by_temporal.push(by);
            }
        }
        if !self.unmet_prerequisites.contains(&prerequisite) {
            self.unmet_prerequisites.push(prerequisite);
        }
        self.raise(GroupState::PendingTemporal);
    }

    pub(crate) fn hold_non_schedulable(&mut self, by: usize) {
        if !self.held_non_schedulable.contains(&by) {
            self.held_non_schedulable.push(by);
        }
        self.raise(GroupState::NonSchedulable);
    }

    pub(crate) fn hold_member(&mut self, task: TaskId, issue: StartabilityIssue) {
        self.not_startable.push((task, issue));
        self.raise(GroupState::NonSchedulable);
    }
}

/// Result of one scheduler run.
#[derive(Clone, Debug)]
pub struct Resolution {
    /// Tasks to start this tick, in the deterministic start order.
    pub startable: Vec<TaskId>,

    /// Every group built from the pending tasks, successors first.
    pub groups: Vec<SchedulingGroup>,
}

impl Resolution {
    /// Iterate over the groups the scheduler refused to start.
    pub fn refused(&self) -> impl Iterator<Item = &SchedulingGroup> {
        self.groups.iter().filter(|group| !group.is_schedulable())
    }
}
