//! The per-tick scheduling decision.

use smallvec::SmallVec;

use plexec_plan::{Plan, TaskId, TaskState};
use plexec_temporal::{TemporalEngine, TemporalError};

use crate::{
    group::{GroupState, Resolution, SchedulingGroup, StartabilityIssue},
    resolve::{condense, group_edges, resolve},
};

/// Compute the set of tasks that may be started at `now`.
///
/// The resolver is stateless: the scheduled-as graph is rebuilt from the
/// plan on every call so edits are observed immediately. The returned
/// start order is deterministic for identical plan state and `now`.
pub fn compute(plan: &Plan, temporal: &TemporalEngine, now: f64) -> Resolution {
    #[cfg(feature = "profiler")]
    thread_profiler::profile_scope!("compute_tasks_to_schedule");

    let resolved = resolve(plan, temporal);
    let (component, members) = condense(&resolved.edges);
    let crossing = group_edges(&resolved, &component);

    let mut groups: Vec<SchedulingGroup> = members
        .iter()
        .map(|dense_members| {
            let tasks: SmallVec<[TaskId; 2]> = dense_members
                .iter()
                .map(|&dense| resolved.tasks[dense])
                .collect();
            SchedulingGroup::new(tasks)
        })
        .collect();

    // Individual startability of every member.
    for (group, dense_members) in members.iter().enumerate() {
        for &dense in dense_members {
            let task = resolved.tasks[dense];
            if let Some(issue) = startability_issue(plan, temporal, task, now) {
                log::debug!("task {:?} not startable: {:?}", task, issue);
                groups[group].hold_member(task, issue);
            }
        }
    }

    // Start-ordering prerequisites that reach outside the group.
    for (group, dense_members) in members.iter().enumerate() {
        for &dense in dense_members {
            for &(after, prerequisite) in &resolved.start_after[dense] {
                let after_group = resolved.index.get(&after).map(|&d| component[d]);
                if after_group == Some(group) {
                    // Coupled starts; the ordering is satisfied by starting
                    // together.
                    continue;
                }
                let record = match plan.event(prerequisite) {
                    Ok(record) => record,
                    Err(_) => continue,
                };
                if record.emitted() {
                    continue;
                }
                if record.is_unreachable() {
                    log::warn!(
                        "task {:?} waits for unreachable event {:?}",
                        resolved.tasks[dense],
                        prerequisite
                    );
                }
                groups[group].hold_temporal(after_group, prerequisite);
            }
        }
    }

    // Propagate along the condensed edges. Components are emitted
    // successors first, so every successor state is final by the time a
    // group looks at it.
    for group in 0..groups.len() {
        let mut holds: Vec<(usize, GroupState, Vec<_>)> = Vec::new();
        for (&(from, to), edges) in crossing.range((group, 0)..(group + 1, 0)) {
            debug_assert_eq!(from, group);
            let effective = edges
                .iter()
                .any(|&(source, target)| !planner_exception(plan, source, target));
            if !effective {
                continue;
            }
            match groups[to].state {
                GroupState::Schedulable => {}
                GroupState::PendingTemporal => {
                    holds.push((
                        to,
                        GroupState::PendingTemporal,
                        groups[to].unmet_prerequisites.clone(),
                    ));
                }
                GroupState::NonSchedulable => {
                    holds.push((to, GroupState::NonSchedulable, Vec::new()));
                }
            }
        }
        for (by, state, prerequisites) in holds {
            match state {
                GroupState::NonSchedulable => groups[group].hold_non_schedulable(by),
                GroupState::PendingTemporal => {
                    for prerequisite in prerequisites {
                        groups[group].hold_temporal(Some(by), prerequisite);
                    }
                }
                GroupState::Schedulable => {}
            }
        }
    }

    // Deterministic start order: earliest member addition first, ties by
    // task id; members within a group are already in id order.
    let mut schedulable: Vec<usize> = groups
        .iter()
        .enumerate()
        .filter(|(_, group)| group.is_schedulable())
        .map(|(index, _)| index)
        .collect();
    schedulable.sort_by(|&left, &right| {
        let left_key = group_key(plan, &groups[left]);
        let right_key = group_key(plan, &groups[right]);
        left_key
            .0
            .total_cmp(&right_key.0)
            .then(left_key.1.cmp(&right_key.1))
    });

    let startable: Vec<TaskId> = schedulable
        .iter()
        .flat_map(|&index| groups[index].tasks.iter().copied())
        .collect();

    log::trace!(
        "schedule at {}: {} startable, {} groups held",
        now,
        startable.len(),
        groups.len() - schedulable.len()
    );

    Resolution { startable, groups }
}

fn group_key(plan: &Plan, group: &SchedulingGroup) -> (f64, TaskId) {
    let earliest = group
        .tasks
        .iter()
        .filter_map(|&task| plan.task(task).ok())
        .map(|record| record.addition_time())
        .fold(f64::INFINITY, f64::min);
    let first = group.tasks[0];
    (earliest, first)
}

/// The planner exception: a scheduled-as edge towards a planned task does
/// not hold back its planner while the planned task is not yet executable.
fn planner_exception(plan: &Plan, source: TaskId, target: TaskId) -> bool {
    if !plan.relations().planned_by().contains(target, source) {
        return false;
    }
    plan.task(target)
        .map(|record| !record.executable())
        .unwrap_or(false)
}

fn startability_issue(
    plan: &Plan,
    temporal: &TemporalEngine,
    task: TaskId,
    now: f64,
) -> Option<StartabilityIssue> {
    let record = plan
        .task(task)
        .expect("resolved a task that is not in the plan");
    debug_assert_eq!(record.state(), TaskState::Pending);

    if !record.executable() {
        return Some(StartabilityIssue::NotExecutable);
    }

    // A planning task may run while its planned target cannot.
    let planned_by = plan.relations().planned_by();
    let planning_arm = planned_by.in_edges(task).any(|planned| {
        plan.task(planned)
            .map(|record| !record.executable())
            .unwrap_or(false)
    });
    if !planning_arm {
        for (planner, _) in planned_by.out_edges(task) {
            let succeeded = plan
                .task(planner)
                .map(|record| record.state() == TaskState::Succeeded)
                .unwrap_or(false);
            if !succeeded {
                return Some(StartabilityIssue::PlannerNotSucceeded { planner });
            }
        }
    }

    let start = record.start_event();
    if let Some((source, _)) = temporal.find_failed_temporal_constraint(plan, start, now) {
        return Some(StartabilityIssue::TemporalWindow { source });
    }
    if let Err(TemporalError::OccurrenceConstraintViolation { source, .. }) =
        temporal.check_occurrence(plan, start)
    {
        return Some(StartabilityIssue::OccurrenceBound { source });
    }

    None
}

#[cfg(test)]
mod tests {
    use super::*;
    use plexec_plan::{Emission, EventLink, PlanId, TaskLink, TaskSpec};

    fn plan() -> Plan {
        Plan::new(PlanId(0))
    }

    fn spec(executable: bool) -> TaskSpec {
        TaskSpec {
            executable,
            ..TaskSpec::default()
        }
    }

    fn emit_start(plan: &mut Plan, task: TaskId, time: f64) {
        let start = plan.task(task).unwrap().start_event();
        plan.append_emission(start, Emission::commanded(time, None))
            .unwrap();
    }

    #[test]
    fn independent_pending_tasks_all_start() {
        let temporal = TemporalEngine::new();
        let mut plan = plan();
        let a = plan.add_task(0.0, spec(true));
        let b = plan.add_task(1.0, spec(true));

        let resolution = compute(&plan, &temporal, 2.0);
        assert_eq!(resolution.startable, vec![a, b]);
    }

    #[test]
    fn start_order_follows_addition_time_then_id() {
        let temporal = TemporalEngine::new();
        let mut plan = plan();
        let late = plan.add_task(5.0, spec(true));
        let early = plan.add_task(1.0, spec(true));

        let resolution = compute(&plan, &temporal, 6.0);
        assert_eq!(resolution.startable, vec![early, late]);
    }

    #[test]
    fn parent_waits_for_its_child() {
        let temporal = TemporalEngine::new();
        let mut plan = plan();
        let parent = plan.add_task(0.0, spec(true));
        let child = plan.add_task(0.0, spec(true));
        plan.link_tasks(TaskLink::Dependency, parent, child).unwrap();
        let child_start = plan.task(child).unwrap().start_event();
        plan.add_should_start_after(parent, child, child_start)
            .unwrap();

        let resolution = compute(&plan, &temporal, 0.0);
        assert_eq!(resolution.startable, vec![child]);
        let held: Vec<_> = resolution.refused().collect();
        assert_eq!(held.len(), 1);
        assert_eq!(held[0].state, GroupState::PendingTemporal);
        assert_eq!(held[0].unmet_prerequisites, vec![child_start]);

        emit_start(&mut plan, child, 1.0);
        let resolution = compute(&plan, &temporal, 1.0);
        assert_eq!(resolution.startable, vec![parent]);
    }

    #[test]
    fn coupled_tasks_start_together_or_not_at_all() {
        let temporal = TemporalEngine::new();
        let mut plan = plan();
        let a = plan.add_task(0.0, spec(true));
        let b = plan.add_task(0.0, spec(false));
        let a_start = plan.task(a).unwrap().start_event();
        let b_start = plan.task(b).unwrap().start_event();
        plan.link_events(EventLink::SchedulingConstraint, a_start, b_start)
            .unwrap();
        plan.link_events(EventLink::SchedulingConstraint, b_start, a_start)
            .unwrap();

        let resolution = compute(&plan, &temporal, 0.0);
        assert_eq!(resolution.startable, Vec::<TaskId>::new());
        let held: Vec<_> = resolution.refused().collect();
        assert_eq!(held.len(), 1);
        assert_eq!(held[0].state, GroupState::NonSchedulable);
        assert_eq!(
            held[0].not_startable,
            vec![(b, StartabilityIssue::NotExecutable)]
        );

        plan.set_task_executable(b, true).unwrap();
        let resolution = compute(&plan, &temporal, 0.0);
        assert_eq!(resolution.startable, vec![a, b]);
    }

    #[test]
    fn planner_runs_before_the_planned_task() {
        let temporal = TemporalEngine::new();
        let mut plan = plan();
        let planned = plan.add_task(0.0, spec(false));
        let planner = plan.add_task(0.0, spec(true));
        plan.link_tasks(TaskLink::PlannedBy, planned, planner)
            .unwrap();
        let planner_start = plan.task(planner).unwrap().start_event();
        let planned_start = plan.task(planned).unwrap().start_event();
        plan.link_events(EventLink::SchedulingConstraint, planner_start, planned_start)
            .unwrap();

        let resolution = compute(&plan, &temporal, 0.0);
        assert_eq!(resolution.startable, vec![planner]);

        // Planning finished: the planner succeeded and the planned task
        // became executable.
        emit_start(&mut plan, planner, 1.0);
        let (success, stop) = {
            let record = plan.task(planner).unwrap();
            (record.success_event(), record.stop_event())
        };
        plan.append_emission(success, Emission::commanded(2.0, None))
            .unwrap();
        plan.append_emission(stop, Emission::propagated(2.0, None, success))
            .unwrap();
        plan.set_task_executable(planned, true).unwrap();

        let resolution = compute(&plan, &temporal, 3.0);
        assert_eq!(resolution.startable, vec![planned]);
    }

    #[test]
    fn finalized_tasks_are_never_scheduled() {
        let temporal = TemporalEngine::new();
        let mut plan = plan();
        let task = plan.add_task(0.0, spec(true));
        plan.finalize_task(task, 1.0).unwrap();

        let resolution = compute(&plan, &temporal, 2.0);
        assert_eq!(resolution.startable, Vec::<TaskId>::new());
        assert!(resolution.groups.is_empty());
    }

    #[test]
    fn the_decision_is_deterministic() {
        let temporal = TemporalEngine::new();
        let mut plan = plan();
        for i in 0..16 {
            let _ = plan.add_task((i % 4) as f64, spec(true));
        }
        let first = compute(&plan, &temporal, 10.0);
        let second = compute(&plan, &temporal, 10.0);
        assert_eq!(first.startable, second.startable);
    }
}
