//! Resolution of the plan into a dense scheduled-as graph.
//!
//! Handles are mapped to dense indices so the group algorithms can work
//! on plain vectors, the way the rest of the kernel maps arena ids.

use std::collections::{BTreeMap, BTreeSet};

use fnv::FnvHashMap;

use plexec_plan::{EventId, Plan, TaskId, TaskState};
use plexec_temporal::TemporalEngine;

/// The pending tasks of a plan in a form faster to work with.
pub(crate) struct ResolvedTasks {
    /// Dense index to task id, ascending.
    pub tasks: Vec<TaskId>,

    /// Task id to dense index.
    pub index: FnvHashMap<TaskId, usize>,

    /// Scheduled-as graph: an edge `a -> b` means a's start defers to b.
    pub edges: Vec<BTreeSet<usize>>,

    /// Start-ordering obligations per task: `(after, prerequisite)` pairs,
    /// explicit and derived, including ones pointing outside the pending
    /// set.
    pub start_after: Vec<Vec<(TaskId, EventId)>>,
}

impl ResolvedTasks {
    pub(crate) fn len(&self) -> usize {
        self.tasks.len()
    }
}

pub(crate) fn resolve(plan: &Plan, temporal: &TemporalEngine) -> ResolvedTasks {
    let mut tasks = Vec::new();
    let mut index = FnvHashMap::default();
    let mut start_of = FnvHashMap::default();
    for task in plan.tasks() {
        if task.state() == TaskState::Pending && !task.is_finalized() {
            index.insert(task.id(), tasks.len());
            tasks.push(task.id());
            start_of.insert(task.start_event(), task.id());
        }
    }

    let mut edges: Vec<BTreeSet<usize>> = vec![BTreeSet::new(); tasks.len()];
    let mut start_after: Vec<Vec<(TaskId, EventId)>> = vec![Vec::new(); tasks.len()];
    let relations = plan.relations();

    for (dense, &task) in tasks.iter().enumerate() {
        let start = match plan.task(task) {
            Ok(record) => record.start_event(),
            Err(_) => continue,
        };

        // schedule_as: start events coupled through scheduling constraints.
        for (target, _) in relations.scheduling().out_edges(start) {
            if let Some(&other) = start_of.get(&target) {
                edges[dense].insert(index[&other]);
            }
        }

        // depends_on: the parent is scheduled with its children.
        for (target, _) in relations.dependency().out_edges(task) {
            if let Some(&other_dense) = index.get(&target) {
                edges[dense].insert(other_dense);
            }
        }

        // Explicit start-ordering edges.
        for (after, &prerequisite) in relations.should_start_after().out_edges(task) {
            if let Some(&after_dense) = index.get(&after) {
                edges[dense].insert(after_dense);
            }
            start_after[dense].push((after, prerequisite));
        }

        // Ordering derived from temporal constraints between start events.
        for (target, _) in relations.temporal().out_edges(start) {
            if !temporal.should_emit_after(plan, start, target) {
                continue;
            }
            let owner = match plan.event(target) {
                Ok(record) => record.owner().task(),
                Err(_) => None,
            };
            let after = match owner {
                Some(after) => after,
                None => continue,
            };
            let is_start = plan
                .task(after)
                .map(|record| record.start_event() == target)
                .unwrap_or(false);
            if !is_start || after == task {
                continue;
            }
            if let Some(&after_dense) = index.get(&after) {
                edges[dense].insert(after_dense);
            }
            start_after[dense].push((after, target));
        }
    }

    ResolvedTasks {
        tasks,
        index,
        edges,
        start_after,
    }
}

/// Condense the scheduled-as graph into strongly connected components.
///
/// Returns the component of every vertex and the component member lists,
/// emitted successors-first so a single pass can propagate group state.
pub(crate) fn condense(edges: &[BTreeSet<usize>]) -> (Vec<usize>, Vec<Vec<usize>>) {
    let vertex_count = edges.len();
    let adjacency: Vec<Vec<usize>> = edges
        .iter()
        .map(|targets| targets.iter().copied().collect())
        .collect();

    const UNVISITED: usize = usize::MAX;
    let mut order = vec![UNVISITED; vertex_count];
    let mut low = vec![0; vertex_count];
    let mut on_stack = vec![false; vertex_count];
    let mut stack: Vec<usize> = Vec::new();
    let mut component = vec![UNVISITED; vertex_count];
    let mut components: Vec<Vec<usize>> = Vec::new();
    let mut next_order = 0;
    let mut frames: Vec<(usize, usize)> = Vec::new();

    for root in 0..vertex_count {
        if order[root] != UNVISITED {
            continue;
        }
        frames.push((root, 0));
        while let Some(&(vertex, position)) = frames.last() {
            if position == 0 {
                order[vertex] = next_order;
                low[vertex] = next_order;
                next_order += 1;
                stack.push(vertex);
                on_stack[vertex] = true;
            }
            if position < adjacency[vertex].len() {
                frames
                    .last_mut()
                    .expect("frame vanished mid-iteration")
                    .1 += 1;
                let target = adjacency[vertex][position];
                if order[target] == UNVISITED {
                    frames.push((target, 0));
                } else if on_stack[target] {
                    low[vertex] = low[vertex].min(order[target]);
                }
            } else {
                frames.pop();
                if let Some(&(parent, _)) = frames.last() {
                    low[parent] = low[parent].min(low[vertex]);
                }
                if low[vertex] == order[vertex] {
                    let mut members = Vec::new();
                    loop {
                        let member = stack.pop().expect("Tarjan stack drained early");
                        on_stack[member] = false;
                        component[member] = components.len();
                        members.push(member);
                        if member == vertex {
                            break;
                        }
                    }
                    members.sort_unstable();
                    components.push(members);
                }
            }
        }
    }

    (component, components)
}

/// Edges of the condensed graph, with the task pairs that produced them.
pub(crate) fn group_edges(
    resolved: &ResolvedTasks,
    component: &[usize],
) -> BTreeMap<(usize, usize), Vec<(TaskId, TaskId)>> {
    let mut crossing: BTreeMap<(usize, usize), Vec<(TaskId, TaskId)>> = BTreeMap::new();
    for (dense, targets) in resolved.edges.iter().enumerate() {
        for &target in targets {
            let (from, to) = (component[dense], component[target]);
            if from == to {
                continue;
            }
            crossing
                .entry((from, to))
                .or_insert_with(Vec::new)
                .push((resolved.tasks[dense], resolved.tasks[target]));
        }
    }
    crossing
}

#[cfg(test)]
mod tests {
    use super::*;

    fn graph(edges: &[(usize, usize)], vertex_count: usize) -> Vec<BTreeSet<usize>> {
        let mut adjacency = vec![BTreeSet::new(); vertex_count];
        for &(from, to) in edges {
            adjacency[from].insert(to);
        }
        adjacency
    }

    #[test]
    fn condense_splits_a_dag_into_singletons() {
        let (component, components) = condense(&graph(&[(0, 1), (1, 2)], 3));
        assert_eq!(components.len(), 3);
        // Successors first.
        assert_eq!(components[0], vec![2]);
        assert_eq!(components[1], vec![1]);
        assert_eq!(components[2], vec![0]);
        assert_eq!(component, vec![2, 1, 0]);
    }

    #[test]
    fn condense_collapses_cycles() {
        let (component, components) = condense(&graph(&[(0, 1), (1, 0), (0, 2)], 3));
        assert_eq!(components.len(), 2);
        assert_eq!(components[0], vec![2]);
        assert_eq!(components[1], vec![0, 1]);
        assert_eq!(component[0], component[1]);
        assert_ne!(component[0], component[2]);
    }

    #[test]
    fn condense_emits_successors_before_predecessors() {
        // Diamond: 0 -> {1, 2} -> 3.
        let (component, components) = condense(&graph(&[(0, 1), (0, 2), (1, 3), (2, 3)], 4));
        assert_eq!(components.len(), 4);
        let position = |vertex: usize| {
            components
                .iter()
                .position(|members| members.contains(&vertex))
                .unwrap()
        };
        assert!(position(3) < position(1));
        assert!(position(3) < position(2));
        assert!(position(1) < position(0));
        assert!(position(2) < position(0));
        assert_eq!(component.len(), 4);
    }
}
