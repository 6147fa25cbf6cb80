//! Temporal-constraint engine.
//!
//! Decides whether an event may emit at a given time, given the temporal
//! and occurrence constraint edges stored in the plan, and monitors the
//! deadlines those edges imply.

#![deny(unused_must_use)]

#[macro_use]
extern crate failure;

use fnv::FnvHashMap;
use smallvec::SmallVec;

use plexec_interval::IntervalSet;
use plexec_plan::{EventId, Plan};

/// Temporal error. The first two fail the emission that triggered them;
/// missed deadlines surface in the tick report.
#[derive(Clone, Copy, Debug, PartialEq, Fail)]
pub enum TemporalError {
    /// No recorded source emission satisfies the constraint at this time.
    #[fail(display = "Temporal constraint {:?} -> {:?} forbids emission", source, target)]
    TemporalConstraintViolation {
        /// Constraint source.
        source: EventId,

        /// Event whose emission was forbidden.
        target: EventId,
    },

    /// The source emission count is outside the declared bounds.
    #[fail(display = "Occurrence constraint {:?} -> {:?} violated", source, target)]
    OccurrenceConstraintViolation {
        /// Constrained source.
        source: EventId,

        /// Event whose emission was forbidden.
        target: EventId,
    },

    /// A forward constraint's window closed before the target emitted.
    #[fail(
        display = "Deadline {} for {:?} -> {:?} missed",
        deadline, source, target
    )]
    MissedDeadline {
        /// Event whose emission opened the window.
        source: EventId,

        /// Event that failed to emit in time.
        target: EventId,

        /// Absolute time at which the window closed.
        deadline: f64,
    },
}

/// One pending deadline: `target` must emit before `at`.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct Deadline {
    /// Absolute expiry time.
    pub at: f64,

    /// Event whose emission opened the window.
    pub source: EventId,

    /// Event expected to emit.
    pub target: EventId,
}

/// The deadline registry. Constraint evaluation itself is stateless over
/// the plan; only pending deadlines carry over between ticks.
#[derive(Debug, Default)]
pub struct TemporalEngine {
    deadlines: FnvHashMap<EventId, SmallVec<[Deadline; 2]>>,
}

impl TemporalEngine {
    /// Create new engine with no pending deadline.
    pub fn new() -> Self {
        TemporalEngine {
            deadlines: FnvHashMap::default(),
        }
    }

    /// Get the number of pending deadlines.
    pub fn pending_deadlines(&self) -> usize {
        self.deadlines.values().map(|pending| pending.len()).sum()
    }

    /// Check whether `event` may emit at `now`.
    ///
    /// For every constraint edge `u -> event` over a set `S`, either `u`
    /// never emitted or one of its recorded emission times `tu` must
    /// satisfy `(now - tu) ∈ S`. An empty set means no constraint.
    pub fn emittable_at(&self, plan: &Plan, event: EventId, now: f64) -> Result<(), TemporalError> {
        match self.find_failed_temporal_constraint(plan, event, now) {
            None => Ok(()),
            Some((source, _)) => Err(TemporalError::TemporalConstraintViolation {
                source,
                target: event,
            }),
        }
    }

    /// Find the first constraint edge forbidding emission of `event` at
    /// `now`, in deterministic source order.
    pub fn find_failed_temporal_constraint(
        &self,
        plan: &Plan,
        event: EventId,
        now: f64,
    ) -> Option<(EventId, IntervalSet)> {
        let temporal = plan.relations().temporal();
        for source in temporal.in_edges(event) {
            let set = temporal
                .edge_data(source, event)
                .expect("reverse table lost an edge known to the forward table");
            if set.is_empty() {
                continue;
            }
            let history = match plan.event(source) {
                Ok(record) => record.history(),
                Err(_) => continue,
            };
            if history.is_empty() {
                continue;
            }
            let satisfied = history
                .iter()
                .any(|emission| set.include(now - emission.time));
            if !satisfied {
                return Some((source, set.clone()));
            }
        }
        None
    }

    /// Check the occurrence constraints targeting `event`.
    ///
    /// The count of source emissions since the edge's epoch must lie in
    /// `[min, max]`; excess emissions poison the target.
    pub fn check_occurrence(&self, plan: &Plan, event: EventId) -> Result<(), TemporalError> {
        let occurrence = plan.relations().occurrence();
        for source in occurrence.in_edges(event) {
            let data = occurrence
                .edge_data(source, event)
                .expect("reverse table lost an edge known to the forward table");
            let emitted = match plan.event(source) {
                Ok(record) => record.count(),
                Err(_) => continue,
            };
            let since_epoch = emitted.saturating_sub(data.epoch_count());
            if since_epoch < data.min as usize || since_epoch > data.max as usize {
                return Err(TemporalError::OccurrenceConstraintViolation {
                    source,
                    target: event,
                });
            }
        }
        Ok(())
    }

    /// Advance the epochs of recurrent occurrence edges targeting `event`.
    /// Called once `event` actually emitted.
    pub fn commit_occurrence(&self, plan: &mut Plan, event: EventId) {
        let sources: Vec<EventId> = plan.relations().occurrence().in_edges(event).collect();
        for source in sources {
            let emitted = match plan.event(source) {
                Ok(record) => record.count(),
                Err(_) => continue,
            };
            if let Some(data) = plan.occurrence_data_mut(source, event) {
                if data.recurrent {
                    data.advance_epoch(emitted);
                }
            }
        }
    }

    /// Record an emission of `event` at `now` for deadline monitoring.
    ///
    /// Every forward constraint `event -> v` whose window can still be
    /// satisfied installs one deadline at `now` plus the upper bound of
    /// the first interval still open; every deadline expecting `event`
    /// itself is discharged.
    pub fn note_emission(&mut self, plan: &Plan, event: EventId, now: f64) {
        if self.deadlines.remove(&event).is_some() {
            log::trace!("deadlines for {:?} discharged", event);
        }
        let temporal = plan.relations().temporal();
        for (target, set) in temporal.out_edges(event) {
            let upper = set
                .iter()
                .map(|interval| interval.upper)
                .find(|&upper| upper >= 0.0);
            if let Some(upper) = upper {
                self.deadlines
                    .entry(target)
                    .or_insert_with(SmallVec::new)
                    .push(Deadline {
                        at: now + upper,
                        source: event,
                        target,
                    });
            }
        }
    }

    /// Drop every pending deadline expecting `event`. Used when the event
    /// becomes unreachable: such deadlines are consumed silently.
    pub fn forget_target(&mut self, event: EventId) {
        self.deadlines.remove(&event);
    }

    /// Remove and return every deadline that expired strictly before
    /// `now`, sorted by expiry then edge. Deadlines whose target can no
    /// longer emit are consumed without being reported.
    pub fn check_deadlines(&mut self, plan: &Plan, now: f64) -> Vec<Deadline> {
        let mut expired = Vec::new();
        let mut drained = Vec::new();
        for (&target, pending) in self.deadlines.iter_mut() {
            let unreachable = plan
                .event(target)
                .map(|record| record.is_unreachable())
                .unwrap_or(true);
            pending.retain(|deadline| {
                if deadline.at >= now {
                    return true;
                }
                if !unreachable {
                    expired.push(*deadline);
                }
                false
            });
            if pending.is_empty() {
                drained.push(target);
            }
        }
        for target in drained {
            self.deadlines.remove(&target);
        }
        expired.sort_by(|a, b| {
            a.at.total_cmp(&b.at)
                .then(a.source.cmp(&b.source))
                .then(a.target.cmp(&b.target))
        });
        expired
    }

    /// Check if `event` is temporally downstream of `other`: a constraint
    /// edge `event -> other` exists that only allows `other` to emit at or
    /// before `event` (every interval upper bound non-positive).
    pub fn should_emit_after(&self, plan: &Plan, event: EventId, other: EventId) -> bool {
        match plan.relations().temporal().edge_data(event, other) {
            Some(set) if !set.is_empty() => set.iter().all(|interval| interval.upper <= 0.0),
            _ => false,
        }
    }
}
