//! Plan store for the plexec kernel.
//!
//! A `Plan` owns every task and event of one engine in dense arenas and
//! stores their relations in side tables keyed by handle pairs. Handles are
//! compound ids carrying the owning plan id, so using an object with the
//! wrong plan is detected at the API boundary instead of corrupting state.

#![deny(unused_must_use)]

#[macro_use]
extern crate bitflags;

#[macro_use]
extern crate failure;

mod error;
mod event;
mod plan;
mod relations;
mod task;
mod value;

pub use crate::{
    error::PlanError,
    event::{Emission, Event, EventFlags, EventOwner, GeneratorKind},
    plan::{FinalizationHandler, Mutation, ObjectRef, Plan, PlanObserver, TaskSpec},
    relations::{EventLink, OccurrenceData, PlanRelations, RelationKind, TaskLink},
    task::{Task, TaskState},
    value::Value,
};

/// Unique plan id.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[cfg_attr(feature = "serde-1", derive(serde::Serialize, serde::Deserialize))]
pub struct PlanId(pub u32);

impl PlanId {
    /// Get the numeric index of the plan.
    pub fn index(&self) -> u32 {
        self.0
    }
}

/// Task handle.
///
/// Carries the owning plan id; the index is dense and never reused, so a
/// finalized task keeps a stable identity.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[cfg_attr(feature = "serde-1", derive(serde::Serialize, serde::Deserialize))]
pub struct TaskId {
    /// Owning plan.
    pub plan: PlanId,

    /// Index of the task within the plan arena.
    pub index: u32,
}

impl TaskId {
    /// Create new id from plan id and index.
    pub fn new(plan: PlanId, index: u32) -> Self {
        TaskId { plan, index }
    }

    /// Get the owning plan id.
    pub fn plan(&self) -> PlanId {
        self.plan
    }

    /// Get the index within the plan arena.
    pub fn index(&self) -> usize {
        self.index as usize
    }
}

/// Event handle.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[cfg_attr(feature = "serde-1", derive(serde::Serialize, serde::Deserialize))]
pub struct EventId {
    /// Owning plan.
    pub plan: PlanId,

    /// Index of the event within the plan arena.
    pub index: u32,
}

impl EventId {
    /// Create new id from plan id and index.
    pub fn new(plan: PlanId, index: u32) -> Self {
        EventId { plan, index }
    }

    /// Get the owning plan id.
    pub fn plan(&self) -> PlanId {
        self.plan
    }

    /// Get the index within the plan arena.
    pub fn index(&self) -> usize {
        self.index as usize
    }
}
