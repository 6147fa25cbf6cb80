//! Structural errors of the plan store.

use crate::relations::RelationKind;

/// Structural plan error. The failing call leaves the plan unchanged.
#[derive(Clone, Copy, Debug, PartialEq, Fail)]
pub enum PlanError {
    /// The objects of an edge belong to different plans.
    #[fail(display = "Edge endpoints belong to different plans")]
    CrossPlanEdge,

    /// The object was finalized and rejects mutation.
    #[fail(display = "Object is finalized")]
    FinalizedObject,

    /// The edge is already present in the relation.
    #[fail(display = "Duplicate {:?} edge", _0)]
    DuplicateEdge(RelationKind),

    /// The edge is not present in the relation.
    #[fail(display = "No such {:?} edge", _0)]
    NoSuchEdge(RelationKind),

    /// The handle does not name an object of this plan.
    #[fail(display = "Unknown plan object")]
    UnknownObject,

    /// A task already owns an event under this name.
    #[fail(display = "Duplicate event name within task")]
    DuplicateEventName,

    /// The event cannot be commanded.
    #[fail(display = "Event is not controllable")]
    NotControllable,

    /// The event can no longer emit.
    #[fail(display = "Event is unreachable")]
    UnreachableEvent,

    /// The operation applies to free events only.
    #[fail(display = "Event is owned by a task")]
    TaskOwnedEvent,
}
