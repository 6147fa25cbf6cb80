//! Scheduling-group resolver and global scheduler.
//!
//! Given the plan state and the current time, `compute` decides which
//! pending tasks may be started this tick. Tasks coupled through
//! scheduling constraints are condensed into groups that start together
//! or not at all; blocked groups are reported with their reasons instead
//! of being silently dropped.

#![deny(unused_must_use)]

mod compute;
mod group;
mod resolve;

pub use crate::{
    compute::compute,
    group::{GroupState, Resolution, SchedulingGroup, StartabilityIssue},
};
