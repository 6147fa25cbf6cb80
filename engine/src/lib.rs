//! Executor facade for the plexec kernel.
//!
//! The `Engine` owns one plan, the temporal engine and the queues that
//! feed a tick. One tick is strictly ordered: fixed clock read, delivery
//! of queued emissions, deadline check, scheduling decision, start
//! commands, cycle-end hooks. Everything runs on the caller's thread;
//! task bodies are polled cooperatively and must not block.

#![deny(unused_must_use)]

#[macro_use]
extern crate failure;

mod body;
mod engine;
mod error;
mod record;

pub use crate::{
    body::{BodyContext, EmissionRequest, Emissions, TaskBody},
    engine::{Engine, EngineConfig},
    error::EngineError,
    record::{Record, TickReport},
};
