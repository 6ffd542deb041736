//! Supervised child processes: records, state machines, health probes, and
//! periodic tasks.
//!
//! A [`record::ChildRecord`] captures one supervised process (or one
//! in-flight health check). Records move between states only through timer
//! events dispatched to the goal handler that currently owns them
//! ([`record::Goal`]); child exits arrive separately through the signal
//! bridge and the reap path in [`fsm`].

pub mod fsm;
pub mod health;
pub mod periodic;
pub mod record;
pub mod registry;
pub mod spawn;

pub use record::{ChildId, ChildKind, ChildRecord, ChildState, Goal, HealthCounters};
pub use registry::Children;
