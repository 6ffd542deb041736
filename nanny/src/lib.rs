//! # nanny - single-host process supervision
//!
//! A process nanny: it keeps long-running worker processes alive across
//! crashes with exponential backoff, probes their health on a fixed cadence,
//! runs scheduled auxiliary tasks, captures their output into rotating
//! ring-buffer logs, and exposes what it knows over HTTP, UDP multicast, and
//! a FIFO counter socket.
//!
//! # Quick Start
//!
//! ```rust,no_run
//! use nanny::config::NannyConfig;
//! use nanny::supervisor::Supervisor;
//!
//! fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let mut sup = Supervisor::new(NannyConfig::default())?;
//!
//!     let child = sup.child_new("bin/server --no-background");
//!     sup.set_restartable(child, true)?;
//!     sup.set_health(child, "bin/health-probe")?;
//!     sup.add_periodic(child, "8h bin/reset $PID")?;
//!
//!     sup.init_network()?;
//!     sup.run()?;       // until a termination signal
//!     sup.shutdown()?;  // until every child is stopped
//!     Ok(())
//! }
//! ```
//!
//! # Design
//!
//! The engine is a single-threaded cooperative scheduler with exactly one
//! suspension point. Two primitives carry everything:
//!
//! - [`timer`] - a min-heap of one-shot timers driving all time-based work:
//!   state machine transitions, health probes, periodic tasks.
//! - [`reactor`] - a readiness table over readable descriptors driving all
//!   input: accept sockets, log pipes, datagrams, FIFO bytes.
//!
//! Each loop pass reaps exited children (flagged by the [`signals`] bridge),
//! fires due timers, then waits at most one second for any descriptor to
//! become readable. Callbacks run to completion; nothing ever blocks the
//! loop or re-enters it.
//!
//! Children are plain records ([`child::record::ChildRecord`]) owned by one
//! goal state machine at a time; supervision replaces the machine rather
//! than growing one machine with every concern. Output streams are
//! reference-counted ring buffers ([`logbuf`]) shared between pipe drains
//! and status renderers.

pub mod child;
pub mod config;
pub mod daemon;
pub mod env;
pub mod error;
pub mod logbuf;
pub mod net;
pub mod reactor;
pub mod signals;
pub mod supervisor;
pub mod timer;
pub mod util;
pub mod variables;

// Re-export commonly used types
pub use child::{ChildId, ChildKind, ChildRecord, ChildState, Goal};
pub use config::NannyConfig;
pub use error::{NannyError, NannyResult};
pub use logbuf::{LogBuffer, SharedLog};
pub use supervisor::{Globals, Supervisor};
pub use timer::{TimerHeap, TimerId};
