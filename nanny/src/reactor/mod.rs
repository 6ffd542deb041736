//! Readable-fd readiness dispatch.
//!
//! The [`Reactor`] is the other half of the scheduler: where the timer heap
//! drives everything time-based, the reactor drives everything input-based —
//! accept sockets, log pipes, UDP datagrams, FIFO bytes, and the signal
//! wake-up pipe.

mod poll_loop;

pub use poll_loop::Reactor;
