//! One-shot timer scheduling on a min-heap.
//!
//! Everything time-driven in the supervisor — state-machine transitions,
//! health probes, periodic tasks — goes through one [`TimerHeap`]. Timers
//! are one-shot; rescheduling is a fresh insert from whoever handled the
//! expiry.

mod heap;

pub use heap::{TimerHeap, TimerId};
