//! Boundary services: the status and discovery surfaces.
//!
//! Everything here plugs into the same two primitives as the core — timers
//! and readable descriptors — and renders supervisor state outward: a
//! forking HTTP status server, a UDP multicast announce/query pair, and a
//! FIFO word counter.

pub mod counter;
pub mod http;
pub mod udp;
