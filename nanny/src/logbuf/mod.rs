//! Streaming log capture: in-memory rings with on-disk rotation.
//!
//! Every supervised child owns three of these buffers (stdout, stderr,
//! events). A buffer is a fixed circular byte window — newest bytes
//! overwrite oldest — optionally teeing every write into a rotating,
//! timestamp-named file behind a stable symlink. Pipe drains connect a
//! child's output descriptors to a buffer through the reactor.

mod drain;
mod ring;
mod rotate;

pub use drain::{DrainOutcome, LogDrain};
pub use ring::{LogBuffer, LogStats, SharedLog};
pub use rotate::RotatingFile;
