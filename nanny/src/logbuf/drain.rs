//! Pipe-to-buffer drain adapter.

// Layer 1: Standard library imports
use std::os::fd::{AsRawFd, OwnedFd, RawFd};

// Layer 2: Third-party crate imports
use nix::errno::Errno;
use nix::fcntl::{fcntl, FcntlArg, OFlag};
use nix::unistd::read;
use tracing::warn;

// Layer 3: Internal module imports
use super::ring::SharedLog;
use crate::error::{NannyError, NannyResult};

/// What a drain pump pass observed.
#[derive(Debug, PartialEq, Eq)]
pub enum DrainOutcome {
    /// Bytes were ingested.
    Read(usize),
    /// The writer closed the pipe; drop the drain.
    Eof,
    /// Nothing usable this pass (`EINTR`/`EAGAIN`); keep the registration.
    Retry,
}

/// Connects one readable pipe end to a [`SharedLog`].
///
/// The drain owns the descriptor and one reference on the buffer; both are
/// released when the drain is dropped after EOF. Each pump reads at most the
/// ring's linear remaining region — wrap-around is picked up on the next
/// readiness event.
#[derive(Debug)]
pub struct LogDrain {
    fd: OwnedFd,
    log: SharedLog,
}

impl LogDrain {
    /// Takes ownership of `fd`, switches it non-blocking, and prepares it to
    /// feed `log`. Register [`Self::raw_fd`] with the reactor afterwards.
    pub fn new(fd: OwnedFd, log: SharedLog) -> NannyResult<Self> {
        let flags = fcntl(&fd, FcntlArg::F_GETFL).map_err(|e| NannyError::io("fcntl", e))?;
        let flags = OFlag::from_bits_retain(flags) | OFlag::O_NONBLOCK;
        fcntl(&fd, FcntlArg::F_SETFL(flags)).map_err(|e| NannyError::io("fcntl", e))?;
        Ok(Self { fd, log })
    }

    /// The registered descriptor.
    pub fn raw_fd(&self) -> RawFd {
        self.fd.as_raw_fd()
    }

    /// Reads once from the pipe into the buffer.
    pub fn pump(&self, now: i64) -> DrainOutcome {
        let mut log = self.log.borrow_mut();
        let region = log.fill_region();
        match read(&self.fd, region) {
            Ok(0) => DrainOutcome::Eof,
            Ok(n) => {
                log.commit_fill(n, now);
                DrainOutcome::Read(n)
            }
            Err(Errno::EINTR) | Err(Errno::EAGAIN) => {
                log.record_error();
                DrainOutcome::Retry
            }
            Err(errno) => {
                log.record_error();
                warn!(fd = self.fd.as_raw_fd(), error = %errno, "pipe read failed");
                log.note(now, &format!("Read error on fd {}: {errno}", self.fd.as_raw_fd()));
                DrainOutcome::Retry
            }
        }
    }
}
