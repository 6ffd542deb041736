//! `ppoll`-backed registration table for readable file descriptors.

// Layer 1: Standard library imports
use std::os::fd::{BorrowedFd, RawFd};
use std::time::Duration;

// Layer 2: Third-party crate imports
use nix::errno::Errno;
use nix::poll::{ppoll, PollFd, PollFlags};
use nix::sys::time::TimeSpec;
use tracing::warn;

// Layer 3: Internal module imports
use crate::error::{NannyError, NannyResult};

/// Historical fixed table size; registration beyond it now merely warns.
const SOFT_CAPACITY: usize = 512;

/// Registration table mapping readable fds to dispatch tokens.
///
/// Tokens are opaque to the reactor; [`Reactor::wait`] returns a clone of
/// the token for every fd that became readable, and the caller dispatches.
/// Registering an fd that is already present replaces its token. The table
/// grows on demand.
///
/// The reactor never owns the descriptors — whoever registered an fd keeps
/// it open until after unregistering it.
#[derive(Debug)]
pub struct Reactor<T> {
    slots: Vec<(RawFd, T)>,
}

impl<T: Clone> Default for Reactor<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T: Clone> Reactor<T> {
    /// Creates an empty registration table.
    pub fn new() -> Self {
        Self { slots: Vec::new() }
    }

    /// Number of registered descriptors.
    pub fn len(&self) -> usize {
        self.slots.len()
    }

    /// True if nothing is registered.
    pub fn is_empty(&self) -> bool {
        self.slots.is_empty()
    }

    /// Registers `fd` with a dispatch token, replacing any prior token for
    /// the same fd.
    pub fn register(&mut self, fd: RawFd, token: T) {
        if let Some(slot) = self.slots.iter_mut().find(|(f, _)| *f == fd) {
            slot.1 = token;
            return;
        }
        if self.slots.len() == SOFT_CAPACITY {
            warn!(fds = self.slots.len(), "fd registration table unusually large");
        }
        self.slots.push((fd, token));
    }

    /// Removes the registration for `fd`, if any.
    pub fn unregister(&mut self, fd: RawFd) {
        self.slots.retain(|(f, _)| *f != fd);
    }

    /// Blocks until at least one registered fd is readable or `timeout`
    /// elapses, and returns the tokens of all readable fds.
    ///
    /// An interrupted wait (`EINTR`) is not an error; it returns an empty
    /// ready set so the caller's loop can notice signal-driven state.
    pub fn wait(&self, timeout: Duration) -> NannyResult<Vec<T>> {
        if self.slots.is_empty() {
            std::thread::sleep(timeout.min(Duration::from_secs(1)));
            return Ok(Vec::new());
        }

        // SAFETY: registrants keep their fds open for the lifetime of the
        // registration; the borrow only lives for this call.
        let mut pollfds: Vec<PollFd> = self
            .slots
            .iter()
            .map(|(fd, _)| PollFd::new(unsafe { BorrowedFd::borrow_raw(*fd) }, PollFlags::POLLIN))
            .collect();

        let timeout = TimeSpec::from_duration(timeout);
        match ppoll(&mut pollfds, Some(timeout), None) {
            Ok(0) => Ok(Vec::new()),
            Ok(_) => {
                let mut ready = Vec::new();
                for (pollfd, (_, token)) in pollfds.iter().zip(self.slots.iter()) {
                    let revents = pollfd.revents().unwrap_or(PollFlags::empty());
                    if revents
                        .intersects(PollFlags::POLLIN | PollFlags::POLLHUP | PollFlags::POLLERR)
                    {
                        ready.push(token.clone());
                    }
                }
                Ok(ready)
            }
            Err(Errno::EINTR) => Ok(Vec::new()),
            Err(errno) => Err(NannyError::io("ppoll", errno)),
        }
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use nix::unistd::{pipe, write};
    use std::os::fd::AsRawFd;

    #[derive(Debug, Clone, PartialEq)]
    enum Token {
        A,
        B,
    }

    #[test]
    fn test_register_replace_and_unregister() {
        let mut reactor = Reactor::new();
        reactor.register(7, Token::A);
        reactor.register(7, Token::B);
        assert_eq!(reactor.len(), 1);
        reactor.unregister(7);
        assert!(reactor.is_empty());
    }

    #[test]
    fn test_wait_times_out_with_no_data() {
        let (read_end, _write_end) = pipe().unwrap();
        let mut reactor = Reactor::new();
        reactor.register(read_end.as_raw_fd(), Token::A);

        let ready = reactor.wait(Duration::from_millis(10)).unwrap();
        assert!(ready.is_empty());
    }

    #[test]
    fn test_wait_reports_readable_fd() {
        let (read_end, write_end) = pipe().unwrap();
        let mut reactor = Reactor::new();
        reactor.register(read_end.as_raw_fd(), Token::A);

        write(&write_end, b"x").unwrap();
        let ready = reactor.wait(Duration::from_secs(1)).unwrap();
        assert_eq!(ready, vec![Token::A]);
    }

    #[test]
    fn test_wait_reports_only_ready_fds() {
        let (read_a, write_a) = pipe().unwrap();
        let (read_b, _write_b) = pipe().unwrap();
        let mut reactor = Reactor::new();
        reactor.register(read_a.as_raw_fd(), Token::A);
        reactor.register(read_b.as_raw_fd(), Token::B);

        write(&write_a, b"x").unwrap();
        let ready = reactor.wait(Duration::from_secs(1)).unwrap();
        assert_eq!(ready, vec![Token::A]);
    }

    #[test]
    fn test_wait_reports_hangup_as_ready() {
        let (read_end, write_end) = pipe().unwrap();
        let mut reactor = Reactor::new();
        reactor.register(read_end.as_raw_fd(), Token::A);

        drop(write_end);
        let ready = reactor.wait(Duration::from_secs(1)).unwrap();
        assert_eq!(ready, vec![Token::A]);
    }
}
