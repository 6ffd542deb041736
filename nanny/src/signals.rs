//! Signal handling: `SIGCHLD` accounting and the termination flag.
//!
//! Handlers do almost nothing. `SIGCHLD` bumps a counter; termination
//! signals clear a flag; both scribble one byte into a self-pipe so the
//! readiness wait returns immediately instead of riding out its timeout.
//! Everything stateful happens on the main thread.
//!
//! The counter handshake is race-free because each of the two integers has
//! exactly one writer: the handler increments the received count, the main
//! loop increments the handled count. Handled lives in [`SignalBridge`]
//! since nothing else touches it.

// Layer 1: Standard library imports
use std::os::fd::{AsRawFd, IntoRawFd, OwnedFd, RawFd};
use std::sync::atomic::{AtomicBool, AtomicI32, AtomicU32, Ordering};

// Layer 2: Third-party crate imports
use nix::errno::Errno;
use nix::fcntl::OFlag;
use nix::sys::signal::{sigaction, SaFlags, SigAction, SigHandler, SigSet, Signal};
use nix::unistd::{pipe2, read};

// Layer 3: Internal module imports
use crate::error::{NannyError, NannyResult};

/// Count of SIGCHLD deliveries; written only by the signal handler.
static SIGCHLD_COUNT: AtomicU32 = AtomicU32::new(0);

/// Cleared by HUP/INT/QUIT/ABRT/TERM; read by the main loop.
static RUNNING: AtomicBool = AtomicBool::new(true);

/// Write end of the self-pipe, or -1 before installation.
static WAKE_FD: AtomicI32 = AtomicI32::new(-1);

fn wake() {
    let fd = WAKE_FD.load(Ordering::Relaxed);
    if fd >= 0 {
        // SAFETY: write(2) is async-signal-safe; the fd is non-blocking and
        // stays open for the life of the process. A full pipe is fine — the
        // wake-up is already pending.
        unsafe {
            nix::libc::write(fd, b"!".as_ptr().cast(), 1);
        }
    }
}

extern "C" fn on_sigchld(_: nix::libc::c_int) {
    SIGCHLD_COUNT.fetch_add(1, Ordering::Relaxed);
    wake();
}

extern "C" fn on_terminate(_: nix::libc::c_int) {
    RUNNING.store(false, Ordering::Relaxed);
    wake();
}

/// True until a termination signal (HUP, INT, QUIT, ABRT, TERM) arrives.
pub fn running() -> bool {
    RUNNING.load(Ordering::Relaxed)
}

/// Main-loop side of the signal handshake.
///
/// Owns the read end of the self-pipe (register it with the reactor) and the
/// handled-signal counter.
#[derive(Debug)]
pub struct SignalBridge {
    wake_read: OwnedFd,
    sigchld_handled: u32,
}

impl SignalBridge {
    /// Installs the handlers and the self-pipe. Call once, before any child
    /// is spawned.
    pub fn install() -> NannyResult<Self> {
        let (wake_read, wake_write) =
            pipe2(OFlag::O_NONBLOCK | OFlag::O_CLOEXEC).map_err(|e| NannyError::io("pipe2", e))?;
        // The write end is handed to the handlers for the process lifetime.
        WAKE_FD.store(wake_write.into_raw_fd(), Ordering::Relaxed);

        let chld = SigAction::new(
            SigHandler::Handler(on_sigchld),
            SaFlags::SA_NOCLDSTOP,
            SigSet::empty(),
        );
        let term = SigAction::new(
            SigHandler::Handler(on_terminate),
            SaFlags::empty(),
            SigSet::empty(),
        );
        // SAFETY: both handlers only touch atomics and call write(2).
        unsafe {
            sigaction(Signal::SIGCHLD, &chld).map_err(|e| NannyError::io("sigaction", e))?;
            for sig in [
                Signal::SIGHUP,
                Signal::SIGINT,
                Signal::SIGQUIT,
                Signal::SIGABRT,
                Signal::SIGTERM,
            ] {
                sigaction(sig, &term).map_err(|e| NannyError::io("sigaction", e))?;
            }
        }

        Ok(Self {
            wake_read,
            sigchld_handled: 0,
        })
    }

    /// Read end of the self-pipe, for reactor registration.
    pub fn wake_fd(&self) -> RawFd {
        self.wake_read.as_raw_fd()
    }

    /// True if SIGCHLD deliveries are outstanding; advances the handled
    /// counter by one. Several coalesced signals may be answered by a single
    /// reap pass, so extra deliveries collapse harmlessly.
    pub fn take_sigchld(&mut self) -> bool {
        if SIGCHLD_COUNT.load(Ordering::Relaxed) == self.sigchld_handled {
            return false;
        }
        self.sigchld_handled = self.sigchld_handled.wrapping_add(1);
        true
    }

    /// Drains accumulated wake-up bytes from the self-pipe.
    pub fn drain_wake(&self) {
        let mut buf = [0u8; 64];
        loop {
            match read(&self.wake_read, &mut buf) {
                Ok(0) => break,
                Ok(_) => continue,
                Err(Errno::EINTR) => continue,
                Err(_) => break,
            }
        }
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    #[test]
    fn test_running_defaults_true() {
        assert!(running());
    }

    #[test]
    fn test_take_sigchld_advances_one_per_call() {
        let (wake_read, _wake_write) = pipe2(OFlag::O_NONBLOCK).unwrap();
        let mut bridge = SignalBridge {
            wake_read,
            sigchld_handled: SIGCHLD_COUNT.load(Ordering::Relaxed),
        };

        assert!(!bridge.take_sigchld());
        SIGCHLD_COUNT.fetch_add(3, Ordering::Relaxed);
        assert!(bridge.take_sigchld());
        assert!(bridge.take_sigchld());
        assert!(bridge.take_sigchld());
        assert!(!bridge.take_sigchld());
    }
}
