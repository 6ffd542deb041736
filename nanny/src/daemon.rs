//! Daemonization and the PID file.

// Layer 1: Standard library imports
use std::ffi::CString;
use std::os::fd::IntoRawFd;
use std::path::Path;

// Layer 2: Third-party crate imports
use nix::fcntl::{open, OFlag};
use nix::sys::stat::{umask, Mode};
use nix::unistd::{chdir, dup, fork, getpid, setsid, ForkResult};

// Layer 3: Internal module imports
use crate::child::spawn::fd_close_limit;
use crate::error::{NannyError, NannyResult};

/// Pushes the process into the background.
///
/// The classic double fork: detach from the controlling terminal, re-seat
/// stdio on `/dev/null`, sanitize umask and working directory, and reparent
/// under init. Call before opening any descriptor that must survive.
///
/// With a `pidfile`, the daemon pid is written as ASCII decimal plus newline
/// under an advisory `F_TLOCK`; a held lock means another instance is
/// already running and is reported as an error.
pub fn daemonize(pidfile: Option<&Path>) -> NannyResult<()> {
    // SAFETY: pre-initialization and single-threaded; parents exit
    // immediately without running destructors.
    match unsafe { fork() }.map_err(|e| NannyError::io("fork", e))? {
        ForkResult::Parent { .. } => unsafe { nix::libc::_exit(0) },
        ForkResult::Child => {}
    }

    // Our own session: no controlling terminal, no SIGHUP at logout.
    setsid().map_err(|e| NannyError::io("setsid", e))?;

    let limit = fd_close_limit();
    for fd in 0..limit {
        unsafe {
            nix::libc::close(fd);
        }
    }
    let devnull = open("/dev/null", OFlag::O_RDWR, Mode::empty())
        .map_err(|e| NannyError::io("open /dev/null", e))?;
    let devnull = devnull.into_raw_fd(); // fd 0, kept for the process lifetime
    for _ in 0..2 {
        // SAFETY: duplicating the just-opened /dev/null onto stdout/stderr.
        let borrowed = unsafe { std::os::fd::BorrowedFd::borrow_raw(devnull) };
        let fd = dup(borrowed).map_err(|e| NannyError::io("dup", e))?;
        let _ = fd.into_raw_fd();
    }

    umask(Mode::from_bits_truncate(0o027));
    // Anywhere but a directory someone may want to unmount.
    chdir("/").map_err(|e| NannyError::io("chdir", e))?;

    // Second fork: no longer session leader, so no terminal can ever be
    // acquired by accident.
    match unsafe { fork() }.map_err(|e| NannyError::io("fork", e))? {
        ForkResult::Parent { .. } => unsafe { nix::libc::_exit(0) },
        ForkResult::Child => {}
    }

    if let Some(pidfile) = pidfile {
        write_pidfile(pidfile)?;
    }
    Ok(())
}

/// Writes and locks the pidfile; the descriptor is intentionally leaked so
/// the lock lives as long as the daemon.
pub fn write_pidfile(path: &Path) -> NannyResult<()> {
    let fd = open(path, OFlag::O_RDWR | OFlag::O_CREAT, Mode::from_bits_truncate(0o644))
        .map_err(|e| NannyError::io("open pidfile", e))?;
    let raw = fd.into_raw_fd();

    // SAFETY: raw is a fd we just opened; lockf only manipulates it.
    let locked = unsafe { nix::libc::lockf(raw, nix::libc::F_TLOCK, 0) };
    if locked < 0 {
        return Err(NannyError::config(format!(
            "pidfile {} is locked by another instance",
            path.display()
        )));
    }

    let line = format!("{}\n", getpid().as_raw());
    let Ok(line) = CString::new(line) else {
        return Err(NannyError::config("pidfile content"));
    };
    let bytes = line.as_bytes();
    // SAFETY: writing our own buffer to our own descriptor.
    let written = unsafe { nix::libc::write(raw, bytes.as_ptr().cast(), bytes.len()) };
    if written < 0 {
        return Err(NannyError::io("write pidfile", nix::errno::Errno::last()));
    }
    Ok(())
}
