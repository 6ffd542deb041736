//! Fork/exec of shell commands with captured output.
//!
//! Every process the supervisor starts — main children, health probes, stop
//! commands — goes through [`spawn_shell`]: `/bin/sh -c <cmd>` with an
//! explicit environment, stdout/stderr optionally piped back for log
//! capture, and every inherited descriptor above stdio closed before exec.

// Layer 1: Standard library imports
use std::ffi::CString;
use std::os::fd::OwnedFd;

// Layer 2: Third-party crate imports
use nix::sys::signal::kill;
use nix::unistd::{dup2_stderr, dup2_stdout, execve, fork, pipe, ForkResult, Pid, SysconfVar};

// Layer 3: Internal module imports
use crate::env;
use crate::error::{NannyError, NannyResult};

/// Result of a spawn request.
#[derive(Debug)]
pub enum Spawned {
    /// The guarded pid still exists; nothing was started. Survives lost
    /// SIGCHLD notifications without double-spawning.
    AlreadyRunning(Pid),
    /// A fresh process, with the read ends of its output pipes when capture
    /// was requested.
    Started {
        pid: Pid,
        stdout: Option<OwnedFd>,
        stderr: Option<OwnedFd>,
    },
}

impl Spawned {
    /// The pid either way.
    pub fn pid(&self) -> Pid {
        match self {
            Spawned::AlreadyRunning(pid) => *pid,
            Spawned::Started { pid, .. } => *pid,
        }
    }
}

/// Highest fd number to close in a forked child, computed pre-fork.
pub(crate) fn fd_close_limit() -> i32 {
    match nix::unistd::sysconf(SysconfVar::OPEN_MAX) {
        Ok(Some(max)) => max.min(65536) as i32,
        _ => 1024,
    }
}

/// Starts `/bin/sh -c cmd` with environment `envp`.
///
/// With `guard` set, a still-existing pid short-circuits to
/// [`Spawned::AlreadyRunning`]. With `capture`, the child's stdout and
/// stderr are piped back; the caller owns the read ends and typically feeds
/// them to log drains.
pub fn spawn_shell(
    guard: Option<Pid>,
    envp: &[String],
    cmd: &str,
    capture: bool,
) -> NannyResult<Spawned> {
    if let Some(pid) = guard {
        if kill(pid, None).is_ok() {
            return Ok(Spawned::AlreadyRunning(pid));
        }
    }

    let stdout_pipe = if capture {
        Some(pipe().map_err(|e| NannyError::io("pipe", e))?)
    } else {
        None
    };
    let stderr_pipe = if capture {
        Some(pipe().map_err(|e| NannyError::io("pipe", e))?)
    } else {
        None
    };

    // Everything the child needs is materialized before the fork.
    let sh = CString::new("/bin/sh").map_err(|e| NannyError::spawn(cmd, e))?;
    let argv = [
        sh.clone(),
        CString::new("-c").map_err(|e| NannyError::spawn(cmd, e))?,
        CString::new(cmd).map_err(|e| NannyError::spawn(cmd, e))?,
    ];
    let envc = env::to_cstrings(envp);
    let close_limit = fd_close_limit();

    // SAFETY: the child branch only duplicates descriptors and execs; the
    // process is single-threaded, so the post-fork environment is intact.
    match unsafe { fork() }.map_err(|e| NannyError::spawn(cmd, e))? {
        ForkResult::Child => {
            if let Some((_read, write)) = &stdout_pipe {
                let _ = dup2_stdout(write);
            }
            if let Some((_read, write)) = &stderr_pipe {
                let _ = dup2_stderr(write);
            }
            // Drop every inherited descriptor above stdio: pipe ends,
            // listeners, log files, the signal pipe.
            for fd in 3..close_limit {
                unsafe {
                    nix::libc::close(fd);
                }
            }
            let _ = execve(&sh, &argv, &envc);
            unsafe { nix::libc::_exit(1) }
        }
        ForkResult::Parent { child } => {
            let stdout = stdout_pipe.map(|(read, write)| {
                drop(write);
                read
            });
            let stderr = stderr_pipe.map(|(read, write)| {
                drop(write);
                read
            });
            Ok(Spawned::Started {
                pid: child,
                stdout,
                stderr,
            })
        }
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::panic)]
mod tests {
    use super::*;
    use nix::sys::wait::{waitpid, WaitStatus};
    use nix::unistd::read;

    fn read_all(fd: &OwnedFd) -> Vec<u8> {
        let mut out = Vec::new();
        let mut buf = [0u8; 256];
        loop {
            match read(fd, &mut buf) {
                Ok(0) => break,
                Ok(n) => out.extend_from_slice(&buf[..n]),
                Err(_) => break,
            }
        }
        out
    }

    #[test]
    fn test_spawn_captures_stdout() {
        let envp = vec!["PATH=/bin:/usr/bin".to_string()];
        let spawned = spawn_shell(None, &envp, "echo captured", true).unwrap();
        let Spawned::Started { pid, stdout, stderr } = spawned else {
            panic!("expected a fresh process");
        };

        let out = read_all(&stdout.unwrap());
        assert_eq!(out, b"captured\n");
        assert_eq!(read_all(&stderr.unwrap()), b"");
        assert!(matches!(
            waitpid(pid, None).unwrap(),
            WaitStatus::Exited(_, 0)
        ));
    }

    #[test]
    fn test_spawn_passes_environment() {
        let envp = vec![
            "PATH=/bin:/usr/bin".to_string(),
            "NANNY_PROBE=ok".to_string(),
        ];
        let spawned = spawn_shell(None, &envp, "echo $NANNY_PROBE", true).unwrap();
        let Spawned::Started { pid, stdout, .. } = spawned else {
            panic!("expected a fresh process");
        };

        assert_eq!(read_all(&stdout.unwrap()), b"ok\n");
        let _ = waitpid(pid, None);
    }

    #[test]
    fn test_guard_prevents_double_spawn() {
        let envp = vec!["PATH=/bin:/usr/bin".to_string()];
        let first = spawn_shell(None, &envp, "sleep 30", false).unwrap();
        let pid = first.pid();

        let second = spawn_shell(Some(pid), &envp, "sleep 30", false).unwrap();
        assert!(matches!(second, Spawned::AlreadyRunning(p) if p == pid));

        kill(pid, nix::sys::signal::Signal::SIGKILL).unwrap();
        let _ = waitpid(pid, None);
    }

    #[test]
    fn test_stale_guard_spawns_fresh() {
        let envp = vec!["PATH=/bin:/usr/bin".to_string()];
        // A pid that cannot exist.
        let stale = Pid::from_raw(i32::MAX - 1);
        let spawned = spawn_shell(Some(stale), &envp, "true", false).unwrap();
        let Spawned::Started { pid, .. } = spawned else {
            panic!("stale guard must not block the spawn");
        };
        let _ = waitpid(pid, None);
    }
}
