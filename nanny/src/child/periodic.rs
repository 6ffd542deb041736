//! Scheduled auxiliary tasks, cron-style.
//!
//! A task spec is an interval followed by a shell command, e.g.
//! `8h bin/reset $PID`. Firings fork a fully detached worker that runs the
//! command with `PID` and `NANNY_SCHEDULED` in its environment and mails any
//! output to the invoking user, the way cron would.

// Layer 1: Standard library imports
use std::ffi::CString;

// Layer 2: Third-party crate imports
use nix::fcntl::{open, OFlag};
use nix::sys::stat::Mode;
use nix::unistd::{chdir, dup2_stderr, dup2_stdin, dup2_stdout, execve, execvp, fork, pipe,
    ForkResult};
use rand::Rng;
use tracing::warn;

// Layer 3: Internal module imports
use super::record::{ChildId, PeriodicTask};
use super::spawn::fd_close_limit;
use crate::env;
use crate::error::{NannyError, NannyResult};
use crate::supervisor::{Supervisor, TimerEvent};
use crate::util::{hostname, username};

/// Parses `<num><unit>[<num><unit>]...` and returns `(seconds, command)`.
///
/// Units: `d`, `h`, `m`, `s`. The command is everything after the first run
/// of whitespace following the interval.
pub fn parse_spec(spec: &str) -> NannyResult<(i64, String)> {
    let mut chars = spec.char_indices().peekable();
    let mut interval: i64 = 0;

    loop {
        let mut digits: i64 = 0;
        let mut saw_digit = false;
        while let Some((_, c)) = chars.peek() {
            let Some(d) = c.to_digit(10) else { break };
            digits = digits.saturating_mul(10).saturating_add(i64::from(d));
            saw_digit = true;
            chars.next();
        }
        if !saw_digit {
            return Err(NannyError::parse_spec(spec, "expected a number"));
        }

        let unit = chars.next().map(|(_, c)| c);
        let scale = match unit {
            Some('d') => 86_400,
            Some('h') => 3_600,
            Some('m') => 60,
            Some('s') => 1,
            _ => {
                return Err(NannyError::parse_spec(
                    spec,
                    "expected time unit 'd', 'h', 'm', or 's'",
                ))
            }
        };
        interval = interval.saturating_add(digits.saturating_mul(scale));

        match chars.peek() {
            Some((_, ' ')) | Some((_, '\t')) => {
                let mut start = spec.len();
                while let Some((i, c)) = chars.peek() {
                    if *c == ' ' || *c == '\t' {
                        chars.next();
                    } else {
                        start = *i;
                        break;
                    }
                }
                let cmd = &spec[start..];
                if cmd.is_empty() {
                    return Err(NannyError::parse_spec(spec, "no command specified"));
                }
                if interval < 1 {
                    return Err(NannyError::parse_spec(spec, "interval must be positive"));
                }
                return Ok((interval, cmd.to_string()));
            }
            Some(_) => continue,
            None => return Err(NannyError::parse_spec(spec, "no command specified")),
        }
    }
}

impl Supervisor {
    /// Attaches a periodic task to a child. The first firing is jittered
    /// uniformly within one interval so sibling tasks don't thunder
    /// together.
    pub fn add_periodic(&mut self, id: ChildId, spec: &str) -> NannyResult<()> {
        let (interval, cmd) = parse_spec(spec)?;
        let child_rc = self
            .children
            .get(id)
            .ok_or_else(|| NannyError::config(format!("no child with id {id}")))?;

        let mut child = child_rc.borrow_mut();
        let task_id = child.next_task_id;
        child.next_task_id += 1;

        let first_delay = rand::thread_rng().gen_range(0..interval);
        let timer = self.timers.add(
            self.globals.now + first_delay,
            TimerEvent::Periodic { child: id, task: task_id },
        );
        child.timed.push(PeriodicTask {
            id: task_id,
            interval,
            cmd,
            last: None,
            timer: Some(timer),
        });
        Ok(())
    }

    /// Handles one firing of a periodic task: reschedule off the scheduled
    /// time, then hand the command to a detached worker.
    pub(crate) fn periodic_fire(&mut self, child_id: ChildId, task_id: u32, fired_at: i64) {
        let Some(child_rc) = self.children.get(child_id) else {
            return;
        };

        let cmd = {
            let mut child = child_rc.borrow_mut();
            let Some(task) = child.timed.iter_mut().find(|t| t.id == task_id) else {
                return;
            };
            task.last = Some(fired_at);
            task.timer = Some(self.timers.add(
                fired_at + task.interval,
                TimerEvent::Periodic { child: child_id, task: task_id },
            ));
            task.cmd.clone()
        };

        let envp = child_rc.borrow().envp.clone();
        let main_pid = self.globals.child_pid;

        // The worker handles everything — running the task, collecting
        // output, mailing — so the supervisor never blocks on it.
        // SAFETY: single-threaded process; the child branch execs or exits.
        match unsafe { fork() } {
            Ok(ForkResult::Parent { .. }) => {}
            Ok(ForkResult::Child) => run_task_worker(&cmd, &envp, main_pid, fired_at),
            Err(err) => warn!(error = %err, "periodic worker fork failed"),
        }
    }
}

/// Body of the detached periodic worker. Runs in a forked child and never
/// returns: every path ends in `_exit`.
///
/// The worker detaches from the supervisor's descriptors entirely, runs the
/// task through `/bin/sh` with `PID` and `NANNY_SCHEDULED` appended to a
/// private environment copy, and mails captured output via
/// `/usr/sbin/sendmail` — unless the task stayed silent, in which case no
/// mail is sent at all.
fn run_task_worker(cmd: &str, envp: &[String], main_pid: Option<i32>, scheduled: i64) -> ! {
    let user = username();
    let close_limit = fd_close_limit();

    let _ = chdir("/tmp");
    for fd in 0..close_limit {
        unsafe {
            nix::libc::close(fd);
        }
    }
    // Re-seat stdio on /dev/null; the opens land on 0, 1, 2 in order.
    for flags in [OFlag::O_RDONLY, OFlag::O_WRONLY, OFlag::O_WRONLY] {
        match open("/dev/null", flags, Mode::empty()) {
            Ok(fd) => std::mem::forget(fd),
            Err(_) => unsafe { nix::libc::_exit(1) },
        }
    }

    let Ok((task_read, task_write)) = pipe() else {
        unsafe { nix::libc::_exit(1) }
    };

    // Grandchild: run the task with stdout/stderr on the pipe.
    let mut extra: Vec<(&str, String)> = Vec::new();
    if let Some(pid) = main_pid {
        extra.push(("PID", pid.to_string()));
    }
    extra.push(("NANNY_SCHEDULED", scheduled.to_string()));
    let task_env = env::to_cstrings(&env::with_extra(envp, &extra));

    let (Ok(sh), Ok(dash_c), Ok(cmd_c)) = (
        CString::new("/bin/sh"),
        CString::new("-c"),
        CString::new(cmd),
    ) else {
        unsafe { nix::libc::_exit(1) }
    };

    match unsafe { fork() } {
        Ok(ForkResult::Child) => {
            drop(task_read);
            let _ = dup2_stdout(&task_write);
            let _ = dup2_stderr(&task_write);
            drop(task_write);
            let argv = [sh.clone(), dash_c, cmd_c];
            let _ = execve(&sh, &argv, &task_env);
            unsafe { nix::libc::_exit(1) }
        }
        Ok(ForkResult::Parent { .. }) => {}
        Err(_) => unsafe { nix::libc::_exit(1) },
    }
    drop(task_write);

    // Hold the first chunk to detect an entirely silent task: silence means
    // no mail, like cron.
    let mut first = [0u8; 4096];
    let first_len = loop {
        match nix::unistd::read(&task_read, &mut first) {
            Ok(0) => unsafe { nix::libc::_exit(0) },
            Ok(n) => {
                if user.is_some() {
                    break n;
                }
                // Nobody to mail; just drain until the task finishes.
            }
            Err(nix::errno::Errno::EINTR) => {}
            Err(_) => {}
        }
    };
    let Some(user) = user else {
        unsafe { nix::libc::_exit(0) }
    };

    let Ok((mail_read, mail_write)) = pipe() else {
        unsafe { nix::libc::_exit(1) }
    };
    match unsafe { fork() } {
        Ok(ForkResult::Child) => {
            drop(mail_write);
            let _ = dup2_stdin(&mail_read);
            drop(mail_read);
            let (Ok(sendmail), Ok(user_c)) = (
                CString::new("/usr/sbin/sendmail"),
                CString::new(user.as_str()),
            ) else {
                unsafe { nix::libc::_exit(1) }
            };
            let argv = [sendmail.clone(), user_c];
            let _ = execvp(&sendmail, &argv);
            unsafe { nix::libc::_exit(1) }
        }
        Ok(ForkResult::Parent { .. }) => {}
        Err(_) => unsafe { nix::libc::_exit(1) },
    }
    drop(mail_read);

    let header = format!("Subject: <{}@{}> {}\n\n\n", user, hostname(), cmd);
    let _ = nix::unistd::write(&mail_write, header.as_bytes());
    let _ = nix::unistd::write(&mail_write, &first[..first_len]);

    // Stream the rest of the task's output straight through.
    let mut buf = [0u8; 4096];
    loop {
        match nix::unistd::read(&task_read, &mut buf) {
            Ok(0) => unsafe { nix::libc::_exit(0) },
            Ok(n) => {
                let _ = nix::unistd::write(&mail_write, &buf[..n]);
            }
            Err(nix::errno::Errno::EINTR) => {}
            Err(_) => unsafe { nix::libc::_exit(1) },
        }
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_single_unit() {
        let (interval, cmd) = parse_spec("8h bin/reset $PID").unwrap();
        assert_eq!(interval, 28_800);
        assert_eq!(cmd, "bin/reset $PID");
    }

    #[test]
    fn test_parse_each_unit() {
        assert_eq!(parse_spec("2d x").unwrap().0, 172_800);
        assert_eq!(parse_spec("3h x").unwrap().0, 10_800);
        assert_eq!(parse_spec("15m x").unwrap().0, 900);
        assert_eq!(parse_spec("45s x").unwrap().0, 45);
    }

    #[test]
    fn test_parse_compound_interval() {
        let (interval, cmd) = parse_spec("1h30m flush-caches").unwrap();
        assert_eq!(interval, 5_400);
        assert_eq!(cmd, "flush-caches");
    }

    #[test]
    fn test_parse_preserves_command_whitespace_after_first_gap() {
        let (interval, cmd) = parse_spec("1m  echo  two  spaces").unwrap();
        assert_eq!(interval, 60);
        assert_eq!(cmd, "echo  two  spaces");
    }

    #[test]
    fn test_parse_rejects_bad_unit() {
        assert!(parse_spec("8x cmd").is_err());
    }

    #[test]
    fn test_parse_rejects_missing_number() {
        assert!(parse_spec("h cmd").is_err());
    }

    #[test]
    fn test_parse_rejects_missing_command() {
        assert!(parse_spec("8h").is_err());
        assert!(parse_spec("8h   ").is_err());
    }

    #[test]
    fn test_parse_rejects_zero_interval() {
        assert!(parse_spec("0s cmd").is_err());
    }

    #[test]
    fn test_add_periodic_schedules_with_jitter() {
        let mut sup = Supervisor::new(crate::config::NannyConfig::default()).unwrap();
        let id = sup.child_new("/bin/sleep 100000");
        sup.globals.now = 10_000;
        sup.add_periodic(id, "1h echo tick").unwrap();

        let child = sup.child(id).unwrap();
        let child = child.borrow();
        assert_eq!(child.timed.len(), 1);
        let task = &child.timed[0];
        assert_eq!(task.interval, 3600);
        assert_eq!(task.cmd, "echo tick");
        let when = sup.timers.expiration(task.timer.unwrap()).unwrap();
        assert!((10_000..10_000 + 3600).contains(&when));
    }

    #[test]
    fn test_add_periodic_rejects_invalid_spec() {
        let mut sup = Supervisor::new(crate::config::NannyConfig::default()).unwrap();
        let id = sup.child_new("/bin/sleep 100000");
        assert!(sup.add_periodic(id, "nonsense").is_err());
        assert!(sup.child(id).unwrap().borrow().timed.is_empty());
    }

    #[test]
    fn test_periodic_fire_reschedules_off_scheduled_time() {
        let mut sup = Supervisor::new(crate::config::NannyConfig::default()).unwrap();
        let id = sup.child_new("/bin/sleep 100000");
        sup.globals.now = 0;
        sup.add_periodic(id, "1h true").unwrap();

        // Note: the fire also forks a detached worker running `true`; it
        // exits quietly without mail.
        sup.periodic_fire(id, 0, 20_000);

        let child = sup.child(id).unwrap();
        let child = child.borrow();
        let task = &child.timed[0];
        assert_eq!(task.last, Some(20_000));
        assert_eq!(
            sup.timers.expiration(task.timer.unwrap()),
            Some(23_600)
        );
    }
}
