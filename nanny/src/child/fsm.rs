//! Goal handlers: the state machines that own child records.
//!
//! A record is always owned by exactly one goal. Timer events dispatch into
//! the owning goal's handler; child exits arrive through the reap path and
//! the `*_ended` handlers here. Swapping the goal *is* the control plane:
//! shutdown moves children to [`Goal::Stopped`], failing health installs
//! [`Goal::Restart`].

// Layer 1: Standard library imports
use std::cell::RefCell;
use std::rc::Rc;

// Layer 2: Third-party crate imports
use nix::sys::signal::{kill, Signal};
use nix::sys::wait::WaitStatus;
use tracing::warn;

// Layer 3: Internal module imports
use super::record::{ChildId, ChildRecord, ChildState, Goal};
use super::spawn::{spawn_shell, Spawned};
use crate::env;
use crate::supervisor::{Supervisor, TimerEvent};

impl Supervisor {
    /// Runs the goal handler owning `id`, in response to its state timer.
    pub(crate) fn dispatch_state(&mut self, id: ChildId, fired_at: i64) {
        let Some(child_rc) = self.children.get(id) else {
            return;
        };
        let goal = {
            let mut child = child_rc.borrow_mut();
            child.state_timer = None;
            child.goal
        };
        match goal {
            Goal::Running => self.goal_running(&child_rc, fired_at),
            Goal::Stopped => self.goal_stopped(&child_rc, fired_at),
            Goal::Restart => self.goal_restart(&child_rc, fired_at),
            Goal::HealthCheck => self.health_check_goal(&child_rc, fired_at),
        }
    }

    /// Keep the child running: start it, watch probation, back off after
    /// failures.
    fn goal_running(&mut self, child_rc: &Rc<RefCell<ChildRecord>>, now: i64) {
        let id = child_rc.borrow().id;

        // Seen after an exit: decide whether to restart.
        {
            let mut child = child_rc.borrow_mut();
            if child.state == ChildState::Stopped {
                if child.restartable {
                    child.state = ChildState::Restarting;
                    let at = self.globals.now + child.restart_delay;
                    child.state_timer = Some(self.timers.add(at, TimerEvent::ChildState(id)));
                }
                return;
            }
        }

        let (state, guard, envp, cmd) = {
            let child = child_rc.borrow();
            (child.state, child.pid, child.envp.clone(), child.start_cmd.clone())
        };

        if state == ChildState::New || state == ChildState::Restarting {
            let verb = if state == ChildState::New {
                "STARTING"
            } else {
                "RESTARTING"
            };

            match spawn_shell(guard, &envp, &cmd, true) {
                Ok(spawned) => {
                    let pid = spawned.pid();
                    let mut child = child_rc.borrow_mut();
                    if let Spawned::Started { stdout, stderr, .. } = spawned {
                        if let Some(fd) = stdout {
                            self.attach_drain(fd, Rc::clone(&child.stdout));
                        }
                        if let Some(fd) = stderr {
                            self.attach_drain(fd, Rc::clone(&child.stderr));
                        }
                    }
                    child.pid = Some(pid);
                    if child.id == 0 {
                        self.globals.child_pid = Some(pid.as_raw());
                    }
                    child.health.failures_consecutive = 0;
                    child.health.successes_consecutive = 0;
                    child.running = true;
                    child.last_start = Some(now);
                    child.start_count += 1;

                    let line = format!("{verb}\tPID={pid}\tCMD={cmd}");
                    self.announce(&line);
                    child.events.borrow_mut().note(self.globals.now, &line);

                    // On probation until enough consecutive probes pass. A
                    // replaced timer is always cancelled first; the guard
                    // path can reach here with the old probe still armed.
                    child.state = ChildState::Starting;
                    if let Some(timer) = child.health_timer.take() {
                        self.timers.cancel(timer);
                    }
                    child.state_timer = Some(self.timers.add(
                        now + self.config.start_probation(),
                        TimerEvent::ChildState(id),
                    ));
                    child.health_timer = Some(
                        self.timers
                            .add(now + self.config.health_period, TimerEvent::HealthProbe(id)),
                    );
                }
                Err(err) => {
                    warn!(child = id, error = %err, "start command failed to spawn");
                    let mut child = child_rc.borrow_mut();
                    child
                        .events
                        .borrow_mut()
                        .note(self.globals.now, &format!("SPAWN FAILED\tCMD={cmd}\t{err}"));
                    child.state = ChildState::Restarting;
                    let at = self.globals.now + child.restart_delay.max(1);
                    child.state_timer = Some(self.timers.add(at, TimerEvent::ChildState(id)));
                }
            }
            return;
        }

        if state == ChildState::Starting {
            let mut child = child_rc.borrow_mut();
            if child.health.successes_consecutive > 4 {
                // Probation passed cleanly.
                child.state = ChildState::Running;
                child.failures = 0;
                child.restart_delay = 1;
            } else {
                // Always rearmed while on probation, so promotion can never
                // stall waiting for a timer nobody scheduled.
                child.state_timer = Some(
                    self.timers
                        .add(now + self.config.health_period, TimerEvent::ChildState(id)),
                );
            }
        }
    }

    /// Walk the stop cascade: custom stop, SIGTERM, SIGKILL, give up.
    fn goal_stopped(&mut self, child_rc: &Rc<RefCell<ChildRecord>>, now: i64) {
        let mut child = child_rc.borrow_mut();
        let id = child.id;

        // Not running or never started.
        if child.pid.is_none()
            || matches!(
                child.state,
                ChildState::Stopped | ChildState::Restarting | ChildState::New
            )
        {
            child.state = ChildState::Stopped;
            child.running = false;
            return;
        }
        let Some(pid) = child.pid else {
            return;
        };

        // Stale pid: the child exited and nobody told us.
        if kill(pid, None).is_err() {
            child.state = ChildState::Stopped;
            child.pid = None;
            child.running = false;
            return;
        }

        match child.state {
            ChildState::StoppingCustom => {
                child.state = ChildState::StoppingTerm;
                let _ = kill(pid, Signal::SIGTERM);
                child
                    .events
                    .borrow_mut()
                    .note(self.globals.now, &format!("SENDING SIGTERM to PID={pid}"));
                child.state_timer = Some(self.timers.add(
                    now + self.config.signal_patience,
                    TimerEvent::ChildState(id),
                ));
            }
            ChildState::StoppingTerm => {
                child.state = ChildState::StoppingKill;
                let _ = kill(pid, Signal::SIGKILL);
                child
                    .events
                    .borrow_mut()
                    .note(self.globals.now, &format!("SENDING SIGKILL to PID={pid}"));
                child.state_timer = Some(self.timers.add(
                    now + self.config.signal_patience,
                    TimerEvent::ChildState(id),
                ));
            }
            ChildState::StoppingKill => {
                // Even SIGKILL didn't take. Disown the pid and move on; the
                // kernel may still reap it eventually.
                self.announce(&format!(
                    "UNSTOPPABLE\tPID={pid}\tINSTANCE={}\tCMD={}",
                    child.instance.as_deref().unwrap_or(""),
                    child.start_cmd
                ));
                let _ = kill(pid, Signal::SIGKILL);
                let mut events = child.events.borrow_mut();
                events.note(self.globals.now, &format!("SENDING SIGKILL to PID={pid}"));
                events.note(self.globals.now, &format!("GIVING UP ON PID={pid}"));
                drop(events);
                child.state = ChildState::Stopped;
                child.pid = None;
                child.running = false;
            }
            _ => {
                // First attempt: prefer the custom stop command.
                let stop_cmd = child.stop_cmd.clone().filter(|c| !c.is_empty());
                if let Some(stop_cmd) = stop_cmd {
                    let stop_env =
                        env::with_extra(&child.envp, &[("PID", pid.as_raw().to_string())]);
                    match spawn_shell(None, &stop_env, &stop_cmd, true) {
                        Ok(Spawned::Started { stdout, stderr, .. }) => {
                            // Fire-and-forget; its output lands in the events
                            // narrative.
                            if let Some(fd) = stdout {
                                self.attach_drain(fd, Rc::clone(&child.events));
                            }
                            if let Some(fd) = stderr {
                                self.attach_drain(fd, Rc::clone(&child.events));
                            }
                        }
                        Ok(Spawned::AlreadyRunning(_)) => {}
                        Err(err) => {
                            warn!(child = id, error = %err, "stop command failed to spawn");
                        }
                    }
                    child.events.borrow_mut().note(
                        self.globals.now,
                        &format!("STOPPING\tPID={pid}\tCMD={stop_cmd}"),
                    );
                    child.state = ChildState::StoppingCustom;
                } else {
                    let _ = kill(pid, Signal::SIGTERM);
                    child.events.borrow_mut().note(
                        self.globals.now,
                        &format!("STOPPING\tPID={pid}\tSIGNAL={}", Signal::SIGTERM as i32),
                    );
                    child.state = ChildState::StoppingTerm;
                }
                child.state_timer = Some(self.timers.add(
                    now + self.config.stop_probation,
                    TimerEvent::ChildState(id),
                ));
            }
        }
    }

    /// Stop if still alive, then hand the record back to [`Goal::Running`].
    fn goal_restart(&mut self, child_rc: &Rc<RefCell<ChildRecord>>, now: i64) {
        let stopped = child_rc.borrow().state == ChildState::Stopped;
        if stopped {
            let mut child = child_rc.borrow_mut();
            let id = child.id;
            child.state = ChildState::Restarting;
            child.goal = Goal::Running;
            child.state_timer = Some(self.timers.add(0, TimerEvent::ChildState(id)));
        } else {
            self.goal_stopped(child_rc, now);
        }
    }

    /// Drive one health probe: start it, and kill it if it outlives its
    /// timeout. The reap path turns the kill into a recorded failure.
    fn health_check_goal(&mut self, check_rc: &Rc<RefCell<ChildRecord>>, now: i64) {
        let (check_id, main_id, state, guard, envp, cmd) = {
            let check = check_rc.borrow();
            (
                check.id,
                check.main,
                check.state,
                check.pid,
                check.envp.clone(),
                check.start_cmd.clone(),
            )
        };
        let Some(main_rc) = main_id.and_then(|m| self.children.get(m)) else {
            return;
        };

        if state == ChildState::New {
            match spawn_shell(guard, &envp, &cmd, true) {
                Ok(spawned) => {
                    let pid = spawned.pid();
                    let mut check = check_rc.borrow_mut();
                    if let Spawned::Started { stdout, stderr, .. } = spawned {
                        // Both streams land in the parent's event narrative.
                        if let Some(fd) = stdout {
                            self.attach_drain(fd, Rc::clone(&check.stdout));
                        }
                        if let Some(fd) = stderr {
                            self.attach_drain(fd, Rc::clone(&check.stderr));
                        }
                    }
                    check.pid = Some(pid);
                    check.running = true;
                    check.last_start = Some(now);
                    check.state = ChildState::Starting;
                    check.state_timer = Some(self.timers.add(
                        now + self.config.health_timeout,
                        TimerEvent::ChildState(check_id),
                    ));
                    main_rc
                        .borrow_mut()
                        .events
                        .borrow_mut()
                        .note(self.globals.now, &format!("Started health check, pid={pid}"));
                }
                Err(err) => {
                    warn!(error = %err, "health check failed to spawn");
                    self.children.remove(check_id);
                    self.record_probe_failure(
                        &main_rc,
                        &format!("Health check failed to spawn: {err}"),
                    );
                }
            }
        } else if let Some(pid) = guard {
            main_rc
                .borrow_mut()
                .events
                .borrow_mut()
                .note(self.globals.now, &format!("Killing health check, pid={pid}"));
            let _ = kill(pid, Signal::SIGKILL);
        }
    }

    /// Reap handler for a supervised main child.
    pub(crate) fn main_child_ended(&mut self, id: ChildId, status: WaitStatus) {
        let Some(child_rc) = self.children.get(id) else {
            return;
        };
        let now = self.globals.now;
        let mut child = child_rc.borrow_mut();

        let old_pid = match child.pid.take() {
            Some(pid) => pid.as_raw(),
            None => 0,
        };
        if child.id == 0 {
            self.globals.child_pid = None;
        }
        child.running = false;
        child.state = ChildState::Stopped;
        child.last_stop = Some(now);
        child.failures += 1;

        // Exponential backoff: doubled every failure, clamped to [1s, 1h].
        child.restart_delay = (child.restart_delay * 2).clamp(1, 3600);

        if let Some(timer) = child.state_timer.take() {
            self.timers.cancel(timer);
        }
        if let Some(timer) = child.health_timer.take() {
            self.timers.cancel(timer);
        }
        // Let the owning goal see the exit immediately: goal_running takes
        // the restart path, goal_stopped finishes cleanly.
        child.state_timer = Some(self.timers.add(0, TimerEvent::ChildState(id)));

        let instance = child.instance.clone().unwrap_or_default();
        match status {
            WaitStatus::Exited(_, code) => {
                self.announce(&format!(
                    "STOPPED\tID={id}\tPID={old_pid}\tSTATUS={code}\tINSTANCE={instance}\tCMD={}",
                    child.start_cmd
                ));
                child
                    .events
                    .borrow_mut()
                    .note(now, &format!("STOPPED\tPID={old_pid}\tSTATUS={code}"));
            }
            WaitStatus::Signaled(_, sig, _) => {
                let sig = sig as i32;
                self.announce(&format!(
                    "STOPPED\tID={id}\tPID={old_pid}\tSIGNAL={sig}\tINSTANCE={instance}\tCMD={}",
                    child.start_cmd
                ));
                child
                    .events
                    .borrow_mut()
                    .note(now, &format!("STOPPED\tPID={old_pid}\tSIGNAL={sig}"));
            }
            _ => {}
        }
    }

    /// Reap handler for a health-check probe.
    pub(crate) fn health_check_ended(&mut self, check_id: ChildId, status: WaitStatus) {
        let Some(check_rc) = self.children.remove(check_id) else {
            return;
        };
        {
            let mut check = check_rc.borrow_mut();
            if let Some(timer) = check.state_timer.take() {
                self.timers.cancel(timer);
            }
        }
        let main_id = check_rc.borrow().main;
        let Some(main_rc) = main_id.and_then(|m| self.children.get(m)) else {
            return;
        };

        if matches!(status, WaitStatus::Exited(_, 0)) {
            let mut main = main_rc.borrow_mut();
            main.health.failures_consecutive = 0;
            main.health.successes_consecutive += 1;
            main.health.successes_total += 1;
            return;
        }

        let reason = match status {
            WaitStatus::Exited(_, code) => {
                format!("Health check failed with exit code {code}")
            }
            WaitStatus::Signaled(_, sig, _) => {
                format!("Health check exited on signal {}", sig as i32)
            }
            _ => "Health check ended abnormally".to_string(),
        };
        self.record_probe_failure(&main_rc, &reason);
    }

    /// Counts one failed probe and forces a restart after five in a row.
    pub(crate) fn record_probe_failure(
        &mut self,
        main_rc: &Rc<RefCell<ChildRecord>>,
        reason: &str,
    ) {
        let now = self.globals.now;
        let mut main = main_rc.borrow_mut();
        main.events.borrow_mut().note(now, reason);

        main.health.successes_consecutive = 0;
        main.health.failures_consecutive += 1;
        main.health.failures_total += 1;
        main.events.borrow_mut().note(
            now,
            &format!("{} consecutive failures", main.health.failures_consecutive),
        );

        if main.health.failures_consecutive > 4 {
            let id = main.id;
            main.goal = Goal::Restart;
            if let Some(timer) = main.state_timer.take() {
                self.timers.cancel(timer);
            }
            main.state_timer = Some(self.timers.add(0, TimerEvent::ChildState(id)));
        }
    }
}
