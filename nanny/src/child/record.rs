//! The per-child bookkeeping record.

// Layer 1: Standard library imports
use std::fmt;
use std::path::Path;
use std::rc::Rc;

// Layer 2: Third-party crate imports
use nix::unistd::Pid;
use serde::Serialize;

// Layer 3: Internal module imports
use crate::logbuf::{LogBuffer, SharedLog};
use crate::timer::TimerId;

/// Stable child identity: a small integer that never changes, even as the
/// pid does.
pub type ChildId = u32;

/// Whether a record is a supervised main child or a transient health check.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChildKind {
    /// A long-running supervised process.
    Main,
    /// A bounded-lifetime probe of some main child.
    HealthCheck,
}

/// Lifecycle state of a child.
///
/// The serialized forms are part of the status surfaces and the on-disk
/// event logs, so they are stable strings rather than derived names.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum ChildState {
    /// Created, not yet started.
    New,
    /// Exited; waiting out the restart backoff.
    Restarting,
    /// Started recently, still on probation.
    Starting,
    /// Survived probation.
    Running,
    /// Custom stop command dispatched.
    StoppingCustom,
    /// SIGTERM sent.
    StoppingTerm,
    /// SIGKILL sent.
    StoppingKill,
    /// Not running and not scheduled to run.
    Stopped,
}

impl ChildState {
    /// Stable serialized label.
    pub fn as_str(&self) -> &'static str {
        match self {
            ChildState::New => "new",
            ChildState::Restarting => "waiting to restart after failure",
            ChildState::Starting => "starting (on probation)",
            ChildState::Running => "running",
            ChildState::StoppingCustom => "stopping(custom)",
            ChildState::StoppingTerm => "stopping(sigterm)",
            ChildState::StoppingKill => "stopping(sigkill)",
            ChildState::Stopped => "stopped",
        }
    }
}

impl fmt::Display for ChildState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// The state machine currently owning a record.
///
/// Replacing the whole machine, rather than encoding every transition in
/// one, is the core idiom here: supervision flips a child between "make it
/// run" and "make it stop" by swapping goals.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Goal {
    /// Keep the child running; restart with backoff when it dies.
    Running,
    /// Walk the stop cascade until the child is gone.
    Stopped,
    /// Stop if needed, then hand back to [`Goal::Running`].
    Restart,
    /// Drive a health-check probe: start it, kill it on timeout.
    HealthCheck,
}

/// Health probe counters.
#[derive(Debug, Default, Clone, Copy, Serialize)]
pub struct HealthCounters {
    pub failures_consecutive: u32,
    pub failures_total: u32,
    pub successes_consecutive: u32,
    pub successes_total: u32,
}

/// Everything the supervisor knows about one child.
#[derive(Debug)]
pub struct ChildRecord {
    /// Stable id, monotonic per supervisor lifetime.
    pub id: ChildId,
    pub kind: ChildKind,

    /// Optional instance label for announcements and status pages.
    pub instance: Option<String>,
    /// Shell command that starts the child.
    pub start_cmd: String,
    /// Optional shell command tried first when stopping.
    pub stop_cmd: Option<String>,
    /// Optional shell command probing liveness.
    pub health_cmd: Option<String>,
    /// Restart automatically after an exit.
    pub restartable: bool,
    /// `KEY=VALUE` environment template; never mutated for a spawn.
    pub envp: Vec<String>,

    /// Current pid; `None` exactly when the child is not running.
    pub pid: Option<Pid>,
    /// Believed-running flag; tracks `pid`.
    pub running: bool,
    pub state: ChildState,
    /// State machine owning this record.
    pub goal: Goal,
    /// Pending state-transition timer, at most one.
    pub state_timer: Option<TimerId>,
    /// Pending health-probe timer, at most one.
    pub health_timer: Option<TimerId>,
    pub last_start: Option<i64>,
    pub last_stop: Option<i64>,
    pub start_count: u32,
    /// Consecutive failures since the last clean probation exit.
    pub failures: u32,
    /// Restart backoff in seconds. Starts at zero; the exit handler's
    /// double-and-clamp puts it in [1, 3600] from the first exit onward.
    pub restart_delay: i64,

    pub health: HealthCounters,

    /// Captured stdout. For a health check this aliases the parent's events.
    pub stdout: SharedLog,
    /// Captured stderr. For a health check this aliases the parent's events.
    pub stderr: SharedLog,
    /// Lifecycle narrative plus health-check output.
    pub events: SharedLog,

    /// For a health check, the main child it probes.
    pub main: Option<ChildId>,
    /// Periodic tasks attached to this child.
    pub timed: Vec<PeriodicTask>,
    pub(crate) next_task_id: u32,
}

/// One scheduled auxiliary task.
#[derive(Debug)]
pub struct PeriodicTask {
    pub id: u32,
    /// Seconds between firings.
    pub interval: i64,
    /// Shell command run at each firing.
    pub cmd: String,
    /// Last scheduled firing time.
    pub last: Option<i64>,
    /// Pending firing timer.
    pub timer: Option<TimerId>,
}

impl ChildRecord {
    /// Creates a main-child record with three fresh ring buffers.
    pub fn new_main(id: ChildId, start_cmd: &str, ring_capacity: usize) -> Self {
        Self {
            id,
            kind: ChildKind::Main,
            instance: None,
            start_cmd: start_cmd.to_string(),
            stop_cmd: None,
            health_cmd: None,
            restartable: false,
            envp: Vec::new(),
            pid: None,
            running: false,
            state: ChildState::New,
            goal: Goal::Running,
            state_timer: None,
            health_timer: None,
            last_start: None,
            last_stop: None,
            start_count: 0,
            failures: 0,
            restart_delay: 0,
            health: HealthCounters::default(),
            stdout: LogBuffer::shared(ring_capacity),
            stderr: LogBuffer::shared(ring_capacity),
            events: LogBuffer::shared(ring_capacity),
            main: None,
            timed: Vec::new(),
            next_task_id: 0,
        }
    }

    /// Creates a health-check record probing `main_id`. All three stream
    /// slots alias the parent's event buffer, so probe output interleaves
    /// into the parent's narrative.
    pub fn new_check(
        id: ChildId,
        main_id: ChildId,
        health_cmd: &str,
        envp: Vec<String>,
        parent_events: &SharedLog,
    ) -> Self {
        Self {
            id,
            kind: ChildKind::HealthCheck,
            instance: None,
            start_cmd: health_cmd.to_string(),
            stop_cmd: None,
            health_cmd: None,
            restartable: false,
            envp,
            pid: None,
            running: false,
            state: ChildState::New,
            goal: Goal::HealthCheck,
            state_timer: None,
            health_timer: None,
            last_start: None,
            last_stop: None,
            start_count: 0,
            failures: 0,
            restart_delay: 0,
            health: HealthCounters::default(),
            stdout: Rc::clone(parent_events),
            stderr: Rc::clone(parent_events),
            events: Rc::clone(parent_events),
            main: Some(main_id),
            timed: Vec::new(),
            next_task_id: 0,
        }
    }

    /// Configures on-disk spillover for the three buffers under `dir`.
    pub fn set_logpath(&mut self, dir: &Path, rotate_bytes: u64) {
        self.stdout
            .borrow_mut()
            .set_base_path(dir.join("nanny_stdout.log"), rotate_bytes);
        self.stderr
            .borrow_mut()
            .set_base_path(dir.join("nanny_stderr.log"), rotate_bytes);
        self.events
            .borrow_mut()
            .set_base_path(dir.join("nanny_event.log"), rotate_bytes);
    }

    /// True while the stop cascade is underway.
    pub fn is_stopping(&self) -> bool {
        matches!(
            self.state,
            ChildState::StoppingCustom | ChildState::StoppingTerm | ChildState::StoppingKill
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_new_main_initial_shape() {
        let child = ChildRecord::new_main(0, "/bin/sleep 100000", 1024);
        assert_eq!(child.state, ChildState::New);
        assert_eq!(child.goal, Goal::Running);
        assert!(child.pid.is_none());
        assert!(!child.running);
        assert_eq!(child.restart_delay, 0);
        assert_eq!(child.start_count, 0);
        assert!(child.main.is_none());
    }

    #[test]
    fn test_new_check_aliases_parent_events() {
        let parent = ChildRecord::new_main(0, "/bin/true", 1024);
        let check = ChildRecord::new_check(1, 0, "probe", Vec::new(), &parent.events);

        assert_eq!(check.kind, ChildKind::HealthCheck);
        assert_eq!(check.main, Some(0));
        assert!(Rc::ptr_eq(&check.stdout, &parent.events));
        assert!(Rc::ptr_eq(&check.stderr, &parent.events));
        assert!(Rc::ptr_eq(&check.events, &parent.events));
        // Parent's own buffer plus three aliases.
        assert_eq!(Rc::strong_count(&parent.events), 4);
    }

    #[test]
    fn test_state_labels_are_stable() {
        assert_eq!(ChildState::New.as_str(), "new");
        assert_eq!(
            ChildState::Restarting.as_str(),
            "waiting to restart after failure"
        );
        assert_eq!(ChildState::Starting.as_str(), "starting (on probation)");
        assert_eq!(ChildState::StoppingCustom.as_str(), "stopping(custom)");
        assert_eq!(ChildState::StoppingTerm.as_str(), "stopping(sigterm)");
        assert_eq!(ChildState::StoppingKill.as_str(), "stopping(sigkill)");
        assert_eq!(ChildState::Stopped.as_str(), "stopped");
    }

    #[test]
    fn test_is_stopping() {
        let mut child = ChildRecord::new_main(0, "x", 64);
        assert!(!child.is_stopping());
        child.state = ChildState::StoppingTerm;
        assert!(child.is_stopping());
    }
}
