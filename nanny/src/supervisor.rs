//! The supervisor: one deterministic scheduler binding timers, readiness,
//! children, signals, and the boundary services.
//!
//! Everything runs on one thread. Each loop pass drains pending child
//! exits, fires due timers, waits (at most one second) for any registered
//! descriptor to become readable, and dispatches what woke it. Callbacks
//! never block and never re-enter the loop.

// Layer 1: Standard library imports
use std::cell::RefCell;
use std::collections::HashMap;
use std::os::fd::{OwnedFd, RawFd};
use std::rc::Rc;

// Layer 2: Third-party crate imports
use chrono::Utc;
use nix::sys::wait::{waitpid, WaitPidFlag, WaitStatus};
use nix::unistd::{getgid, getpid, getuid};
use tracing::{debug, warn};

// Layer 3: Internal module imports
use crate::child::record::{ChildId, ChildKind, ChildRecord, ChildState, Goal};
use crate::child::Children;
use crate::config::NannyConfig;
use crate::env;
use crate::error::{NannyError, NannyResult};
use crate::logbuf::{DrainOutcome, LogDrain, SharedLog};
use crate::net::counter::CounterServer;
use crate::net::http::HttpServer;
use crate::net::udp::{UdpAnnouncer, UdpListener};
use crate::reactor::Reactor;
use crate::signals::{self, SignalBridge};
use crate::timer::TimerHeap;
use crate::util::{hostname, isotime, username};
use crate::variables::VariableSource;

/// Process-wide values visible to status surfaces and the query protocol.
#[derive(Debug)]
pub struct Globals {
    /// Wall-clock epoch seconds, refreshed once per loop pass.
    pub now: i64,
    /// Port of the HTTP status listener, once bound.
    pub http_port: Option<u16>,
    /// Our own pid.
    pub nanny_pid: i32,
    /// Pid of the first registered child while it runs.
    pub child_pid: Option<i32>,
}

impl VariableSource for Globals {
    fn integer(&self, key: &str) -> Option<i64> {
        match key {
            "CHILD_PID" | "PID" => self.child_pid.map(i64::from),
            "GID" => Some(i64::from(getgid().as_raw())),
            "HTTP_PORT" => self.http_port.map(i64::from),
            "NANNY_PID" => (self.nanny_pid > 0).then_some(i64::from(self.nanny_pid)),
            "TIME" => Some(self.now),
            "UID" => Some(i64::from(getuid().as_raw())),
            _ => None,
        }
    }

    fn lookup(&self, key: &str) -> Option<String> {
        if let Some(v) = self.integer(key) {
            return Some(v.to_string());
        }
        match key {
            "HOSTNAME" => Some(hostname()),
            "ISOTIME" => Some(isotime(self.now)),
            "UNAME" | "USERNAME" => Some(username().unwrap_or_else(|| "unknown".to_string())),
            _ => std::env::var(key).ok().filter(|v| !v.is_empty()),
        }
    }
}

/// Payloads carried by timers.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum TimerEvent {
    /// Run the goal handler owning this child.
    ChildState(ChildId),
    /// Fire a health probe for this child.
    HealthProbe(ChildId),
    /// Fire one periodic task.
    Periodic { child: ChildId, task: u32 },
}

/// Tokens carried by fd registrations.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum FdEvent {
    /// The signal self-pipe has wake-up bytes.
    SignalWake,
    /// The HTTP listener has a pending connection.
    HttpAccept,
    /// The multicast socket has a datagram.
    UdpDatagram,
    /// The FIFO counter has bytes.
    CounterFifo,
    /// A child output pipe has bytes.
    Drain(RawFd),
}

/// The supervision engine.
///
/// Owns every mutable structure in the process except the two
/// signal-handler atomics. Construct one, register children, bring up the
/// network surfaces, then [`Supervisor::run`].
pub struct Supervisor {
    pub config: NannyConfig,
    pub globals: Globals,
    pub(crate) timers: TimerHeap<TimerEvent>,
    pub(crate) reactor: Reactor<FdEvent>,
    pub(crate) children: Children,
    drains: HashMap<RawFd, LogDrain>,
    signals: SignalBridge,
    pub(crate) announcer: Option<UdpAnnouncer>,
    udp: Option<UdpListener>,
    pub(crate) http: Option<HttpServer>,
    counter: Option<CounterServer>,
}

impl Supervisor {
    /// Creates a supervisor and installs the signal handlers. No sockets are
    /// opened until [`Supervisor::init_network`].
    pub fn new(config: NannyConfig) -> NannyResult<Self> {
        let signals = SignalBridge::install()?;
        let mut reactor = Reactor::new();
        reactor.register(signals.wake_fd(), FdEvent::SignalWake);

        Ok(Self {
            config,
            globals: Globals {
                now: Utc::now().timestamp(),
                http_port: None,
                nanny_pid: getpid().as_raw(),
                child_pid: None,
            },
            timers: TimerHeap::new(),
            reactor,
            children: Children::new(),
            drains: HashMap::new(),
            signals,
            announcer: None,
            udp: None,
            http: None,
            counter: None,
        })
    }

    // ----------------------------------------------------------------
    // Child registration API. Safe to call only from the loop thread.
    // ----------------------------------------------------------------

    /// Registers a new supervised child and schedules its first start.
    pub fn child_new(&mut self, start_cmd: &str) -> ChildId {
        let child = self.children.create_main(start_cmd, self.config.ring_capacity);
        let mut c = child.borrow_mut();
        c.envp = env::inherited();
        c.state_timer = Some(self.timers.add(0, TimerEvent::ChildState(c.id)));
        c.id
    }

    /// Shared handle to a child record, for embedding programs and status
    /// rendering.
    pub fn child(&self, id: ChildId) -> Option<Rc<RefCell<ChildRecord>>> {
        self.children.get(id)
    }

    /// Sets the shell command tried first when stopping the child.
    pub fn set_stop(&mut self, id: ChildId, cmd: &str) -> NannyResult<()> {
        self.with_child(id, |c| c.stop_cmd = Some(cmd.to_string()))
    }

    /// Sets the periodic health probe command.
    pub fn set_health(&mut self, id: ChildId, cmd: &str) -> NannyResult<()> {
        self.with_child(id, |c| c.health_cmd = Some(cmd.to_string()))
    }

    /// Sets whether the child restarts automatically after an exit.
    pub fn set_restartable(&mut self, id: ChildId, flag: bool) -> NannyResult<()> {
        self.with_child(id, |c| c.restartable = flag)
    }

    /// Sets the instance label used in announcements and status pages.
    pub fn set_instance(&mut self, id: ChildId, instance: &str) -> NannyResult<()> {
        self.with_child(id, |c| c.instance = Some(instance.to_string()))
    }

    /// Replaces the child's environment template.
    pub fn set_envp(&mut self, id: ChildId, envp: Vec<String>) -> NannyResult<()> {
        self.with_child(id, |c| c.envp = envp)
    }

    /// Configures rotating on-disk logs for the child under `dir`.
    pub fn set_logpath(&mut self, id: ChildId, dir: &std::path::Path) -> NannyResult<()> {
        let rotate_bytes = self.config.rotate_bytes;
        self.with_child(id, |c| c.set_logpath(dir, rotate_bytes))
    }

    fn with_child(
        &mut self,
        id: ChildId,
        f: impl FnOnce(&mut ChildRecord),
    ) -> NannyResult<()> {
        let child = self
            .children
            .get(id)
            .ok_or_else(|| NannyError::config(format!("no child with id {id}")))?;
        f(&mut child.borrow_mut());
        Ok(())
    }

    // ----------------------------------------------------------------
    // Boundary services.
    // ----------------------------------------------------------------

    /// Brings up the UDP sockets, the HTTP listener, and the FIFO counter,
    /// then announces the HTTP port to the multicast group.
    pub fn init_network(&mut self) -> NannyResult<()> {
        let announcer =
            UdpAnnouncer::new(self.config.multicast_addr, self.config.multicast_port)?;
        let listener =
            UdpListener::bind_multicast(self.config.multicast_addr, self.config.multicast_port)?;
        self.reactor.register(listener.raw_fd(), FdEvent::UdpDatagram);

        let http = HttpServer::bind_anonymous()?;
        self.reactor.register(http.raw_fd(), FdEvent::HttpAccept);
        self.globals.http_port = Some(http.port());

        // The counter FIFO is best-effort; the supervisor runs fine without.
        match CounterServer::open(self.config.counter_path.clone()) {
            Ok(counter) => {
                self.reactor.register(counter.raw_fd(), FdEvent::CounterFifo);
                self.counter = Some(counter);
            }
            Err(err) => warn!(error = %err, "counter FIFO unavailable"),
        }

        self.announcer = Some(announcer);
        self.udp = Some(listener);
        self.http = Some(http);

        let port = self.globals.http_port.unwrap_or_default();
        self.announce(&format!("HTTP_PORT={port}"));
        Ok(())
    }

    /// Sends one datagram to the multicast group.
    pub fn announce(&self, msg: &str) {
        debug!(message = msg, "announce");
        if let Some(announcer) = &self.announcer {
            announcer.announce(msg);
        }
    }

    // ----------------------------------------------------------------
    // The loop.
    // ----------------------------------------------------------------

    /// Runs until a termination signal arrives.
    pub fn run(&mut self) -> NannyResult<()> {
        while signals::running() {
            self.poll_once()?;
        }
        Ok(())
    }

    /// Drives every child to `stopped`, then returns. Same loop mechanics as
    /// [`Supervisor::run`] with a different exit condition.
    pub fn shutdown(&mut self) -> NannyResult<()> {
        if let Some(counter) = self.counter.take() {
            self.reactor.unregister(counter.raw_fd());
        }
        while self.stop_all_children() > 0 {
            self.poll_once()?;
        }
        Ok(())
    }

    /// One scheduler pass: reap, fire timers, wait for readiness, dispatch.
    pub fn poll_once(&mut self) -> NannyResult<()> {
        self.oversee_children();

        self.globals.now = Utc::now().timestamp();
        let now = self.globals.now;
        for (event, fired_at) in self.timers.tick(now) {
            self.dispatch_timer(event, fired_at);
        }

        // The empty-heap sentinel still waits at most the one-second clip.
        let delay = self
            .timers
            .next_delay(self.globals.now)
            .min(std::time::Duration::from_secs(1));
        let ready = self.reactor.wait(delay)?;
        self.globals.now = Utc::now().timestamp();
        for event in ready {
            self.dispatch_fd(event);
        }
        Ok(())
    }

    /// Reaps exited children if any SIGCHLD arrived since the last pass.
    ///
    /// One pass may reap several children; coalesced signals collapse into
    /// one drain.
    fn oversee_children(&mut self) {
        if !self.signals.take_sigchld() {
            return;
        }
        loop {
            match waitpid(None, Some(WaitPidFlag::WNOHANG)) {
                Ok(WaitStatus::StillAlive) => break,
                Ok(status @ (WaitStatus::Exited(..) | WaitStatus::Signaled(..))) => {
                    let Some(pid) = status.pid() else { break };
                    let Some(child) = self.children.by_pid(pid) else {
                        // A detached helper (stop script, periodic worker).
                        continue;
                    };
                    let (id, kind) = {
                        let c = child.borrow();
                        (c.id, c.kind)
                    };
                    match kind {
                        ChildKind::Main => self.main_child_ended(id, status),
                        ChildKind::HealthCheck => self.health_check_ended(id, status),
                    }
                }
                Ok(_) => continue,
                Err(_) => break,
            }
        }
    }

    /// Moves every child toward `stopped`; returns how many are not there
    /// yet. Called once per shutdown pass, so a child resurrected by a
    /// late health-check verdict is re-marked on the next pass.
    pub fn stop_all_children(&mut self) -> usize {
        let records: Vec<_> = self.children.iter().map(Rc::clone).collect();
        let mut alive = 0;
        for child_rc in records {
            let mut child = child_rc.borrow_mut();
            if child.state == ChildState::Stopped {
                child.goal = Goal::Stopped;
                continue;
            }
            alive += 1;
            if child.goal == Goal::Stopped {
                continue;
            }
            // Periodic tasks go first, before the stop cascade starts.
            for task in child.timed.drain(..) {
                if let Some(timer) = task.timer {
                    self.timers.cancel(timer);
                }
            }
            if let Some(timer) = child.state_timer.take() {
                self.timers.cancel(timer);
            }
            if let Some(timer) = child.health_timer.take() {
                self.timers.cancel(timer);
            }
            let id = child.id;
            child.goal = Goal::Stopped;
            child.state_timer = Some(self.timers.add(0, TimerEvent::ChildState(id)));
        }
        alive
    }

    fn dispatch_timer(&mut self, event: TimerEvent, fired_at: i64) {
        match event {
            TimerEvent::ChildState(id) => self.dispatch_state(id, fired_at),
            TimerEvent::HealthProbe(id) => self.health_probe(id, fired_at),
            TimerEvent::Periodic { child, task } => self.periodic_fire(child, task, fired_at),
        }
    }

    fn dispatch_fd(&mut self, event: FdEvent) {
        match event {
            FdEvent::SignalWake => self.signals.drain_wake(),
            FdEvent::HttpAccept => crate::net::http::accept_and_serve(self),
            FdEvent::UdpDatagram => {
                if let (Some(udp), Some(announcer)) = (&self.udp, &self.announcer) {
                    udp.handle_datagram(&self.globals, announcer);
                }
            }
            FdEvent::CounterFifo => {
                if let Some(counter) = &mut self.counter {
                    counter.pump();
                }
            }
            FdEvent::Drain(fd) => self.pump_drain(fd),
        }
    }

    fn pump_drain(&mut self, fd: RawFd) {
        let outcome = match self.drains.get(&fd) {
            Some(drain) => drain.pump(self.globals.now),
            None => return,
        };
        if outcome == DrainOutcome::Eof {
            self.reactor.unregister(fd);
            self.drains.remove(&fd);
        }
    }

    /// Connects a pipe read end to a log buffer through the reactor.
    pub(crate) fn attach_drain(&mut self, fd: OwnedFd, log: SharedLog) {
        match LogDrain::new(fd, log) {
            Ok(drain) => {
                let raw = drain.raw_fd();
                self.reactor.register(raw, FdEvent::Drain(raw));
                self.drains.insert(raw, drain);
            }
            Err(err) => warn!(error = %err, "failed to attach log drain"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_globals_integer_variables() {
        let globals = Globals {
            now: 1234,
            http_port: Some(51717),
            nanny_pid: 77,
            child_pid: Some(4242),
        };
        assert_eq!(globals.integer("PID"), Some(4242));
        assert_eq!(globals.integer("CHILD_PID"), Some(4242));
        assert_eq!(globals.integer("HTTP_PORT"), Some(51717));
        assert_eq!(globals.integer("NANNY_PID"), Some(77));
        assert_eq!(globals.integer("TIME"), Some(1234));
        assert_eq!(globals.integer("NOPE"), None);
    }

    #[test]
    fn test_globals_unset_child_pid_is_absent() {
        let globals = Globals {
            now: 0,
            http_port: None,
            nanny_pid: 77,
            child_pid: None,
        };
        assert_eq!(globals.integer("PID"), None);
        assert_eq!(globals.integer("HTTP_PORT"), None);
    }

    #[test]
    fn test_globals_lookup_formats_and_falls_back() {
        let globals = Globals {
            now: 0,
            http_port: Some(8080),
            nanny_pid: 1,
            child_pid: None,
        };
        assert_eq!(globals.lookup("HTTP_PORT").as_deref(), Some("8080"));
        assert_eq!(globals.lookup("ISOTIME").as_deref(), Some("1970-01-01T00:00:00Z"));
        std::env::set_var("NANNY_TEST_FALLBACK", "from-env");
        assert_eq!(
            globals.lookup("NANNY_TEST_FALLBACK").as_deref(),
            Some("from-env")
        );
        std::env::remove_var("NANNY_TEST_FALLBACK");
    }
}
