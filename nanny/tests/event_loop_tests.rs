//! End-to-end scheduler tests: real children under a real event loop.
//!
//! The supervisors here reap with `waitpid(ANY)`, so the tests serialize on
//! one lock to keep their children apart.

#![allow(clippy::unwrap_used)]

use std::sync::Mutex;
use std::time::{Duration, Instant};

use nanny::{ChildState, NannyConfig, Supervisor};

static LOOP_LOCK: Mutex<()> = Mutex::new(());

/// Polls the supervisor until `pred` holds or the deadline passes.
fn drive_until(
    sup: &mut Supervisor,
    deadline: Duration,
    mut pred: impl FnMut(&Supervisor) -> bool,
) -> bool {
    let start = Instant::now();
    while start.elapsed() < deadline {
        sup.poll_once().unwrap();
        if pred(sup) {
            return true;
        }
    }
    false
}

#[test]
fn test_short_lived_child_runs_captures_output_and_stops() {
    let _guard = LOOP_LOCK.lock().unwrap();
    let mut sup = Supervisor::new(NannyConfig::default()).unwrap();
    let id = sup.child_new("echo nanny-e2e-marker");

    let settled = drive_until(&mut sup, Duration::from_secs(15), |sup| {
        let child = sup.child(id).unwrap();
        let c = child.borrow();
        c.start_count == 1 && c.state == ChildState::Stopped
    });
    assert!(settled, "child never ran to completion");

    let child = sup.child(id).unwrap();
    let c = child.borrow();
    assert!(c.pid.is_none());
    assert!(!c.running);
    assert_eq!(c.failures, 1);
    assert_eq!(c.restart_delay, 1);
    assert!(c.last_start.is_some());
    assert!(c.last_stop.is_some());

    let stdout = String::from_utf8(c.stdout.borrow().dump_raw()).unwrap();
    assert!(stdout.contains("nanny-e2e-marker"), "stdout was: {stdout:?}");

    let events = String::from_utf8(c.events.borrow().dump_raw()).unwrap();
    assert!(events.contains("STARTING\tPID="), "events were: {events:?}");
    assert!(events.contains("STOPPED\tPID="), "events were: {events:?}");
    assert!(events.contains("STATUS=0"), "events were: {events:?}");
}

#[test]
fn test_crashing_child_is_restarted_with_backoff() {
    let _guard = LOOP_LOCK.lock().unwrap();
    let mut sup = Supervisor::new(NannyConfig::default()).unwrap();
    let id = sup.child_new("exit 7");
    sup.set_restartable(id, true).unwrap();

    // First start fails fast; the restart lands one second later.
    let restarted = drive_until(&mut sup, Duration::from_secs(20), |sup| {
        let child = sup.child(id).unwrap();
        let started_twice = child.borrow().start_count >= 2;
        started_twice
    });
    assert!(restarted, "child was never restarted");

    let (failures, delay) = {
        let child = sup.child(id).unwrap();
        let c = child.borrow();
        (c.failures, c.restart_delay)
    };
    assert!(failures >= 2);
    // Two failures double the backoff past its floor.
    assert!(delay >= 2, "restart_delay was {delay}");

    let events = {
        let child = sup.child(id).unwrap();
        let c = child.borrow();
        let dump = c.events.borrow().dump_raw();
        String::from_utf8(dump).unwrap()
    };
    assert!(events.contains("STATUS=7"), "events were: {events:?}");
    assert!(events.contains("RESTARTING\tPID="), "events were: {events:?}");

    sup.shutdown().unwrap();
}

#[test]
fn test_shutdown_terminates_running_child() {
    let _guard = LOOP_LOCK.lock().unwrap();
    let mut sup = Supervisor::new(NannyConfig::default()).unwrap();
    let id = sup.child_new("exec sleep 600");
    sup.set_restartable(id, true).unwrap();

    let started = drive_until(&mut sup, Duration::from_secs(15), |sup| {
        let child = sup.child(id).unwrap();
        let c = child.borrow();
        c.state == ChildState::Starting && c.pid.is_some()
    });
    assert!(started, "child never started");

    sup.shutdown().unwrap();

    let child = sup.child(id).unwrap();
    let c = child.borrow();
    assert_eq!(c.state, ChildState::Stopped);
    assert!(c.pid.is_none());
    assert!(!c.running);

    let events = String::from_utf8(c.events.borrow().dump_raw()).unwrap();
    assert!(
        events.contains("STOPPING\tPID="),
        "events were: {events:?}"
    );
}

#[test]
fn test_stopped_children_restart_only_after_backoff_window() {
    let _guard = LOOP_LOCK.lock().unwrap();
    let mut sup = Supervisor::new(NannyConfig::default()).unwrap();
    let id = sup.child_new("exit 1");
    sup.set_restartable(id, true).unwrap();

    // Catch the child inside its backoff window.
    let waiting = drive_until(&mut sup, Duration::from_secs(15), |sup| {
        let child = sup.child(id).unwrap();
        let c = child.borrow();
        c.start_count == 1 && c.state == ChildState::Restarting
    });
    assert!(waiting, "child never entered the backoff window");

    let child = sup.child(id).unwrap();
    assert!(child.borrow().state_timer.is_some());

    sup.shutdown().unwrap();
    assert_eq!(child.borrow().state, ChildState::Stopped);
}
