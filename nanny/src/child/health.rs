//! Periodic health probing of supervised children.
//!
//! Each child with a probe command gets a health timer at a fixed cadence.
//! A firing spawns a transient check record ([`super::record::ChildKind::HealthCheck`])
//! whose output interleaves into the parent's event narrative; the check's
//! own goal handler enforces the probe timeout, and the reap path scores the
//! result.

// Layer 1: Standard library imports
use std::rc::Rc;

// Layer 3: Internal module imports
use super::record::ChildId;
use crate::supervisor::{Supervisor, TimerEvent};

impl Supervisor {
    /// Handles one firing of a child's health timer.
    ///
    /// Always reschedules the next probe off the scheduled time, so the
    /// cadence doesn't drift. A child without a probe command passes by
    /// definition.
    pub(crate) fn health_probe(&mut self, id: ChildId, fired_at: i64) {
        let Some(child_rc) = self.children.get(id) else {
            return;
        };

        let next = fired_at + self.config.health_period;
        let cmd = {
            let mut child = child_rc.borrow_mut();
            let child = &mut *child;
            child.health_timer = Some(self.timers.add(next, TimerEvent::HealthProbe(id)));

            match &child.health_cmd {
                None => {
                    child.health.successes_total += 1;
                    child.health.successes_consecutive += 1;
                    return;
                }
                Some(cmd) => cmd.clone(),
            }
        };

        let (envp, events) = {
            let child = child_rc.borrow();
            (child.envp.clone(), Rc::clone(&child.events))
        };
        let check_rc = self.children.create_check(id, &cmd, envp, &events);
        let check_id = check_rc.borrow().id;
        check_rc.borrow_mut().state_timer =
            Some(self.timers.add(0, TimerEvent::ChildState(check_id)));
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use crate::child::record::{ChildKind, ChildState, Goal};
    use crate::config::NannyConfig;

    fn supervisor() -> Supervisor {
        Supervisor::new(NannyConfig::default()).unwrap()
    }

    #[test]
    fn test_nil_probe_counts_as_success() {
        let mut sup = supervisor();
        let id = sup.child_new("/bin/sleep 100000");

        sup.health_probe(id, 1000);
        sup.health_probe(id, 1060);

        let child = sup.child(id).unwrap();
        let c = child.borrow();
        assert_eq!(c.health.successes_total, 2);
        assert_eq!(c.health.successes_consecutive, 2);
        // No check record was created.
        assert_eq!(sup.children.len(), 1);
    }

    #[test]
    fn test_probe_reschedules_off_scheduled_time() {
        let mut sup = supervisor();
        let id = sup.child_new("/bin/sleep 100000");

        sup.health_probe(id, 1000);

        let child = sup.child(id).unwrap();
        let timer = child.borrow().health_timer.unwrap();
        assert_eq!(sup.timers.expiration(timer), Some(1060));
    }

    #[test]
    fn test_probe_spawns_check_record_aliasing_events() {
        let mut sup = supervisor();
        let id = sup.child_new("/bin/sleep 100000");
        sup.set_health(id, "curl -fs localhost:8080/ping").unwrap();

        sup.health_probe(id, 1000);

        assert_eq!(sup.children.len(), 2);
        let check = sup
            .children
            .iter()
            .find(|c| c.borrow().kind == ChildKind::HealthCheck)
            .map(Rc::clone)
            .unwrap();
        let check = check.borrow();
        assert_eq!(check.main, Some(id));
        assert_eq!(check.goal, Goal::HealthCheck);
        assert_eq!(check.state, ChildState::New);
        assert_eq!(check.start_cmd, "curl -fs localhost:8080/ping");
        // Scheduled to start immediately.
        let timer = check.state_timer.unwrap();
        assert_eq!(sup.timers.expiration(timer), Some(0));

        let parent = sup.child(id).unwrap();
        assert!(Rc::ptr_eq(&check.events, &parent.borrow().events));
    }
}
