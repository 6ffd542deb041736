//! The live-children list.

// Layer 1: Standard library imports
use std::cell::RefCell;
use std::rc::Rc;

// Layer 2: Third-party crate imports
use nix::unistd::Pid;

// Layer 3: Internal module imports
use super::record::{ChildId, ChildRecord};
use crate::logbuf::SharedLog;

/// All live child records, oldest first.
///
/// Traversal order is part of the interface: status pages render
/// oldest→youngest, and pid matching during reaps scans the same way.
/// Records are shared handles so goal handlers can hold one across timer
/// mutations.
#[derive(Debug, Default)]
pub struct Children {
    list: Vec<Rc<RefCell<ChildRecord>>>,
    next_id: ChildId,
}

impl Children {
    /// Creates an empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of live records (checks included).
    pub fn len(&self) -> usize {
        self.list.len()
    }

    /// True when no records exist.
    pub fn is_empty(&self) -> bool {
        self.list.is_empty()
    }

    /// Creates and registers a main-child record.
    pub fn create_main(&mut self, start_cmd: &str, ring_capacity: usize) -> Rc<RefCell<ChildRecord>> {
        let id = self.take_id();
        let child = Rc::new(RefCell::new(ChildRecord::new_main(id, start_cmd, ring_capacity)));
        self.list.push(Rc::clone(&child));
        child
    }

    /// Creates and registers a health-check record probing `main_id`.
    pub fn create_check(
        &mut self,
        main_id: ChildId,
        health_cmd: &str,
        envp: Vec<String>,
        parent_events: &SharedLog,
    ) -> Rc<RefCell<ChildRecord>> {
        let id = self.take_id();
        let check = Rc::new(RefCell::new(ChildRecord::new_check(
            id,
            main_id,
            health_cmd,
            envp,
            parent_events,
        )));
        self.list.push(Rc::clone(&check));
        check
    }

    /// Looks up a record by id.
    pub fn get(&self, id: ChildId) -> Option<Rc<RefCell<ChildRecord>>> {
        self.list
            .iter()
            .find(|c| c.borrow().id == id)
            .map(Rc::clone)
    }

    /// Looks up a record by pid, scanning oldest→youngest.
    pub fn by_pid(&self, pid: Pid) -> Option<Rc<RefCell<ChildRecord>>> {
        self.list
            .iter()
            .find(|c| c.borrow().pid == Some(pid))
            .map(Rc::clone)
    }

    /// Removes a record (used when a health check is reaped).
    pub fn remove(&mut self, id: ChildId) -> Option<Rc<RefCell<ChildRecord>>> {
        let i = self.list.iter().position(|c| c.borrow().id == id)?;
        Some(self.list.remove(i))
    }

    /// Iterates oldest→youngest.
    pub fn iter(&self) -> impl Iterator<Item = &Rc<RefCell<ChildRecord>>> {
        self.list.iter()
    }

    fn take_id(&mut self) -> ChildId {
        let id = self.next_id;
        self.next_id += 1;
        id
    }
}
