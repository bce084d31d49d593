use std::{
    collections::HashMap,
    fmt,
    thread::{self, ThreadId},
};

use parking_lot::Mutex;

/// Debug registry of the latches each thread currently holds.
///
/// Every environment owns its own table, so two environments in one
/// process never see each other's latches.
#[derive(Default)]
pub struct LatchTable {
    held: Mutex<HashMap<ThreadId, Vec<String>>>,
}

impl LatchTable {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn note_latch(&self, name: &str) {
        self.held
            .lock()
            .entry(thread::current().id())
            .or_default()
            .push(name.to_string());
    }

    /// Returns false if the current thread wasn't recorded as holding
    /// the latch.
    pub fn unnote_latch(&self, name: &str) -> bool {
        let me = thread::current().id();
        let mut held = self.held.lock();
        let latches = match held.get_mut(&me) {
            Some(v) => v,
            None => return false,
        };

        let found = match latches.iter().rposition(|n| n == name) {
            Some(pos) => {
                latches.remove(pos);
                true
            }
            None => false,
        };
        if latches.is_empty() {
            held.remove(&me);
        }
        found
    }

    /// Number of latches the current thread holds.
    pub fn count_latches_held(&self) -> usize {
        self.held
            .lock()
            .get(&thread::current().id())
            .map_or(0, |v| v.len())
    }

    pub fn latches_held_to_string(&self) -> String {
        let held = self.held.lock();
        match held.get(&thread::current().id()) {
            Some(v) => v.join(", "),
            None => String::new(),
        }
    }

    pub fn clear(&self) {
        self.held.lock().clear();
    }
}

impl fmt::Display for LatchTable {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        let mut depiction = "\n".to_string();
        for (thread, latches) in self.held.lock().iter() {
            depiction.push_str(&format!("\t{:?} -> [{}]\n", thread, latches.join(", ")));
        }
        return write!(f, "{}", depiction);
    }
}

impl fmt::Debug for LatchTable {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        return write!(f, "{}", self);
    }
}
