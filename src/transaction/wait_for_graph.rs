use std::collections::{HashMap, HashSet};

use super::LockerId;

pub(crate) struct WaitForGraph {
    // key: locker id, value: the lockers that the key locker is waiting for
    graph: HashMap<LockerId, HashSet<LockerId>>,
}

impl WaitForGraph {
    pub(crate) fn new() -> Self {
        Self {
            graph: HashMap::new(),
        }
    }

    /// Replace the outgoing edges of `from`.
    pub(crate) fn set_edges(&mut self, from: LockerId, to: Vec<LockerId>) {
        let targets: HashSet<LockerId> = to.into_iter().filter(|t| *t != from).collect();
        if targets.is_empty() {
            self.graph.remove(&from);
        } else {
            self.graph.insert(from, targets);
        }
    }

    pub(crate) fn remove_waiter(&mut self, locker: LockerId) {
        self.graph.remove(&locker);
    }

    pub(crate) fn n_waiters(&self) -> usize {
        self.graph.len()
    }

    /// Find a cycle that goes through `start`, returns the lockers on
    /// it (starting with `start`).
    pub(crate) fn find_cycle_from(&self, start: LockerId) -> Option<Vec<LockerId>> {
        let mut visited = HashSet::new();
        let mut path = vec![start];
        if self.dfs(start, start, &mut visited, &mut path) {
            return Some(path);
        }
        None
    }

    fn dfs(
        &self,
        start: LockerId,
        current: LockerId,
        visited: &mut HashSet<LockerId>,
        path: &mut Vec<LockerId>,
    ) -> bool {
        if !visited.insert(current) {
            return false;
        }

        if let Some(targets) = self.graph.get(&current) {
            for &t in targets {
                if t == start {
                    return true;
                }
                path.push(t);
                if self.dfs(start, t, visited, path) {
                    return true;
                }
                path.pop();
            }
        }

        false
    }

    /// Check if there is any cycle in the wait-for graph.
    pub(crate) fn exists_cycle(&self) -> bool {
        self.graph
            .keys()
            .any(|&locker| self.find_cycle_from(locker).is_some())
    }
}
