use std::{
    collections::HashMap,
    sync::{
        atomic::{AtomicU64, Ordering},
        Arc, Weak,
    },
    thread::{self, ThreadId},
    time::{Duration, Instant},
};

use itertools::Itertools;
use log::{debug, warn};
use parking_lot::{Condvar, Mutex, MutexGuard};

use super::{
    lock::{Lock, LockGrantType, LockInfo, LockType, LockerId, ResourceId},
    locker::{Locker, LockerState},
    wait_for_graph::WaitForGraph,
};
use crate::{
    config::{DeadlockDetection, EnvConfig, LockingMode},
    error::SmallError,
    types::SmallResult,
};

/// Ids of lockers that don't belong to a transaction start here, so
/// they never collide with transaction ids.
const FIRST_NON_TXN_LOCKER_ID: LockerId = 1 << 63;

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct LockStats {
    pub n_total_locks: usize,
    pub n_owners: usize,
    pub n_waiters: usize,
    pub n_requests: u64,
    pub n_waits: u64,
    pub n_timeouts: u64,
    pub n_deadlocks: u64,

    /// Entries of the thread locker registry. Entries of finished
    /// threads stay until the next thread locker is created.
    pub n_thread_lockers: usize,
}

#[derive(Default)]
struct LockTable {
    locks: Mutex<HashMap<ResourceId, Lock>>,

    // notified whenever a lock of this table changes owners
    cond: Condvar,
}

type Locks<'a> = MutexGuard<'a, HashMap<ResourceId, Lock>>;

/// Grants logical locks on resource ids to lockers.
///
/// The locks are spread over `n_lock_tables` independent tables, a
/// request only ever holds the mutex of the table its resource hashes
/// to.
pub struct LockManager {
    tables: Vec<LockTable>,
    locking: LockingMode,
    detection: DeadlockDetection,
    default_timeout: Duration,
    waits_for: Mutex<WaitForGraph>,

    next_locker_id: AtomicU64,
    thread_lockers: Mutex<HashMap<ThreadId, (LockerId, Weak<Mutex<LockerState>>)>>,

    n_requests: AtomicU64,
    n_waits: AtomicU64,
    n_timeouts: AtomicU64,
    n_deadlocks: AtomicU64,
}

impl LockManager {
    pub fn new(config: &EnvConfig) -> Self {
        let n = config.n_lock_tables.max(1);
        Self {
            tables: (0..n).map(|_| LockTable::default()).collect(),
            locking: config.locking,
            detection: config.deadlock_detection,
            default_timeout: config.lock_timeout(),
            waits_for: Mutex::new(WaitForGraph::new()),
            next_locker_id: AtomicU64::new(FIRST_NON_TXN_LOCKER_ID),
            thread_lockers: Mutex::new(HashMap::new()),
            n_requests: AtomicU64::new(0),
            n_waits: AtomicU64::new(0),
            n_timeouts: AtomicU64::new(0),
            n_deadlocks: AtomicU64::new(0),
        }
    }

    pub fn locking(&self) -> LockingMode {
        self.locking
    }

    pub fn default_timeout(&self) -> Duration {
        self.default_timeout
    }

    pub(crate) fn new_locker_id(&self) -> LockerId {
        self.next_locker_id.fetch_add(1, Ordering::Relaxed)
    }

    /// The id and lock bookkeeping shared by every thread locker of the
    /// calling thread.
    pub(crate) fn thread_locker_state(&self) -> (LockerId, Arc<Mutex<LockerState>>) {
        let me = thread::current().id();
        let mut registry = self.thread_lockers.lock();
        if let Some((id, weak)) = registry.get(&me) {
            if let Some(state) = weak.upgrade() {
                return (*id, state);
            }
        }

        // threads that are gone left their entry behind
        registry.retain(|_, (_, weak)| weak.strong_count() > 0);

        let id = self.new_locker_id();
        let state = Arc::new(Mutex::new(LockerState::default()));
        registry.insert(me, (id, Arc::downgrade(&state)));
        (id, state)
    }

    fn table(&self, resource: &ResourceId) -> &LockTable {
        &self.tables[resource.shard(self.tables.len())]
    }

    /// Request a lock on the given resource. Blocks unless `no_wait` is
    /// set, in which case a conflicting request returns `Denied`.
    ///
    /// `timeout == None` waits without limit.
    pub fn lock(
        &self,
        resource: ResourceId,
        locker: &Locker,
        lock_type: LockType,
        no_wait: bool,
        timeout: Option<Duration>,
    ) -> SmallResult<LockGrantType> {
        if self.locking == LockingMode::Disabled {
            return Ok(LockGrantType::GrantedNew);
        }

        self.n_requests.fetch_add(1, Ordering::Relaxed);
        let request = LockInfo {
            locker: locker.id(),
            buddy: locker.buddy_id(),
            lock_type,
        };

        let table = self.table(&resource);
        let mut locks = table.locks.lock();
        let lock = locks.entry(resource).or_default();

        // step 1: the locker owns the lock already, maybe an upgrade
        if let Some(owned) = lock.owner(request.locker).copied() {
            if owned.lock_type.covers(lock_type) {
                return Ok(LockGrantType::GrantedExisting);
            }

            let upgraded = LockInfo {
                lock_type: owned.lock_type.upgrade(lock_type),
                ..request
            };
            if !lock.conflicts(&upgraded) {
                if let Some(o) = lock.owner_mut(request.locker) {
                    o.lock_type = upgraded.lock_type;
                }
                return Ok(LockGrantType::GrantedUpgrade);
            }
            if no_wait {
                return Ok(LockGrantType::Denied);
            }

            // upgrades go in front of the new owners, otherwise a waiter
            // behind would wait for us while we wait for it. Among
            // themselves upgrades keep arrival order.
            let n_upgrades = lock
                .waiters
                .iter()
                .take_while(|w| lock.owner(w.locker).is_some())
                .count();
            lock.waiters.insert(n_upgrades, upgraded);
            return self.wait(table, locks, resource, upgraded, timeout, LockGrantType::GrantedUpgrade);
        }

        // step 2: a new owner
        //
        // A request that shares with a current owner (e.g. a buddy of the
        // write owner) doesn't queue behind unrelated waiters.
        let shares_with_owner = lock.owners.iter().any(|o| o.shares_with(&request));
        if !lock.conflicts(&request) && (lock.waiters.is_empty() || shares_with_owner) {
            lock.owners.push(request);
            return Ok(LockGrantType::GrantedNew);
        }

        if no_wait {
            if lock.is_empty() {
                locks.remove(&resource);
            }
            return Ok(LockGrantType::Denied);
        }

        lock.waiters.push_back(request);
        self.wait(table, locks, resource, request, timeout, LockGrantType::GrantedNew)
    }

    fn wait(
        &self,
        table: &LockTable,
        mut locks: Locks,
        resource: ResourceId,
        request: LockInfo,
        timeout: Option<Duration>,
        grant: LockGrantType,
    ) -> SmallResult<LockGrantType> {
        self.n_waits.fetch_add(1, Ordering::Relaxed);
        let deadline = timeout.map(|t| Instant::now() + t);

        loop {
            let lock = locks.get(&resource).ok_or_else(|| {
                SmallError::new(&format!("lock on {} vanished while waiting", resource))
            })?;

            if lock.is_granted(&request) {
                if self.detection == DeadlockDetection::WaitsForGraph {
                    self.waits_for.lock().remove_waiter(request.locker);
                }
                return Ok(grant);
            }

            if self.detection == DeadlockDetection::WaitsForGraph {
                let blockers = lock.blockers(&request);
                let mut graph = self.waits_for.lock();
                graph.set_edges(request.locker, blockers);
                if let Some(cycle) = graph.find_cycle_from(request.locker) {
                    graph.remove_waiter(request.locker);
                    drop(graph);

                    let depiction = Self::describe(&resource, locks.get(&resource));
                    Self::abandon(&mut locks, &resource, &request);
                    table.cond.notify_all();
                    drop(locks);

                    self.n_deadlocks.fetch_add(1, Ordering::Relaxed);
                    let err = SmallError::Deadlock(format!(
                        "locker {} requesting {:?} on {}, cycle: {:?}, lock: {}",
                        request.locker, request.lock_type, resource, cycle, depiction,
                    ));
                    warn!("{}\nlock table: {}", err, self.lock_table_string());
                    return Err(err);
                }
            }

            match deadline {
                None => table.cond.wait(&mut locks),
                Some(deadline) => {
                    if !table.cond.wait_until(&mut locks, deadline).timed_out() {
                        continue;
                    }

                    // the grant may have raced with the timeout
                    if let Some(lock) = locks.get(&resource) {
                        if lock.is_granted(&request) {
                            continue;
                        }
                    }

                    let depiction = Self::describe(&resource, locks.get(&resource));
                    Self::abandon(&mut locks, &resource, &request);
                    table.cond.notify_all();
                    drop(locks);
                    if self.detection == DeadlockDetection::WaitsForGraph {
                        self.waits_for.lock().remove_waiter(request.locker);
                    }

                    self.n_timeouts.fetch_add(1, Ordering::Relaxed);
                    let err = SmallError::LockTimeout(format!(
                        "locker {} requesting {:?} on {} after {:?}, lock: {}",
                        request.locker,
                        request.lock_type,
                        resource,
                        timeout.unwrap_or_default(),
                        depiction,
                    ));
                    warn!("{}\nlock table: {}", err, self.lock_table_string());
                    return Err(err);
                }
            }
        }
    }

    /// Drop a waiting request and let the waiters behind it move on.
    fn abandon(locks: &mut Locks, resource: &ResourceId, request: &LockInfo) {
        if let Some(lock) = locks.get_mut(resource) {
            if let Some(pos) = lock.waiters.iter().position(|w| w == request) {
                lock.waiters.remove(pos);
            }
            lock.promote_waiters();
            if lock.is_empty() {
                locks.remove(resource);
            }
        }
    }

    /// Release the lock the locker owns on the resource, returns whether
    /// it owned one.
    pub fn release(&self, resource: ResourceId, locker: LockerId) -> bool {
        if self.locking == LockingMode::Disabled {
            return false;
        }

        let table = self.table(&resource);
        let mut locks = table.locks.lock();
        let released = match locks.get_mut(&resource) {
            Some(lock) => {
                let before = lock.owners.len();
                lock.owners.retain(|o| o.locker != locker);
                let released = lock.owners.len() != before;
                if released {
                    let promoted = lock.promote_waiters();
                    if promoted > 0 {
                        debug!("release of {} by {} granted {} waiters", resource, locker, promoted);
                    }
                }
                if lock.is_empty() {
                    locks.remove(&resource);
                }
                released
            }
            None => false,
        };

        if released {
            table.cond.notify_all();
        }
        released
    }

    /// Move the ownership of `from` to `to`, optionally demoting a write
    /// lock to a read lock on the way.
    pub fn transfer(
        &self,
        resource: ResourceId,
        from: LockerId,
        to: &Locker,
        demote: bool,
    ) -> SmallResult<LockType> {
        self.transfer_multiple(resource, from, &[to], demote)
    }

    /// Move the ownership of `from` to every locker in `to`.
    ///
    /// Several destinations can't share a write lock, so it is demoted
    /// whenever there is more than one.
    pub fn transfer_multiple(
        &self,
        resource: ResourceId,
        from: LockerId,
        to: &[&Locker],
        demote: bool,
    ) -> SmallResult<LockType> {
        let table = self.table(&resource);
        let mut locks = table.locks.lock();

        if self.locking == LockingMode::Disabled {
            return Ok(LockType::Read);
        }

        let lock = locks.get_mut(&resource).ok_or_else(|| {
            SmallError::new(&format!("transfer of {}: no lock", resource))
        })?;
        let owned = *lock.owner(from).ok_or_else(|| {
            SmallError::new(&format!("transfer of {}: {} is not an owner", resource, from))
        })?;

        let lock_type = if demote || to.len() > 1 {
            owned.lock_type.demoted()
        } else {
            owned.lock_type
        };

        lock.owners.retain(|o| o.locker != from);
        for dest in to {
            match lock.owner_mut(dest.id()) {
                Some(o) => o.lock_type = o.lock_type.upgrade(lock_type),
                None => lock.owners.push(LockInfo {
                    locker: dest.id(),
                    buddy: dest.buddy_id(),
                    lock_type,
                }),
            }
        }

        if lock.promote_waiters() > 0 {
            table.cond.notify_all();
        }
        Ok(lock_type)
    }

    /// Demote a write lock owned by the locker to a read lock.
    pub fn demote(&self, resource: ResourceId, locker: LockerId) {
        let table = self.table(&resource);
        let mut locks = table.locks.lock();
        if let Some(lock) = locks.get_mut(&resource) {
            if let Some(o) = lock.owner_mut(locker) {
                o.lock_type = o.lock_type.demoted();
            }
            if lock.promote_waiters() > 0 {
                table.cond.notify_all();
            }
        }
    }

    pub fn is_owner(&self, resource: ResourceId, locker: LockerId) -> bool {
        self.owned_lock_type(resource, locker).is_some()
    }

    pub fn owned_lock_type(&self, resource: ResourceId, locker: LockerId) -> Option<LockType> {
        let locks = self.table(&resource).locks.lock();
        locks
            .get(&resource)
            .and_then(|l| l.owner(locker))
            .map(|o| o.lock_type)
    }

    /// Lockers waiting on `resource`, in queue order.
    pub fn waiter_ids(&self, resource: ResourceId) -> Vec<LockerId> {
        let locks = self.table(&resource).locks.lock();
        locks
            .get(&resource)
            .map_or_else(Vec::new, |l| l.waiters.iter().map(|w| w.locker).collect())
    }

    pub fn is_waiter(&self, resource: ResourceId, locker: LockerId) -> bool {
        let locks = self.table(&resource).locks.lock();
        locks.get(&resource).map_or(false, |l| l.is_waiter(locker))
    }

    pub fn n_owners(&self, resource: ResourceId) -> usize {
        let locks = self.table(&resource).locks.lock();
        locks.get(&resource).map_or(0, |l| l.owners.len())
    }

    pub fn n_waiters(&self, resource: ResourceId) -> usize {
        let locks = self.table(&resource).locks.lock();
        locks.get(&resource).map_or(0, |l| l.waiters.len())
    }

    pub fn stats(&self) -> LockStats {
        let mut stats = LockStats {
            n_requests: self.n_requests.load(Ordering::Relaxed),
            n_waits: self.n_waits.load(Ordering::Relaxed),
            n_timeouts: self.n_timeouts.load(Ordering::Relaxed),
            n_deadlocks: self.n_deadlocks.load(Ordering::Relaxed),
            n_thread_lockers: self.thread_lockers.lock().len(),
            ..Default::default()
        };
        for table in &self.tables {
            let locks = table.locks.lock();
            stats.n_total_locks += locks.len();
            for lock in locks.values() {
                stats.n_owners += lock.owners.len();
                stats.n_waiters += lock.waiters.len();
            }
        }
        stats
    }

    fn describe(resource: &ResourceId, lock: Option<&Lock>) -> String {
        match lock {
            Some(lock) => format!(
                "{} -> owners: [{}], waiters: [{}]",
                resource,
                lock.owners
                    .iter()
                    .map(|o| format!("{}:{:?}", o.locker, o.lock_type))
                    .join(", "),
                lock.waiters
                    .iter()
                    .map(|w| format!("{}:{:?}", w.locker, w.lock_type))
                    .join(", "),
            ),
            None => format!("{} -> <none>", resource),
        }
    }

    /// All locks of all tables, sorted by resource id.
    pub fn lock_table_string(&self) -> String {
        let mut depiction = "\n".to_string();
        for table in &self.tables {
            let locks = table.locks.lock();
            for (resource, lock) in locks.iter().sorted_by_key(|(r, _)| **r) {
                depiction.push_str(&format!("\t{}\n", Self::describe(resource, Some(lock))));
            }
        }
        depiction
    }
}
