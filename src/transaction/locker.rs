use std::{
    collections::{BTreeMap, BTreeSet},
    fmt,
    sync::Arc,
    thread::{self, ThreadId},
    time::Duration,
};

use parking_lot::Mutex;

use super::{
    lock::{LockGrantType, LockType, LockerId, ResourceId},
    lock_manager::LockManager,
};
use crate::{error::SmallError, tx_log::Lsn, types::SmallResult, types::TxnId};

/// What a transaction needs to undo one of its writes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WriteLockInfo {
    /// LSN of the record version before the first write of the txn.
    pub abort_lsn: Lsn,
    pub abort_known_deleted: bool,
    pub abort_log_size: u32,

    /// The record didn't exist before the txn, abort removes the slot.
    pub created_this_txn: bool,
}

#[derive(Debug, Default)]
pub(crate) struct LockerState {
    read_locks: BTreeSet<ResourceId>,
    write_locks: BTreeSet<ResourceId>,
    write_infos: BTreeMap<ResourceId, WriteLockInfo>,
}

pub enum LockerKind {
    /// Locks are released at the end of every operation.
    NonTxn,

    /// Locks are held until commit or abort.
    Txn { txn_id: TxnId },

    /// All thread lockers of one thread share a single id and lock set.
    /// Use from another thread fails with `LockerWrongThread`.
    ThreadShared { thread: ThreadId },

    /// Write locks and write lock infos belong to the buddy, read locks
    /// stay here and are released at operation end.
    Buddy { buddy: Arc<Locker> },

    /// Every request succeeds, nothing is tracked.
    NoOp,
}

pub struct Locker {
    id: LockerId,
    kind: LockerKind,
    lock_manager: Arc<LockManager>,
    timeout: Option<Duration>,
    state: Arc<Mutex<LockerState>>,
}

impl Locker {
    fn build(id: LockerId, kind: LockerKind, lock_manager: &Arc<LockManager>) -> Self {
        let timeout = lock_manager.default_timeout();
        Self {
            id,
            kind,
            lock_manager: lock_manager.clone(),
            timeout: if timeout.is_zero() { None } else { Some(timeout) },
            state: Arc::new(Mutex::new(LockerState::default())),
        }
    }

    pub fn non_txn(lock_manager: &Arc<LockManager>) -> Self {
        Self::build(lock_manager.new_locker_id(), LockerKind::NonTxn, lock_manager)
    }

    /// A transactional locker uses the transaction id as its locker id.
    pub fn txn(lock_manager: &Arc<LockManager>, txn_id: TxnId) -> Self {
        Self::build(txn_id, LockerKind::Txn { txn_id }, lock_manager)
    }

    pub fn thread_shared(lock_manager: &Arc<LockManager>) -> Self {
        let (id, state) = lock_manager.thread_locker_state();
        let mut locker = Self::build(
            id,
            LockerKind::ThreadShared {
                thread: thread::current().id(),
            },
            lock_manager,
        );
        locker.state = state;
        locker
    }

    pub fn buddy(lock_manager: &Arc<LockManager>, buddy: Arc<Locker>) -> Self {
        Self::build(
            lock_manager.new_locker_id(),
            LockerKind::Buddy { buddy },
            lock_manager,
        )
    }

    pub fn no_op(lock_manager: &Arc<LockManager>) -> Self {
        Self::build(lock_manager.new_locker_id(), LockerKind::NoOp, lock_manager)
    }

    pub fn with_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn id(&self) -> LockerId {
        self.id
    }

    pub fn kind(&self) -> &LockerKind {
        &self.kind
    }

    pub fn buddy_id(&self) -> Option<LockerId> {
        match &self.kind {
            LockerKind::Buddy { buddy } => Some(buddy.id()),
            _ => None,
        }
    }

    pub fn txn_id(&self) -> Option<TxnId> {
        match &self.kind {
            LockerKind::Txn { txn_id } => Some(*txn_id),
            LockerKind::Buddy { buddy } => buddy.txn_id(),
            _ => None,
        }
    }

    pub fn is_transactional(&self) -> bool {
        self.txn_id().is_some()
    }

    fn check_thread(&self) -> SmallResult {
        if let LockerKind::ThreadShared { thread } = &self.kind {
            if *thread != thread::current().id() {
                return Err(SmallError::LockerWrongThread { locker: self.id });
            }
        }
        Ok(())
    }

    pub fn lock(
        &self,
        resource: ResourceId,
        lock_type: LockType,
        no_wait: bool,
    ) -> SmallResult<LockGrantType> {
        self.check_thread()?;

        match &self.kind {
            LockerKind::NoOp => return Ok(LockGrantType::GrantedNew),
            LockerKind::Buddy { buddy } if lock_type.is_write() => {
                return buddy.lock(resource, lock_type, no_wait);
            }
            _ => {}
        }

        let grant = self
            .lock_manager
            .lock(resource, self, lock_type, no_wait, self.timeout)?;
        if grant.is_granted() {
            let mut state = self.state.lock();
            if lock_type.is_write() {
                state.read_locks.remove(&resource);
                state.write_locks.insert(resource);
            } else if !state.write_locks.contains(&resource) {
                state.read_locks.insert(resource);
            }
        }
        Ok(grant)
    }

    /// Release one lock of this locker.
    pub fn release(&self, resource: ResourceId) -> SmallResult<bool> {
        self.check_thread()?;
        if let LockerKind::NoOp = self.kind {
            return Ok(false);
        }

        {
            let mut state = self.state.lock();
            state.read_locks.remove(&resource);
            state.write_locks.remove(&resource);
            state.write_infos.remove(&resource);
        }
        Ok(self.lock_manager.release(resource, self.id))
    }

    /// Release every lock this locker owns. A buddy only releases its
    /// own read locks.
    pub fn release_all(&self) -> SmallResult<usize> {
        self.check_thread()?;
        let resources: Vec<ResourceId> = {
            let mut state = self.state.lock();
            let mut resources: Vec<ResourceId> = state.read_locks.iter().copied().collect();
            resources.extend(state.write_locks.iter().copied());
            state.read_locks.clear();
            state.write_locks.clear();
            state.write_infos.clear();
            resources
        };

        let mut released = 0;
        for r in resources {
            if self.lock_manager.release(r, self.id) {
                released += 1;
            }
        }
        Ok(released)
    }

    /// Called when an API operation finishes. Lockers whose locks only
    /// live for one operation drop them here.
    pub fn operation_end(&self) -> SmallResult {
        match &self.kind {
            LockerKind::Txn { .. } | LockerKind::NoOp => Ok(()),
            _ => self.release_all().map(|_| ()),
        }
    }

    /// Record the undo information of a write. Only the first write of
    /// a resource counts, later writes keep the original abort LSN.
    pub fn add_write_lock_info(&self, resource: ResourceId, info: WriteLockInfo) {
        match &self.kind {
            LockerKind::NoOp => {}
            LockerKind::Buddy { buddy } => buddy.add_write_lock_info(resource, info),
            _ => {
                self.state.lock().write_infos.entry(resource).or_insert(info);
            }
        }
    }

    pub fn get_write_lock_info(&self, resource: ResourceId) -> Option<WriteLockInfo> {
        match &self.kind {
            LockerKind::Buddy { buddy } => buddy.get_write_lock_info(resource),
            _ => self.state.lock().write_infos.get(&resource).copied(),
        }
    }

    /// Undo information of every write, ordered by resource.
    pub fn write_lock_infos(&self) -> Vec<(ResourceId, WriteLockInfo)> {
        match &self.kind {
            LockerKind::Buddy { buddy } => buddy.write_lock_infos(),
            _ => self
                .state
                .lock()
                .write_infos
                .iter()
                .map(|(r, i)| (*r, *i))
                .collect(),
        }
    }

    /// Hand every lock of this locker over to `dest`.
    pub fn transfer_locks_to(&self, dest: &Locker, demote: bool) -> SmallResult<usize> {
        let (reads, writes) = {
            let mut state = self.state.lock();
            let reads: Vec<ResourceId> = state.read_locks.iter().copied().collect();
            let writes: Vec<ResourceId> = state.write_locks.iter().copied().collect();
            state.read_locks.clear();
            state.write_locks.clear();
            state.write_infos.clear();
            (reads, writes)
        };

        let mut n = 0;
        for r in reads.into_iter().chain(writes) {
            let lock_type = self.lock_manager.transfer(r, self.id, dest, demote)?;
            let mut dest_state = dest.state.lock();
            if lock_type.is_write() {
                dest_state.write_locks.insert(r);
            } else if !dest_state.write_locks.contains(&r) {
                dest_state.read_locks.insert(r);
            }
            n += 1;
        }
        Ok(n)
    }

    pub fn n_read_locks(&self) -> usize {
        self.state.lock().read_locks.len()
    }

    pub fn n_write_locks(&self) -> usize {
        self.state.lock().write_locks.len()
    }

    pub fn owns(&self, resource: ResourceId) -> bool {
        let state = self.state.lock();
        state.read_locks.contains(&resource) || state.write_locks.contains(&resource)
    }
}

impl fmt::Display for Locker {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match &self.kind {
            LockerKind::NonTxn => write!(f, "non_txn_{}", self.id),
            LockerKind::Txn { txn_id } => write!(f, "txn_{}", txn_id),
            LockerKind::ThreadShared { .. } => write!(f, "thread_{}", self.id),
            LockerKind::Buddy { buddy } => write!(f, "buddy_{}({})", self.id, buddy),
            LockerKind::NoOp => write!(f, "no_op_{}", self.id),
        }
    }
}

impl fmt::Debug for Locker {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        return write!(f, "{}", self);
    }
}
