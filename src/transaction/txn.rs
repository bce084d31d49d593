use std::{
    collections::BTreeMap,
    fmt,
    sync::{
        atomic::{AtomicU64, Ordering},
        Arc,
    },
};

use log::debug;
use parking_lot::Mutex;

use super::locker::Locker;
use crate::{
    config::IsolationLevel,
    tx_log::{ActiveTxn, LogEntry, LogManager, Lsn},
    types::{SmallResult, TxnId},
};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TxnState {
    Active,
    Committed,
    Aborted,
}

/// A user transaction. Its locker holds the write locks (and, with
/// repeatable read, the read locks) until commit or abort.
pub struct Txn {
    id: TxnId,
    locker: Arc<Locker>,
    begin_lsn: Lsn,
    isolation: IsolationLevel,
    state: Mutex<TxnState>,
}

impl Txn {
    pub(crate) fn new(id: TxnId, locker: Arc<Locker>, begin_lsn: Lsn, isolation: IsolationLevel) -> Self {
        Self {
            id,
            locker,
            begin_lsn,
            isolation,
            state: Mutex::new(TxnState::Active),
        }
    }

    pub fn id(&self) -> TxnId {
        self.id
    }

    pub fn locker(&self) -> &Arc<Locker> {
        &self.locker
    }

    pub fn begin_lsn(&self) -> Lsn {
        self.begin_lsn
    }

    pub fn isolation(&self) -> IsolationLevel {
        self.isolation
    }

    pub fn state(&self) -> TxnState {
        *self.state.lock()
    }

    pub fn is_active(&self) -> bool {
        self.state() == TxnState::Active
    }

    pub(crate) fn set_state(&self, state: TxnState) {
        *self.state.lock() = state;
    }
}

impl fmt::Display for Txn {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "tx_{}", self.id)
    }
}

impl fmt::Debug for Txn {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        return write!(f, "{}", self);
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TxnStats {
    pub n_active: usize,
    pub n_begins: u64,
    pub n_commits: u64,
    pub n_aborts: u64,
}

/// Allocates transaction ids and tracks the active transactions with
/// the LSN of their `Begin` entry.
pub struct TxnManager {
    next_txn_id: AtomicU64,

    // Writing `Begin` and inserting into the map happen under this
    // mutex, and so does writing `CheckpointStart`, so a checkpoint
    // never misses a transaction that began before it.
    active: Mutex<BTreeMap<TxnId, Lsn>>,

    n_begins: AtomicU64,
    n_commits: AtomicU64,
    n_aborts: AtomicU64,
}

impl TxnManager {
    pub fn new(next_txn_id: TxnId) -> Self {
        Self {
            next_txn_id: AtomicU64::new(next_txn_id.max(1)),
            active: Mutex::new(BTreeMap::new()),
            n_begins: AtomicU64::new(0),
            n_commits: AtomicU64::new(0),
            n_aborts: AtomicU64::new(0),
        }
    }

    /// Allocate an id and log its `Begin` entry.
    pub fn begin(&self, log: &LogManager) -> SmallResult<(TxnId, Lsn)> {
        let mut active = self.active.lock();
        let txn_id = self.next_txn_id.fetch_add(1, Ordering::Relaxed);
        let lsn = log.log(&LogEntry::Begin { txn_id })?;
        active.insert(txn_id, lsn);
        self.n_begins.fetch_add(1, Ordering::Relaxed);
        debug!("txn {} began at {}", txn_id, lsn);
        Ok((txn_id, lsn))
    }

    /// Log `CheckpointStart` with a snapshot of the active transactions
    /// taken at append time.
    pub fn log_checkpoint_start(
        &self,
        log: &LogManager,
        checkpoint_id: u64,
    ) -> SmallResult<(Lsn, Vec<ActiveTxn>)> {
        let active = self.active.lock();
        let active_txns: Vec<ActiveTxn> = active
            .iter()
            .map(|(txn_id, first_lsn)| ActiveTxn {
                txn_id: *txn_id,
                first_lsn: *first_lsn,
            })
            .collect();
        let lsn = log.log(&LogEntry::CheckpointStart {
            checkpoint_id,
            active_txns: active_txns.clone(),
        })?;
        Ok((lsn, active_txns))
    }

    pub fn end(&self, txn_id: TxnId, committed: bool) {
        self.active.lock().remove(&txn_id);
        if committed {
            self.n_commits.fetch_add(1, Ordering::Relaxed);
        } else {
            self.n_aborts.fetch_add(1, Ordering::Relaxed);
        }
    }

    pub fn active_txns(&self) -> Vec<ActiveTxn> {
        self.active
            .lock()
            .iter()
            .map(|(txn_id, first_lsn)| ActiveTxn {
                txn_id: *txn_id,
                first_lsn: *first_lsn,
            })
            .collect()
    }

    pub fn n_active(&self) -> usize {
        self.active.lock().len()
    }

    pub fn next_txn_id(&self) -> TxnId {
        self.next_txn_id.load(Ordering::Relaxed)
    }

    /// Move the id counter past ids found in the log.
    pub fn bump_next_txn_id(&self, at_least: TxnId) {
        self.next_txn_id.fetch_max(at_least, Ordering::Relaxed);
    }

    pub fn stats(&self) -> TxnStats {
        TxnStats {
            n_active: self.n_active(),
            n_begins: self.n_begins.load(Ordering::Relaxed),
            n_commits: self.n_commits.load(Ordering::Relaxed),
            n_aborts: self.n_aborts.load(Ordering::Relaxed),
        }
    }
}
