//! Short-hold, non-reentrant mutual exclusion for in-memory node state.
//!
//! Latches are never held across I/O or across a lock request. Callers
//! avoid latch deadlocks by acquiring latches top-down through the tree.

mod latch_table;
mod latched;
mod shared_latch;
mod spin_latch;

use std::{
    sync::{
        atomic::{AtomicU64, Ordering},
        Arc,
    },
    time::Duration,
};

use thiserror::Error;

pub use latch_table::LatchTable;
pub use latched::{LatchGuard, Latched};
pub use shared_latch::SharedLatch;
pub use spin_latch::SpinLatch;

/// Programmer errors of the latch protocol. These never mix with the
/// recoverable errors in `SmallError`.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum LatchError {
    #[error("latch {0} already held by the current thread")]
    SelfHeld(String),

    #[error("latch {0} not held by the current thread")]
    NotHeld(String),

    #[error("latch {name} not acquired after {timeout:?}")]
    Timeout { name: String, timeout: Duration },
}

pub trait Latch: Send + Sync {
    fn name(&self) -> &str;

    /// Block until the latch is granted. Waiters are granted in FIFO
    /// order.
    fn acquire(&self) -> Result<(), LatchError>;

    /// Take the latch if it is free, never blocks.
    fn acquire_no_wait(&self) -> Result<bool, LatchError>;

    fn release(&self) -> Result<(), LatchError>;

    /// Release the latch if the current thread owns it, returns whether
    /// it did.
    fn release_if_owner(&self) -> bool;

    fn is_owner(&self) -> bool;

    fn is_held(&self) -> bool;

    fn n_waiters(&self) -> usize;

    fn stats(&self) -> LatchStats;
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct LatchStats {
    pub n_acquires_no_waiters: u64,
    pub n_acquires_with_contention: u64,
    pub n_acquire_no_wait_successful: u64,
    pub n_acquire_no_wait_unsuccessful: u64,
    pub n_acquires_self_owned: u64,
    pub n_releases: u64,
    pub n_timeouts: u64,
}

impl LatchStats {
    pub fn add(&mut self, other: &LatchStats) {
        self.n_acquires_no_waiters += other.n_acquires_no_waiters;
        self.n_acquires_with_contention += other.n_acquires_with_contention;
        self.n_acquire_no_wait_successful += other.n_acquire_no_wait_successful;
        self.n_acquire_no_wait_unsuccessful += other.n_acquire_no_wait_unsuccessful;
        self.n_acquires_self_owned += other.n_acquires_self_owned;
        self.n_releases += other.n_releases;
        self.n_timeouts += other.n_timeouts;
    }
}

#[derive(Default)]
pub(crate) struct LatchCounters {
    acquires_no_waiters: AtomicU64,
    acquires_with_contention: AtomicU64,
    acquire_no_wait_successful: AtomicU64,
    acquire_no_wait_unsuccessful: AtomicU64,
    acquires_self_owned: AtomicU64,
    releases: AtomicU64,
    timeouts: AtomicU64,
}

impl LatchCounters {
    pub(crate) fn no_waiters(&self) {
        self.acquires_no_waiters.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn contention(&self) {
        self.acquires_with_contention.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn no_wait(&self, successful: bool) {
        if successful {
            self.acquire_no_wait_successful.fetch_add(1, Ordering::Relaxed);
        } else {
            self.acquire_no_wait_unsuccessful
                .fetch_add(1, Ordering::Relaxed);
        }
    }

    pub(crate) fn self_owned(&self) {
        self.acquires_self_owned.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn release(&self) {
        self.releases.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn timeout(&self) {
        self.timeouts.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn snapshot(&self) -> LatchStats {
        LatchStats {
            n_acquires_no_waiters: self.acquires_no_waiters.load(Ordering::Relaxed),
            n_acquires_with_contention: self.acquires_with_contention.load(Ordering::Relaxed),
            n_acquire_no_wait_successful: self
                .acquire_no_wait_successful
                .load(Ordering::Relaxed),
            n_acquire_no_wait_unsuccessful: self
                .acquire_no_wait_unsuccessful
                .load(Ordering::Relaxed),
            n_acquires_self_owned: self.acquires_self_owned.load(Ordering::Relaxed),
            n_releases: self.releases.load(Ordering::Relaxed),
            n_timeouts: self.timeouts.load(Ordering::Relaxed),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LatchKind {
    Shared,
    Spin,
}

/// Creates the latches of one environment, all of them reporting to
/// the same `LatchTable`.
#[derive(Clone)]
pub struct LatchFactory {
    kind: LatchKind,
    timeout: Option<Duration>,
    table: Arc<LatchTable>,
}

impl LatchFactory {
    pub fn new(kind: LatchKind, timeout: Option<Duration>, table: Arc<LatchTable>) -> Self {
        Self {
            kind,
            timeout,
            table,
        }
    }

    pub fn create(&self, name: &str) -> Box<dyn Latch> {
        match self.kind {
            LatchKind::Shared => Box::new(SharedLatch::new(
                name,
                self.timeout,
                Some(self.table.clone()),
            )),
            LatchKind::Spin => Box::new(SpinLatch::new(
                name,
                self.timeout,
                Some(self.table.clone()),
            )),
        }
    }

    pub fn table(&self) -> &Arc<LatchTable> {
        &self.table
    }
}
