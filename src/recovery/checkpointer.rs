use std::sync::atomic::{AtomicU64, Ordering};

use log::info;
use parking_lot::Mutex;

use crate::{
    btree::FlushStats,
    environment::EnvironmentImpl,
    tx_log::{LogEntry, Lsn},
    types::SmallResult,
};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CheckpointInfo {
    pub checkpoint_id: u64,
    pub start_lsn: Lsn,
    pub end_lsn: Lsn,
    pub root_lsn: Lsn,
    pub n_active_txns: usize,

    /// Databases whose root moved, each got a new MapLN.
    pub n_map_lns: usize,
    pub flush: FlushStats,
}

/// Writes checkpoints, one at a time.
pub struct Checkpointer {
    running: Mutex<()>,
    next_checkpoint_id: AtomicU64,
    n_checkpoints: AtomicU64,
}

impl Checkpointer {
    pub fn new() -> Self {
        Self {
            running: Mutex::new(()),
            next_checkpoint_id: AtomicU64::new(1),
            n_checkpoints: AtomicU64::new(0),
        }
    }

    /// Checkpoint ids keep growing across recovery.
    pub fn bump_checkpoint_id(&self, at_least: u64) {
        self.next_checkpoint_id.fetch_max(at_least, Ordering::SeqCst);
    }

    pub fn n_checkpoints(&self) -> u64 {
        self.n_checkpoints.load(Ordering::Relaxed)
    }

    /// Make every node dirtied before the checkpoint start durable, so
    /// recovery can begin its redo scan at the start (or at the first
    /// entry of the oldest transaction active at the start).
    pub fn checkpoint(&self, env: &EnvironmentImpl) -> SmallResult<CheckpointInfo> {
        let _running = self.running.lock();
        env.state.check()?;

        let checkpoint_id = self.next_checkpoint_id.fetch_add(1, Ordering::SeqCst);

        // step 1: the start marker, with the active transactions as of
        // the moment it is appended
        let (start_lsn, active) = env.txn_manager.log_checkpoint_start(&env.log, checkpoint_id)?;
        info!(
            "checkpoint {} started at {}, {} active txns",
            checkpoint_id,
            start_lsn,
            active.len()
        );

        // step 2: flush the trees, bottom up
        let mut flush = FlushStats::default();
        let mut n_map_lns = 0;
        let databases = env.catalog.read().databases();
        for db in databases {
            if db.checkpoint(&mut flush)?.is_some() {
                n_map_lns += 1;
            }
        }

        // step 3: the naming tree root, no database may be created or
        // removed while it is written
        let root_lsn = {
            let catalog = env.catalog.read();
            let map_lns = catalog
                .databases()
                .iter()
                .map(|db| (db.id(), db.map_ln_lsn()))
                .collect();
            env.log.log(&LogEntry::Root { map_lns })?
        };

        // step 4: the end marker, flushed
        let end = LogEntry::CheckpointEnd {
            checkpoint_id,
            start_lsn,
            root_lsn,
            next_node_id: env.tree_ctx.next_node_id(),
            next_db_id: env.next_db_id.load(Ordering::SeqCst),
            next_txn_id: env.txn_manager.next_txn_id(),
        };
        let end_lsn = env.log.log_and_flush(&end)?;
        self.n_checkpoints.fetch_add(1, Ordering::Relaxed);

        info!(
            "checkpoint {} ended at {}: {} full BINs, {} BIN deltas, {} INs, {} MapLNs",
            checkpoint_id, end_lsn, flush.n_full_bins, flush.n_delta_bins, flush.n_ins, n_map_lns
        );

        Ok(CheckpointInfo {
            checkpoint_id,
            start_lsn,
            end_lsn,
            root_lsn,
            n_active_txns: active.len(),
            n_map_lns,
            flush,
        })
    }
}

impl Default for Checkpointer {
    fn default() -> Self {
        Self::new()
    }
}
