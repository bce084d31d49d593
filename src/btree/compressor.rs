use std::{
    collections::BTreeMap,
    sync::atomic::{AtomicU64, Ordering},
};

use parking_lot::Mutex;

use super::bin_reference::BINReference;
use crate::types::{DbId, NodeId};

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct CompressorStats {
    pub n_queued: usize,
    pub n_removed: u64,
    pub n_requeued: u64,
}

/// Queue of BINs holding deleted slots.
///
/// Deleting a record only marks its slot, the slot is removed here
/// later, once the delete is committed and nobody holds the record
/// lock.
pub struct INCompressor {
    queue: Mutex<BTreeMap<(DbId, NodeId), BINReference>>,
    n_removed: AtomicU64,
    n_requeued: AtomicU64,
}

impl INCompressor {
    pub fn new() -> Self {
        Self {
            queue: Mutex::new(BTreeMap::new()),
            n_removed: AtomicU64::new(0),
            n_requeued: AtomicU64::new(0),
        }
    }

    pub fn add_deleted_key(&self, node_id: NodeId, db_id: DbId, id_key: u64, key: u64) {
        self.queue
            .lock()
            .entry((db_id, node_id))
            .or_insert_with(|| BINReference::new(node_id, db_id, id_key))
            .add_deleted_key(key);
    }

    pub(crate) fn take_all(&self) -> Vec<BINReference> {
        let queue = std::mem::take(&mut *self.queue.lock());
        queue.into_values().collect()
    }

    pub(crate) fn requeue(&self, bin_ref: BINReference) {
        self.n_requeued.fetch_add(1, Ordering::Relaxed);
        let mut queue = self.queue.lock();
        match queue.get_mut(&(bin_ref.db_id, bin_ref.node_id)) {
            Some(existing) => existing.add_deleted_keys(&bin_ref),
            None => {
                queue.insert((bin_ref.db_id, bin_ref.node_id), bin_ref);
            }
        }
    }

    pub(crate) fn count_removed(&self, n: u64) {
        self.n_removed.fetch_add(n, Ordering::Relaxed);
    }

    /// Forget the queued BINs of a removed database.
    pub fn forget_database(&self, db_id: DbId) {
        self.queue.lock().retain(|(id, _), _| *id != db_id);
    }

    pub fn queue_len(&self) -> usize {
        self.queue.lock().len()
    }

    pub fn stats(&self) -> CompressorStats {
        CompressorStats {
            n_queued: self.queue_len(),
            n_removed: self.n_removed.load(Ordering::Relaxed),
            n_requeued: self.n_requeued.load(Ordering::Relaxed),
        }
    }
}

impl Default for INCompressor {
    fn default() -> Self {
        Self::new()
    }
}
