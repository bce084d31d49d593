use std::collections::BTreeSet;

use crate::{
    tx_log::{BinDeltaImage, BinImage, BinSlotImage, Lsn, NULL_LSN},
    types::{DbId, NodeId, TxnId},
};

/// The uncommitted write sitting in a slot, with what the slot was
/// before the transaction touched it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PendingWrite {
    pub txn_id: TxnId,
    pub abort_lsn: Lsn,
    pub abort_known_deleted: bool,
    pub abort_log_size: u32,
}

#[derive(Debug, Clone)]
pub struct BinSlot {
    pub key: u64,
    pub lsn: Lsn,
    pub log_size: u32,
    pub known_deleted: bool,

    // record value, faulted from the log when `None`
    pub data: Option<Vec<u8>>,
    pub pending: Option<PendingWrite>,
}

impl BinSlot {
    pub fn new(key: u64, lsn: Lsn, log_size: u32, known_deleted: bool) -> Self {
        Self {
            key,
            lsn,
            log_size,
            known_deleted,
            data: None,
            pending: None,
        }
    }

    /// The slot as of its last commit, `None` if the record was created
    /// by a transaction that hasn't committed yet.
    pub fn committed_image(&self) -> Option<BinSlotImage> {
        match self.pending {
            None => Some(BinSlotImage {
                key: self.key,
                lsn: self.lsn,
                known_deleted: self.known_deleted,
            }),
            Some(p) if p.abort_lsn.is_null() => None,
            Some(p) => Some(BinSlotImage {
                key: self.key,
                lsn: p.abort_lsn,
                known_deleted: p.abort_known_deleted,
            }),
        }
    }

    pub fn pending_txn(&self) -> Option<TxnId> {
        self.pending.map(|p| p.txn_id)
    }
}

/// Bottom internal node, the `(key, record LSN)` pairs of a key range.
pub struct Bin {
    slots: Vec<BinSlot>,

    pub(crate) last_full_lsn: Lsn,
    pub(crate) last_full_size: u32,
    pub(crate) last_delta_lsn: Lsn,
    pub(crate) last_delta_size: u32,
    pub(crate) n_deltas: u32,

    // keys changed since the last full image
    pub(crate) delta_keys: BTreeSet<u64>,

    // a slot was removed, a delta can't express that
    pub(crate) prohibit_delta: bool,
}

impl Bin {
    pub fn new() -> Self {
        Self {
            slots: Vec::new(),
            last_full_lsn: NULL_LSN,
            last_full_size: 0,
            last_delta_lsn: NULL_LSN,
            last_delta_size: 0,
            n_deltas: 0,
            delta_keys: BTreeSet::new(),
            prohibit_delta: false,
        }
    }

    pub fn from_image(image: &BinImage, lsn: Lsn, size: u32) -> Self {
        let mut bin = Self::new();
        bin.slots = image
            .slots
            .iter()
            .map(|s| BinSlot::new(s.key, s.lsn, 0, s.known_deleted))
            .collect();
        bin.last_full_lsn = lsn;
        bin.last_full_size = size;
        bin
    }

    /// Rebuild from a delta and the full image it refers to.
    pub fn from_delta(full: &BinImage, full_size: u32, delta: &BinDeltaImage, lsn: Lsn, size: u32) -> Self {
        let image = delta.apply(full);
        let mut bin = Self::from_image(&image, delta.last_full_lsn, full_size);
        bin.last_delta_lsn = lsn;
        bin.last_delta_size = size;
        bin.n_deltas = delta.n_deltas;
        bin.delta_keys = delta.slots.iter().map(|s| s.key).collect();
        bin
    }

    pub fn len(&self) -> usize {
        self.slots.len()
    }

    pub fn is_empty(&self) -> bool {
        self.slots.is_empty()
    }

    pub fn slots(&self) -> &[BinSlot] {
        &self.slots
    }

    pub fn id_key(&self) -> u64 {
        self.slots.first().map_or(0, |s| s.key)
    }

    pub fn get(&self, key: u64) -> Option<&BinSlot> {
        match self.slots.binary_search_by_key(&key, |s| s.key) {
            Ok(i) => Some(&self.slots[i]),
            Err(_) => None,
        }
    }

    pub fn get_mut(&mut self, key: u64) -> Option<&mut BinSlot> {
        match self.slots.binary_search_by_key(&key, |s| s.key) {
            Ok(i) => Some(&mut self.slots[i]),
            Err(_) => None,
        }
    }

    /// Insert or replace the slot of `slot.key`.
    pub fn put(&mut self, slot: BinSlot) {
        self.delta_keys.insert(slot.key);
        match self.slots.binary_search_by_key(&slot.key, |s| s.key) {
            Ok(i) => self.slots[i] = slot,
            Err(i) => self.slots.insert(i, slot),
        }
    }

    pub fn remove(&mut self, key: u64) -> Option<BinSlot> {
        match self.slots.binary_search_by_key(&key, |s| s.key) {
            Ok(i) => {
                self.prohibit_delta = true;
                self.delta_keys.remove(&key);
                Some(self.slots.remove(i))
            }
            Err(_) => None,
        }
    }

    pub fn has_pending(&self) -> bool {
        self.slots.iter().any(|s| s.pending.is_some())
    }

    pub fn full_image(&self, node_id: NodeId, db_id: DbId) -> BinImage {
        BinImage {
            node_id,
            db_id,
            slots: self.slots.iter().filter_map(|s| s.committed_image()).collect(),
        }
    }

    pub fn delta_image(&self, node_id: NodeId, db_id: DbId) -> BinDeltaImage {
        BinDeltaImage {
            node_id,
            db_id,
            last_full_lsn: self.last_full_lsn,
            n_deltas: self.n_deltas + 1,
            slots: self
                .delta_keys
                .iter()
                .filter_map(|k| self.get(*k))
                .filter_map(|s| s.committed_image())
                .collect(),
        }
    }

    /// A delta is logged when few slots changed since the last full
    /// image and the delta chain is still short.
    pub fn should_log_delta(&self, delta_percent: usize, max_deltas: usize) -> bool {
        !self.prohibit_delta
            && !self.last_full_lsn.is_null()
            && (self.n_deltas as usize) < max_deltas
            && self.delta_keys.len() * 100 < self.slots.len() * delta_percent
    }

    /// Move the upper half of the slots into a new node. Returns the
    /// first key of the new node.
    pub fn split(&mut self) -> (u64, Bin) {
        let mid = self.slots.len() / 2;
        let upper = self.slots.split_off(mid);
        let split_key = upper[0].key;

        let mut sibling = Bin::new();
        sibling.delta_keys = upper.iter().map(|s| s.key).collect();
        sibling.slots = upper;

        self.delta_keys.retain(|k| *k < split_key);
        self.prohibit_delta = true;
        (split_key, sibling)
    }
}

impl Default for Bin {
    fn default() -> Self {
        Self::new()
    }
}
