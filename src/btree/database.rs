use std::sync::Arc;

use log::debug;
use parking_lot::Mutex;

use super::{
    bin::{Bin, BinSlot, PendingWrite},
    compressor::INCompressor,
    map_ln::MapLn,
    node::Node,
    tree::{FlushStats, Tree, TreeContext},
};
use crate::{
    error::SmallError,
    latch::LatchGuard,
    transaction::{LockGrantType, LockType, Locker, ResourceId, WriteLockInfo},
    tx_log::{LogEntry, LogEntryType, LogManager, Lsn, NULL_LSN},
    types::{DbId, SmallResult, TxnId, NON_TXN_ID},
};

/// One database: its tree and its naming tree record.
///
/// Record operations take the record lock first and the BIN latch
/// second, never the other way around.
pub struct DatabaseImpl {
    id: DbId,
    name: String,
    tree: Tree,
    map_ln: Mutex<MapLn>,
    log: Arc<LogManager>,
    compressor: Arc<INCompressor>,
}

impl DatabaseImpl {
    pub fn new(map_ln: MapLn, ctx: Arc<TreeContext>, compressor: Arc<INCompressor>) -> Self {
        let log = ctx.log.clone();
        Self {
            id: map_ln.db_id,
            name: map_ln.name.clone(),
            tree: Tree::new(map_ln.db_id, map_ln.root_lsn, ctx),
            map_ln: Mutex::new(map_ln),
            log,
            compressor,
        }
    }

    pub fn id(&self) -> DbId {
        self.id
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn tree(&self) -> &Tree {
        &self.tree
    }

    pub fn map_ln(&self) -> MapLn {
        self.map_ln.lock().clone()
    }

    pub fn map_ln_lsn(&self) -> Lsn {
        self.map_ln.lock().last_logged_lsn
    }

    fn resource(&self, key: u64) -> ResourceId {
        ResourceId::new(self.id, key)
    }

    fn bin_of(guard: &mut LatchGuard<Node>) -> SmallResult<&mut Bin> {
        guard
            .as_bin_mut()
            .ok_or_else(|| SmallError::new("search ended on an internal node"))
    }

    /// The undo information and LSN chain of a write to `slot` by
    /// `txn_id`.
    fn write_info(slot: Option<&BinSlot>, txn_id: TxnId) -> (WriteLockInfo, Lsn, u32) {
        match slot {
            None => (
                WriteLockInfo {
                    abort_lsn: NULL_LSN,
                    abort_known_deleted: true,
                    abort_log_size: 0,
                    created_this_txn: true,
                },
                NULL_LSN,
                0,
            ),
            // a later write of the same txn keeps the first abort LSN
            Some(s) => match s.pending {
                Some(p) if p.txn_id == txn_id => (
                    WriteLockInfo {
                        abort_lsn: p.abort_lsn,
                        abort_known_deleted: p.abort_known_deleted,
                        abort_log_size: p.abort_log_size,
                        created_this_txn: p.abort_lsn.is_null(),
                    },
                    s.lsn,
                    s.log_size,
                ),
                _ => (
                    WriteLockInfo {
                        abort_lsn: s.lsn,
                        abort_known_deleted: s.known_deleted,
                        abort_log_size: s.log_size,
                        created_this_txn: false,
                    },
                    NULL_LSN,
                    0,
                ),
            },
        }
    }

    /// Run `f` on the slot of `key` under a brief BIN latch.
    fn with_slot<R>(&self, key: u64, f: impl FnOnce(Option<&BinSlot>) -> R) -> SmallResult<R> {
        let mut guard = match self.tree.search(key)? {
            Some(g) => g,
            None => return Ok(f(None)),
        };
        let bin = Self::bin_of(&mut guard)?;
        Ok(f(bin.get(key)))
    }

    /// Insert or replace the record of `key`.
    ///
    /// The new version is logged with no latch held, the record lock
    /// keeps the slot as it was read until it is replaced.
    pub fn put(&self, locker: &Locker, key: u64, value: &[u8], cid: u32) -> SmallResult {
        let resource = self.resource(key);
        locker.lock(resource, LockType::Write, false)?;
        let txn_id = locker.txn_id().unwrap_or(NON_TXN_ID);

        // step 1: undo info and prior version
        // A non-transactional write obsoletes the old version right away,
        // a transactional one only at commit.
        let (info, prior_lsn, prior_size) = self.with_slot(key, |existing| {
            let (info, txn_prior_lsn, txn_prior_size) = Self::write_info(existing, txn_id);
            match existing {
                Some(s) if txn_id == NON_TXN_ID => (info, s.lsn, s.log_size),
                _ => (info, txn_prior_lsn, txn_prior_size),
            }
        })?;

        // step 2: log the new version
        let entry = LogEntry::StoreObject {
            txn_id,
            db_id: self.id,
            oid: key,
            cid,
            value: value.to_vec(),
        };
        let (lsn, size) = self.log.log_entry(&entry, false, false, prior_lsn, prior_size)?;

        // step 3: update the slot
        let mut slot = BinSlot::new(key, lsn, size, false);
        slot.data = Some(value.to_vec());
        if txn_id != NON_TXN_ID {
            locker.add_write_lock_info(resource, info);
            slot.pending = Some(PendingWrite {
                txn_id,
                abort_lsn: info.abort_lsn,
                abort_known_deleted: info.abort_known_deleted,
                abort_log_size: info.abort_log_size,
            });
        }
        let halves = {
            let (mut guard, halves) = self.tree.search_splitting(key)?;
            Self::bin_of(&mut guard)?.put(slot);
            if txn_id == NON_TXN_ID {
                guard.dirty = true;
            }
            halves
        };
        self.tree.log_split_halves(halves)
    }

    /// Read the record of `key`. `locker` is `None` for a read without
    /// locks.
    pub fn get(&self, locker: Option<&Locker>, key: u64) -> SmallResult<Option<Vec<u8>>> {
        if let Some(locker) = locker {
            locker.lock(self.resource(key), LockType::Read, false)?;
        }

        let lsn = {
            let mut guard = match self.tree.search(key)? {
                Some(g) => g,
                None => return Ok(None),
            };
            let bin = Self::bin_of(&mut guard)?;
            match bin.get(key) {
                Some(s) if !s.known_deleted => match &s.data {
                    Some(data) => return Ok(Some(data.clone())),
                    None => s.lsn,
                },
                _ => return Ok(None),
            }
        };

        let (header, entry) = self.log.read_entry(lsn)?;
        let value = match entry {
            LogEntry::StoreObject { value, .. } => value,
            other => {
                return Err(SmallError::LogFormat(format!(
                    "expected a record at {}, found a {:?}",
                    lsn,
                    other.entry_type()
                )))
            }
        };

        // cached only if the slot still holds that version
        if let Some(mut guard) = self.tree.search(key)? {
            if let Some(slot) = guard.as_bin_mut().and_then(|bin| bin.get_mut(key)) {
                if slot.lsn == lsn && slot.data.is_none() {
                    slot.log_size = header.total_size() as u32;
                    slot.data = Some(value.clone());
                }
            }
        }
        Ok(Some(value))
    }

    /// Mark the record of `key` deleted. Returns false if there is no
    /// such record.
    pub fn delete(&self, locker: &Locker, key: u64) -> SmallResult<bool> {
        let resource = self.resource(key);
        locker.lock(resource, LockType::Write, false)?;
        let txn_id = locker.txn_id().unwrap_or(NON_TXN_ID);

        let found = self.with_slot(key, |existing| match existing {
            Some(s) if !s.known_deleted => {
                let (info, txn_prior_lsn, txn_prior_size) = Self::write_info(Some(s), txn_id);
                if txn_id == NON_TXN_ID {
                    Some((info, s.lsn, s.log_size))
                } else {
                    Some((info, txn_prior_lsn, txn_prior_size))
                }
            }
            _ => None,
        })?;
        let (info, prior_lsn, prior_size) = match found {
            Some(v) => v,
            None => return Ok(false),
        };

        let entry = LogEntry::DeleteObject {
            txn_id,
            db_id: self.id,
            oid: key,
        };
        let (lsn, size) = self.log.log_entry(&entry, false, false, prior_lsn, prior_size)?;

        let mut slot = BinSlot::new(key, lsn, size, true);
        if txn_id != NON_TXN_ID {
            locker.add_write_lock_info(resource, info);
            slot.pending = Some(PendingWrite {
                txn_id,
                abort_lsn: info.abort_lsn,
                abort_known_deleted: info.abort_known_deleted,
                abort_log_size: info.abort_log_size,
            });
        }

        let mut guard = self
            .tree
            .search(key)?
            .ok_or_else(|| SmallError::new("tree emptied under a record write lock"))?;
        let node_id = guard.node_id;
        let bin = Self::bin_of(&mut guard)?;
        let id_key = bin.id_key();
        bin.put(slot);
        if txn_id == NON_TXN_ID {
            guard.dirty = true;
            self.compressor.add_deleted_key(node_id, self.id, id_key, key);
        }
        Ok(true)
    }

    /// Make the write of `txn_id` to `key` the committed version.
    pub fn commit_write(&self, key: u64, txn_id: TxnId, info: &WriteLockInfo) -> SmallResult {
        let mut guard = match self.tree.search(key)? {
            Some(g) => g,
            None => return Ok(()),
        };
        let node_id = guard.node_id;
        let bin = Self::bin_of(&mut guard)?;
        let id_key = bin.id_key();

        let deleted = match bin.get_mut(key) {
            Some(slot) if slot.pending_txn() == Some(txn_id) => {
                slot.pending = None;
                slot.known_deleted
            }
            _ => return Ok(()),
        };
        bin.delta_keys.insert(key);
        guard.dirty = true;

        if !info.abort_lsn.is_null() {
            self.log
                .count_obsolete_node(info.abort_lsn, LogEntryType::StoreObject, info.abort_log_size);
        }
        if deleted {
            self.compressor.add_deleted_key(node_id, self.id, id_key, key);
        }
        Ok(())
    }

    /// Put the slot of `key` back to what it was before `txn_id` wrote
    /// it.
    pub fn undo_write(&self, key: u64, txn_id: TxnId, info: &WriteLockInfo) -> SmallResult {
        let mut guard = match self.tree.search(key)? {
            Some(g) => g,
            None => return Ok(()),
        };
        let bin = Self::bin_of(&mut guard)?;

        let (undone_lsn, undone_size) = match bin.get(key) {
            Some(slot) if slot.pending_txn() == Some(txn_id) => (slot.lsn, slot.log_size),
            _ => return Ok(()),
        };

        if info.created_this_txn {
            bin.remove(key);
            guard.dirty = true;
        } else if let Some(slot) = bin.get_mut(key) {
            slot.lsn = info.abort_lsn;
            slot.log_size = info.abort_log_size;
            slot.known_deleted = info.abort_known_deleted;
            slot.data = None;
            slot.pending = None;
        }
        self.log
            .count_obsolete_node(undone_lsn, LogEntryType::StoreObject, undone_size);
        debug!("undid write of tx_{} to {}/{}", txn_id, self.id, key);
        Ok(())
    }

    /// Replay a logged record version during recovery. Versions older
    /// than the slot's are skipped.
    pub fn redo(&self, key: u64, lsn: Lsn, size: u32, deleted: bool) -> SmallResult<bool> {
        let (mut guard, halves) = self.tree.search_splitting(key)?;
        let node_id = guard.node_id;
        let bin = Self::bin_of(&mut guard)?;

        let replayed = match bin.get(key) {
            Some(slot) if slot.lsn >= lsn => false,
            _ => {
                bin.put(BinSlot::new(key, lsn, size, deleted));
                let id_key = bin.id_key();
                guard.dirty = true;
                if deleted {
                    self.compressor.add_deleted_key(node_id, self.id, id_key, key);
                }
                true
            }
        };
        drop(guard);
        self.tree.log_split_halves(halves)?;
        Ok(replayed)
    }

    /// Remove the slot of `key` if it holds a committed delete. Returns
    /// whether the slot was removed, `None` when the record lock is busy
    /// and the caller should retry later.
    pub fn compress_key(&self, locker: &Locker, key: u64) -> SmallResult<Option<bool>> {
        let resource = self.resource(key);
        if locker.lock(resource, LockType::Write, true)? == LockGrantType::Denied {
            return Ok(None);
        }

        let mut guard = match self.tree.search(key)? {
            Some(g) => g,
            None => return Ok(Some(false)),
        };
        let bin = Self::bin_of(&mut guard)?;
        let (lsn, size) = match bin.get(key) {
            Some(slot) if slot.known_deleted && slot.pending.is_none() => (slot.lsn, slot.log_size),
            _ => return Ok(Some(false)),
        };
        bin.remove(key);
        guard.dirty = true;
        self.log.count_obsolete_node(lsn, LogEntryType::DeleteObject, size);
        debug!("compressed {}/{}", self.id, key);
        Ok(Some(true))
    }

    /// Keys of every slot, deleted ones included.
    pub fn keys(&self) -> SmallResult<Vec<u64>> {
        self.tree.keys()
    }

    /// Log the dirty nodes of the tree. If the root moved, the MapLN is
    /// logged too, provisionally.
    pub fn checkpoint(&self, stats: &mut FlushStats) -> SmallResult<Option<Lsn>> {
        let new_root = match self.tree.flush_dirty(stats)? {
            Some(lsn) => lsn,
            None => return Ok(None),
        };

        let mut map_ln = self.map_ln.lock();
        map_ln.root_lsn = new_root;
        if let Some(id) = self.tree.root_node_id() {
            map_ln.root_node_id = id;
        }
        let lsn = map_ln.log(&self.log, true)?;
        Ok(Some(lsn))
    }

    /// Log the MapLN as it is now, not provisional.
    pub fn log_map_ln(&self, deleted: bool) -> SmallResult<Lsn> {
        let mut map_ln = self.map_ln.lock();
        map_ln.deleted = deleted;
        map_ln.log(&self.log, false)
    }

    /// Drop the tree from memory and count its images obsolete.
    pub fn release(&self) {
        let lsns = self.tree.release_root();
        self.log.count_obsolete_ins(&lsns);
        self.compressor.forget_database(self.id);
    }
}
