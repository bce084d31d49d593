use std::collections::BTreeSet;

use crate::types::{DbId, NodeId};

/// Identity of a BIN, detached from the node itself.
///
/// The compressor collects deleted keys here without pinning or
/// latching the BIN.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BINReference {
    pub node_id: NodeId,
    pub db_id: DbId,
    pub id_key: u64,
    deleted_keys: BTreeSet<u64>,
}

impl BINReference {
    pub fn new(node_id: NodeId, db_id: DbId, id_key: u64) -> Self {
        Self {
            node_id,
            db_id,
            id_key,
            deleted_keys: BTreeSet::new(),
        }
    }

    pub fn add_deleted_key(&mut self, key: u64) {
        self.deleted_keys.insert(key);
    }

    pub fn add_deleted_keys(&mut self, other: &BINReference) {
        self.deleted_keys.extend(other.deleted_keys.iter().copied());
    }

    pub fn remove_deleted_key(&mut self, key: u64) {
        self.deleted_keys.remove(&key);
    }

    pub fn has_deleted_key(&self, key: u64) -> bool {
        self.deleted_keys.contains(&key)
    }

    pub fn deleted_keys_exist(&self) -> bool {
        !self.deleted_keys.is_empty()
    }

    pub fn deleted_keys(&self) -> impl Iterator<Item = u64> + '_ {
        self.deleted_keys.iter().copied()
    }
}
