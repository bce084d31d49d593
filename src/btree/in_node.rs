use super::node::NodeRef;
use crate::{
    tx_log::{InEntryImage, InImage, Lsn},
    types::{DbId, NodeId},
};

/// A child of an internal node, either resident or only known by the
/// LSN of its last image.
pub struct ChildRef {
    pub key: u64,
    pub lsn: Lsn,
    pub node: Option<NodeRef>,
}

impl ChildRef {
    pub fn resident(key: u64, lsn: Lsn, node: NodeRef) -> Self {
        Self {
            key,
            lsn,
            node: Some(node),
        }
    }
}

/// Internal node. `entries[i]` covers keys from `entries[i].key` up to
/// the next entry's key, the first entry also covers everything below.
pub struct InNode {
    pub level: u16,
    pub entries: Vec<ChildRef>,
}

impl InNode {
    pub fn new(level: u16, entries: Vec<ChildRef>) -> Self {
        Self { level, entries }
    }

    pub fn from_image(image: &InImage) -> Self {
        Self {
            level: image.level,
            entries: image
                .entries
                .iter()
                .map(|e| ChildRef {
                    key: e.key,
                    lsn: e.lsn,
                    node: None,
                })
                .collect(),
        }
    }

    pub fn image(&self, node_id: NodeId, db_id: DbId) -> InImage {
        InImage {
            node_id,
            db_id,
            level: self.level,
            entries: self
                .entries
                .iter()
                .map(|e| InEntryImage {
                    key: e.key,
                    lsn: e.lsn,
                })
                .collect(),
        }
    }

    /// Index of the child whose range holds `key`.
    pub fn find_child(&self, key: u64) -> usize {
        match self.entries.binary_search_by_key(&key, |e| e.key) {
            Ok(i) => i,
            Err(0) => 0,
            Err(i) => i - 1,
        }
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Move the upper half of the entries into a new node. Returns the
    /// first key of the new node.
    pub fn split(&mut self) -> (u64, InNode) {
        let mid = self.entries.len() / 2;
        let upper = self.entries.split_off(mid);
        let split_key = upper[0].key;
        (split_key, InNode::new(self.level, upper))
    }
}
