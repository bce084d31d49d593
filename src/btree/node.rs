use std::{fmt, sync::Arc};

use super::{bin::Bin, in_node::InNode};
use crate::{
    latch::Latched,
    tx_log::{Lsn, NULL_LSN},
    types::{DbId, NodeId},
};

pub type NodeRef = Arc<Latched<Node>>;

pub enum NodeBody {
    Internal(InNode),
    Bottom(Bin),
}

/// A tree node. Only touched while its latch is held.
pub struct Node {
    pub node_id: NodeId,
    pub db_id: DbId,

    /// Changed since `last_logged_lsn` was written.
    pub dirty: bool,
    pub last_logged_lsn: Lsn,
    pub last_logged_size: u32,

    /// Bumped by every split and every image built of the node. An
    /// image is installed only if nothing bumped it since it was built.
    pub generation: u64,

    /// Images built but not yet installed.
    pub n_in_flight: u32,

    pub body: NodeBody,
}

impl Node {
    pub fn new_bin(node_id: NodeId, db_id: DbId) -> Self {
        Self {
            node_id,
            db_id,
            dirty: true,
            last_logged_lsn: NULL_LSN,
            last_logged_size: 0,
            generation: 0,
            n_in_flight: 0,
            body: NodeBody::Bottom(Bin::new()),
        }
    }

    pub fn new_in(node_id: NodeId, db_id: DbId, body: InNode) -> Self {
        Self {
            node_id,
            db_id,
            dirty: true,
            last_logged_lsn: NULL_LSN,
            last_logged_size: 0,
            generation: 0,
            n_in_flight: 0,
            body: NodeBody::Internal(body),
        }
    }

    /// A node read back from the log.
    pub fn fetched(node_id: NodeId, db_id: DbId, lsn: Lsn, size: u32, body: NodeBody) -> Self {
        Self {
            node_id,
            db_id,
            dirty: false,
            last_logged_lsn: lsn,
            last_logged_size: size,
            generation: 0,
            n_in_flight: 0,
            body,
        }
    }

    /// The last logged image describes the node as it is now.
    pub fn is_clean(&self) -> bool {
        !self.dirty && !self.last_logged_lsn.is_null() && self.n_in_flight == 0
    }

    pub fn is_bin(&self) -> bool {
        matches!(self.body, NodeBody::Bottom(_))
    }

    /// BINs are level 1.
    pub fn level(&self) -> u16 {
        match &self.body {
            NodeBody::Internal(inn) => inn.level,
            NodeBody::Bottom(_) => 1,
        }
    }

    pub fn n_entries(&self) -> usize {
        match &self.body {
            NodeBody::Internal(inn) => inn.len(),
            NodeBody::Bottom(bin) => bin.len(),
        }
    }

    pub fn is_full(&self, bin_max_entries: usize, in_max_entries: usize) -> bool {
        match &self.body {
            NodeBody::Internal(inn) => inn.len() >= in_max_entries,
            NodeBody::Bottom(bin) => bin.len() >= bin_max_entries,
        }
    }

    pub fn as_in(&self) -> Option<&InNode> {
        match &self.body {
            NodeBody::Internal(inn) => Some(inn),
            NodeBody::Bottom(_) => None,
        }
    }

    pub fn as_in_mut(&mut self) -> Option<&mut InNode> {
        match &mut self.body {
            NodeBody::Internal(inn) => Some(inn),
            NodeBody::Bottom(_) => None,
        }
    }

    pub fn as_bin(&self) -> Option<&Bin> {
        match &self.body {
            NodeBody::Bottom(bin) => Some(bin),
            NodeBody::Internal(_) => None,
        }
    }

    pub fn as_bin_mut(&mut self) -> Option<&mut Bin> {
        match &mut self.body {
            NodeBody::Bottom(bin) => Some(bin),
            NodeBody::Internal(_) => None,
        }
    }
}

impl fmt::Display for Node {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        let kind = if self.is_bin() { "BIN" } else { "IN" };
        write!(
            f,
            "{}_{}(db {}, {} entries, lsn {}{})",
            kind,
            self.node_id,
            self.db_id,
            self.n_entries(),
            self.last_logged_lsn,
            if self.dirty { ", dirty" } else { "" },
        )
    }
}

/// The entry point of a tree: its root node, resident or not.
pub struct RootRef {
    pub node: Option<NodeRef>,
    pub lsn: Lsn,
}
