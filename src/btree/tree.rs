use std::{
    collections::BTreeSet,
    mem,
    sync::{
        atomic::{AtomicU64, Ordering},
        Arc,
    },
};

use log::debug;

use super::{
    bin::Bin,
    in_node::{ChildRef, InNode},
    node::{Node, NodeBody, NodeRef, RootRef},
};
use crate::{
    config::EnvConfig,
    error::SmallError,
    latch::{LatchFactory, LatchGuard, LatchTable, Latched},
    tx_log::{LogEntry, LogEntryType, LogManager, Lsn, NULL_LSN},
    types::{DbId, NodeId, SmallResult},
};

/// What every tree of an environment shares: the log, the latch
/// factories and the node id sequence.
pub struct TreeContext {
    pub(crate) log: Arc<LogManager>,
    node_latches: LatchFactory,
    root_latches: LatchFactory,
    next_node_id: AtomicU64,

    pub(crate) bin_max_entries: usize,
    pub(crate) in_max_entries: usize,
    pub(crate) bin_delta_percent: usize,
    pub(crate) bin_max_deltas: usize,
}

impl TreeContext {
    pub fn new(
        config: &EnvConfig,
        log: Arc<LogManager>,
        node_latches: LatchFactory,
        root_latches: LatchFactory,
    ) -> Self {
        Self {
            log,
            node_latches,
            root_latches,
            next_node_id: AtomicU64::new(1),
            bin_max_entries: config.bin_max_entries,
            in_max_entries: config.in_max_entries,
            bin_delta_percent: config.bin_delta_percent,
            bin_max_deltas: config.bin_max_deltas,
        }
    }

    pub fn new_node_id(&self) -> NodeId {
        self.next_node_id.fetch_add(1, Ordering::SeqCst)
    }

    pub fn next_node_id(&self) -> NodeId {
        self.next_node_id.load(Ordering::SeqCst)
    }

    /// Node ids never go back, not even across recovery.
    pub fn bump_node_id(&self, at_least: NodeId) {
        self.next_node_id.fetch_max(at_least, Ordering::SeqCst);
    }

    pub fn latch_table(&self) -> &Arc<LatchTable> {
        self.node_latches.table()
    }

    fn wrap(&self, node: Node) -> NodeRef {
        let name = if node.is_bin() {
            format!("BIN_{}", node.node_id)
        } else {
            format!("IN_{}", node.node_id)
        };
        Arc::new(Latched::new(self.node_latches.create(&name), node))
    }
}

/// Node images written by a checkpoint.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct FlushStats {
    pub n_full_bins: u64,
    pub n_delta_bins: u64,
    pub n_ins: u64,
}

impl FlushStats {
    fn count(&mut self, entry_type: LogEntryType) {
        match entry_type {
            LogEntryType::BIN => self.n_full_bins += 1,
            LogEntryType::BINDelta => self.n_delta_bins += 1,
            _ => self.n_ins += 1,
        }
    }

    pub fn add(&mut self, other: &FlushStats) {
        self.n_full_bins += other.n_full_bins;
        self.n_delta_bins += other.n_delta_bins;
        self.n_ins += other.n_ins;
    }
}

/// A node a split left without a logged image, and the parent that
/// points to it.
pub struct SplitHalf {
    parent: NodeRef,
    node: NodeRef,
}

/// A node image built under the node's latch, waiting to be appended.
struct PendingImage {
    entry: LogEntry,
    provisional: bool,
    generation: u64,

    // older versions, obsolete once this image is installed
    replaced: Vec<(Lsn, LogEntryType, u32)>,

    // what a full BIN image took from the node, given back if the image
    // is superseded
    taken_keys: BTreeSet<u64>,
    took_prohibit: bool,
}

/// The B+tree of one database.
///
/// Latches are taken top-down only: the root reference, then the root
/// node, then one child at a time. A parent latch is released as soon
/// as the child latch is held. Node images are appended to the log
/// with no latch held.
pub struct Tree {
    db_id: DbId,
    root: Arc<Latched<RootRef>>,
    ctx: Arc<TreeContext>,
}

impl Tree {
    pub fn new(db_id: DbId, root_lsn: Lsn, ctx: Arc<TreeContext>) -> Self {
        let latch = ctx.root_latches.create(&format!("root_{}", db_id));
        let root = RootRef {
            node: None,
            lsn: root_lsn,
        };
        Self {
            db_id,
            root: Arc::new(Latched::new(latch, root)),
            ctx,
        }
    }

    pub fn db_id(&self) -> DbId {
        self.db_id
    }

    pub fn root_lsn(&self) -> Lsn {
        self.root.latch().lsn
    }

    /// Id of the root node if it is resident.
    pub fn root_node_id(&self) -> Option<NodeId> {
        let root = self.root.latch();
        root.node.as_ref().map(|n| n.latch().node_id)
    }

    fn fetch(&self, lsn: Lsn) -> SmallResult<NodeRef> {
        let log = &self.ctx.log;
        let (header, entry) = log.read_entry(lsn)?;
        let size = header.total_size() as u32;

        let node = match entry {
            LogEntry::IN(image) => Node::fetched(
                image.node_id,
                image.db_id,
                lsn,
                size,
                NodeBody::Internal(InNode::from_image(&image)),
            ),
            LogEntry::BIN(image) => Node::fetched(
                image.node_id,
                image.db_id,
                lsn,
                size,
                NodeBody::Bottom(Bin::from_image(&image, lsn, size)),
            ),
            LogEntry::BINDelta(delta) => {
                let (full_header, full_entry) = log.read_entry(delta.last_full_lsn)?;
                let full = match full_entry {
                    LogEntry::BIN(image) => image,
                    other => {
                        return Err(SmallError::LogFormat(format!(
                            "delta at {} refers to a {:?} at {}",
                            lsn,
                            other.entry_type(),
                            delta.last_full_lsn
                        )))
                    }
                };
                let bin = Bin::from_delta(&full, full_header.total_size() as u32, &delta, lsn, size);
                Node::fetched(delta.node_id, delta.db_id, lsn, size, NodeBody::Bottom(bin))
            }
            other => {
                return Err(SmallError::LogFormat(format!(
                    "expected a tree node at {}, found a {:?}",
                    lsn,
                    other.entry_type()
                )))
            }
        };

        self.ctx.bump_node_id(node.node_id + 1);
        debug!("fetched {}", node);
        Ok(self.ctx.wrap(node))
    }

    fn resident_root(&self, root: &mut RootRef) -> SmallResult<Option<NodeRef>> {
        if root.node.is_none() && !root.lsn.is_null() {
            root.node = Some(self.fetch(root.lsn)?);
        }
        Ok(root.node.clone())
    }

    fn resident_child(&self, parent: &mut Node, idx: usize) -> SmallResult<NodeRef> {
        let inn = parent
            .as_in_mut()
            .ok_or_else(|| SmallError::new("child lookup on a BIN"))?;
        let entry = &mut inn.entries[idx];
        if let Some(node) = &entry.node {
            return Ok(node.clone());
        }
        let node = self.fetch(entry.lsn)?;
        entry.node = Some(node.clone());
        Ok(node)
    }

    /// Latch the BIN whose range holds `key`, `None` for an empty tree.
    pub fn search(&self, key: u64) -> SmallResult<Option<LatchGuard<Node>>> {
        let mut guard = {
            let mut root = self.root.latch();
            match self.resident_root(&mut root)? {
                Some(node) => node.latch(),
                None => return Ok(None),
            }
        };

        loop {
            let idx = match guard.as_in() {
                Some(inn) => inn.find_child(key),
                None => return Ok(Some(guard)),
            };
            let child = self.resident_child(&mut guard, idx)?;
            let child_guard = child.latch();
            guard = child_guard;
        }
    }

    /// Like `search`, but creates the root if there is none and splits
    /// every full node on the way down, so the returned BIN has room
    /// for one more slot.
    ///
    /// Split halves come back unlogged, the caller hands them to
    /// `log_split_halves` once it has released the BIN.
    pub fn search_splitting(&self, key: u64) -> SmallResult<(LatchGuard<Node>, Vec<SplitHalf>)> {
        let limits = (self.ctx.bin_max_entries, self.ctx.in_max_entries);
        let mut halves = Vec::new();

        let mut guard = {
            let mut root = self.root.latch();
            let node = match self.resident_root(&mut root)? {
                Some(node) => node,
                None => {
                    let node = self.ctx.wrap(Node::new_bin(self.ctx.new_node_id(), self.db_id));
                    root.node = Some(node.clone());
                    node
                }
            };
            let node_guard = node.latch();
            if node_guard.is_full(limits.0, limits.1) {
                self.split_root(&mut root, node_guard, key, &mut halves)?
            } else {
                node_guard
            }
        };

        loop {
            let idx = match guard.as_in() {
                Some(inn) => inn.find_child(key),
                None => return Ok((guard, halves)),
            };
            let child = self.resident_child(&mut guard, idx)?;
            let mut child_guard = child.latch();
            if child_guard.is_full(limits.0, limits.1) {
                child_guard = self.split_child(&mut guard, idx, child_guard, key, &mut halves)?;
            }
            guard = child_guard;
        }
    }

    /// Put a new IN above the full root and split the old root under
    /// it. Returns the new root, latched.
    fn split_root(
        &self,
        root: &mut RootRef,
        old_root: LatchGuard<Node>,
        key: u64,
        halves: &mut Vec<SplitHalf>,
    ) -> SmallResult<LatchGuard<Node>> {
        let level = old_root.level() + 1;
        let entry = ChildRef::resident(0, old_root.last_logged_lsn, old_root.latched().clone());
        let new_root = self.ctx.wrap(Node::new_in(
            self.ctx.new_node_id(),
            self.db_id,
            InNode::new(level, vec![entry]),
        ));

        let mut root_guard = new_root.latch();
        let child = self.split_child(&mut root_guard, 0, old_root, key, halves)?;
        drop(child);

        debug!("root of db {} split, new root {}", self.db_id, *root_guard);
        root.node = Some(new_root.clone());
        Ok(root_guard)
    }

    /// Split the full child at `idx` of `parent`. Nothing is logged
    /// here: both halves lose their image in the parent and are queued
    /// in `halves`, the parent is left dirty.
    ///
    /// Returns whichever half holds `key`, latched.
    fn split_child(
        &self,
        parent: &mut LatchGuard<Node>,
        idx: usize,
        mut child: LatchGuard<Node>,
        key: u64,
        halves: &mut Vec<SplitHalf>,
    ) -> SmallResult<LatchGuard<Node>> {
        let (split_key, sibling_body) = match &mut child.body {
            NodeBody::Bottom(bin) => {
                let (k, upper) = bin.split();
                (k, NodeBody::Bottom(upper))
            }
            NodeBody::Internal(inn) => {
                let (k, upper) = inn.split();
                (k, NodeBody::Internal(upper))
            }
        };
        child.generation += 1;
        child.dirty = true;

        let sibling = Node {
            node_id: self.ctx.new_node_id(),
            db_id: self.db_id,
            dirty: true,
            last_logged_lsn: NULL_LSN,
            last_logged_size: 0,
            generation: 0,
            n_in_flight: 0,
            body: sibling_body,
        };
        debug!("split {} at key {}, new sibling {}", *child, split_key, sibling);
        let sibling = self.ctx.wrap(sibling);

        let parent_ref = parent.latched().clone();
        let inn = parent
            .as_in_mut()
            .ok_or_else(|| SmallError::new("split under a BIN"))?;
        inn.entries[idx].lsn = NULL_LSN;
        inn.entries
            .insert(idx + 1, ChildRef::resident(split_key, NULL_LSN, sibling.clone()));
        parent.dirty = true;

        halves.push(SplitHalf {
            parent: parent_ref.clone(),
            node: child.latched().clone(),
        });
        halves.push(SplitHalf {
            parent: parent_ref,
            node: sibling.clone(),
        });

        if key >= split_key {
            Ok(sibling.latch())
        } else {
            Ok(child)
        }
    }

    /// Log the halves left by `search_splitting`, provisionally, and
    /// point their parents at the new images. Must be called without
    /// any latch held.
    pub fn log_split_halves(&self, halves: Vec<SplitHalf>) -> SmallResult {
        for half in halves {
            let image = {
                let mut guard = half.node.latch();
                if guard.is_clean() {
                    // a checkpoint got there first
                    continue;
                }
                self.prepare_image(&mut guard, true, false)
            };
            if let Some((lsn, generation)) = self.write_image(&half.node, image)? {
                Self::install_child(&half.parent, &half.node, lsn, generation);
            }
        }
        Ok(())
    }

    /// Build the committed image of `node` under its latch. A BIN image
    /// is a delta when allowed and worth it, and when no other image of
    /// the node is in flight.
    fn prepare_image(&self, node: &mut Node, provisional: bool, allow_delta: bool) -> PendingImage {
        let node_id = node.node_id;
        let db_id = node.db_id;
        let allow_delta = allow_delta && node.n_in_flight == 0;
        node.generation += 1;
        node.n_in_flight += 1;
        node.dirty = false;

        let mut replaced = Vec::new();
        let mut taken_keys = BTreeSet::new();
        let mut took_prohibit = false;
        let entry = match &mut node.body {
            NodeBody::Internal(inn) => {
                if !node.last_logged_lsn.is_null() {
                    replaced.push((node.last_logged_lsn, LogEntryType::IN, node.last_logged_size));
                }
                LogEntry::IN(inn.image(node_id, db_id))
            }
            NodeBody::Bottom(bin)
                if allow_delta
                    && bin.should_log_delta(self.ctx.bin_delta_percent, self.ctx.bin_max_deltas) =>
            {
                if !bin.last_delta_lsn.is_null() {
                    replaced.push((bin.last_delta_lsn, LogEntryType::BINDelta, bin.last_delta_size));
                }
                LogEntry::BINDelta(bin.delta_image(node_id, db_id))
            }
            NodeBody::Bottom(bin) => {
                // the full image replaces the delta chain too
                if !bin.last_full_lsn.is_null() {
                    replaced.push((bin.last_full_lsn, LogEntryType::BIN, bin.last_full_size));
                }
                if !bin.last_delta_lsn.is_null() {
                    replaced.push((bin.last_delta_lsn, LogEntryType::BINDelta, bin.last_delta_size));
                }
                taken_keys = mem::take(&mut bin.delta_keys);
                took_prohibit = mem::replace(&mut bin.prohibit_delta, false);
                LogEntry::BIN(bin.full_image(node_id, db_id))
            }
        };

        PendingImage {
            entry,
            provisional,
            generation: node.generation,
            replaced,
            taken_keys,
            took_prohibit,
        }
    }

    /// Append a prepared image with no latch held, then install it.
    ///
    /// Returns the image's LSN and the node's generation, `None` if the
    /// node split or got another image meanwhile. A superseded image is
    /// obsolete right away and the node stays dirty.
    fn write_image(&self, node_ref: &NodeRef, image: PendingImage) -> SmallResult<Option<(Lsn, u64)>> {
        let log = &self.ctx.log;
        let logged = log.log_entry(&image.entry, image.provisional, false, NULL_LSN, 0);
        let entry_type = image.entry.entry_type();

        let mut guard = node_ref.latch();
        guard.n_in_flight -= 1;
        let (lsn, size) = match logged {
            Ok(v) => v,
            Err(e) => {
                Self::restore(&mut guard, image);
                return Err(e);
            }
        };
        if guard.generation != image.generation {
            debug!("image of {} at {} superseded", *guard, lsn);
            Self::restore(&mut guard, image);
            log.count_obsolete_node(lsn, entry_type, size);
            return Ok(None);
        }

        if let Some(bin) = guard.as_bin_mut() {
            match entry_type {
                LogEntryType::BINDelta => {
                    bin.last_delta_lsn = lsn;
                    bin.last_delta_size = size;
                    bin.n_deltas += 1;
                }
                _ => {
                    bin.last_full_lsn = lsn;
                    bin.last_full_size = size;
                    bin.last_delta_lsn = NULL_LSN;
                    bin.last_delta_size = 0;
                    bin.n_deltas = 0;
                }
            }
        }
        guard.last_logged_lsn = lsn;
        guard.last_logged_size = size;
        log.count_obsolete_nodes(&image.replaced);
        Ok(Some((lsn, guard.generation)))
    }

    /// Undo what `prepare_image` took from the node.
    fn restore(node: &mut Node, image: PendingImage) {
        node.dirty = true;
        if let Some(bin) = node.as_bin_mut() {
            bin.delta_keys.extend(image.taken_keys);
            bin.prohibit_delta |= image.took_prohibit;
        }
    }

    /// Point the parent's entry for `child` at `lsn`, unless the child
    /// changed since that image was built.
    fn install_child(parent_ref: &NodeRef, child: &NodeRef, lsn: Lsn, generation: u64) {
        let mut parent = parent_ref.latch();
        if child.latch().generation != generation {
            return;
        }
        let mut changed = false;
        if let Some(inn) = parent.as_in_mut() {
            let entry = inn
                .entries
                .iter_mut()
                .find(|e| e.node.as_ref().map_or(false, |n| Arc::ptr_eq(n, child)));
            if let Some(entry) = entry {
                changed = entry.lsn != lsn;
                entry.lsn = lsn;
            }
        }
        if changed {
            parent.dirty = true;
        }
    }

    /// Log every dirty resident node, children before parents. Nodes
    /// below the root are provisional, the root is not.
    ///
    /// Returns the new root LSN if it moved.
    pub fn flush_dirty(&self, stats: &mut FlushStats) -> SmallResult<Option<Lsn>> {
        loop {
            let root_node = {
                let root = self.root.latch();
                match &root.node {
                    Some(n) => n.clone(),
                    None => return Ok(None),
                }
            };

            let (lsn, generation) = self.flush_node(&root_node, true, stats)?;

            let mut root = self.root.latch();
            let unchanged = match &root.node {
                Some(n) => Arc::ptr_eq(n, &root_node) && n.latch().generation == generation,
                None => false,
            };
            if !unchanged {
                // the root split while we were flushing
                continue;
            }
            if lsn == root.lsn {
                return Ok(None);
            }
            root.lsn = lsn;
            return Ok(Some(lsn));
        }
    }

    /// Flush the subtree of `node_ref`. No latch is held while a child
    /// is flushed or an image is appended.
    fn flush_node(&self, node_ref: &NodeRef, is_root: bool, stats: &mut FlushStats) -> SmallResult<(Lsn, u64)> {
        loop {
            // step 1: the resident children
            let children: Vec<NodeRef> = match node_ref.latch().as_in() {
                Some(inn) => inn.entries.iter().filter_map(|e| e.node.clone()).collect(),
                None => Vec::new(),
            };
            for child in &children {
                let (lsn, generation) = self.flush_node(child, false, stats)?;
                Self::install_child(node_ref, child, lsn, generation);
            }

            // step 2: the image, built under the latch
            let image = {
                let mut guard = node_ref.latch();
                let incomplete = guard
                    .as_in()
                    .map_or(false, |inn| inn.entries.iter().any(|e| e.lsn.is_null()));
                if incomplete {
                    // a child split after step 1
                    continue;
                }
                if guard.is_clean() {
                    return Ok((guard.last_logged_lsn, guard.generation));
                }
                self.prepare_image(&mut guard, !is_root, true)
            };

            // step 3: appended unlatched
            let entry_type = image.entry.entry_type();
            if let Some(logged) = self.write_image(node_ref, image)? {
                stats.count(entry_type);
                return Ok(logged);
            }
        }
    }

    /// Detach clean BINs from their parents. Latched BINs, BINs with
    /// uncommitted slots and the root are skipped.
    pub fn evict(&self) -> SmallResult<usize> {
        let root_node = {
            let root = self.root.latch();
            match &root.node {
                Some(n) => n.clone(),
                None => return Ok(0),
            }
        };
        Ok(self.evict_below(&root_node))
    }

    fn evict_below(&self, node_ref: &NodeRef) -> usize {
        let mut guard = node_ref.latch();
        let inn = match guard.as_in_mut() {
            Some(inn) => inn,
            None => return 0,
        };

        let mut n_evicted = 0;
        let mut moved = false;
        for entry in inn.entries.iter_mut() {
            let child = match &entry.node {
                Some(c) => c.clone(),
                None => continue,
            };

            let child_guard = match child.try_latch() {
                Some(g) => g,
                None => continue,
            };
            let (is_bin, evictable) = match child_guard.as_bin() {
                Some(bin) => (true, child_guard.is_clean() && !bin.has_pending()),
                None => (false, false),
            };
            if !is_bin {
                drop(child_guard);
                n_evicted += self.evict_below(&child);
                continue;
            }
            if evictable {
                moved |= entry.lsn != child_guard.last_logged_lsn;
                entry.lsn = child_guard.last_logged_lsn;
                entry.node = None;
                n_evicted += 1;
            }
        }
        if moved {
            guard.dirty = true;
        }
        n_evicted
    }

    /// Every slot key in the tree, in order, deleted slots included.
    pub fn keys(&self) -> SmallResult<Vec<u64>> {
        let root_node = {
            let mut root = self.root.latch();
            match self.resident_root(&mut root)? {
                Some(n) => n,
                None => return Ok(Vec::new()),
            }
        };
        let mut keys = Vec::new();
        self.collect_keys(&root_node, &mut keys)?;
        Ok(keys)
    }

    fn collect_keys(&self, node_ref: &NodeRef, keys: &mut Vec<u64>) -> SmallResult {
        let mut guard = node_ref.latch();
        let n_children = match &guard.body {
            NodeBody::Bottom(bin) => {
                keys.extend(bin.slots().iter().map(|s| s.key));
                return Ok(());
            }
            NodeBody::Internal(inn) => inn.len(),
        };
        for idx in 0..n_children {
            let child = self.resident_child(&mut guard, idx)?;
            self.collect_keys(&child, keys)?;
        }
        Ok(())
    }

    /// Number of resident nodes.
    pub fn n_resident_nodes(&self) -> usize {
        let root = self.root.latch();
        match &root.node {
            Some(n) => Self::count_resident(n),
            None => 0,
        }
    }

    fn count_resident(node_ref: &NodeRef) -> usize {
        let guard = node_ref.latch();
        match guard.as_in() {
            Some(inn) => {
                1 + inn
                    .entries
                    .iter()
                    .filter_map(|e| e.node.as_ref())
                    .map(Self::count_resident)
                    .sum::<usize>()
            }
            None => 1,
        }
    }

    /// Drop the whole tree from memory. Returns the LSNs of the images
    /// the tree was made of, as far as they are known.
    pub fn release_root(&self) -> Vec<Lsn> {
        let mut root = self.root.latch();
        let mut lsns = Vec::new();
        match root.node.take() {
            Some(node) => Self::collect_logged(&node, &mut lsns),
            None if !root.lsn.is_null() => lsns.push(root.lsn),
            None => {}
        }
        root.lsn = NULL_LSN;
        lsns
    }

    fn collect_logged(node_ref: &NodeRef, lsns: &mut Vec<Lsn>) {
        let guard = node_ref.latch();
        if !guard.last_logged_lsn.is_null() {
            lsns.push(guard.last_logged_lsn);
        }
        if let Some(inn) = guard.as_in() {
            for entry in &inn.entries {
                match &entry.node {
                    Some(child) => Self::collect_logged(child, lsns),
                    None if !entry.lsn.is_null() => lsns.push(entry.lsn),
                    None => {}
                }
            }
        }
    }
}
