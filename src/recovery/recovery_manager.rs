use std::{
    collections::{BTreeMap, BTreeSet},
    sync::{atomic::Ordering, Arc},
};

use log::{debug, info};

use crate::{
    btree::{DatabaseImpl, MapLn},
    environment::EnvironmentImpl,
    error::SmallError,
    tx_log::{CheckpointFileReader, LogEntry, LogEntryType, LogReader, Lsn},
    types::{DbId, NodeId, SmallResult, TxnId, NON_TXN_ID},
};

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RecoveryInfo {
    pub checkpoint_end_lsn: Option<Lsn>,
    pub checkpoint_start_lsn: Option<Lsn>,
    pub root_lsn: Option<Lsn>,
    pub redo_start: Lsn,
    pub end_of_log: Lsn,

    /// Record versions written into the trees by the redo pass.
    pub n_replayed: u64,
    pub committed_txns: Vec<TxnId>,

    /// Begun but never committed, their writes were skipped.
    pub rolled_back_txns: Vec<TxnId>,
}

fn recovery_error(context: &str, e: SmallError) -> SmallError {
    match e {
        SmallError::Recovery(_) => e,
        other => SmallError::Recovery(format!("{}: {}", context, other)),
    }
}

/// What the last complete checkpoint says.
struct CheckpointAnchor {
    end_lsn: Lsn,
    start_lsn: Lsn,
    root_lsn: Lsn,
    redo_start: Lsn,
    map_lns: Vec<MapLn>,
    next_node_id: NodeId,
    next_db_id: DbId,
    next_txn_id: TxnId,
    checkpoint_id: u64,
}

/// Everything the first pass learns about the log after the redo start.
#[derive(Default)]
struct Analysis {
    begun: BTreeSet<TxnId>,
    committed: BTreeSet<TxnId>,
    removed_dbs: BTreeSet<DbId>,
    max_txn_id: TxnId,
    max_node_id: NodeId,
    max_db_id: DbId,
}

/// Rebuild the environment's trees from the log.
///
/// The log is a redo log: the trees are loaded as of the last complete
/// checkpoint, then every record version written by a committed
/// transaction (or by no transaction) after the redo start is applied
/// again. Versions of transactions without a `Commit` are never
/// applied.
pub fn recover(env: &EnvironmentImpl) -> SmallResult<RecoveryInfo> {
    env.log.flush()?;
    let mut info = RecoveryInfo {
        end_of_log: env.log.end_of_log(),
        ..Default::default()
    };
    info!("recovery started, end of log {}", info.end_of_log);

    // step 1: the last checkpoint, if any
    let anchor = find_checkpoint(env).map_err(|e| recovery_error("checkpoint lookup", e))?;
    let mut map_lns = Vec::new();
    info.redo_start = match anchor {
        Some(a) => {
            info!(
                "last checkpoint {} ends at {}, starts at {}",
                a.checkpoint_id, a.end_lsn, a.start_lsn
            );
            info.checkpoint_end_lsn = Some(a.end_lsn);
            info.checkpoint_start_lsn = Some(a.start_lsn);
            info.root_lsn = Some(a.root_lsn);
            env.tree_ctx.bump_node_id(a.next_node_id);
            env.next_db_id.fetch_max(a.next_db_id, Ordering::SeqCst);
            env.txn_manager.bump_next_txn_id(a.next_txn_id);
            env.checkpointer.bump_checkpoint_id(a.checkpoint_id + 1);
            map_lns = a.map_lns;
            a.redo_start
        }
        None => {
            info!("no checkpoint found, redo starts at the head of the log");
            env.log.first_lsn()
        }
    };

    // step 2: which transactions committed
    let analysis = analyze(env, info.redo_start).map_err(|e| recovery_error("analysis pass", e))?;
    info!(
        "analysis from {}: {} txns begun, {} committed",
        info.redo_start,
        analysis.begun.len(),
        analysis.committed.len()
    );

    // step 3: the databases as of the checkpoint
    let _ = env.compressor.take_all();
    let mut databases: BTreeMap<DbId, Arc<DatabaseImpl>> = BTreeMap::new();
    for map_ln in map_lns {
        if map_ln.deleted {
            continue;
        }
        let db = DatabaseImpl::new(map_ln, env.tree_ctx.clone(), env.compressor.clone());
        databases.insert(db.id(), Arc::new(db));
    }

    // step 4: redo
    info.n_replayed = redo(env, info.redo_start, &analysis, &mut databases)
        .map_err(|e| recovery_error("redo pass", e))?;

    {
        let mut catalog = env.catalog.write();
        catalog.clear();
        for db in databases.into_values() {
            catalog.add(db);
        }
    }

    env.tree_ctx.bump_node_id(analysis.max_node_id + 1);
    env.next_db_id.fetch_max(analysis.max_db_id + 1, Ordering::SeqCst);
    env.txn_manager.bump_next_txn_id(analysis.max_txn_id + 1);

    info.committed_txns = analysis.committed.iter().copied().collect();
    info.rolled_back_txns = analysis.begun.difference(&analysis.committed).copied().collect();
    info!(
        "recovery done: {} versions replayed, {} txns rolled back",
        info.n_replayed,
        info.rolled_back_txns.len()
    );
    Ok(info)
}

fn find_checkpoint(env: &EnvironmentImpl) -> SmallResult<Option<CheckpointAnchor>> {
    let mut reader = CheckpointFileReader::new(&env.log);
    let (end_lsn, end) = match reader.find_last(LogEntryType::CheckpointEnd)? {
        Some(v) => v,
        None => return Ok(None),
    };
    let (checkpoint_id, start_lsn, root_lsn, next_node_id, next_db_id, next_txn_id) = match end {
        LogEntry::CheckpointEnd {
            checkpoint_id,
            start_lsn,
            root_lsn,
            next_node_id,
            next_db_id,
            next_txn_id,
        } => (checkpoint_id, start_lsn, root_lsn, next_node_id, next_db_id, next_txn_id),
        other => {
            return Err(SmallError::Recovery(format!(
                "expected a checkpoint end at {}, found a {:?}",
                end_lsn,
                other.entry_type()
            )))
        }
    };

    let active = match env.log.read_entry(start_lsn)?.1 {
        LogEntry::CheckpointStart {
            checkpoint_id: id,
            active_txns,
        } if id == checkpoint_id => active_txns,
        other => {
            return Err(SmallError::Recovery(format!(
                "checkpoint {} ending at {} has no start at {}, found a {:?}",
                checkpoint_id,
                end_lsn,
                start_lsn,
                other.entry_type()
            )))
        }
    };

    let root = match env.log.read_entry(root_lsn)?.1 {
        LogEntry::Root { map_lns } => map_lns,
        other => {
            return Err(SmallError::Recovery(format!(
                "checkpoint {} refers to a {:?} at {} as its root",
                checkpoint_id,
                other.entry_type(),
                root_lsn
            )))
        }
    };

    let mut map_lns = Vec::new();
    for (db_id, lsn) in root {
        let (header, entry) = env.log.read_entry(lsn)?;
        match entry {
            LogEntry::MapLN(image) if image.db_id == db_id => {
                map_lns.push(MapLn::from_image(image, lsn, header.total_size() as u32));
            }
            other => {
                return Err(SmallError::Recovery(format!(
                    "root lists db {} at {}, found a {:?}",
                    db_id,
                    lsn,
                    other.entry_type()
                )))
            }
        }
    }

    let redo_start = active
        .iter()
        .map(|a| a.first_lsn)
        .chain(std::iter::once(start_lsn))
        .min()
        .unwrap_or(start_lsn);

    Ok(Some(CheckpointAnchor {
        end_lsn,
        start_lsn,
        root_lsn,
        redo_start,
        map_lns,
        next_node_id,
        next_db_id,
        next_txn_id,
        checkpoint_id,
    }))
}

fn analyze(env: &EnvironmentImpl, redo_start: Lsn) -> SmallResult<Analysis> {
    let mut analysis = Analysis::default();
    for item in LogReader::new(&env.log, redo_start) {
        let (_, header, entry) = item?;
        if let Some(txn_id) = entry.txn_id() {
            analysis.max_txn_id = analysis.max_txn_id.max(txn_id);
        }
        match entry {
            LogEntry::Begin { txn_id } => {
                analysis.begun.insert(txn_id);
            }
            LogEntry::Commit { txn_id } => {
                analysis.committed.insert(txn_id);
            }
            LogEntry::MapLN(image) => {
                analysis.max_db_id = analysis.max_db_id.max(image.db_id);
                if image.deleted && !header.provisional {
                    analysis.removed_dbs.insert(image.db_id);
                }
            }
            LogEntry::IN(image) => analysis.max_node_id = analysis.max_node_id.max(image.node_id),
            LogEntry::BIN(image) => analysis.max_node_id = analysis.max_node_id.max(image.node_id),
            LogEntry::BINDelta(image) => {
                analysis.max_node_id = analysis.max_node_id.max(image.node_id)
            }
            _ => {}
        }
    }
    Ok(analysis)
}

fn redo(
    env: &EnvironmentImpl,
    redo_start: Lsn,
    analysis: &Analysis,
    databases: &mut BTreeMap<DbId, Arc<DatabaseImpl>>,
) -> SmallResult<u64> {
    let mut n_replayed = 0;
    for item in LogReader::new(&env.log, redo_start) {
        let (lsn, header, entry) = item?;
        let size = header.total_size() as u32;

        let (txn_id, db_id, key, deleted) = match entry {
            LogEntry::MapLN(image) => {
                if header.provisional {
                    continue;
                }
                let known = databases.get(&image.db_id).map(|db| db.map_ln_lsn());
                if matches!(known, Some(known) if known >= lsn) {
                    continue;
                }
                if image.deleted {
                    debug!("redo: db {} removed at {}", image.db_id, lsn);
                    databases.remove(&image.db_id);
                } else if known.is_none() {
                    debug!("redo: db {} ({}) created at {}", image.db_id, image.name, lsn);
                    let map_ln = MapLn::from_image(image, lsn, size);
                    let db = DatabaseImpl::new(map_ln, env.tree_ctx.clone(), env.compressor.clone());
                    databases.insert(db.id(), Arc::new(db));
                }
                continue;
            }
            LogEntry::StoreObject {
                txn_id, db_id, oid, ..
            } => (txn_id, db_id, oid, false),
            LogEntry::DeleteObject { txn_id, db_id, oid } => (txn_id, db_id, oid, true),
            _ => continue,
        };

        if txn_id != NON_TXN_ID && !analysis.committed.contains(&txn_id) {
            continue;
        }
        let db = match databases.get(&db_id) {
            Some(db) => db,
            None if analysis.removed_dbs.contains(&db_id) => continue,
            None => {
                return Err(SmallError::Recovery(format!(
                    "record {}/{} at {} belongs to an unknown database",
                    db_id, key, lsn
                )))
            }
        };
        if db.redo(key, lsn, size, deleted)? {
            n_replayed += 1;
        }
    }
    Ok(n_replayed)
}
