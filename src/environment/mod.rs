//! The public face of the engine: an environment owns one log, one lock
//! manager and any number of named databases.

mod database;
mod state;

pub use database::Database;
pub use state::EnvState;

use std::{
    path::Path,
    sync::{
        atomic::{AtomicU64, Ordering},
        Arc,
    },
};

use log::info;
use parking_lot::RwLock;

use crate::{
    btree::{
        BINReference, Catalog, CompressorStats, DatabaseImpl, INCompressor, MapLn, TreeContext,
        MAX_NAME_LEN,
    },
    config::{EnvConfig, IsolationLevel, LockingMode},
    error::SmallError,
    latch::{LatchFactory, LatchKind, LatchTable},
    recovery::{self, CheckpointInfo, Checkpointer, RecoveryInfo},
    transaction::{LockManager, LockStats, Locker, Txn, TxnManager, TxnState, TxnStats},
    tx_log::{LogEntry, LogManager, LogStats},
    types::SmallResult,
};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EnvStats {
    pub log: LogStats,
    pub locks: LockStats,
    pub txns: TxnStats,
    pub compressor: CompressorStats,
    pub n_checkpoints: u64,
}

pub struct EnvironmentImpl {
    pub(crate) config: EnvConfig,
    pub(crate) state: Arc<EnvState>,
    pub(crate) log: Arc<LogManager>,
    pub(crate) lock_manager: Arc<LockManager>,
    pub(crate) txn_manager: TxnManager,
    pub(crate) tree_ctx: Arc<TreeContext>,
    pub(crate) catalog: RwLock<Catalog>,
    pub(crate) next_db_id: AtomicU64,
    pub(crate) compressor: Arc<INCompressor>,
    pub(crate) checkpointer: Checkpointer,
}

impl EnvironmentImpl {
    /// Invalidate the environment if `result` carries a fatal error.
    pub(crate) fn check_result<T>(&self, result: SmallResult<T>) -> SmallResult<T> {
        if let Err(e) = &result {
            if e.is_fatal() {
                self.state.invalidate(e);
            }
        }
        result
    }

    pub(crate) fn database(&self, db_id: u64, name: &str) -> SmallResult<Arc<DatabaseImpl>> {
        self.catalog
            .read()
            .get(db_id)
            .cloned()
            .ok_or_else(|| SmallError::DatabaseNotFound(name.to_string()))
    }

    /// Locker for an operation outside of any transaction.
    pub(crate) fn non_txn_locker(&self) -> Locker {
        match self.config.locking {
            LockingMode::Enabled => Locker::non_txn(&self.lock_manager),
            LockingMode::Disabled => Locker::no_op(&self.lock_manager),
        }
    }
}

/// A handle on an open environment. Clones share the environment.
///
/// Dropping every handle without `close()` leaves the log as a crash
/// would, the next `open` recovers from it.
#[derive(Clone)]
pub struct Environment {
    inner: Arc<EnvironmentImpl>,
}

impl Environment {
    /// Open (or create) the environment at `config.home` and recover
    /// it from its log.
    pub fn open(config: EnvConfig) -> SmallResult<Self> {
        config.validate()?;

        let state = Arc::new(EnvState::new());
        let log = Arc::new(LogManager::open(&config, state.clone())?);

        let latch_table = Arc::new(LatchTable::new());
        let latch_timeout = config.latch_timeout();
        let tree_ctx = Arc::new(TreeContext::new(
            &config,
            log.clone(),
            LatchFactory::new(LatchKind::Shared, latch_timeout, latch_table.clone()),
            LatchFactory::new(LatchKind::Spin, latch_timeout, latch_table),
        ));

        let inner = EnvironmentImpl {
            state,
            log,
            lock_manager: Arc::new(LockManager::new(&config)),
            txn_manager: TxnManager::new(1),
            tree_ctx,
            catalog: RwLock::new(Catalog::new()),
            next_db_id: AtomicU64::new(1),
            compressor: Arc::new(INCompressor::new()),
            checkpointer: Checkpointer::new(),
            config,
        };

        let recovered = recovery::recover(&inner);
        let recovered = inner.check_result(recovered)?;
        info!(
            "environment opened at {:?}: {} databases, {} versions replayed",
            inner.config.home,
            inner.catalog.read().len(),
            recovered.n_replayed
        );

        Ok(Self {
            inner: Arc::new(inner),
        })
    }

    pub fn config(&self) -> &EnvConfig {
        &self.inner.config
    }

    pub fn home(&self) -> &Path {
        &self.inner.config.home
    }

    pub fn log_manager(&self) -> &Arc<LogManager> {
        &self.inner.log
    }

    pub fn lock_manager(&self) -> &Arc<LockManager> {
        &self.inner.lock_manager
    }

    pub fn latch_table(&self) -> &Arc<LatchTable> {
        self.inner.tree_ctx.latch_table()
    }

    pub fn is_valid(&self) -> bool {
        self.inner.state.is_valid()
    }

    pub fn invalid_reason(&self) -> Option<String> {
        self.inner.state.reason().map(|s| s.to_string())
    }

    /// Mark the environment dead, as a fatal error would.
    pub fn invalidate(&self, err: &SmallError) {
        self.inner.state.invalidate(err);
    }

    pub fn begin_transaction(&self) -> SmallResult<Txn> {
        self.begin_transaction_with(self.inner.config.isolation)
    }

    pub fn begin_transaction_with(&self, isolation: IsolationLevel) -> SmallResult<Txn> {
        let env = &self.inner;
        env.state.check()?;
        let (txn_id, begin_lsn) = env.check_result(env.txn_manager.begin(&env.log))?;
        let locker = Arc::new(Locker::txn(&env.lock_manager, txn_id));
        Ok(Txn::new(txn_id, locker, begin_lsn, isolation))
    }

    fn commit_writes(&self, txn: &Txn) -> SmallResult {
        let env = &self.inner;
        env.state.check()?;
        if !txn.is_active() {
            return Err(SmallError::TxnNotActive(txn.id()));
        }

        // step 1: the commit entry, durable per the configured policy
        let lsn = env.log.log(&LogEntry::Commit { txn_id: txn.id() })?;
        env.log.flush_to(lsn, env.config.durability)?;

        // step 2: the written versions become the committed ones
        for (resource, info) in txn.locker().write_lock_infos() {
            let db = env.catalog.read().get(resource.db_id).cloned();
            if let Some(db) = db {
                db.commit_write(resource.key, txn.id(), &info)?;
            }
        }

        env.txn_manager.end(txn.id(), true);
        txn.set_state(TxnState::Committed);
        Ok(())
    }

    pub fn commit(&self, txn: &Txn) -> SmallResult {
        let result = self.commit_writes(txn);
        self.inner.check_result(result)?;
        txn.locker().release_all()?;
        Ok(())
    }

    /// Commit, handing the txn's locks over to a new non-transactional
    /// locker. Write locks are demoted to read locks on the way.
    pub fn commit_retaining(&self, txn: &Txn) -> SmallResult<Locker> {
        let result = self.commit_writes(txn);
        self.inner.check_result(result)?;
        let successor = Locker::non_txn(&self.inner.lock_manager);
        txn.locker().transfer_locks_to(&successor, true)?;
        Ok(successor)
    }

    fn abort_writes(&self, txn: &Txn) -> SmallResult {
        let env = &self.inner;
        env.state.check()?;
        if !txn.is_active() {
            return Err(SmallError::TxnNotActive(txn.id()));
        }
        env.log.log(&LogEntry::Abort { txn_id: txn.id() })?;

        for (resource, info) in txn.locker().write_lock_infos() {
            let db = env.catalog.read().get(resource.db_id).cloned();
            if let Some(db) = db {
                db.undo_write(resource.key, txn.id(), &info)?;
            }
        }

        env.txn_manager.end(txn.id(), false);
        txn.set_state(TxnState::Aborted);
        Ok(())
    }

    pub fn abort(&self, txn: &Txn) -> SmallResult {
        let result = self.abort_writes(txn);
        self.inner.check_result(result)?;
        txn.locker().release_all()?;
        Ok(())
    }

    pub fn create_database(&self, name: &str) -> SmallResult<Database> {
        let env = &self.inner;
        env.state.check()?;
        if name.len() > MAX_NAME_LEN {
            return Err(SmallError::Config(format!(
                "database name is {} bytes, at most {} allowed",
                name.len(),
                MAX_NAME_LEN
            )));
        }

        let mut catalog = env.catalog.write();
        if catalog.get_by_name(name).is_some() {
            return Err(SmallError::DatabaseExists(name.to_string()));
        }
        let db_id = env.next_db_id.fetch_add(1, Ordering::SeqCst);
        let db = DatabaseImpl::new(MapLn::new(db_id, name), env.tree_ctx.clone(), env.compressor.clone());
        env.check_result(db.log_map_ln(false))?;

        info!("database {} created with id {}", name, db_id);
        catalog.add(Arc::new(db));
        Ok(Database::new(env.clone(), db_id, name))
    }

    pub fn open_database(&self, name: &str) -> SmallResult<Database> {
        let env = &self.inner;
        env.state.check()?;
        let catalog = env.catalog.read();
        match catalog.get_by_name(name) {
            Some(db) => Ok(Database::new(env.clone(), db.id(), name)),
            None => Err(SmallError::DatabaseNotFound(name.to_string())),
        }
    }

    /// Mark the database deleted in the naming tree and drop its tree.
    pub fn remove_database(&self, name: &str) -> SmallResult {
        let env = &self.inner;
        env.state.check()?;

        let mut catalog = env.catalog.write();
        let db = match catalog.get_by_name(name) {
            Some(db) => db.clone(),
            None => return Err(SmallError::DatabaseNotFound(name.to_string())),
        };
        env.check_result(db.log_map_ln(true))?;
        catalog.remove(db.id());
        db.release();
        info!("database {} removed", name);
        Ok(())
    }

    pub fn database_names(&self) -> Vec<String> {
        self.inner.catalog.read().names()
    }

    pub fn checkpoint(&self) -> SmallResult<CheckpointInfo> {
        let result = self.inner.checkpointer.checkpoint(&self.inner);
        self.inner.check_result(result)
    }

    /// Rebuild every tree from the log. No transaction may be active.
    pub fn recover(&self) -> SmallResult<RecoveryInfo> {
        let env = &self.inner;
        env.state.check()?;
        let n_active = env.txn_manager.n_active();
        if n_active > 0 {
            return Err(SmallError::Internal(format!(
                "can't recover with {} active transactions",
                n_active
            )));
        }
        let result = recovery::recover(env);
        env.check_result(result)
    }

    /// Remove the slots of committed deletes. Slots whose record lock
    /// is busy stay queued. Returns the number of slots removed.
    pub fn compress(&self) -> SmallResult<usize> {
        let env = &self.inner;
        env.state.check()?;

        let locker = env.non_txn_locker();
        let mut n_removed = 0;
        for bin_ref in env.compressor.take_all() {
            let db = match env.catalog.read().get(bin_ref.db_id).cloned() {
                Some(db) => db,
                None => continue,
            };

            let mut retry = BINReference::new(bin_ref.node_id, bin_ref.db_id, bin_ref.id_key);
            for key in bin_ref.deleted_keys() {
                let result = db.compress_key(&locker, key);
                locker.operation_end()?;
                match env.check_result(result)? {
                    Some(true) => n_removed += 1,
                    Some(false) => {}
                    None => retry.add_deleted_key(key),
                }
            }
            if retry.deleted_keys_exist() {
                env.compressor.requeue(retry);
            }
        }
        env.compressor.count_removed(n_removed as u64);
        Ok(n_removed)
    }

    /// Detach clean BINs from memory. Returns the number detached.
    pub fn evict(&self) -> SmallResult<usize> {
        let env = &self.inner;
        env.state.check()?;
        let mut n = 0;
        for db in env.catalog.read().databases() {
            n += env.check_result(db.tree().evict())?;
        }
        Ok(n)
    }

    /// Checkpoint and flush. Dropping without closing behaves like a
    /// crash.
    pub fn close(self) -> SmallResult {
        let env = &self.inner;
        env.state.check()?;
        self.checkpoint()?;
        env.check_result(env.log.flush())?;
        info!("environment at {:?} closed", env.config.home);
        Ok(())
    }

    pub fn stats(&self) -> EnvStats {
        let env = &self.inner;
        EnvStats {
            log: env.log.stats(),
            locks: env.lock_manager.stats(),
            txns: env.txn_manager.stats(),
            compressor: env.compressor.stats(),
            n_checkpoints: env.checkpointer.n_checkpoints(),
        }
    }
}
