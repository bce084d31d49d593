use std::{fmt, sync::Arc};

use super::EnvironmentImpl;
use crate::{
    btree::DatabaseImpl,
    config::IsolationLevel,
    error::SmallError,
    transaction::{Locker, Txn},
    types::{DbId, SmallResult},
};

/// Handle on one database of an environment.
///
/// Every operation takes an optional transaction. Without one, writes
/// are locked for the duration of the operation only, reads follow the
/// environment's isolation level.
#[derive(Clone)]
pub struct Database {
    env: Arc<EnvironmentImpl>,
    id: DbId,
    name: String,
}

impl Database {
    pub(crate) fn new(env: Arc<EnvironmentImpl>, id: DbId, name: &str) -> Self {
        Self {
            env,
            id,
            name: name.to_string(),
        }
    }

    pub fn id(&self) -> DbId {
        self.id
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    fn database(&self) -> SmallResult<Arc<DatabaseImpl>> {
        self.env.state.check()?;
        self.env.database(self.id, &self.name)
    }

    fn write_op<T>(
        &self,
        txn: Option<&Txn>,
        op: impl FnOnce(&DatabaseImpl, &Locker) -> SmallResult<T>,
    ) -> SmallResult<T> {
        let db = self.database()?;
        let result = match txn {
            Some(txn) => {
                if !txn.is_active() {
                    return Err(SmallError::TxnNotActive(txn.id()));
                }
                op(&db, txn.locker())
            }
            None => {
                let locker = self.env.non_txn_locker();
                let result = op(&db, &locker);
                locker.operation_end()?;
                result
            }
        };
        self.env.check_result(result)
    }

    fn read_op<T>(
        &self,
        txn: Option<&Txn>,
        op: impl FnOnce(&DatabaseImpl, Option<&Locker>) -> SmallResult<T>,
    ) -> SmallResult<T> {
        let db = self.database()?;
        let lock_manager = &self.env.lock_manager;

        let result = match txn {
            Some(txn) => {
                if !txn.is_active() {
                    return Err(SmallError::TxnNotActive(txn.id()));
                }
                match txn.isolation() {
                    IsolationLevel::ReadUncommitted => op(&db, None),
                    IsolationLevel::ReadCommitted => {
                        // read locks end with the operation, the txn's
                        // own write locks still count as ours
                        let buddy = Locker::buddy(lock_manager, txn.locker().clone());
                        let result = op(&db, Some(&buddy));
                        buddy.operation_end()?;
                        result
                    }
                    IsolationLevel::RepeatableRead => op(&db, Some(txn.locker())),
                }
            }
            None => match self.env.config.isolation {
                IsolationLevel::ReadUncommitted => op(&db, None),
                _ => {
                    let locker = Locker::thread_shared(lock_manager);
                    let result = op(&db, Some(&locker));
                    locker.operation_end()?;
                    result
                }
            },
        };
        self.env.check_result(result)
    }

    pub fn get(&self, txn: Option<&Txn>, key: u64) -> SmallResult<Option<Vec<u8>>> {
        self.read_op(txn, |db, locker| db.get(locker, key))
    }

    pub fn put(&self, txn: Option<&Txn>, key: u64, value: &[u8]) -> SmallResult {
        self.put_object(txn, key, 0, value)
    }

    /// Store `value` under object id `key`, tagged with class id `cid`.
    pub fn put_object(&self, txn: Option<&Txn>, key: u64, cid: u32, value: &[u8]) -> SmallResult {
        self.write_op(txn, |db, locker| db.put(locker, key, value, cid))
    }

    /// Returns false if there was no record to delete.
    pub fn delete(&self, txn: Option<&Txn>, key: u64) -> SmallResult<bool> {
        self.write_op(txn, |db, locker| db.delete(locker, key))
    }

    /// Every live record in key order, each read like `get`.
    pub fn entries(&self, txn: Option<&Txn>) -> SmallResult<Vec<(u64, Vec<u8>)>> {
        let keys = self.env.check_result(self.database()?.keys())?;
        let mut entries = Vec::with_capacity(keys.len());
        for key in keys {
            if let Some(value) = self.get(txn, key)? {
                entries.push((key, value));
            }
        }
        Ok(entries)
    }

    pub fn count(&self, txn: Option<&Txn>) -> SmallResult<usize> {
        Ok(self.entries(txn)?.len())
    }
}

impl fmt::Debug for Database {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        return write!(f, "Database({}, id {})", self.name, self.id);
    }
}
