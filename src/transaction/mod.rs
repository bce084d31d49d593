mod lock;
mod lock_manager;
mod locker;
mod txn;
mod wait_for_graph;

pub use lock::{LockGrantType, LockType, LockerId, ResourceId};
pub use lock_manager::{LockManager, LockStats};
pub use locker::{Locker, LockerKind, WriteLockInfo};
pub use txn::{Txn, TxnManager, TxnState, TxnStats};
