pub mod btree;
pub mod config;
pub mod environment;
pub mod io;
pub mod latch;
pub mod recovery;
pub mod transaction;
pub mod tx_log;
pub mod types;
pub mod utils;

mod error;

pub use config::{DeadlockDetection, Durability, EnvConfig, IsolationLevel, LockingMode};
pub use environment::{Database, EnvStats, Environment};
pub use error::SmallError;
pub use recovery::{CheckpointInfo, RecoveryInfo};
pub use transaction::{LockGrantType, LockType, Locker, ResourceId, Txn};
pub use tx_log::Lsn;
pub use types::SmallResult;
