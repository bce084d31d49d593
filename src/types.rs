use crate::error::SmallError;

pub type SmallResult<T = ()> = Result<T, SmallError>;

/// Identifier of a tree node, unique within an environment.
pub type NodeId = u64;

/// Identifier of a database inside an environment.
pub type DbId = u64;

/// Transaction id, `0` is reserved for non-transactional writes.
pub type TxnId = u64;

pub const NON_TXN_ID: TxnId = 0;
