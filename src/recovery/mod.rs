//! Checkpoints and the redo pass that rebuilds an environment from its
//! log.

mod checkpointer;
mod recovery_manager;

pub use checkpointer::{CheckpointInfo, Checkpointer};
pub use recovery_manager::{recover, RecoveryInfo};
