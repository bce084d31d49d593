//! In-memory tree nodes and the way they reach the log.
//!
//! Every database is a B+tree of INs over BINs. BIN slots hold the LSN
//! of the current record version. Nodes are written to the log by the
//! checkpointer only, a BIN with few changes as a delta.

mod bin;
mod bin_reference;
mod catalog;
mod compressor;
mod database;
mod in_node;
mod map_ln;
mod node;
mod tree;

pub use bin::{Bin, BinSlot, PendingWrite};
pub use bin_reference::BINReference;
pub use catalog::Catalog;
pub use compressor::{CompressorStats, INCompressor};
pub use database::DatabaseImpl;
pub use in_node::{ChildRef, InNode};
pub use map_ln::{MapLn, MAX_NAME_LEN};
pub use node::{Node, NodeBody, NodeRef, RootRef};
pub use tree::{FlushStats, Tree, TreeContext};
