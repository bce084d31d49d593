mod buffer_pool;
mod entry;
mod file_manager;
mod log_manager;
mod lsn;
mod reader;
mod utilization;

pub use entry::{
    ActiveTxn, BinDeltaImage, BinImage, BinSlotImage, InEntryImage, InImage, LogEntry,
    LogEntryHeader, LogEntryType, MapLnImage, HEADER_SIZE, LOG_VERSION,
};
pub use file_manager::{FileHeader, FileManager, FILE_HEADER_SIZE};
pub use log_manager::{LogManager, LogStats};
pub use lsn::{Lsn, NULL_LSN};
pub use reader::{CheckpointFileReader, LogReader};
pub use utilization::{FileSummary, UtilizationTracker};
