use crate::{
    tx_log::{LogEntry, LogManager, Lsn, MapLnImage, NULL_LSN},
    types::{DbId, NodeId, SmallResult},
};

/// Names are logged with a 2-byte length.
pub const MAX_NAME_LEN: usize = u16::MAX as usize;

/// The naming tree's record of one database: its name and where its
/// root lives in the log.
#[derive(Debug, Clone)]
pub struct MapLn {
    pub db_id: DbId,
    pub name: String,
    pub root_node_id: NodeId,
    pub root_lsn: Lsn,
    pub deleted: bool,

    pub last_logged_lsn: Lsn,
    pub last_logged_size: u32,
}

impl MapLn {
    pub fn new(db_id: DbId, name: &str) -> Self {
        Self {
            db_id,
            name: name.to_string(),
            root_node_id: 0,
            root_lsn: NULL_LSN,
            deleted: false,
            last_logged_lsn: NULL_LSN,
            last_logged_size: 0,
        }
    }

    pub fn from_image(image: MapLnImage, lsn: Lsn, size: u32) -> Self {
        Self {
            db_id: image.db_id,
            name: image.name,
            root_node_id: image.root_node_id,
            root_lsn: image.root_lsn,
            deleted: image.deleted,
            last_logged_lsn: lsn,
            last_logged_size: size,
        }
    }

    pub fn image(&self) -> MapLnImage {
        MapLnImage {
            db_id: self.db_id,
            name: self.name.clone(),
            root_node_id: self.root_node_id,
            root_lsn: self.root_lsn,
            deleted: self.deleted,
        }
    }

    /// Write the current image, the previous one becomes obsolete.
    pub fn log(&mut self, log: &LogManager, provisional: bool) -> SmallResult<Lsn> {
        let (lsn, size) = log.log_entry(
            &LogEntry::MapLN(self.image()),
            provisional,
            false,
            self.last_logged_lsn,
            self.last_logged_size,
        )?;
        self.last_logged_lsn = lsn;
        self.last_logged_size = size;
        Ok(lsn)
    }
}
