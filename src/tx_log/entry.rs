use std::io::{Cursor, Read};

use super::lsn::Lsn;
use crate::{
    error::SmallError,
    io::{read_into, Decodeable, SmallWriter},
    types::{DbId, NodeId, SmallResult, TxnId, NON_TXN_ID},
};

pub const LOG_VERSION: u8 = 1;

/// # Format
///
/// - 1 byte: entry type
/// - 1 byte: version (low 6 bits) and flags (provisional 0x80,
///   transactional 0x40)
/// - 4 bytes: payload size
/// - 4 bytes: checksum
/// - 8 bytes: offset of the previous entry in the file
pub const HEADER_SIZE: usize = 18;

const PROVISIONAL_FLAG: u8 = 0x80;
const TRANSACTIONAL_FLAG: u8 = 0x40;
const VERSION_MASK: u8 = 0x3F;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum LogEntryType {
    Begin,
    Commit,
    Abort,
    CheckpointStart,
    CheckpointEnd,
    Root,
    StoreObject,
    DeleteObject,
    MapLN,
    IN,
    BIN,
    BINDelta,
}

impl LogEntryType {
    pub fn to_u8(&self) -> u8 {
        match self {
            LogEntryType::Begin => 1,
            LogEntryType::Commit => 2,
            LogEntryType::Abort => 3,
            LogEntryType::CheckpointStart => 4,
            LogEntryType::CheckpointEnd => 5,
            LogEntryType::Root => 6,
            LogEntryType::StoreObject => 7,
            LogEntryType::DeleteObject => 8,
            LogEntryType::MapLN => 9,
            LogEntryType::IN => 10,
            LogEntryType::BIN => 11,
            LogEntryType::BINDelta => 12,
        }
    }

    pub fn from_u8(value: u8) -> SmallResult<Self> {
        let t = match value {
            1 => LogEntryType::Begin,
            2 => LogEntryType::Commit,
            3 => LogEntryType::Abort,
            4 => LogEntryType::CheckpointStart,
            5 => LogEntryType::CheckpointEnd,
            6 => LogEntryType::Root,
            7 => LogEntryType::StoreObject,
            8 => LogEntryType::DeleteObject,
            9 => LogEntryType::MapLN,
            10 => LogEntryType::IN,
            11 => LogEntryType::BIN,
            12 => LogEntryType::BINDelta,
            _ => {
                return Err(SmallError::LogFormat(format!(
                    "invalid entry type: {}",
                    value
                )))
            }
        };
        Ok(t)
    }

    /// Tree node images, counted as "node" bytes by the utilization
    /// tracker.
    pub fn is_node(&self) -> bool {
        matches!(
            self,
            LogEntryType::IN | LogEntryType::BIN | LogEntryType::BINDelta | LogEntryType::MapLN
        )
    }

    /// The only types the checkpoint scanner cares about.
    pub fn is_checkpoint_marker(&self) -> bool {
        matches!(
            self,
            LogEntryType::Root | LogEntryType::CheckpointStart | LogEntryType::CheckpointEnd
        )
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LogEntryHeader {
    pub entry_type: LogEntryType,
    pub version: u8,
    pub provisional: bool,
    pub transactional: bool,
    pub size: u32,
    pub checksum: u32,
    pub prev_offset: u64,
}

impl LogEntryHeader {
    pub fn new(
        entry_type: LogEntryType,
        size: u32,
        provisional: bool,
        transactional: bool,
        prev_offset: u64,
    ) -> Self {
        Self {
            entry_type,
            version: LOG_VERSION,
            provisional,
            transactional,
            size,
            checksum: 0,
            prev_offset,
        }
    }

    fn flags_byte(&self) -> u8 {
        let mut b = self.version & VERSION_MASK;
        if self.provisional {
            b |= PROVISIONAL_FLAG;
        }
        if self.transactional {
            b |= TRANSACTIONAL_FLAG;
        }
        b
    }

    fn compute_checksum(&self, payload: &[u8]) -> u32 {
        let mut hasher = crc32fast::Hasher::new();
        hasher.update(&[self.entry_type.to_u8(), self.flags_byte()]);
        hasher.update(&self.size.to_le_bytes());
        hasher.update(&self.prev_offset.to_le_bytes());
        hasher.update(payload);
        hasher.finalize()
    }

    /// Header and payload as they land in the file. The checksum is
    /// filled in here.
    pub fn serialize(&mut self, payload: &[u8]) -> Vec<u8> {
        self.size = payload.len() as u32;
        self.checksum = self.compute_checksum(payload);

        let mut writer = SmallWriter::new_reserved(HEADER_SIZE + payload.len());
        writer.write(&self.entry_type.to_u8());
        writer.write(&self.flags_byte());
        writer.write(&self.size);
        writer.write(&self.checksum);
        writer.write(&self.prev_offset);
        writer.write_bytes(payload);
        writer.into_bytes()
    }

    pub fn deserialize(bytes: &[u8]) -> SmallResult<Self> {
        if bytes.len() < HEADER_SIZE {
            return Err(SmallError::LogFormat(format!(
                "short header: {} bytes",
                bytes.len()
            )));
        }

        let mut r = Cursor::new(bytes);
        let entry_type = LogEntryType::from_u8(read_into(&mut r)?)?;
        let flags: u8 = read_into(&mut r)?;
        let size = read_into(&mut r)?;
        let checksum = read_into(&mut r)?;
        let prev_offset = read_into(&mut r)?;
        Ok(Self {
            entry_type,
            version: flags & VERSION_MASK,
            provisional: flags & PROVISIONAL_FLAG != 0,
            transactional: flags & TRANSACTIONAL_FLAG != 0,
            size,
            checksum,
            prev_offset,
        })
    }

    pub fn verify(&self, payload: &[u8]) -> bool {
        payload.len() == self.size as usize && self.compute_checksum(payload) == self.checksum
    }

    pub fn total_size(&self) -> u64 {
        HEADER_SIZE as u64 + self.size as u64
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ActiveTxn {
    pub txn_id: TxnId,
    pub first_lsn: Lsn,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct InEntryImage {
    pub key: u64,
    pub lsn: Lsn,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InImage {
    pub node_id: NodeId,
    pub db_id: DbId,
    pub level: u16,
    pub entries: Vec<InEntryImage>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BinSlotImage {
    pub key: u64,
    pub lsn: Lsn,
    pub known_deleted: bool,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BinImage {
    pub node_id: NodeId,
    pub db_id: DbId,
    pub slots: Vec<BinSlotImage>,
}

/// Slots changed since the full image at `last_full_lsn`. Deltas are
/// cumulative: the newest delta alone, applied on the full image, gives
/// the node.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BinDeltaImage {
    pub node_id: NodeId,
    pub db_id: DbId,
    pub last_full_lsn: Lsn,
    pub n_deltas: u32,
    pub slots: Vec<BinSlotImage>,
}

impl BinDeltaImage {
    /// Rebuild the node from the full image the delta refers to.
    pub fn apply(&self, full: &BinImage) -> BinImage {
        let mut slots = full.slots.clone();
        for delta in &self.slots {
            match slots.binary_search_by_key(&delta.key, |s| s.key) {
                Ok(i) => slots[i] = *delta,
                Err(i) => slots.insert(i, *delta),
            }
        }
        BinImage {
            node_id: self.node_id,
            db_id: self.db_id,
            slots,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MapLnImage {
    pub db_id: DbId,
    pub name: String,
    pub root_node_id: NodeId,
    pub root_lsn: Lsn,
    pub deleted: bool,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LogEntry {
    Begin {
        txn_id: TxnId,
    },
    Commit {
        txn_id: TxnId,
    },
    Abort {
        txn_id: TxnId,
    },
    CheckpointStart {
        checkpoint_id: u64,
        active_txns: Vec<ActiveTxn>,
    },
    CheckpointEnd {
        checkpoint_id: u64,
        start_lsn: Lsn,
        root_lsn: Lsn,
        next_node_id: NodeId,
        next_db_id: DbId,
        next_txn_id: TxnId,
    },
    Root {
        map_lns: Vec<(DbId, Lsn)>,
    },
    StoreObject {
        txn_id: TxnId,
        db_id: DbId,
        oid: u64,
        cid: u32,
        value: Vec<u8>,
    },
    DeleteObject {
        txn_id: TxnId,
        db_id: DbId,
        oid: u64,
    },
    MapLN(MapLnImage),
    IN(InImage),
    BIN(BinImage),
    BINDelta(BinDeltaImage),
}

impl LogEntry {
    pub fn entry_type(&self) -> LogEntryType {
        match self {
            LogEntry::Begin { .. } => LogEntryType::Begin,
            LogEntry::Commit { .. } => LogEntryType::Commit,
            LogEntry::Abort { .. } => LogEntryType::Abort,
            LogEntry::CheckpointStart { .. } => LogEntryType::CheckpointStart,
            LogEntry::CheckpointEnd { .. } => LogEntryType::CheckpointEnd,
            LogEntry::Root { .. } => LogEntryType::Root,
            LogEntry::StoreObject { .. } => LogEntryType::StoreObject,
            LogEntry::DeleteObject { .. } => LogEntryType::DeleteObject,
            LogEntry::MapLN(_) => LogEntryType::MapLN,
            LogEntry::IN(_) => LogEntryType::IN,
            LogEntry::BIN(_) => LogEntryType::BIN,
            LogEntry::BINDelta(_) => LogEntryType::BINDelta,
        }
    }

    /// The transaction this entry belongs to, `None` for
    /// non-transactional entries.
    pub fn txn_id(&self) -> Option<TxnId> {
        match self {
            LogEntry::Begin { txn_id }
            | LogEntry::Commit { txn_id }
            | LogEntry::Abort { txn_id } => Some(*txn_id),
            LogEntry::StoreObject { txn_id, .. } | LogEntry::DeleteObject { txn_id, .. } => {
                if *txn_id == NON_TXN_ID {
                    None
                } else {
                    Some(*txn_id)
                }
            }
            _ => None,
        }
    }

    pub fn is_transactional(&self) -> bool {
        self.txn_id().is_some()
    }

    pub fn serialize_payload(&self) -> Vec<u8> {
        let mut w = SmallWriter::new();
        match self {
            LogEntry::Begin { txn_id }
            | LogEntry::Commit { txn_id }
            | LogEntry::Abort { txn_id } => w.write(txn_id),
            LogEntry::CheckpointStart {
                checkpoint_id,
                active_txns,
            } => {
                w.write(checkpoint_id);
                w.write(&(active_txns.len() as u32));
                for t in active_txns {
                    w.write(&t.txn_id);
                    w.write(&t.first_lsn);
                }
            }
            LogEntry::CheckpointEnd {
                checkpoint_id,
                start_lsn,
                root_lsn,
                next_node_id,
                next_db_id,
                next_txn_id,
            } => {
                w.write(checkpoint_id);
                w.write(start_lsn);
                w.write(root_lsn);
                w.write(next_node_id);
                w.write(next_db_id);
                w.write(next_txn_id);
            }
            LogEntry::Root { map_lns } => {
                w.write(&(map_lns.len() as u32));
                for (db_id, lsn) in map_lns {
                    w.write(db_id);
                    w.write(lsn);
                }
            }
            LogEntry::StoreObject {
                txn_id,
                db_id,
                oid,
                cid,
                value,
            } => {
                w.write(txn_id);
                w.write(db_id);
                w.write(oid);
                w.write(cid);
                w.write(value);
            }
            LogEntry::DeleteObject { txn_id, db_id, oid } => {
                w.write(txn_id);
                w.write(db_id);
                w.write(oid);
            }
            LogEntry::MapLN(m) => {
                w.write(&m.db_id);
                w.write(&m.name);
                w.write(&m.root_node_id);
                w.write(&m.root_lsn);
                w.write(&m.deleted);
            }
            LogEntry::IN(n) => {
                w.write(&n.node_id);
                w.write(&n.db_id);
                w.write(&n.level);
                w.write(&(n.entries.len() as u32));
                for e in &n.entries {
                    w.write(&e.key);
                    w.write(&e.lsn);
                }
            }
            LogEntry::BIN(b) => {
                w.write(&b.node_id);
                w.write(&b.db_id);
                write_slots(&mut w, &b.slots);
            }
            LogEntry::BINDelta(d) => {
                w.write(&d.node_id);
                w.write(&d.db_id);
                w.write(&d.last_full_lsn);
                w.write(&d.n_deltas);
                write_slots(&mut w, &d.slots);
            }
        }
        w.into_bytes()
    }

    pub fn deserialize(entry_type: LogEntryType, payload: &[u8]) -> SmallResult<Self> {
        let mut r = Cursor::new(payload);
        let entry = match entry_type {
            LogEntryType::Begin => LogEntry::Begin {
                txn_id: read_into(&mut r)?,
            },
            LogEntryType::Commit => LogEntry::Commit {
                txn_id: read_into(&mut r)?,
            },
            LogEntryType::Abort => LogEntry::Abort {
                txn_id: read_into(&mut r)?,
            },
            LogEntryType::CheckpointStart => {
                let checkpoint_id = read_into(&mut r)?;
                let n: u32 = read_into(&mut r)?;
                let mut active_txns = Vec::with_capacity(n as usize);
                for _ in 0..n {
                    active_txns.push(read_into(&mut r)?);
                }
                LogEntry::CheckpointStart {
                    checkpoint_id,
                    active_txns,
                }
            }
            LogEntryType::CheckpointEnd => LogEntry::CheckpointEnd {
                checkpoint_id: read_into(&mut r)?,
                start_lsn: read_into(&mut r)?,
                root_lsn: read_into(&mut r)?,
                next_node_id: read_into(&mut r)?,
                next_db_id: read_into(&mut r)?,
                next_txn_id: read_into(&mut r)?,
            },
            LogEntryType::Root => {
                let n: u32 = read_into(&mut r)?;
                let mut map_lns = Vec::with_capacity(n as usize);
                for _ in 0..n {
                    map_lns.push((read_into(&mut r)?, read_into(&mut r)?));
                }
                LogEntry::Root { map_lns }
            }
            LogEntryType::StoreObject => LogEntry::StoreObject {
                txn_id: read_into(&mut r)?,
                db_id: read_into(&mut r)?,
                oid: read_into(&mut r)?,
                cid: read_into(&mut r)?,
                value: read_into(&mut r)?,
            },
            LogEntryType::DeleteObject => LogEntry::DeleteObject {
                txn_id: read_into(&mut r)?,
                db_id: read_into(&mut r)?,
                oid: read_into(&mut r)?,
            },
            LogEntryType::MapLN => LogEntry::MapLN(MapLnImage {
                db_id: read_into(&mut r)?,
                name: read_into(&mut r)?,
                root_node_id: read_into(&mut r)?,
                root_lsn: read_into(&mut r)?,
                deleted: read_into(&mut r)?,
            }),
            LogEntryType::IN => {
                let node_id = read_into(&mut r)?;
                let db_id = read_into(&mut r)?;
                let level = read_into(&mut r)?;
                let n: u32 = read_into(&mut r)?;
                let mut entries = Vec::with_capacity(n as usize);
                for _ in 0..n {
                    entries.push(InEntryImage {
                        key: read_into(&mut r)?,
                        lsn: read_into(&mut r)?,
                    });
                }
                LogEntry::IN(InImage {
                    node_id,
                    db_id,
                    level,
                    entries,
                })
            }
            LogEntryType::BIN => LogEntry::BIN(BinImage {
                node_id: read_into(&mut r)?,
                db_id: read_into(&mut r)?,
                slots: read_slots(&mut r)?,
            }),
            LogEntryType::BINDelta => LogEntry::BINDelta(BinDeltaImage {
                node_id: read_into(&mut r)?,
                db_id: read_into(&mut r)?,
                last_full_lsn: read_into(&mut r)?,
                n_deltas: read_into(&mut r)?,
                slots: read_slots(&mut r)?,
            }),
        };

        if r.position() as usize != payload.len() {
            return Err(SmallError::LogFormat(format!(
                "{:?} entry has {} trailing bytes",
                entry_type,
                payload.len() - r.position() as usize
            )));
        }
        Ok(entry)
    }

    /// One line description, used by the log dump.
    pub fn summary(&self) -> String {
        match self {
            LogEntry::Begin { txn_id } => format!("begin txn {}", txn_id),
            LogEntry::Commit { txn_id } => format!("commit txn {}", txn_id),
            LogEntry::Abort { txn_id } => format!("abort txn {}", txn_id),
            LogEntry::CheckpointStart {
                checkpoint_id,
                active_txns,
            } => format!(
                "checkpoint {} start, active: {:?}",
                checkpoint_id,
                active_txns
                    .iter()
                    .map(|t| (t.txn_id, t.first_lsn))
                    .collect::<Vec<_>>()
            ),
            LogEntry::CheckpointEnd {
                checkpoint_id,
                start_lsn,
                root_lsn,
                ..
            } => format!(
                "checkpoint {} end, start: {}, root: {}",
                checkpoint_id, start_lsn, root_lsn
            ),
            LogEntry::Root { map_lns } => format!("root {:?}", map_lns),
            LogEntry::StoreObject {
                txn_id,
                db_id,
                oid,
                value,
                ..
            } => format!(
                "store txn {} db {} oid {} value 0x{}",
                txn_id,
                db_id,
                oid,
                hex::encode(&value[..value.len().min(16)])
            ),
            LogEntry::DeleteObject { txn_id, db_id, oid } => {
                format!("delete txn {} db {} oid {}", txn_id, db_id, oid)
            }
            LogEntry::MapLN(m) => format!(
                "map_ln db {} \"{}\" root {} at {}{}",
                m.db_id,
                m.name,
                m.root_node_id,
                m.root_lsn,
                if m.deleted { " (deleted)" } else { "" }
            ),
            LogEntry::IN(n) => format!(
                "in {} db {} level {} entries {}",
                n.node_id,
                n.db_id,
                n.level,
                n.entries.len()
            ),
            LogEntry::BIN(b) => format!("bin {} db {} slots {}", b.node_id, b.db_id, b.slots.len()),
            LogEntry::BINDelta(d) => format!(
                "bin_delta {} db {} full {} #{} slots {}",
                d.node_id,
                d.db_id,
                d.last_full_lsn,
                d.n_deltas,
                d.slots.len()
            ),
        }
    }
}

fn write_slots(w: &mut SmallWriter, slots: &[BinSlotImage]) {
    w.write(&(slots.len() as u32));
    for s in slots {
        w.write(&s.key);
        w.write(&s.lsn);
        w.write(&s.known_deleted);
    }
}

fn read_slots<R: Read>(r: &mut R) -> SmallResult<Vec<BinSlotImage>> {
    let n: u32 = read_into(r)?;
    let mut slots = Vec::with_capacity(n as usize);
    for _ in 0..n {
        slots.push(BinSlotImage {
            key: read_into(r)?,
            lsn: read_into(r)?,
            known_deleted: read_into(r)?,
        });
    }
    Ok(slots)
}

impl Decodeable for ActiveTxn {
    fn decode_from<R: Read>(reader: &mut R) -> SmallResult<Self> {
        Ok(ActiveTxn {
            txn_id: read_into(reader)?,
            first_lsn: read_into(reader)?,
        })
    }
}
