use std::{fmt, io::Read};

use crate::{
    io::{read_into, Decodeable, Encodeable, SmallWriter},
    types::SmallResult,
};

/// Log sequence number, the byte address `(file, offset)` of a log
/// entry.
///
/// Ordering is by file number, then offset, which is the order entries
/// were appended.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
pub struct Lsn {
    file_number: u32,
    offset: u64,
}

/// "No prior version". Sorts before every real LSN, and never addresses
/// an entry since offset 0 of a file holds the file header.
pub const NULL_LSN: Lsn = Lsn {
    file_number: 0,
    offset: 0,
};

impl Lsn {
    pub fn new(file_number: u32, offset: u64) -> Self {
        Self {
            file_number,
            offset,
        }
    }

    pub fn file_number(&self) -> u32 {
        self.file_number
    }

    pub fn offset(&self) -> u64 {
        self.offset
    }

    pub fn is_null(&self) -> bool {
        *self == NULL_LSN
    }
}

impl fmt::Display for Lsn {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "0x{:x}/0x{:x}", self.file_number, self.offset)
    }
}

impl fmt::Debug for Lsn {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        return write!(f, "{}", self);
    }
}

/// # Format
/// - 4 bytes: file number
/// - 8 bytes: offset
impl Encodeable for Lsn {
    fn encode(&self, writer: &mut SmallWriter) {
        writer.write(&self.file_number);
        writer.write(&self.offset);
    }
}

impl Decodeable for Lsn {
    fn decode_from<R: Read>(reader: &mut R) -> SmallResult<Self> {
        let file_number = read_into(reader)?;
        let offset = read_into(reader)?;
        Ok(Lsn::new(file_number, offset))
    }
}
