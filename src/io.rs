use std::{convert::TryInto, io::Read, mem::size_of};

use crate::{error::SmallError, types::SmallResult};

/// A wrapper for `std::io::Read` to read a `Decodeable` object.
///
/// The advantage of this wrapper is doesn't require explicit type
/// annotation when type inference is possible. This makes some code
/// more concise.
pub fn read_into<T: Decodeable, R: Read>(reader: &mut R) -> SmallResult<T> {
    T::decode_from(reader)
}

pub fn read_exact<R: Read>(reader: &mut R, bytes_count: usize) -> SmallResult<Vec<u8>> {
    let mut buffer = vec![0u8; bytes_count];
    reader.read_exact(&mut buffer).map_err(|e| {
        SmallError::LogFormat(format!("short read, expect {} bytes: {}", bytes_count, e))
    })?;
    Ok(buffer)
}

pub struct SmallWriter {
    buf: Vec<u8>,
}

impl SmallWriter {
    /// Create a new `SmallWriter` with an empty buffer.
    pub fn new() -> Self {
        Self { buf: Vec::new() }
    }

    /// Create a new `SmallWriter` with a buffer of the given capacity.
    pub fn new_reserved(cap: usize) -> Self {
        Self {
            buf: Vec::with_capacity(cap),
        }
    }

    pub fn write<T: Encodeable + ?Sized>(&mut self, obj: &T) {
        obj.encode(self);
    }

    pub fn write_bytes(&mut self, obj: &[u8]) {
        self.buf.extend_from_slice(obj);
    }

    pub fn len(&self) -> usize {
        self.buf.len()
    }

    pub fn is_empty(&self) -> bool {
        self.buf.is_empty()
    }

    pub fn into_bytes(self) -> Vec<u8> {
        self.buf
    }
}

impl Default for SmallWriter {
    fn default() -> Self {
        Self::new()
    }
}

pub trait Encodeable {
    fn encode(&self, writer: &mut SmallWriter);

    fn to_bytes(&self) -> Vec<u8> {
        let mut writer = SmallWriter::new();
        self.encode(&mut writer);
        writer.into_bytes()
    }
}

pub trait Decodeable: Sized {
    fn decode_from<R: Read>(reader: &mut R) -> SmallResult<Self>;
}

/// # Format
///
/// - 1 byte (0 for false, 1 for true)
impl Encodeable for bool {
    fn encode(&self, writer: &mut SmallWriter) {
        writer.write_bytes(&[*self as u8]);
    }
}

impl Decodeable for bool {
    fn decode_from<R: Read>(reader: &mut R) -> SmallResult<Self> {
        match u8::decode_from(reader)? {
            0 => Ok(false),
            1 => Ok(true),
            v => Err(SmallError::LogFormat(format!("invalid bool byte: {}", v))),
        }
    }
}

/// # Format
/// - 4 bytes: size of the payload
/// - n bytes: payload
impl Encodeable for [u8] {
    fn encode(&self, writer: &mut SmallWriter) {
        writer.write_bytes(&(self.len() as u32).to_le_bytes());
        writer.write_bytes(self);
    }
}

impl Encodeable for Vec<u8> {
    fn encode(&self, writer: &mut SmallWriter) {
        self.as_slice().encode(writer);
    }
}

impl Decodeable for Vec<u8> {
    fn decode_from<R: Read>(reader: &mut R) -> SmallResult<Self> {
        let size = u32::decode_from(reader)?;
        read_exact(reader, size as usize)
    }
}

/// # Format
/// - 2 bytes: size of the string (range: 0 - 64 KB)
/// - n bytes: utf-8 payload
impl Encodeable for String {
    fn encode(&self, writer: &mut SmallWriter) {
        writer.write_bytes(&(self.len() as u16).to_le_bytes());
        writer.write_bytes(self.as_bytes());
    }
}

impl Decodeable for String {
    fn decode_from<R: Read>(reader: &mut R) -> SmallResult<Self> {
        let size = u16::decode_from(reader)?;
        let bytes = read_exact(reader, size as usize)?;
        String::from_utf8(bytes).map_err(|e| SmallError::LogFormat(format!("invalid utf-8: {}", e)))
    }
}

macro_rules! impl_serialization {
    (for $($t:ty),+) => {
        $(
            impl Encodeable for $t {
                fn encode(&self, writer: &mut SmallWriter) {
                    writer.write_bytes(&self.to_le_bytes());
                }
            }

            impl Decodeable for $t {
                fn decode_from<R: Read>(reader: &mut R) -> SmallResult<Self> {
                    let bytes = read_exact(reader, size_of::<Self>())?;
                    let array = bytes.try_into().map_err(|_| {
                        SmallError::LogFormat(format!("expect {} bytes", size_of::<Self>()))
                    })?;
                    Ok(Self::from_le_bytes(array))
                }
            }
        )*
    }
}

impl_serialization!(for u8, u16, u32, u64, i64);
