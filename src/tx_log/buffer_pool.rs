use std::collections::VecDeque;

use bytes::{BufMut, BytesMut};

use super::lsn::Lsn;

/// A run of consecutive entries of one file, not yet written out.
pub(crate) struct LogBuffer {
    data: BytesMut,
    first_lsn: Lsn,
}

impl LogBuffer {
    pub(crate) fn first_lsn(&self) -> Lsn {
        self.first_lsn
    }

    pub(crate) fn data(&self) -> &[u8] {
        &self.data
    }

    fn contains(&self, lsn: Lsn) -> bool {
        lsn.file_number() == self.first_lsn.file_number()
            && lsn.offset() >= self.first_lsn.offset()
            && lsn.offset() < self.first_lsn.offset() + self.data.len() as u64
    }

    /// Bytes of `[lsn, lsn + len)`, `None` if the range isn't fully in
    /// this buffer.
    fn slice(&self, lsn: Lsn, len: usize) -> Option<&[u8]> {
        if !self.contains(lsn) {
            return None;
        }
        let start = (lsn.offset() - self.first_lsn.offset()) as usize;
        let end = (start + len).min(self.data.len());
        Some(&self.data[start..end])
    }
}

/// Entries land here before they are written to the log file.
///
/// The pool has a fixed number of buffers. A buffer that fills up is
/// sealed and queued for writing, and the writes happen when the pool
/// runs out of free buffers or when a flush is requested. Commits
/// arriving while a flush is in progress are covered by it (group
/// commit).
pub(crate) struct LogBufferPool {
    buffer_size: usize,
    free: Vec<BytesMut>,
    dirty: VecDeque<LogBuffer>,
    current: Option<LogBuffer>,
}

impl LogBufferPool {
    pub(crate) fn new(n_buffers: usize, buffer_size: usize) -> Self {
        Self {
            buffer_size,
            free: (0..n_buffers.max(1))
                .map(|_| BytesMut::with_capacity(buffer_size))
                .collect(),
            dirty: VecDeque::new(),
            current: None,
        }
    }

    /// Whether an entry of `len` bytes at `lsn` can go into the current
    /// buffer.
    pub(crate) fn fits(&self, lsn: Lsn, len: usize) -> bool {
        match &self.current {
            Some(b) => {
                b.first_lsn.file_number() == lsn.file_number()
                    && b.first_lsn.offset() + b.data.len() as u64 == lsn.offset()
                    && b.data.len() + len <= self.buffer_size
            }
            None => false,
        }
    }

    pub(crate) fn has_free_buffer(&self) -> bool {
        !self.free.is_empty()
    }

    /// Move the current buffer to the dirty queue.
    pub(crate) fn seal_current(&mut self) {
        if let Some(b) = self.current.take() {
            if b.data.is_empty() {
                self.free.push(b.data);
            } else {
                self.dirty.push_back(b);
            }
        }
    }

    /// Start a new current buffer at `lsn`. The caller seals the old one
    /// and makes sure a free buffer exists.
    pub(crate) fn start_buffer(&mut self, lsn: Lsn) {
        let mut data = self
            .free
            .pop()
            .unwrap_or_else(|| BytesMut::with_capacity(self.buffer_size));
        data.clear();
        self.current = Some(LogBuffer {
            data,
            first_lsn: lsn,
        });
    }

    pub(crate) fn put(&mut self, bytes: &[u8]) {
        if let Some(b) = self.current.as_mut() {
            b.data.put_slice(bytes);
        }
    }

    /// Take every buffer holding data, oldest first. The current buffer
    /// is sealed first.
    pub(crate) fn take_dirty(&mut self) -> Vec<LogBuffer> {
        self.seal_current();
        self.dirty.drain(..).collect()
    }

    /// Give written buffers back to the pool.
    pub(crate) fn recycle(&mut self, buffers: Vec<LogBuffer>) {
        for mut b in buffers {
            b.data.clear();
            self.free.push(b.data);
        }
    }

    pub(crate) fn read(&self, lsn: Lsn, len: usize) -> Option<Vec<u8>> {
        let in_current = self.current.iter();
        for b in self.dirty.iter().chain(in_current) {
            if let Some(bytes) = b.slice(lsn, len) {
                return Some(bytes.to_vec());
            }
        }
        None
    }

    pub(crate) fn is_empty(&self) -> bool {
        self.dirty.is_empty() && self.current.as_ref().map_or(true, |b| b.data.is_empty())
    }
}
