use super::{
    entry::{LogEntry, LogEntryHeader, LogEntryType},
    file_manager::FILE_HEADER_SIZE,
    log_manager::LogManager,
    lsn::Lsn,
};
use crate::types::SmallResult;

/// Reads entries forward, from a start LSN to the end of the log as it
/// was when the reader was created.
pub struct LogReader<'a> {
    log: &'a LogManager,
    next: Lsn,
    end: Lsn,
}

impl<'a> LogReader<'a> {
    pub fn new(log: &'a LogManager, start: Lsn) -> Self {
        let next = if start.file_number() < log.first_file() || start.offset() < FILE_HEADER_SIZE {
            Lsn::new(start.file_number().max(log.first_file()), FILE_HEADER_SIZE)
        } else {
            start
        };
        Self {
            log,
            next,
            end: log.end_of_log(),
        }
    }

    /// Next entry without decoding the payload.
    pub fn next_raw(&mut self) -> SmallResult<Option<(Lsn, LogEntryHeader, Vec<u8>)>> {
        loop {
            if self.next >= self.end {
                return Ok(None);
            }

            let file_end = self.log.file_end(self.next.file_number())?;
            if self.next.offset() >= file_end {
                self.next = Lsn::new(self.next.file_number() + 1, FILE_HEADER_SIZE);
                continue;
            }

            let lsn = self.next;
            let (header, payload) = self.log.read_raw(lsn)?;
            self.next = Lsn::new(lsn.file_number(), lsn.offset() + header.total_size());
            return Ok(Some((lsn, header, payload)));
        }
    }

    pub fn next_entry(&mut self) -> SmallResult<Option<(Lsn, LogEntryHeader, LogEntry)>> {
        match self.next_raw()? {
            Some((lsn, header, payload)) => {
                let entry = LogEntry::deserialize(header.entry_type, &payload)?;
                Ok(Some((lsn, header, entry)))
            }
            None => Ok(None),
        }
    }
}

impl<'a> Iterator for LogReader<'a> {
    type Item = SmallResult<(Lsn, LogEntryHeader, LogEntry)>;

    fn next(&mut self) -> Option<Self::Item> {
        match self.next_entry() {
            Ok(Some(v)) => Some(Ok(v)),
            Ok(None) => None,
            Err(e) => {
                // stop after the first error
                self.next = self.end;
                Some(Err(e))
            }
        }
    }
}

/// Walks the log backward and only decodes `Root`, `CheckpointStart`
/// and `CheckpointEnd` entries. Everything else is skipped by its
/// header.
pub struct CheckpointFileReader<'a> {
    log: &'a LogManager,
    next: Option<Lsn>,
}

impl<'a> CheckpointFileReader<'a> {
    pub fn new(log: &'a LogManager) -> Self {
        let last = log.last_lsn();
        Self {
            log,
            next: if last.is_null() { None } else { Some(last) },
        }
    }

    /// The next checkpoint marker going backward.
    pub fn next_marker(&mut self) -> SmallResult<Option<(Lsn, LogEntry)>> {
        while let Some(lsn) = self.next {
            let header = self.log.read_header(lsn)?;
            self.next = self.prev(lsn, &header)?;
            if header.entry_type.is_checkpoint_marker() {
                let (_, entry) = self.log.read_entry(lsn)?;
                return Ok(Some((lsn, entry)));
            }
        }
        Ok(None)
    }

    /// The most recent entry of the given marker type.
    pub fn find_last(&mut self, entry_type: LogEntryType) -> SmallResult<Option<(Lsn, LogEntry)>> {
        while let Some((lsn, entry)) = self.next_marker()? {
            if entry.entry_type() == entry_type {
                return Ok(Some((lsn, entry)));
            }
        }
        Ok(None)
    }

    fn prev(&self, lsn: Lsn, header: &LogEntryHeader) -> SmallResult<Option<Lsn>> {
        if header.prev_offset != 0 {
            return Ok(Some(Lsn::new(lsn.file_number(), header.prev_offset)));
        }

        // first entry of its file, continue with the previous file
        let mut file = lsn.file_number();
        while file > self.log.first_file() {
            let prev_last = self.log.last_entry_in_prev_file(file)?;
            file -= 1;
            if prev_last != 0 {
                return Ok(Some(Lsn::new(file, prev_last)));
            }
        }
        Ok(None)
    }
}
