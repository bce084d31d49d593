use std::{
    collections::BTreeMap,
    sync::{
        atomic::{AtomicU64, Ordering},
        Arc,
    },
};

use log::{debug, info, warn};
use parking_lot::RwLock;

use super::{
    buffer_pool::LogBufferPool,
    entry::{LogEntry, LogEntryHeader, LogEntryType, HEADER_SIZE},
    file_manager::{FileManager, LogFile, FILE_HEADER_SIZE},
    lsn::{Lsn, NULL_LSN},
    reader::LogReader,
    utilization::{FileSummary, UtilizationTracker},
};
use crate::{
    config::{Durability, EnvConfig},
    environment::EnvState,
    error::SmallError,
    types::SmallResult,
};

/// Bytes read from a file for an entry before its size is known. Bigger
/// entries need a second read.
const READ_CHUNK: usize = 1024;

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct LogStats {
    pub n_entries: u64,
    pub n_bytes: u64,
    pub n_flushes: u64,
    pub n_fsyncs: u64,

    /// Flush requests already covered by an earlier flush.
    pub n_group_commit_waits: u64,

    /// Reads that needed a second read because the entry was bigger
    /// than the first chunk.
    pub n_repeat_faults: u64,
    pub n_files: u64,
}

#[derive(Default)]
struct LogCounters {
    n_entries: AtomicU64,
    n_bytes: AtomicU64,
    n_flushes: AtomicU64,
    n_fsyncs: AtomicU64,
    n_group_commit_waits: AtomicU64,
    n_repeat_faults: AtomicU64,
}

/// Everything the append path mutates. One lock around it makes LSN
/// assignment a total order.
struct LogState {
    file_number: u32,
    file: LogFile,

    // offset the next entry of the current file gets
    next_offset: u64,

    // offset of the last entry in the current file, 0 if none
    last_entry_offset: u64,
    last_lsn: Lsn,

    pool: LogBufferPool,

    // every byte before these positions is written / fsynced
    written_end: Lsn,
    synced_end: Lsn,

    tracker: UtilizationTracker,
}

pub struct LogManager {
    files: FileManager,
    state: RwLock<LogState>,
    first_file: u32,
    log_file_max: u64,
    env_state: Arc<EnvState>,
    counters: LogCounters,
}

impl LogManager {
    /// Open the log in `config.home`, creating the first file if there
    /// is none. A torn entry at the end of the last file is cut off.
    pub fn open(config: &EnvConfig, env_state: Arc<EnvState>) -> SmallResult<Self> {
        let files = FileManager::new(&config.home)?;
        let mut numbers = files.list_files()?;

        // step 1: find a last file with a valid header
        loop {
            let last = match numbers.last() {
                Some(n) => *n,
                None => break,
            };
            match files.read_header(last) {
                Ok(_) => break,
                Err(e @ SmallError::LogIo(_)) => return Err(e),
                Err(e) => {
                    // a crash while creating the file
                    warn!("last log file {} has a bad header ({}), removing", last, e);
                    files.delete_file(last)?;
                    numbers.pop();
                }
            }
        }

        // step 2: every other file must be intact
        for n in numbers.iter().rev().skip(1) {
            files
                .read_header(*n)
                .map_err(|e| SmallError::Recovery(format!("log file {}: {}", n, e)))?;
        }

        let first_file = numbers.first().copied().unwrap_or(0);
        let (file_number, file, next_offset, last_entry_offset, last_lsn) = match numbers.last() {
            None => {
                let file = files.create_file(0, 0)?;
                (0, file, FILE_HEADER_SIZE, 0, NULL_LSN)
            }
            Some(n) => {
                let n = *n;
                let (next_offset, last_entry_offset) = Self::scan_tail(&files, n)?;
                let file = files.open_for_write(n)?;
                let last_lsn = if last_entry_offset != 0 {
                    Lsn::new(n, last_entry_offset)
                } else {
                    let header = files.read_header(n)?;
                    if n > first_file && header.last_entry_in_prev_file != 0 {
                        Lsn::new(n - 1, header.last_entry_in_prev_file)
                    } else {
                        NULL_LSN
                    }
                };
                (n, file, next_offset, last_entry_offset, last_lsn)
            }
        };

        info!(
            "opened log in {}, files {}..={}, end of log {}",
            config.home.display(),
            first_file,
            file_number,
            Lsn::new(file_number, next_offset)
        );

        let end = Lsn::new(file_number, next_offset);
        Ok(Self {
            files,
            state: RwLock::new(LogState {
                file_number,
                file,
                next_offset,
                last_entry_offset,
                last_lsn,
                pool: LogBufferPool::new(config.log_num_buffers, config.log_buffer_size),
                written_end: end,
                synced_end: end,
                tracker: UtilizationTracker::new(),
            }),
            first_file,
            log_file_max: config.log_file_max,
            env_state,
            counters: LogCounters::default(),
        })
    }

    /// Walk the entries of the last file, cut the file after the last
    /// valid one. Returns `(end offset, offset of the last entry)`.
    fn scan_tail(files: &FileManager, file_number: u32) -> SmallResult<(u64, u64)> {
        let len = files.file_len(file_number)?;
        let mut offset = FILE_HEADER_SIZE;
        let mut last = 0;

        while offset + HEADER_SIZE as u64 <= len {
            let bytes = files.read_at(file_number, offset, HEADER_SIZE)?;
            let header = match LogEntryHeader::deserialize(&bytes) {
                Ok(h) => h,
                Err(_) => break,
            };
            if header.prev_offset != last || offset + header.total_size() > len {
                break;
            }
            let payload = files.read_at(file_number, offset + HEADER_SIZE as u64, header.size as usize)?;
            if !header.verify(&payload) {
                break;
            }
            last = offset;
            offset += header.total_size();
        }

        if offset < len {
            warn!(
                "truncating torn tail of log file {}: {} bytes at offset {}",
                file_number,
                len - offset,
                offset
            );
            let file = files.open_for_write(file_number)?;
            file.set_len(offset)?;
            file.sync()?;
            files.clear_readers();
        }
        Ok((offset, last))
    }

    fn fail(&self, err: SmallError) -> SmallError {
        if err.is_fatal() {
            self.env_state.invalidate(&err);
        }
        err
    }

    /// Append an entry, returns its LSN.
    ///
    /// - `is_provisional`: recovery ignores the entry unless a later
    ///   entry that depends on it is found.
    /// - `flush_required`: the entry is written and fsynced before
    ///   returning.
    /// - `force_new_file`: the entry starts a new log file.
    /// - `prior_lsn`/`prior_size`: the version this entry replaces,
    ///   counted obsolete.
    #[allow(clippy::too_many_arguments)]
    pub fn log_item(
        &self,
        mut header: LogEntryHeader,
        payload: &[u8],
        is_provisional: bool,
        flush_required: bool,
        force_new_file: bool,
        prior_lsn: Lsn,
        prior_size: u32,
    ) -> SmallResult<Lsn> {
        self.env_state.check()?;

        header.provisional = is_provisional;
        let total = (HEADER_SIZE + payload.len()) as u64;
        let mut state = self.state.write();

        // step 1: switch files if the entry doesn't fit
        if force_new_file
            || (state.next_offset + total > self.log_file_max && state.next_offset > FILE_HEADER_SIZE)
        {
            self.roll_over(&mut state).map_err(|e| self.fail(e))?;
        }

        // step 2: assign the LSN and serialize
        let lsn = Lsn::new(state.file_number, state.next_offset);
        header.prev_offset = state.last_entry_offset;
        let bytes = header.serialize(payload);

        // step 3: put the entry into the buffer pool
        if !state.pool.fits(lsn, bytes.len()) {
            state.pool.seal_current();
            if !state.pool.has_free_buffer() {
                self.write_buffers(&mut state).map_err(|e| self.fail(e))?;
            }
            state.pool.start_buffer(lsn);
        }
        state.pool.put(&bytes);

        state.next_offset += total;
        state.last_entry_offset = lsn.offset();
        state.last_lsn = lsn;

        let is_node = header.entry_type.is_node();
        state.tracker.count_new(lsn, is_node, total);
        if !prior_lsn.is_null() {
            state.tracker.count_obsolete(prior_lsn, is_node, prior_size as u64);
        }

        self.counters.n_entries.fetch_add(1, Ordering::Relaxed);
        self.counters.n_bytes.fetch_add(total, Ordering::Relaxed);

        // step 4: flush if asked to
        if flush_required {
            self.flush_locked(&mut state, true).map_err(|e| self.fail(e))?;
        }
        Ok(lsn)
    }

    /// Append an entry, returns its LSN and its size in the log.
    pub fn log_entry(
        &self,
        entry: &LogEntry,
        is_provisional: bool,
        flush_required: bool,
        prior_lsn: Lsn,
        prior_size: u32,
    ) -> SmallResult<(Lsn, u32)> {
        let payload = entry.serialize_payload();
        let header = LogEntryHeader::new(
            entry.entry_type(),
            payload.len() as u32,
            is_provisional,
            entry.is_transactional(),
            0,
        );
        let lsn = self.log_item(
            header,
            &payload,
            is_provisional,
            flush_required,
            false,
            prior_lsn,
            prior_size,
        )?;
        Ok((lsn, (HEADER_SIZE + payload.len()) as u32))
    }

    pub fn log(&self, entry: &LogEntry) -> SmallResult<Lsn> {
        self.log_entry(entry, false, false, NULL_LSN, 0).map(|(lsn, _)| lsn)
    }

    pub fn log_provisional(&self, entry: &LogEntry) -> SmallResult<Lsn> {
        self.log_entry(entry, true, false, NULL_LSN, 0).map(|(lsn, _)| lsn)
    }

    /// Append and fsync.
    pub fn log_and_flush(&self, entry: &LogEntry) -> SmallResult<Lsn> {
        self.log_entry(entry, false, true, NULL_LSN, 0).map(|(lsn, _)| lsn)
    }

    fn roll_over(&self, state: &mut LogState) -> SmallResult {
        self.flush_locked(state, true)?;

        let new_file = state.file_number + 1;
        let file = self.files.create_file(new_file, state.last_entry_offset)?;
        info!(
            "log rolled over from file {} to file {} at {}",
            state.file_number, new_file, state.written_end
        );

        state.file = file;
        state.file_number = new_file;
        state.next_offset = FILE_HEADER_SIZE;
        state.last_entry_offset = 0;
        state.written_end = Lsn::new(new_file, FILE_HEADER_SIZE);
        state.synced_end = state.written_end;
        Ok(())
    }

    fn write_buffers(&self, state: &mut LogState) -> SmallResult {
        let buffers = state.pool.take_dirty();
        for b in &buffers {
            if b.first_lsn().file_number() != state.file_number {
                return Err(SmallError::new(&format!(
                    "log buffer at {} doesn't belong to file {}",
                    b.first_lsn(),
                    state.file_number
                )));
            }
            state.file.write_at(b.first_lsn().offset(), b.data())?;
            state.written_end = Lsn::new(
                state.file_number,
                b.first_lsn().offset() + b.data().len() as u64,
            );
        }
        state.pool.recycle(buffers);
        Ok(())
    }

    fn flush_locked(&self, state: &mut LogState, sync: bool) -> SmallResult {
        self.write_buffers(state)?;
        if sync && state.synced_end < state.written_end {
            state.file.sync()?;
            state.synced_end = state.written_end;
            self.counters.n_fsyncs.fetch_add(1, Ordering::Relaxed);
        }
        self.counters.n_flushes.fetch_add(1, Ordering::Relaxed);
        Ok(())
    }

    fn covered(state: &LogState, lsn: Lsn, sync: bool) -> bool {
        if sync {
            state.synced_end > lsn
        } else {
            state.written_end > lsn
        }
    }

    /// Make the entry at `lsn` durable per `durability`.
    ///
    /// This is the group commit: a commit whose entry was already
    /// written by another thread's flush returns without any I/O.
    pub fn flush_to(&self, lsn: Lsn, durability: Durability) -> SmallResult {
        self.env_state.check()?;
        let sync = match durability {
            Durability::NoSync => return Ok(()),
            Durability::WriteNoSync => false,
            Durability::Sync => true,
        };

        if Self::covered(&self.state.read(), lsn, sync) {
            self.counters
                .n_group_commit_waits
                .fetch_add(1, Ordering::Relaxed);
            return Ok(());
        }

        let mut state = self.state.write();
        if Self::covered(&state, lsn, sync) {
            self.counters
                .n_group_commit_waits
                .fetch_add(1, Ordering::Relaxed);
            debug!("{} already flushed by an earlier flush", lsn);
            return Ok(());
        }
        self.flush_locked(&mut state, sync).map_err(|e| self.fail(e))?;
        debug!("flushed log to {} for {} (sync: {})", state.written_end, lsn, sync);
        Ok(())
    }

    /// Write and fsync everything buffered.
    pub fn flush(&self) -> SmallResult {
        self.env_state.check()?;
        let mut state = self.state.write();
        self.flush_locked(&mut state, true).map_err(|e| self.fail(e))
    }

    /// Header and payload of the entry at `lsn`.
    pub fn read_raw(&self, lsn: Lsn) -> SmallResult<(LogEntryHeader, Vec<u8>)> {
        if lsn.offset() < FILE_HEADER_SIZE {
            return Err(SmallError::LogFormat(format!("no entry at {}", lsn)));
        }

        let bytes = {
            let state = self.state.read();
            match state.pool.read(lsn, HEADER_SIZE) {
                Some(h) => {
                    let header = LogEntryHeader::deserialize(&h)?;
                    state.pool.read(lsn, header.total_size() as usize)
                }
                None => None,
            }
        };

        let bytes = match bytes {
            Some(b) => b,
            None => {
                let mut chunk = self.files.read_at(lsn.file_number(), lsn.offset(), READ_CHUNK)?;
                let header = LogEntryHeader::deserialize(&chunk)?;
                let total = header.total_size() as usize;
                if chunk.len() < total {
                    self.counters.n_repeat_faults.fetch_add(1, Ordering::Relaxed);
                    chunk = self.files.read_at(lsn.file_number(), lsn.offset(), total)?;
                }
                chunk
            }
        };

        let header = LogEntryHeader::deserialize(&bytes)?;
        let total = header.total_size() as usize;
        if bytes.len() < total {
            return Err(SmallError::LogFormat(format!(
                "entry at {} truncated: {} of {} bytes",
                lsn,
                bytes.len(),
                total
            )));
        }
        let payload = bytes[HEADER_SIZE..total].to_vec();
        if !header.verify(&payload) {
            return Err(SmallError::LogFormat(format!("checksum mismatch at {}", lsn)));
        }
        Ok((header, payload))
    }

    pub fn read_entry(&self, lsn: Lsn) -> SmallResult<(LogEntryHeader, LogEntry)> {
        let (header, payload) = self.read_raw(lsn)?;
        let entry = LogEntry::deserialize(header.entry_type, &payload)?;
        Ok((header, entry))
    }

    /// Only the header of the entry at `lsn`.
    pub fn read_header(&self, lsn: Lsn) -> SmallResult<LogEntryHeader> {
        {
            let state = self.state.read();
            if let Some(h) = state.pool.read(lsn, HEADER_SIZE) {
                return LogEntryHeader::deserialize(&h);
            }
        }
        let bytes = self.files.read_at(lsn.file_number(), lsn.offset(), HEADER_SIZE)?;
        LogEntryHeader::deserialize(&bytes)
    }

    /// Offset of the last entry in the file before `file_number`, from
    /// the file header.
    pub(crate) fn last_entry_in_prev_file(&self, file_number: u32) -> SmallResult<u64> {
        Ok(self.files.read_header(file_number)?.last_entry_in_prev_file)
    }

    /// End of the entries in a file.
    pub(crate) fn file_end(&self, file_number: u32) -> SmallResult<u64> {
        {
            let state = self.state.read();
            if file_number == state.file_number {
                return Ok(state.next_offset);
            }
            if file_number > state.file_number {
                return Ok(FILE_HEADER_SIZE);
            }
        }
        self.files.file_len(file_number)
    }

    pub fn first_file(&self) -> u32 {
        self.first_file
    }

    /// LSN of the first possible entry.
    pub fn first_lsn(&self) -> Lsn {
        Lsn::new(self.first_file, FILE_HEADER_SIZE)
    }

    /// LSN the next entry gets.
    pub fn end_of_log(&self) -> Lsn {
        let state = self.state.read();
        Lsn::new(state.file_number, state.next_offset)
    }

    pub fn last_lsn(&self) -> Lsn {
        self.state.read().last_lsn
    }

    pub fn current_file(&self) -> u32 {
        self.state.read().file_number
    }

    pub fn count_obsolete_node(&self, lsn: Lsn, entry_type: LogEntryType, size: u32) {
        self.state
            .write()
            .tracker
            .count_obsolete(lsn, entry_type.is_node(), size as u64);
    }

    pub fn count_obsolete_nodes(&self, nodes: &[(Lsn, LogEntryType, u32)]) {
        let mut state = self.state.write();
        for (lsn, entry_type, size) in nodes {
            state
                .tracker
                .count_obsolete(*lsn, entry_type.is_node(), *size as u64);
        }
    }

    /// Count IN images obsolete, sizes aren't known to the caller.
    pub fn count_obsolete_ins(&self, lsns: &[Lsn]) {
        let mut state = self.state.write();
        for lsn in lsns {
            state.tracker.count_obsolete(*lsn, true, 0);
        }
    }

    pub fn file_summary(&self, file_number: u32) -> Option<FileSummary> {
        self.state.read().tracker.summary(file_number).cloned()
    }

    pub fn file_summaries(&self) -> BTreeMap<u32, FileSummary> {
        self.state.read().tracker.summaries()
    }

    pub fn stats(&self) -> LogStats {
        let state = self.state.read();
        LogStats {
            n_entries: self.counters.n_entries.load(Ordering::Relaxed),
            n_bytes: self.counters.n_bytes.load(Ordering::Relaxed),
            n_flushes: self.counters.n_flushes.load(Ordering::Relaxed),
            n_fsyncs: self.counters.n_fsyncs.load(Ordering::Relaxed),
            n_group_commit_waits: self.counters.n_group_commit_waits.load(Ordering::Relaxed),
            n_repeat_faults: self.counters.n_repeat_faults.load(Ordering::Relaxed),
            n_files: (state.file_number - self.first_file + 1) as u64,
        }
    }

    pub fn env_state(&self) -> &Arc<EnvState> {
        &self.env_state
    }

    /// Dump every entry of the log at debug level.
    pub fn show_log_contents(&self) {
        let mut depiction = String::new();
        depiction.push_str(&format!(
            "├── [log] files {}..={}, end {}\n",
            self.first_file,
            self.current_file(),
            self.end_of_log()
        ));

        let mut reader = LogReader::new(self, self.first_lsn());
        let mut record_id = 0;
        loop {
            let (lsn, header, payload) = match reader.next_raw() {
                Ok(Some(v)) => v,
                Ok(None) => break,
                Err(e) => {
                    depiction.push_str(&format!("└── [error] {}\n", e));
                    break;
                }
            };

            depiction.push_str(&format!(
                "├── [record {}]-{:?} at {}\n",
                record_id, header.entry_type, lsn,
            ));
            depiction.push_str(&format!(
                "│   ├── [{} bytes] flags: provisional {}, transactional {}\n",
                HEADER_SIZE, header.provisional, header.transactional,
            ));
            match LogEntry::deserialize(header.entry_type, &payload) {
                Ok(entry) => depiction.push_str(&format!("│   ├── {}\n", entry.summary())),
                Err(e) => depiction.push_str(&format!("│   ├── undecodable: {}\n", e)),
            }
            depiction.push_str(&format!(
                "│   └── [{} bytes] payload: 0x{}{}\n",
                payload.len(),
                hex::encode(&payload[..payload.len().min(32)]),
                if payload.len() > 32 { "..." } else { "" },
            ));
            record_id += 1;
        }

        debug!("log content: \n{}", depiction);
    }
}
