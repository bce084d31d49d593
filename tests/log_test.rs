mod test_utils;

use std::{
    fs::OpenOptions,
    io::{Seek, SeekFrom, Write},
    path::Path,
    sync::Arc,
};

use rand::prelude::*;
use small_je::{
    environment::EnvState,
    tx_log::{
        ActiveTxn, BinImage, BinSlotImage, CheckpointFileReader, FileManager, LogEntry,
        LogEntryHeader, LogEntryType, LogManager, LogReader, Lsn, HEADER_SIZE, NULL_LSN,
    },
    Durability, EnvConfig, SmallError,
};

fn open_log(home: &Path, adjust: impl FnOnce(EnvConfig) -> EnvConfig) -> LogManager {
    let config = adjust(EnvConfig::new(home));
    LogManager::open(&config, Arc::new(EnvState::new())).unwrap()
}

fn store(oid: u64, len: usize) -> LogEntry {
    LogEntry::StoreObject {
        txn_id: 0,
        db_id: 1,
        oid,
        cid: 0,
        value: vec![oid as u8; len],
    }
}

/// An entry read back by the LSN `log_item` returned is the entry that
/// was written, byte for byte, from the buffers and from the file.
#[test]
fn test_round_trip() {
    test_utils::setup();

    let dir = tempfile::tempdir().unwrap();
    let log = open_log(dir.path(), |c| c);

    let mut rng = rand::thread_rng();
    let mut written = Vec::new();
    for _ in 0..20 {
        let len = rng.gen_range(0, 3000);
        let payload: Vec<u8> = (0..len).map(|_| rng.gen()).collect();
        let header = LogEntryHeader::new(LogEntryType::StoreObject, payload.len() as u32, false, true, 0);
        let lsn = log
            .log_item(header, &payload, false, false, false, NULL_LSN, 0)
            .unwrap();
        written.push((lsn, payload));
    }

    for (lsn, payload) in &written {
        let (header, read) = log.read_raw(*lsn).unwrap();
        assert_eq!(&read, payload);
        assert_eq!(header.entry_type, LogEntryType::StoreObject);
        assert!(header.transactional);
        assert!(!header.provisional);
    }

    log.flush().unwrap();
    for (lsn, payload) in &written {
        assert_eq!(&log.read_raw(*lsn).unwrap().1, payload);
    }

    // LSNs grow in append order
    assert!(written.windows(2).all(|w| w[0].0 < w[1].0));
    assert_eq!(log.last_lsn(), written.last().unwrap().0);
}

#[test]
fn test_entry_round_trip() {
    test_utils::setup();

    let dir = tempfile::tempdir().unwrap();
    let log = open_log(dir.path(), |c| c);

    let entries = vec![
        LogEntry::Begin { txn_id: 3 },
        store(1, 10),
        LogEntry::DeleteObject {
            txn_id: 3,
            db_id: 1,
            oid: 1,
        },
        LogEntry::CheckpointStart {
            checkpoint_id: 1,
            active_txns: vec![ActiveTxn {
                txn_id: 3,
                first_lsn: Lsn::new(0, 24),
            }],
        },
        LogEntry::BIN(BinImage {
            node_id: 7,
            db_id: 1,
            slots: vec![BinSlotImage {
                key: 1,
                lsn: Lsn::new(0, 100),
                known_deleted: false,
            }],
        }),
        LogEntry::Commit { txn_id: 3 },
    ];

    let mut lsns = Vec::new();
    for entry in &entries {
        lsns.push(log.log(entry).unwrap());
    }
    let provisional = log.log_provisional(&store(2, 4)).unwrap();

    for (lsn, entry) in lsns.iter().zip(entries.iter()) {
        let (header, read) = log.read_entry(*lsn).unwrap();
        assert_eq!(&read, entry);
        assert_eq!(header.entry_type, entry.entry_type());
    }
    assert!(log.read_header(provisional).unwrap().provisional);

    // an LSN that doesn't address an entry
    assert!(log.read_raw(Lsn::new(0, 3)).is_err());
}

#[test]
fn test_rollover() {
    test_utils::setup();

    let dir = tempfile::tempdir().unwrap();
    let log = open_log(dir.path(), |c| c.with_log_file_max(1024));

    let start = log.log(&LogEntry::CheckpointStart {
        checkpoint_id: 1,
        active_txns: vec![],
    })
    .unwrap();
    for oid in 0..100 {
        log.log(&store(oid, 64)).unwrap();
    }
    log.flush().unwrap();

    assert!(log.current_file() > 1);
    assert_eq!(log.stats().n_files, log.current_file() as u64 + 1);
    for n in 0..=log.current_file() {
        assert!(dir.path().join(FileManager::file_name(n)).exists());
    }

    // forward, across files
    let oids: Vec<u64> = LogReader::new(&log, log.first_lsn())
        .filter_map(|item| match item.unwrap() {
            (_, _, LogEntry::StoreObject { oid, .. }) => Some(oid),
            _ => None,
        })
        .collect();
    assert_eq!(oids, (0..100).collect::<Vec<u64>>());

    // backward, across files
    let mut reader = CheckpointFileReader::new(&log);
    let (lsn, _) = reader.find_last(LogEntryType::CheckpointStart).unwrap().unwrap();
    assert_eq!(lsn, start);
    assert_eq!(lsn.file_number(), 0);

    // the file chain survives a reopen
    let end = log.end_of_log();
    drop(log);
    let log = open_log(dir.path(), |c| c.with_log_file_max(1024));
    assert_eq!(log.end_of_log(), end);
    let mut reader = CheckpointFileReader::new(&log);
    assert_eq!(reader.find_last(LogEntryType::CheckpointStart).unwrap().unwrap().0, start);
}

/// Entries never written out are gone after a crash, written ones stay.
#[test]
fn test_crash_loses_buffered_entries() {
    test_utils::setup();

    let dir = tempfile::tempdir().unwrap();
    let log = open_log(dir.path(), |c| c);
    let durable = log.log_and_flush(&store(1, 8)).unwrap();
    let end_durable = log.end_of_log();
    log.log(&store(2, 8)).unwrap();
    drop(log);

    let log = open_log(dir.path(), |c| c);
    assert_eq!(log.last_lsn(), durable);
    assert_eq!(log.end_of_log(), end_durable);
    let entries: Vec<_> = LogReader::new(&log, log.first_lsn()).collect();
    assert_eq!(entries.len(), 1);
}

#[test]
fn test_torn_tail() {
    test_utils::setup();

    let dir = tempfile::tempdir().unwrap();
    let log = open_log(dir.path(), |c| c);
    let mut lsns = Vec::new();
    for oid in 0..5 {
        lsns.push(log.log(&store(oid, 32)).unwrap());
    }
    log.flush().unwrap();
    let end = log.end_of_log();
    drop(log);

    // garbage after the last entry
    let path = dir.path().join(FileManager::file_name(0));
    let mut file = OpenOptions::new().append(true).open(&path).unwrap();
    file.write_all(&[0xFF; 40]).unwrap();
    drop(file);

    let log = open_log(dir.path(), |c| c);
    assert_eq!(log.end_of_log(), end);
    assert_eq!(log.last_lsn(), lsns[4]);
    assert_eq!(std::fs::metadata(&path).unwrap().len(), end.offset());
    drop(log);

    // a damaged last entry is cut off too
    let mut file = OpenOptions::new().write(true).open(&path).unwrap();
    file.seek(SeekFrom::Start(lsns[4].offset() + HEADER_SIZE as u64 + 3))
        .unwrap();
    file.write_all(&[0xAB, 0xCD]).unwrap();
    drop(file);

    let log = open_log(dir.path(), |c| c);
    assert_eq!(log.last_lsn(), lsns[3]);
    assert_eq!(log.end_of_log(), lsns[4]);

    // appending continues where the valid log ends
    let lsn = log.log(&store(9, 4)).unwrap();
    assert_eq!(lsn, lsns[4]);
    assert_eq!(log.read_entry(lsn).unwrap().1, store(9, 4));
}

/// A commit whose entry was already flushed by someone else does no
/// I/O of its own.
#[test]
fn test_group_commit() {
    test_utils::setup();

    let dir = tempfile::tempdir().unwrap();
    let log = open_log(dir.path(), |c| c);

    let first = log.log(&LogEntry::Commit { txn_id: 1 }).unwrap();
    let second = log.log(&LogEntry::Commit { txn_id: 2 }).unwrap();

    log.flush_to(second, Durability::Sync).unwrap();
    let stats = log.stats();
    assert_eq!(stats.n_fsyncs, 1);

    log.flush_to(first, Durability::Sync).unwrap();
    log.flush_to(second, Durability::WriteNoSync).unwrap();
    let stats = log.stats();
    assert_eq!(stats.n_fsyncs, 1);
    assert_eq!(stats.n_group_commit_waits, 2);

    // NoSync leaves the entry in the buffer
    let third = log.log(&LogEntry::Commit { txn_id: 3 }).unwrap();
    log.flush_to(third, Durability::NoSync).unwrap();
    assert_eq!(log.stats().n_flushes, stats.n_flushes);
}

/// Concurrent committers, each waiting for its own entry.
#[test]
fn test_concurrent_appends() {
    test_utils::setup();

    let dir = tempfile::tempdir().unwrap();
    let log = open_log(dir.path(), |c| c.with_log_file_max(4096));

    let lsns = crossbeam::scope(|s| {
        let handles: Vec<_> = (0..4u64)
            .map(|t| {
                let log = &log;
                s.spawn(move |_| {
                    let mut lsns = Vec::new();
                    for i in 0..50 {
                        let lsn = log.log(&store(t * 1000 + i, 40)).unwrap();
                        log.flush_to(lsn, Durability::Sync).unwrap();
                        lsns.push((lsn, t * 1000 + i));
                    }
                    lsns
                })
            })
            .collect();
        handles
            .into_iter()
            .flat_map(|h| h.join().unwrap())
            .collect::<Vec<_>>()
    })
    .unwrap();

    assert_eq!(lsns.len(), 200);
    for (lsn, oid) in lsns {
        assert_eq!(log.read_entry(lsn).unwrap().1, store(oid, 40));
    }
    let stats = log.stats();
    assert_eq!(stats.n_entries, 200);
    log.show_log_contents();
}

#[test]
fn test_utilization() {
    test_utils::setup();

    let dir = tempfile::tempdir().unwrap();
    let log = open_log(dir.path(), |c| c);

    let (first, first_size) = log.log_entry(&store(1, 100), false, false, NULL_LSN, 0).unwrap();
    let (_, second_size) = log.log_entry(&store(1, 50), false, false, first, first_size).unwrap();
    let bin = LogEntry::BIN(BinImage {
        node_id: 1,
        db_id: 1,
        slots: vec![],
    });
    let (bin_lsn, bin_size) = log.log_entry(&bin, false, false, NULL_LSN, 0).unwrap();

    let summary = log.file_summary(0).unwrap();
    assert_eq!(summary.total_count, 3);
    assert_eq!(summary.total_size, (first_size + second_size + bin_size) as u64);
    assert_eq!(summary.total_node_count, 1);
    assert_eq!(summary.obsolete_record_count, 1);
    assert_eq!(summary.obsolete_record_size, first_size as u64);

    log.count_obsolete_node(bin_lsn, LogEntryType::BIN, bin_size);
    let summary = log.file_summary(0).unwrap();
    assert_eq!(summary.obsolete_node_size, bin_size as u64);
    assert_eq!(summary.obsolete_size(), (first_size + bin_size) as u64);
    assert!(summary.utilization() < 100);
    assert_eq!(log.file_summaries().len(), 1);
}

/// After a fatal error the log refuses to append.
#[test]
fn test_invalid_environment() {
    test_utils::setup();

    let dir = tempfile::tempdir().unwrap();
    let state = Arc::new(EnvState::new());
    let log = LogManager::open(&EnvConfig::new(dir.path()), state.clone()).unwrap();
    log.log(&store(1, 1)).unwrap();

    state.invalidate(&SmallError::LogIo("disk gone".to_string()));
    assert!(!log.env_state().is_valid());
    match log.log(&store(2, 1)) {
        Err(SmallError::EnvironmentInvalid(reason)) => assert!(reason.contains("disk gone")),
        other => panic!("expected an invalid environment, got {:?}", other),
    }

    // the first reason sticks
    state.invalidate(&SmallError::Recovery("later".to_string()));
    assert!(state.reason().unwrap().contains("disk gone"));
}
