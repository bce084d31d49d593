mod test_utils;

use small_je::{
    btree::{Bin, BinSlot, FlushStats},
    tx_log::{BinDeltaImage, BinImage, BinSlotImage, LogEntry, LogEntryType, Lsn},
    SmallError,
};
use test_utils::{insert_keys, shuffled_keys, snapshot, value_of};

fn full_image(keys: &[u64]) -> BinImage {
    BinImage {
        node_id: 1,
        db_id: 1,
        slots: keys
            .iter()
            .map(|k| BinSlotImage {
                key: *k,
                lsn: Lsn::new(0, 100 + *k),
                known_deleted: false,
            })
            .collect(),
    }
}

#[test]
fn test_splits() {
    test_utils::setup();

    let (_dir, env) = test_utils::new_env();
    let db = env.create_database("splits").unwrap();

    let keys = shuffled_keys(200);
    insert_keys(&db, &keys);

    let expected: Vec<(u64, Vec<u8>)> = (0..200).map(|k| (k, value_of(k))).collect();
    assert_eq!(snapshot(&db), expected);
    assert_eq!(db.count(None).unwrap(), 200);

    // splits log both halves provisionally
    let n_split_images = test_utils::count_entries(&env, LogEntryType::BIN)
        + test_utils::count_entries(&env, LogEntryType::IN);
    assert!(n_split_images > 0);

    let info = env.checkpoint().unwrap();
    assert!(info.flush.n_ins > 0);
    assert!(info.flush.n_full_bins > 0);
    assert!(!info.root_lsn.is_null());

    for key in [0, 57, 199] {
        assert_eq!(db.get(None, key).unwrap(), Some(value_of(key)));
    }
    assert_eq!(db.get(None, 200).unwrap(), None);
}

#[test]
fn test_bin_delta_image() {
    test_utils::setup();

    let keys: Vec<u64> = (0..10).collect();
    let full = full_image(&keys);

    // a BIN never logged has nothing to be a delta of
    let mut fresh = Bin::new();
    fresh.put(BinSlot::new(1, Lsn::new(0, 50), 0, false));
    assert!(!fresh.should_log_delta(50, 10));

    let mut bin = Bin::from_image(&full, Lsn::new(0, 24), 200);
    assert_eq!(bin.len(), 10);
    assert!(!bin.should_log_delta(50, 10));

    bin.put(BinSlot::new(3, Lsn::new(1, 500), 0, false));
    assert!(bin.should_log_delta(50, 10));
    // 1 of 10 slots is not less than 5 percent
    assert!(!bin.should_log_delta(5, 10));
    assert!(!bin.should_log_delta(50, 0));

    let delta = bin.delta_image(1, 1);
    assert_eq!(delta.n_deltas, 1);
    assert_eq!(delta.last_full_lsn, Lsn::new(0, 24));
    assert_eq!(delta.slots.len(), 1);

    let applied = delta.apply(&full);
    assert_eq!(applied.slots.len(), 10);
    assert_eq!(applied.slots[3].lsn, Lsn::new(1, 500));
    assert_eq!(applied.slots[4], full.slots[4]);

    // a removed slot can't be expressed by a delta
    bin.remove(5);
    assert!(!bin.should_log_delta(50, 10));
}

/// Deltas are cumulative: the latest delta applied to the full image
/// gives the same BIN as applying every delta in turn.
#[test]
fn test_bin_delta_chain() {
    test_utils::setup();

    let (_dir, env) = test_utils::new_env_with(|c| c.with_bin_max_entries(16).with_bin_delta_percent(50));
    let db = env.create_database("deltas").unwrap();
    let keys: Vec<u64> = (0..10).collect();
    insert_keys(&db, &keys);

    let info = env.checkpoint().unwrap();
    assert_eq!(info.flush.n_full_bins, 1);

    db.put(None, 3, b"three").unwrap();
    assert_eq!(env.checkpoint().unwrap().flush.n_delta_bins, 1);
    db.put(None, 7, b"seven").unwrap();
    assert_eq!(env.checkpoint().unwrap().flush.n_delta_bins, 1);

    // nothing changed, nothing logged
    assert_eq!(env.checkpoint().unwrap().flush, FlushStats::default());

    let mut fulls = Vec::new();
    let mut deltas: Vec<(Lsn, BinDeltaImage)> = Vec::new();
    for (lsn, _, entry) in test_utils::log_entries(&env) {
        match entry {
            LogEntry::BIN(image) if image.db_id == db.id() => fulls.push((lsn, image)),
            LogEntry::BINDelta(delta) if delta.db_id == db.id() => deltas.push((lsn, delta)),
            _ => {}
        }
    }
    let (full_lsn, full) = fulls.last().unwrap();
    assert_eq!(deltas.len(), 2);
    let (first, second) = (&deltas[0].1, &deltas[1].1);
    assert_eq!(first.n_deltas, 1);
    assert_eq!(second.n_deltas, 2);
    assert_eq!(second.last_full_lsn, *full_lsn);
    assert_eq!(second.slots.iter().map(|s| s.key).collect::<Vec<_>>(), vec![3, 7]);
    assert_eq!(second.apply(full), second.apply(&first.apply(full)));

    // too many changed slots, back to a full image
    for key in 0..5 {
        db.put(None, key, b"again").unwrap();
    }
    let info = env.checkpoint().unwrap();
    assert_eq!(info.flush.n_full_bins, 1);
    assert_eq!(info.flush.n_delta_bins, 0);

    // the BIN comes back from a delta after a crash
    db.put(None, 8, b"eight").unwrap();
    env.checkpoint().unwrap();
    drop(db);
    let env = test_utils::crash_and_reopen(env);
    let db = env.open_database("deltas").unwrap();
    assert_eq!(db.get(None, 8).unwrap(), Some(b"eight".to_vec()));
    assert_eq!(db.get(None, 7).unwrap(), Some(b"seven".to_vec()));
    assert_eq!(db.get(None, 0).unwrap(), Some(b"again".to_vec()));
    assert_eq!(db.get(None, 9).unwrap(), Some(value_of(9)));
}

/// Uncommitted slots never reach a checkpoint image.
#[test]
fn test_checkpoint_images_are_committed() {
    test_utils::setup();

    let (_dir, env) = test_utils::new_env_with(|c| c.with_bin_max_entries(16));
    let db = env.create_database("images").unwrap();
    insert_keys(&db, &[1, 2]);

    let txn = env.begin_transaction().unwrap();
    db.put(Some(&txn), 3, b"new").unwrap();
    db.put(Some(&txn), 1, b"changed").unwrap();
    let info = env.checkpoint().unwrap();
    assert_eq!(info.n_active_txns, 1);

    let image = test_utils::log_entries(&env)
        .into_iter()
        .filter_map(|(_, _, entry)| match entry {
            LogEntry::BIN(image) if image.db_id == db.id() => Some(image),
            _ => None,
        })
        .last()
        .unwrap();
    assert_eq!(image.slots.iter().map(|s| s.key).collect::<Vec<_>>(), vec![1, 2]);

    env.abort(&txn).unwrap();
    assert_eq!(db.get(None, 1).unwrap(), Some(value_of(1)));
    assert_eq!(db.get(None, 3).unwrap(), None);
}

#[test]
fn test_evict() {
    test_utils::setup();

    let (_dir, env) = test_utils::new_env();
    let db = env.create_database("evict").unwrap();
    insert_keys(&db, &shuffled_keys(100));

    env.checkpoint().unwrap();
    let n_evicted = env.evict().unwrap();
    assert!(n_evicted > 0);
    assert_eq!(env.evict().unwrap(), 0);

    // every BIN is faulted back in from the log
    let expected: Vec<(u64, Vec<u8>)> = (0..100).map(|k| (k, value_of(k))).collect();
    assert_eq!(snapshot(&db), expected);
    assert_eq!(env.evict().unwrap(), n_evicted);

    // a BIN with an uncommitted slot stays, the write isn't lost
    let txn = env.begin_transaction().unwrap();
    db.put(Some(&txn), 42, b"pending").unwrap();
    env.checkpoint().unwrap();
    env.evict().unwrap();
    assert_eq!(db.get(Some(&txn), 42).unwrap(), Some(b"pending".to_vec()));
    env.commit(&txn).unwrap();
    assert_eq!(db.get(None, 42).unwrap(), Some(b"pending".to_vec()));
}

#[test]
fn test_delete_and_compress() {
    test_utils::setup();

    let (_dir, env) = test_utils::new_env();
    let db = env.create_database("compress").unwrap();
    insert_keys(&db, &(0..20).collect::<Vec<u64>>());

    for key in 0..10 {
        assert!(db.delete(None, key).unwrap());
    }
    assert!(!db.delete(None, 0).unwrap());
    assert!(!db.delete(None, 999).unwrap());
    assert_eq!(db.get(None, 5).unwrap(), None);
    assert_eq!(db.count(None).unwrap(), 10);

    assert_eq!(env.compress().unwrap(), 10);
    assert_eq!(env.compress().unwrap(), 0);
    assert_eq!(env.stats().compressor.n_removed, 10);

    // a transactional delete is only queued at commit
    let txn = env.begin_transaction().unwrap();
    assert!(db.delete(Some(&txn), 15).unwrap());
    assert_eq!(env.compress().unwrap(), 0);
    env.commit(&txn).unwrap();
    assert_eq!(env.compress().unwrap(), 1);

    // a busy record lock makes the compressor try again later
    assert!(db.delete(None, 17).unwrap());
    let txn = env.begin_transaction().unwrap();
    db.put(Some(&txn), 17, b"back").unwrap();
    assert_eq!(env.compress().unwrap(), 0);
    assert!(env.stats().compressor.n_requeued >= 1);
    env.commit(&txn).unwrap();
    assert_eq!(env.compress().unwrap(), 0);
    assert_eq!(db.get(None, 17).unwrap(), Some(b"back".to_vec()));

    assert_eq!(db.count(None).unwrap(), 9);
}

#[test]
fn test_databases() {
    test_utils::setup();

    let (_dir, env) = test_utils::new_env();
    let a = env.create_database("a").unwrap();
    let b = env.create_database("b").unwrap();
    assert_ne!(a.id(), b.id());
    assert!(matches!(env.create_database("a"), Err(SmallError::DatabaseExists(_))));
    assert!(matches!(env.open_database("c"), Err(SmallError::DatabaseNotFound(_))));

    a.put(None, 1, b"in a").unwrap();
    b.put(None, 1, b"in b").unwrap();
    assert_eq!(a.get(None, 1).unwrap(), Some(b"in a".to_vec()));
    assert_eq!(env.open_database("b").unwrap().get(None, 1).unwrap(), Some(b"in b".to_vec()));

    let mut names = env.database_names();
    names.sort();
    assert_eq!(names, vec!["a".to_string(), "b".to_string()]);

    env.remove_database("a").unwrap();
    assert!(matches!(a.get(None, 1), Err(SmallError::DatabaseNotFound(_))));
    assert!(matches!(env.remove_database("a"), Err(SmallError::DatabaseNotFound(_))));
    assert_eq!(env.database_names(), vec!["b".to_string()]);

    // the name can be used again, by a new database
    let again = env.create_database("a").unwrap();
    assert_ne!(again.id(), a.id());
    assert_eq!(again.get(None, 1).unwrap(), None);
}
