mod test_utils;

use std::{
    convert::TryInto,
    sync::atomic::{AtomicBool, Ordering},
};

use log::debug;
use rand::prelude::*;
use small_je::{DeadlockDetection, IsolationLevel, SmallError};
use test_utils::value_of;

const THREADS: u64 = 4;
const KEYS_PER_THREAD: u64 = 60;

/// Writers on disjoint key ranges, committing or aborting at random
/// while checkpoints run. Exactly the committed keys survive, in
/// memory and after a crash.
#[test]
fn test_concurrent_writers() {
    test_utils::setup();

    let (_dir, env) = test_utils::new_env();
    let db = env.create_database("concurrent").unwrap();
    let writers_done = AtomicBool::new(false);

    let mut committed: Vec<u64> = crossbeam::scope(|s| {
        let checkpointer = s.spawn(|_| {
            let mut n = 0;
            while !writers_done.load(Ordering::SeqCst) {
                env.checkpoint().unwrap();
                n += 1;
            }
            n
        });

        let writers: Vec<_> = (0..THREADS)
            .map(|t| {
                let env = &env;
                let db = &db;
                s.spawn(move |_| {
                    let mut rng = rand::thread_rng();
                    let mut committed = Vec::new();
                    let start = t * KEYS_PER_THREAD;
                    for key in start..start + KEYS_PER_THREAD {
                        let txn = env.begin_transaction().unwrap();
                        db.put(Some(&txn), key, &value_of(key)).unwrap();
                        if rng.gen_bool(0.7) {
                            env.commit(&txn).unwrap();
                            committed.push(key);
                        } else {
                            env.abort(&txn).unwrap();
                        }
                    }
                    committed
                })
            })
            .collect();

        let committed: Vec<u64> = writers
            .into_iter()
            .flat_map(|w| w.join().unwrap())
            .collect();
        writers_done.store(true, Ordering::SeqCst);
        let n_checkpoints = checkpointer.join().unwrap();
        debug!("{} checkpoints while writing", n_checkpoints);
        committed
    })
    .unwrap();
    committed.sort_unstable();

    let expected: Vec<(u64, Vec<u8>)> = committed.iter().map(|k| (*k, value_of(*k))).collect();
    assert_eq!(test_utils::snapshot(&db), expected);
    assert_eq!(env.stats().locks.n_total_locks, 0);
    assert_eq!(env.latch_table().count_latches_held(), 0);

    drop(db);
    let env = test_utils::crash_and_reopen(env);
    let db = env.open_database("concurrent").unwrap();
    assert_eq!(test_utils::snapshot(&db), expected);
}

/// Non-transactional puts that split nodes all the time, next to a
/// checkpointer that never pauses. Puts keep completing while
/// checkpoints are in flight, and the tree they leave is intact, in
/// memory and after a crash.
#[test]
fn test_put_during_checkpoint() {
    test_utils::setup();

    let (_dir, env) = test_utils::new_env();
    let db = env.create_database("busy").unwrap();
    let keys = test_utils::shuffled_keys(400);
    let writer_done = AtomicBool::new(false);
    let in_checkpoint = AtomicBool::new(false);

    let (n_checkpoints, n_overlapping) = crossbeam::scope(|s| {
        let checkpointer = s.spawn(|_| {
            let mut n = 0;
            while !writer_done.load(Ordering::SeqCst) {
                in_checkpoint.store(true, Ordering::SeqCst);
                env.checkpoint().unwrap();
                in_checkpoint.store(false, Ordering::SeqCst);
                n += 1;
            }
            n
        });

        let writer = s.spawn(|_| {
            let mut n_overlapping = 0;
            for (i, key) in keys.iter().enumerate() {
                db.put(None, *key, &value_of(*key)).unwrap();
                if in_checkpoint.load(Ordering::SeqCst) {
                    n_overlapping += 1;
                }
                if i % 50 == 49 {
                    env.evict().unwrap();
                }
            }
            n_overlapping
        });

        let n_overlapping = writer.join().unwrap();
        writer_done.store(true, Ordering::SeqCst);
        (checkpointer.join().unwrap(), n_overlapping)
    })
    .unwrap();
    debug!(
        "{} checkpoints, {} puts finished inside one",
        n_checkpoints, n_overlapping
    );
    assert!(n_checkpoints > 0);
    assert!(n_overlapping > 0);
    assert_eq!(env.latch_table().count_latches_held(), 0);

    let expected: Vec<(u64, Vec<u8>)> = (0..400).map(|k| (k, value_of(k))).collect();
    assert_eq!(test_utils::snapshot(&db), expected);

    // puts after the last checkpoint are replayed
    drop(db);
    let env = test_utils::crash_and_reopen(env);
    let db = env.open_database("busy").unwrap();
    assert_eq!(test_utils::snapshot(&db), expected);
}

fn read_counter(value: Option<Vec<u8>>) -> u64 {
    match value {
        Some(bytes) => u64::from_be_bytes(bytes.as_slice().try_into().unwrap()),
        None => 0,
    }
}

/// Read-modify-write of one record under repeatable read. Two readers
/// upgrading at once deadlock, the victim retries.
#[test]
fn test_contended_counter() {
    test_utils::setup();

    let (_dir, env) = test_utils::new_env_with(|c| {
        c.with_deadlock_detection(DeadlockDetection::WaitsForGraph)
            .with_lock_timeout_ms(5_000)
    });
    let db = env.create_database("counter").unwrap();
    let increments = 25;

    let n_retries: usize = crossbeam::scope(|s| {
        let handles: Vec<_> = (0..THREADS)
            .map(|_| {
                let env = &env;
                let db = &db;
                s.spawn(move |_| {
                    let mut n_retries = 0;
                    for _ in 0..increments {
                        loop {
                            let txn = env.begin_transaction_with(IsolationLevel::RepeatableRead).unwrap();
                            let result = db
                                .get(Some(&txn), 0)
                                .map(read_counter)
                                .and_then(|v| db.put(Some(&txn), 0, &(v + 1).to_be_bytes()));
                            match result {
                                Ok(()) => {
                                    env.commit(&txn).unwrap();
                                    break;
                                }
                                Err(e) if e.is_contention() => {
                                    env.abort(&txn).unwrap();
                                    n_retries += 1;
                                }
                                Err(e) => panic!("unexpected error: {}", e),
                            }
                        }
                    }
                    n_retries
                })
            })
            .collect();
        handles.into_iter().map(|h| h.join().unwrap()).sum()
    })
    .unwrap();

    debug!("{} retries", n_retries);
    assert_eq!(read_counter(db.get(None, 0).unwrap()), THREADS * increments);
    let stats = env.stats();
    assert_eq!(stats.txns.n_commits, THREADS * increments);
    assert_eq!(stats.txns.n_aborts, n_retries as u64);
    assert_eq!(stats.locks.n_total_locks, 0);
}

/// A deadlock victim is told so, it isn't left waiting.
#[test]
fn test_deadlock_victim() {
    test_utils::setup();

    let (_dir, env) = test_utils::new_env_with(|c| {
        c.with_deadlock_detection(DeadlockDetection::WaitsForGraph)
            .with_lock_timeout_ms(0)
    });
    let db = env.create_database("deadlock").unwrap();
    test_utils::insert_keys(&db, &[1, 2]);
    let barrier = std::sync::Barrier::new(2);

    let results: Vec<Result<(), SmallError>> = crossbeam::scope(|s| {
        let handles: Vec<_> = [(1, 2), (2, 1)]
            .iter()
            .map(|&(first, second)| {
                let (env, db, barrier) = (&env, &db, &barrier);
                s.spawn(move |_| {
                    let txn = env.begin_transaction().unwrap();
                    db.put(Some(&txn), first, b"mine").unwrap();
                    barrier.wait();
                    let result = db.put(Some(&txn), second, b"mine");
                    match &result {
                        Ok(()) => env.commit(&txn).unwrap(),
                        Err(_) => env.abort(&txn).unwrap(),
                    }
                    result
                })
            })
            .collect();
        handles.into_iter().map(|h| h.join().unwrap()).collect()
    })
    .unwrap();

    let n_deadlocks = results
        .iter()
        .filter(|r| matches!(r, Err(SmallError::Deadlock(_))))
        .count();
    assert_eq!(n_deadlocks, 1);
    assert_eq!(results.iter().filter(|r| r.is_ok()).count(), 1);
    assert_eq!(db.get(None, 1).unwrap(), Some(b"mine".to_vec()));
    assert_eq!(db.get(None, 2).unwrap(), Some(b"mine".to_vec()));
}
