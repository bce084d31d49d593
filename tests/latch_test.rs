mod test_utils;

use std::{
    sync::{
        atomic::{AtomicUsize, Ordering},
        Arc, Mutex,
    },
    thread,
    time::Duration,
};

use small_je::latch::{
    Latch, LatchError, LatchFactory, LatchKind, LatchTable, Latched, SharedLatch, SpinLatch,
};

fn wait_for_waiters(latch: &dyn Latch, n: usize) {
    while latch.n_waiters() < n {
        thread::sleep(Duration::from_millis(1));
    }
}

#[test]
fn test_self_held() {
    test_utils::setup();

    let latch = SharedLatch::new("a", None, None);
    latch.acquire().unwrap();
    assert_eq!(latch.acquire(), Err(LatchError::SelfHeld("a".to_string())));
    assert_eq!(
        latch.acquire_no_wait(),
        Err(LatchError::SelfHeld("a".to_string()))
    );
    assert!(latch.is_owner());

    latch.release().unwrap();
    assert_eq!(latch.release(), Err(LatchError::NotHeld("a".to_string())));
    assert!(!latch.release_if_owner());
    assert!(!latch.is_held());

    let stats = latch.stats();
    assert_eq!(stats.n_acquires_self_owned, 2);
    assert_eq!(stats.n_releases, 1);

    let spin = SpinLatch::new("b", None, None);
    spin.acquire().unwrap();
    assert_eq!(spin.acquire(), Err(LatchError::SelfHeld("b".to_string())));
    spin.release().unwrap();
    assert_eq!(spin.release(), Err(LatchError::NotHeld("b".to_string())));
}

/// Release by a thread that doesn't own the latch fails and leaves the
/// owner in place.
#[test]
fn test_release_by_other_thread() {
    test_utils::setup();

    let latch = Arc::new(SharedLatch::new("a", None, None));
    latch.acquire().unwrap();

    let other = latch.clone();
    let result = thread::spawn(move || other.release()).join().unwrap();
    assert_eq!(result, Err(LatchError::NotHeld("a".to_string())));
    assert!(latch.is_owner());
    latch.release().unwrap();
}

#[test]
fn test_mutual_exclusion() {
    test_utils::setup();

    let factory_table = Arc::new(LatchTable::new());
    for kind in [LatchKind::Shared, LatchKind::Spin] {
        let factory = LatchFactory::new(kind, None, factory_table.clone());
        let latch: Arc<Box<dyn Latch>> = Arc::new(factory.create("counter"));
        let inside = AtomicUsize::new(0);
        let total = AtomicUsize::new(0);

        crossbeam::scope(|s| {
            for _ in 0..8 {
                s.spawn(|_| {
                    for _ in 0..200 {
                        latch.acquire().unwrap();
                        assert_eq!(inside.fetch_add(1, Ordering::SeqCst), 0);
                        total.fetch_add(1, Ordering::SeqCst);
                        inside.fetch_sub(1, Ordering::SeqCst);
                        latch.release().unwrap();
                    }
                });
            }
        })
        .unwrap();

        assert_eq!(total.load(Ordering::SeqCst), 8 * 200);
        assert!(!latch.is_held());
        assert_eq!(latch.stats().n_releases, 8 * 200);
    }
    assert_eq!(factory_table.count_latches_held(), 0);
}

/// Waiters are granted in the order they started waiting.
#[test]
fn test_fifo() {
    test_utils::setup();

    let latch = Arc::new(SharedLatch::new("fifo", None, None));
    let order = Arc::new(Mutex::new(Vec::new()));
    latch.acquire().unwrap();

    let mut handles = Vec::new();
    for i in 0..6 {
        let latch_clone = latch.clone();
        let order = order.clone();
        handles.push(thread::spawn(move || {
            latch_clone.acquire().unwrap();
            order.lock().unwrap().push(i);
            latch_clone.release().unwrap();
        }));

        // the next thread only starts once this one is queued
        wait_for_waiters(latch.as_ref(), i + 1);
    }

    latch.release().unwrap();
    for handle in handles {
        handle.join().unwrap();
    }

    assert_eq!(*order.lock().unwrap(), (0..6).collect::<Vec<usize>>());
    assert_eq!(latch.stats().n_acquires_with_contention, 6);
}

#[test]
fn test_acquire_no_wait() {
    test_utils::setup();

    let latch = Arc::new(SharedLatch::new("a", None, None));
    latch.acquire().unwrap();

    let other = latch.clone();
    let got = thread::spawn(move || other.acquire_no_wait().unwrap())
        .join()
        .unwrap();
    assert!(!got);

    latch.release().unwrap();
    let other = latch.clone();
    let got = thread::spawn(move || {
        let got = other.acquire_no_wait().unwrap();
        other.release().unwrap();
        got
    })
    .join()
    .unwrap();
    assert!(got);

    let stats = latch.stats();
    assert_eq!(stats.n_acquire_no_wait_successful, 1);
    assert_eq!(stats.n_acquire_no_wait_unsuccessful, 1);
}

#[test]
fn test_timeout() {
    test_utils::setup();

    for kind in [LatchKind::Shared, LatchKind::Spin] {
        let factory = LatchFactory::new(kind, Some(Duration::from_millis(50)), Arc::new(LatchTable::new()));
        let latch: Arc<Box<dyn Latch>> = Arc::new(factory.create("slow"));
        latch.acquire().unwrap();

        let other = latch.clone();
        let result = thread::spawn(move || other.acquire()).join().unwrap();
        match result {
            Err(LatchError::Timeout { name, .. }) => assert_eq!(name, "slow"),
            other => panic!("expected a timeout, got {:?}", other),
        }
        assert_eq!(latch.stats().n_timeouts, 1);
        assert_eq!(latch.n_waiters(), 0);

        // the timed out waiter left no trace, the latch still works
        latch.release().unwrap();
        let other = latch.clone();
        thread::spawn(move || {
            other.acquire().unwrap();
            other.release().unwrap();
        })
        .join()
        .unwrap();
    }
}

#[test]
fn test_latch_table() {
    test_utils::setup();

    let table = Arc::new(LatchTable::new());
    let a = SharedLatch::new("BIN_1", None, Some(table.clone()));
    let b = SpinLatch::new("root_1", None, Some(table.clone()));

    b.acquire().unwrap();
    a.acquire().unwrap();
    assert_eq!(table.count_latches_held(), 2);
    assert_eq!(table.latches_held_to_string(), "root_1, BIN_1");

    // another thread holds nothing
    let t = table.clone();
    let n = thread::spawn(move || t.count_latches_held()).join().unwrap();
    assert_eq!(n, 0);

    b.release().unwrap();
    assert_eq!(table.latches_held_to_string(), "BIN_1");
    a.release().unwrap();
    assert_eq!(table.count_latches_held(), 0);
    assert!(!table.unnote_latch("BIN_1"));

    // two environments don't see each other's latches
    let other_table = LatchTable::new();
    a.acquire().unwrap();
    assert_eq!(other_table.count_latches_held(), 0);
    a.release().unwrap();
}

#[test]
fn test_latched_guard() {
    test_utils::setup();

    let factory = LatchFactory::new(LatchKind::Shared, None, Arc::new(LatchTable::new()));
    let counter = Arc::new(Latched::new(factory.create("counter"), 0u64));

    crossbeam::scope(|s| {
        for _ in 0..4 {
            let counter = &counter;
            s.spawn(move |_| {
                for _ in 0..100 {
                    let mut guard = counter.latch();
                    *guard += 1;
                }
            });
        }
    })
    .unwrap();
    assert_eq!(*counter.latch(), 400);

    // a held guard makes try_latch fail on other threads
    let guard = counter.latch();
    assert!(counter.raw_latch().is_owner());
    let other = counter.clone();
    let busy = thread::spawn(move || other.try_latch().is_none())
        .join()
        .unwrap();
    assert!(busy);

    drop(guard);
    assert!(!counter.raw_latch().is_held());
    assert_eq!(factory.table().count_latches_held(), 0);
}

/// Coupling: the child guard outlives the parent guard.
#[test]
fn test_latch_coupling() {
    test_utils::setup();

    let factory = LatchFactory::new(LatchKind::Shared, None, Arc::new(LatchTable::new()));
    let parent = Arc::new(Latched::new(factory.create("IN_1"), "parent"));
    let child = Arc::new(Latched::new(factory.create("BIN_2"), "child"));

    let parent_guard = parent.latch();
    let child_guard = child.latch();
    assert_eq!(factory.table().count_latches_held(), 2);
    drop(parent_guard);

    assert!(!parent.raw_latch().is_held());
    assert!(child.raw_latch().is_owner());
    assert_eq!(*child_guard, "child");
    assert_eq!(factory.table().latches_held_to_string(), "BIN_2");
}
