mod test_utils;

use std::{
    sync::{Arc, Barrier},
    thread,
    time::Duration,
};

use small_je::{
    transaction::LockManager, DeadlockDetection, EnvConfig, LockGrantType, LockType, Locker,
    LockingMode, ResourceId, SmallError,
};

fn new_lock_manager(adjust: impl FnOnce(EnvConfig) -> EnvConfig) -> Arc<LockManager> {
    let config = adjust(EnvConfig::default().with_lock_timeout_ms(100));
    Arc::new(LockManager::new(&config))
}

fn wait_for_waiters(lm: &LockManager, resource: ResourceId, n: usize) {
    while lm.n_waiters(resource) < n {
        thread::sleep(Duration::from_millis(1));
    }
}

/// A WRITE owner makes a no-wait WRITE request of another locker fail,
/// the same request succeeds after the release.
#[test]
fn test_write_denied_then_granted() {
    test_utils::setup();

    let lm = new_lock_manager(|c| c);
    let a = Locker::non_txn(&lm);
    let b = Locker::non_txn(&lm);
    let r = ResourceId::new(1, 5);

    assert_eq!(a.lock(r, LockType::Write, false).unwrap(), LockGrantType::GrantedNew);
    assert_eq!(b.lock(r, LockType::Write, true).unwrap(), LockGrantType::Denied);
    assert!(!b.owns(r));

    assert!(a.release(r).unwrap());
    assert_eq!(b.lock(r, LockType::Write, false).unwrap(), LockGrantType::GrantedNew);
    assert_eq!(lm.owned_lock_type(r, b.id()), Some(LockType::Write));
    assert!(!lm.is_owner(r, a.id()));
}

#[test]
fn test_read_sharing() {
    test_utils::setup();

    let lm = new_lock_manager(|c| c);
    let a = Locker::non_txn(&lm);
    let b = Locker::non_txn(&lm);
    let c = Locker::non_txn(&lm);
    let r = ResourceId::new(1, 7);

    assert_eq!(a.lock(r, LockType::Read, false).unwrap(), LockGrantType::GrantedNew);
    assert_eq!(b.lock(r, LockType::Read, false).unwrap(), LockGrantType::GrantedNew);
    assert_eq!(lm.n_owners(r), 2);

    // a writer can't join the readers
    assert_eq!(c.lock(r, LockType::Write, true).unwrap(), LockGrantType::Denied);

    // asking again for a covered type changes nothing
    assert_eq!(a.lock(r, LockType::Read, false).unwrap(), LockGrantType::GrantedExisting);

    a.release_all().unwrap();
    b.release_all().unwrap();
    assert_eq!(lm.n_owners(r), 0);
    assert_eq!(lm.stats().n_total_locks, 0);
}

#[test]
fn test_upgrade() {
    test_utils::setup();

    let lm = new_lock_manager(|c| c.with_lock_timeout_ms(10_000));
    let a = Locker::non_txn(&lm);
    let b = Locker::non_txn(&lm);
    let r = ResourceId::new(2, 1);

    a.lock(r, LockType::Read, false).unwrap();
    assert_eq!(a.lock(r, LockType::Write, false).unwrap(), LockGrantType::GrantedUpgrade);
    assert_eq!(lm.owned_lock_type(r, a.id()), Some(LockType::Write));
    assert_eq!(a.n_write_locks(), 1);
    assert_eq!(a.n_read_locks(), 0);

    // a WRITE owner asking for READ keeps its WRITE
    assert_eq!(a.lock(r, LockType::Read, false).unwrap(), LockGrantType::GrantedExisting);
    assert_eq!(lm.owned_lock_type(r, a.id()), Some(LockType::Write));
    a.release_all().unwrap();

    // an upgrade while another reader is there has to wait
    a.lock(r, LockType::Read, false).unwrap();
    b.lock(r, LockType::Read, false).unwrap();
    assert_eq!(a.lock(r, LockType::Write, true).unwrap(), LockGrantType::Denied);
    assert_eq!(lm.owned_lock_type(r, a.id()), Some(LockType::Read));

    // the waiting upgrade is granted once the other reader leaves
    crossbeam::scope(|s| {
        let handle = s.spawn(|_| a.lock(r, LockType::Write, false));
        wait_for_waiters(&lm, r, 1);
        b.release(r).unwrap();
        assert_eq!(handle.join().unwrap().unwrap(), LockGrantType::GrantedUpgrade);
    })
    .unwrap();
    assert_eq!(lm.owned_lock_type(r, a.id()), Some(LockType::Write));
}

/// Upgrades wait in front of new owners, and in arrival order among
/// themselves.
#[test]
fn test_upgrade_queue_order() {
    test_utils::setup();

    let lm = new_lock_manager(|c| c.with_lock_timeout_ms(10_000));
    let a = Locker::non_txn(&lm);
    let b = Locker::non_txn(&lm);
    let c = Locker::non_txn(&lm);
    let d = Locker::non_txn(&lm);
    let r = ResourceId::new(2, 2);
    for reader in [&a, &b, &c] {
        reader.lock(r, LockType::Read, false).unwrap();
    }

    crossbeam::scope(|s| {
        let new_owner = s.spawn(|_| d.lock(r, LockType::Write, false));
        wait_for_waiters(&lm, r, 1);
        let first = s.spawn(|_| a.lock(r, LockType::Write, false));
        wait_for_waiters(&lm, r, 2);

        // a and b wait for each other, b gives up
        let second = s.spawn(|_| {
            let result = lm.lock(r, &b, LockType::Write, false, Some(Duration::from_millis(500)));
            b.release_all().unwrap();
            result
        });
        wait_for_waiters(&lm, r, 3);
        assert_eq!(lm.waiter_ids(r), vec![a.id(), b.id(), d.id()]);

        c.release(r).unwrap();
        assert!(matches!(second.join().unwrap(), Err(SmallError::LockTimeout(_))));
        assert_eq!(first.join().unwrap().unwrap(), LockGrantType::GrantedUpgrade);
        assert_eq!(lm.waiter_ids(r), vec![d.id()]);

        a.release_all().unwrap();
        assert_eq!(new_owner.join().unwrap().unwrap(), LockGrantType::GrantedNew);
    })
    .unwrap();
    assert_eq!(lm.owned_lock_type(r, d.id()), Some(LockType::Write));
}

#[test]
fn test_lock_type_rules() {
    use LockType::*;

    assert!(Write.conflicts_with(Read));
    assert!(Read.conflicts_with(Write));
    assert!(!Read.conflicts_with(Read));
    assert!(!RangeRead.conflicts_with(Read));
    assert!(RangeInsert.conflicts_with(RangeRead));
    assert!(!RangeInsert.conflicts_with(Write));

    assert!(Write.covers(Read));
    assert!(!Read.covers(Write));
    assert!(RangeWrite.covers(Write));

    assert_eq!(Read.upgrade(Write), Write);
    assert_eq!(Read.upgrade(RangeRead), RangeRead);
    assert_eq!(Write.upgrade(RangeRead), RangeWrite);
    assert_eq!(RangeInsert.upgrade(Read), RangeWrite);

    assert_eq!(Write.demoted(), Read);
    assert_eq!(RangeWrite.demoted(), RangeRead);
    assert_eq!(Read.demoted(), Read);
}

/// A blocked request is granted as soon as the owner releases.
#[test]
fn test_waiter_granted_on_release() {
    test_utils::setup();

    let lm = new_lock_manager(|c| c.with_lock_timeout_ms(10_000));
    let r = ResourceId::new(1, 9);
    let owner = Locker::non_txn(&lm);
    owner.lock(r, LockType::Write, false).unwrap();

    let waiter_lm = lm.clone();
    let handle = thread::spawn(move || {
        let waiter = Locker::non_txn(&waiter_lm);
        let grant = waiter.lock(r, LockType::Read, false).unwrap();
        let owned = waiter_lm.owned_lock_type(r, waiter.id());
        (grant, owned)
    });

    wait_for_waiters(&lm, r, 1);
    assert!(lm.is_owner(r, owner.id()));
    owner.release_all().unwrap();

    let (grant, owned) = handle.join().unwrap();
    assert_eq!(grant, LockGrantType::GrantedNew);
    assert_eq!(owned, Some(LockType::Read));
    assert_eq!(lm.stats().n_waits, 1);
}

#[test]
fn test_timeout() {
    test_utils::setup();

    let lm = new_lock_manager(|c| c);
    let r = ResourceId::new(3, 3);
    let owner = Locker::non_txn(&lm);
    owner.lock(r, LockType::Write, false).unwrap();

    let waiter = Locker::non_txn(&lm).with_timeout(Some(Duration::from_millis(50)));
    match waiter.lock(r, LockType::Write, false) {
        Err(e @ SmallError::LockTimeout(_)) => assert!(e.is_contention()),
        other => panic!("expected a lock timeout, got {:?}", other),
    }

    // the abandoned request is gone
    assert_eq!(lm.n_waiters(r), 0);
    assert!(!lm.is_waiter(r, waiter.id()));
    assert!(!waiter.owns(r));

    let stats = lm.stats();
    assert_eq!(stats.n_timeouts, 1);
    assert_eq!(stats.n_owners, 1);
    assert!(lm.lock_table_string().contains("3/3"));
}

/// Two transactions lock two resources in opposite order. Exactly one
/// of them is picked as the victim, the other gets both locks after the
/// victim gives up.
#[test]
fn test_deadlock_detection() {
    test_utils::setup();

    let lm = new_lock_manager(|c| {
        c.with_deadlock_detection(DeadlockDetection::WaitsForGraph)
            .with_lock_timeout_ms(0)
    });
    let r1 = ResourceId::new(1, 1);
    let r2 = ResourceId::new(1, 2);
    let barrier = Arc::new(Barrier::new(2));

    let mut handles = Vec::new();
    for (txn_id, first, second) in [(1, r1, r2), (2, r2, r1)] {
        let lm = lm.clone();
        let barrier = barrier.clone();
        handles.push(thread::spawn(move || {
            let locker = Locker::txn(&lm, txn_id);
            locker.lock(first, LockType::Write, false).unwrap();
            barrier.wait();
            let result = locker.lock(second, LockType::Write, false);
            locker.release_all().unwrap();
            result
        }));
    }

    let results: Vec<_> = handles.into_iter().map(|h| h.join().unwrap()).collect();
    let n_deadlocks = results
        .iter()
        .filter(|r| matches!(r, Err(SmallError::Deadlock(_))))
        .count();
    let n_granted = results
        .iter()
        .filter(|r| matches!(r, Ok(LockGrantType::GrantedNew)))
        .count();
    assert_eq!(n_deadlocks, 1);
    assert_eq!(n_granted, 1);

    let stats = lm.stats();
    assert_eq!(stats.n_deadlocks, 1);
    assert_eq!(stats.n_total_locks, 0);
}

/// Without deadlock detection the same cycle ends with a timeout.
#[test]
fn test_deadlock_by_timeout() {
    test_utils::setup();

    let lm = new_lock_manager(|c| c.with_deadlock_detection(DeadlockDetection::Timeout));
    let r1 = ResourceId::new(1, 1);
    let r2 = ResourceId::new(1, 2);
    let barrier = Arc::new(Barrier::new(2));

    let mut handles = Vec::new();
    for (txn_id, first, second) in [(1, r1, r2), (2, r2, r1)] {
        let lm = lm.clone();
        let barrier = barrier.clone();
        handles.push(thread::spawn(move || {
            let locker = Locker::txn(&lm, txn_id);
            locker.lock(first, LockType::Write, false).unwrap();
            barrier.wait();
            let result = locker.lock(second, LockType::Write, false);
            locker.release_all().unwrap();
            result
        }));
    }

    let results: Vec<_> = handles.into_iter().map(|h| h.join().unwrap()).collect();
    assert!(results
        .iter()
        .any(|r| matches!(r, Err(SmallError::LockTimeout(_)))));
    assert_eq!(lm.stats().n_deadlocks, 0);
}

#[test]
fn test_transfer_and_demote() {
    test_utils::setup();

    let lm = new_lock_manager(|c| c);
    let r = ResourceId::new(4, 1);
    let from = Locker::non_txn(&lm);
    let to = Locker::non_txn(&lm);

    from.lock(r, LockType::Write, false).unwrap();
    assert_eq!(lm.transfer(r, from.id(), &to, false).unwrap(), LockType::Write);
    assert!(!lm.is_owner(r, from.id()));
    assert_eq!(lm.owned_lock_type(r, to.id()), Some(LockType::Write));

    // demoted on the way back
    assert_eq!(lm.transfer(r, to.id(), &from, true).unwrap(), LockType::Read);
    assert_eq!(lm.owned_lock_type(r, from.id()), Some(LockType::Read));

    // several destinations always share a READ lock
    let other = Locker::non_txn(&lm);
    lm.release(r, from.id());
    from.lock(r, LockType::Write, false).unwrap();
    assert_eq!(
        lm.transfer_multiple(r, from.id(), &[&to, &other], false).unwrap(),
        LockType::Read
    );
    assert_eq!(lm.n_owners(r), 2);
    assert_eq!(lm.owned_lock_type(r, other.id()), Some(LockType::Read));

    // transfer from a locker that owns nothing
    assert!(lm.transfer(r, from.id(), &to, false).is_err());
}

#[test]
fn test_demote_lets_readers_in() {
    test_utils::setup();

    let lm = new_lock_manager(|c| c);
    let r = ResourceId::new(4, 2);
    let writer = Locker::non_txn(&lm);
    let reader = Locker::non_txn(&lm);

    writer.lock(r, LockType::Write, false).unwrap();
    assert_eq!(reader.lock(r, LockType::Read, true).unwrap(), LockGrantType::Denied);

    lm.demote(r, writer.id());
    assert_eq!(lm.owned_lock_type(r, writer.id()), Some(LockType::Read));
    assert_eq!(reader.lock(r, LockType::Read, true).unwrap(), LockGrantType::GrantedNew);
}

#[test]
fn test_locking_disabled() {
    test_utils::setup();

    let lm = new_lock_manager(|c| c.with_locking(LockingMode::Disabled));
    let r = ResourceId::new(1, 1);
    let a = Locker::non_txn(&lm);
    let b = Locker::non_txn(&lm);

    assert_eq!(a.lock(r, LockType::Write, false).unwrap(), LockGrantType::GrantedNew);
    assert_eq!(b.lock(r, LockType::Write, false).unwrap(), LockGrantType::GrantedNew);
    assert_eq!(lm.stats().n_total_locks, 0);
}

/// Many threads fight over a few resources. A WRITE owner never shares
/// its resource with anybody.
#[test]
fn test_write_exclusivity_under_load() {
    use rand::prelude::*;

    test_utils::setup();

    let lm = new_lock_manager(|c| c.with_lock_timeout_ms(10_000));
    crossbeam::scope(|s| {
        for _ in 0..8 {
            let lm = &lm;
            s.spawn(move |_| {
                let mut rng = rand::thread_rng();
                let locker = Locker::non_txn(lm);
                for _ in 0..200 {
                    let r = ResourceId::new(1, rng.gen_range(0, 4));
                    let lock_type = if rng.gen_bool(0.3) {
                        LockType::Write
                    } else {
                        LockType::Read
                    };
                    locker.lock(r, lock_type, false).unwrap();
                    if lock_type == LockType::Write {
                        assert_eq!(lm.n_owners(r), 1);
                    }
                    locker.release_all().unwrap();
                }
            });
        }
    })
    .unwrap();

    assert_eq!(lm.stats().n_total_locks, 0);
}
