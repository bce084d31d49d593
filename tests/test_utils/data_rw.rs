use rand::prelude::*;
use small_je::{Database, Environment};

pub fn value_of(key: u64) -> Vec<u8> {
    format!("value-{}", key).into_bytes()
}

/// Insert the keys without a transaction, each with `value_of(key)`.
pub fn insert_keys(db: &Database, keys: &[u64]) {
    for key in keys {
        db.put(None, *key, &value_of(*key)).unwrap();
    }
}

/// Insert the keys in one committed transaction.
pub fn insert_committed(env: &Environment, db: &Database, keys: &[u64]) {
    let txn = env.begin_transaction().unwrap();
    for key in keys {
        db.put(Some(&txn), *key, &value_of(*key)).unwrap();
    }
    env.commit(&txn).unwrap();
}

/// `0..count` in random order.
pub fn shuffled_keys(count: u64) -> Vec<u64> {
    let mut keys: Vec<u64> = (0..count).collect();
    keys.shuffle(&mut rand::thread_rng());
    keys
}

/// Every live record of the database, read without a transaction.
pub fn snapshot(db: &Database) -> Vec<(u64, Vec<u8>)> {
    db.entries(None).unwrap()
}
