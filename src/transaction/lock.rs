use std::{collections::VecDeque, fmt};

use crate::types::DbId;

pub type LockerId = u64;

/// The logical thing a lock protects: a record key inside a database.
///
/// Database-level resources (e.g. the naming tree entry of a database)
/// use `key == 0` in the reserved database `0`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct ResourceId {
    pub db_id: DbId,
    pub key: u64,
}

impl ResourceId {
    pub fn new(db_id: DbId, key: u64) -> Self {
        Self { db_id, key }
    }

    pub(crate) fn shard(&self, n: usize) -> usize {
        (self.db_id.wrapping_mul(0x9E37_79B9_7F4A_7C15) ^ self.key) as usize % n
    }
}

impl From<u64> for ResourceId {
    fn from(key: u64) -> Self {
        Self { db_id: 0, key }
    }
}

impl fmt::Display for ResourceId {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{}/{}", self.db_id, self.key)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum LockType {
    Read,
    Write,
    RangeRead,
    RangeWrite,
    RangeInsert,
}

impl LockType {
    pub fn is_write(&self) -> bool {
        matches!(self, LockType::Write | LockType::RangeWrite)
    }

    fn is_range(&self) -> bool {
        matches!(self, LockType::RangeRead | LockType::RangeWrite)
    }

    /// Whether a request of type `self` conflicts with an owner of type
    /// `held` that belongs to an unrelated locker.
    pub fn conflicts_with(&self, held: LockType) -> bool {
        use LockType::*;
        match (self, held) {
            (RangeInsert, RangeRead) | (RangeInsert, RangeWrite) => true,
            (RangeInsert, _) | (_, RangeInsert) => false,
            (Read, Read) | (Read, RangeRead) => false,
            (RangeRead, Read) | (RangeRead, RangeRead) => false,
            _ => true,
        }
    }

    /// Whether holding `self` already grants a request for `requested`.
    pub fn covers(&self, requested: LockType) -> bool {
        use LockType::*;
        match (self, requested) {
            (a, b) if *a == b => true,
            (Write, Read) => true,
            (RangeRead, Read) => true,
            (RangeWrite, Read) | (RangeWrite, Write) | (RangeWrite, RangeRead) => true,
            _ => false,
        }
    }

    /// The type a locker ends up holding when it owns `self` and asks for
    /// `requested`.
    pub fn upgrade(&self, requested: LockType) -> LockType {
        if self.covers(requested) {
            return *self;
        }
        if requested.covers(*self) {
            return requested;
        }
        if *self == LockType::RangeInsert || requested == LockType::RangeInsert {
            return LockType::RangeWrite;
        }

        let write = self.is_write() || requested.is_write();
        let range = self.is_range() || requested.is_range();
        match (write, range) {
            (true, true) => LockType::RangeWrite,
            (true, false) => LockType::Write,
            (false, true) => LockType::RangeRead,
            (false, false) => LockType::Read,
        }
    }

    pub fn demoted(&self) -> LockType {
        match self {
            LockType::Write => LockType::Read,
            LockType::RangeWrite => LockType::RangeRead,
            other => *other,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LockGrantType {
    Denied,
    GrantedNew,
    GrantedExisting,
    GrantedUpgrade,
}

impl LockGrantType {
    pub fn is_granted(&self) -> bool {
        *self != LockGrantType::Denied
    }
}

/// An owner or a waiter of a lock.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct LockInfo {
    pub(crate) locker: LockerId,
    pub(crate) buddy: Option<LockerId>,
    pub(crate) lock_type: LockType,
}

impl LockInfo {
    /// Lockers that share locks never conflict with each other.
    pub(crate) fn shares_with(&self, other: &LockInfo) -> bool {
        self.locker == other.locker
            || self.buddy == Some(other.locker)
            || other.buddy == Some(self.locker)
    }
}

/// Owners and the FIFO wait queue of one resource.
#[derive(Debug, Default)]
pub(crate) struct Lock {
    pub(crate) owners: Vec<LockInfo>,
    pub(crate) waiters: VecDeque<LockInfo>,
}

impl Lock {
    pub(crate) fn owner(&self, locker: LockerId) -> Option<&LockInfo> {
        self.owners.iter().find(|o| o.locker == locker)
    }

    pub(crate) fn owner_mut(&mut self, locker: LockerId) -> Option<&mut LockInfo> {
        self.owners.iter_mut().find(|o| o.locker == locker)
    }

    pub(crate) fn is_waiter(&self, locker: LockerId) -> bool {
        self.waiters.iter().any(|w| w.locker == locker)
    }

    /// Owners standing in the way of `request`.
    pub(crate) fn conflicting_owners(&self, request: &LockInfo) -> Vec<LockerId> {
        self.owners
            .iter()
            .filter(|o| !o.shares_with(request) && request.lock_type.conflicts_with(o.lock_type))
            .map(|o| o.locker)
            .collect()
    }

    /// Everyone `request` waits for: conflicting owners, plus
    /// conflicting waiters queued in front of it.
    pub(crate) fn blockers(&self, request: &LockInfo) -> Vec<LockerId> {
        let mut blockers = self.conflicting_owners(request);
        for w in self.waiters.iter() {
            if w.locker == request.locker {
                break;
            }
            if !w.shares_with(request)
                && (request.lock_type.conflicts_with(w.lock_type)
                    || w.lock_type.conflicts_with(request.lock_type))
            {
                blockers.push(w.locker);
            }
        }
        blockers
    }

    pub(crate) fn conflicts(&self, request: &LockInfo) -> bool {
        self.owners
            .iter()
            .any(|o| !o.shares_with(request) && request.lock_type.conflicts_with(o.lock_type))
    }

    /// Whether `request` has been granted, i.e. its locker owns a lock
    /// covering the requested type.
    pub(crate) fn is_granted(&self, request: &LockInfo) -> bool {
        match self.owner(request.locker) {
            Some(o) => o.lock_type.covers(request.lock_type),
            None => false,
        }
    }

    /// Grant waiters in queue order, stopping at the first one that
    /// still conflicts. Returns the number of waiters granted.
    pub(crate) fn promote_waiters(&mut self) -> usize {
        let mut granted = 0;
        while let Some(waiter) = self.waiters.front().copied() {
            if self.conflicts(&waiter) {
                break;
            }
            self.waiters.pop_front();
            match self.owner_mut(waiter.locker) {
                Some(o) => o.lock_type = o.lock_type.upgrade(waiter.lock_type),
                None => self.owners.push(waiter),
            }
            granted += 1;
        }
        granted
    }

    pub(crate) fn is_empty(&self) -> bool {
        self.owners.is_empty() && self.waiters.is_empty()
    }
}
