use std::{
    ops::{Deref, DerefMut},
    sync::Arc,
};

use parking_lot::{lock_api::ArcMutexGuard, Mutex, RawMutex};

use super::Latch;

/// A latch together with the data it protects.
///
/// The inner mutex is never contended: it is only taken by the latch
/// owner, it exists to hand out `&mut T` safely.
pub struct Latched<T> {
    latch: Box<dyn Latch>,
    data: Arc<Mutex<T>>,
}

impl<T> Latched<T> {
    pub fn new(latch: Box<dyn Latch>, data: T) -> Self {
        Self {
            latch,
            data: Arc::new(Mutex::new(data)),
        }
    }

    /// Acquire the latch, blocking until it's granted.
    ///
    /// # Panics
    ///
    /// On a reentrant acquire, and when the latch watchdog fires. The
    /// watchdog timeout is a debugging aid, not a way to give up a wait:
    /// both mean the caller's latch order is broken.
    pub fn latch(self: &Arc<Self>) -> LatchGuard<T> {
        if let Err(e) = self.latch.acquire() {
            panic!("{}", e);
        }
        LatchGuard {
            owner: self.clone(),
            data: self.data.lock_arc(),
        }
    }

    pub fn try_latch(self: &Arc<Self>) -> Option<LatchGuard<T>> {
        match self.latch.acquire_no_wait() {
            Ok(true) => Some(LatchGuard {
                owner: self.clone(),
                data: self.data.lock_arc(),
            }),
            Ok(false) => None,
            Err(e) => panic!("{}", e),
        }
    }

    pub fn raw_latch(&self) -> &dyn Latch {
        self.latch.as_ref()
    }
}

/// Owned guard of a `Latched<T>`, releases the latch on drop.
///
/// Owning the `Arc` lets a caller hold a parent and a child guard at the
/// same time and drop the parent first (latch coupling).
pub struct LatchGuard<T> {
    owner: Arc<Latched<T>>,
    data: ArcMutexGuard<RawMutex, T>,
}

impl<T> LatchGuard<T> {
    pub fn latched(&self) -> &Arc<Latched<T>> {
        &self.owner
    }
}

impl<T> Deref for LatchGuard<T> {
    type Target = T;

    fn deref(&self) -> &T {
        &self.data
    }
}

impl<T> DerefMut for LatchGuard<T> {
    fn deref_mut(&mut self) -> &mut T {
        &mut self.data
    }
}

impl<T> Drop for LatchGuard<T> {
    fn drop(&mut self) {
        self.owner.latch.release_if_owner();
    }
}
