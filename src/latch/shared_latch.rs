use std::{
    collections::VecDeque,
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc,
    },
    thread::{self, ThreadId},
    time::{Duration, Instant},
};

use crossbeam::sync::{Parker, Unparker};
use parking_lot::Mutex;

use super::{Latch, LatchCounters, LatchError, LatchStats, LatchTable};

struct Waiter {
    thread: ThreadId,
    unparker: Unparker,

    // set by the releasing thread when ownership is handed over
    granted: Arc<AtomicBool>,
}

#[derive(Default)]
struct LatchState {
    owner: Option<ThreadId>,
    waiters: VecDeque<Waiter>,
}

/// A FIFO latch. Release hands ownership straight to the head waiter,
/// so only one thread is woken up and no thread can barge in front of
/// the queue.
pub struct SharedLatch {
    name: String,
    state: Mutex<LatchState>,
    timeout: Option<Duration>,
    table: Option<Arc<LatchTable>>,
    counters: LatchCounters,
}

impl SharedLatch {
    pub fn new(name: &str, timeout: Option<Duration>, table: Option<Arc<LatchTable>>) -> Self {
        Self {
            name: name.to_string(),
            state: Mutex::new(LatchState::default()),
            timeout,
            table,
            counters: LatchCounters::default(),
        }
    }

    fn note(&self) {
        if let Some(table) = &self.table {
            table.note_latch(&self.name);
        }
    }

    fn unnote(&self) {
        if let Some(table) = &self.table {
            table.unnote_latch(&self.name);
        }
    }

    fn hand_off(&self, state: &mut LatchState) {
        match state.waiters.pop_front() {
            Some(waiter) => {
                state.owner = Some(waiter.thread);
                waiter.granted.store(true, Ordering::Release);
                waiter.unparker.unpark();
            }
            None => {
                state.owner = None;
            }
        }
    }
}

impl Latch for SharedLatch {
    fn name(&self) -> &str {
        &self.name
    }

    fn acquire(&self) -> Result<(), LatchError> {
        let me = thread::current().id();

        let parker = Parker::new();
        let granted = Arc::new(AtomicBool::new(false));
        {
            let mut state = self.state.lock();
            if state.owner == Some(me) {
                self.counters.self_owned();
                return Err(LatchError::SelfHeld(self.name.clone()));
            }

            if state.owner.is_none() {
                state.owner = Some(me);
                self.counters.no_waiters();
                self.note();
                return Ok(());
            }

            self.counters.contention();
            state.waiters.push_back(Waiter {
                thread: me,
                unparker: parker.unparker().clone(),
                granted: granted.clone(),
            });
        }

        let deadline = self.timeout.map(|t| Instant::now() + t);
        loop {
            if granted.load(Ordering::Acquire) {
                self.note();
                return Ok(());
            }

            match deadline {
                None => parker.park(),
                Some(deadline) => {
                    let now = Instant::now();
                    if now < deadline {
                        parker.park_timeout(deadline - now);
                        continue;
                    }

                    let mut state = self.state.lock();
                    // the hand-off may have raced with the timeout
                    if granted.load(Ordering::Acquire) {
                        self.note();
                        return Ok(());
                    }
                    state.waiters.retain(|w| !Arc::ptr_eq(&w.granted, &granted));
                    self.counters.timeout();
                    return Err(LatchError::Timeout {
                        name: self.name.clone(),
                        timeout: self.timeout.unwrap_or_default(),
                    });
                }
            }
        }
    }

    fn acquire_no_wait(&self) -> Result<bool, LatchError> {
        let me = thread::current().id();
        let mut state = self.state.lock();
        if state.owner == Some(me) {
            self.counters.self_owned();
            return Err(LatchError::SelfHeld(self.name.clone()));
        }

        if state.owner.is_none() {
            state.owner = Some(me);
            self.counters.no_wait(true);
            self.note();
            return Ok(true);
        }

        self.counters.no_wait(false);
        Ok(false)
    }

    fn release(&self) -> Result<(), LatchError> {
        let me = thread::current().id();
        let mut state = self.state.lock();
        if state.owner != Some(me) {
            return Err(LatchError::NotHeld(self.name.clone()));
        }

        self.counters.release();
        self.unnote();
        self.hand_off(&mut state);
        Ok(())
    }

    fn release_if_owner(&self) -> bool {
        let me = thread::current().id();
        let mut state = self.state.lock();
        if state.owner != Some(me) {
            return false;
        }

        self.counters.release();
        self.unnote();
        self.hand_off(&mut state);
        true
    }

    fn is_owner(&self) -> bool {
        self.state.lock().owner == Some(thread::current().id())
    }

    fn is_held(&self) -> bool {
        self.state.lock().owner.is_some()
    }

    fn n_waiters(&self) -> usize {
        self.state.lock().waiters.len()
    }

    fn stats(&self) -> LatchStats {
        self.counters.snapshot()
    }
}
