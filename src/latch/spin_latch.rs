use std::{
    sync::{
        atomic::{AtomicU64, AtomicUsize, Ordering},
        Arc,
    },
    thread,
    time::{Duration, Instant},
};

use super::{Latch, LatchCounters, LatchError, LatchStats, LatchTable};

const SPINS_BEFORE_YIELD: usize = 64;

static NEXT_THREAD_TOKEN: AtomicU64 = AtomicU64::new(1);

thread_local! {
    static THREAD_TOKEN: u64 = NEXT_THREAD_TOKEN.fetch_add(1, Ordering::Relaxed);
}

fn current_token() -> u64 {
    THREAD_TOKEN.with(|t| *t)
}

/// Spin-then-yield latch for very short critical sections.
///
/// Unlike `SharedLatch` it makes no FIFO promise.
pub struct SpinLatch {
    name: String,

    // token of the owner thread, 0 when free
    owner: AtomicU64,
    n_spinning: AtomicUsize,
    timeout: Option<Duration>,
    table: Option<Arc<LatchTable>>,
    counters: LatchCounters,
}

impl SpinLatch {
    pub fn new(name: &str, timeout: Option<Duration>, table: Option<Arc<LatchTable>>) -> Self {
        Self {
            name: name.to_string(),
            owner: AtomicU64::new(0),
            n_spinning: AtomicUsize::new(0),
            timeout,
            table,
            counters: LatchCounters::default(),
        }
    }

    fn try_take(&self, me: u64) -> bool {
        self.owner
            .compare_exchange(0, me, Ordering::Acquire, Ordering::Relaxed)
            .is_ok()
    }

    fn granted(&self) {
        if let Some(table) = &self.table {
            table.note_latch(&self.name);
        }
    }

    fn do_release(&self) {
        self.counters.release();
        if let Some(table) = &self.table {
            table.unnote_latch(&self.name);
        }
        self.owner.store(0, Ordering::Release);
    }
}

impl Latch for SpinLatch {
    fn name(&self) -> &str {
        &self.name
    }

    fn acquire(&self) -> Result<(), LatchError> {
        let me = current_token();
        if self.owner.load(Ordering::Relaxed) == me {
            self.counters.self_owned();
            return Err(LatchError::SelfHeld(self.name.clone()));
        }

        if self.try_take(me) {
            self.counters.no_waiters();
            self.granted();
            return Ok(());
        }

        self.counters.contention();
        self.n_spinning.fetch_add(1, Ordering::Relaxed);
        let deadline = self.timeout.map(|t| Instant::now() + t);
        let mut spins = 0;
        loop {
            if self.owner.load(Ordering::Relaxed) == 0 && self.try_take(me) {
                self.n_spinning.fetch_sub(1, Ordering::Relaxed);
                self.granted();
                return Ok(());
            }

            spins += 1;
            if spins < SPINS_BEFORE_YIELD {
                std::hint::spin_loop();
                continue;
            }

            if let Some(deadline) = deadline {
                if Instant::now() >= deadline {
                    self.n_spinning.fetch_sub(1, Ordering::Relaxed);
                    self.counters.timeout();
                    return Err(LatchError::Timeout {
                        name: self.name.clone(),
                        timeout: self.timeout.unwrap_or_default(),
                    });
                }
            }
            thread::yield_now();
        }
    }

    fn acquire_no_wait(&self) -> Result<bool, LatchError> {
        let me = current_token();
        if self.owner.load(Ordering::Relaxed) == me {
            self.counters.self_owned();
            return Err(LatchError::SelfHeld(self.name.clone()));
        }

        let ok = self.try_take(me);
        self.counters.no_wait(ok);
        if ok {
            self.granted();
        }
        Ok(ok)
    }

    fn release(&self) -> Result<(), LatchError> {
        if self.owner.load(Ordering::Relaxed) != current_token() {
            return Err(LatchError::NotHeld(self.name.clone()));
        }
        self.do_release();
        Ok(())
    }

    fn release_if_owner(&self) -> bool {
        if self.owner.load(Ordering::Relaxed) != current_token() {
            return false;
        }
        self.do_release();
        true
    }

    fn is_owner(&self) -> bool {
        self.owner.load(Ordering::Relaxed) == current_token()
    }

    fn is_held(&self) -> bool {
        self.owner.load(Ordering::Relaxed) != 0
    }

    fn n_waiters(&self) -> usize {
        self.n_spinning.load(Ordering::Relaxed)
    }

    fn stats(&self) -> LatchStats {
        self.counters.snapshot()
    }
}
