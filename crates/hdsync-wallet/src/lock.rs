//! Non-reentrant lock with a visible waiter count.
//!
//! Batch flushing is driven by contention: a round flushes early when
//! someone is queued behind one of its locks. A plain mutex cannot report
//! that, so this wraps one in a counter.

use std::sync::{Condvar, Mutex};

#[derive(Default)]
struct LockState {
    held: bool,
    waiting: usize,
}

pub struct BatchLock {
    state: Mutex<LockState>,
    cond: Condvar,
}

impl BatchLock {
    pub fn new() -> Self {
        BatchLock { state: Mutex::new(LockState::default()), cond: Condvar::new() }
    }

    /// Acquires without blocking. Returns whether the lock was taken.
    pub fn try_acquire(&self) -> bool {
        let mut state = self.state.lock().expect("batch lock");
        if state.held {
            false
        } else {
            state.held = true;
            true
        }
    }

    /// Blocks until the lock is acquired, counting as a waiter meanwhile.
    pub fn acquire(&self) {
        let mut state = self.state.lock().expect("batch lock");
        if !state.held {
            state.held = true;
            return;
        }
        state.waiting += 1;
        while state.held {
            state = self.cond.wait(state).expect("batch lock");
        }
        state.waiting -= 1;
        state.held = true;
    }

    pub fn release(&self) {
        let mut state = self.state.lock().expect("batch lock");
        debug_assert!(state.held, "release of unheld lock");
        state.held = false;
        drop(state);
        self.cond.notify_one();
    }

    /// Number of threads currently blocked in `acquire`.
    pub fn waiting(&self) -> usize {
        self.state.lock().expect("batch lock").waiting
    }
}

impl Default for BatchLock {
    fn default() -> Self {
        Self::new()
    }
}
