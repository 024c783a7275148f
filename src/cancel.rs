//! Cooperative termination of long-running loops.
//!
//! A `CancelToken` wraps a shared monotonic counter. `term_long()` bumps
//! it; a long loop takes a `snapshot()` before it starts and calls
//! `check()` at the top of every iteration. When the counter has moved
//! since the snapshot the loop bails out with `Error::Terminated`.
//! Nothing is preempted: a loop that never checks never stops.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use crate::error::{Error, Result};

/// Shared handle to a term-long counter. Clones observe the same counter.
#[derive(Debug, Clone, Default)]
pub struct CancelToken {
    counter: Arc<AtomicU64>,
}

impl CancelToken {
    pub fn new() -> Self {
        Self::default()
    }

    /// Fires the termination pulse for every loop currently running.
    pub fn term_long(&self) {
        self.counter.fetch_add(1, Ordering::SeqCst);
    }

    /// Current counter value.
    pub fn generation(&self) -> u64 {
        self.counter.load(Ordering::SeqCst)
    }

    /// Captures the counter for one long operation.
    pub fn snapshot(&self) -> CancelSnapshot {
        CancelSnapshot {
            counter: Arc::clone(&self.counter),
            start: self.generation(),
        }
    }
}

/// Counter value captured at the start of a long operation.
#[derive(Debug, Clone)]
pub struct CancelSnapshot {
    counter: Arc<AtomicU64>,
    start: u64,
}

impl CancelSnapshot {
    /// True once `term_long()` has been called since the snapshot.
    #[inline]
    pub fn is_terminated(&self) -> bool {
        self.counter.load(Ordering::Relaxed) != self.start
    }

    /// `Err(Error::Terminated)` once the counter has moved.
    #[inline]
    pub fn check(&self) -> Result<()> {
        if self.is_terminated() {
            Err(Error::Terminated)
        } else {
            Ok(())
        }
    }
}
