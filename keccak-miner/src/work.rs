//! Nonce-space allocation.
//!
//! A single [`WorkAllocator`] is shared by every worker in the process. Each
//! worker asks for a range sized to one batch of its backend, so contention
//! is one lock acquisition per batch rather than per nonce.
//!
//! # Overflow
//!
//! The counter never wraps. A request that would run past `u64::MAX` is
//! truncated to end there, the counter saturates, and later requests get
//! empty ranges until the next [`WorkAllocator::reset`]. No nonce is ever
//! handed out twice within a challenge.
//!
//! # Reset
//!
//! The orchestrator resets the counter just before it publishes a new
//! challenge. A worker that acquires a range in the gap between the two
//! still hashes it against the old message, so those low nonces go unsearched
//! for the new challenge. That costs at most one batch per device and never
//! yields a wrong submission: the candidates carry the old snapshot and the
//! pipeline discards them as stale.

use std::ops::Range;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Mutex;

use crate::tracing::prelude::*;

/// Errors from the work allocator.
#[derive(Debug, thiserror::Error)]
pub enum WorkError {
    #[error("Work counter lock poisoned")]
    Poisoned,
}

/// A half-open range of nonces owned by one worker.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct NonceRange {
    pub start: u64,
    pub len: u64,
}

impl NonceRange {
    /// Exclusive end of the range.
    pub fn end(&self) -> u64 {
        self.start + self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    pub fn iter(&self) -> Range<u64> {
        self.start..self.end()
    }
}

/// Process-wide dispenser of disjoint nonce ranges.
#[derive(Debug, Default)]
pub struct WorkAllocator {
    counter: Mutex<u64>,
    exhausted_logged: AtomicBool,
}

impl WorkAllocator {
    pub fn new() -> Self {
        Self::default()
    }

    /// Return the next `size` nonces and advance the counter past them.
    pub fn acquire_range(&self, size: u64) -> Result<NonceRange, WorkError> {
        let mut counter = self.counter.lock().map_err(|_| WorkError::Poisoned)?;
        let start = *counter;

        let end = match start.checked_add(size) {
            Some(end) => end,
            None => {
                if !self.exhausted_logged.swap(true, Ordering::Relaxed) {
                    warn!(start, requested = size, "Nonce space exhausted for this challenge");
                }
                u64::MAX
            }
        };

        *counter = end;
        Ok(NonceRange {
            start,
            len: end - start,
        })
    }

    /// Zero the counter, returning the value it held.
    ///
    /// Only meaningful between challenges: in-flight ranges from the previous
    /// challenge are hashed against the old message and discarded as stale.
    /// See the module docs for the reset-to-publish gap.
    pub fn reset(&self) -> Result<u64, WorkError> {
        let mut counter = self.counter.lock().map_err(|_| WorkError::Poisoned)?;
        let previous = *counter;
        *counter = 0;
        self.exhausted_logged.store(false, Ordering::Relaxed);
        Ok(previous)
    }

    /// Current counter value.
    pub fn peek(&self) -> Result<u64, WorkError> {
        self.counter
            .lock()
            .map(|counter| *counter)
            .map_err(|_| WorkError::Poisoned)
    }
}
