//! Least-connections backend selection
//!
//! The selector keeps one active-session counter per backend and hands out
//! the least loaded index. Every read and write of the counter table goes
//! through one mutex, so an increment made by `acquire` is visible to the
//! next `acquire` before it picks.

use std::sync::{Arc, Mutex, MutexGuard};

/// Per-backend active connection counters
#[derive(Debug)]
pub struct ConnectionSelector {
    counts: Mutex<Vec<usize>>,
}

impl ConnectionSelector {
    /// Create a selector for `backends` backends, all counters at zero.
    ///
    /// `backends` must match the registry length; the registry guarantees
    /// it is non-zero.
    pub fn new(backends: usize) -> Self {
        assert!(backends > 0, "selector needs at least one backend");

        Self {
            counts: Mutex::new(vec![0; backends]),
        }
    }

    /// Pick the backend with the fewest active sessions and count one more.
    ///
    /// Ties go to the lowest index.
    pub fn acquire(&self) -> usize {
        let mut counts = self.lock();

        // min_by_key keeps the first minimum, which is the lowest index
        let index = counts
            .iter()
            .enumerate()
            .min_by_key(|(_, count)| **count)
            .map(|(i, _)| i)
            .unwrap_or(0);

        counts[index] += 1;

        tracing::trace!(index, counts = ?*counts, "Acquired backend slot");
        index
    }

    /// Return a slot taken by `acquire`. Clamped at zero.
    pub fn release(&self, index: usize) {
        let mut counts = self.lock();

        match counts.get_mut(index) {
            Some(0) => {
                tracing::warn!(index, "Release on idle backend ignored");
            }
            Some(count) => *count -= 1,
            None => {
                tracing::warn!(index, "Release for unknown backend index ignored");
            }
        }
    }

    /// Acquire a slot wrapped in a handle that releases it exactly once.
    pub fn acquire_slot(self: &Arc<Self>) -> BackendSlot {
        let index = self.acquire();

        BackendSlot {
            selector: Arc::clone(self),
            index,
            released: false,
        }
    }

    /// Copy of the counter table.
    pub fn snapshot(&self) -> Vec<usize> {
        self.lock().clone()
    }

    /// Sum of all counters.
    pub fn active(&self) -> usize {
        self.lock().iter().sum()
    }

    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.lock().is_empty()
    }

    fn lock(&self) -> MutexGuard<'_, Vec<usize>> {
        // The table stays consistent under poisoning: every critical section
        // is a single increment or decrement.
        self.counts.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

/// An acquired backend slot.
///
/// Calls `release` on the selector exactly once: explicitly through
/// [`BackendSlot::release`], or on drop if the owning task ends early.
#[derive(Debug)]
pub struct BackendSlot {
    selector: Arc<ConnectionSelector>,
    index: usize,
    released: bool,
}

impl BackendSlot {
    pub fn index(&self) -> usize {
        self.index
    }

    /// Give the slot back.
    pub fn release(mut self) {
        self.release_once();
    }

    fn release_once(&mut self) {
        if !self.released {
            self.released = true;
            self.selector.release(self.index);
        }
    }
}

impl Drop for BackendSlot {
    fn drop(&mut self) {
        self.release_once();
    }
}
