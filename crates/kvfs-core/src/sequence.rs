// Copyright 2025 Schelling Point Labs Inc
// SPDX-License-Identifier: AGPL-3.0-only

//! Monotonic identifier allocator

use std::sync::atomic::{AtomicU64, Ordering};

/// Process-wide, strictly increasing counter handing out node identifiers.
///
/// The counter itself is not durable; the filesystem persists [`Sequence::current`]
/// as a high-water mark and restores it with [`Sequence::advance_to`] on startup.
#[derive(Debug, Default)]
pub struct Sequence {
    current: AtomicU64,
}

impl Sequence {
    /// The first call to [`Sequence::next`] returns 1.
    pub fn new() -> Self {
        Self {
            current: AtomicU64::new(0),
        }
    }

    pub fn next(&self) -> u64 {
        self.current.fetch_add(1, Ordering::SeqCst) + 1
    }

    /// Last value handed out, or the restored high-water mark
    pub fn current(&self) -> u64 {
        self.current.load(Ordering::SeqCst)
    }

    /// Guarantee that every later `next()` is greater than `value`. Never lowers the counter.
    pub fn advance_to(&self, value: u64) {
        self.current.fetch_max(value, Ordering::SeqCst);
    }
}
