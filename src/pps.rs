// Copyright 2026 U.S. Federal Government (in countries where recognized)
// SPDX-License-Identifier: Apache-2.0

//! ISR → foreground handoff for PPS edge captures.
//!
//! The rising-edge interrupt handler records the raw microsecond and
//! millisecond counters and sets a pending flag; it does no other work.
//! The foreground drains the latch once per main-loop iteration with a
//! claim-and-clear read: the pending flag is cleared *before* the counters
//! are read, so a second edge arriving mid-claim is never lost — it simply
//! re-arms the latch for the next iteration.
//!
//! At most one unconsumed event exists at a time; an edge arriving before
//! the previous one is claimed overwrites it (latest wins).

use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};

/// One captured PPS edge.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct PpsEvent {
    /// Raw 32-bit microsecond counter at the edge.
    pub raw_micros: u32,
    /// Raw 32-bit millisecond counter at the edge.
    pub millis: u32,
}

/// Single-event latch shared between the PPS ISR and the foreground.
///
/// This is the only state shared across the interrupt boundary. The ISR is
/// the sole writer of the captured counters; the release store of `pending`
/// publishes them, and the acquire swap in [`claim`](PpsLatch::claim)
/// orders the reads after it.
#[derive(Debug, Default)]
pub struct PpsLatch {
    pending: AtomicBool,
    captured_micros: AtomicU32,
    captured_ms: AtomicU32,
}

impl PpsLatch {
    /// Create an empty latch.
    pub const fn new() -> Self {
        PpsLatch {
            pending: AtomicBool::new(false),
            captured_micros: AtomicU32::new(0),
            captured_ms: AtomicU32::new(0),
        }
    }

    /// Record a rising edge. Called from the ISR.
    pub fn capture(&self, raw_micros: u32, millis: u32) {
        self.captured_micros.store(raw_micros, Ordering::Relaxed);
        self.captured_ms.store(millis, Ordering::Relaxed);
        self.pending.store(true, Ordering::Release);
    }

    /// Claim the pending edge, if any. Called from the foreground.
    ///
    /// Clears the pending flag before reading the captured counters.
    pub fn claim(&self) -> Option<PpsEvent> {
        if self.pending.swap(false, Ordering::Acquire) {
            Some(PpsEvent {
                raw_micros: self.captured_micros.load(Ordering::Relaxed),
                millis: self.captured_ms.load(Ordering::Relaxed),
            })
        } else {
            None
        }
    }

    /// Whether an edge is waiting to be claimed.
    pub fn is_pending(&self) -> bool {
        self.pending.load(Ordering::Acquire)
    }
}
