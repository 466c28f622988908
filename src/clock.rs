// Copyright 2026 U.S. Federal Government (in countries where recognized)
// SPDX-License-Identifier: Apache-2.0

//! Monotonic 64-bit virtual time over a wrapping 32-bit counter.
//!
//! The platform's microsecond counter wraps every ~71.6 minutes and may
//! restart from zero on a hardware reset. [`VirtualClock`] folds both into
//! a single non-decreasing 64-bit microsecond value:
//!
//! - A regular wraparound (old reading near the top of the range, new
//!   reading near the bottom) adds 2³² to a running offset.
//! - A substantial backward step that is *not* a wraparound is classified
//!   as a hardware clock reset. The offset is re-based at the pre-reset
//!   virtual reading so virtual time continues without going backward; the
//!   absolute timestamp jumps by the raw counter's new starting value,
//!   which is the documented discontinuity of the 30-second recovery
//!   window.
//!
//! The backward-step thresholds are load-bearing and preserved exactly:
//! wraparound requires the old reading above 4 × 10⁹ µs and the new below
//! 3 × 10⁸ µs; a reset requires a backward microsecond jump above 10⁶ µs,
//! a backward millisecond jump above 1000 ms, or both counters reading
//! below 5 s when the previous readings were above 10 s.

use log::debug;

/// Backward microsecond jump beyond which a non-wraparound step is a reset.
const RESET_BACKWARD_US: u32 = 1_000_000;

/// Backward millisecond jump beyond which the step is a reset.
const RESET_BACKWARD_MS: u32 = 1_000;

/// Old-reading floor for the regular wraparound window.
const WRAP_OLD_FLOOR_US: u32 = 4_000_000_000;

/// New-reading ceiling for the regular wraparound window.
const WRAP_NEW_CEIL_US: u32 = 300_000_000;

/// Backward jump in [`VirtualClock::now`] treated as a late-detected
/// wraparound rather than a reset.
const LATE_WRAP_US: u32 = 1_000_000_000;

/// Both-counters-small reset signature: readings below these...
const BOOT_SIGNATURE_US: u32 = 5_000_000;
const BOOT_SIGNATURE_MS: u32 = 5_000;
/// ...when the previous readings were above these.
const BOOT_PRIOR_US: u32 = 10_000_000;
const BOOT_PRIOR_MS: u32 = 10_000;

/// Duration of the post-reset recovery window in milliseconds.
pub const RESET_RECOVERY_MS: u32 = 30_000;

/// What a foreground clock observation classified the counter motion as.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum ClockEvent {
    /// Counters advanced normally.
    Advanced,
    /// The 32-bit microsecond counter completed a regular wraparound.
    Wraparound,
    /// A hardware clock reset was detected and handled.
    Reset(ResetCause),
}

/// Why a backward counter step was classified as a reset.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum ResetCause {
    /// The microsecond counter stepped backward by more than 1 s.
    MicrosBackward {
        /// Size of the backward jump in microseconds.
        jump_us: u32,
    },
    /// The millisecond counter stepped backward by more than 1 s.
    MillisBackward {
        /// Size of the backward jump in milliseconds.
        jump_ms: u32,
    },
    /// Both counters read near zero after previously reading well past boot.
    BootSignature,
}

/// Monotonic virtual microsecond clock.
#[derive(Debug)]
pub struct VirtualClock {
    /// Accumulated wraparound/reset offset added to the raw counter.
    offset: u64,
    last_raw: u32,
    last_ms: u32,
    /// Highest virtual reading returned so far; [`now`](Self::now) never
    /// returns less than this.
    last_virtual: u64,
    wraparounds: u32,
    resets: u32,
    reset_detected: bool,
    reset_time_ms: u32,
}

impl VirtualClock {
    /// Create a clock from the current raw counter readings.
    pub fn new(raw_micros: u32, millis: u32) -> Self {
        VirtualClock {
            offset: 0,
            last_raw: raw_micros,
            last_ms: millis,
            last_virtual: raw_micros as u64,
            wraparounds: 0,
            resets: 0,
            reset_detected: false,
            reset_time_ms: 0,
        }
    }

    /// Classify one foreground observation of the counter pair.
    ///
    /// Must be called once per main-loop iteration, before any use of
    /// [`now`](Self::now) in that iteration, so wraparounds and resets are
    /// folded into the offset before timestamps are taken.
    pub fn observe(&mut self, raw_micros: u32, millis: u32) -> ClockEvent {
        if raw_micros < self.last_raw {
            // Regular 32-bit wraparound, expected every ~71.6 minutes.
            if self.last_raw > WRAP_OLD_FLOOR_US && raw_micros < WRAP_NEW_CEIL_US {
                self.wraparounds += 1;
                self.offset += 1u64 << 32;
                self.last_raw = raw_micros;
                self.last_ms = millis;
                debug!("micros wraparound #{} folded into virtual offset", self.wraparounds);
                return ClockEvent::Wraparound;
            }
            let jump_us = self.last_raw - raw_micros;
            if jump_us > RESET_BACKWARD_US {
                return self.declare_reset(
                    raw_micros,
                    millis,
                    ResetCause::MicrosBackward { jump_us },
                );
            }
        }

        if millis < self.last_ms {
            let jump_ms = self.last_ms - millis;
            if jump_ms > RESET_BACKWARD_MS {
                return self.declare_reset(
                    raw_micros,
                    millis,
                    ResetCause::MillisBackward { jump_ms },
                );
            }
        }

        if raw_micros < BOOT_SIGNATURE_US
            && millis < BOOT_SIGNATURE_MS
            && (self.last_raw > BOOT_PRIOR_US || self.last_ms > BOOT_PRIOR_MS)
        {
            return self.declare_reset(raw_micros, millis, ResetCause::BootSignature);
        }

        self.last_raw = raw_micros;
        self.last_ms = millis;
        ClockEvent::Advanced
    }

    /// Current virtual microseconds for a fresh raw counter reading.
    ///
    /// Never decreases: a backward raw step larger than 10⁹ µs is absorbed
    /// as a late-detected wraparound; any smaller backward motion (a reset
    /// not yet classified by [`observe`](Self::observe)) holds the previous
    /// reading until the reset is handled.
    pub fn now(&mut self, raw_micros: u32) -> u64 {
        if raw_micros < self.last_raw && self.last_raw - raw_micros > LATE_WRAP_US {
            self.wraparounds += 1;
            self.offset += 1u64 << 32;
            self.last_raw = raw_micros;
            debug!("late micros wraparound absorbed (#{})", self.wraparounds);
        }
        let v = self.offset + raw_micros as u64;
        if v > self.last_virtual {
            self.last_virtual = v;
        }
        self.last_virtual
    }

    /// Convert an already-captured raw reading (e.g. a PPS capture from the
    /// current iteration) into the virtual domain without advancing the
    /// monotonic floor.
    pub fn to_virtual(&self, raw_micros: u32) -> u64 {
        self.offset + raw_micros as u64
    }

    fn declare_reset(&mut self, raw_micros: u32, millis: u32, cause: ResetCause) -> ClockEvent {
        // Continue virtual time from the pre-reset reading; the raw
        // counter's new starting value becomes a forward jump.
        let pre_reset_virtual = self.offset + self.last_raw as u64;
        self.offset = pre_reset_virtual;
        self.last_raw = raw_micros;
        self.last_ms = millis;
        self.resets += 1;
        self.reset_detected = true;
        self.reset_time_ms = millis;
        debug!("clock reset #{} ({:?}), virtual offset re-based", self.resets, cause);
        ClockEvent::Reset(cause)
    }

    /// Whether a reset was detected within the last 30 s.
    pub fn recent_reset(&self, now_ms: u32) -> bool {
        self.reset_detected && now_ms.wrapping_sub(self.reset_time_ms) < RESET_RECOVERY_MS
    }

    /// Clear the reset flag once the recovery window has elapsed.
    ///
    /// Returns `true` exactly once per reset, when the window ends.
    pub fn clear_expired_reset(&mut self, now_ms: u32) -> bool {
        if self.reset_detected && now_ms.wrapping_sub(self.reset_time_ms) >= RESET_RECOVERY_MS {
            self.reset_detected = false;
            return true;
        }
        false
    }

    /// Whether the reset flag is currently raised.
    pub fn reset_detected(&self) -> bool {
        self.reset_detected
    }

    /// Millisecond counter value at the last detected reset.
    pub fn reset_time_ms(&self) -> u32 {
        self.reset_time_ms
    }

    /// Total regular wraparounds folded into the offset.
    pub fn wraparounds(&self) -> u32 {
        self.wraparounds
    }

    /// Total hardware resets detected.
    pub fn resets(&self) -> u32 {
        self.resets
    }

    /// The accumulated virtual-time offset (testing/status).
    pub fn offset(&self) -> u64 {
        self.offset
    }
}
