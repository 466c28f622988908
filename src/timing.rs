// Copyright 2026 U.S. Federal Government (in countries where recognized)
// SPDX-License-Identifier: Apache-2.0

//! Four-state timing-quality model.
//!
//! Timing quality is classified from three inputs — PPS freshness,
//! calibration validity and reset recency — into one of four sources, each
//! with an accuracy estimate:
//!
//! | Condition (in order)                             | Source        | Accuracy          |
//! |--------------------------------------------------|---------------|-------------------|
//! | PPS valid, age < 1.5 s, no recent reset          | `PpsActive`   | 1 µs              |
//! | PPS valid, age < 60 s, no recent reset           | `PpsHoldover` | 1 + 0.1·age_s µs  |
//! | calibration valid, age < 300 s, no recent reset  | `InternalCal` | 10 + 0.3·age_s µs |
//! | otherwise                                        | `InternalRaw` | 1000 µs (2000 after reset) |
//!
//! [`classify`] is a pure function so the degradation ladder is testable
//! without any clock plumbing; [`TimingTracker`] wraps it with the PPS
//! bookkeeping and reports source transitions to the caller, which owns the
//! one-shot `WARNING:` lines.

/// PPS age below which the source is fully locked.
pub const ACTIVE_MAX_AGE_MS: u32 = 1_500;

/// PPS age below which holdover prediction is still trusted.
pub const HOLDOVER_MAX_AGE_MS: u32 = 60_000;

/// PPS age below which a valid calibration is still applied.
pub const CAL_MAX_AGE_MS: u32 = 300_000;

/// The active timing source, in degradation order.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Ord, PartialOrd)]
#[repr(u8)]
pub enum TimingSource {
    /// GPS PPS locked (±1 µs).
    PpsActive = 0,
    /// Recent PPS, running on the frozen calibration (holdover).
    PpsHoldover = 1,
    /// Internal oscillator with stale PPS calibration.
    InternalCal = 2,
    /// Raw internal oscillator (emergency).
    InternalRaw = 3,
}

impl TimingSource {
    /// Wire name used in `SESSION:`/`STAT:` lines.
    pub fn name(self) -> &'static str {
        match self {
            TimingSource::PpsActive => "PPS_ACTIVE",
            TimingSource::PpsHoldover => "PPS_HOLDOVER",
            TimingSource::InternalCal => "INTERNAL_CAL",
            TimingSource::InternalRaw => "INTERNAL_RAW",
        }
    }

    /// Numeric code used in full-format data lines.
    pub fn code(self) -> u8 {
        self as u8
    }
}

/// Inputs to the source classifier.
#[derive(Clone, Copy, Debug)]
pub struct SourceInputs {
    /// A PPS edge has been accepted and has not timed out of holdover.
    pub pps_valid: bool,
    /// Milliseconds since the last accepted PPS edge.
    pub pps_age_ms: u32,
    /// The oscillator calibration is usable.
    pub calibration_valid: bool,
    /// A hardware clock reset occurred within the last 30 s.
    pub recent_reset: bool,
}

/// Classify timing quality. Pure function of its inputs.
///
/// Returns the source and the accuracy estimate in microseconds.
pub fn classify(inputs: &SourceInputs) -> (TimingSource, f64) {
    let age_s = inputs.pps_age_ms as f64 / 1_000.0;
    if inputs.pps_valid && inputs.pps_age_ms < ACTIVE_MAX_AGE_MS && !inputs.recent_reset {
        (TimingSource::PpsActive, 1.0)
    } else if inputs.pps_valid && inputs.pps_age_ms < HOLDOVER_MAX_AGE_MS && !inputs.recent_reset {
        // ppm stays frozen in holdover; only the uncertainty grows.
        (TimingSource::PpsHoldover, 1.0 + age_s * 0.1)
    } else if inputs.calibration_valid
        && inputs.pps_age_ms < CAL_MAX_AGE_MS
        && !inputs.recent_reset
    {
        (TimingSource::InternalCal, 10.0 + age_s * 0.3)
    } else if inputs.recent_reset {
        (TimingSource::InternalRaw, 2_000.0)
    } else {
        (TimingSource::InternalRaw, 1_000.0)
    }
}

/// A source change reported by [`TimingTracker::update`].
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct SourceTransition {
    /// Source before the update.
    pub from: TimingSource,
    /// Source after the update.
    pub to: TimingSource,
}

impl SourceTransition {
    /// Whether this transition degrades timing quality.
    pub fn is_degradation(&self) -> bool {
        self.to > self.from
    }
}

/// Stateful wrapper around [`classify`] with PPS bookkeeping.
#[derive(Debug)]
pub struct TimingTracker {
    source: TimingSource,
    accuracy_us: f64,
    pps_valid: bool,
    pps_count: u32,
    last_pps_ms: u32,
}

impl TimingTracker {
    /// Start in the raw-internal state with no PPS history.
    pub fn new() -> Self {
        TimingTracker {
            source: TimingSource::InternalRaw,
            accuracy_us: 1_000.0,
            pps_valid: false,
            pps_count: 0,
            last_pps_ms: 0,
        }
    }

    /// Count a claimed PPS edge (valid or not).
    pub fn count_edge(&mut self) {
        self.pps_count = self.pps_count.wrapping_add(1);
    }

    /// Record an accepted PPS edge: marks PPS valid and fresh.
    pub fn note_pps(&mut self, now_ms: u32) {
        self.pps_valid = true;
        self.last_pps_ms = now_ms;
    }

    /// Refresh the last-PPS time without asserting validity (used when an
    /// edge is consumed by a PPS-locked stream start).
    pub fn touch_pps_time(&mut self, now_ms: u32) {
        self.last_pps_ms = now_ms;
    }

    /// End the PPS tenure. A hardware clock reset makes the stored edge
    /// stamp meaningless in the new counter epoch, so freshness cannot be
    /// claimed until an edge arrives after the reset.
    pub fn invalidate_pps(&mut self) {
        self.pps_valid = false;
    }

    /// Re-classify the source. Returns the transition, if any.
    pub fn update(
        &mut self,
        now_ms: u32,
        calibration_valid: bool,
        recent_reset: bool,
    ) -> Option<SourceTransition> {
        let inputs = SourceInputs {
            pps_valid: self.pps_valid,
            pps_age_ms: self.pps_age_ms(now_ms),
            calibration_valid,
            recent_reset,
        };
        let (source, accuracy_us) = classify(&inputs);
        self.accuracy_us = accuracy_us;

        if source == self.source {
            return None;
        }
        let transition = SourceTransition {
            from: self.source,
            to: source,
        };
        self.source = source;
        // Falling all the way to raw ends the current PPS tenure; the next
        // edge counts as a reacquisition.
        if source == TimingSource::InternalRaw && !recent_reset {
            self.pps_valid = false;
        }
        Some(transition)
    }

    /// Milliseconds since the last recorded PPS edge.
    pub fn pps_age_ms(&self, now_ms: u32) -> u32 {
        now_ms.wrapping_sub(self.last_pps_ms)
    }

    /// Current timing source.
    pub fn source(&self) -> TimingSource {
        self.source
    }

    /// Current accuracy estimate in microseconds.
    pub fn accuracy_us(&self) -> f64 {
        self.accuracy_us
    }

    /// Whether PPS is currently considered valid.
    pub fn pps_valid(&self) -> bool {
        self.pps_valid
    }

    /// Total PPS edges seen.
    pub fn pps_count(&self) -> u32 {
        self.pps_count
    }

    /// Millisecond counter value at the last PPS edge.
    pub fn last_pps_ms(&self) -> u32 {
        self.last_pps_ms
    }
}

impl Default for TimingTracker {
    fn default() -> Self {
        Self::new()
    }
}
