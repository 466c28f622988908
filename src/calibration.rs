// Copyright 2026 U.S. Federal Government (in countries where recognized)
// SPDX-License-Identifier: Apache-2.0

//! Oscillator calibration against the 1 Hz PPS reference.
//!
//! Each accepted PPS edge yields a direct measurement of the local
//! oscillator's frequency error: the virtual-microsecond interval between
//! successive edges versus the nominal 1 000 000 µs. The calibrator keeps
//! a smoothed parts-per-million correction:
//!
//! - the first 10 edges install the negated measurement directly
//!   (bootstrap),
//! - later edges blend 10 % of the new measurement into the running value,
//! - the result is always clamped to ±200 ppm and persisted.
//!
//! Edges with an implausible millisecond interval (outside 900–1100 ms) or
//! an implausible error (≥ 1000 ppm) are rejected.
//!
//! A slow temperature-coefficient learner runs after 100 edges, every 50th
//! edge, when the die temperature has moved more than 1 °C from the
//! reference; while the node is coasting on a stale calibration the learned
//! coefficient is applied as an open-loop correction. Platforms without a
//! temperature sensor keep the learner dormant.

use byteorder::{ByteOrder, LittleEndian};

/// Hard limit on the ppm correction, both measured and stored.
pub const PPM_LIMIT: f64 = 200.0;

/// Single-edge error above which the measurement is discarded.
pub const MAX_EDGE_ERROR_PPM: f64 = 1_000.0;

/// Number of edges that install the measurement directly.
pub const BOOTSTRAP_EDGES: u32 = 10;

/// Weight of the previous value in the exponential smoothing.
const SMOOTHING_OLD: f64 = 0.9;

/// Plausible PPS interval window, millisecond counter.
pub const PPS_INTERVAL_MIN_MS: u32 = 900;
/// Upper bound of the plausible PPS interval window.
pub const PPS_INTERVAL_MAX_MS: u32 = 1_100;

/// Edges before the temperature learner may run.
const TEMP_LEARN_MIN_EDGES: u32 = 100;
/// Learner cadence in edges.
const TEMP_LEARN_STRIDE: u32 = 50;
/// Minimum temperature excursion worth learning from, °C.
const TEMP_LEARN_MIN_DELTA_C: f64 = 1.0;

/// Cadence of the periodic calibration debug report, in edges.
const REPORT_STRIDE: u32 = 10;

/// Byte length of the persisted calibration image.
pub const IMAGE_LEN: usize = 8;

/// Magic word marking a valid calibration image.
pub const IMAGE_MAGIC: u32 = 0x1234_5678;

/// Encode a calibration image: 4-byte magic followed by the f32 ppm,
/// little-endian.
pub fn encode_image(ppm: f32, buf: &mut [u8; IMAGE_LEN]) {
    LittleEndian::write_u32(&mut buf[0..4], IMAGE_MAGIC);
    LittleEndian::write_f32(&mut buf[4..8], ppm);
}

/// Decode a calibration image. Returns `None` if the magic word does not
/// match; range validation is the caller's concern.
pub fn decode_image(buf: &[u8; IMAGE_LEN]) -> Option<f32> {
    if LittleEndian::read_u32(&buf[0..4]) != IMAGE_MAGIC {
        return None;
    }
    Some(LittleEndian::read_f32(&buf[4..8]))
}

/// Outcome of feeding one PPS edge to the calibrator.
#[derive(Clone, Copy, Debug, PartialEq)]
pub enum PpsVerdict {
    /// First edge of a tenure: baseline recorded, nothing measured.
    Baseline,
    /// Interval between edges outside the plausible window; edge ignored
    /// and the baseline left untouched.
    BadInterval {
        /// Measured millisecond interval.
        interval_ms: u32,
    },
    /// Frequency error implausibly large; measurement discarded but the
    /// baseline re-established on this edge.
    BadError {
        /// Measured error in ppm.
        error_ppm: f64,
    },
    /// Measurement accepted and folded into the correction.
    Accepted {
        /// Measured error in ppm (pre-negation).
        error_ppm: f64,
        /// Measured inter-edge interval in virtual microseconds.
        interval_us: u64,
        /// Pre-clamp value when the ±200 ppm clamp engaged.
        clamped_from: Option<f64>,
        /// The smoothed value should be persisted.
        persist: bool,
        /// Periodic debug report is due.
        report: bool,
        /// Newly learned temperature coefficient, ppm/°C.
        learned_coefficient: Option<f64>,
    },
}

/// Open-loop temperature compensation model.
#[derive(Clone, Copy, Debug)]
pub struct TemperatureModel {
    /// Learned coefficient in ppm per °C.
    pub coefficient_ppm_per_c: f64,
    /// Reference temperature the coefficient was learned against, °C.
    pub reference_c: f64,
    /// Whether compensation is applied.
    pub enabled: bool,
}

/// Smoothed oscillator-frequency correction, disciplined by PPS.
#[derive(Debug)]
pub struct Calibrator {
    ppm: f64,
    valid: bool,
    base_virtual_micros: u64,
    edges: u32,
    temperature: TemperatureModel,
}

impl Calibrator {
    /// Create an uncalibrated instance.
    pub fn new() -> Self {
        Calibrator {
            ppm: 0.0,
            valid: false,
            base_virtual_micros: 0,
            edges: 0,
            temperature: TemperatureModel {
                coefficient_ppm_per_c: 0.0,
                reference_c: 25.0,
                enabled: false,
            },
        }
    }

    /// Install a value loaded from the calibration store.
    ///
    /// Accepted only within ±200 ppm; returns whether it was installed.
    pub fn install_stored(&mut self, ppm: f32) -> bool {
        if !(ppm as f64).is_finite() || (ppm as f64).abs() > PPM_LIMIT {
            return false;
        }
        self.ppm = ppm as f64;
        self.valid = true;
        true
    }

    /// Install a manual override (`SET_CAL_PPM`). Returns the pre-clamp
    /// value if the clamp engaged.
    pub fn set_manual(&mut self, ppm: f64) -> Option<f64> {
        self.ppm = if ppm.is_finite() { ppm } else { 0.0 };
        self.valid = true;
        self.clamp()
    }

    /// Feed one PPS edge.
    ///
    /// `pps_virtual` is the edge capture converted to virtual microseconds,
    /// `now_ms` the millisecond counter at processing time, `prior_pps_ms`
    /// the previous edge's millisecond stamp when PPS was already valid,
    /// and `temperature_c` the current die temperature if the platform has
    /// a sensor.
    pub fn observe_edge(
        &mut self,
        pps_virtual: u64,
        now_ms: u32,
        prior_pps_ms: Option<u32>,
        temperature_c: Option<f64>,
    ) -> PpsVerdict {
        self.edges = self.edges.wrapping_add(1);

        if let Some(prior) = prior_pps_ms {
            let interval_ms = now_ms.wrapping_sub(prior);
            if !(PPS_INTERVAL_MIN_MS..=PPS_INTERVAL_MAX_MS).contains(&interval_ms) {
                return PpsVerdict::BadInterval { interval_ms };
            }
        }

        let verdict = if self.edges > 1 && self.valid {
            let interval_us = pps_virtual.saturating_sub(self.base_virtual_micros);
            let error_ppm = (interval_us as f64 - 1_000_000.0) / 1_000_000.0 * 1e6;

            if error_ppm.abs() >= MAX_EDGE_ERROR_PPM {
                PpsVerdict::BadError { error_ppm }
            } else {
                let bootstrap = self.edges < BOOTSTRAP_EDGES;
                if bootstrap {
                    self.ppm = -error_ppm;
                } else {
                    self.ppm = SMOOTHING_OLD * self.ppm + (1.0 - SMOOTHING_OLD) * (-error_ppm);
                }
                let clamped_from = self.clamp();

                let learned_coefficient = if !bootstrap {
                    self.maybe_learn_coefficient(temperature_c)
                } else {
                    None
                };

                PpsVerdict::Accepted {
                    error_ppm,
                    interval_us,
                    clamped_from,
                    persist: !bootstrap,
                    report: self.edges % REPORT_STRIDE == 0,
                    learned_coefficient,
                }
            }
        } else {
            PpsVerdict::Baseline
        };

        // Re-baseline on this edge (skipped only for BadInterval above).
        self.valid = true;
        self.base_virtual_micros = pps_virtual;
        verdict
    }

    /// Learn the temperature coefficient from the current ppm excursion.
    ///
    /// Computes `ppm / Δtemp` with the ppm taken relative to zero rather
    /// than to the value at the reference temperature, tracking absolute
    /// correction rather than temperature-induced change. Exposed through
    /// [`temperature_model`](Self::temperature_model) so the sign
    /// convention stays pinned by tests.
    fn maybe_learn_coefficient(&mut self, temperature_c: Option<f64>) -> Option<f64> {
        if self.edges <= TEMP_LEARN_MIN_EDGES || self.edges % TEMP_LEARN_STRIDE != 0 {
            return None;
        }
        let current = temperature_c?;
        let delta = current - self.temperature.reference_c;
        if delta.abs() <= TEMP_LEARN_MIN_DELTA_C {
            return None;
        }
        self.temperature.coefficient_ppm_per_c = self.ppm / delta;
        self.temperature.enabled = true;
        Some(self.temperature.coefficient_ppm_per_c)
    }

    /// Apply open-loop temperature compensation.
    ///
    /// Only active while coasting on a stale calibration (`in_cal_state`)
    /// and once a coefficient has been learned. Returns the applied ppm
    /// correction.
    pub fn apply_temperature(&mut self, current_c: f64, in_cal_state: bool) -> Option<f64> {
        if !self.temperature.enabled || !in_cal_state {
            return None;
        }
        let correction = (current_c - self.temperature.reference_c)
            * self.temperature.coefficient_ppm_per_c;
        self.ppm += correction;
        self.clamp();
        Some(correction)
    }

    /// Project a virtual-microsecond reading through the correction:
    /// `base + elapsed × (1 + ppm/10⁶)`.
    pub fn calibrated_timestamp(&self, virtual_micros: u64) -> u64 {
        if !self.valid {
            return virtual_micros;
        }
        let elapsed = virtual_micros.saturating_sub(self.base_virtual_micros);
        let corrected = elapsed as f64 * (1.0 + self.ppm / 1e6);
        self.base_virtual_micros + corrected as u64
    }

    /// Invalidate the calibration (clock reset recovery).
    pub fn invalidate(&mut self) {
        self.valid = false;
    }

    fn clamp(&mut self) -> Option<f64> {
        if self.ppm.abs() > PPM_LIMIT {
            let before = self.ppm;
            self.ppm = self.ppm.clamp(-PPM_LIMIT, PPM_LIMIT);
            Some(before)
        } else {
            None
        }
    }

    /// Current correction in ppm.
    pub fn ppm(&self) -> f64 {
        self.ppm
    }

    /// Whether a usable calibration exists.
    pub fn valid(&self) -> bool {
        self.valid
    }

    /// Edges fed so far.
    pub fn edges(&self) -> u32 {
        self.edges
    }

    /// The temperature model (test hook for the coefficient convention).
    pub fn temperature_model(&self) -> &TemperatureModel {
        &self.temperature
    }
}

impl Default for Calibrator {
    fn default() -> Self {
        Self::new()
    }
}
