// Copyright 2026 U.S. Federal Government (in countries where recognized)
// SPDX-License-Identifier: Apache-2.0

//! Seam to the external delta-sigma ADC driver.
//!
//! The driver itself lives outside this crate; [`AdcDriver`] exposes the
//! one operation the core needs — a blocking convert-and-read per channel
//! pair — plus the index-based rate/gain/filter setters driven by the
//! command protocol. What the core owns is the settings model, the
//! throughput verifier, and the conversion statistics that feed the
//! health beacon.

use std::fmt;

/// The data-ready line did not assert within the driver's 10 ms window.
///
/// A timed-out channel contributes a zero sample; the miss is counted and
/// reported in the `STAT:` beacon.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct AdcTimeout;

impl fmt::Display for AdcTimeout {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "ADC conversion deadline missed")
    }
}

impl std::error::Error for AdcTimeout {}

/// Blocking driver interface for the three-channel delta-sigma ADC.
pub trait AdcDriver {
    /// Convert and read one channel pair (0-based channel index).
    ///
    /// Blocks on the data-ready line with the driver's internal timeout
    /// (nominally 10 ms).
    fn convert(&mut self, channel: u8) -> Result<i64, AdcTimeout>;

    /// Select the conversion rate by 1-based table index (1..=16).
    fn set_rate_index(&mut self, index: u8);

    /// Select the programmable gain by 1-based index (1..=6).
    fn set_gain_index(&mut self, index: u8);

    /// Select the digital filter by 1-based index (1..=5).
    fn set_filter_index(&mut self, index: u8);
}

/// Conversion rates selectable on the converter, samples per second,
/// indexed 1..=16 on the wire.
pub const RATE_TABLE_SPS: [u32; 16] = [
    2, 5, 10, 16, 20, 50, 60, 100, 400, 1_200, 2_400, 4_800, 7_200, 14_400, 19_200, 38_400,
];

/// Digital filter names, indexed 1..=5 on the wire.
pub const FILTER_NAMES: [&str; 5] = ["SINC1", "SINC2", "SINC3", "SINC4", "FIR"];

/// Number of selectable gain steps.
pub const GAIN_STEPS: u8 = 6;

/// Allowed dithering (oversample) multipliers.
pub const DITHERING_CHOICES: [u8; 4] = [0, 2, 3, 4];

/// Delay between dithering oversample rounds, microseconds.
pub const DITHER_DELAY_US: u32 = 50;

/// Converter configuration mirrored by the command protocol.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct AdcSettings {
    /// 1-based index into [`RATE_TABLE_SPS`].
    pub rate_index: u8,
    /// 1-based gain index (1..=6).
    pub gain_index: u8,
    /// 1-based index into [`FILTER_NAMES`].
    pub filter_index: u8,
    /// Oversample multiplier: 0 (off), 2, 3 or 4.
    pub dithering: u8,
    /// Active channel count (1..=3).
    pub channels: u8,
}

impl Default for AdcSettings {
    fn default() -> Self {
        // 19 200 sps, gain 1, SINC3, 4× oversampling, all three channels.
        AdcSettings {
            rate_index: 15,
            gain_index: 1,
            filter_index: 3,
            dithering: 4,
            channels: 3,
        }
    }
}

impl AdcSettings {
    /// Configured converter rate in samples per second.
    pub fn rate_sps(&self) -> u32 {
        RATE_TABLE_SPS[(self.rate_index as usize - 1).min(RATE_TABLE_SPS.len() - 1)]
    }

    /// Name of the configured digital filter.
    pub fn filter_name(&self) -> &'static str {
        FILTER_NAMES[(self.filter_index as usize - 1).min(FILTER_NAMES.len() - 1)]
    }

    /// Conversions needed per emitted sample.
    pub fn conversions_per_sample(&self) -> u32 {
        self.channels as u32 * self.dithering.max(1) as u32
    }
}

/// Result of a throughput check.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum ThroughputVerdict {
    /// The converter keeps up with the configured stream.
    Adequate,
    /// The converter cannot keep up; reported once until it recovers.
    Inadequate {
        /// Conversions per second the stream demands.
        required_sps: u32,
        /// Conversions per second the converter provides.
        available_sps: u32,
    },
}

/// One-shot verifier that the converter rate covers the stream demand.
///
/// Demand is `channels × max(1, dithering) × stream_rate × 2`; the factor
/// of two covers filter settling and input-mux overhead.
#[derive(Debug, Default)]
pub struct ThroughputMonitor {
    warning_sent: bool,
}

impl ThroughputMonitor {
    /// Create a monitor with the warning armed.
    pub fn new() -> Self {
        Self::default()
    }

    /// Check the configured rate against the stream demand.
    ///
    /// Returns `Inadequate` only on the first failing check; recovering to
    /// adequate re-arms the warning.
    pub fn verify(&mut self, settings: &AdcSettings, stream_rate_hz: f64) -> ThroughputVerdict {
        let required_sps =
            (settings.conversions_per_sample() as f64 * stream_rate_hz * 2.0) as u32;
        let available_sps = settings.rate_sps();
        if available_sps >= required_sps {
            self.warning_sent = false;
            return ThroughputVerdict::Adequate;
        }
        if self.warning_sent {
            return ThroughputVerdict::Adequate;
        }
        self.warning_sent = true;
        ThroughputVerdict::Inadequate {
            required_sps,
            available_sps,
        }
    }
}

/// Running conversion statistics for the beacon and status queries.
#[derive(Clone, Copy, Debug, Default)]
pub struct ConversionStats {
    /// Total conversions attempted.
    pub total: u64,
    /// Conversions whose data-ready deadline was missed.
    pub deadline_misses: u64,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_settings() {
        let s = AdcSettings::default();
        assert_eq!(s.rate_sps(), 19_200);
        assert_eq!(s.filter_name(), "SINC3");
        assert_eq!(s.conversions_per_sample(), 12);
    }

    #[test]
    fn test_rate_table_lookup() {
        let mut s = AdcSettings::default();
        s.rate_index = 1;
        assert_eq!(s.rate_sps(), 2);
        s.rate_index = 16;
        assert_eq!(s.rate_sps(), 38_400);
    }

    #[test]
    fn test_dithering_off_counts_one_round() {
        let mut s = AdcSettings::default();
        s.dithering = 0;
        s.channels = 2;
        assert_eq!(s.conversions_per_sample(), 2);
    }

    #[test]
    fn test_throughput_adequate() {
        let mut m = ThroughputMonitor::new();
        let s = AdcSettings::default();
        // 3 ch × 4× × 100 Hz × 2 = 2400 sps, well under 19200.
        assert_eq!(m.verify(&s, 100.0), ThroughputVerdict::Adequate);
    }

    #[test]
    fn test_throughput_inadequate_reports_once() {
        let mut m = ThroughputMonitor::new();
        let mut s = AdcSettings::default();
        s.rate_index = 8; // 100 sps
        let v = m.verify(&s, 100.0);
        assert_eq!(
            v,
            ThroughputVerdict::Inadequate {
                required_sps: 2_400,
                available_sps: 100
            }
        );
        // Second check stays quiet.
        assert_eq!(m.verify(&s, 100.0), ThroughputVerdict::Adequate);
    }

    #[test]
    fn test_throughput_warning_rearms_after_recovery() {
        let mut m = ThroughputMonitor::new();
        let mut s = AdcSettings::default();
        s.rate_index = 8;
        assert!(matches!(m.verify(&s, 100.0), ThroughputVerdict::Inadequate { .. }));
        s.rate_index = 15;
        assert_eq!(m.verify(&s, 100.0), ThroughputVerdict::Adequate);
        s.rate_index = 8;
        assert!(matches!(m.verify(&s, 100.0), ThroughputVerdict::Inadequate { .. }));
    }

    #[test]
    fn test_adc_timeout_display() {
        assert_eq!(AdcTimeout.to_string(), "ADC conversion deadline missed");
    }
}
