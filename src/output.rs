// Copyright 2026 U.S. Federal Government (in countries where recognized)
// SPDX-License-Identifier: Apache-2.0

//! Line-oriented output pipeline.
//!
//! Everything the node says goes through here — data records, command
//! responses, meta-lines — over a single reused line buffer, so emitted
//! lines never interleave and the steady-state path performs no
//! allocation.
//!
//! Data records come in two shapes:
//!
//! - full: `seq,timestamp,timing_source,accuracy_us,v1,v2,v3` (~40 bytes)
//! - compact: `seq,timestamp,v1,v2,v3` (~25 bytes)
//!
//! The pipeline owns three watchdogs:
//!
//! - a back-pressure monitor that drops whole samples when the transmit
//!   buffer runs low and reports them through throttled `OFLOW:`
//!   meta-lines (a dropped sample is never a truncated line);
//! - a sequence validator that classifies mismatches as gap vs reset and
//!   realigns;
//! - a 1 Hz `STAT:` health beacon and the per-stream `SESSION:` header.

use std::fmt::{self, Write as _};
use std::io;

use crate::adc::AdcSettings;
use crate::hal::TxSink;
use crate::timing::TimingSource;

/// Default transmit-buffer free-space threshold for back-pressure, bytes.
pub const DEFAULT_TX_FREE_THRESHOLD: usize = 20;

/// Free space at which the one-shot near-overflow warning re-arms, bytes.
pub const TX_FREE_RECOVERY: usize = 50;

/// Default interval between `OFLOW:` reports, milliseconds.
pub const DEFAULT_OFLOW_REPORT_INTERVAL_MS: u32 = 1_000;

/// Default health-beacon interval, milliseconds.
pub const DEFAULT_STAT_INTERVAL_MS: u32 = 1_000;

/// Backward sequence distance treated as a counterparty reset rather than
/// a gap (forward wrap distance above this classifies as reset).
const SEQ_RESET_WINDOW: u32 = 1_000;

/// Data-record shape on the wire.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum OutputFormat {
    /// `seq,timestamp,timing_source,accuracy_us,v1,v2,v3`
    Full,
    /// `seq,timestamp,v1,v2,v3`
    Compact,
}

impl OutputFormat {
    /// Wire name of the format.
    pub fn name(self) -> &'static str {
        match self {
            OutputFormat::Full => "FULL",
            OutputFormat::Compact => "COMPACT",
        }
    }

    /// Approximate bytes per data line, for the status query.
    pub fn bytes_per_sample(self) -> usize {
        match self {
            OutputFormat::Full => 40,
            OutputFormat::Compact => 25,
        }
    }
}

/// Verdict of the per-emission sequence check.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum SeqVerdict {
    /// Sequence matched expectation.
    InSync,
    /// Forward jump; `size` samples unaccounted for.
    Gap {
        /// Expected sequence number.
        expected: u16,
        /// Observed sequence number.
        got: u16,
        /// Number of missing samples.
        size: u16,
    },
    /// Large backward jump; the counter restarted.
    Reset {
        /// Expected sequence number.
        expected: u16,
        /// Observed sequence number.
        got: u16,
    },
}

/// Tracks the expected sequence number and classifies mismatches.
#[derive(Debug)]
pub struct SequenceValidator {
    expected: u16,
    enabled: bool,
    gaps: u32,
    resets: u32,
}

impl SequenceValidator {
    /// New validator, enabled, expecting sequence 0.
    pub fn new() -> Self {
        SequenceValidator {
            expected: 0,
            enabled: true,
            gaps: 0,
            resets: 0,
        }
    }

    /// Validate one emission and realign on mismatch.
    pub fn validate(&mut self, seq: u16) -> SeqVerdict {
        if !self.enabled {
            return SeqVerdict::InSync;
        }
        if self.expected == 0 && seq == 0 {
            self.expected = 1;
            return SeqVerdict::InSync;
        }
        if seq == self.expected {
            self.expected = self.expected.wrapping_add(1);
            return SeqVerdict::InSync;
        }

        let expected = self.expected;
        // Forward distance from expectation; for a numerically backward
        // sequence this is the wrap distance.
        let gap_size = (seq as u32).wrapping_sub(expected as u32) & 0xFFFF;
        self.expected = seq.wrapping_add(1);

        if seq < expected && gap_size > SEQ_RESET_WINDOW {
            self.resets += 1;
            SeqVerdict::Reset { expected, got: seq }
        } else {
            self.gaps += 1;
            SeqVerdict::Gap {
                expected,
                got: seq,
                size: gap_size as u16,
            }
        }
    }

    /// Enable or disable validation.
    pub fn set_enabled(&mut self, enabled: bool) {
        self.enabled = enabled;
    }

    /// Whether validation is enabled.
    pub fn enabled(&self) -> bool {
        self.enabled
    }

    /// Expected next sequence number.
    pub fn expected(&self) -> u16 {
        self.expected
    }

    /// Gaps detected so far.
    pub fn gaps(&self) -> u32 {
        self.gaps
    }

    /// Resets detected so far.
    pub fn resets(&self) -> u32 {
        self.resets
    }
}

impl Default for SequenceValidator {
    fn default() -> Self {
        Self::new()
    }
}

/// Outcome of a blocked admission check.
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq)]
struct Blocked {
    first_warning: bool,
    report: bool,
}

/// Back-pressure accounting: overflow events, skipped samples and the
/// throttle on `OFLOW:` reporting.
#[derive(Debug)]
pub struct BackPressureMonitor {
    threshold: usize,
    report_interval_ms: u32,
    overflows: u32,
    skipped: u32,
    warning_sent: bool,
    last_oflow_ms: u32,
    oflow_lines: u32,
}

impl BackPressureMonitor {
    /// New monitor with the given free-space threshold and report
    /// interval.
    pub fn new(threshold: usize, report_interval_ms: u32) -> Self {
        BackPressureMonitor {
            threshold,
            report_interval_ms,
            overflows: 0,
            skipped: 0,
            warning_sent: false,
            last_oflow_ms: 0,
            oflow_lines: 0,
        }
    }

    fn note_healthy(&mut self, tx_free: usize) {
        if tx_free > TX_FREE_RECOVERY {
            self.warning_sent = false;
        }
    }

    fn note_blocked(&mut self, now_ms: u32) -> Blocked {
        self.overflows += 1;
        self.skipped += 1;
        let mut out = Blocked::default();
        if !self.warning_sent {
            self.warning_sent = true;
            out.first_warning = true;
        }
        if now_ms.wrapping_sub(self.last_oflow_ms) >= self.report_interval_ms {
            self.last_oflow_ms = now_ms;
            self.oflow_lines += 1;
            out.report = true;
        }
        out
    }

    /// Samples dropped under back-pressure.
    pub fn skipped(&self) -> u32 {
        self.skipped
    }

    /// Below-threshold events counted.
    pub fn overflows(&self) -> u32 {
        self.overflows
    }

    /// `OFLOW:` lines emitted.
    pub fn oflow_lines(&self) -> u32 {
        self.oflow_lines
    }
}

/// Everything the health beacon needs from outside the pipeline.
#[derive(Clone, Copy, Debug)]
pub struct StatSnapshot {
    /// Current timing source.
    pub source: TimingSource,
    /// Accuracy estimate, µs.
    pub accuracy_us: f64,
    /// Oscillator correction, ppm.
    pub ppm: f64,
    /// PPS currently valid.
    pub pps_valid: bool,
    /// Milliseconds since the last PPS edge.
    pub pps_age_ms: u32,
    /// Microsecond-counter wraparounds folded so far.
    pub wraparounds: u32,
    /// ADC conversion deadline misses.
    pub adc_deadline_misses: u64,
}

/// The output pipeline: one sink, one line buffer, all the counters.
#[derive(Debug)]
pub struct OutputPipeline<S> {
    sink: S,
    format: OutputFormat,
    validator: SequenceValidator,
    backpressure: BackPressureMonitor,
    sequence: u16,
    samples_generated: u64,
    boot_id: u32,
    stream_id: u32,
    header_sent: bool,
    stat_interval_ms: u32,
    last_stat_ms: u32,
    line: String,
}

impl<S: TxSink> OutputPipeline<S> {
    /// Create a pipeline over `sink`.
    ///
    /// `boot_id` is the millisecond counter at node initialization and
    /// tags every `SESSION:`/`STAT:` line of this boot cycle.
    pub fn new(
        sink: S,
        boot_id: u32,
        tx_free_threshold: usize,
        oflow_report_interval_ms: u32,
        stat_interval_ms: u32,
    ) -> Self {
        OutputPipeline {
            sink,
            format: OutputFormat::Full,
            validator: SequenceValidator::new(),
            backpressure: BackPressureMonitor::new(tx_free_threshold, oflow_report_interval_ms),
            sequence: 0,
            samples_generated: 0,
            boot_id,
            stream_id: 0,
            header_sent: false,
            stat_interval_ms,
            last_stat_ms: 0,
            line: String::with_capacity(128),
        }
    }

    /// Write one `\n`-terminated line composed from `args`.
    pub fn emit(&mut self, args: fmt::Arguments<'_>) -> io::Result<()> {
        self.line.clear();
        // Writing into a String cannot fail.
        let _ = self.line.write_fmt(args);
        self.line.push('\n');
        self.sink.write(self.line.as_bytes())
    }

    fn prefixed(&mut self, prefix: &str, args: fmt::Arguments<'_>) -> io::Result<()> {
        self.line.clear();
        self.line.push_str(prefix);
        let _ = self.line.write_fmt(args);
        self.line.push('\n');
        self.sink.write(self.line.as_bytes())
    }

    /// `OK:`-prefixed response line.
    pub fn ok(&mut self, args: fmt::Arguments<'_>) -> io::Result<()> {
        self.prefixed("OK:", args)
    }

    /// `ERROR:`-prefixed response line.
    pub fn error(&mut self, args: fmt::Arguments<'_>) -> io::Result<()> {
        self.prefixed("ERROR:", args)
    }

    /// `WARNING:`-prefixed line.
    pub fn warning(&mut self, args: fmt::Arguments<'_>) -> io::Result<()> {
        self.prefixed("WARNING:", args)
    }

    /// `DEBUG:`-prefixed line.
    pub fn debug(&mut self, args: fmt::Arguments<'_>) -> io::Result<()> {
        self.prefixed("DEBUG:", args)
    }

    /// Admission check for one sample emission.
    ///
    /// Returns `false` when the transmit buffer is too full: the sample is
    /// dropped, counted, and reported via at most one `OFLOW:` line per
    /// report interval (plus a one-shot near-overflow warning).
    pub fn admit(&mut self, now_ms: u32) -> io::Result<bool> {
        let free = self.sink.tx_free();
        if free >= self.backpressure.threshold {
            self.backpressure.note_healthy(free);
            return Ok(true);
        }
        let blocked = self.backpressure.note_blocked(now_ms);
        if blocked.first_warning {
            self.warning(format_args!(
                "Serial tx buffer near overflow - available: {free} bytes"
            ))?;
        }
        if blocked.report {
            let skipped = self.backpressure.skipped;
            let overflows = self.backpressure.overflows;
            self.emit(format_args!("OFLOW:{skipped},{overflows},{free}"))?;
        }
        Ok(false)
    }

    /// Emit one data record and advance the sequence.
    pub fn emit_record(
        &mut self,
        timestamp: u64,
        source: TimingSource,
        accuracy_us: f64,
        values: &[i64; 3],
    ) -> io::Result<()> {
        let seq = self.sequence;
        match self.validator.validate(seq) {
            SeqVerdict::InSync => {}
            SeqVerdict::Gap {
                expected,
                got,
                size,
            } => {
                self.emit(format_args!(
                    "SEQUENCE_GAP:Expected {expected}, got {got} (gap: {size} samples)"
                ))?;
            }
            SeqVerdict::Reset { expected, got } => {
                self.emit(format_args!(
                    "SEQUENCE_RESET:Expected {expected}, got {got} (reset detected)"
                ))?;
            }
        }

        match self.format {
            OutputFormat::Full => self.emit(format_args!(
                "{seq},{timestamp},{},{accuracy_us:.1},{},{},{}",
                source.code(),
                values[0],
                values[1],
                values[2]
            ))?,
            OutputFormat::Compact => self.emit(format_args!(
                "{seq},{timestamp},{},{},{}",
                values[0], values[1], values[2]
            ))?,
        }

        self.sequence = self.sequence.wrapping_add(1);
        self.samples_generated += 1;
        Ok(())
    }

    /// Emit the per-stream `SESSION:` header, once per stream.
    ///
    /// Mints a fresh `stream_id` from the millisecond counter.
    pub fn session_header(
        &mut self,
        now_ms: u32,
        rate_hz: f64,
        settings: &AdcSettings,
        source: TimingSource,
        ppm: f64,
    ) -> io::Result<()> {
        if self.header_sent {
            return Ok(());
        }
        self.stream_id = now_ms;
        let boot_id = self.boot_id;
        let stream_id = self.stream_id;
        self.emit(format_args!(
            "SESSION:{boot_id},{stream_id},{rate_hz:.2},{},{},{},{},{},{ppm:.2}",
            settings.channels,
            settings.filter_index,
            settings.gain_index,
            settings.dithering,
            source.name(),
        ))?;
        self.header_sent = true;
        Ok(())
    }

    /// Emit the 1 Hz `STAT:` beacon when due. Returns whether it fired.
    pub fn maybe_stat(&mut self, now_ms: u32, snap: &StatSnapshot) -> io::Result<bool> {
        if now_ms.wrapping_sub(self.last_stat_ms) < self.stat_interval_ms {
            return Ok(false);
        }
        self.last_stat_ms = now_ms;
        let skipped = self.backpressure.skipped;
        let overflows = self.backpressure.overflows;
        let boot_id = self.boot_id;
        let stream_id = self.stream_id;
        self.emit(format_args!(
            "STAT:{},{:.1},{:.2},{},{},{},{overflows},{skipped},{boot_id},{stream_id},{}",
            snap.source.name(),
            snap.accuracy_us,
            snap.ppm,
            snap.pps_valid as u8,
            snap.pps_age_ms,
            snap.wraparounds,
            snap.adc_deadline_misses,
        ))?;
        Ok(true)
    }

    /// Reset the sequence counter to zero (stream start, `RESET`).
    pub fn reset_sequence(&mut self) {
        self.sequence = 0;
    }

    /// Clear the header-sent flag so the next stream re-emits `SESSION:`.
    pub fn clear_header(&mut self) {
        self.header_sent = false;
    }

    /// Switch the data-record format.
    pub fn set_format(&mut self, format: OutputFormat) {
        self.format = format;
    }

    /// Current data-record format.
    pub fn format(&self) -> OutputFormat {
        self.format
    }

    /// The sequence validator.
    pub fn validator(&self) -> &SequenceValidator {
        &self.validator
    }

    /// Mutable access to the sequence validator.
    pub fn validator_mut(&mut self) -> &mut SequenceValidator {
        &mut self.validator
    }

    /// The back-pressure monitor.
    pub fn backpressure(&self) -> &BackPressureMonitor {
        &self.backpressure
    }

    /// Next sequence number to emit.
    pub fn sequence(&self) -> u16 {
        self.sequence
    }

    /// Samples emitted since boot.
    pub fn samples_generated(&self) -> u64 {
        self.samples_generated
    }

    /// Boot identifier.
    pub fn boot_id(&self) -> u32 {
        self.boot_id
    }

    /// Identifier of the current (or last) stream.
    pub fn stream_id(&self) -> u32 {
        self.stream_id
    }

    /// Remaining transmit-buffer space.
    pub fn tx_free(&mut self) -> usize {
        self.sink.tx_free()
    }

    /// Access the underlying sink.
    pub fn sink_mut(&mut self) -> &mut S {
        &mut self.sink
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sim::SimSink;

    fn pipeline(sink: SimSink) -> OutputPipeline<SimSink> {
        OutputPipeline::new(
            sink,
            42,
            DEFAULT_TX_FREE_THRESHOLD,
            DEFAULT_OFLOW_REPORT_INTERVAL_MS,
            DEFAULT_STAT_INTERVAL_MS,
        )
    }

    #[test]
    fn test_validator_in_sync_series() {
        let mut v = SequenceValidator::new();
        for seq in 0..100u16 {
            assert_eq!(v.validate(seq), SeqVerdict::InSync, "seq={seq}");
        }
        assert_eq!(v.gaps(), 0);
        assert_eq!(v.resets(), 0);
    }

    #[test]
    fn test_validator_wraparound_is_in_sync() {
        let mut v = SequenceValidator::new();
        v.expected = 65_535;
        assert_eq!(v.validate(65_535), SeqVerdict::InSync);
        assert_eq!(v.expected(), 0);
        // 0 right after 65535 is a fresh wrap, not the boot special case:
        // expected was advanced past it already.
        assert_eq!(v.validate(0), SeqVerdict::InSync);
        assert_eq!(v.validate(1), SeqVerdict::InSync);
    }

    #[test]
    fn test_validator_forward_gap() {
        let mut v = SequenceValidator::new();
        v.validate(0);
        assert_eq!(
            v.validate(5),
            SeqVerdict::Gap {
                expected: 1,
                got: 5,
                size: 4
            }
        );
        // Realigned.
        assert_eq!(v.validate(6), SeqVerdict::InSync);
        assert_eq!(v.gaps(), 1);
    }

    #[test]
    fn test_validator_backward_jump_is_reset() {
        let mut v = SequenceValidator::new();
        v.expected = 5_000;
        assert_eq!(
            v.validate(10),
            SeqVerdict::Reset {
                expected: 5_000,
                got: 10
            }
        );
        assert_eq!(v.expected(), 11);
        assert_eq!(v.resets(), 1);
    }

    #[test]
    fn test_validator_small_wrap_gap_is_gap_not_reset() {
        let mut v = SequenceValidator::new();
        v.expected = 65_530;
        // Numerically backward but only 16 forward across the wrap.
        assert_eq!(
            v.validate(10),
            SeqVerdict::Gap {
                expected: 65_530,
                got: 10,
                size: 16
            }
        );
    }

    #[test]
    fn test_validator_disabled_accepts_anything() {
        let mut v = SequenceValidator::new();
        v.set_enabled(false);
        assert_eq!(v.validate(999), SeqVerdict::InSync);
        assert_eq!(v.gaps(), 0);
    }

    #[test]
    fn test_record_formats() {
        let sink = SimSink::new();
        let mut p = pipeline(sink.clone());
        p.emit_record(123_456, TimingSource::PpsActive, 1.0, &[10, -20, 30])
            .unwrap();
        p.set_format(OutputFormat::Compact);
        p.emit_record(133_456, TimingSource::PpsActive, 1.0, &[11, -21, 31])
            .unwrap();
        let lines = sink.lines();
        assert_eq!(lines[0], "0,123456,0,1.0,10,-20,30");
        assert_eq!(lines[1], "1,133456,11,-21,31");
    }

    #[test]
    fn test_sequence_advances_and_wraps() {
        let sink = SimSink::new();
        let mut p = pipeline(sink.clone());
        p.sequence = 65_535;
        p.validator.expected = 65_535;
        p.emit_record(1, TimingSource::InternalRaw, 1_000.0, &[0, 0, 0])
            .unwrap();
        assert_eq!(p.sequence(), 0);
        p.emit_record(2, TimingSource::InternalRaw, 1_000.0, &[0, 0, 0])
            .unwrap();
        assert_eq!(p.sequence(), 1);
        // No gap/reset lines across the wrap.
        assert!(sink.lines().iter().all(|l| !l.starts_with("SEQUENCE")));
    }

    #[test]
    fn test_backpressure_drops_and_throttles() {
        let sink = SimSink::new();
        sink.set_tx_free(10);
        let mut p = pipeline(sink.clone());

        // Far from the throttle window start.
        assert!(!p.admit(10_000).unwrap());
        // One warning + one OFLOW immediately.
        assert_eq!(sink.lines_with_prefix("WARNING:").len(), 1);
        assert_eq!(sink.lines_with_prefix("OFLOW:").len(), 1);

        // Within the report interval: counted but quiet.
        for t in (10_010..10_990).step_by(10) {
            assert!(!p.admit(t).unwrap());
        }
        assert_eq!(sink.lines_with_prefix("OFLOW:").len(), 1);

        // Next interval boundary reports again with the running counter.
        assert!(!p.admit(11_000).unwrap());
        let oflow = sink.lines_with_prefix("OFLOW:");
        assert_eq!(oflow.len(), 2);
        assert!(oflow[1].starts_with("OFLOW:100,100,10"), "line={}", oflow[1]);
    }

    #[test]
    fn test_backpressure_recovery_rearms_warning() {
        let sink = SimSink::new();
        let mut p = pipeline(sink.clone());
        sink.set_tx_free(10);
        assert!(!p.admit(5_000).unwrap());
        sink.set_tx_free(100);
        assert!(p.admit(5_100).unwrap());
        sink.set_tx_free(10);
        assert!(!p.admit(9_000).unwrap());
        assert_eq!(sink.lines_with_prefix("WARNING:").len(), 2);
    }

    #[test]
    fn test_session_header_once_per_stream() {
        let sink = SimSink::new();
        let mut p = pipeline(sink.clone());
        let settings = AdcSettings::default();
        p.session_header(7_000, 100.0, &settings, TimingSource::InternalRaw, 0.0)
            .unwrap();
        p.session_header(8_000, 100.0, &settings, TimingSource::InternalRaw, 0.0)
            .unwrap();
        let lines = sink.lines_with_prefix("SESSION:");
        assert_eq!(lines.len(), 1);
        assert_eq!(lines[0], "SESSION:42,7000,100.00,3,3,1,4,INTERNAL_RAW,0.00");

        // New stream after the flag clears.
        p.clear_header();
        p.session_header(9_000, 100.0, &settings, TimingSource::InternalRaw, 0.0)
            .unwrap();
        assert_eq!(sink.lines_with_prefix("SESSION:").len(), 2);
        assert_eq!(p.stream_id(), 9_000);
    }

    #[test]
    fn test_stat_beacon_cadence() {
        let sink = SimSink::new();
        let mut p = pipeline(sink.clone());
        let snap = StatSnapshot {
            source: TimingSource::InternalRaw,
            accuracy_us: 1_000.0,
            ppm: 0.0,
            pps_valid: false,
            pps_age_ms: 0,
            wraparounds: 0,
            adc_deadline_misses: 0,
        };
        assert!(!p.maybe_stat(500, &snap).unwrap());
        assert!(p.maybe_stat(1_000, &snap).unwrap());
        assert!(!p.maybe_stat(1_500, &snap).unwrap());
        assert!(p.maybe_stat(2_000, &snap).unwrap());
        let stats = sink.lines_with_prefix("STAT:");
        assert_eq!(stats.len(), 2);
        assert_eq!(stats[0], "STAT:INTERNAL_RAW,1000.0,0.00,0,0,0,0,0,42,0,0");
    }

    #[test]
    fn test_no_interleaving_single_buffer() {
        let sink = SimSink::new();
        let mut p = pipeline(sink.clone());
        p.debug(format_args!("a")).unwrap();
        p.emit_record(1, TimingSource::InternalRaw, 1_000.0, &[1, 2, 3])
            .unwrap();
        p.ok(format_args!("b")).unwrap();
        assert_eq!(sink.lines(), vec!["DEBUG:a", "0,1,3,1000.0,1,2,3", "OK:b"]);
    }
}
