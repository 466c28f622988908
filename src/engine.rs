// Copyright 2026 U.S. Federal Government (in countries where recognized)
// SPDX-License-Identifier: Apache-2.0

//! The acquisition engine: single-threaded cooperative foreground.
//!
//! [`AcquisitionEngine::poll`] is one main-loop iteration. In order it:
//!
//! 1. observes the platform counters (folding wraparounds, classifying
//!    resets),
//! 2. drains the PPS latch and processes the edge (start countdown,
//!    calibration, phase servo),
//! 3. re-classifies the timing source and emits one-shot degradation
//!    warnings,
//! 4. fires the 1 Hz health beacon,
//! 5. applies temperature compensation when active,
//! 6. services a pending synchronized start (coarse sleep → fine sleep →
//!    busy-wait ladder), and otherwise
//! 7. emits at most one sample if the scheduler deadline has passed.
//!
//! Host bytes enter through [`feed`](AcquisitionEngine::feed); completed
//! lines are dispatched immediately. All output flows through the
//! [`OutputPipeline`], so a `SESSION:` line precedes every sample of its
//! stream and no line ever interleaves with another.

use std::io;
use std::sync::Arc;

use log::debug;

use crate::adc::{
    AdcDriver, AdcSettings, ConversionStats, DITHER_DELAY_US, ThroughputMonitor,
    ThroughputVerdict,
};
use crate::calibration::{Calibrator, PpsVerdict};
use crate::clock::{ClockEvent, ResetCause, VirtualClock};
use crate::command::{self, Command, CommandError};
use crate::hal::{CalibrationStore, Platform, TxSink};
use crate::output::{
    DEFAULT_OFLOW_REPORT_INTERVAL_MS, DEFAULT_STAT_INTERVAL_MS, DEFAULT_TX_FREE_THRESHOLD,
    OutputFormat, OutputPipeline, StatSnapshot,
};
use crate::pps::{PpsEvent, PpsLatch};
use crate::scheduler::{
    LOCK_DEADBAND_US, NUDGE_DEADBAND_US, NUDGE_SPREAD_SAMPLES, PhaseServo, SampleScheduler,
    signed_phase_error,
};
use crate::timing::{SourceTransition, TimingSource, TimingTracker};

/// PPS edges arriving this soon after a clock reset are ignored.
const PPS_RESET_GUARD_MS: u32 = 5_000;

/// Command lines longer than this are discarded.
const MAX_COMMAND_LINE: usize = 128;

/// Rate change rejected above this while PPS-locked, ppm.
const RATE_GUARD_LOCKED_PPM: f64 = 50.0;

/// Rate change warned about above this, ppm.
const RATE_GUARD_WARN_PPM: f64 = 1_000.0;

/// Sync-start ladder: coarse sleep while further out than this, µs.
const SYNC_COARSE_WINDOW_US: u64 = 3_000;

/// Sync-start ladder: busy-wait once inside this, µs.
const SYNC_FINE_WINDOW_US: u64 = 50;

/// Sync-start coarse sleep quantum, µs.
const SYNC_COARSE_SLEEP_US: u32 = 200;

/// Builder for [`AcquisitionEngine`]: the tunables the firmware
/// hard-codes, with the hardware seams supplied to
/// [`build`](EngineBuilder::build).
#[derive(Clone, Copy, Debug)]
pub struct EngineBuilder {
    tx_free_threshold: usize,
    oflow_report_interval_ms: u32,
    stat_interval_ms: u32,
    pps_phase_lock: bool,
}

impl Default for EngineBuilder {
    fn default() -> Self {
        Self::new()
    }
}

impl EngineBuilder {
    /// Start from the defaults (20-byte back-pressure threshold, 1 s
    /// OFLOW and STAT intervals, continuous phase lock on).
    pub fn new() -> Self {
        EngineBuilder {
            tx_free_threshold: DEFAULT_TX_FREE_THRESHOLD,
            oflow_report_interval_ms: DEFAULT_OFLOW_REPORT_INTERVAL_MS,
            stat_interval_ms: DEFAULT_STAT_INTERVAL_MS,
            pps_phase_lock: true,
        }
    }

    /// Transmit-buffer free space below which samples are dropped.
    pub fn tx_free_threshold(mut self, bytes: usize) -> Self {
        self.tx_free_threshold = bytes;
        self
    }

    /// Minimum interval between `OFLOW:` reports.
    pub fn oflow_report_interval_ms(mut self, ms: u32) -> Self {
        self.oflow_report_interval_ms = ms;
        self
    }

    /// Health-beacon interval.
    pub fn stat_interval_ms(mut self, ms: u32) -> Self {
        self.stat_interval_ms = ms;
        self
    }

    /// Enable or disable the continuous PPS phase lock (default on).
    pub fn pps_phase_lock(mut self, enabled: bool) -> Self {
        self.pps_phase_lock = enabled;
        self
    }

    /// Assemble the engine, load the stored calibration, and emit the
    /// boot lines.
    pub fn build<P, A, C, S>(
        self,
        mut platform: P,
        adc: A,
        mut store: C,
        sink: S,
    ) -> io::Result<AcquisitionEngine<P, A, C, S>>
    where
        P: Platform,
        A: AdcDriver,
        C: CalibrationStore,
        S: TxSink,
    {
        let raw = platform.raw_micros();
        let ms = platform.millis();
        let mut pipeline = OutputPipeline::new(
            sink,
            ms,
            self.tx_free_threshold,
            self.oflow_report_interval_ms,
            self.stat_interval_ms,
        );
        pipeline.debug(format_args!("Timing core initialized, PPS discipline armed"))?;

        let mut cal = Calibrator::new();
        match store.load()? {
            Some(ppm) if cal.install_stored(ppm) => {
                debug!("calibration restored from store: {ppm:.2} ppm");
                pipeline.debug(format_args!(
                    "Loaded oscillator calibration: {ppm:.2} ppm"
                ))?;
            }
            Some(ppm) => {
                pipeline.warning(format_args!(
                    "Stored calibration out of range: {ppm:.2} ppm - ignoring"
                ))?;
            }
            None => {
                pipeline.debug(format_args!("No valid calibration in store"))?;
            }
        }

        Ok(AcquisitionEngine {
            platform,
            adc,
            store,
            pipeline,
            pps: Arc::new(PpsLatch::new()),
            clock: VirtualClock::new(raw, ms),
            tracker: TimingTracker::new(),
            cal,
            sched: SampleScheduler::for_rate(100.0),
            settings: AdcSettings::default(),
            throughput: ThroughputMonitor::new(),
            stats: ConversionStats::default(),
            stream_rate: 100.0,
            stream_samples: 0,
            streaming: false,
            timing_established: false,
            waiting_for_sync_start: false,
            sync_target_us: 0,
            sync_on_pps: false,
            pps_countdown: 0,
            started_on_pps: false,
            phase_nudge_applied: false,
            pps_phase_lock: self.pps_phase_lock,
            cmd_buf: String::with_capacity(MAX_COMMAND_LINE),
            cmd_overflow: false,
        })
    }
}

/// The acquisition node's foreground engine.
///
/// Generic over the four hardware seams; see [`crate::sim`] for the
/// simulation doubles used in tests.
pub struct AcquisitionEngine<P, A, C, S> {
    platform: P,
    adc: A,
    store: C,
    pipeline: OutputPipeline<S>,
    pps: Arc<PpsLatch>,
    clock: VirtualClock,
    tracker: TimingTracker,
    cal: Calibrator,
    sched: SampleScheduler,
    settings: AdcSettings,
    throughput: ThroughputMonitor,
    stats: ConversionStats,

    stream_rate: f64,
    stream_samples: u64,
    streaming: bool,
    timing_established: bool,
    waiting_for_sync_start: bool,
    sync_target_us: u64,
    sync_on_pps: bool,
    pps_countdown: u8,
    started_on_pps: bool,
    phase_nudge_applied: bool,
    pps_phase_lock: bool,

    cmd_buf: String,
    cmd_overflow: bool,
}

impl<P, A, C, S> AcquisitionEngine<P, A, C, S>
where
    P: Platform,
    A: AdcDriver,
    C: CalibrationStore,
    S: TxSink,
{
    /// The PPS latch to wire into the edge interrupt.
    pub fn pps_latch(&self) -> Arc<PpsLatch> {
        Arc::clone(&self.pps)
    }

    /// One cooperative main-loop iteration.
    pub fn poll(&mut self) -> io::Result<()> {
        let raw = self.platform.raw_micros();
        let ms = self.platform.millis();

        match self.clock.observe(raw, ms) {
            ClockEvent::Advanced => {}
            ClockEvent::Wraparound => {
                self.pipeline.debug(format_args!(
                    "micros wraparound detected (#{})",
                    self.clock.wraparounds()
                ))?;
            }
            ClockEvent::Reset(cause) => self.on_clock_reset(cause)?,
        }
        if self.clock.clear_expired_reset(ms) {
            self.pipeline
                .debug(format_args!("Clock reset recovery period completed"))?;
        }

        if let Some(event) = self.pps.claim() {
            self.process_pps(event)?;
        }

        let recent_reset = self.clock.recent_reset(ms);
        if let Some(transition) = self.tracker.update(ms, self.cal.valid(), recent_reset) {
            self.report_transition(transition, ms, recent_reset)?;
        }

        self.maybe_beacon(ms)?;

        if let Some(temp) = self.platform.temperature_c() {
            let in_cal = self.tracker.source() == TimingSource::InternalCal;
            if let Some(correction) = self.cal.apply_temperature(temp as f64, in_cal) {
                debug!("temperature compensation applied: {correction:+.3} ppm");
            }
        }

        if self.waiting_for_sync_start {
            return self.poll_sync_start();
        }

        if self.streaming && self.timing_established {
            self.sched.set_ppm(self.cal.ppm());
            let now_virtual = self.clock.now(self.platform.raw_micros());
            if self.sched.due(now_virtual) {
                self.emit_sample(now_virtual, ms)?;
            }
        } else if !self.streaming {
            self.platform.delay_micros(100);
        }

        Ok(())
    }

    /// Feed host bytes; dispatches each completed line.
    pub fn feed(&mut self, bytes: &[u8]) -> io::Result<()> {
        for &b in bytes {
            match b {
                b'\n' => {
                    let overflowed = self.cmd_overflow;
                    self.cmd_overflow = false;
                    let line = std::mem::take(&mut self.cmd_buf);
                    let result = if overflowed {
                        self.pipeline
                            .error(format_args!("{}", CommandError::LineTooLong))
                    } else {
                        self.handle_line(line.trim())
                    };
                    // Keep the buffer's capacity.
                    self.cmd_buf = line;
                    self.cmd_buf.clear();
                    result?;
                }
                b'\r' => {}
                _ => {
                    if self.cmd_buf.len() < MAX_COMMAND_LINE {
                        self.cmd_buf.push(b as char);
                    } else {
                        self.cmd_overflow = true;
                    }
                }
            }
        }
        Ok(())
    }

    /// Dispatch one command line.
    pub fn handle_line(&mut self, line: &str) -> io::Result<()> {
        if line.is_empty() {
            return Ok(());
        }
        match command::parse(line) {
            Ok(cmd) => self.apply(cmd),
            Err(e) => self.pipeline.error(format_args!("{e}")),
        }
    }

    fn apply(&mut self, cmd: Command) -> io::Result<()> {
        match cmd {
            Command::StartStream { rate_hz } => self.start_stream(rate_hz),
            Command::StartStreamSync { rate_hz, delay_ms } => {
                self.start_stream_sync(rate_hz, delay_ms)
            }
            Command::StartStreamPps { rate_hz, edges } => self.start_stream_pps(rate_hz, edges),
            Command::StopStream => self.stop_stream(),
            Command::SetAdcRate(index) => {
                if self.reject_while_streaming()? {
                    return Ok(());
                }
                self.settings.rate_index = index;
                self.adc.set_rate_index(index);
                self.pipeline.ok(format_args!("ADC rate set"))
            }
            Command::SetGain(index) => {
                if self.reject_while_streaming()? {
                    return Ok(());
                }
                self.settings.gain_index = index;
                self.adc.set_gain_index(index);
                self.pipeline.ok(format_args!("Gain set"))
            }
            Command::SetFilter(index) => {
                if self.reject_while_streaming()? {
                    return Ok(());
                }
                self.settings.filter_index = index;
                self.adc.set_filter_index(index);
                let name = self.settings.filter_name();
                self.pipeline.ok(format_args!("Filter set to {name}"))
            }
            Command::SetDithering(value) => {
                if self.reject_while_streaming()? {
                    return Ok(());
                }
                self.settings.dithering = value;
                if value == 0 {
                    self.pipeline.ok(format_args!("Dithering set to OFF"))
                } else {
                    self.pipeline
                        .ok(format_args!("Dithering set to {value}x oversampling"))
                }
            }
            Command::SetChannels(count) => {
                if self.reject_while_streaming()? {
                    return Ok(());
                }
                self.settings.channels = count;
                self.pipeline.ok(format_args!("Channels set"))
            }
            Command::SetPreciseInterval(interval_us) => {
                let new_rate = 1_000_000.0 / interval_us as f64;
                if !self.rate_change_allowed(new_rate)? {
                    return Ok(());
                }
                self.sched.set_nominal_interval_us(interval_us);
                self.stream_rate = new_rate;
                self.pipeline.ok(format_args!(
                    "Precise interval set to {interval_us}us ({new_rate:.3}Hz)"
                ))
            }
            Command::SetCalPpm(ppm) => {
                if let Some(before) = self.cal.set_manual(ppm) {
                    self.pipeline.warning(format_args!(
                        "Oscillator calibration clamped from {before:.2} ppm"
                    ))?;
                }
                self.persist_calibration()?;
                let ppm = self.cal.ppm();
                self.pipeline
                    .ok(format_args!("Manual calibration set to {ppm:.2} ppm"))
            }
            Command::SetOutputFormat(format) => {
                self.pipeline.set_format(format);
                let name = format.name();
                self.pipeline
                    .ok(format_args!("Output format set to {name}"))
            }
            Command::SetSequenceValidation(enabled) => {
                self.pipeline.validator_mut().set_enabled(enabled);
                let verb = if enabled { "enabled" } else { "disabled" };
                self.pipeline
                    .ok(format_args!("Sequence validation {verb}"))
            }
            Command::GetStatus => self.report_status(),
            Command::GetTimingStatus => self.report_timing_status(),
            Command::GetFilter => {
                let index = self.settings.filter_index;
                let name = self.settings.filter_name();
                self.pipeline.emit(format_args!("FILTER:{index},{name}"))
            }
            Command::GetDithering => {
                let value = self.settings.dithering;
                if value == 0 {
                    self.pipeline.emit(format_args!("DITHERING:0,OFF"))
                } else {
                    self.pipeline
                        .emit(format_args!("DITHERING:{value},{value}x oversampling"))
                }
            }
            Command::GetOutputFormat => {
                let format = self.pipeline.format();
                self.pipeline.emit(format_args!(
                    "OUTPUT_FORMAT:{},bytes_per_sample={}",
                    format.name(),
                    format.bytes_per_sample()
                ))
            }
            Command::GetSequenceValidation => {
                let state = if self.pipeline.validator().enabled() {
                    "ON"
                } else {
                    "OFF"
                };
                let gaps = self.pipeline.validator().gaps();
                let resets = self.pipeline.validator().resets();
                let expected = self.pipeline.validator().expected();
                self.pipeline.emit(format_args!(
                    "SEQUENCE_VALIDATION:{state},gaps_detected={gaps},resets_detected={resets},expected_seq={expected}"
                ))
            }
            Command::Reset => {
                self.streaming = false;
                self.timing_established = false;
                self.waiting_for_sync_start = false;
                self.sync_on_pps = false;
                self.pps_countdown = 0;
                self.pipeline.reset_sequence();
                self.pipeline.clear_header();
                self.pipeline.ok(format_args!("Device reset"))
            }
        }
    }

    fn reject_while_streaming(&mut self) -> io::Result<bool> {
        if self.streaming {
            self.pipeline
                .error(format_args!("Cannot change while streaming"))?;
            return Ok(true);
        }
        Ok(false)
    }

    /// Rate-change guard: reject > 50 ppm while PPS-locked, warn > 1000
    /// ppm otherwise.
    fn rate_change_allowed(&mut self, new_rate: f64) -> io::Result<bool> {
        let change_ppm = ((new_rate - self.stream_rate) / self.stream_rate).abs() * 1e6;
        if self.tracker.source() == TimingSource::PpsActive && change_ppm > RATE_GUARD_LOCKED_PPM {
            self.pipeline.error(format_args!(
                "Rate change too large while PPS locked ({change_ppm:.1} ppm > 50 ppm limit)"
            ))?;
            return Ok(false);
        }
        if change_ppm > RATE_GUARD_WARN_PPM {
            self.pipeline
                .warning(format_args!("Large rate change detected ({change_ppm:.1} ppm)"))?;
        }
        Ok(true)
    }

    fn start_stream(&mut self, rate_hz: f64) -> io::Result<()> {
        if self.streaming {
            return self.pipeline.error(format_args!("Already streaming"));
        }
        if !self.rate_change_allowed(rate_hz)? {
            return Ok(());
        }
        self.stream_rate = rate_hz;
        self.sched = SampleScheduler::for_rate(rate_hz);
        self.sched.set_ppm(self.cal.ppm());
        self.pipeline.reset_sequence();
        self.stream_samples = 0;

        let now = self.clock.now(self.platform.raw_micros());
        self.sched.align_immediate(now);
        self.timing_established = true;
        self.started_on_pps = false;
        self.phase_nudge_applied = false;
        self.streaming = true;

        let source = self.tracker.source();
        let accuracy = self.tracker.accuracy_us();
        self.pipeline.debug(format_args!(
            "Sampling established at {rate_hz:.2}Hz with {} timing (+/-{accuracy:.1}us)",
            source.name()
        ))?;
        let ms = self.platform.millis();
        self.pipeline
            .session_header(ms, self.stream_rate, &self.settings, source, self.cal.ppm())?;
        self.pipeline.ok(format_args!(
            "Streaming started at {rate_hz:.2}Hz with {} timing",
            source.name()
        ))
    }

    fn start_stream_sync(&mut self, rate_hz: f64, delay_ms: u32) -> io::Result<()> {
        if self.streaming {
            return self.pipeline.error(format_args!("Already streaming"));
        }
        self.stream_rate = rate_hz;
        self.sched = SampleScheduler::for_rate(rate_hz);
        self.sched.set_ppm(self.cal.ppm());
        self.pipeline.reset_sequence();
        self.stream_samples = 0;

        let now = self.clock.now(self.platform.raw_micros());
        self.sync_target_us = now + delay_ms as u64 * 1_000;
        self.waiting_for_sync_start = true;
        self.sync_on_pps = false;
        self.started_on_pps = false;
        self.phase_nudge_applied = false;
        self.streaming = true;

        let ms = self.platform.millis();
        let source = self.tracker.source();
        self.pipeline
            .session_header(ms, self.stream_rate, &self.settings, source, self.cal.ppm())?;
        self.pipeline.ok(format_args!(
            "Synchronized streaming prepared at {rate_hz:.2}Hz, delay: {delay_ms}ms"
        ))
    }

    fn start_stream_pps(&mut self, rate_hz: f64, edges: u8) -> io::Result<()> {
        if self.streaming {
            return self.pipeline.error(format_args!("Already streaming"));
        }
        self.stream_rate = rate_hz;
        self.sched = SampleScheduler::for_rate(rate_hz);
        self.sched.set_ppm(self.cal.ppm());
        self.sync_on_pps = true;
        self.pps_countdown = edges;
        self.waiting_for_sync_start = true;
        self.pipeline
            .ok(format_args!("Waiting for {edges} PPS edges to start"))
    }

    fn stop_stream(&mut self) -> io::Result<()> {
        self.streaming = false;
        self.timing_established = false;
        self.waiting_for_sync_start = false;
        self.sync_on_pps = false;
        self.pps_countdown = 0;
        self.pipeline.clear_header();
        let n = self.stream_samples;
        self.pipeline.debug(format_args!("Generated {n} samples"))?;
        self.pipeline.ok(format_args!("Streaming stopped"))
    }

    /// Handle one claimed PPS edge.
    ///
    /// The PPS-locked start countdown is decremented at exactly this one
    /// site; an edge that triggers the start is consumed entirely by it.
    fn process_pps(&mut self, event: PpsEvent) -> io::Result<()> {
        let now_ms = event.millis;
        self.tracker.count_edge();

        if self.sync_on_pps && self.pps_countdown > 0 {
            self.pps_countdown -= 1;
            if self.pps_countdown == 0 {
                return self.start_on_pps_edge(event);
            }
        }

        if self.clock.reset_detected()
            && now_ms.wrapping_sub(self.clock.reset_time_ms()) < PPS_RESET_GUARD_MS
        {
            return self
                .pipeline
                .debug(format_args!("Ignoring PPS during reset recovery period"));
        }

        let prior = if self.tracker.pps_valid() {
            Some(self.tracker.last_pps_ms())
        } else {
            None
        };
        let pps_virtual = self.clock.to_virtual(event.raw_micros);
        let temperature = self.platform.temperature_c().map(f64::from);

        match self
            .cal
            .observe_edge(pps_virtual, now_ms, prior, temperature)
        {
            PpsVerdict::BadInterval { interval_ms } => {
                return self.pipeline.warning(format_args!(
                    "Invalid PPS interval: {interval_ms}ms - ignoring"
                ));
            }
            PpsVerdict::BadError { error_ppm } => {
                self.pipeline.warning(format_args!(
                    "PPS calibration error too large: {error_ppm:.1}ppm - ignoring"
                ))?;
            }
            PpsVerdict::Accepted {
                interval_us,
                clamped_from,
                persist,
                report,
                learned_coefficient,
                ..
            } => {
                if let Some(before) = clamped_from {
                    self.pipeline.warning(format_args!(
                        "Oscillator calibration clamped from {before:.2} ppm"
                    ))?;
                }
                if persist {
                    self.persist_calibration()?;
                }
                if let Some(coefficient) = learned_coefficient {
                    self.pipeline.debug(format_args!(
                        "Learned temperature coefficient: {coefficient:.3} ppm/C"
                    ))?;
                }
                if report {
                    let ppm = self.cal.ppm();
                    self.pipeline.debug(format_args!(
                        "Oscillator cal: {ppm:.2}ppm, interval: {interval_us}us"
                    ))?;
                }
            }
            PpsVerdict::Baseline => {}
        }

        if !self.tracker.pps_valid() {
            let count = self.tracker.pps_count();
            self.pipeline
                .debug(format_args!("GPS PPS acquired - count: {count}"))?;
        }
        self.tracker.note_pps(now_ms);

        if self.streaming && self.timing_established {
            self.align_phase_to_pps(pps_virtual)?;
        }

        if self.clock.reset_detected() {
            self.pipeline
                .debug(format_args!("PPS reacquired after reset - timing stabilizing"))?;
        }
        Ok(())
    }

    /// Phase-alignment servo planning at a PPS edge.
    ///
    /// Phase is measured against the live scheduler position
    /// (`next_sample_micros`), which reflects every correction already
    /// applied; measured against the static stream base the continuous
    /// lock would re-plan the same error at every edge and never settle.
    fn align_phase_to_pps(&mut self, pps_virtual: u64) -> io::Result<()> {
        let interval = self.sched.nominal_interval_us();
        if interval == 0 {
            return Ok(());
        }
        let phase = signed_phase_error(pps_virtual, self.sched.next_sample_micros(), interval);

        // One-shot nudge: first PPS during a stream that did not start on
        // an edge.
        if !self.started_on_pps && !self.phase_nudge_applied && phase.abs() > NUDGE_DEADBAND_US {
            let servo = PhaseServo::plan(phase, NUDGE_SPREAD_SAMPLES);
            self.pipeline.debug(format_args!(
                "Applying phase nudge to PPS: error={phase}us over {} samples",
                servo.remaining()
            ))?;
            self.sched.engage_servo(servo);
            self.phase_nudge_applied = true;
        }

        // Continuous lock: re-plan at every edge outside the dead-band.
        if self.pps_phase_lock && phase.abs() > LOCK_DEADBAND_US {
            let spread = (self.stream_rate + 0.5) as u32;
            let servo = PhaseServo::plan(phase, spread.max(1));
            self.pipeline.debug(format_args!(
                "PPS lock adjust: phase={phase}us over {} samples",
                servo.remaining()
            ))?;
            self.sched.engage_servo(servo);
        }
        Ok(())
    }

    fn start_on_pps_edge(&mut self, event: PpsEvent) -> io::Result<()> {
        let pps_virtual = self.clock.to_virtual(event.raw_micros);
        self.sched.set_ppm(self.cal.ppm());
        self.sched.start_at(pps_virtual);
        self.timing_established = true;
        self.waiting_for_sync_start = false;
        self.sync_on_pps = false;
        self.started_on_pps = true;
        self.phase_nudge_applied = false;
        self.pipeline.reset_sequence();
        self.stream_samples = 0;
        self.streaming = true;

        let source = self.tracker.source();
        self.pipeline.session_header(
            event.millis,
            self.stream_rate,
            &self.settings,
            source,
            self.cal.ppm(),
        )?;
        let rate = self.stream_rate;
        self.pipeline
            .ok(format_args!("Streaming started at PPS with {rate:.2}Hz"))?;
        self.tracker.touch_pps_time(event.millis);
        Ok(())
    }

    /// Synchronized-start wait: coarse sleep, fine sleep, then busy-wait
    /// through repeated polls.
    fn poll_sync_start(&mut self) -> io::Result<()> {
        if self.sync_on_pps {
            // The start is decided in process_pps; just yield.
            self.platform.delay_micros(SYNC_COARSE_SLEEP_US);
            return Ok(());
        }
        let now = self.clock.now(self.platform.raw_micros());
        if now >= self.sync_target_us {
            self.sched.start_at(self.sync_target_us);
            self.timing_established = true;
            self.waiting_for_sync_start = false;
            let rate = self.stream_rate;
            let source = self.tracker.source();
            return self.pipeline.ok(format_args!(
                "Streaming started at {rate:.2}Hz with {} timing (strict target)",
                source.name()
            ));
        }
        let early = self.sync_target_us - now;
        if early > SYNC_COARSE_WINDOW_US {
            self.platform.delay_micros(SYNC_COARSE_SLEEP_US);
        } else if early > SYNC_FINE_WINDOW_US {
            self.platform.delay_micros((early - SYNC_FINE_WINDOW_US) as u32);
        }
        Ok(())
    }

    /// Emit one sample (or account a drop) and advance the scheduler.
    fn emit_sample(&mut self, now_virtual: u64, now_ms: u32) -> io::Result<()> {
        if self.sched.needs_reference_update() {
            let now = self.clock.now(self.platform.raw_micros());
            let span = self.sched.rebase(now);
            let n = self.sched.reference_updates();
            self.pipeline.debug(format_args!(
                "Timing reference updated (#{n}) after {span} samples"
            ))?;
        }

        if let ThroughputVerdict::Inadequate {
            required_sps,
            available_sps,
        } = self.throughput.verify(&self.settings, self.stream_rate)
        {
            self.pipeline.warning(format_args!(
                "ADC throughput inadequate - required: {required_sps} sps, available: {available_sps} sps"
            ))?;
        }

        // Settle onto the exact slot if the deadline moved ahead of us
        // (e.g. right after a reference re-base).
        let now_fine = self.clock.now(self.platform.raw_micros());
        let next = self.sched.next_sample_micros();
        if next > now_fine {
            let wait = next - now_fine;
            if wait < self.sched.nominal_interval_us() {
                self.platform.delay_micros(wait as u32);
            }
        }

        let stamp_at = self.clock.now(self.platform.raw_micros());
        let timestamp = match self.tracker.source() {
            TimingSource::InternalRaw => stamp_at,
            _ => self.cal.calibrated_timestamp(stamp_at),
        };

        if self.pipeline.admit(now_ms)? {
            let values = self.read_channels();
            self.pipeline.emit_record(
                timestamp,
                self.tracker.source(),
                self.tracker.accuracy_us(),
                &values,
            )?;
            self.stream_samples += 1;
        }

        let advance = self.sched.advance(now_virtual);
        if advance.skipped > 0 {
            self.pipeline
                .debug(format_args!("Skipped {} missed slots", advance.skipped))?;
        }
        if advance.servo_completed {
            self.pipeline
                .debug(format_args!("Phase alignment completed"))?;
        }
        Ok(())
    }

    /// Read all active channels, oversampling when dithering is on.
    fn read_channels(&mut self) -> [i64; 3] {
        let rounds = self.settings.dithering.max(1) as u32;
        let channels = self.settings.channels as usize;
        let mut sums = [0i64; 3];
        for round in 0..rounds {
            for (ch, sum) in sums.iter_mut().enumerate().take(channels) {
                self.stats.total += 1;
                match self.adc.convert(ch as u8) {
                    Ok(value) => *sum += value,
                    // A timed-out channel contributes zero.
                    Err(_) => self.stats.deadline_misses += 1,
                }
            }
            if round + 1 < rounds {
                self.platform.delay_micros(DITHER_DELAY_US);
            }
        }
        let mut values = [0i64; 3];
        for (value, sum) in values.iter_mut().zip(sums).take(channels) {
            *value = sum / rounds as i64;
        }
        values
    }

    fn on_clock_reset(&mut self, cause: ResetCause) -> io::Result<()> {
        match cause {
            ResetCause::MicrosBackward { jump_us } => self.pipeline.warning(format_args!(
                "Large backward micros jump detected: {jump_us}us - MCU reset suspected"
            ))?,
            ResetCause::MillisBackward { jump_ms } => self.pipeline.warning(format_args!(
                "millis went backward by {jump_ms}ms - MCU reset detected"
            ))?,
            ResetCause::BootSignature => self
                .pipeline
                .warning(format_args!("Clock values suggest recent MCU reset"))?,
        }
        self.cal.invalidate();
        self.tracker.invalidate_pps();
        if self.streaming && self.timing_established {
            self.pipeline.debug(format_args!(
                "Timing continuity maintained through clock reset"
            ))?;
        }
        let n = self.clock.resets();
        self.pipeline
            .debug(format_args!("Clock reset #{n} handled"))
    }

    fn report_transition(
        &mut self,
        transition: SourceTransition,
        now_ms: u32,
        recent_reset: bool,
    ) -> io::Result<()> {
        if !transition.is_degradation() {
            return self.pipeline.debug(format_args!(
                "Timing source upgraded: {} -> {}",
                transition.from.name(),
                transition.to.name()
            ));
        }
        if recent_reset && transition.to == TimingSource::InternalRaw {
            return self
                .pipeline
                .warning(format_args!("Using raw timing due to recent clock reset"));
        }
        let age_s = self.tracker.pps_age_ms(now_ms) / 1_000;
        self.pipeline.warning(format_args!(
            "Timing degraded: {} -> {} (PPS age {age_s}s)",
            transition.from.name(),
            transition.to.name()
        ))
    }

    fn maybe_beacon(&mut self, now_ms: u32) -> io::Result<()> {
        let snapshot = StatSnapshot {
            source: self.tracker.source(),
            accuracy_us: self.tracker.accuracy_us(),
            ppm: self.cal.ppm(),
            pps_valid: self.tracker.pps_valid(),
            pps_age_ms: self.tracker.pps_age_ms(now_ms),
            wraparounds: self.clock.wraparounds(),
            adc_deadline_misses: self.stats.deadline_misses,
        };
        self.pipeline.maybe_stat(now_ms, &snapshot)?;
        Ok(())
    }

    fn persist_calibration(&mut self) -> io::Result<()> {
        let ppm = self.cal.ppm() as f32;
        self.store.save(ppm)?;
        debug!("oscillator calibration persisted: {ppm:.2} ppm");
        Ok(())
    }

    fn report_status(&mut self) -> io::Result<()> {
        let streaming = self.streaming as u8;
        let samples = self.stream_samples;
        let rate = self.stream_rate;
        let channels = self.settings.channels;
        let filter = self.settings.filter_index;
        let sequence = self.pipeline.sequence();
        let source = self.tracker.source().code();
        let accuracy = self.tracker.accuracy_us();
        let pps_valid = self.tracker.pps_valid() as u8;
        let pps_count = self.tracker.pps_count();
        let resets = self.clock.resets();
        let wraps = self.clock.wraparounds();
        let ref_updates = self.sched.reference_updates();
        let overflows = self.pipeline.backpressure().overflows();
        let skipped = self.pipeline.backpressure().skipped();
        let free = self.pipeline.tx_free();
        let gaps = self.pipeline.validator().gaps();
        let seq_resets = self.pipeline.validator().resets();
        self.pipeline.emit(format_args!(
            "STATUS:streaming={streaming},samples_generated={samples},stream_rate={rate:.2},\
channels={channels},filter={filter},sequence={sequence},timing_source={source},\
timing_accuracy_us={accuracy:.1},pps_valid={pps_valid},pps_count={pps_count},\
clock_resets={resets},wraparounds={wraps},ref_updates={ref_updates},\
buffer_overflows={overflows},samples_skipped={skipped},buffer_available={free},\
seq_gaps={gaps},seq_resets={seq_resets}"
        ))
    }

    fn report_timing_status(&mut self) -> io::Result<()> {
        let source = self.tracker.source().name();
        let accuracy = self.tracker.accuracy_us();
        let pps_valid = self.tracker.pps_valid() as u8;
        let pps_count = self.tracker.pps_count();
        let ppm = self.cal.ppm();
        let cal_valid = self.cal.valid() as u8;
        let resets = self.clock.resets();
        let wraps = self.clock.wraparounds();
        let offset_m = self.clock.offset() >> 20;
        let reset_flag = self.clock.reset_detected() as u8;
        let ref_updates = self.sched.reference_updates();
        let sample_index = self.sched.sample_index();
        let lock = self.pps_phase_lock as u8;
        self.pipeline.emit(format_args!(
            "TIMING:source={source},accuracy_us={accuracy:.1},pps_valid={pps_valid},\
pps_count={pps_count},calibration_ppm={ppm:.3},calibration_valid={cal_valid},\
clock_resets={resets},wraparounds={wraps},virtual_offset={offset_m},\
reset_detected={reset_flag},ref_updates={ref_updates},sample_index={sample_index},\
pps_phase_lock={lock}"
        ))
    }

    /// Whether a stream is active.
    pub fn streaming(&self) -> bool {
        self.streaming
    }

    /// Current timing source.
    pub fn timing_source(&self) -> TimingSource {
        self.tracker.source()
    }

    /// Current accuracy estimate, µs.
    pub fn accuracy_us(&self) -> f64 {
        self.tracker.accuracy_us()
    }

    /// The oscillator calibrator.
    pub fn calibrator(&self) -> &Calibrator {
        &self.cal
    }

    /// The sample scheduler.
    pub fn scheduler(&self) -> &SampleScheduler {
        &self.sched
    }

    /// The virtual clock.
    pub fn clock(&self) -> &VirtualClock {
        &self.clock
    }

    /// Conversion statistics.
    pub fn conversion_stats(&self) -> ConversionStats {
        self.stats
    }

    /// Samples emitted in the current stream.
    pub fn stream_samples(&self) -> u64 {
        self.stream_samples
    }

    /// Current output format.
    pub fn output_format(&self) -> OutputFormat {
        self.pipeline.format()
    }
}
