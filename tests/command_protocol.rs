// Copyright 2026 U.S. Federal Government (in countries where recognized)
// SPDX-License-Identifier: Apache-2.0

//! Command-protocol behavior through the engine: streaming guards, the
//! rate-change guard, status queries, and line assembly.

use seisnode::{AcquisitionEngine, EngineBuilder};
use seisnode::sim::{SimAdc, SimPlatform, SimSink, SimStore};

type SimEngine = AcquisitionEngine<SimPlatform, SimAdc, SimStore, SimSink>;

fn engine() -> (SimEngine, SimPlatform, SimAdc, SimSink) {
    let platform = SimPlatform::new();
    let adc = SimAdc::new();
    let sink = SimSink::new();
    let engine = EngineBuilder::new()
        .build(platform.clone(), adc.clone(), SimStore::new(), sink.clone())
        .expect("engine builds");
    (engine, platform, adc, sink)
}

fn run(engine: &mut SimEngine, platform: &SimPlatform, duration_us: u64) {
    let target = platform.oscillator_micros() + duration_us;
    while platform.oscillator_micros() < target {
        engine.poll().expect("poll");
        platform.advance_real_micros(200);
    }
}

#[test]
fn test_settings_apply_when_idle() {
    let (mut engine, _platform, adc, sink) = engine();
    engine.feed(b"SET_ADC_RATE:8\n").unwrap();
    engine.feed(b"SET_GAIN:4\n").unwrap();
    engine.feed(b"SET_FILTER:5\n").unwrap();
    assert_eq!(adc.rate_index(), 8);
    assert_eq!(adc.gain_index(), 4);
    assert_eq!(adc.filter_index(), 5);
    assert!(!sink.lines_with_prefix("OK:ADC rate set").is_empty());
    assert!(!sink.lines_with_prefix("OK:Gain set").is_empty());
    assert!(!sink.lines_with_prefix("OK:Filter set to FIR").is_empty());
}

#[test]
fn test_settings_rejected_while_streaming() {
    let (mut engine, mut platform, adc, sink) = engine();
    engine.feed(b"START_STREAM:100\n").unwrap();
    run(&mut engine, &mut platform, 100_000);

    for cmd in [
        "SET_ADC_RATE:8\n",
        "SET_GAIN:4\n",
        "SET_FILTER:1\n",
        "SET_CHANNELS:1\n",
        "SET_DITHERING:0\n",
    ] {
        engine.feed(cmd.as_bytes()).unwrap();
    }
    assert_eq!(
        sink.lines_with_prefix("ERROR:Cannot change while streaming").len(),
        5
    );
    // Nothing reached the driver.
    assert_eq!(adc.rate_index(), 0);
    assert_eq!(adc.gain_index(), 0);
}

#[test]
fn test_double_start_rejected() {
    let (mut engine, mut platform, _adc, sink) = engine();
    engine.feed(b"START_STREAM:100\n").unwrap();
    run(&mut engine, &mut platform, 50_000);
    engine.feed(b"START_STREAM:100\n").unwrap();
    assert!(!sink.lines_with_prefix("ERROR:Already streaming").is_empty());
}

#[test]
fn test_rate_guard_rejects_large_change_while_locked() {
    let (mut engine, platform, _adc, sink) = engine();
    let pps = engine.pps_latch();

    // Acquire PPS lock without streaming.
    for n in 1..=3u64 {
        let edge = n * 1_000_000;
        while platform.oscillator_micros() < edge {
            engine.poll().unwrap();
            platform.advance_real_micros(200);
        }
        pps.capture(edge as u32, (edge / 1_000) as u32);
        engine.poll().unwrap();
    }
    assert_eq!(engine.timing_source(), seisnode::TimingSource::PpsActive);

    // 100 -> 200 Hz is a 10^6 ppm change: rejected while locked.
    engine.feed(b"START_STREAM:200\n").unwrap();
    assert!(
        !sink
            .lines_with_prefix("ERROR:Rate change too large while PPS locked")
            .is_empty()
    );
    assert!(!engine.streaming());

    // The unchanged rate is fine.
    engine.feed(b"START_STREAM:100\n").unwrap();
    assert!(engine.streaming());
}

#[test]
fn test_rate_guard_warns_on_large_change_when_unlocked() {
    let (mut engine, _platform, _adc, sink) = engine();
    engine.feed(b"START_STREAM:250\n").unwrap();
    assert!(engine.streaming());
    assert!(
        !sink
            .lines_with_prefix("WARNING:Large rate change detected")
            .is_empty()
    );
}

#[test]
fn test_precise_interval_micro_tune() {
    let (mut engine, _platform, _adc, sink) = engine();
    engine.feed(b"SET_PRECISE_INTERVAL:10050\n").unwrap();
    assert_eq!(engine.scheduler().nominal_interval_us(), 10_050);
    assert!(
        !sink
            .lines_with_prefix("OK:Precise interval set to 10050us (99.502Hz)")
            .is_empty()
    );
    engine.feed(b"SET_PRECISE_INTERVAL:20000\n").unwrap();
    assert!(
        !sink
            .lines_with_prefix("ERROR:Invalid interval (9900-10100 us)")
            .is_empty()
    );
}

#[test]
fn test_status_queries() {
    let (mut engine, _platform, _adc, sink) = engine();
    engine.feed(b"GET_STATUS\n").unwrap();
    engine.feed(b"GET_TIMING_STATUS\n").unwrap();
    engine.feed(b"GET_FILTER\n").unwrap();
    engine.feed(b"GET_DITHERING\n").unwrap();
    engine.feed(b"GET_OUTPUT_FORMAT\n").unwrap();
    engine.feed(b"GET_SEQUENCE_VALIDATION\n").unwrap();

    let status = sink.lines_with_prefix("STATUS:").pop().unwrap();
    assert!(status.contains("streaming=0"));
    assert!(status.contains("stream_rate=100.00"));
    assert!(status.contains("timing_source=3"));

    let timing = sink.lines_with_prefix("TIMING:").pop().unwrap();
    assert!(timing.contains("source=INTERNAL_RAW"));
    assert!(timing.contains("calibration_valid=0"));
    assert!(timing.contains("pps_phase_lock=1"));

    assert_eq!(sink.lines_with_prefix("FILTER:").pop().unwrap(), "FILTER:3,SINC3");
    assert_eq!(
        sink.lines_with_prefix("DITHERING:").pop().unwrap(),
        "DITHERING:4,4x oversampling"
    );
    assert_eq!(
        sink.lines_with_prefix("OUTPUT_FORMAT:").pop().unwrap(),
        "OUTPUT_FORMAT:FULL,bytes_per_sample=40"
    );
    let validation = sink.lines_with_prefix("SEQUENCE_VALIDATION:").pop().unwrap();
    assert!(validation.starts_with("SEQUENCE_VALIDATION:ON,gaps_detected=0"));
}

#[test]
fn test_sequence_validation_toggle() {
    let (mut engine, _platform, _adc, sink) = engine();
    engine.feed(b"SET_SEQUENCE_VALIDATION:OFF\n").unwrap();
    assert!(
        !sink
            .lines_with_prefix("OK:Sequence validation disabled")
            .is_empty()
    );
    engine.feed(b"GET_SEQUENCE_VALIDATION\n").unwrap();
    assert!(
        sink.lines_with_prefix("SEQUENCE_VALIDATION:OFF")
            .pop()
            .is_some()
    );
}

#[test]
fn test_unknown_and_malformed_commands() {
    let (mut engine, _platform, _adc, sink) = engine();
    engine.feed(b"CALIBRATE_FLUX:9\n").unwrap();
    assert!(!sink.lines_with_prefix("ERROR:Unknown command").is_empty());
    engine.feed(b"START_STREAM:0\n").unwrap();
    assert!(
        !sink
            .lines_with_prefix("ERROR:Invalid rate (0 < rate <= 1000)")
            .is_empty()
    );
    assert!(!engine.streaming());
}

#[test]
fn test_reset_command_clears_stream_state() {
    let (mut engine, mut platform, _adc, sink) = engine();
    engine.feed(b"SET_DITHERING:0\n").unwrap();
    engine.feed(b"START_STREAM:100\n").unwrap();
    run(&mut engine, &mut platform, 500_000);
    assert!(engine.streaming());

    engine.feed(b"RESET\n").unwrap();
    assert!(!engine.streaming());
    assert!(!sink.lines_with_prefix("OK:Device reset").is_empty());

    // Restart: header re-emitted, sequence restarts at 0.
    engine.feed(b"START_STREAM:100\n").unwrap();
    run(&mut engine, &mut platform, 100_000);
    assert_eq!(sink.lines_with_prefix("SESSION:").len(), 2);
    let zero_seq = sink
        .data_lines()
        .iter()
        .filter(|l| l.split(',').next() == Some("0"))
        .count();
    assert_eq!(zero_seq, 2, "sequence did not restart at 0 after RESET");
}

#[test]
fn test_line_assembly_across_chunks() {
    let (mut engine, _platform, _adc, sink) = engine();
    engine.feed(b"GET_FIL").unwrap();
    engine.feed(b"TER\r\n").unwrap();
    assert_eq!(sink.lines_with_prefix("FILTER:").len(), 1);
}

#[test]
fn test_multiple_commands_in_one_chunk() {
    let (mut engine, _platform, _adc, sink) = engine();
    engine.feed(b"GET_FILTER\nGET_DITHERING\n").unwrap();
    assert_eq!(sink.lines_with_prefix("FILTER:").len(), 1);
    assert_eq!(sink.lines_with_prefix("DITHERING:").len(), 1);
}

#[test]
fn test_overlong_line_rejected() {
    let (mut engine, _platform, _adc, sink) = engine();
    let long = vec![b'X'; 200];
    engine.feed(&long).unwrap();
    engine.feed(b"\n").unwrap();
    assert!(!sink.lines_with_prefix("ERROR:Command too long").is_empty());
    // The parser recovers for the next command.
    engine.feed(b"GET_FILTER\n").unwrap();
    assert_eq!(sink.lines_with_prefix("FILTER:").len(), 1);
}

#[test]
fn test_stop_reports_sample_count() {
    let (mut engine, mut platform, _adc, sink) = engine();
    engine.feed(b"SET_DITHERING:0\n").unwrap();
    engine.feed(b"START_STREAM:100\n").unwrap();
    run(&mut engine, &mut platform, 500_000);
    let emitted = sink.data_lines().len();
    engine.feed(b"STOP_STREAM\n").unwrap();

    let report = sink.lines_with_prefix("DEBUG:Generated ").pop().unwrap();
    let n: usize = report
        .trim_start_matches("DEBUG:Generated ")
        .trim_end_matches(" samples")
        .parse()
        .unwrap();
    assert_eq!(n, emitted);
    assert!(!sink.lines_with_prefix("OK:Streaming stopped").is_empty());
}
