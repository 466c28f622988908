// Copyright 2026 U.S. Federal Government (in countries where recognized)
// SPDX-License-Identifier: Apache-2.0

//! Command grammar of the host protocol.
//!
//! Commands are ASCII lines, `\n`-terminated, with a colon separating the
//! command name from its comma-separated arguments
//! (`START_STREAM_SYNC:100,500`). Parsing is separated from dispatch: this
//! module turns a line into a typed [`Command`] or a [`CommandError`], and
//! the engine owns the state-dependent checks (streaming guards, the
//! rate-change guard) and the `OK:`/`ERROR:` responses.

use std::fmt;

use crate::output::OutputFormat;

/// Lower bound of the `SET_PRECISE_INTERVAL` window, µs.
pub const PRECISE_INTERVAL_MIN_US: u64 = 9_900;
/// Upper bound of the `SET_PRECISE_INTERVAL` window, µs.
pub const PRECISE_INTERVAL_MAX_US: u64 = 10_100;

/// Maximum stream rate accepted by the start commands, Hz.
pub const MAX_STREAM_RATE_HZ: f64 = 1_000.0;

/// Maximum synchronized-start delay, ms.
pub const MAX_SYNC_DELAY_MS: u32 = 10_000;

/// A parsed host command.
#[derive(Clone, Copy, Debug, PartialEq)]
pub enum Command {
    /// Begin streaming immediately at the given rate.
    StartStream {
        /// Stream rate in Hz.
        rate_hz: f64,
    },
    /// Begin streaming at an absolute deadline `delay_ms` from now.
    StartStreamSync {
        /// Stream rate in Hz.
        rate_hz: f64,
        /// Delay until the start deadline, ms.
        delay_ms: u32,
    },
    /// Begin streaming on the n-th subsequent PPS edge.
    StartStreamPps {
        /// Stream rate in Hz.
        rate_hz: f64,
        /// Number of edges to wait for (1..=5).
        edges: u8,
    },
    /// End the stream.
    StopStream,
    /// Select the ADC conversion rate (1-based table index).
    SetAdcRate(u8),
    /// Select the programmable gain (1-based index).
    SetGain(u8),
    /// Select the digital filter (1-based index).
    SetFilter(u8),
    /// Set the oversample multiplier (0, 2, 3 or 4).
    SetDithering(u8),
    /// Set the active channel count (1..=3).
    SetChannels(u8),
    /// Micro-tune the sample interval (9900..=10100 µs).
    SetPreciseInterval(u64),
    /// Install a manual oscillator calibration, ppm.
    SetCalPpm(f64),
    /// Switch the data-line format.
    SetOutputFormat(OutputFormat),
    /// Enable or disable sequence-gap reporting.
    SetSequenceValidation(bool),
    /// Emit the full status line.
    GetStatus,
    /// Emit the timing status line.
    GetTimingStatus,
    /// Emit the filter setting.
    GetFilter,
    /// Emit the dithering setting.
    GetDithering,
    /// Emit the output-format setting.
    GetOutputFormat,
    /// Emit the sequence-validation setting.
    GetSequenceValidation,
    /// Stop streaming and reset sequence and session state.
    Reset,
}

/// Why a command line was refused. Rendered into `ERROR:` responses; the
/// refused command changes no state.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum CommandError {
    /// The line was empty or structurally malformed.
    InvalidFormat,
    /// Unrecognized command name.
    Unknown,
    /// Stream rate missing or outside (0, 1000] Hz.
    InvalidRate,
    /// Synchronized-start arguments missing or out of range.
    InvalidSyncArgs,
    /// PPS-start arguments missing or the edge count outside 1..=5.
    InvalidPpsArgs,
    /// ADC rate index outside 1..=16.
    InvalidRateIndex,
    /// Gain index outside 1..=6.
    InvalidGainIndex,
    /// Filter index outside 1..=5.
    InvalidFilterIndex,
    /// Channel count outside 1..=3.
    InvalidChannelCount,
    /// Dithering value not one of 0, 2, 3, 4.
    InvalidDithering,
    /// Precise interval outside 9900..=10100 µs.
    InvalidInterval,
    /// Calibration value not a finite number.
    InvalidCalibration,
    /// Output format not `COMPACT` or `FULL`.
    InvalidOutputFormat,
    /// Parameter not `ON` or `OFF`.
    InvalidOnOff,
    /// The line exceeded the command buffer.
    LineTooLong,
}

impl fmt::Display for CommandError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CommandError::InvalidFormat => write!(f, "Invalid command format"),
            CommandError::Unknown => write!(f, "Unknown command"),
            CommandError::InvalidRate => write!(f, "Invalid rate (0 < rate <= 1000)"),
            CommandError::InvalidSyncArgs => write!(f, "Invalid sync parameters"),
            CommandError::InvalidPpsArgs => {
                write!(f, "Invalid rate or PPS wait count (1-5)")
            }
            CommandError::InvalidRateIndex => write!(f, "Invalid rate index (1-16)"),
            CommandError::InvalidGainIndex => write!(f, "Invalid gain index (1-6)"),
            CommandError::InvalidFilterIndex => write!(f, "Invalid filter index (1-5)"),
            CommandError::InvalidChannelCount => write!(f, "Invalid channel count (1-3)"),
            CommandError::InvalidDithering => {
                write!(f, "Invalid dithering value (0, 2, 3, or 4)")
            }
            CommandError::InvalidInterval => write!(f, "Invalid interval (9900-10100 us)"),
            CommandError::InvalidCalibration => write!(f, "Invalid calibration value"),
            CommandError::InvalidOutputFormat => {
                write!(f, "Invalid format (COMPACT or FULL)")
            }
            CommandError::InvalidOnOff => write!(f, "Invalid parameter (ON or OFF)"),
            CommandError::LineTooLong => write!(f, "Command too long"),
        }
    }
}

impl std::error::Error for CommandError {}

fn parse_rate(s: &str) -> Result<f64, CommandError> {
    let rate: f64 = s.trim().parse().map_err(|_| CommandError::InvalidRate)?;
    if rate.is_finite() && rate > 0.0 && rate <= MAX_STREAM_RATE_HZ {
        Ok(rate)
    } else {
        Err(CommandError::InvalidRate)
    }
}

fn parse_index(s: &str, max: u8, err: CommandError) -> Result<u8, CommandError> {
    let index: u8 = s.trim().parse().map_err(|_| err)?;
    if (1..=max).contains(&index) {
        Ok(index)
    } else {
        Err(err)
    }
}

/// Parse one trimmed command line.
pub fn parse(line: &str) -> Result<Command, CommandError> {
    let line = line.trim();
    if line.is_empty() {
        return Err(CommandError::InvalidFormat);
    }
    let (name, params) = match line.split_once(':') {
        Some((name, params)) => (name, params.trim()),
        None => (line, ""),
    };

    match name {
        "START_STREAM" => Ok(Command::StartStream {
            rate_hz: parse_rate(params)?,
        }),
        "START_STREAM_SYNC" => {
            let (rate, delay) = params.split_once(',').ok_or(CommandError::InvalidSyncArgs)?;
            let rate_hz = parse_rate(rate)?;
            let delay_ms: u32 = delay
                .trim()
                .parse()
                .map_err(|_| CommandError::InvalidSyncArgs)?;
            if delay_ms >= MAX_SYNC_DELAY_MS {
                return Err(CommandError::InvalidSyncArgs);
            }
            Ok(Command::StartStreamSync { rate_hz, delay_ms })
        }
        "START_STREAM_PPS" => {
            let (rate, edges) = params.split_once(',').ok_or(CommandError::InvalidPpsArgs)?;
            let rate_hz = parse_rate(rate)?;
            let edges: u8 = edges
                .trim()
                .parse()
                .map_err(|_| CommandError::InvalidPpsArgs)?;
            if !(1..=5).contains(&edges) {
                return Err(CommandError::InvalidPpsArgs);
            }
            Ok(Command::StartStreamPps { rate_hz, edges })
        }
        "STOP_STREAM" => Ok(Command::StopStream),
        "SET_ADC_RATE" => Ok(Command::SetAdcRate(parse_index(
            params,
            16,
            CommandError::InvalidRateIndex,
        )?)),
        "SET_GAIN" => Ok(Command::SetGain(parse_index(
            params,
            6,
            CommandError::InvalidGainIndex,
        )?)),
        "SET_FILTER" => Ok(Command::SetFilter(parse_index(
            params,
            5,
            CommandError::InvalidFilterIndex,
        )?)),
        "SET_DITHERING" => {
            let value: u8 = params.parse().map_err(|_| CommandError::InvalidDithering)?;
            if matches!(value, 0 | 2 | 3 | 4) {
                Ok(Command::SetDithering(value))
            } else {
                Err(CommandError::InvalidDithering)
            }
        }
        "SET_CHANNELS" => Ok(Command::SetChannels(parse_index(
            params,
            3,
            CommandError::InvalidChannelCount,
        )?)),
        "SET_PRECISE_INTERVAL" => {
            let interval_us: u64 = params.parse().map_err(|_| CommandError::InvalidInterval)?;
            if (PRECISE_INTERVAL_MIN_US..=PRECISE_INTERVAL_MAX_US).contains(&interval_us) {
                Ok(Command::SetPreciseInterval(interval_us))
            } else {
                Err(CommandError::InvalidInterval)
            }
        }
        "SET_CAL_PPM" => {
            let ppm: f64 = params
                .parse()
                .map_err(|_| CommandError::InvalidCalibration)?;
            if ppm.is_finite() {
                Ok(Command::SetCalPpm(ppm))
            } else {
                Err(CommandError::InvalidCalibration)
            }
        }
        "SET_OUTPUT_FORMAT" => match params {
            "COMPACT" => Ok(Command::SetOutputFormat(OutputFormat::Compact)),
            "FULL" => Ok(Command::SetOutputFormat(OutputFormat::Full)),
            _ => Err(CommandError::InvalidOutputFormat),
        },
        "SET_SEQUENCE_VALIDATION" => match params {
            "ON" => Ok(Command::SetSequenceValidation(true)),
            "OFF" => Ok(Command::SetSequenceValidation(false)),
            _ => Err(CommandError::InvalidOnOff),
        },
        "GET_STATUS" => Ok(Command::GetStatus),
        "GET_TIMING_STATUS" => Ok(Command::GetTimingStatus),
        "GET_FILTER" => Ok(Command::GetFilter),
        "GET_DITHERING" => Ok(Command::GetDithering),
        "GET_OUTPUT_FORMAT" => Ok(Command::GetOutputFormat),
        "GET_SEQUENCE_VALIDATION" => Ok(Command::GetSequenceValidation),
        "RESET" => Ok(Command::Reset),
        _ => Err(CommandError::Unknown),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_start_stream() {
        assert_eq!(
            parse("START_STREAM:100"),
            Ok(Command::StartStream { rate_hz: 100.0 })
        );
        assert_eq!(
            parse("START_STREAM:0.5"),
            Ok(Command::StartStream { rate_hz: 0.5 })
        );
    }

    #[test]
    fn test_start_stream_rate_bounds() {
        assert_eq!(parse("START_STREAM:0"), Err(CommandError::InvalidRate));
        assert_eq!(parse("START_STREAM:-5"), Err(CommandError::InvalidRate));
        assert_eq!(parse("START_STREAM:1001"), Err(CommandError::InvalidRate));
        assert_eq!(parse("START_STREAM:"), Err(CommandError::InvalidRate));
        assert_eq!(parse("START_STREAM:abc"), Err(CommandError::InvalidRate));
        assert!(parse("START_STREAM:1000").is_ok());
    }

    #[test]
    fn test_start_stream_sync() {
        assert_eq!(
            parse("START_STREAM_SYNC:100,500"),
            Ok(Command::StartStreamSync {
                rate_hz: 100.0,
                delay_ms: 500
            })
        );
        assert_eq!(
            parse("START_STREAM_SYNC:100,10000"),
            Err(CommandError::InvalidSyncArgs)
        );
        assert_eq!(
            parse("START_STREAM_SYNC:100"),
            Err(CommandError::InvalidSyncArgs)
        );
    }

    #[test]
    fn test_start_stream_pps() {
        assert_eq!(
            parse("START_STREAM_PPS:100,2"),
            Ok(Command::StartStreamPps {
                rate_hz: 100.0,
                edges: 2
            })
        );
        assert_eq!(
            parse("START_STREAM_PPS:100,0"),
            Err(CommandError::InvalidPpsArgs)
        );
        assert_eq!(
            parse("START_STREAM_PPS:100,6"),
            Err(CommandError::InvalidPpsArgs)
        );
    }

    #[test]
    fn test_no_arg_commands_with_and_without_colon() {
        assert_eq!(parse("STOP_STREAM"), Ok(Command::StopStream));
        assert_eq!(parse("STOP_STREAM:"), Ok(Command::StopStream));
        assert_eq!(parse("RESET"), Ok(Command::Reset));
        assert_eq!(parse("GET_STATUS"), Ok(Command::GetStatus));
        assert_eq!(parse("GET_TIMING_STATUS:"), Ok(Command::GetTimingStatus));
    }

    #[test]
    fn test_index_commands() {
        assert_eq!(parse("SET_ADC_RATE:15"), Ok(Command::SetAdcRate(15)));
        assert_eq!(parse("SET_ADC_RATE:17"), Err(CommandError::InvalidRateIndex));
        assert_eq!(parse("SET_ADC_RATE:0"), Err(CommandError::InvalidRateIndex));
        assert_eq!(parse("SET_GAIN:6"), Ok(Command::SetGain(6)));
        assert_eq!(parse("SET_GAIN:7"), Err(CommandError::InvalidGainIndex));
        assert_eq!(parse("SET_FILTER:3"), Ok(Command::SetFilter(3)));
        assert_eq!(parse("SET_FILTER:9"), Err(CommandError::InvalidFilterIndex));
        assert_eq!(parse("SET_CHANNELS:2"), Ok(Command::SetChannels(2)));
        assert_eq!(parse("SET_CHANNELS:4"), Err(CommandError::InvalidChannelCount));
    }

    #[test]
    fn test_dithering_choices() {
        for v in [0u8, 2, 3, 4] {
            assert_eq!(parse(&format!("SET_DITHERING:{v}")), Ok(Command::SetDithering(v)));
        }
        assert_eq!(parse("SET_DITHERING:1"), Err(CommandError::InvalidDithering));
        assert_eq!(parse("SET_DITHERING:5"), Err(CommandError::InvalidDithering));
    }

    #[test]
    fn test_precise_interval_window() {
        assert_eq!(
            parse("SET_PRECISE_INTERVAL:10000"),
            Ok(Command::SetPreciseInterval(10_000))
        );
        assert_eq!(
            parse("SET_PRECISE_INTERVAL:9899"),
            Err(CommandError::InvalidInterval)
        );
        assert_eq!(
            parse("SET_PRECISE_INTERVAL:10101"),
            Err(CommandError::InvalidInterval)
        );
    }

    #[test]
    fn test_cal_ppm() {
        assert_eq!(parse("SET_CAL_PPM:-12.5"), Ok(Command::SetCalPpm(-12.5)));
        assert_eq!(parse("SET_CAL_PPM:nan"), Err(CommandError::InvalidCalibration));
        assert_eq!(parse("SET_CAL_PPM:x"), Err(CommandError::InvalidCalibration));
    }

    #[test]
    fn test_output_format_and_validation() {
        assert_eq!(
            parse("SET_OUTPUT_FORMAT:COMPACT"),
            Ok(Command::SetOutputFormat(OutputFormat::Compact))
        );
        assert_eq!(
            parse("SET_OUTPUT_FORMAT:compact"),
            Err(CommandError::InvalidOutputFormat)
        );
        assert_eq!(
            parse("SET_SEQUENCE_VALIDATION:ON"),
            Ok(Command::SetSequenceValidation(true))
        );
        assert_eq!(
            parse("SET_SEQUENCE_VALIDATION:OFF"),
            Ok(Command::SetSequenceValidation(false))
        );
        assert_eq!(
            parse("SET_SEQUENCE_VALIDATION:MAYBE"),
            Err(CommandError::InvalidOnOff)
        );
    }

    #[test]
    fn test_unknown_and_malformed() {
        assert_eq!(parse("FLY_TO_MOON:1"), Err(CommandError::Unknown));
        assert_eq!(parse(""), Err(CommandError::InvalidFormat));
        assert_eq!(parse("   "), Err(CommandError::InvalidFormat));
    }

    #[test]
    fn test_error_display() {
        assert_eq!(
            CommandError::InvalidDithering.to_string(),
            "Invalid dithering value (0, 2, 3, or 4)"
        );
        assert_eq!(CommandError::Unknown.to_string(), "Unknown command");
    }
}
