// Copyright 2026 U.S. Federal Government (in countries where recognized)
// SPDX-License-Identifier: Apache-2.0

//! Hardware seams of the acquisition core.
//!
//! The engine is written against three narrow traits so the same code runs
//! on real hardware and inside the simulation harness:
//!
//! - [`Platform`] — the microcontroller's free-running counters, blocking
//!   microsecond delay, and (optionally) a die-temperature sensor.
//! - [`TxSink`] — the byte sink of the serial transport, with a query for
//!   remaining transmit-buffer space used for back-pressure detection.
//! - [`CalibrationStore`] — the persistent store holding one signed
//!   parts-per-million oscillator correction.
//!
//! All three are accessed from the foreground only; the sole ISR-shared
//! state lives in [`PpsLatch`](crate::pps::PpsLatch).

use std::io;

/// Platform counter and delay services.
///
/// The microsecond counter is a free-running 32-bit value that wraps every
/// ~71.6 minutes; the millisecond counter wraps every ~49.7 days. Neither is
/// assumed to survive a hardware reset — the
/// [`VirtualClock`](crate::clock::VirtualClock) papers over both.
pub trait Platform {
    /// Current raw 32-bit microsecond counter (wrapping).
    fn raw_micros(&mut self) -> u32;

    /// Current raw 32-bit millisecond counter (wrapping).
    fn millis(&mut self) -> u32;

    /// Block for approximately `us` microseconds.
    ///
    /// Used by the synchronized-start spin ladder and the inter-oversample
    /// dithering delay. Must be short-bounded; callers never pass more than
    /// a few hundred microseconds.
    fn delay_micros(&mut self, us: u32);

    /// Die temperature in °C, if the platform has a sensor.
    ///
    /// Returning `None` keeps the temperature-coefficient learner dormant
    /// and temperature compensation disabled.
    fn temperature_c(&mut self) -> Option<f32> {
        None
    }
}

/// Byte sink of the serial transport.
///
/// The transport is lossy by design: when [`tx_free`](TxSink::tx_free)
/// drops below the back-pressure threshold the pipeline drops whole samples
/// (reported via `OFLOW:` meta-lines) rather than blocking the foreground.
pub trait TxSink {
    /// Queue `bytes` for transmission.
    fn write(&mut self, bytes: &[u8]) -> io::Result<()>;

    /// Remaining free space in the transmit buffer, in bytes.
    fn tx_free(&mut self) -> usize;
}

/// Persistent store for the oscillator calibration.
///
/// The store holds a single signed ppm value with a validity notion; the
/// wire format (4-byte magic word + IEEE-754 f32) is defined by
/// [`EepromImage`](crate::calibration::EepromImage).
pub trait CalibrationStore {
    /// Load the stored ppm value, or `None` if no valid record exists.
    fn load(&mut self) -> io::Result<Option<f32>>;

    /// Persist `ppm`, replacing any previous record.
    fn save(&mut self, ppm: f32) -> io::Result<()>;
}

impl<T: TxSink + ?Sized> TxSink for &mut T {
    fn write(&mut self, bytes: &[u8]) -> io::Result<()> {
        (**self).write(bytes)
    }

    fn tx_free(&mut self) -> usize {
        (**self).tx_free()
    }
}
