// Simulation doubles for the hardware seams.
//
// Everything the engine touches — counters, ADC, serial sink, calibration
// store — has a shared-handle double here, so unit tests, integration
// scenarios and property tests can drive the core deterministically:
// advance simulated time by hand, inject oscillator error in ppm, force a
// hardware reset, choke the transmit buffer, or power-cycle the
// calibration store.
//
// These are published (not `#[cfg(test)]`) so downstream integrations can
// bench against the same harness.

use std::cell::RefCell;
use std::io;
use std::rc::Rc;

use crate::adc::{AdcDriver, AdcTimeout};
use crate::calibration::{IMAGE_LEN, decode_image, encode_image};
use crate::hal::{CalibrationStore, Platform, TxSink};

#[derive(Debug)]
struct SimPlatformState {
    /// Oscillator microsecond count since (simulated) power-on.
    oscillator_us: f64,
    /// Frequency error of the oscillator relative to true time, ppm.
    error_ppm: f64,
    temperature_c: Option<f32>,
}

/// Simulated platform: a pair of derived counters over one oscillator.
///
/// Clones share state, so a test can hold one handle to advance time while
/// the engine owns another.
#[derive(Clone, Debug)]
pub struct SimPlatform {
    state: Rc<RefCell<SimPlatformState>>,
}

impl SimPlatform {
    /// New platform at power-on (counters at zero, perfect oscillator).
    pub fn new() -> Self {
        SimPlatform {
            state: Rc::new(RefCell::new(SimPlatformState {
                oscillator_us: 0.0,
                error_ppm: 0.0,
                temperature_c: None,
            })),
        }
    }

    /// Advance true time; the oscillator advances scaled by its error.
    pub fn advance_real_micros(&self, real_us: u64) {
        let mut s = self.state.borrow_mut();
        s.oscillator_us += real_us as f64 * (1.0 + s.error_ppm / 1e6);
    }

    /// Set the oscillator frequency error (positive = counter runs fast).
    pub fn set_oscillator_error_ppm(&self, ppm: f64) {
        self.state.borrow_mut().error_ppm = ppm;
    }

    /// Provide (or remove) a die-temperature reading.
    pub fn set_temperature_c(&self, temp: Option<f32>) {
        self.state.borrow_mut().temperature_c = temp;
    }

    /// Hardware reset: both counters restart from zero.
    pub fn force_reset(&self) {
        self.state.borrow_mut().oscillator_us = 0.0;
    }

    /// Current oscillator count in whole microseconds.
    pub fn oscillator_micros(&self) -> u64 {
        self.state.borrow().oscillator_us as u64
    }
}

impl Default for SimPlatform {
    fn default() -> Self {
        Self::new()
    }
}

impl Platform for SimPlatform {
    fn raw_micros(&mut self) -> u32 {
        (self.oscillator_micros() & 0xFFFF_FFFF) as u32
    }

    fn millis(&mut self) -> u32 {
        ((self.oscillator_micros() / 1_000) & 0xFFFF_FFFF) as u32
    }

    fn delay_micros(&mut self, us: u32) {
        // The delay loop counts oscillator ticks, so the oscillator
        // advances by exactly `us` regardless of its error.
        self.state.borrow_mut().oscillator_us += us as f64;
    }

    fn temperature_c(&mut self) -> Option<f32> {
        self.state.borrow().temperature_c
    }
}

#[derive(Debug)]
struct SimAdcState {
    values: [i64; 3],
    timeouts_pending: [u32; 3],
    conversions: u64,
    rate_index: u8,
    gain_index: u8,
    filter_index: u8,
}

/// Simulated ADC driver with programmable readings and timeouts.
#[derive(Clone, Debug)]
pub struct SimAdc {
    state: Rc<RefCell<SimAdcState>>,
}

impl SimAdc {
    /// New driver returning zeros on every channel.
    pub fn new() -> Self {
        SimAdc {
            state: Rc::new(RefCell::new(SimAdcState {
                values: [0; 3],
                timeouts_pending: [0; 3],
                conversions: 0,
                rate_index: 0,
                gain_index: 0,
                filter_index: 0,
            })),
        }
    }

    /// Program the reading returned for one channel.
    pub fn set_value(&self, channel: u8, value: i64) {
        self.state.borrow_mut().values[channel as usize] = value;
    }

    /// Program readings for all three channels.
    pub fn set_values(&self, values: [i64; 3]) {
        self.state.borrow_mut().values = values;
    }

    /// Make the next `n` conversions of `channel` miss their deadline.
    pub fn fail_next(&self, channel: u8, n: u32) {
        self.state.borrow_mut().timeouts_pending[channel as usize] = n;
    }

    /// Total conversions attempted.
    pub fn conversions(&self) -> u64 {
        self.state.borrow().conversions
    }

    /// Last rate index applied by the engine.
    pub fn rate_index(&self) -> u8 {
        self.state.borrow().rate_index
    }

    /// Last gain index applied by the engine.
    pub fn gain_index(&self) -> u8 {
        self.state.borrow().gain_index
    }

    /// Last filter index applied by the engine.
    pub fn filter_index(&self) -> u8 {
        self.state.borrow().filter_index
    }
}

impl Default for SimAdc {
    fn default() -> Self {
        Self::new()
    }
}

impl AdcDriver for SimAdc {
    fn convert(&mut self, channel: u8) -> Result<i64, AdcTimeout> {
        let mut s = self.state.borrow_mut();
        s.conversions += 1;
        let ch = channel as usize;
        if s.timeouts_pending[ch] > 0 {
            s.timeouts_pending[ch] -= 1;
            return Err(AdcTimeout);
        }
        Ok(s.values[ch])
    }

    fn set_rate_index(&mut self, index: u8) {
        self.state.borrow_mut().rate_index = index;
    }

    fn set_gain_index(&mut self, index: u8) {
        self.state.borrow_mut().gain_index = index;
    }

    fn set_filter_index(&mut self, index: u8) {
        self.state.borrow_mut().filter_index = index;
    }
}

#[derive(Debug)]
struct SimSinkState {
    partial: Vec<u8>,
    lines: Vec<String>,
    tx_free: usize,
}

/// Simulated serial sink capturing complete lines.
///
/// `tx_free` is a reported number only; writes are always captured, so a
/// test can choke the buffer without losing the meta-lines it asserts on.
#[derive(Clone, Debug)]
pub struct SimSink {
    state: Rc<RefCell<SimSinkState>>,
}

impl SimSink {
    /// New sink with a roomy (1024-byte) reported buffer.
    pub fn new() -> Self {
        SimSink {
            state: Rc::new(RefCell::new(SimSinkState {
                partial: Vec::new(),
                lines: Vec::new(),
                tx_free: 1_024,
            })),
        }
    }

    /// Set the reported free transmit-buffer space.
    pub fn set_tx_free(&self, free: usize) {
        self.state.borrow_mut().tx_free = free;
    }

    /// All complete lines captured so far.
    pub fn lines(&self) -> Vec<String> {
        self.state.borrow().lines.clone()
    }

    /// Drain the captured lines.
    pub fn take_lines(&self) -> Vec<String> {
        std::mem::take(&mut self.state.borrow_mut().lines)
    }

    /// Captured lines starting with `prefix`.
    pub fn lines_with_prefix(&self, prefix: &str) -> Vec<String> {
        self.state
            .borrow()
            .lines
            .iter()
            .filter(|l| l.starts_with(prefix))
            .cloned()
            .collect()
    }

    /// Captured data lines (lines starting with a digit).
    pub fn data_lines(&self) -> Vec<String> {
        self.state
            .borrow()
            .lines
            .iter()
            .filter(|l| l.chars().next().is_some_and(|c| c.is_ascii_digit()))
            .cloned()
            .collect()
    }
}

impl Default for SimSink {
    fn default() -> Self {
        Self::new()
    }
}

impl TxSink for SimSink {
    fn write(&mut self, bytes: &[u8]) -> io::Result<()> {
        let mut s = self.state.borrow_mut();
        for &b in bytes {
            if b == b'\n' {
                let line = String::from_utf8_lossy(&s.partial).into_owned();
                s.lines.push(line);
                s.partial.clear();
            } else {
                s.partial.push(b);
            }
        }
        Ok(())
    }

    fn tx_free(&mut self) -> usize {
        self.state.borrow().tx_free
    }
}

/// Simulated calibration store backed by a shared EEPROM image.
///
/// Cloning shares the image, so creating a fresh engine over a clone
/// models a power cycle with the store intact.
#[derive(Clone, Debug, Default)]
pub struct SimStore {
    image: Rc<RefCell<Option<[u8; IMAGE_LEN]>>>,
}

impl SimStore {
    /// New store with no image written.
    pub fn new() -> Self {
        Self::default()
    }

    /// The raw image, if one has been written.
    pub fn raw_image(&self) -> Option<[u8; IMAGE_LEN]> {
        *self.image.borrow()
    }

    /// Corrupt the magic word of the stored image (if any).
    pub fn corrupt_magic(&self) {
        if let Some(image) = self.image.borrow_mut().as_mut() {
            image[0] ^= 0xFF;
        }
    }
}

impl CalibrationStore for SimStore {
    fn load(&mut self) -> io::Result<Option<f32>> {
        Ok(self.image.borrow().as_ref().and_then(decode_image))
    }

    fn save(&mut self, ppm: f32) -> io::Result<()> {
        let mut buf = [0u8; IMAGE_LEN];
        encode_image(ppm, &mut buf);
        *self.image.borrow_mut() = Some(buf);
        Ok(())
    }
}
