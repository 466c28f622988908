// Copyright 2026 U.S. Federal Government (in countries where recognized)
// SPDX-License-Identifier: Apache-2.0

/*!
Timing, scheduling and streaming core of a PPS-disciplined seismic
data-acquisition node.

The node drives a three-channel delta-sigma ADC and emits a continuous,
sequence-numbered sample stream over a serial transport. Timestamps are
disciplined by a 1 Hz GPS pulse-per-second edge when one is available and
by a learned oscillator calibration when it is not, degrading through four
explicit quality states (`PPS_ACTIVE` → `PPS_HOLDOVER` → `INTERNAL_CAL` →
`INTERNAL_RAW`).

The hardware seams — counters, ADC, serial sink, calibration store — are
traits, so the whole engine runs unchanged against the simulation doubles
in [`sim`]:

```
use seisnode::EngineBuilder;
use seisnode::sim::{SimAdc, SimPlatform, SimSink, SimStore};

# fn main() -> std::io::Result<()> {
let platform = SimPlatform::new();
let sink = SimSink::new();
let mut engine = EngineBuilder::new()
    .build(platform.clone(), SimAdc::new(), SimStore::new(), sink.clone())?;

engine.feed(b"START_STREAM:100\n")?;
for _ in 0..2_000 {
    platform.advance_real_micros(500);
    engine.poll()?;
}
assert!(sink.data_lines().len() > 90);
# Ok(())
# }
```

On hardware, the PPS latch returned by
[`AcquisitionEngine::pps_latch`] is wired into the rising-edge interrupt,
the foreground calls [`poll`](AcquisitionEngine::poll) in its main loop,
and received serial bytes go to [`feed`](AcquisitionEngine::feed).

# Feature Flags

| Feature  | Default | Description                                        |
|----------|---------|----------------------------------------------------|
| `serial` | no      | [`TxSink`](hal::TxSink) adapter over `serialport`. |
*/

#![warn(missing_docs)]

/// Hardware seams: platform counters, byte sink, calibration store.
pub mod hal;

/// Seam to the external delta-sigma ADC driver.
pub mod adc;

/// Monotonic 64-bit virtual time over the wrapping 32-bit counter.
pub mod clock;

/// ISR → foreground handoff for PPS edge captures.
pub mod pps;

/// Four-state timing-quality classifier.
pub mod timing;

/// PPS-disciplined oscillator calibration and its persisted image.
pub mod calibration;

/// Fractional-interval sample scheduler and phase servo.
pub mod scheduler;

/// Line-oriented output pipeline: records, meta-lines, beacon.
pub mod output;

/// Host command grammar.
pub mod command;

/// The cooperative foreground engine.
pub mod engine;

/// Simulation doubles for every hardware seam.
pub mod sim;

/// `TxSink` over a hardware serial port.
#[cfg(feature = "serial")]
pub mod serial;

pub use engine::{AcquisitionEngine, EngineBuilder};
pub use pps::{PpsEvent, PpsLatch};
pub use timing::TimingSource;
