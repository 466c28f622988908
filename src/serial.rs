// Copyright 2026 U.S. Federal Government (in countries where recognized)
// SPDX-License-Identifier: Apache-2.0

//! Hardware serial transport behind the `serial` feature.
//!
//! Adapts a [`serialport::SerialPort`] to [`TxSink`]. The driver does not
//! expose transmit-buffer free space directly, so it is derived from the
//! queued-byte counter against a configured buffer capacity.

use std::io::{self, Write as _};

use serialport::SerialPort;

use crate::hal::TxSink;

/// Transmit-buffer capacity assumed for typical USART drivers, bytes.
pub const DEFAULT_TX_CAPACITY: usize = 128;

/// A [`TxSink`] over a hardware serial port.
pub struct SerialSink {
    port: Box<dyn SerialPort>,
    tx_capacity: usize,
}

impl SerialSink {
    /// Wrap an open serial port with the default buffer capacity.
    pub fn new(port: Box<dyn SerialPort>) -> Self {
        Self::with_capacity(port, DEFAULT_TX_CAPACITY)
    }

    /// Wrap an open serial port, stating its transmit-buffer capacity.
    pub fn with_capacity(port: Box<dyn SerialPort>, tx_capacity: usize) -> Self {
        SerialSink { port, tx_capacity }
    }
}

impl TxSink for SerialSink {
    fn write(&mut self, bytes: &[u8]) -> io::Result<()> {
        self.port.write_all(bytes)
    }

    fn tx_free(&mut self) -> usize {
        match self.port.bytes_to_write() {
            Ok(queued) => self.tx_capacity.saturating_sub(queued as usize),
            // If the driver cannot say, report the buffer as free rather
            // than stalling the stream on a query error.
            Err(_) => self.tx_capacity,
        }
    }
}
