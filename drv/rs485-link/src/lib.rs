// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! The RS-485 serial endpoint.
//!
//! Wall connectors talk 9600 8N1 over a half-duplex RS-485 pair, usually
//! reached through a USB adapter. The bus is single-owner, so this is a
//! lib rather than a service: the scheduling loop holds the [`Rs485Link`]
//! directly and pumps it one byte at a time.
//!
//! Reads are effectively non-blocking: the port timeout is set to one byte
//! time and an expired timeout surfaces as `None`, exactly like an empty
//! RX FIFO. Transient errors are logged and swallowed; the protocol is
//! self-healing because peers re-announce themselves on silence.

use std::io::{Read, Write};
use std::time::Duration;

use log::warn;
use serialport::{DataBits, FlowControl, Parity, SerialPort, StopBits};

/// The TWC bus rate; one byte is roughly a millisecond.
pub const BAUD_RATE: u32 = 9600;

/// Handle to the opened bus endpoint.
pub struct Rs485Link {
    port: Box<dyn SerialPort>,
}

impl Rs485Link {
    /// Opens `path` raw at 9600 8N1, no flow control, no echo.
    pub fn open(path: &str) -> Result<Self, serialport::Error> {
        let port = serialport::new(path, BAUD_RATE)
            .data_bits(DataBits::Eight)
            .parity(Parity::None)
            .stop_bits(StopBits::One)
            .flow_control(FlowControl::None)
            .timeout(Duration::from_millis(1))
            .open()?;
        Ok(Self { port })
    }

    /// Pops one byte from the receiver, returning `None` when nothing is
    /// currently available.
    pub fn try_rx_pop(&mut self) -> Option<u8> {
        let mut byte = [0u8; 1];
        match self.port.read(&mut byte) {
            Ok(0) => {
                // A zero-length read should be impossible for a 1-byte
                // buffer; treat it like an empty receiver.
                warn!("serial read returned 0 bytes");
                None
            }
            Ok(_) => Some(byte[0]),
            Err(e)
                if e.kind() == std::io::ErrorKind::TimedOut
                    || e.kind() == std::io::ErrorKind::WouldBlock =>
            {
                None
            }
            Err(e) => {
                warn!("serial read error: {e}");
                None
            }
        }
    }

    /// Writes a whole escaped frame. Errors are reported to the caller for
    /// logging but are not fatal; peers re-sync via linkready.
    pub fn write_frame(&mut self, frame: &[u8]) -> std::io::Result<()> {
        self.port.write_all(frame)?;
        self.port.flush()
    }
}
