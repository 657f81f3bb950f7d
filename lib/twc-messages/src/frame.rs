// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Byte-level framing for the TWC RS-485 protocol.
//!
//! Frames are delimited by a `0xC0` start marker and a `0xC0 0xFE`
//! terminator. Everything in between (type, sender, body, checksum) lives in
//! the escape domain: `0xC0` is sent as `0xDB 0xDC` and `0xDB` as `0xDB
//! 0xDD`, so an unescaped `0xC0` on the wire is always a marker. After
//! unescaping, a frame is exactly [`FRAME_LEN`] bytes.
//!
//! Buses missing their RS-485 termination resistor reliably mangle the
//! terminator into `0xC0 0x02 0x00`; [`FrameAccumulator`] accepts that
//! trailer and rewrites it before validation.

use core::fmt;

use heapless::Vec;
use log::{debug, warn};
use static_assertions::const_assert_eq;
use zerocopy::{
    BigEndian, FromBytes, Immutable, IntoBytes, KnownLayout, Unaligned, U16,
};

/// Length of a complete unescaped frame, markers included.
pub const FRAME_LEN: usize = 17;

/// Worst-case on-wire length: every byte of the 14-byte escape domain
/// doubled, plus the three marker bytes.
pub const MAX_WIRE_LEN: usize = 1 + (FRAME_LEN - 3) * 2 + 2;

/// Raw-byte capacity of the accumulator. Comfortably above [`MAX_WIRE_LEN`]
/// plus the one-byte-longer corrupted trailer; anything still unterminated
/// at this point is line noise.
const ACCUM_CAP: usize = 64;

pub const START: u8 = 0xc0;
pub const TERMINATOR: u8 = 0xfe;
pub const ESCAPE: u8 = 0xdb;
pub const ESCAPED_START: u8 = 0xdc;
pub const ESCAPED_ESCAPE: u8 = 0xdd;

/// A validated, unescaped frame.
///
/// `body` covers offsets 5..14: the receiver id for heartbeats, or the sign
/// byte plus payload for linkready broadcasts. The checksum is the 8-bit sum
/// of offsets 1..=13 (everything between the start marker and the checksum
/// itself).
#[derive(
    FromBytes,
    IntoBytes,
    KnownLayout,
    Immutable,
    Unaligned,
    Copy,
    Clone,
    PartialEq,
    Eq,
    Debug,
)]
#[repr(C)]
pub struct RawFrame {
    start: u8,
    msgtype: U16<BigEndian>,
    sender: U16<BigEndian>,
    body: [u8; 9],
    checksum: u8,
    term: [u8; 2],
}

const_assert_eq!(core::mem::size_of::<RawFrame>(), FRAME_LEN);

impl RawFrame {
    /// Builds a frame with the checksum filled in.
    pub fn new(msgtype: u16, sender: u16, body: [u8; 9]) -> Self {
        let mut frame = Self {
            start: START,
            msgtype: U16::new(msgtype),
            sender: U16::new(sender),
            body,
            checksum: 0,
            term: [START, TERMINATOR],
        };
        frame.checksum = frame.compute_checksum();
        frame
    }

    pub fn msgtype(&self) -> u16 {
        self.msgtype.get()
    }

    pub fn sender(&self) -> u16 {
        self.sender.get()
    }

    pub fn body(&self) -> &[u8; 9] {
        &self.body
    }

    fn compute_checksum(&self) -> u8 {
        let bytes = self.as_bytes();
        bytes[1..FRAME_LEN - 3]
            .iter()
            .fold(0u8, |sum, &b| sum.wrapping_add(b))
    }

    /// Escape-encodes the frame for transmission.
    pub fn to_wire(&self) -> Vec<u8, MAX_WIRE_LEN> {
        let bytes = self.as_bytes();
        let mut out = Vec::new();
        // Infallible: MAX_WIRE_LEN is sized for a fully-escaped frame.
        let _ = out.push(START);
        escape(&bytes[1..FRAME_LEN - 2], &mut out);
        let _ = out.push(START);
        let _ = out.push(TERMINATOR);
        out
    }
}

/// Escape-encodes `input`, appending to `out`.
pub fn escape<const N: usize>(input: &[u8], out: &mut Vec<u8, N>) {
    for &b in input {
        match b {
            START => {
                let _ = out.push(ESCAPE);
                let _ = out.push(ESCAPED_START);
            }
            ESCAPE => {
                let _ = out.push(ESCAPE);
                let _ = out.push(ESCAPED_ESCAPE);
            }
            _ => {
                let _ = out.push(b);
            }
        }
    }
}

/// Why an otherwise complete candidate frame was rejected.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum DecodeError {
    /// Unescaped length was not [`FRAME_LEN`].
    Length { unescaped: usize },
    /// Checksum mismatch.
    Checksum { computed: u8, received: u8 },
}

impl fmt::Display for DecodeError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DecodeError::Length { unescaped } => {
                write!(f, "unexpected frame length {unescaped}")
            }
            DecodeError::Checksum { computed, received } => {
                write!(
                    f,
                    "checksum mismatch (computed {computed:02x}, \
                     received {received:02x})"
                )
            }
        }
    }
}

/// Escape-decodes `input`, appending to `out`. An `ESCAPE` byte followed by
/// anything other than the two defined codes is kept as a literal `0xDB` and
/// scanning resumes at the following byte.
pub fn unescape<const N: usize>(input: &[u8], out: &mut Vec<u8, N>) {
    let mut i = 0;
    while i < input.len() {
        let b = input[i];
        if b == ESCAPE {
            match input.get(i + 1) {
                Some(&ESCAPED_START) => {
                    let _ = out.push(START);
                    i += 2;
                    continue;
                }
                Some(&ESCAPED_ESCAPE) => {
                    let _ = out.push(ESCAPE);
                    i += 2;
                    continue;
                }
                _ => {
                    warn!("invalid escape sequence, keeping literal 0xdb");
                }
            }
        }
        let _ = out.push(b);
        i += 1;
    }
}

/// Accumulates raw wire bytes into validated frames.
///
/// Feed it one byte at a time; it hands back a complete [`RawFrame`] (or the
/// reason a candidate was discarded) as soon as a terminator arrives. Bytes
/// outside any frame are dropped silently, per the bus's self-healing
/// design.
#[derive(Default)]
pub struct FrameAccumulator {
    buf: Vec<u8, ACCUM_CAP>,
}

impl FrameAccumulator {
    pub fn new() -> Self {
        Self::default()
    }

    /// True while a candidate frame is partially buffered. The scheduler
    /// must not transmit while this holds, or it would collide with the
    /// half-duplex bus.
    pub fn mid_frame(&self) -> bool {
        !self.buf.is_empty()
    }

    pub fn push(&mut self, byte: u8) -> Option<Result<RawFrame, DecodeError>> {
        if self.buf.is_empty() {
            if byte == START {
                let _ = self.buf.push(byte);
            }
            return None;
        }

        // A terminator byte right after the start marker is the tail of a
        // previous frame; restart the scan.
        if self.buf.len() == 1 && byte == TERMINATOR {
            self.buf.clear();
            return None;
        }

        if self.buf.push(byte).is_err() {
            warn!(
                "no terminator within {} bytes, dropping candidate frame",
                ACCUM_CAP
            );
            self.buf.clear();
            if byte == START {
                let _ = self.buf.push(byte);
            }
            return None;
        }

        let n = self.buf.len();
        if n >= FRAME_LEN
            && self.buf[n - 3] == START
            && self.buf[n - 2] == 0x02
            && self.buf[n - 1] == 0x00
        {
            // Trailer mangled by a bus missing its termination resistor.
            debug!("rewriting corrupted trailer c0 02 00");
            self.buf.truncate(n - 2);
            let _ = self.buf.push(TERMINATOR);
        } else if !(n >= FRAME_LEN
            && self.buf[n - 2] == START
            && self.buf[n - 1] == TERMINATOR)
        {
            return None;
        }

        let result = decode(&self.buf);
        self.buf.clear();
        Some(result)
    }
}

/// Unescapes and validates a raw candidate (`C0 … C0 FE`).
fn decode(raw: &[u8]) -> Result<RawFrame, DecodeError> {
    let mut frame: Vec<u8, ACCUM_CAP> = Vec::new();
    let _ = frame.push(START);
    unescape(&raw[1..raw.len() - 2], &mut frame);
    let _ = frame.push(START);
    let _ = frame.push(TERMINATOR);

    if frame.len() != FRAME_LEN {
        warn!(
            "dropping frame with unexpected length {}: {}",
            frame.len(),
            HexDump(raw)
        );
        return Err(DecodeError::Length {
            unescaped: frame.len(),
        });
    }

    // Infallible: length was checked just above.
    let frame = match RawFrame::read_from_bytes(frame.as_slice()) {
        Ok(frame) => frame,
        Err(_) => {
            return Err(DecodeError::Length {
                unescaped: frame.len(),
            })
        }
    };

    let computed = frame.compute_checksum();
    if computed != frame.checksum {
        warn!(
            "dropping frame with bad checksum (computed {:02x}): {}",
            computed,
            HexDump(raw)
        );
        return Err(DecodeError::Checksum {
            computed,
            received: frame.checksum,
        });
    }

    Ok(frame)
}

/// Lazy hex formatting for diagnostics.
pub struct HexDump<'a>(pub &'a [u8]);

impl fmt::Display for HexDump<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for (i, b) in self.0.iter().enumerate() {
            if i > 0 {
                f.write_str(" ")?;
            }
            write!(f, "{b:02x}")?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn feed(
        acc: &mut FrameAccumulator,
        bytes: &[u8],
    ) -> Option<Result<RawFrame, DecodeError>> {
        let mut last = None;
        for &b in bytes {
            if let Some(result) = acc.push(b) {
                last = Some(result);
            }
        }
        last
    }

    #[test]
    fn simple_roundtrip() {
        let frame = RawFrame::new(0xfbe0, 0x7777, [0xab, 0xcd, 5, 0, 0, 0, 0, 0, 0]);
        let wire = frame.to_wire();
        assert_eq!(wire.len(), FRAME_LEN);

        let mut acc = FrameAccumulator::new();
        let decoded = feed(&mut acc, &wire).unwrap().unwrap();
        assert_eq!(decoded, frame);
        assert!(!acc.mid_frame());
    }

    #[test]
    fn escaped_bytes_roundtrip() {
        // Marker and escape bytes in every field that can hold them.
        let frame =
            RawFrame::new(0xfbe0, 0xc0db, [0xdb, 0xc0, 0xc0, 0xdb, 0, 0, 0, 0, 0]);
        let wire = frame.to_wire();
        assert!(wire.len() > FRAME_LEN);

        let mut acc = FrameAccumulator::new();
        let decoded = feed(&mut acc, &wire).unwrap().unwrap();
        assert_eq!(decoded, frame);
    }

    #[test]
    fn leading_garbage_is_dropped() {
        let frame = RawFrame::new(0xfde0, 0xabcd, [0x77, 0x77, 1, 0, 0, 0, 25, 0, 0]);
        let mut bytes: std::vec::Vec<u8> = vec![0x00, 0x42, 0xfe, 0x13];
        bytes.extend_from_slice(&frame.to_wire());

        let mut acc = FrameAccumulator::new();
        let decoded = feed(&mut acc, &bytes).unwrap().unwrap();
        assert_eq!(decoded, frame);
    }

    #[test]
    fn stray_terminator_restarts_scan() {
        // `C0 FE` from a previous frame's tail, then a full frame.
        let frame = RawFrame::new(0xfce1, 0x7777, [0x77, 0, 0, 0, 0, 0, 0, 0, 0]);
        let mut bytes: std::vec::Vec<u8> = vec![START, TERMINATOR];
        bytes.extend_from_slice(&frame.to_wire());

        let mut acc = FrameAccumulator::new();
        let decoded = feed(&mut acc, &bytes).unwrap().unwrap();
        assert_eq!(decoded, frame);
    }

    #[test]
    fn corrupted_trailer_is_accepted() {
        let frame = RawFrame::new(0xfbe0, 0x7777, [0xab, 0xcd, 5, 0x0f, 0xa0, 0, 0, 0, 0]);
        let mut wire: std::vec::Vec<u8> = frame.to_wire().to_vec();
        // Mangle the terminator the way an unterminated bus does.
        let n = wire.len();
        wire[n - 1] = 0x02;
        wire.push(0x00);

        let mut acc = FrameAccumulator::new();
        let decoded = feed(&mut acc, &wire).unwrap().unwrap();
        assert_eq!(decoded, frame);
    }

    #[test]
    fn checksum_mismatch_is_rejected() {
        let frame = RawFrame::new(0xfbe0, 0x7777, [0xab, 0xcd, 0, 0, 0, 0, 0, 0, 0]);
        let mut wire: std::vec::Vec<u8> = frame.to_wire().to_vec();
        wire[7] ^= 0x01;

        let mut acc = FrameAccumulator::new();
        match feed(&mut acc, &wire) {
            Some(Err(DecodeError::Checksum { .. })) => (),
            other => panic!("expected checksum error, got {other:?}"),
        }
    }

    #[test]
    fn short_frame_keeps_buffering() {
        // A terminator before 17 raw bytes does not end a candidate; the
        // stream resynchronizes on a later terminator instead.
        let bytes = [START, 0xfb, 0xe0, 0x12, 0x34, START, TERMINATOR];
        let mut acc = FrameAccumulator::new();
        assert!(feed(&mut acc, &bytes).is_none());
        assert!(acc.mid_frame());
    }

    #[test]
    fn wrong_unescaped_length_is_rejected() {
        // 17 raw bytes whose escape sequences collapse to a 10-byte frame.
        let mut bytes = vec![START];
        for _ in 0..7 {
            bytes.extend_from_slice(&[ESCAPE, ESCAPED_START]);
        }
        bytes.extend_from_slice(&[START, TERMINATOR]);
        assert_eq!(bytes.len(), FRAME_LEN);

        let mut acc = FrameAccumulator::new();
        match feed(&mut acc, &bytes) {
            Some(Err(DecodeError::Length { unescaped: 10 })) => (),
            other => panic!("expected length error, got {other:?}"),
        }
    }

    #[test]
    fn overlong_frame_is_rejected() {
        let mut bytes = vec![START];
        bytes.extend_from_slice(&[0u8; 15]);
        bytes.extend_from_slice(&[START, TERMINATOR]);

        let mut acc = FrameAccumulator::new();
        match feed(&mut acc, &bytes) {
            Some(Err(DecodeError::Length { unescaped: 18 })) => (),
            other => panic!("expected length error, got {other:?}"),
        }
    }

    #[test]
    fn invalid_escape_keeps_literal() {
        let mut out: Vec<u8, 8> = Vec::new();
        unescape(&[0x01, ESCAPE, 0x99, 0x02], &mut out);
        assert_eq!(out.as_slice(), &[0x01, ESCAPE, 0x99, 0x02]);
    }

    #[test]
    fn dangling_escape_keeps_literal() {
        let mut out: Vec<u8, 8> = Vec::new();
        unescape(&[0x01, ESCAPE], &mut out);
        assert_eq!(out.as_slice(), &[0x01, ESCAPE]);
    }

    #[test]
    fn checksum_spans_type_through_payload() {
        // Slave linkready from ab:cd, sign 55: sum of offsets 1..=13.
        let frame =
            RawFrame::new(0xfde2, 0xabcd, [0x55, 0x1f, 0x40, 0, 0, 0, 0, 0, 0]);
        let expected = [
            0xc0, 0xfd, 0xe2, 0xab, 0xcd, 0x55, 0x1f, 0x40, 0x00, 0x00, 0x00,
            0x00, 0x00, 0x00, 0x0b, 0xc0, 0xfe,
        ];
        assert_eq!(frame.as_bytes(), &expected);
    }
}
