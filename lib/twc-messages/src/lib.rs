// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Message types for the Tesla Wall Connector load-sharing protocol.
//!
//! A TWC bus carries fixed-length frames (see [`frame`]) whose first two
//! bytes select the message. Masters broadcast two flavors of linkready at
//! boot and then heartbeat each slave; slaves broadcast their own linkready
//! and answer heartbeats with status and current readings. All current
//! fields are centi-amps (0.01 A) in big-endian 16-bit fields.
//!
//! Classification is by type bytes; unrecognized frames are preserved
//! verbatim as [`Message::Unknown`] so callers can dump them.

#![cfg_attr(not(test), no_std)]

pub mod frame;

use core::fmt;

use num_derive::FromPrimitive;

pub use crate::frame::{DecodeError, FrameAccumulator, HexDump, RawFrame};

pub const TYPE_MASTER_LINKREADY1: u16 = 0xfce1;
pub const TYPE_MASTER_LINKREADY2: u16 = 0xfbe2;
pub const TYPE_MASTER_HEARTBEAT: u16 = 0xfbe0;
pub const TYPE_MASTER_IDLE_4H: u16 = 0xfc1d;
pub const TYPE_SLAVE_LINKREADY: u16 = 0xfde2;
pub const TYPE_SLAVE_HEARTBEAT: u16 = 0xfde0;

/// The current a slave linkready advertises the hardware is capable of:
/// 80.00 A, matching what real units broadcast.
pub const SLAVE_ADVERTISED_CAP_CA: u16 = 0x1f40;

/// Master heartbeat command bytes. `0x02` (error) is observed on real buses
/// but never emitted by this controller.
pub const CMD_IDLE_ACK: u8 = 0x00;
pub const CMD_SET_CAP: u8 = 0x05;

/// A device id on the bus. Two network-order bytes, unique per device,
/// carried in every frame; not semantically ordered.
#[derive(Copy, Clone, PartialEq, Eq, Debug)]
pub struct TwcId(pub u16);

impl TwcId {
    pub const BROADCAST: TwcId = TwcId(0);
}

impl fmt::Display for TwcId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:04x}", self.0)
    }
}

/// The opaque per-device sign byte carried in linkready messages. Stable
/// for a session, regenerated together with the id on a conflict.
#[derive(Copy, Clone, PartialEq, Eq, Debug)]
pub struct Sign(pub u8);

impl fmt::Display for Sign {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:02x}", self.0)
    }
}

/// Slave status byte, as reported in slave heartbeats.
#[derive(Copy, Clone, PartialEq, Eq, Debug, FromPrimitive)]
pub enum SlaveStatus {
    Ready = 0x00,
    Charging = 0x01,
    MasterLost = 0x02,
    PluggedNoCharge = 0x03,
    PluggedReady = 0x04,
    Transient = 0x05,
    LostWhilePlugged = 0x08,
}

/// A classified inbound frame.
#[derive(Copy, Clone, PartialEq, Eq, Debug)]
pub enum Message {
    SlaveLinkReady {
        sender: TwcId,
        sign: Sign,
        max_amps_ca: u16,
    },
    SlaveHeartbeat {
        sender: TwcId,
        receiver: TwcId,
        status: u8,
        req_max_ca: u16,
        actual_ca: u16,
        extra: [u8; 2],
    },
    MasterLinkReady1 {
        sender: TwcId,
        sign: Sign,
    },
    MasterLinkReady2 {
        sender: TwcId,
        sign: Sign,
    },
    MasterHeartbeat {
        sender: TwcId,
        receiver: TwcId,
        cmd: u8,
        cap_ca: u16,
        flag: u8,
        extra: [u8; 3],
    },
    MasterIdle4h,
    Unknown {
        raw: RawFrame,
    },
}

impl Message {
    /// Classifies a checksum-validated frame.
    pub fn parse(raw: &RawFrame) -> Message {
        let sender = TwcId(raw.sender());
        let body = raw.body();
        match raw.msgtype() {
            TYPE_SLAVE_LINKREADY => Message::SlaveLinkReady {
                sender,
                sign: Sign(body[0]),
                max_amps_ca: u16::from_be_bytes([body[1], body[2]]),
            },
            TYPE_SLAVE_HEARTBEAT => Message::SlaveHeartbeat {
                sender,
                receiver: TwcId(u16::from_be_bytes([body[0], body[1]])),
                status: body[2],
                req_max_ca: u16::from_be_bytes([body[3], body[4]]),
                actual_ca: u16::from_be_bytes([body[5], body[6]]),
                extra: [body[7], body[8]],
            },
            TYPE_MASTER_LINKREADY1 => Message::MasterLinkReady1 {
                sender,
                sign: Sign(body[0]),
            },
            TYPE_MASTER_LINKREADY2 => Message::MasterLinkReady2 {
                sender,
                sign: Sign(body[0]),
            },
            TYPE_MASTER_HEARTBEAT => Message::MasterHeartbeat {
                sender,
                receiver: TwcId(u16::from_be_bytes([body[0], body[1]])),
                cmd: body[2],
                cap_ca: u16::from_be_bytes([body[3], body[4]]),
                flag: body[5],
                extra: [body[6], body[7], body[8]],
            },
            TYPE_MASTER_IDLE_4H
                if sender == TwcId::BROADCAST
                    && body.iter().all(|&b| b == 0) =>
            {
                Message::MasterIdle4h
            }
            _ => Message::Unknown { raw: *raw },
        }
    }
}

/// Master linkready type 1, the first half of the boot burst.
pub fn master_linkready1(sender: TwcId, sign: Sign) -> RawFrame {
    linkready_body(TYPE_MASTER_LINKREADY1, sender, sign, 0)
}

/// Master linkready type 2, the second half of the boot burst.
pub fn master_linkready2(sender: TwcId, sign: Sign) -> RawFrame {
    linkready_body(TYPE_MASTER_LINKREADY2, sender, sign, 0)
}

/// Slave linkready beacon, advertising an 80.00 A capable unit.
pub fn slave_linkready(sender: TwcId, sign: Sign) -> RawFrame {
    linkready_body(
        TYPE_SLAVE_LINKREADY,
        sender,
        sign,
        SLAVE_ADVERTISED_CAP_CA,
    )
}

fn linkready_body(
    msgtype: u16,
    sender: TwcId,
    sign: Sign,
    max_amps_ca: u16,
) -> RawFrame {
    let [hi, lo] = max_amps_ca.to_be_bytes();
    RawFrame::new(msgtype, sender.0, [sign.0, hi, lo, 0, 0, 0, 0, 0, 0])
}

/// Master heartbeat. `cmd` is [`CMD_SET_CAP`] with the permitted maximum in
/// centi-amps, or [`CMD_IDLE_ACK`] with a zeroed payload.
pub fn master_heartbeat(
    sender: TwcId,
    receiver: TwcId,
    cmd: u8,
    cap_ca: u16,
    flag: u8,
) -> RawFrame {
    let [rx_hi, rx_lo] = receiver.0.to_be_bytes();
    let [cap_hi, cap_lo] = cap_ca.to_be_bytes();
    RawFrame::new(
        TYPE_MASTER_HEARTBEAT,
        sender.0,
        [rx_hi, rx_lo, cmd, cap_hi, cap_lo, flag, 0, 0, 0],
    )
}

/// Slave heartbeat reply carrying status, the requested maximum and the
/// actual draw, both in centi-amps.
pub fn slave_heartbeat(
    sender: TwcId,
    receiver: TwcId,
    status: u8,
    req_max_ca: u16,
    actual_ca: u16,
) -> RawFrame {
    let [rx_hi, rx_lo] = receiver.0.to_be_bytes();
    let [req_hi, req_lo] = req_max_ca.to_be_bytes();
    let [act_hi, act_lo] = actual_ca.to_be_bytes();
    RawFrame::new(
        TYPE_SLAVE_HEARTBEAT,
        sender.0,
        [rx_hi, rx_lo, status, req_hi, req_lo, act_hi, act_lo, 0, 0],
    )
}

/// The all-zero beacon a real master emits after four idle hours.
pub fn master_idle4h() -> RawFrame {
    RawFrame::new(TYPE_MASTER_IDLE_4H, 0, [0; 9])
}

#[cfg(test)]
mod tests {
    use super::*;
    use zerocopy::IntoBytes;

    #[test]
    fn slave_linkready_wire_bytes() {
        let frame = slave_linkready(TwcId(0xabcd), Sign(0x55));
        #[rustfmt::skip]
        let expected: &[u8] = &[
            // start
            0xc0,
            // type
            0xfd, 0xe2,
            // sender
            0xab, 0xcd,
            // sign, advertised 80.00 A
            0x55, 0x1f, 0x40,
            // pad
            0x00, 0x00, 0x00, 0x00, 0x00, 0x00,
            // checksum
            0x0b,
            // terminator
            0xc0, 0xfe,
        ];
        assert_eq!(frame.as_bytes(), expected);
    }

    #[test]
    fn master_heartbeat_wire_bytes() {
        let frame =
            master_heartbeat(TwcId(0x7777), TwcId(0xabcd), CMD_SET_CAP, 0x0fa0, 0);
        #[rustfmt::skip]
        let expected: &[u8] = &[
            0xc0,
            // type
            0xfb, 0xe0,
            // sender
            0x77, 0x77,
            // receiver
            0xab, 0xcd,
            // cmd, cap (40.00 A), flag, pad
            0x05, 0x0f, 0xa0, 0x00, 0x00, 0x00, 0x00,
            // checksum
            0xf5,
            0xc0, 0xfe,
        ];
        assert_eq!(frame.as_bytes(), expected);
    }

    #[test]
    fn master_linkready_wire_bytes() {
        let frame = master_linkready1(TwcId(0x7777), Sign(0x77));
        assert_eq!(frame.msgtype(), TYPE_MASTER_LINKREADY1);
        assert_eq!(frame.sender(), 0x7777);
        assert_eq!(frame.body(), &[0x77, 0, 0, 0, 0, 0, 0, 0, 0]);

        let frame = master_linkready2(TwcId(0x7777), Sign(0x77));
        assert_eq!(frame.msgtype(), TYPE_MASTER_LINKREADY2);
    }

    #[test]
    fn parse_slave_linkready() {
        let frame = slave_linkready(TwcId(0xabcd), Sign(0x55));
        assert_eq!(
            Message::parse(&frame),
            Message::SlaveLinkReady {
                sender: TwcId(0xabcd),
                sign: Sign(0x55),
                max_amps_ca: 0x1f40,
            }
        );
    }

    #[test]
    fn parse_slave_heartbeat() {
        let frame =
            slave_heartbeat(TwcId(0xabcd), TwcId(0x7777), 0x04, 0x0000, 0x0019);
        assert_eq!(
            Message::parse(&frame),
            Message::SlaveHeartbeat {
                sender: TwcId(0xabcd),
                receiver: TwcId(0x7777),
                status: 0x04,
                req_max_ca: 0,
                actual_ca: 0x19,
                extra: [0, 0],
            }
        );
    }

    #[test]
    fn parse_master_heartbeat() {
        let frame =
            master_heartbeat(TwcId(0x7777), TwcId(0xabcd), CMD_SET_CAP, 2100, 0);
        assert_eq!(
            Message::parse(&frame),
            Message::MasterHeartbeat {
                sender: TwcId(0x7777),
                receiver: TwcId(0xabcd),
                cmd: CMD_SET_CAP,
                cap_ca: 2100,
                flag: 0,
                extra: [0, 0, 0],
            }
        );
    }

    #[test]
    fn parse_idle_beacon() {
        assert_eq!(Message::parse(&master_idle4h()), Message::MasterIdle4h);
    }

    #[test]
    fn unrecognized_type_is_unknown() {
        let frame = RawFrame::new(0x1234, 0xabcd, [0; 9]);
        match Message::parse(&frame) {
            Message::Unknown { raw } => assert_eq!(raw, frame),
            other => panic!("expected unknown, got {other:?}"),
        }
    }

    #[test]
    fn nonzero_idle_body_is_unknown() {
        let frame = RawFrame::new(TYPE_MASTER_IDLE_4H, 0, [0, 0, 1, 0, 0, 0, 0, 0, 0]);
        assert!(matches!(Message::parse(&frame), Message::Unknown { .. }));
    }
}
