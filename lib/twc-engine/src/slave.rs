// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! The slave side of the link, kept as a diagnostic mirror of the master
//! state machine: point two controllers at each other over a null-modem
//! cable and the master can be exercised without real hardware.
//!
//! A slave beacons its linkready every ten seconds until a master talks to
//! it, answers every heartbeat addressed to it by mirroring the master's
//! advertised cap back as its own requested maximum, and abandons its
//! identity if a master linkready claims the same id.

use log::{debug, info, warn};

use twc_messages::{
    slave_heartbeat, slave_linkready, Message, RawFrame, Sign, SlaveStatus,
    TwcId,
};

use crate::{random_identity, Millis, Rng};

/// How often the linkready beacon repeats while unattended.
pub const LINKREADY_INTERVAL_MS: Millis = 10_000;

#[derive(Copy, Clone, Debug, Default, PartialEq, Eq)]
pub struct SlaveStats {
    pub rx_frames: u32,
    pub tx_frames: u32,
    pub id_conflicts: u32,
}

pub struct SlaveEngine {
    own_id: TwcId,
    own_sign: Sign,
    status: u8,
    mirrored_cap_ca: u16,
    last_linkready_at: Option<Millis>,
    rng: Rng,
    stats: SlaveStats,
}

impl SlaveEngine {
    pub fn new(own_id: TwcId, own_sign: Sign, seed: u64) -> Self {
        Self {
            own_id,
            own_sign,
            status: SlaveStatus::Ready as u8,
            mirrored_cap_ca: 0,
            last_linkready_at: None,
            rng: crate::seed_rng(seed),
            stats: SlaveStats::default(),
        }
    }

    pub fn own_id(&self) -> TwcId {
        self.own_id
    }

    pub fn own_sign(&self) -> Sign {
        self.own_sign
    }

    pub fn stats(&self) -> &SlaveStats {
        &self.stats
    }

    /// The cap the master last advertised to us.
    pub fn mirrored_cap_ca(&self) -> u16 {
        self.mirrored_cap_ca
    }

    pub fn handle_frame(
        &mut self,
        now: Millis,
        raw: &RawFrame,
    ) -> Option<RawFrame> {
        self.stats.rx_frames = self.stats.rx_frames.wrapping_add(1);

        match Message::parse(raw) {
            Message::MasterLinkReady1 { sender, .. }
            | Message::MasterLinkReady2 { sender, .. }
                if sender == self.own_id =>
            {
                self.id_conflict();
                None
            }
            Message::MasterLinkReady2 { sender, .. } => {
                debug!("master {sender} linkready2; announcing ourselves");
                Some(self.linkready(now))
            }
            Message::MasterLinkReady1 { .. } => None,
            Message::MasterHeartbeat {
                sender,
                receiver,
                cap_ca,
                ..
            } => {
                if receiver != self.own_id {
                    return None;
                }
                if cap_ca != self.mirrored_cap_ca {
                    info!("master {sender} set our cap to {cap_ca} cA");
                    self.mirrored_cap_ca = cap_ca;
                }
                self.stats.tx_frames = self.stats.tx_frames.wrapping_add(1);
                // Mirror the advertised cap back; a diagnostic slave has
                // no car attached, so it never draws anything.
                Some(slave_heartbeat(
                    self.own_id,
                    sender,
                    self.status,
                    self.mirrored_cap_ca,
                    0,
                ))
            }
            Message::SlaveLinkReady { sender, .. }
            | Message::SlaveHeartbeat { sender, .. } => {
                debug!("ignoring traffic from fellow slave {sender}");
                None
            }
            Message::MasterIdle4h => None,
            Message::Unknown { .. } => {
                warn!("unrecognized frame");
                None
            }
        }
    }

    /// Idle-time work: the 10 s linkready beacon.
    pub fn poll(&mut self, now: Millis) -> Option<RawFrame> {
        let due = match self.last_linkready_at {
            None => true,
            Some(t) => now.saturating_sub(t) >= LINKREADY_INTERVAL_MS,
        };
        if due {
            Some(self.linkready(now))
        } else {
            None
        }
    }

    fn linkready(&mut self, now: Millis) -> RawFrame {
        self.last_linkready_at = Some(now);
        self.stats.tx_frames = self.stats.tx_frames.wrapping_add(1);
        slave_linkready(self.own_id, self.own_sign)
    }

    fn id_conflict(&mut self) {
        self.stats.id_conflicts = self.stats.id_conflicts.wrapping_add(1);
        let old = self.own_id;
        let (id, sign) = random_identity(&mut self.rng, old);
        warn!("a master claimed our id {old}; adopting {id}");
        self.own_id = id;
        self.own_sign = sign;
        // Re-announce promptly under the new identity.
        self.last_linkready_at = None;
    }
}
