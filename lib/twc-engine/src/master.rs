// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! The master side of the link: boot burst, per-slave heartbeats and
//! liveness supervision.
//!
//! A freshly started master announces itself with five type-1 and five
//! type-2 linkready broadcasts, then settles into cruising: one heartbeat
//! per second, round-robin across the registry. Slaves answer every
//! heartbeat; each answer runs the allocation policy and is acknowledged
//! immediately, so the effective per-slave cadence is the round-robin one.
//!
//! A slave silent for 26 seconds is expired. A linkready carrying our own
//! id means another device claimed it; we pick a new identity and
//! re-announce.

use log::{debug, error, info, warn};

use twc_messages::{
    master_heartbeat, HexDump, Message, RawFrame, Sign, TwcId, CMD_IDLE_ACK,
    CMD_SET_CAP,
};
use zerocopy::IntoBytes;

use crate::policy::Allocator;
use crate::registry::{SlaveRegistry, AMPS_UNKNOWN};
use crate::{random_identity, Millis, Rng};

/// How many of each linkready flavor the boot burst sends.
pub const LINKREADY_REPEATS: u8 = 5;

const BURST_TOTAL: u8 = 2 * LINKREADY_REPEATS;

/// Minimum spacing between round-robin heartbeats.
pub const HEARTBEAT_INTERVAL_MS: Millis = 1_000;

/// A slave silent this long is gone.
pub const SLAVE_TIMEOUT_MS: Millis = 26_000;

/// Wrapping I/O and protocol counters, reported periodically by the
/// scheduler.
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq)]
pub struct MasterStats {
    pub rx_frames: u32,
    pub rx_unknown: u32,
    pub rx_unknown_slave: u32,
    pub tx_frames: u32,
    pub slaves_expired: u32,
    pub slaves_evicted: u32,
    pub id_conflicts: u32,
}

pub struct MasterEngine {
    own_id: TwcId,
    own_sign: Sign,
    allocator: Allocator,
    registry: SlaveRegistry,
    global_cap_ca: i32,
    startup_msgs_left: u8,
    rr_index: usize,
    last_tx_at: Option<Millis>,
    rng: Rng,
    stats: MasterStats,
}

impl MasterEngine {
    pub fn new(
        own_id: TwcId,
        own_sign: Sign,
        wiring_cap_a: i32,
        seed: u64,
    ) -> Self {
        Self {
            own_id,
            own_sign,
            allocator: Allocator::new(wiring_cap_a),
            registry: SlaveRegistry::new(),
            // Until the power source reports in, the degraded default
            // resolves to "tell every slave 0 A".
            global_cap_ca: 1,
            startup_msgs_left: BURST_TOTAL,
            rr_index: 0,
            last_tx_at: None,
            rng: crate::seed_rng(seed),
            stats: MasterStats::default(),
        }
    }

    pub fn own_id(&self) -> TwcId {
        self.own_id
    }

    pub fn own_sign(&self) -> Sign {
        self.own_sign
    }

    pub fn registry(&self) -> &SlaveRegistry {
        &self.registry
    }

    pub fn stats(&self) -> &MasterStats {
        &self.stats
    }

    pub fn global_cap_ca(&self) -> i32 {
        self.global_cap_ca
    }

    /// Updates the global cap from the power source.
    pub fn set_global_cap_ca(&mut self, cap_ca: i32) {
        if cap_ca != self.global_cap_ca {
            info!(
                "global cap {} cA -> {} cA",
                self.global_cap_ca, cap_ca
            );
            self.global_cap_ca = cap_ca;
        }
    }

    /// Handles one validated inbound frame, returning the reply to put on
    /// the wire, if any.
    pub fn handle_frame(
        &mut self,
        now: Millis,
        raw: &RawFrame,
    ) -> Option<RawFrame> {
        self.stats.rx_frames = self.stats.rx_frames.wrapping_add(1);

        let reply = match Message::parse(raw) {
            Message::SlaveLinkReady {
                sender,
                sign,
                max_amps_ca,
            } => {
                if sender == self.own_id {
                    self.id_conflict();
                    None
                } else {
                    if self.registry.upsert(sender, now).is_some() {
                        self.stats.slaves_evicted =
                            self.stats.slaves_evicted.wrapping_add(1);
                    }
                    info!(
                        "slave {sender} linked (sign {sign}, \
                         hardware limit {max_amps_ca} cA)"
                    );
                    // Zero-payload heartbeat opens the link; the slave's
                    // first answer seeds the allocation.
                    Some(master_heartbeat(
                        self.own_id,
                        sender,
                        CMD_IDLE_ACK,
                        0,
                        0,
                    ))
                }
            }
            Message::SlaveHeartbeat {
                sender,
                receiver,
                status,
                req_max_ca,
                actual_ca,
                ..
            } => {
                if receiver != self.own_id {
                    debug!(
                        "slave {sender} heartbeat addressed to {receiver}, \
                         not us"
                    );
                    None
                } else if self.registry.get(sender).is_none() {
                    error!(
                        "heartbeat from unknown slave {sender}; waiting \
                         for its linkready"
                    );
                    self.stats.rx_unknown_slave =
                        self.stats.rx_unknown_slave.wrapping_add(1);
                    None
                } else {
                    Some(self.answer_heartbeat(
                        now, sender, status, req_max_ca, actual_ca,
                    ))
                }
            }
            Message::MasterLinkReady1 { sender, .. }
            | Message::MasterLinkReady2 { sender, .. } => {
                if sender == self.own_id {
                    self.id_conflict();
                } else {
                    warn!("another master ({sender}) is announcing itself");
                }
                None
            }
            Message::MasterHeartbeat { sender, .. } => {
                warn!("heartbeat from another master ({sender})");
                None
            }
            Message::MasterIdle4h => {
                debug!("idle beacon from another master");
                None
            }
            Message::Unknown { raw } => {
                warn!("unrecognized frame: {}", HexDump(raw.as_bytes()));
                self.stats.rx_unknown = self.stats.rx_unknown.wrapping_add(1);
                None
            }
        };

        if reply.is_some() {
            self.note_tx(now);
        }
        reply
    }

    /// One unit of idle-time work: a linkready broadcast while booting, or
    /// the next round-robin heartbeat while cruising. Must only be called
    /// when no partial inbound frame is buffered.
    pub fn poll(&mut self, now: Millis) -> Option<RawFrame> {
        if self.startup_msgs_left > 0 {
            let frame = if self.startup_msgs_left > LINKREADY_REPEATS {
                twc_messages::master_linkready1(self.own_id, self.own_sign)
            } else {
                twc_messages::master_linkready2(self.own_id, self.own_sign)
            };
            self.startup_msgs_left -= 1;
            if self.startup_msgs_left == 0 {
                info!("linkready burst complete; cruising as {}", self.own_id);
            }
            self.note_tx(now);
            return Some(frame);
        }

        if self.registry.is_empty() {
            return None;
        }
        if let Some(last) = self.last_tx_at {
            if now.saturating_sub(last) <= HEARTBEAT_INTERVAL_MS {
                return None;
            }
        }

        let len = self.registry.len();
        self.rr_index = (self.rr_index + 1) % len;
        let (id, rec) = self.registry.nth(self.rr_index)?;
        let (last_rx_at, last_req_max_ca, last_actual_ca) =
            (rec.last_rx_at, rec.last_req_max_ca, rec.last_actual_ca);

        if now.saturating_sub(last_rx_at) > SLAVE_TIMEOUT_MS {
            warn!(
                "slave {id} silent for {} ms; expiring it",
                now.saturating_sub(last_rx_at)
            );
            self.registry.remove(id);
            self.stats.slaves_expired =
                self.stats.slaves_expired.wrapping_add(1);
            return None;
        }

        let frame = if last_req_max_ca == AMPS_UNKNOWN {
            // No heartbeat from it yet; keep knocking.
            master_heartbeat(self.own_id, id, CMD_IDLE_ACK, 0, 0)
        } else {
            // Re-evaluate against the stored samples so power-source
            // changes propagate between the slave's own heartbeats.
            let others = self.registry.sum_req_max_ca_excluding(id);
            let rec = self.registry.get_mut(id)?;
            let committed = self.allocator.allocate(
                id,
                rec,
                now,
                last_actual_ca,
                &mut self.global_cap_ca,
                len,
                others,
            );
            master_heartbeat(self.own_id, id, CMD_SET_CAP, committed as u16, 0)
        };
        self.note_tx(now);
        Some(frame)
    }

    fn answer_heartbeat(
        &mut self,
        now: Millis,
        sender: TwcId,
        status: u8,
        req_max_ca: u16,
        actual_ca: u16,
    ) -> RawFrame {
        let others = self.registry.sum_req_max_ca_excluding(sender);
        let len = self.registry.len();
        let committed = match self.registry.get_mut(sender) {
            Some(rec) => {
                self.allocator.absorb_sample(
                    rec,
                    now,
                    status,
                    i32::from(req_max_ca),
                    i32::from(actual_ca),
                    others,
                );
                self.allocator.allocate(
                    sender,
                    rec,
                    now,
                    i32::from(actual_ca),
                    &mut self.global_cap_ca,
                    len,
                    others,
                )
            }
            // Caller checked membership.
            None => 0,
        };

        if committed as u16 != req_max_ca {
            master_heartbeat(
                self.own_id,
                sender,
                CMD_SET_CAP,
                committed as u16,
                0,
            )
        } else {
            // Steady state: the slave already requests what we allocated.
            master_heartbeat(self.own_id, sender, CMD_IDLE_ACK, 0, 0)
        }
    }

    fn id_conflict(&mut self) {
        self.stats.id_conflicts = self.stats.id_conflicts.wrapping_add(1);
        let old = self.own_id;
        let (id, sign) = random_identity(&mut self.rng, old);
        warn!(
            "own id {old} seen from another device; adopting {id} and \
             restarting the linkready burst"
        );
        self.own_id = id;
        self.own_sign = sign;
        self.startup_msgs_left = BURST_TOTAL;
    }

    fn note_tx(&mut self, now: Millis) {
        self.last_tx_at = Some(now);
        self.stats.tx_frames = self.stats.tx_frames.wrapping_add(1);
    }
}
