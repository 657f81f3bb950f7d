// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! The slave registry: a fixed-size, insertion-ordered map of the slaves
//! the master currently services.
//!
//! Real buses carry at most three slaves, so the registry is a flat array
//! with no allocation. Insertion order is preserved across removals; when a
//! fourth slave announces itself, the first-inserted entry is evicted.

use log::warn;

use twc_messages::TwcId;

use crate::Millis;

/// The protocol supports at most this many slaves per master.
pub const MAX_SLAVES: usize = 3;

/// Sentinel for the amp fields of a slave we have not heard a heartbeat
/// from yet.
pub const AMPS_UNKNOWN: i32 = -1;

/// Everything the master remembers about one slave.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct SlaveRecord {
    /// When the last valid frame from this slave arrived.
    pub last_rx_at: Millis,
    /// The committed permitted-max for this slave in centi-amps;
    /// [`AMPS_UNKNOWN`] until its first heartbeat.
    pub last_req_max_ca: i32,
    /// The last significant actual-draw sample in centi-amps;
    /// [`AMPS_UNKNOWN`] until the first sample.
    pub last_actual_ca: i32,
    /// The status byte from the slave's most recent heartbeat.
    pub last_status: u8,
    /// When `last_req_max_ca` last changed; `None` until the first change
    /// after seeding, so a fresh record does not trip the anti-flap holds.
    pub last_req_max_changed_at: Option<Millis>,
    /// When `last_actual_ca` last moved by more than the jitter threshold.
    pub last_actual_changed_at: Option<Millis>,
}

impl SlaveRecord {
    fn new(now: Millis) -> Self {
        Self {
            last_rx_at: now,
            last_req_max_ca: AMPS_UNKNOWN,
            last_actual_ca: AMPS_UNKNOWN,
            last_status: 0,
            last_req_max_changed_at: None,
            last_actual_changed_at: None,
        }
    }
}

#[derive(Default)]
pub struct SlaveRegistry {
    slots: [Option<(TwcId, SlaveRecord)>; MAX_SLAVES],
}

impl SlaveRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.slots.iter().filter(|s| s.is_some()).count()
    }

    pub fn is_empty(&self) -> bool {
        self.slots[0].is_none()
    }

    /// Admits `id`, evicting the oldest entry if the registry is full.
    /// Idempotent for known ids: the existing record (including its
    /// `last_rx_at`) is left untouched. Returns the evicted id, if any.
    pub fn upsert(&mut self, id: TwcId, now: Millis) -> Option<TwcId> {
        if self.get(id).is_some() {
            return None;
        }

        let mut evicted = None;
        if self.slots[MAX_SLAVES - 1].is_some() {
            if let Some((old, _)) = self.slots[0].take() {
                warn!("registry full; evicting oldest slave {old} for {id}");
                evicted = Some(old);
            }
            self.compact();
        }

        for slot in self.slots.iter_mut() {
            if slot.is_none() {
                *slot = Some((id, SlaveRecord::new(now)));
                return evicted;
            }
        }
        // Unreachable: a slot was freed above if none was empty.
        evicted
    }

    pub fn get(&self, id: TwcId) -> Option<&SlaveRecord> {
        self.slots.iter().flatten().find_map(|(k, rec)| {
            if *k == id {
                Some(rec)
            } else {
                None
            }
        })
    }

    pub fn get_mut(&mut self, id: TwcId) -> Option<&mut SlaveRecord> {
        self.slots.iter_mut().flatten().find_map(|(k, rec)| {
            if *k == id {
                Some(rec)
            } else {
                None
            }
        })
    }

    /// Removes `id`, preserving the insertion order of the remaining
    /// entries. Returns whether the id was present.
    pub fn remove(&mut self, id: TwcId) -> bool {
        let mut found = false;
        for slot in self.slots.iter_mut() {
            if let Some((k, _)) = slot {
                if *k == id {
                    *slot = None;
                    found = true;
                    break;
                }
            }
        }
        if found {
            self.compact();
        }
        found
    }

    /// The `i`-th entry in insertion order, for round-robin scheduling.
    pub fn nth(&self, i: usize) -> Option<(TwcId, &SlaveRecord)> {
        self.slots
            .iter()
            .flatten()
            .nth(i)
            .map(|(id, rec)| (*id, rec))
    }

    pub fn iter(&self) -> impl Iterator<Item = (TwcId, &SlaveRecord)> {
        self.slots.iter().flatten().map(|(id, rec)| (*id, rec))
    }

    /// Sum of committed per-slave maximums in centi-amps, with unknown
    /// (sentinel) values counted as zero.
    pub fn sum_req_max_ca(&self) -> i32 {
        self.iter()
            .map(|(_, rec)| rec.last_req_max_ca.max(0))
            .sum()
    }

    /// As [`Self::sum_req_max_ca`], excluding one slave — used to test a
    /// candidate value for that slave against the wiring cap.
    pub fn sum_req_max_ca_excluding(&self, id: TwcId) -> i32 {
        self.iter()
            .filter(|(k, _)| *k != id)
            .map(|(_, rec)| rec.last_req_max_ca.max(0))
            .sum()
    }

    fn compact(&mut self) {
        for i in 0..MAX_SLAVES - 1 {
            if self.slots[i].is_none() {
                for j in i + 1..MAX_SLAVES {
                    if self.slots[j].is_some() {
                        self.slots[i] = self.slots[j].take();
                        break;
                    }
                }
            }
        }
    }
}
