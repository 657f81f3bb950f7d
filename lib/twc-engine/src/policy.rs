// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Per-slave current allocation.
//!
//! Each slave's permitted maximum is its fair share of the global cap,
//! filtered through three guards that exist to protect the car and the
//! contactor rather than the wiring:
//!
//! - a 60 s hold in both directions around zero, so a cloud passing over
//!   the array does not cycle the contactor;
//! - a 21.00 A spike when raising the cap from below that level. Slave
//!   firmware has a bug where a cap raised without first holding at least
//!   21.00 A for 10 s makes the car droop to roughly 5.2 A;
//! - a 10 s floor between consecutive reductions, which also guarantees
//!   the spike above is held long enough.
//!
//! The wiring cap is enforced last and unconditionally: a candidate that
//! would push the sum of all committed maximums past the wiring is thrown
//! away and the previous value kept.

use log::{error, warn};

use twc_messages::TwcId;

use crate::registry::{SlaveRecord, AMPS_UNKNOWN};
use crate::Millis;

/// Fair shares below 5.00 A are not worth charging at; tell the car to
/// stop instead.
pub const STOP_THRESHOLD_CA: i32 = 500;

/// Cap value that works around the slave firmware raise bug; see module
/// docs.
pub const SPIKE_CA: i32 = 2100;

/// Actual draw below 4.00 A means the car has not ramped up yet.
pub const LOW_DRAW_CA: i32 = 400;

/// Changes of actual draw below this are meter jitter, not car behavior.
pub const ACTUAL_JITTER_CA: i32 = 80;

/// A slave drawing this much less than its cap is not limited by us.
pub const DROOP_GAP_CA: i32 = 100;

/// The on/off anti-flap window.
pub const FLAP_HOLD_MS: Millis = 60_000;

/// Minimum time between consecutive reductions.
pub const REDUCE_HOLD_MS: Millis = 10_000;

/// How long the actual draw must be stable before it is trusted for the
/// spike decision.
pub const SPIKE_SETTLE_MS: Millis = 10_000;

pub struct Allocator {
    /// Hard upper bound from the installation's wiring, in whole amps.
    pub wiring_cap_a: i32,
}

impl Allocator {
    pub fn new(wiring_cap_a: i32) -> Self {
        Self { wiring_cap_a }
    }

    pub fn wiring_cap_ca(&self) -> i32 {
        self.wiring_cap_a * 100
    }

    /// Folds a heartbeat sample into the record: refreshes liveness, seeds
    /// the committed maximum from the slave's own report on first contact,
    /// and tracks significant movement of the actual draw.
    ///
    /// The seed is clamped to the headroom left by the other slaves
    /// (`others_sum_ca`): a slave rejoining after a restart may still
    /// report a maximum granted under different conditions, and adopting
    /// it verbatim could push the total past the wiring cap with no later
    /// step allowed to reduce it back.
    pub fn absorb_sample(
        &self,
        rec: &mut SlaveRecord,
        now: Millis,
        status: u8,
        req_max_ca: i32,
        actual_ca: i32,
        others_sum_ca: i32,
    ) {
        rec.last_rx_at = now;
        rec.last_status = status;
        if rec.last_req_max_ca == AMPS_UNKNOWN {
            rec.last_req_max_ca = req_max_ca
                .min(self.wiring_cap_ca() - others_sum_ca)
                .max(0);
        }
        if rec.last_actual_ca == AMPS_UNKNOWN
            || (actual_ca - rec.last_actual_ca).abs() > ACTUAL_JITTER_CA
        {
            rec.last_actual_ca = actual_ca;
            rec.last_actual_changed_at = Some(now);
        }
    }

    /// Computes and commits the slave's next permitted maximum, returning
    /// it in centi-amps. `actual_ca` is the most recent draw sample,
    /// `others_sum_ca` the committed maximums of every other slave.
    pub fn allocate(
        &self,
        id: TwcId,
        rec: &mut SlaveRecord,
        now: Millis,
        actual_ca: i32,
        global_cap_ca: &mut i32,
        registry_len: usize,
        others_sum_ca: i32,
    ) -> i32 {
        if *global_cap_ca > self.wiring_cap_ca() {
            warn!(
                "global cap {} cA exceeds wiring cap; clamping to {} cA",
                *global_cap_ca,
                self.wiring_cap_ca()
            );
            *global_cap_ca = self.wiring_cap_ca();
        }

        let prev = rec.last_req_max_ca;
        let fair = *global_cap_ca / registry_len.max(1) as i32;

        let mut desired = if fair < STOP_THRESHOLD_CA {
            let held_recently = within(rec.last_req_max_changed_at, now, FLAP_HOLD_MS)
                || within(rec.last_actual_changed_at, now, FLAP_HOLD_MS)
                || actual_ca < LOW_DRAW_CA;
            if prev > 0 && held_recently {
                prev
            } else {
                0
            }
        } else {
            // Cars only resolve whole amps; snap down.
            let snapped = (fair / 100) * 100;
            let actual_settled = rec
                .last_actual_changed_at
                .map_or(true, |t| now.saturating_sub(t) > SPIKE_SETTLE_MS);

            if prev == 0
                && within(rec.last_req_max_changed_at, now, FLAP_HOLD_MS)
            {
                0
            } else if snapped < SPIKE_CA
                && (snapped > prev
                    || (prev - actual_ca > DROOP_GAP_CA && actual_settled))
            {
                SPIKE_CA
            } else if snapped < prev
                && within(rec.last_req_max_changed_at, now, REDUCE_HOLD_MS)
            {
                prev
            } else {
                snapped
            }
        };

        if others_sum_ca + desired.max(0) > self.wiring_cap_ca() {
            error!(
                "refusing cap {} cA for slave {id}: total would exceed \
                 wiring cap {} cA",
                desired,
                self.wiring_cap_ca()
            );
            desired = prev;
        }

        if desired != rec.last_req_max_ca {
            rec.last_req_max_ca = desired;
            rec.last_req_max_changed_at = Some(now);
        }
        desired
    }
}

fn within(changed_at: Option<Millis>, now: Millis, window: Millis) -> bool {
    matches!(changed_at, Some(t) if now.saturating_sub(t) < window)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::registry::SlaveRegistry;

    const ID: TwcId = TwcId(0xabcd);

    fn record_with(
        req_max_ca: i32,
        req_changed_at: Option<Millis>,
        actual_ca: i32,
        actual_changed_at: Option<Millis>,
    ) -> SlaveRecord {
        let mut reg = SlaveRegistry::new();
        reg.upsert(ID, 0);
        let mut rec = *reg.get(ID).unwrap();
        rec.last_req_max_ca = req_max_ca;
        rec.last_req_max_changed_at = req_changed_at;
        rec.last_actual_ca = actual_ca;
        rec.last_actual_changed_at = actual_changed_at;
        rec
    }

    #[test]
    fn first_heartbeat_gets_full_share() {
        let alloc = Allocator::new(40);
        let mut reg = SlaveRegistry::new();
        reg.upsert(ID, 1_000);
        let rec = reg.get_mut(ID).unwrap();

        alloc.absorb_sample(rec, 2_000, 0x04, 0, 25, 0);
        assert_eq!(rec.last_req_max_ca, 0);
        assert_eq!(rec.last_actual_ca, 25);
        // Seeding must not arm the off-hold.
        assert_eq!(rec.last_req_max_changed_at, None);

        let mut global = 4_000;
        let got = alloc.allocate(ID, rec, 2_000, 25, &mut global, 1, 0);
        assert_eq!(got, 4_000);
        assert_eq!(rec.last_req_max_changed_at, Some(2_000));
    }

    #[test]
    fn off_hold_keeps_zero_for_sixty_seconds() {
        let alloc = Allocator::new(40);
        // Stopped 30 s ago; generation has recovered to 30.00 A.
        let mut rec = record_with(0, Some(0), 0, Some(0));
        let mut global = 3_000;
        assert_eq!(
            alloc.allocate(ID, &mut rec, 30_000, 0, &mut global, 1, 0),
            0
        );
        // The hold does not extend itself.
        assert_eq!(rec.last_req_max_changed_at, Some(0));

        // Past the window the cap comes back, snapped to the whole amp.
        assert_eq!(
            alloc.allocate(ID, &mut rec, 61_000, 0, &mut global, 1, 0),
            3_000
        );
        assert_eq!(rec.last_req_max_changed_at, Some(61_000));
    }

    #[test]
    fn off_hold_applies_across_spike_range() {
        // With a recent transition to zero, every share in [5.00 A, 21.00 A)
        // still replies zero; the firmware-bug spike must not override the
        // off-hold.
        let alloc = Allocator::new(40);
        for desired in (500..2_100).step_by(100) {
            let mut rec = record_with(0, Some(0), 0, Some(0));
            let mut global = desired;
            assert_eq!(
                alloc.allocate(ID, &mut rec, 30_000, 0, &mut global, 1, 0),
                0,
                "desired {desired}",
            );
        }
    }

    #[test]
    fn raising_from_below_spike_goes_through_twenty_one_amps() {
        let alloc = Allocator::new(40);
        let mut rec = record_with(1_000, Some(0), 800, Some(0));
        let mut global = 1_500;
        assert_eq!(
            alloc.allocate(ID, &mut rec, 100_000, 800, &mut global, 1, 0),
            SPIKE_CA
        );
    }

    #[test]
    fn drooping_slave_is_respiked_once_draw_settles() {
        let alloc = Allocator::new(40);
        // Cap 18.00 A but the car droops at 5.20 A, stable for 11 s.
        let mut rec = record_with(1_800, Some(0), 520, Some(0));
        let mut global = 1_800;
        assert_eq!(
            alloc.allocate(ID, &mut rec, 11_001, 520, &mut global, 1, 0),
            SPIKE_CA
        );

        // While the draw is still moving, leave it alone.
        let mut rec = record_with(1_800, Some(0), 520, Some(5_000));
        assert_eq!(
            alloc.allocate(ID, &mut rec, 11_001, 520, &mut global, 1, 0),
            1_800
        );
    }

    #[test]
    fn reductions_are_throttled_to_ten_seconds() {
        let alloc = Allocator::new(40);
        let mut rec = record_with(3_200, Some(0), 3_150, Some(0));
        let mut global = 1_500;

        // 3 s after the last change the reduction is held back.
        assert_eq!(
            alloc.allocate(ID, &mut rec, 3_000, 3_150, &mut global, 1, 0),
            3_200
        );
        assert_eq!(rec.last_req_max_changed_at, Some(0));

        // Once 10 s have passed it goes through.
        assert_eq!(
            alloc.allocate(ID, &mut rec, 10_001, 3_150, &mut global, 1, 0),
            1_500
        );
        assert_eq!(rec.last_req_max_changed_at, Some(10_001));
    }

    #[test]
    fn exactly_five_amps_is_over_threshold() {
        let alloc = Allocator::new(40);
        let mut rec = record_with(400, None, 380, Some(0));
        let mut global = STOP_THRESHOLD_CA;
        assert_eq!(
            alloc.allocate(ID, &mut rec, 100_000, 380, &mut global, 1, 0),
            // 5.00 A is below the spike level and a raise from 4.00 A.
            SPIKE_CA
        );
    }

    #[test]
    fn under_threshold_stops_unless_held() {
        let alloc = Allocator::new(40);

        // No recent changes, car drawing properly: stop.
        let mut rec = record_with(600, Some(0), 600, Some(0));
        let mut global = 400;
        assert_eq!(
            alloc.allocate(ID, &mut rec, 200_000, 600, &mut global, 1, 0),
            0
        );

        // Recent cap change: hold the previous value.
        let mut rec = record_with(600, Some(170_000), 600, Some(0));
        assert_eq!(
            alloc.allocate(ID, &mut rec, 200_000, 600, &mut global, 1, 0),
            600
        );

        // Car still waking up (draw under 4.00 A): hold.
        let mut rec = record_with(600, Some(0), 100, Some(0));
        assert_eq!(
            alloc.allocate(ID, &mut rec, 200_000, 100, &mut global, 1, 0),
            600
        );
    }

    #[test]
    fn wiring_cap_violation_reverts() {
        let alloc = Allocator::new(40);
        // Another slave already holds 32.00 A; our share would be 16.00 A
        // but raising through the 21.00 A spike would blow the wiring cap.
        let mut rec = record_with(800, Some(0), 780, Some(0));
        let mut global = 3_200;
        assert_eq!(
            alloc.allocate(ID, &mut rec, 100_000, 780, &mut global, 2, 3_200),
            800
        );
        // Reverted, so the change timestamp must not move.
        assert_eq!(rec.last_req_max_changed_at, Some(0));
    }

    #[test]
    fn global_cap_is_clamped_to_wiring() {
        let alloc = Allocator::new(10);
        let mut rec = record_with(1_000, Some(0), 990, Some(0));
        let mut global = 99_000;
        let got = alloc.allocate(ID, &mut rec, 100_000, 990, &mut global, 1, 0);
        assert_eq!(global, 1_000);
        assert_eq!(got, 1_000);
    }

    #[test]
    fn seed_is_clamped_to_remaining_headroom() {
        let alloc = Allocator::new(40);
        let mut reg = SlaveRegistry::new();
        reg.upsert(ID, 0);
        let rec = reg.get_mut(ID).unwrap();

        // A rejoining slave still reports the 32.00 A it was granted in a
        // previous life, but other slaves already hold 30.00 A.
        alloc.absorb_sample(rec, 1_000, 0x01, 3_200, 3_100, 3_000);
        assert_eq!(rec.last_req_max_ca, 1_000);
    }

    #[test]
    fn jitter_does_not_count_as_draw_change() {
        let alloc = Allocator::new(40);
        let mut rec = record_with(1_600, Some(0), 1_500, Some(0));
        alloc.absorb_sample(&mut rec, 50_000, 0x01, 1_600, 1_560, 0);
        assert_eq!(rec.last_actual_ca, 1_500);
        assert_eq!(rec.last_actual_changed_at, Some(0));

        alloc.absorb_sample(&mut rec, 51_000, 0x01, 1_600, 1_581, 0);
        assert_eq!(rec.last_actual_ca, 1_581);
        assert_eq!(rec.last_actual_changed_at, Some(51_000));
    }
}
