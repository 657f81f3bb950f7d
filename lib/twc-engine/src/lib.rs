// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Protocol engines for a TWC load-sharing bus.
//!
//! [`master::MasterEngine`] impersonates a wall connector in master mode
//! and regulates how much current each real slave may deliver;
//! [`slave::SlaveEngine`] is its diagnostic mirror. Both are pure state
//! machines: bytes come in as validated frames, replies come back as
//! frames to transmit, and every timestamp is injected by the caller, so
//! the 26 s expiry, 60 s anti-flap holds and 10 s reduction throttle can
//! all be driven deterministically from tests.
//!
//! Nothing here performs I/O, reads a clock, or allocates.

#![cfg_attr(not(test), no_std)]

pub mod master;
pub mod policy;
pub mod registry;
pub mod slave;

use rand_core::{RngCore, SeedableRng};

use twc_messages::{Sign, TwcId};

/// Milliseconds from an arbitrary monotonic origin chosen by the caller.
pub type Millis = u64;

pub(crate) type Rng = rand_chacha::ChaCha8Rng;

pub(crate) fn seed_rng(seed: u64) -> Rng {
    Rng::seed_from_u64(seed)
}

/// Draws a fresh identity, guaranteed different from `old`.
pub(crate) fn random_identity(rng: &mut Rng, old: TwcId) -> (TwcId, Sign) {
    loop {
        let r = rng.next_u32();
        let id = TwcId(r as u16);
        if id != old && id != TwcId::BROADCAST {
            return (id, Sign((r >> 16) as u8));
        }
    }
}
