// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Impersonates a Tesla Wall Connector on an RS-485 bus.
//!
//! In master mode this throttles real slave wall connectors to whatever
//! the power source currently allows; in slave mode it is a diagnostic
//! peer for exercising a master without hardware.
//!
//! The scheduling model is a single cooperative loop: drain whatever bytes
//! the bus currently has, and only when no partial frame is buffered run
//! one unit of state-machine work (a linkready broadcast, one round-robin
//! heartbeat, or a power-source poll). The bus is half-duplex, so never
//! transmitting mid-frame is what keeps us from trampling a slave's
//! reply.

use std::process;
use std::thread;
use std::time::{Duration, Instant, SystemTime, UNIX_EPOCH};

use anyhow::{bail, Context, Result};
use clap::Parser;
use log::{info, warn};
use num_traits::FromPrimitive;

use drv_rs485_link::Rs485Link;
use twc_engine::master::MasterEngine;
use twc_engine::slave::SlaveEngine;
use twc_engine::Millis;
use twc_messages::{FrameAccumulator, RawFrame, Sign, SlaveStatus, TwcId};

mod power;
use power::{PowerSource, GREEN_POLL_INTERVAL_MS};

/// Pause after each transmission so the peer can turn the bus around.
const POST_TX_GAP: Duration = Duration::from_micros(100);

/// Backoff while the tail of a partially received frame is in flight.
const MID_FRAME_BACKOFF: Duration = Duration::from_micros(10);

/// Sleep when the bus is quiet and no state work fired; one byte time at
/// 9600 baud, so nothing can be missed.
const IDLE_SLEEP: Duration = Duration::from_millis(1);

#[derive(Debug, Parser)]
#[clap(
    name = "twc-comms",
    about = "Impersonate a Tesla Wall Connector master (or slave) \
             to regulate charging current"
)]
struct Args {
    /// Serial device wired to the RS-485 adapter.
    #[clap(long, default_value = "/dev/ttyUSB0")]
    device: String,

    /// Protocol role: "master" regulates real slaves, "slave" is the
    /// diagnostic mirror.
    #[clap(long, default_value = "master")]
    role: String,

    /// Hard limit of the installation's wiring, in whole amps. The sum of
    /// all per-slave caps never exceeds this.
    #[clap(long, default_value_t = 40)]
    wiring_cap_amps: i32,

    /// Our own TWC id, four hex digits.
    #[clap(long, default_value = "7777")]
    twc_id: String,

    /// Our sign byte, two hex digits.
    #[clap(long, default_value = "77")]
    sign: String,

    /// Command producing generation data (run through the shell); its
    /// output is scanned for a "Solar,<time>,-<kW>,…" line. Without it,
    /// only overrideMaxAmps.txt can raise the cap.
    #[clap(long)]
    green_energy_command: Option<String>,
}

/// Monotonic milliseconds since startup; the origin is arbitrary, only
/// differences matter to the engines.
struct Clock(Instant);

impl Clock {
    fn new() -> Self {
        Self(Instant::now())
    }

    fn now(&self) -> Millis {
        self.0.elapsed().as_millis() as Millis
    }
}

fn main() -> Result<()> {
    env_logger::Builder::from_env(
        env_logger::Env::default().default_filter_or("info"),
    )
    .init();

    let args = Args::parse();
    let own_id = TwcId(
        u16::from_str_radix(&args.twc_id, 16)
            .context("--twc-id must be four hex digits")?,
    );
    let own_sign = Sign(
        u8::from_str_radix(&args.sign, 16)
            .context("--sign must be two hex digits")?,
    );
    if args.wiring_cap_amps <= 0 {
        bail!("--wiring-cap-amps must be positive");
    }

    // The one fatal error: no bus, nothing to do.
    let link = Rs485Link::open(&args.device)
        .with_context(|| format!("opening serial device {}", args.device))?;

    match args.role.as_str() {
        "master" => run_master(link, &args, own_id, own_sign),
        "slave" => run_slave(link, &args, own_id, own_sign),
        other => bail!("unknown role {other:?} (expected master or slave)"),
    }
}

fn run_master(
    mut link: Rs485Link,
    args: &Args,
    own_id: TwcId,
    own_sign: Sign,
) -> Result<()> {
    let mut engine = MasterEngine::new(
        own_id,
        own_sign,
        args.wiring_cap_amps,
        entropy_seed(),
    );
    let power = PowerSource::new(args.green_energy_command.clone())
        .context("compiling solar parser")?;
    let clock = Clock::new();
    let mut acc = FrameAccumulator::new();
    let mut rx_invalid: u32 = 0;
    let mut last_green_poll: Option<Millis> = None;

    info!(
        "master {own_id} on {}, wiring cap {} A",
        args.device, args.wiring_cap_amps
    );

    loop {
        while let Some(byte) = link.try_rx_pop() {
            if let Some(result) = acc.push(byte) {
                match result {
                    Ok(frame) => {
                        if let Some(reply) =
                            engine.handle_frame(clock.now(), &frame)
                        {
                            transmit(&mut link, &reply);
                        }
                    }
                    Err(_) => rx_invalid = rx_invalid.wrapping_add(1),
                }
            }
        }
        if acc.mid_frame() {
            // The rest of the frame is on the wire; don't talk over it.
            thread::sleep(MID_FRAME_BACKOFF);
            continue;
        }

        let now = clock.now();
        if let Some(frame) = engine.poll(now) {
            transmit(&mut link, &frame);
            continue;
        }

        let green_due = match last_green_poll {
            None => true,
            Some(t) => now.saturating_sub(t) > GREEN_POLL_INTERVAL_MS,
        };
        if green_due {
            last_green_poll = Some(now);
            if let Some(cap_ca) = power.poll() {
                engine.set_global_cap_ca(cap_ca);
            }
            log_summary(&engine, rx_invalid);
            continue;
        }

        thread::sleep(IDLE_SLEEP);
    }
}

fn run_slave(
    mut link: Rs485Link,
    args: &Args,
    own_id: TwcId,
    own_sign: Sign,
) -> Result<()> {
    let mut engine = SlaveEngine::new(own_id, own_sign, entropy_seed());
    let clock = Clock::new();
    let mut acc = FrameAccumulator::new();

    info!("diagnostic slave {own_id} on {}", args.device);

    loop {
        while let Some(byte) = link.try_rx_pop() {
            if let Some(result) = acc.push(byte) {
                if let Ok(frame) = result {
                    if let Some(reply) =
                        engine.handle_frame(clock.now(), &frame)
                    {
                        transmit(&mut link, &reply);
                    }
                }
            }
        }
        if acc.mid_frame() {
            thread::sleep(MID_FRAME_BACKOFF);
            continue;
        }

        if let Some(frame) = engine.poll(clock.now()) {
            transmit(&mut link, &frame);
            continue;
        }

        thread::sleep(IDLE_SLEEP);
    }
}

fn transmit(link: &mut Rs485Link, frame: &RawFrame) {
    if let Err(e) = link.write_frame(&frame.to_wire()) {
        // Not fatal: peers re-announce themselves on silence.
        warn!("failed to write frame: {e}");
    }
    thread::sleep(POST_TX_GAP);
}

fn log_summary(engine: &MasterEngine, rx_invalid: u32) {
    let stats = engine.stats();
    info!(
        "stats: rx {} (invalid {}, unknown {}, unknown-slave {}) tx {} \
         expired {} evicted {} conflicts {} cap {} cA",
        stats.rx_frames,
        rx_invalid,
        stats.rx_unknown,
        stats.rx_unknown_slave,
        stats.tx_frames,
        stats.slaves_expired,
        stats.slaves_evicted,
        stats.id_conflicts,
        engine.global_cap_ca(),
    );
    for (id, rec) in engine.registry().iter() {
        info!(
            "slave {id}: cap {} cA, drawing {} cA, status {:?}",
            rec.last_req_max_ca,
            rec.last_actual_ca,
            SlaveStatus::from_u8(rec.last_status),
        );
    }
}

fn entropy_seed() -> u64 {
    let nanos = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_nanos() as u64)
        .unwrap_or(0);
    nanos ^ (u64::from(process::id()) << 32)
}
