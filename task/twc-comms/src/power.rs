// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! The power source: where the global current cap comes from.
//!
//! Precedence per poll:
//!
//! 1. `overrideMaxAmps.txt` in the working directory — a single
//!    non-negative integer in centi-amps. Lets an operator pin the cap
//!    without restarting anything.
//! 2. During daylight hours, an external command whose output carries a
//!    `Solar,<timestamp>,-<float>,…` line, the float being exported
//!    kilowatts. The command gets a 4 s deadline; a hung or garbled meter
//!    leaves the cap exactly where it was.
//! 3. Otherwise: no update.

use std::fs;
use std::io::Read;
use std::process::{Command, Stdio};
use std::thread;
use std::time::{Duration, Instant};

use chrono::{Local, Timelike};
use log::{debug, warn};
use regex::Regex;

/// How often the scheduling loop may invoke [`PowerSource::poll`].
pub const GREEN_POLL_INTERVAL_MS: u64 = 60_000;

const OVERRIDE_FILE: &str = "overrideMaxAmps.txt";

/// Deadline for the external generation command.
const SOLAR_DEADLINE: Duration = Duration::from_secs(4);

const SOLAR_WAIT_GRANULARITY: Duration = Duration::from_millis(50);

/// Nominal mains voltage used to convert exported watts to amps.
const MAINS_VOLTAGE: f64 = 240.0;

/// The solar query only runs between these local hours; outside them the
/// answer is known to be zero and not worth a subprocess.
const DAY_START_HOUR: u32 = 6;
const DAY_END_HOUR: u32 = 20;

pub struct PowerSource {
    command: Option<String>,
    solar_re: Regex,
}

impl PowerSource {
    pub fn new(command: Option<String>) -> Result<Self, regex::Error> {
        Ok(Self {
            command,
            solar_re: Regex::new(r"^Solar,[^,]*,-([0-9]+(?:\.[0-9]+)?)")?,
        })
    }

    /// Returns the new global cap in centi-amps, or `None` to leave the
    /// current one unchanged.
    pub fn poll(&self) -> Option<i32> {
        match fs::read_to_string(OVERRIDE_FILE) {
            Ok(contents) => {
                let first = contents.lines().next().unwrap_or("").trim();
                match first.parse::<i32>() {
                    Ok(n) if n >= 0 => {
                        debug!("{OVERRIDE_FILE} pins the cap at {n} cA");
                        return Some(n);
                    }
                    _ => {
                        warn!(
                            "{OVERRIDE_FILE} does not hold a non-negative \
                             integer; ignoring it"
                        );
                    }
                }
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => warn!("failed to read {OVERRIDE_FILE}: {e}"),
        }

        let hour = Local::now().hour();
        if !(DAY_START_HOUR..DAY_END_HOUR).contains(&hour) {
            return None;
        }

        let command = self.command.as_deref()?;
        let output = run_with_deadline(command, SOLAR_DEADLINE)?;
        self.parse_solar(&output)
    }

    fn parse_solar(&self, output: &str) -> Option<i32> {
        for line in output.lines() {
            if let Some(caps) = self.solar_re.captures(line) {
                if let Ok(kw) = caps[1].parse::<f64>() {
                    let cap_ca =
                        ((kw * 1000.0 / MAINS_VOLTAGE) * 100.0).floor() as i32;
                    debug!("solar export {kw} kW -> cap {cap_ca} cA");
                    return Some(cap_ca);
                }
            }
        }
        warn!("no Solar line in generation data; leaving cap unchanged");
        None
    }
}

/// Runs `command` through the shell, returning its stdout, or `None` if it
/// failed to finish within `deadline`.
fn run_with_deadline(command: &str, deadline: Duration) -> Option<String> {
    let mut child = match Command::new("sh")
        .arg("-c")
        .arg(command)
        .stdout(Stdio::piped())
        .stderr(Stdio::null())
        .spawn()
    {
        Ok(child) => child,
        Err(e) => {
            warn!("failed to spawn generation command: {e}");
            return None;
        }
    };

    let started = Instant::now();
    loop {
        match child.try_wait() {
            Ok(Some(status)) => {
                if !status.success() {
                    warn!("generation command exited with {status}");
                }
                let mut out = String::new();
                if let Some(mut stdout) = child.stdout.take() {
                    let _ = stdout.read_to_string(&mut out);
                }
                return Some(out);
            }
            Ok(None) => {
                if started.elapsed() >= deadline {
                    warn!(
                        "generation command still running after {} s; \
                         killing it",
                        deadline.as_secs()
                    );
                    let _ = child.kill();
                    let _ = child.wait();
                    return None;
                }
                thread::sleep(SOLAR_WAIT_GRANULARITY);
            }
            Err(e) => {
                warn!("failed to wait for generation command: {e}");
                let _ = child.kill();
                let _ = child.wait();
                return None;
            }
        }
    }
}
