/*
 * Copyright (C) 2021 Evtech Solutions, Ltd., dba 3D-P
 * Copyright (C) 2021 Neil Tallim <neiltallim@3d-p.com>
 *
 * This file is part of udprobe.
 *
 * udprobe is free software: you can redistribute it and/or modify
 * it under the terms of the GNU General Public License as published by
 * the Free Software Foundation, either version 3 of the License, or
 * (at your option) any later version.
 *
 * udprobe is distributed in the hope that it will be useful,
 * but WITHOUT ANY WARRANTY; without even the implied warranty of
 * MERCHANTABILITY or FITNESS FOR A PARTICULAR PURPOSE.  See the
 * GNU General Public License for more details.
 *
 * You should have received a copy of the GNU General Public License
 * along with udprobe.  If not, see <https://www.gnu.org/licenses/>.
 */

use std::fmt;
use std::ops::{Add, AddAssign};
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use nix::sys::time::TimeSpec;
use nix::time::{clock_getres, clock_gettime, ClockId};

const NANOS_PER_SEC: u32 = 1_000_000_000;

/// a point in time on one of the kernel's clocks, as whole seconds plus nanoseconds
///
/// the nanosecond part is always normalised into `0..1_000_000_000`, so the derived
/// ordering matches chronological ordering
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash, serde::Serialize)]
pub struct Timestamp {
    secs: i64,
    nanos: u32,
}
impl Timestamp {
    pub fn new(secs: i64, nanos: u32) -> Timestamp {
        Timestamp {
            secs: secs + (nanos / NANOS_PER_SEC) as i64,
            nanos: nanos % NANOS_PER_SEC,
        }
    }

    pub fn from_secs(secs: i64) -> Timestamp {
        Timestamp { secs, nanos: 0 }
    }

    pub fn secs(&self) -> i64 {
        self.secs
    }

    pub fn nanos(&self) -> u32 {
        self.nanos
    }

    /// the time elapsed between `sent` and this timestamp
    ///
    /// the result keeps a non-negative sub-second part, borrowing one second whenever
    /// this timestamp's fraction is smaller than the sender's
    pub fn round_trip_since(&self, sent: &Timestamp) -> RoundTrip {
        let mut secs = self.secs - sent.secs;
        let mut nanos = self.nanos as i64 - sent.nanos as i64;
        if nanos < 0 {
            nanos += NANOS_PER_SEC as i64;
            secs -= 1;
        }
        RoundTrip {
            secs,
            nanos: nanos as u32,
        }
    }

    pub fn as_secs_f64(&self) -> f64 {
        self.secs as f64 + self.nanos as f64 / NANOS_PER_SEC as f64
    }

    pub fn to_timespec(&self) -> TimeSpec {
        TimeSpec::new(self.secs as _, self.nanos as _)
    }

    /// renders a realtime-clock timestamp as local wall-clock time, `HH:MM:SS.ffffff`
    pub fn format_local(&self) -> String {
        match chrono::DateTime::from_timestamp(self.secs, self.nanos) {
            Some(utc) => utc.with_timezone(&chrono::Local).format("%T%.6f").to_string(),
            None => format!("{}", self),
        }
    }

    pub fn wall_clock() -> Timestamp {
        match SystemTime::now().duration_since(UNIX_EPOCH) {
            Ok(since_epoch) => Timestamp::new(since_epoch.as_secs() as i64, since_epoch.subsec_nanos()),
            Err(_) => Timestamp::default(),
        }
    }
}
impl Add<Duration> for Timestamp {
    type Output = Timestamp;

    fn add(self, delay: Duration) -> Timestamp {
        let mut secs = self.secs + delay.as_secs() as i64;
        let mut nanos = self.nanos + delay.subsec_nanos();
        if nanos >= NANOS_PER_SEC {
            secs += 1;
            nanos -= NANOS_PER_SEC;
        }
        Timestamp { secs, nanos }
    }
}
impl AddAssign<Duration> for Timestamp {
    fn add_assign(&mut self, delay: Duration) {
        *self = *self + delay;
    }
}
impl From<TimeSpec> for Timestamp {
    fn from(time: TimeSpec) -> Timestamp {
        Timestamp::new(time.tv_sec() as i64, time.tv_nsec() as u32)
    }
}
impl fmt::Display for Timestamp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{:09}", self.secs, self.nanos)
    }
}

/// a round-trip time: signed whole seconds plus a normalised, non-negative fraction
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, serde::Serialize)]
pub struct RoundTrip {
    secs: i64,
    nanos: u32,
}
impl RoundTrip {
    pub fn secs(&self) -> i64 {
        self.secs
    }

    pub fn nanos(&self) -> u32 {
        self.nanos
    }

    pub fn as_nanos(&self) -> i128 {
        self.secs as i128 * NANOS_PER_SEC as i128 + self.nanos as i128
    }

    pub fn as_millis_f64(&self) -> f64 {
        self.as_nanos() as f64 / 1_000_000.0
    }
}
impl fmt::Display for RoundTrip {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let total = self.as_nanos();
        let sign = if total < 0 { "-" } else { "" };
        let magnitude = total.unsigned_abs();
        write!(
            f,
            "{}{}.{:09}",
            sign,
            magnitude / NANOS_PER_SEC as u128,
            magnitude % NANOS_PER_SEC as u128
        )
    }
}

/// the kernel clock against which packets are scheduled
#[derive(Debug, Copy, Clone, Default, PartialEq, Eq, clap::ValueEnum)]
pub enum ClockSource {
    #[default]
    Monotonic,
    Realtime,
}
impl ClockSource {
    pub fn clock_id(&self) -> ClockId {
        match self {
            ClockSource::Monotonic => ClockId::CLOCK_MONOTONIC,
            ClockSource::Realtime => ClockId::CLOCK_REALTIME,
        }
    }
}
impl fmt::Display for ClockSource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ClockSource::Monotonic => write!(f, "monotonic"),
            ClockSource::Realtime => write!(f, "realtime"),
        }
    }
}

/// time source and absolute-deadline sleeper used by the sender loop
pub trait Clock {
    /// the current time on the scheduling clock
    fn now(&self) -> Timestamp;
    /// blocks until the scheduling clock reaches `deadline`; returns immediately if it already has
    fn sleep_until(&self, deadline: Timestamp);
    /// the current realtime-clock time, as embedded in outgoing packets
    fn wall_time(&self) -> Timestamp;
}

pub struct SystemClock {
    source: ClockSource,
}
impl SystemClock {
    pub fn new(source: ClockSource) -> SystemClock {
        SystemClock { source }
    }

    pub fn source(&self) -> ClockSource {
        self.source
    }
}
impl Clock for SystemClock {
    fn now(&self) -> Timestamp {
        read_clock(self.source.clock_id())
    }

    fn sleep_until(&self, deadline: Timestamp) {
        cfg_if::cfg_if! {
            if #[cfg(any(target_os = "linux", target_os = "android", target_os = "freebsd"))] {
                use nix::errno::Errno;
                use nix::time::{clock_nanosleep, ClockNanosleepFlags};

                let request = deadline.to_timespec();
                loop {
                    match clock_nanosleep(self.source.clock_id(), ClockNanosleepFlags::TIMER_ABSTIME, &request) {
                        Ok(_) => break,
                        Err(Errno::EINTR) => continue, //absolute deadlines make resumption exact
                        Err(e) => {
                            log::warn!("absolute sleep on {} clock failed: {}", self.source, e);
                            break;
                        },
                    }
                }
            } else { //NOTE: no absolute-time sleep available; approximate with a relative one
                let now = self.now();
                if deadline > now {
                    let remaining = deadline.round_trip_since(&now);
                    std::thread::sleep(Duration::new(remaining.secs() as u64, remaining.nanos()));
                }
            }
        }
    }

    fn wall_time(&self) -> Timestamp {
        read_clock(ClockId::CLOCK_REALTIME)
    }
}

fn read_clock(clock_id: ClockId) -> Timestamp {
    match clock_gettime(clock_id) {
        Ok(spec) => Timestamp::from(spec),
        Err(e) => {
            log::warn!("unable to read clock {:?}: {}; using system time", clock_id, e);
            Timestamp::wall_clock()
        },
    }
}

/// emits the kernel's resolution for the selected clock
pub fn log_resolution(source: ClockSource) {
    match clock_getres(source.clock_id()) {
        Ok(resolution) => log::info!("kernel {} clock resolution: {}", source, Timestamp::from(resolution)),
        Err(e) => log::warn!("could not get {} clock resolution: {}", source, e),
    }
}
