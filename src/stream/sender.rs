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

use std::io;
use std::net::UdpSocket;
use std::time::Duration;

use crate::generator::ring::PacketRing;
use crate::generator::runtime::RefillHandle;
use crate::protocol::header;
use crate::utils::clock::{Clock, Timestamp};
use crate::utils::shutdown::ShutdownToken;

/// anything the sender can hand a finished datagram to
pub trait DatagramSink {
    fn send_datagram(&self, datagram: &[u8]) -> io::Result<usize>;
}
impl DatagramSink for UdpSocket {
    fn send_datagram(&self, datagram: &[u8]) -> io::Result<usize> {
        self.send(datagram)
    }
}

/// when a session starts and what ends it
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Schedule {
    /// absolute start on the scheduling clock; `None` starts immediately
    pub start: Option<Timestamp>,
    pub duration: Duration,
    /// stop after this many packets even if time remains
    pub count: Option<u64>,
}
impl Default for Schedule {
    fn default() -> Schedule {
        Schedule {
            start: None,
            duration: Duration::from_secs(1),
            count: None,
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SessionReport {
    pub packets_sent: u64,
    pub send_failures: u64,
    /// the generator fell a full lap behind and the session was cut short
    pub underrun: bool,
    pub last_sequence: Option<u32>,
    pub echoes_received: u64,
    /// packets cut down because the generator described more bytes than its `max_size`
    pub truncated: u64,
}
impl std::fmt::Display for SessionReport {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{} packets sent, {} send failures", self.packets_sent, self.send_failures)?;
        if self.echoes_received > 0 {
            write!(f, ", {} echoes received", self.echoes_received)?;
        }
        if self.truncated > 0 {
            write!(f, ", {} truncated", self.truncated)?;
        }
        if self.underrun {
            write!(f, ", aborted by buffer underrun")?;
        }
        Ok(())
    }
}

/// the real-time consumer: drains the ring onto the network on an absolute schedule
pub struct Session<'a, C: Clock, S: DatagramSink> {
    pub ring: &'a PacketRing,
    pub refill: &'a RefillHandle,
    pub clock: &'a C,
    pub socket: &'a S,
    pub shutdown: &'a ShutdownToken,
}
impl<C: Clock, S: DatagramSink> Session<'_, C, S> {
    /// sends until the schedule ends, the token is cancelled, or the generator falls behind
    ///
    /// `packet` is the staged datagram; it must be at least as long as the largest descriptor
    pub fn run(&self, schedule: &Schedule, packet: &mut [u8]) -> SessionReport {
        let mut report = SessionReport::default();

        //the generator filled every block before signalling readiness, so this never waits long
        let mut block = self.ring.lock(self.ring.first());
        let mut index = 0;
        let mut sequence: u32 = 0;
        let mut attempted: u64 = 0;

        let mut next_deadline = schedule.start.unwrap_or_else(|| self.clock.now());
        let end = next_deadline + schedule.duration;
        log::debug!("sending from {} until {}", next_deadline, end);

        let mut now = self.clock.now();
        while now < end {
            if self.shutdown.is_cancelled() {
                log::info!("shutdown requested; stopping after {} packets", attempted);
                break;
            }
            if matches!(schedule.count, Some(limit) if attempted >= limit) {
                log::debug!("packet limit of {} reached", attempted);
                break;
            }

            let descriptor = block[index];
            header::write_sequence(packet, sequence);
            next_deadline += descriptor.delay;
            self.clock.sleep_until(next_deadline);
            header::write_send_time(packet, &self.clock.wall_time());

            if descriptor.size > packet.len() {
                report.truncated += 1;
                if report.truncated == 1 {
                    log::warn!(
                        "generator asked for {} bytes but promised at most {}; truncating",
                        descriptor.size,
                        packet.len()
                    );
                }
            }
            let size = descriptor.size.min(packet.len());
            match self.socket.send_datagram(&packet[..size]) {
                Ok(sent) => {
                    log::trace!("sent packet {} ({} bytes)", sequence, sent);
                    report.packets_sent += 1;
                },
                Err(e) => {
                    log::warn!("unable to send packet {}: {}", sequence, e);
                    report.send_failures += 1;
                },
            }
            report.last_sequence = Some(sequence);
            sequence = sequence.wrapping_add(1);
            attempted += 1;

            index += 1;
            if index == block.len() {
                let next = self.ring.next(block.id());
                drop(block);
                block = match self.ring.try_lock(next) {
                    Some(guard) => guard,
                    None => {
                        log::error!(
                            "generator has not released block {}; aborting after packet {}",
                            next.index(),
                            sequence.wrapping_sub(1)
                        );
                        report.underrun = true;
                        break;
                    },
                };
                index = 0;
                self.refill.request(); //the block just left is now free to regenerate
            }

            now = self.clock.now();
        }

        report
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use std::cell::{Cell, RefCell};
    use std::sync::mpsc::channel;
    use std::sync::Arc;
    use std::time::Instant;

    use crate::error::ProbeError;
    use crate::generator::ring::PacketDescriptor;
    use crate::generator::runtime::GeneratorRuntime;
    use crate::generator::{OwnedRing, PacketGenerator};
    use crate::protocol::header::{PacketHeader, MIN_PACKET_SIZE};
    use crate::utils::clock::{ClockSource, SystemClock};

    /// a clock that jumps straight to each deadline, then adds some scheduling noise
    struct SyntheticClock {
        now: Cell<Timestamp>,
        noise: Cell<u64>,
        deadlines: RefCell<Vec<Timestamp>>,
    }
    impl SyntheticClock {
        fn new(start: Timestamp) -> SyntheticClock {
            SyntheticClock {
                now: Cell::new(start),
                noise: Cell::new(12345),
                deadlines: RefCell::new(Vec::new()),
            }
        }

        fn quiet(start: Timestamp) -> SyntheticClock {
            let clock = SyntheticClock::new(start);
            clock.noise.set(0);
            clock
        }

        fn jitter(&self) -> Duration {
            let state = self.noise.get();
            if state == 0 {
                return Duration::ZERO;
            }
            let state = state.wrapping_mul(6364136223846793005).wrapping_add(1442695040888963407);
            self.noise.set(state);
            Duration::from_nanos((state >> 33) % 80_000)
        }
    }
    impl Clock for SyntheticClock {
        fn now(&self) -> Timestamp {
            self.now.get()
        }

        fn sleep_until(&self, deadline: Timestamp) {
            self.deadlines.borrow_mut().push(deadline);
            let woke = self.now.get().max(deadline) + self.jitter();
            self.now.set(woke);
        }

        fn wall_time(&self) -> Timestamp {
            self.now.get()
        }
    }

    #[derive(Default)]
    struct RecordingSink {
        datagrams: RefCell<Vec<Vec<u8>>>,
        fail_every: usize,
        attempts: Cell<usize>,
    }
    impl DatagramSink for RecordingSink {
        fn send_datagram(&self, datagram: &[u8]) -> io::Result<usize> {
            self.attempts.set(self.attempts.get() + 1);
            if self.fail_every != 0 && self.attempts.get() % self.fail_every == 0 {
                return Err(io::Error::new(io::ErrorKind::Other, "no buffer space"));
            }
            self.datagrams.borrow_mut().push(datagram.to_vec());
            Ok(datagram.len())
        }
    }

    /// three blocks of four packets with distinct sizes and uneven delays
    fn patterned_ring() -> PacketRing {
        let ring = PacketRing::new(3, 4).unwrap();
        let mut block = ring.first();
        for b in 0..3 {
            let mut guard = ring.lock(block);
            for (i, descriptor) in guard.iter_mut().enumerate() {
                descriptor.size = MIN_PACKET_SIZE + b * 4 + i;
                descriptor.delay = Duration::from_nanos(999_999_937 / (b * 4 + i + 1) as u64);
            }
            drop(guard);
            block = ring.next(block);
        }
        ring
    }

    fn expected_delays(ring: &PacketRing, packets: usize) -> Vec<PacketDescriptor> {
        let mut descriptors = Vec::new();
        let mut block = ring.first();
        while descriptors.len() < packets {
            descriptors.extend(ring.lock(block).iter().copied());
            block = ring.next(block);
        }
        descriptors.truncate(packets);
        descriptors
    }

    #[test]
    fn deadlines_accumulate_without_drift() {
        let ring = patterned_ring();
        let (control, requests) = channel();
        let refill = RefillHandle::new(control);
        let start = Timestamp::new(1_000, 999_000_000);
        let clock = SyntheticClock::new(start);
        let socket = RecordingSink::default();
        let shutdown = ShutdownToken::new();
        let mut packet = header::stage_packet(64, false).unwrap();

        let session = Session {
            ring: &ring,
            refill: &refill,
            clock: &clock,
            socket: &socket,
            shutdown: &shutdown,
        };
        let schedule = Schedule {
            start: None,
            duration: Duration::from_secs(3600),
            count: Some(40),
        };
        let report = session.run(&schedule, &mut packet);

        assert_eq!(report.packets_sent, 40);
        assert!(!report.underrun);
        assert_eq!(report.truncated, 0);
        assert_eq!(report.last_sequence, Some(39));

        //every deadline is the start plus the exact sum of the delays so far, noise notwithstanding
        let descriptors = expected_delays(&ring, 40);
        let mut expected = start;
        for (deadline, descriptor) in clock.deadlines.borrow().iter().zip(descriptors.iter()) {
            expected += descriptor.delay;
            assert_eq!(*deadline, expected);
        }
        assert_eq!(clock.deadlines.borrow().len(), 40);

        let datagrams = socket.datagrams.borrow();
        for (sequence, (datagram, descriptor)) in datagrams.iter().zip(descriptors.iter()).enumerate() {
            assert_eq!(datagram.len(), descriptor.size);
            assert_eq!(PacketHeader::decode(datagram).unwrap().sequence, sequence as u32);
        }

        //one refill request per block left behind
        assert_eq!(requests.try_iter().count(), 10);
    }

    #[test]
    fn descriptors_beyond_max_size_are_counted_and_cut() {
        let ring = patterned_ring();
        let (control, _requests) = channel();
        let refill = RefillHandle::new(control);
        let clock = SyntheticClock::quiet(Timestamp::from_secs(7));
        let socket = RecordingSink::default();
        let shutdown = ShutdownToken::new();
        //the ring describes sizes up to MIN_PACKET_SIZE + 11
        let mut packet = header::stage_packet(MIN_PACKET_SIZE + 4, false).unwrap();

        let report = Session {
            ring: &ring,
            refill: &refill,
            clock: &clock,
            socket: &socket,
            shutdown: &shutdown,
        }
        .run(
            &Schedule {
                start: None,
                duration: Duration::from_secs(3600),
                count: Some(12),
            },
            &mut packet,
        );

        assert_eq!(report.packets_sent, 12);
        assert_eq!(report.truncated, 7);
        assert!(report.to_string().contains("7 truncated"));
        assert!(socket.datagrams.borrow().iter().all(|d| d.len() <= MIN_PACKET_SIZE + 4));
    }

    #[test]
    fn send_time_is_taken_after_the_sleep() {
        let ring = patterned_ring();
        let (control, _requests) = channel();
        let refill = RefillHandle::new(control);
        let clock = SyntheticClock::quiet(Timestamp::from_secs(50));
        let socket = RecordingSink::default();
        let shutdown = ShutdownToken::new();
        let mut packet = header::stage_packet(64, true).unwrap();

        let schedule = Schedule {
            start: None,
            duration: Duration::from_secs(3600),
            count: Some(5),
        };
        Session {
            ring: &ring,
            refill: &refill,
            clock: &clock,
            socket: &socket,
            shutdown: &shutdown,
        }
        .run(&schedule, &mut packet);

        let deadlines = clock.deadlines.borrow();
        for (datagram, deadline) in socket.datagrams.borrow().iter().zip(deadlines.iter()) {
            let header = PacketHeader::decode(datagram).unwrap();
            assert_eq!(header.send_time, *deadline);
            assert!(header.echo_requested());
        }
    }

    #[test]
    fn duration_bounds_the_session() {
        let ring = PacketRing::new(1, 10).unwrap();
        for descriptor in ring.lock(ring.first()).iter_mut() {
            descriptor.size = MIN_PACKET_SIZE;
            descriptor.delay = Duration::from_micros(100);
        }
        let (control, _requests) = channel();
        let refill = RefillHandle::new(control);
        let start = Timestamp::from_secs(7);
        let clock = SyntheticClock::quiet(start);
        let socket = RecordingSink::default();
        let shutdown = ShutdownToken::new();
        let mut packet = header::stage_packet(MIN_PACKET_SIZE, false).unwrap();

        let schedule = Schedule {
            start: Some(start),
            duration: Duration::from_millis(1),
            count: None,
        };
        let report = Session {
            ring: &ring,
            refill: &refill,
            clock: &clock,
            socket: &socket,
            shutdown: &shutdown,
        }
        .run(&schedule, &mut packet);
        assert_eq!(report.packets_sent, 10);
        assert_eq!(clock.deadlines.borrow().last(), Some(&(start + Duration::from_millis(1))));
    }

    #[test]
    fn send_failures_do_not_stop_or_shift_the_schedule() {
        let ring = patterned_ring();
        let (control, _requests) = channel();
        let refill = RefillHandle::new(control);
        let start = Timestamp::from_secs(3);
        let clock = SyntheticClock::new(start);
        let socket = RecordingSink {
            fail_every: 3,
            ..Default::default()
        };
        let shutdown = ShutdownToken::new();
        let mut packet = header::stage_packet(64, false).unwrap();

        let schedule = Schedule {
            start: None,
            duration: Duration::from_secs(3600),
            count: Some(12),
        };
        let report = Session {
            ring: &ring,
            refill: &refill,
            clock: &clock,
            socket: &socket,
            shutdown: &shutdown,
        }
        .run(&schedule, &mut packet);

        assert_eq!(report.packets_sent, 8);
        assert_eq!(report.send_failures, 4);
        let total: Duration = expected_delays(&ring, 12).iter().map(|d| d.delay).sum();
        assert_eq!(clock.deadlines.borrow().last(), Some(&(start + total)));
    }

    #[test]
    fn cancelled_token_sends_nothing() {
        let ring = patterned_ring();
        let (control, _requests) = channel();
        let refill = RefillHandle::new(control);
        let clock = SyntheticClock::new(Timestamp::from_secs(1));
        let socket = RecordingSink::default();
        let shutdown = ShutdownToken::new();
        shutdown.cancel();
        let mut packet = header::stage_packet(64, false).unwrap();

        let report = Session {
            ring: &ring,
            refill: &refill,
            clock: &clock,
            socket: &socket,
            shutdown: &shutdown,
        }
        .run(&Schedule::default(), &mut packet);
        assert_eq!(report.packets_sent, 0);
        assert_eq!(report.last_sequence, None);
    }

    /// refills take far longer than the sender needs to lap the ring
    struct StallingGenerator {
        ring: OwnedRing,
    }
    impl PacketGenerator for StallingGenerator {
        fn name(&self) -> &'static str {
            "stalling"
        }

        fn init(&mut self) -> Result<Arc<PacketRing>, ProbeError> {
            let ring = PacketRing::new(2, 10)?;
            for block in [ring.first(), ring.next(ring.first())] {
                for descriptor in ring.lock(block).iter_mut() {
                    descriptor.size = MIN_PACKET_SIZE;
                    descriptor.delay = Duration::from_micros(100);
                }
            }
            Ok(self.ring.install(ring))
        }

        fn max_size(&self) -> usize {
            MIN_PACKET_SIZE
        }

        fn is_dynamic(&self) -> bool {
            true
        }

        fn refill(&mut self, _descriptors: &mut [PacketDescriptor]) {
            std::thread::sleep(Duration::from_millis(200));
        }

        fn destroy(mut self: Box<Self>) -> Result<(), ProbeError> {
            self.ring.release()
        }
    }

    struct NullSink;
    impl DatagramSink for NullSink {
        fn send_datagram(&self, datagram: &[u8]) -> io::Result<usize> {
            Ok(datagram.len())
        }
    }

    #[test]
    fn slow_refill_aborts_with_underrun() {
        let runtime = GeneratorRuntime::spawn(Box::new(StallingGenerator { ring: OwnedRing::default() }), None).unwrap();
        let prepared = runtime.wait_ready().unwrap();
        let refill = runtime.refill_handle();
        let clock = SystemClock::new(ClockSource::Monotonic);
        let shutdown = ShutdownToken::new();
        let mut packet = header::stage_packet(prepared.max_size, false).unwrap();

        let started = Instant::now();
        let schedule = Schedule {
            start: None,
            duration: Duration::from_secs(5),
            count: None,
        };
        let report = Session {
            ring: &prepared.ring,
            refill: &refill,
            clock: &clock,
            socket: &NullSink,
            shutdown: &shutdown,
        }
        .run(&schedule, &mut packet);

        assert!(report.underrun);
        assert!(started.elapsed() < Duration::from_secs(4), "session should have stopped early");
        //the earliest possible fault is on leaving the second block
        assert!(report.packets_sent >= 20);

        drop(refill);
        drop(prepared);
        runtime.shutdown().unwrap();
    }
}
