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
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::mpsc::{sync_channel, Receiver};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use crate::error::{try_alloc, ProbeError};
use crate::protocol::header::{PacketHeader, MIN_PACKET_SIZE};
use crate::protocol::results::{EchoRecord, OutputSink};
use crate::utils::clock::Timestamp;
use crate::utils::realtime::{lower_thread_priority, ECHO_PRIORITY_REDUCTION};
use crate::utils::ThreadMonitor;

use super::socket::{is_timeout, receive_timestamped, POLL_TIMEOUT};

/// collects echoed datagrams on the client's socket and turns them into round-trip records
///
/// the receive timeout is the thread's cancellation point, so it stops within one
/// POLL_TIMEOUT of being asked to
pub struct EchoReceiver {
    handle: Option<thread::JoinHandle<OutputSink>>,
    ready: Receiver<()>,
    cancelled: Arc<AtomicBool>,
    received: Arc<AtomicU64>,
}
impl EchoReceiver {
    pub fn spawn(
        socket: Arc<UdpSocket>,
        sink: OutputSink,
        max_size: usize,
        real_time: bool,
        core: Option<core_affinity::CoreId>,
    ) -> Result<EchoReceiver, ProbeError> {
        let buffer = try_alloc(max_size.max(MIN_PACKET_SIZE), 0_u8, "echo receive buffer")?;
        let (ready_tx, ready_rx) = sync_channel(1);
        let cancelled = Arc::new(AtomicBool::new(false));
        let received = Arc::new(AtomicU64::new(0));

        let c_cancelled = Arc::clone(&cancelled);
        let c_received = Arc::clone(&received);
        let handle = thread::Builder::new()
            .name("echo-receiver".to_string())
            .spawn(move || {
                let _thread_monitor = ThreadMonitor::new("echo receiver");
                if let Some(core_id) = core {
                    if !core_affinity::set_for_current(core_id) {
                        log::warn!("unable to pin echo receiver to CPU {}", core_id.id);
                    }
                }
                if real_time {
                    //echoes wait in the kernel's buffer, so yielding to the sender loses nothing
                    match lower_thread_priority(ECHO_PRIORITY_REDUCTION) {
                        Ok(priority) => log::debug!("echo receiver running at priority {}", priority),
                        Err(e) => log::warn!("unable to lower echo receiver priority: {}", e),
                    }
                }
                ready_tx.send(()).unwrap_or_default();

                receive_echoes(&socket, buffer, sink, &c_cancelled, &c_received)
            })
            .map_err(|e| ProbeError::Thread(format!("unable to start echo receiver: {}", e)))?;

        Ok(EchoReceiver {
            handle: Some(handle),
            ready: ready_rx,
            cancelled,
            received,
        })
    }

    pub fn wait_ready(&self) -> Result<(), ProbeError> {
        self.ready
            .recv()
            .map_err(|_| ProbeError::Thread("echo receiver exited before it was ready".to_string()))
    }

    pub fn received(&self) -> u64 {
        self.received.load(Ordering::Acquire)
    }

    /// waits up to `linger` for `sent` echoes, then stops the thread
    ///
    /// returns the number of echoes received and the output sink, flushed
    pub fn finish(mut self, sent: u64, linger: Duration) -> Result<(u64, OutputSink), ProbeError> {
        let deadline = Instant::now() + linger;
        while self.received() < sent && Instant::now() < deadline {
            thread::sleep(Duration::from_millis(1));
        }
        let received = self.received();
        if received < sent {
            log::info!("{} of {} echoes returned within {:?}", received, sent, linger);
        }

        match self.stop() {
            Some(Ok(sink)) => Ok((self.received(), sink)),
            Some(Err(e)) => Err(ProbeError::Thread(format!("echo receiver panicked: {:?}", e))),
            None => Err(ProbeError::Thread("echo receiver was already stopped".to_string())),
        }
    }

    fn stop(&mut self) -> Option<thread::Result<OutputSink>> {
        self.cancelled.store(true, Ordering::Release);
        let handle = self.handle.take()?;
        log::debug!("waiting for the echo receiver to stop");
        Some(handle.join())
    }
}
impl Drop for EchoReceiver {
    //error paths drop the receiver without finishing it; it must still let go of the socket
    fn drop(&mut self) {
        if let Some(Err(e)) = self.stop() {
            log::error!("echo receiver panicked: {:?}", e);
        }
    }
}

fn receive_echoes(
    socket: &UdpSocket,
    mut buffer: Vec<u8>,
    mut sink: OutputSink,
    cancelled: &AtomicBool,
    received: &AtomicU64,
) -> OutputSink {
    while !cancelled.load(Ordering::Acquire) {
        let arrival = match receive_timestamped(socket, &mut buffer) {
            Ok(arrival) => arrival,
            Err(e) if is_timeout(&e) => continue,
            Err(e) if e.kind() == io::ErrorKind::ConnectionRefused => {
                log::debug!("server is not accepting datagrams: {}", e);
                continue;
            },
            Err(e) => {
                log::error!("unable to receive echo: {}", e);
                thread::sleep(POLL_TIMEOUT);
                continue;
            },
        };

        let length = arrival.length.min(buffer.len());
        let header = match PacketHeader::decode(&buffer[..length]) {
            Some(header) => header,
            None => {
                log::warn!("ignoring {}-byte echo: shorter than the packet header", arrival.length);
                continue;
            },
        };
        let arrival_time = arrival.kernel_time.unwrap_or_else(Timestamp::wall_clock);
        let rtt = arrival_time.round_trip_since(&header.send_time);
        log::trace!("echo of packet {} after {}", header.sequence, rtt);

        sink.emit(&EchoRecord {
            arrival: arrival_time,
            sequence: header.sequence,
            size: arrival.length,
            rtt,
        });
        received.fetch_add(1, Ordering::Release);
    }
    sink.flush();
    sink
}

#[cfg(test)]
mod tests {
    use super::*;

    use std::sync::Mutex;

    use crate::protocol::header::{stage_packet, write_send_time, write_sequence};
    use crate::protocol::results::Format;
    use crate::stream::socket::{bind, connect, SocketBuffers};

    #[derive(Clone, Default)]
    struct Captured(Arc<Mutex<Vec<u8>>>);
    impl io::Write for Captured {
        fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
            self.0.lock().unwrap().extend_from_slice(buf);
            Ok(buf.len())
        }

        fn flush(&mut self) -> io::Result<()> {
            Ok(())
        }
    }

    #[test]
    fn echoes_become_records_and_runts_are_ignored() {
        //a peer that plays the server's part by hand
        let peer = bind(&["127.0.0.1:0".parse().unwrap()], &SocketBuffers::default(), false).unwrap();
        let socket = Arc::new(connect(&[peer.local_addr().unwrap()], &SocketBuffers::default()).unwrap());

        let captured = Captured::default();
        let sink = OutputSink::from_writer(Box::new(captured.clone()), Format::Tsv);
        let receiver = EchoReceiver::spawn(Arc::clone(&socket), sink, 64, false, None).unwrap();
        receiver.wait_ready().unwrap();

        let client = socket.local_addr().unwrap();
        peer.send_to(&[1_u8; 5], client).unwrap();
        for sequence in 0..3 {
            let mut packet = stage_packet(40, true).unwrap();
            write_sequence(&mut packet, sequence);
            write_send_time(&mut packet, &Timestamp::wall_clock());
            peer.send_to(&packet, client).unwrap();
        }

        let (received, sink) = receiver.finish(3, Duration::from_secs(5)).unwrap();
        drop(sink);
        assert_eq!(received, 3);

        let text = String::from_utf8(captured.0.lock().unwrap().clone()).unwrap();
        let rows: Vec<Vec<&str>> = text.lines().skip(1).map(|line| line.split('\t').collect()).collect();
        assert_eq!(rows.len(), 3);
        for (sequence, row) in rows.iter().enumerate() {
            assert_eq!(row[1], sequence.to_string());
            assert_eq!(row[2], "40");
            assert!(!row[3].starts_with('-'), "negative round trip {}", row[3]);
        }
    }

    #[test]
    fn abandoned_receiver_stops_and_releases_the_socket() {
        let peer = bind(&["127.0.0.1:0".parse().unwrap()], &SocketBuffers::default(), false).unwrap();
        let socket = Arc::new(connect(&[peer.local_addr().unwrap()], &SocketBuffers::default()).unwrap());

        let sink = OutputSink::from_writer(Box::new(io::sink()), Format::Tsv);
        let receiver = EchoReceiver::spawn(Arc::clone(&socket), sink, 64, false, None).unwrap();
        receiver.wait_ready().unwrap();
        assert_eq!(Arc::strong_count(&socket), 2);

        let started = Instant::now();
        drop(receiver);
        assert!(started.elapsed() < Duration::from_secs(2));
        assert_eq!(Arc::strong_count(&socket), 1);
    }
}
