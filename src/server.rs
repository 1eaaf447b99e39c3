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

use std::net::{SocketAddr, UdpSocket};

use crate::error::{try_alloc, ProbeError};
use crate::protocol::header::{self, PacketHeader, MIN_PACKET_SIZE};
use crate::protocol::results::{ArrivalRecord, OutputSink};
use crate::stream::socket::{self, is_timeout, SocketBuffers, MAX_DATAGRAM_SIZE};
use crate::utils::clock::Timestamp;
use crate::utils::cpu_affinity::CpuAffinityManager;
use crate::utils::realtime::{enter_real_time, SERVER_PRIORITY_OFFSET};
use crate::utils::shutdown::ShutdownToken;

#[derive(Debug, Clone, Default)]
pub struct ServerConfig {
    /// candidate bind addresses; the first one that works is used
    pub addresses: Vec<SocketAddr>,
    pub ipv6_only: bool,
    pub buffers: SocketBuffers,
    pub real_time: bool,
    pub affinity: String,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ServerReport {
    pub packets: u64,
    pub malformed: u64,
    pub echoed: u64,
}
impl std::fmt::Display for ServerReport {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "{} packets received, {} echoed, {} malformed",
            self.packets, self.echoed, self.malformed
        )
    }
}

/// a bound receive socket plus the buffer datagrams land in
pub struct Server {
    socket: UdpSocket,
    buffer: Vec<u8>,
}
impl Server {
    pub fn bind(config: &ServerConfig) -> Result<Server, ProbeError> {
        let buffer = try_alloc(MAX_DATAGRAM_SIZE, 0_u8, "server receive buffer")?;
        let socket = socket::bind(&config.addresses, &config.buffers, config.ipv6_only)
            .map_err(|e| ProbeError::NetworkSetup(e.to_string()))?;
        Ok(Server { socket, buffer })
    }

    pub fn local_addr(&self) -> Result<SocketAddr, ProbeError> {
        self.socket.local_addr().map_err(|e| ProbeError::NetworkSetup(e.to_string()))
    }

    /// receives until the token is cancelled, echoing where asked and recording every arrival
    pub fn serve(&mut self, sink: &mut OutputSink, shutdown: &ShutdownToken) -> ServerReport {
        let mut report = ServerReport::default();
        while !shutdown.is_cancelled() {
            let arrival = match socket::receive_timestamped(&self.socket, &mut self.buffer) {
                Ok(arrival) => arrival,
                Err(e) if is_timeout(&e) => continue,
                Err(e) => {
                    log::warn!("receive failed: {}", e);
                    continue;
                },
            };
            let user_time = Timestamp::wall_clock();
            let datagram = &self.buffer[..arrival.length.min(self.buffer.len())];
            let source = match arrival.source {
                Some(source) => source,
                None => {
                    log::debug!("ignoring {}-byte datagram without a source address", arrival.length);
                    continue;
                },
            };

            if datagram.len() < MIN_PACKET_SIZE {
                report.malformed += 1;
                log::warn!("dropping {}-byte datagram from {}: shorter than the packet header", datagram.len(), source);
                continue;
            }

            //echo before anything else so the added latency stays small and symmetric
            let mut echoed = false;
            if header::echo_requested(datagram) {
                match self.socket.send_to(datagram, source) {
                    Ok(_) => {
                        echoed = true;
                        report.echoed += 1;
                    },
                    Err(e) => log::warn!("unable to echo to {}: {}", source, e),
                }
            }

            report.packets += 1;
            if let Some(packet_header) = PacketHeader::decode(datagram) {
                log::trace!("packet {} from {} ({} bytes)", packet_header.sequence, source, datagram.len());
                sink.emit(&ArrivalRecord {
                    kernel_time: arrival.kernel_time,
                    user_time,
                    source,
                    sequence: packet_header.sequence,
                    size: datagram.len(),
                    echoed,
                });
            }
        }
        sink.flush();
        report
    }
}

pub fn run_server(config: &ServerConfig, sink: &mut OutputSink, shutdown: &ShutdownToken) -> Result<ServerReport, ProbeError> {
    let mut cpu_affinity_manager = CpuAffinityManager::new(&config.affinity)?;
    cpu_affinity_manager.set_affinity("server");
    if config.real_time {
        enter_real_time(SERVER_PRIORITY_OFFSET);
    }

    let mut server = Server::bind(config)?;
    log::info!("server listening on {}", server.local_addr()?);

    let report = server.serve(sink, shutdown);
    log::info!("server stopped: {}", report);
    Ok(report)
}
