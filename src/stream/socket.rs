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
use std::net::{SocketAddr, ToSocketAddrs, UdpSocket};
use std::time::Duration;

use socket2::{Domain, Protocol, Socket, Type};

cfg_if::cfg_if! {
    if #[cfg(unix)] { //NOTE: features unsupported on Windows
        use nix::sys::socket::{setsockopt, sockopt::RcvBuf, sockopt::SndBuf};
    }
}

use crate::utils::clock::Timestamp;
use crate::BoxResult;

/// how long a blocking receive waits before giving its loop a chance to notice cancellation
pub const POLL_TIMEOUT: Duration = Duration::from_millis(50);

/// the largest payload any UDP socket can hand back; IPv6 allows more than IPv4's 65507
pub const MAX_DATAGRAM_SIZE: usize = 65_535;

/// restricts which resolved addresses are tried
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum AddressFamily {
    #[default]
    Any,
    V4,
    V6,
}
impl AddressFamily {
    fn admits(&self, address: &SocketAddr) -> bool {
        match self {
            AddressFamily::Any => true,
            AddressFamily::V4 => address.is_ipv4(),
            AddressFamily::V6 => address.is_ipv6(),
        }
    }
}

/// socket buffer sizes in bytes; zero leaves the OS default
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SocketBuffers {
    pub send: usize,
    pub receive: usize,
}

pub fn resolve(host: &str, port: u16, family: AddressFamily) -> BoxResult<Vec<SocketAddr>> {
    let addresses: Vec<SocketAddr> = (host, port).to_socket_addrs()?.filter(|address| family.admits(address)).collect();
    if addresses.is_empty() {
        return Err(Box::new(simple_error::simple_error!("{} has no usable {:?} addresses", host, family)));
    }
    log::debug!("{} resolved to {:?}", host, addresses);
    Ok(addresses)
}

fn configure(socket: &Socket, buffers: &SocketBuffers) -> BoxResult<()> {
    cfg_if::cfg_if! {
        if #[cfg(unix)] {
            if buffers.send != 0 {
                log::debug!("setting send-buffer to {}...", buffers.send);
                setsockopt(socket, SndBuf, &buffers.send)?;
            }
            if buffers.receive != 0 {
                log::debug!("setting receive-buffer to {}...", buffers.receive);
                setsockopt(socket, RcvBuf, &buffers.receive)?;
            }
        } else {
            if buffers.send != 0 {
                socket.set_send_buffer_size(buffers.send)?;
            }
            if buffers.receive != 0 {
                socket.set_recv_buffer_size(buffers.receive)?;
            }
        }
    }
    Ok(())
}

fn finish(socket: Socket) -> BoxResult<UdpSocket> {
    let socket: UdpSocket = socket.into();
    socket.set_read_timeout(Some(POLL_TIMEOUT))?;
    enable_kernel_timestamps(&socket);
    Ok(socket)
}

fn connect_one(address: &SocketAddr, buffers: &SocketBuffers) -> BoxResult<UdpSocket> {
    let socket = Socket::new(Domain::for_address(*address), Type::DGRAM, Some(Protocol::UDP))?;
    configure(&socket, buffers)?;
    socket.connect(&(*address).into())?;
    finish(socket)
}

/// a socket connected to the first address that accepts one
pub fn connect(addresses: &[SocketAddr], buffers: &SocketBuffers) -> BoxResult<UdpSocket> {
    for address in addresses {
        match connect_one(address, buffers) {
            Ok(socket) => {
                log::info!("sending to {} from {}", address, socket.local_addr()?);
                return Ok(socket);
            },
            Err(e) => log::warn!("unable to use {}: {}", address, e),
        }
    }
    Err(Box::new(simple_error::simple_error!("no usable socket among {} addresses", addresses.len())))
}

fn bind_one(address: &SocketAddr, buffers: &SocketBuffers, ipv6_only: bool) -> BoxResult<UdpSocket> {
    let socket = Socket::new(Domain::for_address(*address), Type::DGRAM, Some(Protocol::UDP))?;
    if address.is_ipv6() {
        socket.set_only_v6(ipv6_only)?;
    }
    configure(&socket, buffers)?;
    socket.bind(&(*address).into())?;
    finish(socket)
}

/// a socket bound to the first address that accepts one
pub fn bind(addresses: &[SocketAddr], buffers: &SocketBuffers, ipv6_only: bool) -> BoxResult<UdpSocket> {
    for address in addresses {
        match bind_one(address, buffers, ipv6_only) {
            Ok(socket) => return Ok(socket),
            Err(e) => log::warn!("unable to bind {}: {}", address, e),
        }
    }
    Err(Box::new(simple_error::simple_error!("no usable socket among {} addresses", addresses.len())))
}

/// one received datagram
#[derive(Debug, Clone, Copy)]
pub struct Arrival {
    pub length: usize,
    pub source: Option<SocketAddr>,
    /// when the kernel queued the datagram, if it said
    pub kernel_time: Option<Timestamp>,
}

cfg_if::cfg_if! {
    if #[cfg(target_os = "linux")] {
        use std::io::IoSliceMut;
        use std::net::{SocketAddrV4, SocketAddrV6};
        use std::os::unix::io::AsRawFd;

        use nix::sys::socket::{recvmsg, sockopt, ControlMessageOwned, MsgFlags, SockaddrStorage};
        use nix::sys::time::TimeSpec;

        fn enable_kernel_timestamps(socket: &UdpSocket) {
            if let Err(e) = setsockopt(socket, sockopt::ReceiveTimestampns, &true) {
                log::warn!("kernel receive timestamps unavailable: {}", e);
            }
        }

        fn to_socket_addr(address: &SockaddrStorage) -> Option<SocketAddr> {
            if let Some(v4) = address.as_sockaddr_in() {
                return Some(SocketAddr::V4(SocketAddrV4::from(*v4)));
            }
            address.as_sockaddr_in6().map(|v6| SocketAddr::V6(SocketAddrV6::from(*v6)))
        }

        /// receives one datagram along with the kernel's arrival timestamp
        pub fn receive_timestamped(socket: &UdpSocket, buffer: &mut [u8]) -> io::Result<Arrival> {
            let mut iov = [IoSliceMut::new(buffer)];
            let mut cmsg_buffer = nix::cmsg_space!(TimeSpec);
            let message = recvmsg::<SockaddrStorage>(
                socket.as_raw_fd(),
                &mut iov,
                Some(&mut cmsg_buffer),
                MsgFlags::empty(),
            )?;

            let mut kernel_time = None;
            if let Ok(cmsgs) = message.cmsgs() {
                for cmsg in cmsgs {
                    if let ControlMessageOwned::ScmTimestampns(time) = cmsg {
                        kernel_time = Some(Timestamp::from(time));
                    }
                }
            }
            let source = message.address.as_ref().and_then(to_socket_addr);
            Ok(Arrival {
                length: message.bytes,
                source,
                kernel_time,
            })
        }
    } else {
        fn enable_kernel_timestamps(_socket: &UdpSocket) {
            log::debug!("kernel receive timestamps are not supported on this platform");
        }

        /// receives one datagram; this platform gives no kernel arrival time
        pub fn receive_timestamped(socket: &UdpSocket, buffer: &mut [u8]) -> io::Result<Arrival> {
            let (length, source) = socket.recv_from(buffer)?;
            Ok(Arrival {
                length,
                source: Some(source),
                kernel_time: None,
            })
        }
    }
}

/// true for the errors a read timeout produces
pub fn is_timeout(e: &io::Error) -> bool {
    matches!(e.kind(), io::ErrorKind::WouldBlock | io::ErrorKind::TimedOut | io::ErrorKind::Interrupted)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn family_filter_applies() {
        let v4 = resolve("127.0.0.1", 4567, AddressFamily::V4).unwrap();
        assert_eq!(v4, vec!["127.0.0.1:4567".parse::<SocketAddr>().unwrap()]);
        assert!(resolve("127.0.0.1", 4567, AddressFamily::V6).is_err());
    }

    #[test]
    fn timestamped_receive_reports_source_and_length() {
        let server = bind(&["127.0.0.1:0".parse().unwrap()], &SocketBuffers::default(), false).unwrap();
        let client = connect(&[server.local_addr().unwrap()], &SocketBuffers::default()).unwrap();
        client.send(&[9_u8; 30]).unwrap();

        let mut buffer = [0_u8; 64];
        let arrival = receive_timestamped(&server, &mut buffer).unwrap();
        assert_eq!(arrival.length, 30);
        assert_eq!(arrival.source, Some(client.local_addr().unwrap()));
        assert_eq!(&buffer[..30], &[9_u8; 30]);
        #[cfg(target_os = "linux")]
        assert!(arrival.kernel_time.is_some());
    }

    #[test]
    fn idle_receive_times_out() {
        let server = bind(&["127.0.0.1:0".parse().unwrap()], &SocketBuffers::default(), false).unwrap();
        let mut buffer = [0_u8; 64];
        let e = receive_timestamped(&server, &mut buffer).unwrap_err();
        assert!(is_timeout(&e), "unexpected error {:?}", e);
    }
}
