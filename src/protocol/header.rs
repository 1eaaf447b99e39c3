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

use std::convert::TryInto;

use crate::error::{try_alloc, ProbeError};
use crate::utils::clock::Timestamp;

/*
 * every datagram begins with this header:
 *
 *   offset  0: u32, sequence number, big-endian
 *   offset  4: i64, send-time seconds, host byte order
 *   offset 12: i64, send-time nanoseconds, host byte order
 *   offset 20: u8,  flags
 *
 * anything after the flags byte is filler
 */
const SEQUENCE_OFFSET: usize = 0;
const SEND_SECS_OFFSET: usize = 4;
const SEND_NANOS_OFFSET: usize = 12;
const FLAGS_OFFSET: usize = 20;

/// the smallest datagram that can carry the header
pub const MIN_PACKET_SIZE: usize = FLAGS_OFFSET + 1;

/// set in the flags byte to ask the server to send the datagram back
pub const FLAG_ECHO: u8 = 0x01;

/// the largest datagram any generator may describe (IPv4 UDP payload limit)
pub const MAX_PACKET_SIZE: usize = 65_507;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PacketHeader {
    pub sequence: u32,
    pub send_time: Timestamp,
    pub flags: u8,
}
impl PacketHeader {
    /// reads the header from the start of a received datagram; `None` if it is too short
    pub fn decode(packet: &[u8]) -> Option<PacketHeader> {
        if packet.len() < MIN_PACKET_SIZE {
            return None;
        }
        let sequence = u32::from_be_bytes(packet[SEQUENCE_OFFSET..SEND_SECS_OFFSET].try_into().ok()?);
        let secs = i64::from_ne_bytes(packet[SEND_SECS_OFFSET..SEND_NANOS_OFFSET].try_into().ok()?);
        let nanos = i64::from_ne_bytes(packet[SEND_NANOS_OFFSET..FLAGS_OFFSET].try_into().ok()?);
        Some(PacketHeader {
            sequence,
            send_time: Timestamp::new(secs, nanos.clamp(0, u32::MAX as i64) as u32),
            flags: packet[FLAGS_OFFSET],
        })
    }

    pub fn echo_requested(&self) -> bool {
        self.flags & FLAG_ECHO != 0
    }
}

/// checks the echo bit of a datagram without decoding the rest of the header
pub fn echo_requested(packet: &[u8]) -> bool {
    packet.len() >= MIN_PACKET_SIZE && packet[FLAGS_OFFSET] & FLAG_ECHO != 0
}

pub fn write_sequence(packet: &mut [u8], sequence: u32) {
    packet[SEQUENCE_OFFSET..SEND_SECS_OFFSET].copy_from_slice(&sequence.to_be_bytes());
}

pub fn write_send_time(packet: &mut [u8], send_time: &Timestamp) {
    packet[SEND_SECS_OFFSET..SEND_NANOS_OFFSET].copy_from_slice(&send_time.secs().to_ne_bytes());
    packet[SEND_NANOS_OFFSET..FLAGS_OFFSET].copy_from_slice(&(send_time.nanos() as i64).to_ne_bytes());
}

/// allocates the sender's reusable datagram buffer, large enough for the generator's biggest packet
pub fn stage_packet(max_size: usize, echo: bool) -> Result<Vec<u8>, ProbeError> {
    let length = max_size.max(MIN_PACKET_SIZE);
    let mut staged_packet = try_alloc(length, 0_u8, "datagram staging buffer")?;
    for (i, byte) in staged_packet.iter_mut().enumerate().skip(MIN_PACKET_SIZE) { //fill the packet with a fixed sequence
        *byte = (i % 256) as u8;
    }
    staged_packet[FLAGS_OFFSET] = if echo { FLAG_ECHO } else { 0 };
    Ok(staged_packet)
}
