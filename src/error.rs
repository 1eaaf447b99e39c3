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

use thiserror::Error;

/// exit code for invalid command-line arguments or generator configuration
pub const EXIT_INVALID: i32 = 1;
/// exit code for network problems
pub const EXIT_NETFAIL: i32 = 2;
/// exit code for memory errors
pub const EXIT_MEMFAIL: i32 = 3;
/// exit code for output-file access errors
pub const EXIT_FILEFAIL: i32 = 4;
/// exit code for a session aborted because the generator fell behind
pub const EXIT_UNDERRUN: i32 = 5;
/// exit code for internal failures (thread lifecycle, ring teardown)
pub const EXIT_INTERNAL: i32 = 6;
/// exit code when a second termination signal cuts a shutdown short
pub const EXIT_FORCED: i32 = 130;

#[derive(Error, Debug)]
pub enum ProbeError {
    #[error("configuration error: {0}")]
    Configuration(String),

    #[error("could not allocate {0}")]
    Allocation(String),

    #[error("network setup failed: {0}")]
    NetworkSetup(String),

    #[error("unable to open output: {0}")]
    OutputSink(String),

    #[error("generator did not refill in time; session aborted after packet {sequence}")]
    BufferUnderrun { sequence: u32 },

    #[error("packet ring still in use: {0}")]
    RingInUse(String),

    #[error("worker thread failed: {0}")]
    Thread(String),
}

impl ProbeError {
    pub fn exit_code(&self) -> i32 {
        match self {
            ProbeError::Configuration(_) => EXIT_INVALID,
            ProbeError::NetworkSetup(_) => EXIT_NETFAIL,
            ProbeError::Allocation(_) => EXIT_MEMFAIL,
            ProbeError::OutputSink(_) => EXIT_FILEFAIL,
            ProbeError::BufferUnderrun { .. } => EXIT_UNDERRUN,
            ProbeError::RingInUse(_) | ProbeError::Thread(_) => EXIT_INTERNAL,
        }
    }
}

/// reserves exactly `len` elements, reporting failure instead of aborting
pub(crate) fn try_alloc<T: Clone>(len: usize, fill: T, what: &str) -> Result<Vec<T>, ProbeError> {
    let mut buffer = Vec::new();
    buffer
        .try_reserve_exact(len)
        .map_err(|e| ProbeError::Allocation(format!("{} ({} elements): {}", what, len, e)))?;
    buffer.resize(len, fill);
    Ok(buffer)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn exit_codes_are_distinct_per_class() {
        let codes = [
            ProbeError::Configuration("x".into()).exit_code(),
            ProbeError::NetworkSetup("x".into()).exit_code(),
            ProbeError::Allocation("x".into()).exit_code(),
            ProbeError::OutputSink("x".into()).exit_code(),
            ProbeError::BufferUnderrun { sequence: 3 }.exit_code(),
            ProbeError::Thread("x".into()).exit_code(),
            EXIT_FORCED,
        ];
        for (i, a) in codes.iter().enumerate() {
            for b in &codes[i + 1..] {
                assert_ne!(a, b);
            }
        }
    }

    #[test]
    fn try_alloc_fills() {
        let buffer = try_alloc(8, 7_u8, "test buffer").unwrap();
        assert_eq!(buffer, vec![7_u8; 8]);
    }
}
