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

pub mod gaussian;
pub mod ring;
pub mod runtime;
pub mod simple;

use std::str::FromStr;
use std::sync::Arc;

use crate::error::ProbeError;
use crate::protocol::header::{MAX_PACKET_SIZE, MIN_PACKET_SIZE};

use ring::{PacketDescriptor, PacketRing};

/// the generator used when none is named
pub const DEFAULT_GENERATOR: &str = "static";

/// descriptors per block, for every generator
pub const BLOCK_LEN: usize = 10;

/// a traffic model: decides the size of every packet and the gap before it
///
/// implementations fill the whole ring in `init`; dynamic ones are later asked to regenerate
/// individual blocks the sender has finished with. locking is the runtime's job: `refill`
/// receives the block's contents already held exclusively
pub trait PacketGenerator: Send {
    fn name(&self) -> &'static str;

    /// allocates the ring, fills every block, and fixes `max_size`
    fn init(&mut self) -> Result<Arc<PacketRing>, ProbeError>;

    /// an upper bound on any size this generator will produce
    fn max_size(&self) -> usize;

    /// true if blocks should be regenerated after each use
    fn is_dynamic(&self) -> bool {
        false
    }

    /// overwrites one block with fresh descriptors
    fn refill(&mut self, _descriptors: &mut [PacketDescriptor]) {}

    /// releases the ring and any private state
    fn destroy(self: Box<Self>) -> Result<(), ProbeError>;
}

/// builds a generator by name, applying a `name=value,name2=value2` option string
pub fn create(name: &str, options: Option<&str>) -> Result<Box<dyn PacketGenerator>, ProbeError> {
    let options = GeneratorOptions::parse(options.unwrap_or(""))?;
    log::debug!("creating generator {} with options {:?}", name, options.pairs);
    match name {
        "static" => Ok(Box::new(simple::StaticGenerator::new(simple::SimpleConfig::from_options(name, &options)?))),
        "alternate" | "alternating" => Ok(Box::new(simple::AlternatingTimeGenerator::new(
            simple::SimpleConfig::from_options(name, &options)?,
        ))),
        "random" | "random-size" => Ok(Box::new(simple::RandomSizeGenerator::new(
            simple::SimpleConfig::from_options(name, &options)?,
        ))),
        "gaussian" => Ok(Box::new(gaussian::GaussianGenerator::new(gaussian::GaussianConfig::from_options(&options)?)?)),
        _ => Err(ProbeError::Configuration(format!("unknown generator: {}", name))),
    }
}

/// key/value pairs from a generator option string
#[derive(Debug, Default)]
pub struct GeneratorOptions {
    pairs: Vec<(String, String)>,
}
impl GeneratorOptions {
    pub fn parse(options: &str) -> Result<GeneratorOptions, ProbeError> {
        let mut pairs = Vec::new();
        for token in options.split(',') {
            let token = token.trim();
            if token.is_empty() {
                continue;
            }
            match token.split_once('=') {
                Some((name, value)) if !name.trim().is_empty() => {
                    pairs.push((name.trim().to_string(), value.trim().to_string()));
                },
                _ => {
                    return Err(ProbeError::Configuration(format!(
                        "generator option '{}' is not of the form name=value",
                        token
                    )))
                },
            }
        }
        Ok(GeneratorOptions { pairs })
    }

    /// visits every pair; the visitor returns false for keys it does not understand
    pub(crate) fn apply(
        &self,
        generator: &str,
        mut visit: impl FnMut(&str, &str) -> Result<bool, ProbeError>,
    ) -> Result<(), ProbeError> {
        for (name, value) in &self.pairs {
            if !visit(name, value)? {
                return Err(ProbeError::Configuration(format!(
                    "unknown option '{}' for generator {}",
                    name, generator
                )));
            }
        }
        Ok(())
    }
}

pub(crate) fn parse_value<T: FromStr>(name: &str, value: &str) -> Result<T, ProbeError>
where
    T::Err: std::fmt::Display,
{
    value
        .parse()
        .map_err(|e| ProbeError::Configuration(format!("invalid value '{}' for generator option {}: {}", value, name, e)))
}

/// raises too-small sizes to the header size and rejects sizes UDP cannot carry
pub(crate) fn validate_size(name: &str, size: usize) -> Result<usize, ProbeError> {
    if size < MIN_PACKET_SIZE {
        log::warn!("{} of {} bytes cannot hold the packet header; using {}", name, size, MIN_PACKET_SIZE);
        Ok(MIN_PACKET_SIZE)
    } else if size > MAX_PACKET_SIZE {
        Err(ProbeError::Configuration(format!(
            "{} of {} bytes exceeds the largest UDP payload ({})",
            name, size, MAX_PACKET_SIZE
        )))
    } else {
        Ok(size)
    }
}

/// a generator's handle on the ring it built, given up when the generator is destroyed
#[derive(Default)]
pub(crate) struct OwnedRing(Option<Arc<PacketRing>>);
impl OwnedRing {
    pub fn install(&mut self, ring: PacketRing) -> Arc<PacketRing> {
        let ring = Arc::new(ring);
        self.0 = Some(Arc::clone(&ring));
        ring
    }

    pub fn release(&mut self) -> Result<(), ProbeError> {
        match self.0.take() {
            Some(ring) => PacketRing::destroy(ring),
            None => Ok(()), //never initialised
        }
    }
}
