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

use std::sync::Arc;
use std::time::Duration;

use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

use crate::error::ProbeError;
use crate::protocol::header::MIN_PACKET_SIZE;

use super::ring::{PacketDescriptor, PacketRing};
use super::{parse_value, validate_size, GeneratorOptions, OwnedRing, PacketGenerator, BLOCK_LEN};

/// default time between two packets
const DEFAULT_INTERVAL_US: u64 = 1000;

/// parameters shared by the static, alternating and random-size generators
///
/// `size` (`s`): packet size in bytes; the random-size generator treats it as a maximum
/// `interval` (`i`): time between two packets, in microseconds
/// `seed`: fixes the random sequence, for reproducible runs
#[derive(Debug, Clone, PartialEq)]
pub struct SimpleConfig {
    pub size: usize,
    pub interval: Duration,
    pub seed: Option<u64>,
}
impl Default for SimpleConfig {
    fn default() -> SimpleConfig {
        SimpleConfig {
            size: MIN_PACKET_SIZE,
            interval: Duration::from_micros(DEFAULT_INTERVAL_US),
            seed: None,
        }
    }
}
impl SimpleConfig {
    pub fn from_options(generator: &str, options: &GeneratorOptions) -> Result<SimpleConfig, ProbeError> {
        let mut config = SimpleConfig::default();
        options.apply(generator, |name, value| {
            match name {
                "size" | "s" => config.size = parse_value(name, value)?,
                "interval" | "i" => config.interval = Duration::from_micros(parse_value(name, value)?),
                "seed" => config.seed = Some(parse_value(name, value)?),
                _ => return Ok(false),
            }
            Ok(true)
        })?;
        config.size = validate_size("packet size", config.size)?;
        Ok(config)
    }
}

fn fill_block(descriptors: &mut [PacketDescriptor], size: usize, delay: Duration) {
    for descriptor in descriptors.iter_mut() {
        descriptor.size = size;
        descriptor.delay = delay;
    }
}

/// every packet has the configured size and interval
pub struct StaticGenerator {
    config: SimpleConfig,
    ring: OwnedRing,
}
impl StaticGenerator {
    pub fn new(config: SimpleConfig) -> StaticGenerator {
        StaticGenerator {
            config,
            ring: OwnedRing::default(),
        }
    }
}
impl PacketGenerator for StaticGenerator {
    fn name(&self) -> &'static str {
        "static"
    }

    fn init(&mut self) -> Result<Arc<PacketRing>, ProbeError> {
        let ring = PacketRing::new(1, BLOCK_LEN)?;
        fill_block(&mut ring.lock(ring.first()), self.config.size, self.config.interval);
        Ok(self.ring.install(ring))
    }

    fn max_size(&self) -> usize {
        self.config.size
    }

    fn destroy(mut self: Box<Self>) -> Result<(), ProbeError> {
        self.ring.release()
    }
}

/// two fixed blocks of the configured size; the second one doubles the interval
pub struct AlternatingTimeGenerator {
    config: SimpleConfig,
    ring: OwnedRing,
}
impl AlternatingTimeGenerator {
    pub fn new(config: SimpleConfig) -> AlternatingTimeGenerator {
        AlternatingTimeGenerator {
            config,
            ring: OwnedRing::default(),
        }
    }
}
impl PacketGenerator for AlternatingTimeGenerator {
    fn name(&self) -> &'static str {
        "alternate"
    }

    fn init(&mut self) -> Result<Arc<PacketRing>, ProbeError> {
        let ring = PacketRing::new(2, BLOCK_LEN)?;
        let normal = ring.first();
        fill_block(&mut ring.lock(normal), self.config.size, self.config.interval);
        fill_block(&mut ring.lock(ring.next(normal)), self.config.size, self.config.interval * 2);
        Ok(self.ring.install(ring))
    }

    fn max_size(&self) -> usize {
        self.config.size
    }

    fn destroy(mut self: Box<Self>) -> Result<(), ProbeError> {
        self.ring.release()
    }
}

/// one uniformly-random size per block, between the header size and the configured size
pub struct RandomSizeGenerator {
    config: SimpleConfig,
    rng: StdRng,
    ring: OwnedRing,
}
impl RandomSizeGenerator {
    pub fn new(config: SimpleConfig) -> RandomSizeGenerator {
        let rng = match config.seed {
            Some(seed) => StdRng::seed_from_u64(seed),
            None => StdRng::from_entropy(),
        };
        RandomSizeGenerator {
            config,
            rng,
            ring: OwnedRing::default(),
        }
    }
}
impl PacketGenerator for RandomSizeGenerator {
    fn name(&self) -> &'static str {
        "random"
    }

    fn init(&mut self) -> Result<Arc<PacketRing>, ProbeError> {
        let ring = PacketRing::new(4, BLOCK_LEN)?;
        let mut block = ring.first();
        loop {
            self.refill(&mut ring.lock(block));
            block = ring.next(block);
            if block == ring.first() {
                break;
            }
        }
        Ok(self.ring.install(ring))
    }

    fn max_size(&self) -> usize {
        self.config.size
    }

    fn is_dynamic(&self) -> bool {
        true
    }

    fn refill(&mut self, descriptors: &mut [PacketDescriptor]) {
        let size = self.rng.gen_range(MIN_PACKET_SIZE..=self.config.size);
        fill_block(descriptors, size, self.config.interval);
    }

    fn destroy(mut self: Box<Self>) -> Result<(), ProbeError> {
        self.ring.release()
    }
}
