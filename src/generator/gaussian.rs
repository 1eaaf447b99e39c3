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
use rand::SeedableRng;
use rand_distr::{Distribution, Normal};

use crate::error::ProbeError;
use crate::protocol::header::MIN_PACKET_SIZE;

use super::ring::{PacketDescriptor, PacketRing};
use super::{parse_value, validate_size, GeneratorOptions, OwnedRing, PacketGenerator, BLOCK_LEN};

const DEFAULT_INTERVAL_US: u64 = 1000;

/// parameters for normally-distributed packet sizes
///
/// `max` (`m`): largest packet size in bytes; the mean is half of it
/// `sigma` (`s`): standard deviation in bytes, a third of the mean unless given
/// `interval` (`i`): time between two packets, in microseconds
/// `seed`: fixes the random sequence
#[derive(Debug, Clone, PartialEq)]
pub struct GaussianConfig {
    pub max: usize,
    pub sigma: Option<f64>,
    pub interval: Duration,
    pub seed: Option<u64>,
}
impl Default for GaussianConfig {
    fn default() -> GaussianConfig {
        GaussianConfig {
            max: 4 * MIN_PACKET_SIZE,
            sigma: None,
            interval: Duration::from_micros(DEFAULT_INTERVAL_US),
            seed: None,
        }
    }
}
impl GaussianConfig {
    pub fn from_options(options: &GeneratorOptions) -> Result<GaussianConfig, ProbeError> {
        let mut config = GaussianConfig::default();
        options.apply("gaussian", |name, value| {
            match name {
                "max" | "m" => config.max = parse_value(name, value)?,
                "sigma" | "s" => {
                    let sigma: f64 = parse_value(name, value)?;
                    if !sigma.is_finite() || sigma <= 0.0 {
                        return Err(ProbeError::Configuration(format!(
                            "sigma must be a positive number of bytes, not {}",
                            value
                        )));
                    }
                    config.sigma = Some(sigma);
                },
                "interval" | "i" => config.interval = Duration::from_micros(parse_value(name, value)?),
                "seed" => config.seed = Some(parse_value(name, value)?),
                _ => return Ok(false),
            }
            Ok(true)
        })?;
        config.max = validate_size("maximum packet size", config.max)?;
        Ok(config)
    }

    pub fn mean(&self) -> usize {
        self.max / 2
    }

    pub fn sigma(&self) -> f64 {
        self.sigma.unwrap_or((self.mean() / 3) as f64)
    }
}

/// packet sizes drawn independently per packet from a normal distribution (ziggurat sampling),
/// rounded and clamped to the valid size range
pub struct GaussianGenerator {
    config: GaussianConfig,
    distribution: Normal<f64>,
    rng: StdRng,
    ring: OwnedRing,
}
impl GaussianGenerator {
    pub fn new(config: GaussianConfig) -> Result<GaussianGenerator, ProbeError> {
        let distribution = Normal::new(0.0, config.sigma())
            .map_err(|e| ProbeError::Configuration(format!("invalid sigma {}: {}", config.sigma(), e)))?;
        let rng = match config.seed {
            Some(seed) => StdRng::seed_from_u64(seed),
            None => StdRng::from_entropy(),
        };
        log::debug!(
            "gaussian sizes: mean {} bytes, sigma {} bytes, capped at {}",
            config.mean(),
            config.sigma(),
            config.max
        );
        Ok(GaussianGenerator {
            config,
            distribution,
            rng,
            ring: OwnedRing::default(),
        })
    }

    fn sample_size(&mut self) -> usize {
        let offset = self.distribution.sample(&mut self.rng).round() as i64;
        let size = self.config.mean() as i64 + offset;
        size.clamp(MIN_PACKET_SIZE as i64, self.config.max as i64) as usize
    }
}
impl PacketGenerator for GaussianGenerator {
    fn name(&self) -> &'static str {
        "gaussian"
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
        self.config.max
    }

    fn is_dynamic(&self) -> bool {
        true
    }

    fn refill(&mut self, descriptors: &mut [PacketDescriptor]) {
        for descriptor in descriptors.iter_mut() {
            descriptor.size = self.sample_size();
            descriptor.delay = self.config.interval;
        }
    }

    fn destroy(mut self: Box<Self>) -> Result<(), ProbeError> {
        self.ring.release()
    }
}
