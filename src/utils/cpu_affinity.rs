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

use core_affinity::CoreId;

use crate::error::ProbeError;

/// hands out CPU cores round-robin to the threads of a session
pub struct CpuAffinityManager {
    enabled_cores: Vec<CoreId>,
    last_core_pointer: usize,
}
impl CpuAffinityManager {
    /// `cores` is a comma-separated list of logical CPU numbers; empty disables pinning
    pub fn new(cores: &str) -> Result<CpuAffinityManager, ProbeError> {
        let core_ids = core_affinity::get_core_ids().unwrap_or_default();
        log::debug!("enumerated CPU cores: {:?}", core_ids.iter().map(|c| c.id).collect::<Vec<usize>>());

        let mut enabled_cores = Vec::new();
        for cid in cores.split(',').map(str::trim) {
            if cid.is_empty() {
                continue;
            }
            let cid_usize: usize = cid
                .parse()
                .map_err(|e| ProbeError::Configuration(format!("invalid CPU core '{}': {}", cid, e)))?;
            match core_ids.iter().find(|core_id| core_id.id == cid_usize) {
                Some(core_id) => enabled_cores.push(*core_id),
                None => log::warn!("unrecognised CPU core: {}", cid_usize),
            }
        }
        if !enabled_cores.is_empty() {
            log::debug!("selecting from CPU cores {:?}", enabled_cores.iter().map(|c| c.id).collect::<Vec<usize>>());
        } else {
            log::debug!("not applying CPU core affinity");
        }

        Ok(CpuAffinityManager {
            enabled_cores,
            last_core_pointer: 0,
        })
    }

    /// the core for the next thread to be started, if pinning is enabled
    pub fn next_core(&mut self) -> Option<CoreId> {
        if self.enabled_cores.is_empty() {
            return None;
        }
        let core_id = self.enabled_cores[self.last_core_pointer];
        //cycle to the next option in a round-robin order
        self.last_core_pointer = (self.last_core_pointer + 1) % self.enabled_cores.len();
        Some(core_id)
    }

    /// pins the calling thread to the next core
    pub fn set_affinity(&mut self, role: &str) {
        match self.next_core() {
            Some(core_id) => {
                log::debug!("pinning {} to CPU {}", role, core_id.id);
                if !core_affinity::set_for_current(core_id) {
                    log::warn!("unable to pin {} to CPU {}", role, core_id.id);
                }
            },
            None => log::debug!("CPU affinity is not configured; {} may run anywhere", role),
        }
    }
}
