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

pub mod clock;
pub mod cpu_affinity;
pub mod realtime;
pub mod shutdown;

use std::thread;

/// a panic-tolerant means of noting that a worker thread has ended
pub(crate) struct ThreadMonitor {
    role: &'static str,
}
impl ThreadMonitor {
    pub fn new(role: &'static str) -> ThreadMonitor {
        log::debug!("{} thread started", role);
        ThreadMonitor { role }
    }
}
impl Drop for ThreadMonitor {
    fn drop(&mut self) {
        if thread::panicking() {
            log::error!("{} thread exiting due to panic", self.role);
        } else {
            log::debug!("{} thread stopped", self.role);
        }
    }
}
