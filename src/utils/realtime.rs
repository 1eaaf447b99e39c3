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

use crate::BoxResult;

/// SCHED_RR priority above the platform minimum for a sending client
pub const CLIENT_PRIORITY_OFFSET: i32 = 60;
/// SCHED_RR priority above the platform minimum for a server
pub const SERVER_PRIORITY_OFFSET: i32 = 20;
/// how far the echo receiver drops below the sender
pub const ECHO_PRIORITY_REDUCTION: i32 = 10;

cfg_if::cfg_if! {
    if #[cfg(target_os = "linux")] {
        use nix::sys::mman::{mlockall, MlockAllFlags};
        use nix::sys::resource::{getrusage, UsageWho};

        /// pins every current and future page of the process in RAM
        pub fn lock_memory() -> BoxResult<()> {
            mlockall(MlockAllFlags::MCL_CURRENT | MlockAllFlags::MCL_FUTURE)?;
            Ok(())
        }

        /// moves the whole process onto SCHED_RR at `offset` above the minimum priority
        pub fn set_process_priority(offset: i32) -> BoxResult<i32> {
            let minimum = unsafe { libc::sched_get_priority_min(libc::SCHED_RR) };
            let maximum = unsafe { libc::sched_get_priority_max(libc::SCHED_RR) };
            if minimum < 0 || maximum < 0 {
                return Err(Box::new(simple_error::simple_error!("SCHED_RR priorities are unavailable")));
            }
            let priority = (minimum + offset).min(maximum);

            let mut param: libc::sched_param = unsafe { std::mem::zeroed() };
            param.sched_priority = priority;
            if unsafe { libc::sched_setscheduler(0, libc::SCHED_RR, &param) } != 0 {
                return Err(Box::new(std::io::Error::last_os_error()));
            }
            Ok(priority)
        }

        /// drops the calling thread's priority by `reduction`, never below its policy's minimum
        pub fn lower_thread_priority(reduction: i32) -> BoxResult<i32> {
            let thread = unsafe { libc::pthread_self() };
            let mut policy: libc::c_int = 0;
            let mut param: libc::sched_param = unsafe { std::mem::zeroed() };
            let status = unsafe { libc::pthread_getschedparam(thread, &mut policy, &mut param) };
            if status != 0 {
                return Err(Box::new(std::io::Error::from_raw_os_error(status)));
            }

            let minimum = unsafe { libc::sched_get_priority_min(policy) };
            param.sched_priority = (param.sched_priority - reduction).max(minimum);
            let status = unsafe { libc::pthread_setschedparam(thread, policy, &param) };
            if status != 0 {
                return Err(Box::new(std::io::Error::from_raw_os_error(status)));
            }
            Ok(param.sched_priority)
        }

        /// major and minor page-fault counters for the whole process
        #[derive(Debug, Clone, Copy, PartialEq, Eq)]
        pub struct PageFaults {
            pub major: i64,
            pub minor: i64,
        }
        impl PageFaults {
            pub fn sample() -> Option<PageFaults> {
                match getrusage(UsageWho::RUSAGE_SELF) {
                    Ok(usage) => Some(PageFaults {
                        major: usage.major_page_faults() as i64,
                        minor: usage.minor_page_faults() as i64,
                    }),
                    Err(e) => {
                        log::debug!("unable to read resource usage: {}", e);
                        None
                    },
                }
            }
        }
    } else {
        pub fn lock_memory() -> BoxResult<()> {
            Err(Box::new(simple_error::simple_error!("memory locking is not supported on this platform")))
        }

        pub fn set_process_priority(_offset: i32) -> BoxResult<i32> {
            Err(Box::new(simple_error::simple_error!("real-time scheduling is not supported on this platform")))
        }

        pub fn lower_thread_priority(_reduction: i32) -> BoxResult<i32> {
            Err(Box::new(simple_error::simple_error!("thread priorities are not supported on this platform")))
        }

        #[derive(Debug, Clone, Copy, PartialEq, Eq)]
        pub struct PageFaults {
            pub major: i64,
            pub minor: i64,
        }
        impl PageFaults {
            pub fn sample() -> Option<PageFaults> {
                None
            }
        }
    }
}

/// best-effort real-time setup for the calling process; every failure is only a warning
pub fn enter_real_time(priority_offset: i32) {
    match lock_memory() {
        Ok(_) => log::debug!("locked process memory"),
        Err(e) => log::warn!("unable to lock memory: {}", e),
    }
    match set_process_priority(priority_offset) {
        Ok(priority) => log::info!("running with SCHED_RR priority {}", priority),
        Err(e) => log::warn!("unable to set real-time priority: {}", e),
    }
}

/// logs the page faults taken between two samples; major faults in the timed section hurt precision
pub fn report_page_faults(before: Option<PageFaults>, after: Option<PageFaults>) {
    if let (Some(before), Some(after)) = (before, after) {
        let major = after.major - before.major;
        let minor = after.minor - before.minor;
        if major > 0 {
            log::warn!("{} major and {} minor page faults while sending", major, minor);
        } else {
            log::debug!("{} minor page faults while sending", minor);
        }
    }
}
