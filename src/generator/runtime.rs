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

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc::{channel, sync_channel, Receiver, Sender, SyncSender};
use std::sync::Arc;
use std::thread;

use crate::error::ProbeError;
use crate::utils::ThreadMonitor;

use super::ring::PacketRing;
use super::PacketGenerator;

/// what the sender receives once the generator has filled the ring
pub struct PreparedRing {
    pub ring: Arc<PacketRing>,
    pub max_size: usize,
}

/// asks the generator thread to regenerate the block the sender just left
#[derive(Clone)]
pub struct RefillHandle {
    control: Sender<()>,
}
impl RefillHandle {
    pub(crate) fn new(control: Sender<()>) -> RefillHandle {
        RefillHandle { control }
    }

    pub fn request(&self) {
        if self.control.send(()).is_err() {
            log::debug!("refill requested after the generator stopped");
        }
    }
}

/// a generator running on its own thread
///
/// the thread fills the whole ring, reports readiness exactly once, then refills one block per
/// request, trailing the sender by one lap, until it is shut down
pub struct GeneratorRuntime {
    handle: thread::JoinHandle<Box<dyn PacketGenerator>>,
    control: Sender<()>,
    ready: Receiver<Result<PreparedRing, ProbeError>>,
    cancelled: Arc<AtomicBool>,
}
impl GeneratorRuntime {
    pub fn spawn(
        generator: Box<dyn PacketGenerator>,
        core: Option<core_affinity::CoreId>,
    ) -> Result<GeneratorRuntime, ProbeError> {
        let (control_tx, control_rx) = channel();
        let (ready_tx, ready_rx) = sync_channel(1);
        let cancelled = Arc::new(AtomicBool::new(false));

        let c_cancelled = Arc::clone(&cancelled);
        let handle = thread::Builder::new()
            .name(format!("generator-{}", generator.name()))
            .spawn(move || {
                let _thread_monitor = ThreadMonitor::new("generator");
                if let Some(core_id) = core {
                    if !core_affinity::set_for_current(core_id) {
                        log::warn!("unable to pin generator to CPU {}", core_id.id);
                    }
                }
                run_generator(generator, control_rx, ready_tx, &c_cancelled)
            })
            .map_err(|e| ProbeError::Thread(format!("unable to start generator thread: {}", e)))?;

        Ok(GeneratorRuntime {
            handle,
            control: control_tx,
            ready: ready_rx,
            cancelled,
        })
    }

    /// blocks until the ring is completely filled
    pub fn wait_ready(&self) -> Result<PreparedRing, ProbeError> {
        match self.ready.recv() {
            Ok(prepared) => prepared,
            Err(_) => Err(ProbeError::Thread("generator exited before the ring was ready".to_string())),
        }
    }

    pub fn refill_handle(&self) -> RefillHandle {
        RefillHandle::new(self.control.clone())
    }

    /// stops the thread, waits for it, and destroys the generator
    ///
    /// every other handle on the ring must already be gone, or destroying it fails
    pub fn shutdown(self) -> Result<(), ProbeError> {
        let GeneratorRuntime { handle, control, cancelled, .. } = self;

        cancelled.store(true, Ordering::Release);
        control.send(()).unwrap_or_default(); //wake it if it is idle
        drop(control);

        log::debug!("waiting for the generator to stop");
        match handle.join() {
            Ok(generator) => generator.destroy(),
            Err(e) => Err(ProbeError::Thread(format!("generator panicked: {:?}", e))),
        }
    }
}

fn run_generator(
    mut generator: Box<dyn PacketGenerator>,
    control: Receiver<()>,
    ready: SyncSender<Result<PreparedRing, ProbeError>>,
    cancelled: &AtomicBool,
) -> Box<dyn PacketGenerator> {
    let ring = match generator.init() {
        Ok(ring) => ring,
        Err(e) => {
            log::error!("unable to initialise generator {}: {}", generator.name(), e);
            ready.send(Err(e)).unwrap_or_default();
            return generator;
        },
    };
    log::debug!(
        "generator {} filled {} blocks; largest packet {} bytes",
        generator.name(),
        ring.block_count(),
        generator.max_size()
    );

    let prepared = PreparedRing {
        ring: Arc::clone(&ring),
        max_size: generator.max_size(),
    };
    if ready.send(Ok(prepared)).is_err() {
        log::debug!("nobody is waiting for generator {}", generator.name());
        return generator;
    }

    let dynamic = generator.is_dynamic();
    let mut current = ring.first();
    let mut refills: u64 = 0;
    //cancellation is only observed here, between refills, never while a block is held
    while control.recv().is_ok() {
        if cancelled.load(Ordering::Acquire) {
            break;
        }
        if !dynamic {
            continue;
        }

        {
            let mut block = ring.lock(current);
            generator.refill(&mut block);
        }
        log::trace!("generator {} refilled block {}", generator.name(), current.index());
        current = ring.next(current);
        refills += 1;
    }
    log::debug!("generator {} stopping after {} refills", generator.name(), refills);
    generator
}

#[cfg(test)]
mod tests {
    use super::*;

    use std::time::{Duration, Instant};

    use crate::generator::create;
    use crate::generator::ring::PacketDescriptor;

    /// marks each refill with an increasing size so tests can see which block was touched
    struct CountingGenerator {
        refills: usize,
        ring: crate::generator::OwnedRing,
    }
    impl PacketGenerator for CountingGenerator {
        fn name(&self) -> &'static str {
            "counting"
        }

        fn init(&mut self) -> Result<Arc<PacketRing>, ProbeError> {
            let ring = PacketRing::new(3, 2)?;
            Ok(self.ring.install(ring))
        }

        fn max_size(&self) -> usize {
            100
        }

        fn is_dynamic(&self) -> bool {
            true
        }

        fn refill(&mut self, descriptors: &mut [PacketDescriptor]) {
            self.refills += 1;
            for descriptor in descriptors.iter_mut() {
                descriptor.size = self.refills;
            }
        }

        fn destroy(mut self: Box<Self>) -> Result<(), ProbeError> {
            self.ring.release()
        }
    }

    fn wait_for_size(ring: &PacketRing, block: crate::generator::ring::BlockId, size: usize) {
        let started = Instant::now();
        while ring.lock(block)[0].size != size {
            assert!(started.elapsed() < Duration::from_secs(5), "block {} never reached {}", block.index(), size);
            thread::sleep(Duration::from_millis(1));
        }
    }

    #[test]
    fn refills_trail_the_sender_by_one_lap() {
        let generator = Box::new(CountingGenerator {
            refills: 0,
            ring: Default::default(),
        });
        let runtime = GeneratorRuntime::spawn(generator, None).unwrap();
        let prepared = runtime.wait_ready().unwrap();
        let ring = Arc::clone(&prepared.ring);
        assert_eq!(prepared.max_size, 100);
        drop(prepared);

        let refill = runtime.refill_handle();
        let first = ring.first();
        let second = ring.next(first);

        //the sender moved from the first block to the second and asked for a refill
        let held = ring.lock(second);
        refill.request();
        drop(held);
        wait_for_size(&ring, first, 1);

        //next lap step: the second block is refilled
        refill.request();
        wait_for_size(&ring, second, 2);
        assert_eq!(ring.lock(ring.next(second))[0].size, 0);

        drop(refill);
        drop(ring);
        runtime.shutdown().unwrap();
    }

    #[test]
    fn static_generators_ignore_refill_requests() {
        let runtime = GeneratorRuntime::spawn(create("static", Some("size=50")).unwrap(), None).unwrap();
        let prepared = runtime.wait_ready().unwrap();
        assert_eq!(prepared.max_size, 50);
        let refill = runtime.refill_handle();
        for _ in 0..5 {
            refill.request();
        }
        assert!(prepared.ring.lock(prepared.ring.first()).iter().all(|d| d.size == 50));
        drop(prepared);
        runtime.shutdown().unwrap();
    }

    #[test]
    fn shutdown_reports_a_ring_still_in_use() {
        let runtime = GeneratorRuntime::spawn(create("gaussian", None).unwrap(), None).unwrap();
        let prepared = runtime.wait_ready().unwrap();
        assert!(matches!(runtime.shutdown(), Err(ProbeError::RingInUse(_))));
        drop(prepared);
    }

    struct BrokenGenerator;
    impl PacketGenerator for BrokenGenerator {
        fn name(&self) -> &'static str {
            "broken"
        }

        fn init(&mut self) -> Result<Arc<PacketRing>, ProbeError> {
            Err(ProbeError::Allocation("test ring".to_string()))
        }

        fn max_size(&self) -> usize {
            0
        }

        fn destroy(self: Box<Self>) -> Result<(), ProbeError> {
            Ok(())
        }
    }

    #[test]
    fn init_failure_reaches_the_waiter() {
        let runtime = GeneratorRuntime::spawn(Box::new(BrokenGenerator), None).unwrap();
        assert!(matches!(runtime.wait_ready(), Err(ProbeError::Allocation(_))));
        runtime.shutdown().unwrap();
    }
}
