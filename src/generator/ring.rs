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

use std::ops::{Deref, DerefMut};
use std::sync::{Arc, Mutex, MutexGuard, TryLockError};
use std::time::Duration;

use crate::error::{try_alloc, ProbeError};

/// the shape of one packet: how big it is and how long to wait after the previous one
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PacketDescriptor {
    pub size: usize,
    pub delay: Duration,
}

/// index of a block within its ring
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct BlockId(usize);
impl BlockId {
    pub fn index(&self) -> usize {
        self.0
    }
}

struct PacketBlock {
    descriptors: Mutex<Vec<PacketDescriptor>>,
    next: BlockId,
}

/// a fixed cycle of descriptor blocks shared by the generator (filling) and the sender (draining)
///
/// each block has its own lock; whoever holds a block's guard owns its contents outright,
/// and there is no lock spanning the whole ring
pub struct PacketRing {
    blocks: Vec<PacketBlock>,
    block_length: usize,
}
impl PacketRing {
    pub fn new(block_count: usize, block_length: usize) -> Result<PacketRing, ProbeError> {
        if block_count == 0 || block_length == 0 {
            return Err(ProbeError::Configuration(format!(
                "a packet ring needs at least one block of one descriptor, not {}x{}",
                block_count, block_length
            )));
        }

        let mut blocks = Vec::new();
        blocks
            .try_reserve_exact(block_count)
            .map_err(|e| ProbeError::Allocation(format!("packet ring of {} blocks: {}", block_count, e)))?;
        for idx in 0..block_count {
            blocks.push(PacketBlock {
                descriptors: Mutex::new(try_alloc(block_length, PacketDescriptor::default(), "packet block")?),
                next: BlockId((idx + 1) % block_count), //the last block wraps around to the first
            });
        }
        log::debug!("allocated packet ring of {} blocks, {} descriptors each", block_count, block_length);

        Ok(PacketRing { blocks, block_length })
    }

    pub fn block_count(&self) -> usize {
        self.blocks.len()
    }

    pub fn block_length(&self) -> usize {
        self.block_length
    }

    pub fn first(&self) -> BlockId {
        BlockId(0)
    }

    pub fn next(&self, block: BlockId) -> BlockId {
        self.blocks[block.0].next
    }

    /// waits for exclusive access to a block
    pub fn lock(&self, block: BlockId) -> BlockGuard<'_> {
        let descriptors = match self.blocks[block.0].descriptors.lock() {
            Ok(guard) => guard,
            Err(poisoned) => {
                log::error!("packet block {} was poisoned; a thread panicked while holding it", block.0);
                poisoned.into_inner()
            },
        };
        BlockGuard { id: block, descriptors }
    }

    /// takes a block only if nobody else holds it right now
    pub fn try_lock(&self, block: BlockId) -> Option<BlockGuard<'_>> {
        match self.blocks[block.0].descriptors.try_lock() {
            Ok(descriptors) => Some(BlockGuard { id: block, descriptors }),
            Err(TryLockError::WouldBlock) => None,
            Err(TryLockError::Poisoned(poisoned)) => {
                log::error!("packet block {} was poisoned; a thread panicked while holding it", block.0);
                Some(BlockGuard { id: block, descriptors: poisoned.into_inner() })
            },
        }
    }

    /// tears the ring down once nothing else can reach it
    ///
    /// fails if another handle to the ring is still alive (the sender or generator might
    /// still touch it) or if any block was poisoned mid-update
    pub fn destroy(ring: Arc<PacketRing>) -> Result<(), ProbeError> {
        let ring = Arc::try_unwrap(ring).map_err(|shared| {
            ProbeError::RingInUse(format!("{} other handles still reference it", Arc::strong_count(&shared) - 1))
        })?;

        let mut poisoned_blocks = Vec::new();
        for (idx, block) in ring.blocks.into_iter().enumerate() {
            if block.descriptors.into_inner().is_err() {
                poisoned_blocks.push(idx);
            }
        }
        if !poisoned_blocks.is_empty() {
            return Err(ProbeError::RingInUse(format!("blocks {:?} were poisoned", poisoned_blocks)));
        }
        log::debug!("packet ring released");
        Ok(())
    }
}

/// exclusive access to one block's descriptors; the block is released when this is dropped
pub struct BlockGuard<'a> {
    id: BlockId,
    descriptors: MutexGuard<'a, Vec<PacketDescriptor>>,
}
impl BlockGuard<'_> {
    pub fn id(&self) -> BlockId {
        self.id
    }
}
impl Deref for BlockGuard<'_> {
    type Target = [PacketDescriptor];

    fn deref(&self) -> &[PacketDescriptor] {
        &self.descriptors
    }
}
impl DerefMut for BlockGuard<'_> {
    fn deref_mut(&mut self) -> &mut [PacketDescriptor] {
        &mut self.descriptors
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use std::sync::atomic::{AtomicBool, AtomicU8, Ordering};
    use std::thread;

    use proptest::prelude::*;

    #[test]
    fn blocks_form_a_cycle() {
        let ring = PacketRing::new(4, 10).unwrap();
        let mut block = ring.first();
        for expected in [1, 2, 3, 0] {
            block = ring.next(block);
            assert_eq!(block.index(), expected);
        }
        assert_eq!(ring.lock(ring.first()).len(), 10);
    }

    #[test]
    fn single_block_ring_points_at_itself() {
        let ring = PacketRing::new(1, 3).unwrap();
        assert_eq!(ring.next(ring.first()), ring.first());
    }

    #[test]
    fn empty_rings_are_rejected() {
        assert!(matches!(PacketRing::new(0, 10), Err(ProbeError::Configuration(_))));
        assert!(matches!(PacketRing::new(2, 0), Err(ProbeError::Configuration(_))));
    }

    #[test]
    fn held_block_cannot_be_taken() {
        let ring = PacketRing::new(2, 1).unwrap();
        let held = ring.lock(ring.first());
        assert!(ring.try_lock(ring.first()).is_none());
        assert!(ring.try_lock(ring.next(ring.first())).is_some());
        drop(held);
        assert!(ring.try_lock(ring.first()).is_some());
    }

    #[test]
    fn destroy_refuses_shared_ring() {
        let ring = Arc::new(PacketRing::new(2, 2).unwrap());
        let other = Arc::clone(&ring);
        assert!(matches!(PacketRing::destroy(ring), Err(ProbeError::RingInUse(_))));
        assert!(PacketRing::destroy(other).is_ok());
    }

    const FREE: u8 = 0;
    const SENDER: u8 = 1;
    const GENERATOR: u8 = 2;

    /// drives a sender and a generator around the same ring, recording who believes they own
    /// each block; returns true if a conflict or a half-written block was ever observed
    fn drive_ring(block_count: usize, block_length: usize, laps: usize) -> bool {
        let ring = Arc::new(PacketRing::new(block_count, block_length).unwrap());
        let owners: Arc<Vec<AtomicU8>> = Arc::new((0..block_count).map(|_| AtomicU8::new(FREE)).collect());
        let violated = Arc::new(AtomicBool::new(false));
        let steps = block_count * laps;

        let claim = |owners: &[AtomicU8], violated: &AtomicBool, idx: usize, who: u8| {
            if owners[idx].compare_exchange(FREE, who, Ordering::SeqCst, Ordering::SeqCst).is_err() {
                violated.store(true, Ordering::SeqCst);
            }
        };
        let release = |owners: &[AtomicU8], idx: usize| owners[idx].store(FREE, Ordering::SeqCst);

        let generator = {
            let ring = Arc::clone(&ring);
            let owners = Arc::clone(&owners);
            let violated = Arc::clone(&violated);
            thread::spawn(move || {
                let mut block = ring.first();
                for fill in 0..steps {
                    let mut guard = ring.lock(block);
                    claim(&owners, &violated, block.index(), GENERATOR);
                    for descriptor in guard.iter_mut() {
                        descriptor.size = fill;
                        thread::yield_now();
                    }
                    release(&owners, block.index());
                    drop(guard);
                    block = ring.next(block);
                }
            })
        };

        let mut block = ring.first();
        for _ in 0..steps {
            if let Some(guard) = ring.try_lock(block) {
                claim(&owners, &violated, guard.id().index(), SENDER);
                let first = guard[0].size;
                if guard.iter().any(|descriptor| descriptor.size != first) {
                    violated.store(true, Ordering::SeqCst);
                }
                release(&owners, guard.id().index());
            }
            block = ring.next(block);
        }
        generator.join().unwrap();
        violated.load(Ordering::SeqCst)
    }

    proptest! {
        #![proptest_config(ProptestConfig::with_cases(32))]

        /// Property: a block is never owned by both parties, and never read half-filled
        #[test]
        fn prop_block_ownership_is_exclusive(
            block_count in 1usize..=4,
            block_length in 1usize..16,
            laps in 1usize..20,
        ) {
            prop_assert!(!drive_ring(block_count, block_length, laps));
        }
    }
}
