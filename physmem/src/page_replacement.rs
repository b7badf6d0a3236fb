use crate::frame_allocator::RawFrameAllocator;
use crate::frame_table::{FrameDescriptor, FrameTable};
use crate::region::RegionTable;
use crate::{FrameNumber, PhysMemError};

/// What a sweep did to free its frame.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct SweepOutcome {
    /// The frame that was reclaimed and returned to the allocator.
    pub victim: FrameNumber,
    /// The mapping the victim held before it was evicted.
    pub evicted: FrameDescriptor,
    /// Slots visited, including the victim.
    pub visited: usize,
    /// Slots given a second chance on the way.
    pub swept: usize,
}

pub trait PageReplacementPolicy {
    /// Free exactly one frame if the allocator has none left.
    ///
    /// Returns [`None`] without touching anything when a frame is already
    /// free. Otherwise the victim's owner is told to evict its page, the
    /// victim's slot is cleared and the frame is released to `allocator`.
    fn evict_page<A, R>(
        &mut self,
        frames: &mut FrameTable,
        allocator: &mut A,
        regions: &mut R,
    ) -> Result<Option<SweepOutcome>, PhysMemError>
    where
        A: RawFrameAllocator + ?Sized,
        R: RegionTable + ?Sized;
}

/// Second chance replacement with a single hand over the frame table.
#[derive(Debug, Default)]
pub struct ClockSweep {
    hand: usize,
}

impl ClockSweep {
    pub const fn new() -> Self {
        ClockSweep { hand: 0 }
    }

    /// The slot the next sweep starts at.
    pub fn hand(&self) -> usize {
        self.hand
    }

    fn advance(&mut self, size: usize) {
        self.hand = (self.hand + 1) % size;
    }
}

impl PageReplacementPolicy for ClockSweep {
    fn evict_page<A, R>(
        &mut self,
        frames: &mut FrameTable,
        allocator: &mut A,
        regions: &mut R,
    ) -> Result<Option<SweepOutcome>, PhysMemError>
    where
        A: RawFrameAllocator + ?Sized,
        R: RegionTable + ?Sized,
    {
        if allocator.free_count() > 0 {
            return Ok(None);
        }

        let size = frames.size();

        // Sweeping clears every reference bit on the first revolution, so the
        // second revolution must evict at its first slot. Anything longer
        // means a region is not honouring mark_swept.
        let limit = 2 * size;
        let mut visited = 0;
        let mut swept = 0;

        while visited < limit {
            let index = self.hand;

            // A full pool has a descriptor in every slot.
            let Some(descriptor) = *frames.slot_at(index) else {
                return Err(PhysMemError::AllocationInvariantViolation.violated());
            };
            let FrameDescriptor { mapped_page, owner } = descriptor;

            let Some(region) = regions.region_mut(owner) else {
                log::error!("frame {index} is owned by unknown region {owner:?}");
                return Err(PhysMemError::UnknownRegion(owner));
            };

            visited += 1;
            self.advance(size);

            if region.should_evict(mapped_page) {
                region.evict(mapped_page);
                *frames.slot_at(index) = None;
                allocator.release(FrameNumber(index));

                log::debug!(
                    "clock evicted page {:#X} of {owner:?} from frame {index} after {visited} slots",
                    mapped_page.0
                );

                return Ok(Some(SweepOutcome {
                    victim: FrameNumber(index),
                    evicted: descriptor,
                    visited,
                    swept,
                }));
            }

            region.mark_swept(mapped_page);
            swept += 1;
            log::trace!("clock gave page {:#X} in frame {index} a second chance", mapped_page.0);
        }

        Err(PhysMemError::SweepDidNotConverge { visited }.violated())
    }
}
