pub mod placement_algorithms;

use crate::FrameNumber;
use alloc::boxed::Box;
use alloc::vec;
use bitbybit::bitfield;
use physmem_shared::mem::PAGE_FRAME_SIZE;
use placement_algorithms::{NextFit, PlacementAlgorithm};

#[bitfield(u8, default = 0)]
pub struct CoreMapEntry {
    #[bit(0, rw)]
    allocated: bool,
}

/// The pool of raw frames underneath the frame table. Tracks which frames are
/// free and hands them out one at a time, with no idea what they back.
pub trait RawFrameAllocator {
    /// Allocate a single frame, or return [`None`] if the pool is exhausted.
    fn allocate_one(&mut self) -> Option<FrameNumber>;

    /// Return a previously allocated frame to the pool.
    fn release(&mut self, frame: FrameNumber);

    fn free_count(&self) -> usize;

    fn frame_count(&self) -> usize;

    /// Physical address of frame 0.
    fn pool_base(&self) -> usize;

    fn frame_size(&self) -> usize;
}

pub struct CoreMapAllocator<P = NextFit>
where
    P: PlacementAlgorithm,
{
    pool_base: usize,
    core_map: Box<[CoreMapEntry]>,
    placement_algorithm: P,
    frames_allocated: usize,
}

impl CoreMapAllocator {
    /// Create an allocator for `frame_count` frames of [`PAGE_FRAME_SIZE`]
    /// bytes starting at `pool_base`, placing frames with [`NextFit`].
    pub fn new_in(pool_base: usize, frame_count: usize) -> Self {
        Self::with_placement(pool_base, frame_count, NextFit::default())
    }
}

impl<P> CoreMapAllocator<P>
where
    P: PlacementAlgorithm,
{
    pub fn with_placement(pool_base: usize, frame_count: usize, placement_algorithm: P) -> Self {
        assert!(frame_count > 0, "a frame pool needs at least one frame");
        assert!(
            pool_base % PAGE_FRAME_SIZE == 0,
            "pool base {pool_base:#X} is not frame aligned"
        );

        CoreMapAllocator {
            pool_base,
            core_map: vec![CoreMapEntry::default(); frame_count].into_boxed_slice(),
            placement_algorithm,
            frames_allocated: 0,
        }
    }

    pub fn is_allocated(&self, frame: FrameNumber) -> bool {
        self.core_map
            .get(frame.0)
            .is_some_and(|entry| entry.allocated())
    }
}

impl<P> RawFrameAllocator for CoreMapAllocator<P>
where
    P: PlacementAlgorithm,
{
    fn allocate_one(&mut self) -> Option<FrameNumber> {
        if self.frames_allocated == self.core_map.len() {
            return None;
        }

        let index = self.placement_algorithm.place(&self.core_map)?;

        assert!(!self.core_map[index].allocated());
        self.core_map[index] = self.core_map[index].with_allocated(true);
        self.frames_allocated += 1;

        Some(FrameNumber(index))
    }

    fn release(&mut self, frame: FrameNumber) {
        let entry = self.core_map[frame.0];
        assert!(entry.allocated(), "frame {} released while free", frame.0);

        self.core_map[frame.0] = entry.with_allocated(false);
        self.frames_allocated -= 1;
    }

    fn free_count(&self) -> usize {
        self.core_map.len() - self.frames_allocated
    }

    fn frame_count(&self) -> usize {
        self.core_map.len()
    }

    fn pool_base(&self) -> usize {
        self.pool_base
    }

    fn frame_size(&self) -> usize {
        PAGE_FRAME_SIZE
    }
}
