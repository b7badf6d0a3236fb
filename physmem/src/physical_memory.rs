use crate::frame_allocator::{CoreMapAllocator, RawFrameAllocator};
use crate::frame_table::{FrameDescriptor, FrameTable};
use crate::page_replacement::{ClockSweep, PageReplacementPolicy};
use crate::region::{RegionId, RegionTable};
use crate::{FrameNumber, PhysMemError, VirtPage};
use alloc::vec::Vec;
use physmem_shared::mem::DEFAULT_POOL_BASE;

/// Running totals since the manager was created.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct PhysMemStats {
    pub acquisitions: usize,
    pub releases: usize,
    /// Sweeps run, one per acquisition that found the pool full.
    pub sweeps: usize,
    pub evictions: usize,
    /// Pages given a second chance.
    pub pages_swept: usize,
    pub slots_visited: usize,
}

/// Hands out physical frames to back virtual pages, reclaiming one with the
/// clock when none are free.
///
/// Not internally synchronized. Every mutating call takes `&mut self`, so an
/// embedding that shares the manager wraps the whole thing in one lock and
/// each sweep-then-allocate sequence runs under it.
pub struct PhysicalMemory<A = CoreMapAllocator>
where
    A: RawFrameAllocator,
{
    frames: FrameTable,
    allocator: A,
    clock: ClockSweep,
    stats: PhysMemStats,
}

impl PhysicalMemory {
    /// A manager for `frame_count` frames starting at [`DEFAULT_POOL_BASE`].
    pub fn new(frame_count: usize) -> Self {
        Self::with_allocator(CoreMapAllocator::new_in(DEFAULT_POOL_BASE, frame_count))
    }
}

impl<A> PhysicalMemory<A>
where
    A: RawFrameAllocator,
{
    /// Take over every frame of `allocator`, which must not have handed any
    /// out yet.
    pub fn with_allocator(allocator: A) -> Self {
        let frame_count = allocator.frame_count();
        assert!(frame_count > 0, "a frame pool needs at least one frame");
        assert_eq!(
            allocator.free_count(),
            frame_count,
            "frame allocator was already in use"
        );

        PhysicalMemory {
            frames: FrameTable::new(allocator.pool_base(), allocator.frame_size(), frame_count),
            allocator,
            clock: ClockSweep::new(),
            stats: PhysMemStats::default(),
        }
    }

    /// Get a frame to back `mapped_page` of region `owner`, evicting another
    /// page first if the pool is full.
    ///
    /// `regions` must resolve `owner` and the owner of every mapped frame.
    /// Regions must stay in `regions` until their frames are released (see
    /// [`PhysicalMemory::release_region`]).
    ///
    /// # Errors
    ///
    /// [`PhysMemError::UnknownRegion`] if `owner` or a swept frame's owner is
    /// missing from `regions`. [`PhysMemError::AllocationInvariantViolation`]
    /// if the pool is still empty after a frame was reclaimed, and
    /// [`PhysMemError::SweepDidNotConverge`] if a region never lets its pages
    /// go. Neither of the last two is worth retrying.
    pub fn acquire_frame<R>(
        &mut self,
        mapped_page: VirtPage,
        owner: RegionId,
        regions: &mut R,
    ) -> Result<FrameNumber, PhysMemError>
    where
        R: RegionTable + ?Sized,
    {
        if regions.region_mut(owner).is_none() {
            return Err(PhysMemError::UnknownRegion(owner));
        }

        if let Some(outcome) =
            self.clock
                .evict_page(&mut self.frames, &mut self.allocator, regions)?
        {
            self.stats.sweeps += 1;
            self.stats.evictions += 1;
            self.stats.pages_swept += outcome.swept;
            self.stats.slots_visited += outcome.visited;
        }

        if self.allocator.free_count() == 0 {
            return Err(PhysMemError::AllocationInvariantViolation.violated());
        }

        let Some(frame) = self.allocator.allocate_one() else {
            return Err(PhysMemError::AllocationInvariantViolation.violated());
        };
        if frame.0 >= self.frames.size() {
            return Err(PhysMemError::FrameOutOfRange(frame).violated());
        }

        let slot = self.frames.slot_at(frame.0);
        if slot.is_some() {
            // The allocator handed out a frame that still backs a page.
            return Err(PhysMemError::AllocationInvariantViolation.violated());
        }
        *slot = Some(FrameDescriptor { mapped_page, owner });
        self.stats.acquisitions += 1;

        log::trace!(
            "frame {} now backs page {:#X} of {owner:?}",
            frame.0,
            mapped_page.0
        );
        self.debug_check_accounting();

        Ok(frame)
    }

    /// Give back a frame whose page the owner unmapped on its own.
    pub fn release_frame(&mut self, frame: FrameNumber) -> Result<FrameDescriptor, PhysMemError> {
        if frame.0 >= self.frames.size() {
            return Err(PhysMemError::FrameOutOfRange(frame));
        }

        let descriptor = self
            .frames
            .slot_at(frame.0)
            .take()
            .ok_or(PhysMemError::FrameNotInUse(frame))?;
        self.allocator.release(frame);
        self.stats.releases += 1;
        self.debug_check_accounting();

        Ok(descriptor)
    }

    /// Release every frame held by `owner`, returning how many there were.
    /// Call this before a region is destroyed so no descriptor outlives it.
    pub fn release_region(&mut self, owner: RegionId) -> usize {
        let held: Vec<FrameNumber> = self
            .frames
            .iter()
            .filter(|(_, descriptor)| descriptor.owner == owner)
            .map(|(frame, _)| frame)
            .collect();

        for &frame in &held {
            *self.frames.slot_at(frame.0) = None;
            self.allocator.release(frame);
        }

        self.stats.releases += held.len();
        log::debug!("released {} frames of {owner:?}", held.len());
        self.debug_check_accounting();

        held.len()
    }

    pub fn descriptor(&self, frame: FrameNumber) -> Option<FrameDescriptor> {
        self.frames.get(frame.0).copied()
    }

    /// Number of free frames.
    pub fn nfree(&self) -> usize {
        self.allocator.free_count()
    }

    pub fn frame_count(&self) -> usize {
        self.frames.size()
    }

    /// The slot the next sweep starts at.
    pub fn clock_hand(&self) -> usize {
        self.clock.hand()
    }

    pub fn frame_address(&self, frame: FrameNumber) -> Option<usize> {
        self.frames.address_of(frame.0)
    }

    pub fn frame_at_address(&self, address: usize) -> Option<FrameNumber> {
        self.frames.index_of(address).map(FrameNumber)
    }

    pub fn frames(&self) -> &FrameTable {
        &self.frames
    }

    pub fn stats(&self) -> PhysMemStats {
        self.stats
    }

    fn debug_check_accounting(&self) {
        debug_assert_eq!(
            self.allocator.free_count(),
            self.frames.size() - self.frames.occupied(),
            "free frame count disagrees with the frame table"
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::vma::{Vma, VmaKind};
    use crate::{FirstFit, VirtualMemoryRegion};
    use alloc::boxed::Box;
    use alloc::collections::BTreeMap;
    use physmem_shared::mem::{frames_in, PAGE_FRAME_SIZE};
    use physmem_shared::sizes::{KB, MB};
    use rand::{rngs::StdRng, Rng, SeedableRng};
    use std::error::Error;

    /// A region whose pages report a fixed reference bit until swept.
    struct Scripted {
        referenced: BTreeMap<VirtPage, bool>,
        events: Vec<(&'static str, usize)>,
    }

    impl Scripted {
        fn new(referenced: &[bool]) -> Self {
            Scripted {
                referenced: referenced
                    .iter()
                    .enumerate()
                    .map(|(page, &bit)| (VirtPage(page), bit))
                    .collect(),
                events: Vec::new(),
            }
        }
    }

    impl VirtualMemoryRegion for Scripted {
        fn should_evict(&self, page: VirtPage) -> bool {
            !self.referenced.get(&page).copied().unwrap_or(false)
        }

        fn evict(&mut self, page: VirtPage) {
            self.referenced.remove(&page);
            self.events.push(("evict", page.0));
        }

        fn mark_swept(&mut self, page: VirtPage) {
            self.referenced.insert(page, false);
            self.events.push(("sweep", page.0));
        }
    }

    /// Never lets go of a page: the reference bit survives sweeping.
    struct Stubborn;

    impl VirtualMemoryRegion for Stubborn {
        fn should_evict(&self, _page: VirtPage) -> bool {
            false
        }

        fn evict(&mut self, _page: VirtPage) {
            unreachable!("stubborn pages are never evicted");
        }

        fn mark_swept(&mut self, _page: VirtPage) {}
    }

    /// Forgets to put released frames back in the pool.
    struct Leaky(CoreMapAllocator);

    impl RawFrameAllocator for Leaky {
        fn allocate_one(&mut self) -> Option<FrameNumber> {
            self.0.allocate_one()
        }

        fn release(&mut self, _frame: FrameNumber) {}

        fn free_count(&self) -> usize {
            self.0.free_count()
        }

        fn frame_count(&self) -> usize {
            self.0.frame_count()
        }

        fn pool_base(&self) -> usize {
            self.0.pool_base()
        }

        fn frame_size(&self) -> usize {
            self.0.frame_size()
        }
    }

    const OWNER: RegionId = RegionId(0);

    #[test]
    fn fills_pool_without_sweeping() -> Result<(), Box<dyn Error>> {
        for size in 1..=8 {
            let mut memory = PhysicalMemory::new(size);
            let mut regions = vec![Scripted::new(&vec![false; size])];

            for page in 0..size {
                memory.acquire_frame(VirtPage(page), OWNER, &mut regions)?;
            }

            assert_eq!(memory.nfree(), 0);
            assert_eq!(memory.stats().sweeps, 0);
            assert_eq!(memory.clock_hand(), 0);
            assert!(regions[0].events.is_empty());
        }
        Ok(())
    }

    #[test]
    fn descriptor_matches_request() -> Result<(), Box<dyn Error>> {
        let mut memory = PhysicalMemory::new(4);
        let mut regions = vec![Scripted::new(&[false; 8]), Scripted::new(&[false; 8])];

        let frame = memory.acquire_frame(VirtPage(5), RegionId(1), &mut regions)?;
        assert_eq!(
            memory.descriptor(frame),
            Some(FrameDescriptor {
                mapped_page: VirtPage(5),
                owner: RegionId(1),
            })
        );
        assert_eq!(memory.nfree(), 3);
        assert_eq!(memory.stats().acquisitions, 1);
        Ok(())
    }

    #[test]
    fn three_frame_scenario() -> Result<(), Box<dyn Error>> {
        let mut memory = PhysicalMemory::new(3);
        let mut regions = vec![Scripted::new(&[true, true, false])];

        for page in 0..3 {
            let frame = memory.acquire_frame(VirtPage(page), OWNER, &mut regions)?;
            assert_eq!(frame, FrameNumber(page));
        }

        let frame = memory.acquire_frame(VirtPage(3), OWNER, &mut regions)?;

        assert_eq!(
            regions[0].events,
            [("sweep", 0), ("sweep", 1), ("evict", 2)]
        );
        assert_eq!(memory.clock_hand(), 0);
        assert_eq!(frame, FrameNumber(2));
        assert_eq!(
            memory.descriptor(frame),
            Some(FrameDescriptor {
                mapped_page: VirtPage(3),
                owner: OWNER,
            })
        );

        let stats = memory.stats();
        assert_eq!(stats.sweeps, 1);
        assert_eq!(stats.evictions, 1);
        assert_eq!(stats.pages_swept, 2);
        assert_eq!(stats.slots_visited, 3);
        Ok(())
    }

    #[test]
    fn one_frame_scenario() -> Result<(), Box<dyn Error>> {
        let mut memory = PhysicalMemory::new(1);
        let mut regions = vec![Scripted::new(&[false, false])];

        memory.acquire_frame(VirtPage(0), OWNER, &mut regions)?;
        let frame = memory.acquire_frame(VirtPage(1), OWNER, &mut regions)?;

        assert_eq!(frame, FrameNumber(0));
        assert_eq!(regions[0].events, [("evict", 0)]);
        assert_eq!(memory.clock_hand(), 0);
        assert_eq!(memory.stats().slots_visited, 1);
        Ok(())
    }

    #[test]
    fn alternating_bits_converge_within_two_revolutions() -> Result<(), Box<dyn Error>> {
        for size in 1..=9 {
            let mut memory = PhysicalMemory::new(size);
            let pattern: Vec<bool> = (0..4 * size).map(|page| page % 2 == 0).collect();
            let mut regions = vec![Scripted::new(&pattern)];

            for page in 0..size {
                memory.acquire_frame(VirtPage(page), OWNER, &mut regions)?;
            }

            for page in size..4 * size {
                let before = memory.stats();
                memory.acquire_frame(VirtPage(page), OWNER, &mut regions)?;
                let after = memory.stats();

                assert_eq!(after.evictions - before.evictions, 1);
                assert!(after.slots_visited - before.slots_visited <= 2 * size);
                assert_eq!(memory.nfree(), 0);
            }
        }
        Ok(())
    }

    #[test]
    fn hand_moves_forward_with_each_eviction() -> Result<(), Box<dyn Error>> {
        let size = 5;
        let mut memory = PhysicalMemory::new(size);
        let mut regions = vec![Scripted::new(&vec![false; 4 * size])];

        for page in 0..size {
            memory.acquire_frame(VirtPage(page), OWNER, &mut regions)?;
        }

        // Nothing is referenced, so each sweep evicts where the hand stands.
        for (step, page) in (size..4 * size).enumerate() {
            let hand = memory.clock_hand();
            assert_eq!(hand, step % size);

            let frame = memory.acquire_frame(VirtPage(page), OWNER, &mut regions)?;
            assert_eq!(frame, FrameNumber(hand));
            assert_eq!(memory.clock_hand(), (hand + 1) % size);
        }
        Ok(())
    }

    #[test]
    fn swept_slot_is_not_passed_over_twice() -> Result<(), Box<dyn Error>> {
        let size = 4;
        let mut memory = PhysicalMemory::new(size);
        let mut regions = vec![Scripted::new(&vec![true; 2 * size])];

        for page in 0..size {
            memory.acquire_frame(VirtPage(page), OWNER, &mut regions)?;
        }
        memory.acquire_frame(VirtPage(size), OWNER, &mut regions)?;

        for page in 0..size {
            let sweeps = regions[0]
                .events
                .iter()
                .filter(|&&event| event == ("sweep", page))
                .count();
            assert!(sweeps <= 1, "page {page} swept {sweeps} times");
        }
        assert_eq!(regions[0].events.last(), Some(&("evict", 0)));
        Ok(())
    }

    #[test]
    #[cfg(not(feature = "fatal_invariants"))]
    fn stubborn_region_does_not_spin_forever() -> Result<(), Box<dyn Error>> {
        let mut memory = PhysicalMemory::new(3);
        let mut regions = vec![Stubborn];

        for page in 0..3 {
            memory.acquire_frame(VirtPage(page), OWNER, &mut regions)?;
        }

        assert_eq!(
            memory.acquire_frame(VirtPage(3), OWNER, &mut regions),
            Err(PhysMemError::SweepDidNotConverge { visited: 6 })
        );
        Ok(())
    }

    #[test]
    #[cfg(not(feature = "fatal_invariants"))]
    fn leaked_frame_is_an_invariant_violation() -> Result<(), Box<dyn Error>> {
        let mut memory = PhysicalMemory::with_allocator(Leaky(CoreMapAllocator::new_in(MB, 2)));
        let mut regions = vec![Scripted::new(&[false; 3])];

        memory.acquire_frame(VirtPage(0), OWNER, &mut regions)?;
        memory.acquire_frame(VirtPage(1), OWNER, &mut regions)?;

        let error = memory.acquire_frame(VirtPage(2), OWNER, &mut regions);
        assert_eq!(error, Err(PhysMemError::AllocationInvariantViolation));
        assert!(error.is_err_and(|error| error.is_invariant_violation()));
        Ok(())
    }

    #[test]
    #[cfg(feature = "fatal_invariants")]
    #[should_panic(expected = "AllocationInvariantViolation")]
    fn leaked_frame_aborts_when_fatal() {
        let mut memory = PhysicalMemory::with_allocator(Leaky(CoreMapAllocator::new_in(MB, 1)));
        let mut regions = vec![Scripted::new(&[false; 2])];

        let _ = memory.acquire_frame(VirtPage(0), OWNER, &mut regions);
        let _ = memory.acquire_frame(VirtPage(1), OWNER, &mut regions);
    }

    #[test]
    fn unknown_owner_is_rejected() -> Result<(), Box<dyn Error>> {
        let mut memory = PhysicalMemory::new(2);
        let mut regions: BTreeMap<RegionId, Box<dyn VirtualMemoryRegion>> = BTreeMap::new();
        regions.insert(RegionId(1), Box::new(Scripted::new(&[false; 4])));
        regions.insert(RegionId(2), Box::new(Scripted::new(&[false; 4])));

        assert_eq!(
            memory.acquire_frame(VirtPage(0), RegionId(9), &mut regions),
            Err(PhysMemError::UnknownRegion(RegionId(9)))
        );
        assert_eq!(memory.nfree(), 2);

        memory.acquire_frame(VirtPage(0), RegionId(1), &mut regions)?;
        memory.acquire_frame(VirtPage(1), RegionId(2), &mut regions)?;

        // Region 1 goes away without giving its frame back.
        regions.remove(&RegionId(1));
        assert_eq!(
            memory.acquire_frame(VirtPage(2), RegionId(2), &mut regions),
            Err(PhysMemError::UnknownRegion(RegionId(1)))
        );
        Ok(())
    }

    #[test]
    fn release_frame_and_region() -> Result<(), Box<dyn Error>> {
        let mut memory = PhysicalMemory::new(4);
        let mut regions = vec![Scripted::new(&[false; 4]), Scripted::new(&[false; 4])];

        let a = memory.acquire_frame(VirtPage(0), RegionId(0), &mut regions)?;
        memory.acquire_frame(VirtPage(0), RegionId(1), &mut regions)?;
        memory.acquire_frame(VirtPage(1), RegionId(1), &mut regions)?;
        assert_eq!(memory.nfree(), 1);

        let released = memory.release_frame(a)?;
        assert_eq!(released.owner, RegionId(0));
        assert_eq!(memory.descriptor(a), None);
        assert_eq!(memory.nfree(), 2);
        assert_eq!(
            memory.release_frame(a),
            Err(PhysMemError::FrameNotInUse(a))
        );
        assert_eq!(
            memory.release_frame(FrameNumber(4)),
            Err(PhysMemError::FrameOutOfRange(FrameNumber(4)))
        );

        assert_eq!(memory.release_region(RegionId(1)), 2);
        assert_eq!(memory.nfree(), 4);
        assert_eq!(memory.frames().occupied(), 0);
        assert_eq!(memory.stats().releases, 3);
        Ok(())
    }

    #[test]
    fn frame_addresses_round_trip_through_the_table() {
        let memory = PhysicalMemory::with_allocator(CoreMapAllocator::with_placement(
            2 * MB,
            8,
            FirstFit,
        ));

        assert_eq!(memory.frame_address(FrameNumber(3)), Some(2 * MB + 3 * PAGE_FRAME_SIZE));
        assert_eq!(
            memory.frame_at_address(2 * MB + 3 * PAGE_FRAME_SIZE),
            Some(FrameNumber(3))
        );
        assert_eq!(memory.frame_at_address(MB), None);
        assert_eq!(memory.frame_address(FrameNumber(8)), None);
    }

    /// Drives the manager the way a page fault handler would, touching random
    /// pages of several regions and checking the bookkeeping on every step.
    #[test]
    fn random_faults_keep_table_and_regions_in_agreement() -> Result<(), Box<dyn Error>> {
        const FRAMES: usize = frames_in(32 * KB);
        const PAGES_PER_REGION: usize = 6;

        let mut rng = StdRng::seed_from_u64(0x5eed);
        let mut memory = PhysicalMemory::new(FRAMES);
        let mut regions = vec![
            Vma::new(VmaKind::Anonymous, VirtPage(0), PAGES_PER_REGION, true),
            Vma::new(VmaKind::FileBacked { offset: 0 }, VirtPage(0x100), PAGES_PER_REGION, true),
            Vma::new(VmaKind::Shared, VirtPage(0x200), PAGES_PER_REGION, false),
        ];

        for _ in 0..2000 {
            let id = rng.gen_range(0..regions.len());
            let page = VirtPage(regions[id].start().0 + rng.gen_range(0..PAGES_PER_REGION));
            let write = rng.gen_bool(0.3);

            if !regions[id].touch(page, write) {
                let frame = memory.acquire_frame(page, RegionId(id), &mut regions)?;
                regions[id].map(page, frame)?;
            }

            let resident: usize = regions.iter().map(Vma::resident_pages).sum();
            assert_eq!(memory.nfree(), FRAMES - resident);
            for (frame, descriptor) in memory.frames().iter() {
                let owner = &regions[descriptor.owner.0];
                assert_eq!(owner.frame_of(descriptor.mapped_page), Some(frame));
            }
        }

        let stats = memory.stats();
        let evicted: usize = regions.iter().map(Vma::evictions).sum();
        assert_eq!(stats.evictions, evicted);
        assert_eq!(stats.acquisitions, stats.evictions + FRAMES);
        assert!(stats.slots_visited <= 2 * FRAMES * stats.sweeps);
        Ok(())
    }
}
