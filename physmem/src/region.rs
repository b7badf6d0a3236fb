use crate::VirtPage;
use alloc::boxed::Box;
use alloc::collections::BTreeMap;
use alloc::vec::Vec;

/// Handle naming a region in the caller's [`RegionTable`].
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct RegionId(pub usize);

/// What the clock sweep needs from the region that owns a frame's page.
///
/// The region owns the page table entry, so it is the source of truth for the
/// reference bit. Every kind of region implements this independently.
pub trait VirtualMemoryRegion {
    /// Returns true if the page has not been referenced since it was last
    /// swept. Must not have side effects.
    fn should_evict(&self, page: VirtPage) -> bool;

    /// Unmap the page from the region's page table. The frame backing it is
    /// returned to the pool by the caller once this returns. Not called twice
    /// for the same page without the page being mapped again in between.
    fn evict(&mut self, page: VirtPage);

    /// Clear the page's reference bit, giving it a second chance.
    fn mark_swept(&mut self, page: VirtPage);
}

/// Resolves the handles stored in frame descriptors to live regions.
pub trait RegionTable {
    fn region_mut(&mut self, id: RegionId) -> Option<&mut dyn VirtualMemoryRegion>;
}

impl<R> RegionTable for [R]
where
    R: VirtualMemoryRegion,
{
    fn region_mut(&mut self, id: RegionId) -> Option<&mut dyn VirtualMemoryRegion> {
        self.get_mut(id.0)
            .map(|region| region as &mut dyn VirtualMemoryRegion)
    }
}

impl<R> RegionTable for Vec<R>
where
    R: VirtualMemoryRegion,
{
    fn region_mut(&mut self, id: RegionId) -> Option<&mut dyn VirtualMemoryRegion> {
        self.as_mut_slice().region_mut(id)
    }
}

impl RegionTable for BTreeMap<RegionId, Box<dyn VirtualMemoryRegion>> {
    fn region_mut(&mut self, id: RegionId) -> Option<&mut dyn VirtualMemoryRegion> {
        self.get_mut(&id)
            .map(|region| &mut **region as &mut dyn VirtualMemoryRegion)
    }
}
