use crate::{FrameNumber, RegionId, VirtPage};
use alloc::boxed::Box;
use alloc::vec;

/// Which virtual page occupies a frame, and which region answers for it.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct FrameDescriptor {
    pub mapped_page: VirtPage,
    /// Non-owning handle. The region outlives the mapping by contract; the
    /// table never keeps it alive.
    pub owner: RegionId,
}

/// One slot per physical frame, indexed by frame number. A slot holding
/// [`None`] is a free frame. Storage and lookup only.
pub struct FrameTable {
    pool_base: usize,
    frame_size: usize,
    slots: Box<[Option<FrameDescriptor>]>,
}

impl FrameTable {
    pub fn new(pool_base: usize, frame_size: usize, frame_count: usize) -> Self {
        assert!(frame_size > 0);

        FrameTable {
            pool_base,
            frame_size,
            slots: vec![None; frame_count].into_boxed_slice(),
        }
    }

    pub fn size(&self) -> usize {
        self.slots.len()
    }

    /// # Panics
    ///
    /// Panics if `index` is not smaller than [`FrameTable::size`].
    pub fn slot_at(&mut self, index: usize) -> &mut Option<FrameDescriptor> {
        &mut self.slots[index]
    }

    pub fn get(&self, index: usize) -> Option<&FrameDescriptor> {
        self.slots.get(index)?.as_ref()
    }

    /// Table index of the frame starting at `address`. Returns [`None`] for
    /// addresses outside the pool or not on a frame boundary.
    pub fn index_of(&self, address: usize) -> Option<usize> {
        let offset = address.checked_sub(self.pool_base)?;
        if offset % self.frame_size != 0 {
            return None;
        }

        let index = offset / self.frame_size;
        (index < self.slots.len()).then_some(index)
    }

    pub fn address_of(&self, index: usize) -> Option<usize> {
        (index < self.slots.len()).then(|| self.pool_base + index * self.frame_size)
    }

    /// Number of slots currently holding a descriptor.
    pub fn occupied(&self) -> usize {
        self.slots.iter().filter(|slot| slot.is_some()).count()
    }

    pub fn iter(&self) -> impl Iterator<Item = (FrameNumber, &FrameDescriptor)> + '_ {
        self.slots
            .iter()
            .enumerate()
            .filter_map(|(index, slot)| Some((FrameNumber(index), slot.as_ref()?)))
    }
}
