//! A reference virtual memory region with a single level page table.
//!
//! The frame manager only sees regions through [`VirtualMemoryRegion`]; this
//! is the implementation the rest of the crate is tested against, and a
//! starting point for embeddings that do not bring their own.

use crate::region::VirtualMemoryRegion;
use crate::{FrameNumber, PhysMemError, VirtPage};
use alloc::collections::BTreeMap;
use arbitrary_int::{u20, Number};
use bitbybit::bitfield;

#[bitfield(u32, default = 0)]
pub struct PageTableEntry {
    #[bit(0, rw)]
    present: bool,
    #[bit(1, rw)]
    read_write: bool,
    #[bit(5, rw)]
    accessed: bool,
    #[bit(6, rw)]
    dirty: bool,
    #[bits(12..=31, rw)]
    page_frame: u20,
}

/// What backs the pages of a region.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum VmaKind {
    Anonymous,
    FileBacked { offset: u64 },
    Shared,
}

impl VmaKind {
    /// Dirty pages of these kinds have to be written back when evicted.
    fn has_backing_object(&self) -> bool {
        match self {
            VmaKind::Anonymous => false,
            VmaKind::FileBacked { .. } | VmaKind::Shared => true,
        }
    }
}

pub struct Vma {
    kind: VmaKind,
    start: VirtPage,
    pages: usize,
    writeable: bool,
    page_table: BTreeMap<VirtPage, PageTableEntry>,
    evictions: usize,
    writebacks: usize,
}

impl Vma {
    pub fn new(kind: VmaKind, start: VirtPage, pages: usize, writeable: bool) -> Self {
        Self {
            kind,
            start,
            pages,
            writeable,
            page_table: BTreeMap::new(),
            evictions: 0,
            writebacks: 0,
        }
    }

    pub fn kind(&self) -> &VmaKind {
        &self.kind
    }

    pub fn start(&self) -> VirtPage {
        self.start
    }

    pub fn pages(&self) -> usize {
        self.pages
    }

    pub fn writeable(&self) -> bool {
        self.writeable
    }

    pub fn contains(&self, page: VirtPage) -> bool {
        page.0 >= self.start.0 && page.0 - self.start.0 < self.pages
    }

    /// Install `frame` for `page`. A freshly mapped page counts as referenced,
    /// since the fault that brought it in was an access.
    pub fn map(&mut self, page: VirtPage, frame: FrameNumber) -> Result<(), PhysMemError> {
        if !self.contains(page) {
            return Err(PhysMemError::PageOutsideRegion(page));
        }
        let page_frame = u32::try_from(frame.0)
            .ok()
            .filter(|&number| number <= u20::MAX.value())
            .ok_or(PhysMemError::FrameOutOfRange(frame))?;

        let entry = PageTableEntry::default()
            .with_present(true)
            .with_read_write(self.writeable)
            .with_accessed(true)
            .with_page_frame(u20::new(page_frame));
        self.page_table.insert(page, entry);
        Ok(())
    }

    /// Remove the mapping for `page` without it being evicted, returning the
    /// frame it used.
    pub fn unmap(&mut self, page: VirtPage) -> Option<FrameNumber> {
        let entry = self.page_table.remove(&page)?;
        entry.present().then(|| frame_of_entry(entry))
    }

    /// Access `page` the way the MMU would: sets the accessed bit, and the
    /// dirty bit for writes to writeable pages. Returns false if the page is
    /// not resident, i.e. the access would fault.
    pub fn touch(&mut self, page: VirtPage, write: bool) -> bool {
        let Some(entry) = self.page_table.get_mut(&page) else {
            return false;
        };
        if !entry.present() {
            return false;
        }

        let dirty = entry.dirty() || (write && entry.read_write());
        *entry = entry.with_accessed(true).with_dirty(dirty);
        true
    }

    pub fn entry(&self, page: VirtPage) -> Option<PageTableEntry> {
        self.page_table.get(&page).copied()
    }

    pub fn is_resident(&self, page: VirtPage) -> bool {
        self.page_table
            .get(&page)
            .is_some_and(|entry| entry.present())
    }

    pub fn is_accessed(&self, page: VirtPage) -> bool {
        self.page_table
            .get(&page)
            .is_some_and(|entry| entry.present() && entry.accessed())
    }

    pub fn is_dirty(&self, page: VirtPage) -> bool {
        self.page_table
            .get(&page)
            .is_some_and(|entry| entry.present() && entry.dirty())
    }

    pub fn frame_of(&self, page: VirtPage) -> Option<FrameNumber> {
        let entry = self.page_table.get(&page)?;
        entry.present().then(|| frame_of_entry(*entry))
    }

    pub fn resident_pages(&self) -> usize {
        self.page_table
            .values()
            .filter(|entry| entry.present())
            .count()
    }

    /// Pages this region has had evicted by the clock.
    pub fn evictions(&self) -> usize {
        self.evictions
    }

    /// Dirty pages that had to be written back to the backing object.
    pub fn writebacks(&self) -> usize {
        self.writebacks
    }
}

fn frame_of_entry(entry: PageTableEntry) -> FrameNumber {
    FrameNumber(entry.page_frame().value() as usize)
}

impl VirtualMemoryRegion for Vma {
    fn should_evict(&self, page: VirtPage) -> bool {
        // A page the table doesn't know about has nothing worth keeping.
        !self.is_accessed(page)
    }

    fn evict(&mut self, page: VirtPage) {
        let Some(entry) = self.page_table.remove(&page) else {
            log::debug!("evict of unmapped page {:#X}", page.0);
            return;
        };

        if entry.dirty() && self.kind.has_backing_object() {
            self.writebacks += 1;
        }
        self.evictions += 1;
    }

    fn mark_swept(&mut self, page: VirtPage) {
        if let Some(entry) = self.page_table.get_mut(&page) {
            *entry = entry.with_accessed(false);
        }
    }
}
