//! Physical frame management for the virtual memory subsystem.
//!
//! [`PhysicalMemory`] owns a fixed pool of page frames and hands them out to
//! regions that need to back a virtual page. When the pool runs dry it
//! reclaims a frame with a clock (second chance) sweep over the frame table,
//! asking each frame's owning region whether the page was used recently.
#![cfg_attr(target_os = "none", no_std)]

mod error;
mod frame_allocator;
mod frame_table;
mod page_replacement;
mod physical_memory;
mod region;
pub mod vma;

extern crate alloc;

pub use error::PhysMemError;
pub use frame_allocator::{
    placement_algorithms::{FirstFit, NextFit, PlacementAlgorithm},
    CoreMapAllocator, CoreMapEntry, RawFrameAllocator,
};
pub use frame_table::{FrameDescriptor, FrameTable};
pub use page_replacement::{ClockSweep, PageReplacementPolicy, SweepOutcome};
pub use physical_memory::{PhysMemStats, PhysicalMemory};
pub use region::{RegionId, RegionTable, VirtualMemoryRegion};

/// Index of a physical frame within the managed pool.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct FrameNumber(pub usize);

/// A virtual page number in the owning region's address space.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct VirtPage(pub usize);
