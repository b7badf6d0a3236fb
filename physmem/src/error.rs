use crate::{FrameNumber, RegionId, VirtPage};
use core::error::Error;
use core::fmt::{Debug, Display, Formatter};

/// Error type for physical memory operations
#[derive(Clone, Copy, PartialEq, Eq)]
pub enum PhysMemError {
    /// The frame accounting disagrees with itself, e.g. the pool is still
    /// empty after a sweep reclaimed a frame
    AllocationInvariantViolation,
    /// The clock went around twice without finding a page to evict
    SweepDidNotConverge { visited: usize },
    /// A frame descriptor names a region that no longer exists
    UnknownRegion(RegionId),
    /// The frame holds no page
    FrameNotInUse(FrameNumber),
    /// The frame number is past the end of the pool
    FrameOutOfRange(FrameNumber),
    /// The page lies outside the region it was mapped into
    PageOutsideRegion(VirtPage),
}

impl PhysMemError {
    fn reason(&self) -> &'static str {
        match self {
            PhysMemError::AllocationInvariantViolation => {
                "Frame accounting is inconsistent (no free frame after eviction)"
            }
            PhysMemError::SweepDidNotConverge { .. } => {
                "Clock sweep exceeded two revolutions without evicting a page"
            }
            PhysMemError::UnknownRegion(_) => "Frame owner does not resolve to a live region",
            PhysMemError::FrameNotInUse(_) => "Frame is not mapped",
            PhysMemError::FrameOutOfRange(_) => "Frame number is outside the pool",
            PhysMemError::PageOutsideRegion(_) => "Page is outside the region",
        }
    }

    /// Whether this error means the manager's own bookkeeping is broken.
    pub fn is_invariant_violation(&self) -> bool {
        matches!(
            self,
            PhysMemError::AllocationInvariantViolation | PhysMemError::SweepDidNotConverge { .. }
        )
    }

    /// Surfaces an invariant violation. With the `fatal_invariants` feature
    /// this never returns.
    pub(crate) fn violated(self) -> Self {
        log::error!("physical memory invariant violated: {self}");
        if cfg!(feature = "fatal_invariants") {
            panic!("{self}");
        }
        self
    }
}

impl Debug for PhysMemError {
    fn fmt(&self, f: &mut Formatter<'_>) -> core::fmt::Result {
        match self {
            PhysMemError::AllocationInvariantViolation => write!(f, "AllocationInvariantViolation"),
            PhysMemError::SweepDidNotConverge { visited } => {
                write!(f, "SweepDidNotConverge {{ visited: {visited} }}")
            }
            PhysMemError::UnknownRegion(RegionId(id)) => write!(f, "UnknownRegion({id})"),
            PhysMemError::FrameNotInUse(FrameNumber(frame)) => write!(f, "FrameNotInUse({frame})"),
            PhysMemError::FrameOutOfRange(FrameNumber(frame)) => {
                write!(f, "FrameOutOfRange({frame})")
            }
            PhysMemError::PageOutsideRegion(VirtPage(page)) => {
                write!(f, "PageOutsideRegion({page:#X})")
            }
        }
    }
}

impl Display for PhysMemError {
    fn fmt(&self, f: &mut Formatter<'_>) -> core::fmt::Result {
        write!(f, "{}: ", self.reason())?;
        Debug::fmt(self, f)
    }
}

impl Error for PhysMemError {}
