use crate::sizes::{KB, MB};

// Page size is 4KB. This is a property of x86 processors.
pub const PAGE_FRAME_SIZE: usize = 4 * KB;

// "Upper memory" (as opposed to "lower memory") starts at 1MB. Frame pools
// built without an explicit base are placed there.
pub const DEFAULT_POOL_BASE: usize = MB;

/// Number of whole frames that fit in `bytes`.
pub const fn frames_in(bytes: usize) -> usize {
    bytes / PAGE_FRAME_SIZE
}
