//! Implementation of some common frame placement policies.

use super::CoreMapEntry;

/// A placement algorithm for picking the next frame to allocate.
pub trait PlacementAlgorithm: Default {
    /// Returns the index of a free frame in `core_map`, or [`None`] if every
    /// frame is allocated.
    fn place(&mut self, core_map: &[CoreMapEntry]) -> Option<usize>;
}

#[derive(Default)]
pub struct NextFit {
    /// The next frame number to start searching for free frames.
    position: usize,
}

// No internal state. Declared as a zero-sized type.
#[derive(Default)]
pub struct FirstFit;

impl PlacementAlgorithm for NextFit {
    fn place(&mut self, core_map: &[CoreMapEntry]) -> Option<usize> {
        let total_frames = core_map.len();
        if total_frames == 0 {
            return None;
        }

        // Visit every frame once, starting at the position we left off at and
        // wrapping around to the beginning.
        let start = self.position % total_frames;
        let index = (start..total_frames)
            .chain(0..start)
            .find(|&i| !core_map[i].allocated())?;

        self.position = (index + 1) % total_frames;
        Some(index)
    }
}

impl PlacementAlgorithm for FirstFit {
    fn place(&mut self, core_map: &[CoreMapEntry]) -> Option<usize> {
        core_map.iter().position(|entry| !entry.allocated())
    }
}
