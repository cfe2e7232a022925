use alloc::vec::Vec;

use vmcore_addr::{PageSize as _, PhysicalAddress, PhysicalPage, Size4K};

/// A possibly-discontiguous chain of frames withdrawn from the allocator by
/// `allocate_list`/`allocate_extra`, consumed one frame at a time by a PT
/// Command List while it builds page tables.
#[derive(Debug, Default)]
pub struct PageTableList {
    /// `(first frame, frame count)` segments, each internally contiguous.
    segments: Vec<(PhysicalPage<Size4K>, u64)>,
}

impl PageTableList {
    #[must_use]
    pub const fn new() -> Self {
        Self { segments: Vec::new() }
    }

    pub(crate) fn push_segment(&mut self, first: PhysicalPage<Size4K>, count: u64) {
        if count > 0 {
            self.segments.push((first, count));
        }
    }

    /// Total number of frames remaining in the list.
    #[must_use]
    pub fn remaining(&self) -> u64 {
        self.segments.iter().map(|(_, count)| count).sum()
    }

    /// Withdraw exactly one frame from the front of the list.
    pub fn take_one(&mut self) -> Option<PhysicalPage<Size4K>> {
        let (first, count) = self.segments.first_mut()?;
        let frame = *first;
        if *count > 1 {
            *count -= 1;
            *first = PhysicalAddress::new(first.base().as_u64() + Size4K::SIZE)
                .page::<Size4K>();
        } else {
            self.segments.remove(0);
        }
        Some(frame)
    }

    /// Drain every remaining segment, handing ownership to `f` (typically
    /// `PageTableAllocator::deallocate` per segment) so a dropped,
    /// uncommitted command list can return surplus frames.
    pub(crate) fn drain_segments(&mut self) -> Vec<(PhysicalPage<Size4K>, u64)> {
        core::mem::take(&mut self.segments)
    }
}
