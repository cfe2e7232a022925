//! Placement of virtual ranges inside one address space's managed window.
//!
//! A scaled-down analog of the Physical Frame Heap's allocate/carve logic
//! (`vmcore_pfh::heap`): first-fit over a flat sorted list of free ranges
//! rather than full TLSF bins. An address space's own segment map rarely
//! holds more than a few dozen live placements, so the occasional O(n) scan
//! this implies is not the bottleneck the system-wide physical heap's TLSF
//! indexing exists to avoid.

use alloc::vec;
use alloc::vec::Vec;

use vmcore_addr::{Range, Status, VirtualAddress, VirtualRange, VmResult};

pub(crate) struct VirtualFreeList {
    /// Sorted by `front`, pairwise non-adjacent (always coalesced on release).
    free: Vec<VirtualRange>,
}

impl VirtualFreeList {
    pub(crate) fn new(range: VirtualRange) -> Self {
        Self { free: vec![range] }
    }

    /// Carve out an `align`-aligned, `size`-byte range. First-fit: the first
    /// free range whose aligned interior can hold the request.
    pub(crate) fn allocate(&mut self, align: u64, size: u64) -> VmResult<VirtualRange> {
        if size == 0 || align == 0 || !align.is_power_of_two() {
            return Err(Status::InvalidInput);
        }
        for i in 0..self.free.len() {
            let r = self.free[i];
            let start = r.front.as_u64();
            let aligned = (start + align - 1) & !(align - 1);
            let Some(end) = aligned.checked_add(size) else { continue };
            if end > r.back.as_u64() {
                continue;
            }
            let alloc = Range::new(VirtualAddress::new(aligned), VirtualAddress::new(end));
            self.free.remove(i);
            let mut insert_at = i;
            if r.front.as_u64() < aligned {
                self.free.insert(insert_at, Range::new(r.front, alloc.front));
                insert_at += 1;
            }
            if end < r.back.as_u64() {
                self.free.insert(insert_at, Range::new(alloc.back, r.back));
            }
            return Ok(alloc);
        }
        Err(Status::OutOfMemory)
    }

    /// Return `range` to the free list, coalescing with touching neighbours.
    pub(crate) fn release(&mut self, range: VirtualRange) {
        if range.is_empty() {
            return;
        }
        let pos = self.free.partition_point(|r| r.front < range.front);
        self.free.insert(pos, range);
        if pos + 1 < self.free.len() && self.free[pos].back == self.free[pos + 1].front {
            self.free[pos].back = self.free[pos + 1].back;
            self.free.remove(pos + 1);
        }
        if pos > 0 && self.free[pos - 1].back == self.free[pos].front {
            self.free[pos - 1].back = self.free[pos].back;
            self.free.remove(pos);
        }
    }

    pub(crate) fn free_bytes(&self) -> u64 {
        self.free.iter().map(|r| r.size()).sum()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn va(v: u64) -> VirtualAddress {
        VirtualAddress::new(v)
    }

    #[test]
    fn allocate_then_release_restores_single_free_range() {
        let full = Range::new(va(0x1000_0000), va(0x2000_0000));
        let mut list = VirtualFreeList::new(full);
        let a = list.allocate(0x1000, 0x5000).unwrap();
        assert_eq!(a.front, va(0x1000_0000));
        list.release(a);
        assert_eq!(list.free_bytes(), full.size());
    }

    #[test]
    fn allocations_do_not_overlap() {
        let mut list = VirtualFreeList::new(Range::new(va(0x1000_0000), va(0x1001_0000)));
        let a = list.allocate(0x1000, 0x4000).unwrap();
        let b = list.allocate(0x1000, 0x4000).unwrap();
        assert!(!a.intersects(b));
        assert_eq!(b.front, a.back);
    }

    #[test]
    fn exhausted_range_rejects_further_allocation() {
        let mut list = VirtualFreeList::new(Range::new(va(0x1000_0000), va(0x1000_1000)));
        list.allocate(0x1000, 0x1000).unwrap();
        assert_eq!(list.allocate(0x1000, 0x1000).unwrap_err(), Status::OutOfMemory);
    }

    #[test]
    fn releasing_adjacent_ranges_coalesces() {
        let mut list = VirtualFreeList::new(Range::new(va(0x1000_0000), va(0x1003_0000)));
        let a = list.allocate(0x1000, 0x1_0000).unwrap();
        let b = list.allocate(0x1000, 0x1_0000).unwrap();
        list.release(a);
        list.release(b);
        assert_eq!(list.free.len(), 1);
        assert_eq!(list.free_bytes(), 0x3_0000);
    }
}
