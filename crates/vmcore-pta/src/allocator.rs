use core::ptr;

use log::trace;
use vmcore_addr::{AddressMapping, PhysicalAddress, PhysicalPage, Size4K, Status};

use crate::control_block::ControlBlock;
use crate::list::PageTableList;

/// Statistics reported by [`PageTableAllocator::stats`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PtaStats {
    pub block_size: u64,
    pub free_blocks: usize,
    pub free_list_len: usize,
    pub largest_free_block: u64,
}

/// Free-list allocator of zero-filled, page-table-sized frames drained from
/// a pre-mapped arena window, per `original_source`'s `PageTableAllocator`.
///
/// Every free block's header lives inside the free memory itself (same
/// trick as `kernel-alloc`'s `FreeListAllocator`, generalized from variable
/// byte spans to whole `block_size`-multiple frames). The arena is assumed
/// pre-mapped at a constant `slide = vaddr - paddr`, carried per block so
/// multiple arena segments with different slides can coexist after
/// `add_memory`.
pub struct PageTableAllocator {
    block_size: u64,
    /// Slide of the arena passed to `create`; used as the default by
    /// `deallocate_list`/`add_memory` call sites that don't track slide
    /// themselves (the common single-arena case).
    default_slide: i64,
    /// Sentinel; `head.next` is the first free block (or null).
    head: ControlBlock,
}

// Safety: callers serialize access externally (the owning PT's lock).
unsafe impl Send for PageTableAllocator {}

impl PageTableAllocator {
    /// Create an allocator over the given pre-mapped arena window. The
    /// entire arena is zeroed up front so every block handed out by
    /// `allocate` is guaranteed zero-filled (§4.2 invariant).
    ///
    /// # Safety
    /// `arena.vaddr` must already be mapped read/write for `arena.size`
    /// bytes and exclusively owned by the resulting allocator.
    pub unsafe fn create(arena: AddressMapping, block_size: u64) -> Result<Self, Status> {
        if block_size == 0 || arena.size == 0 || arena.size % block_size != 0 {
            return Err(Status::InvalidInput);
        }
        let slide = arena.vaddr.as_u64().wrapping_sub(arena.paddr.as_u64()) as i64;
        let node_ptr = arena.vaddr.as_u64() as *mut ControlBlock;
        unsafe {
            ptr::write_bytes(arena.vaddr.as_u64() as *mut u8, 0, arena.size as usize);
            ControlBlock::write_at(node_ptr, arena.size, slide);
        }
        Ok(Self {
            block_size,
            default_slide: slide,
            head: ControlBlock {
                next: node_ptr,
                prev: ptr::null_mut(),
                size: 0,
                slide: 0,
            },
        })
    }

    #[must_use]
    pub const fn block_size(&self) -> u64 {
        self.block_size
    }

    /// Allocate `count` contiguous frames. Retries once after `defragment`
    /// on a first miss.
    pub fn allocate(&mut self, count: u64) -> Option<PhysicalPage<Size4K>> {
        if count == 0 {
            return None;
        }
        let needed = count * self.block_size;
        if let Some(frame) = self.take_contiguous(needed) {
            trace!("allocate: {count} frame(s) at {}", frame.base());
            return Some(frame);
        }
        self.defragment();
        let frame = self.take_contiguous(needed);
        if let Some(frame) = frame {
            trace!("allocate: {count} frame(s) at {} (after defragment)", frame.base());
        }
        frame
    }

    fn take_contiguous(&mut self, needed: u64) -> Option<PhysicalPage<Size4K>> {
        let mut prev: *mut ControlBlock = &raw mut self.head;
        let mut cur = self.head.next;
        while !cur.is_null() {
            let (size, slide) = unsafe { ((*cur).size, (*cur).slide) };
            if size >= needed {
                let block_vaddr = cur as u64;
                if size == needed {
                    unsafe {
                        Self::unlink(prev, cur);
                    }
                } else {
                    let remainder_vaddr = block_vaddr + needed;
                    let remainder_ptr = remainder_vaddr as *mut ControlBlock;
                    unsafe {
                        ControlBlock::write_at(remainder_ptr, size - needed, slide);
                        Self::relink(prev, cur, remainder_ptr);
                    }
                }
                let paddr = PhysicalAddress::new(block_vaddr.wrapping_sub(slide as u64));
                return Some(paddr.page::<Size4K>());
            }
            prev = cur;
            cur = unsafe { (*cur).next };
        }
        None
    }

    /// Remove `node` from the list, splicing `prev.next` directly to
    /// `node.next`.
    unsafe fn unlink(prev: *mut ControlBlock, node: *mut ControlBlock) {
        unsafe {
            let next = (*node).next;
            (*prev).next = next;
            if !next.is_null() {
                (*next).prev = prev;
            }
        }
    }

    /// Replace `node` in the list with `replacement` (used when a block is
    /// only partially consumed and its remainder moves to a new address).
    ///
    /// `prev`'s `.prev` link is not meaningfully readable once `prev` may be
    /// the sentinel head (its address is only stable for this call), so the
    /// allocator never reads `.prev` back — it is write-only bookkeeping
    /// that mirrors the control block's documented shape.
    unsafe fn relink(prev: *mut ControlBlock, node: *mut ControlBlock, replacement: *mut ControlBlock) {
        unsafe {
            let next = (*node).next;
            (*replacement).next = next;
            (*replacement).prev = prev;
            (*prev).next = replacement;
            if !next.is_null() {
                (*next).prev = replacement;
            }
        }
    }

    /// Return `count` frames starting at `ptr` to the free list. Infallible:
    /// the header is written into memory the caller already owns.
    pub fn deallocate(&mut self, ptr: PhysicalPage<Size4K>, count: u64, slide: i64) {
        if count == 0 {
            return;
        }
        let size = count * self.block_size;
        let vaddr = ptr.base().as_u64().wrapping_add(slide as u64);
        unsafe {
            ptr::write_bytes(vaddr as *mut u8, 0, size as usize);
            let node = vaddr as *mut ControlBlock;
            ControlBlock::write_at(node, size, slide);
            let old_first = self.head.next;
            (*node).next = old_first;
            if !old_first.is_null() {
                (*old_first).prev = node;
            }
            self.head.next = node;
        }
        trace!("deallocate: {count} frame(s) at {}", ptr.base());
    }

    /// Best-effort fragmented allocation: succeeds only if the cumulative
    /// free size already covers `count` frames (checked before any
    /// mutation), then withdraws frames from as few blocks as possible.
    pub fn allocate_list(&mut self, count: u64, out: &mut PageTableList) -> bool {
        if !self.can_allocate_blocks(count) {
            return false;
        }
        self.allocate_extra(count, out)
    }

    /// Append `count` more frames onto an existing list.
    pub fn allocate_extra(&mut self, mut count: u64, out: &mut PageTableList) -> bool {
        if !self.can_allocate_blocks(count) {
            return false;
        }
        while count > 0 {
            let prev: *mut ControlBlock = &raw mut self.head;
            let cur = self.head.next;
            if cur.is_null() {
                return false;
            }
            let (size, slide) = unsafe { ((*cur).size, (*cur).slide) };
            let block_frames = size / self.block_size;
            let take = core::cmp::min(block_frames, count);
            let take_size = take * self.block_size;
            let block_vaddr = cur as u64;
            if take_size == size {
                unsafe {
                    Self::unlink(prev, cur);
                }
            } else {
                let remainder_ptr = (block_vaddr + take_size) as *mut ControlBlock;
                unsafe {
                    ControlBlock::write_at(remainder_ptr, size - take_size, slide);
                    Self::relink(prev, cur, remainder_ptr);
                }
            }
            let paddr = PhysicalAddress::new(block_vaddr.wrapping_sub(slide as u64));
            out.push_segment(paddr.page::<Size4K>(), take);
            count -= take;
        }
        true
    }

    /// Return every frame in `list` to the free list, using the arena's
    /// default slide (the single-arena case; mixed-arena lists should free
    /// each segment through `deallocate` directly with its own slide).
    pub fn deallocate_list(&mut self, list: &mut PageTableList) {
        let slide = self.default_slide;
        for (first, count) in list.drain_segments() {
            self.deallocate(first, count, slide);
        }
    }

    fn can_allocate_blocks(&self, count: u64) -> bool {
        let needed = count * self.block_size;
        let mut total = 0u64;
        let mut cur = self.head.next;
        while !cur.is_null() {
            total += unsafe { (*cur).size };
            if total >= needed {
                return true;
            }
            cur = unsafe { (*cur).next };
        }
        false
    }

    /// Sort free blocks by address and merge adjacent blocks sharing the
    /// same slide. O(n log n) in the free-list length.
    pub fn defragment(&mut self) {
        let mut blocks = self.collect_free_blocks();
        let before = blocks.len();
        blocks.sort_unstable_by_key(|b| b.0);
        let mut merged: alloc::vec::Vec<(u64, u64, i64)> = alloc::vec::Vec::new();
        for (addr, size, slide) in blocks {
            if let Some(last) = merged.last_mut() {
                if last.0 + last.1 == addr && last.2 == slide {
                    last.1 += size;
                    continue;
                }
            }
            merged.push((addr, size, slide));
        }
        trace!("defragment: {before} free block(s) merged into {}", merged.len());
        self.rebuild_free_list(&merged);
    }

    fn collect_free_blocks(&self) -> alloc::vec::Vec<(u64, u64, i64)> {
        let mut out = alloc::vec::Vec::new();
        let mut cur = self.head.next;
        while !cur.is_null() {
            let (size, slide) = unsafe { ((*cur).size, (*cur).slide) };
            out.push((cur as u64, size, slide));
            cur = unsafe { (*cur).next };
        }
        out
    }

    fn rebuild_free_list(&mut self, blocks: &[(u64, u64, i64)]) {
        self.head.next = ptr::null_mut();
        let mut prev: *mut ControlBlock = ptr::null_mut();
        for &(addr, size, slide) in blocks {
            let node = addr as *mut ControlBlock;
            unsafe {
                ControlBlock::write_at(node, size, slide);
                (*node).prev = prev;
            }
            if prev.is_null() {
                self.head.next = node;
            } else {
                unsafe {
                    (*prev).next = node;
                }
            }
            prev = node;
        }
    }

    /// Insert a new arena segment's worth of free memory.
    ///
    /// # Safety
    /// `range` (interpreted through `slide`) must be mapped, writable, and
    /// not currently owned by any outstanding allocation.
    pub unsafe fn add_memory(&mut self, paddr: PhysicalAddress, size: u64, slide: i64) {
        if size == 0 {
            return;
        }
        let frame = PhysicalPage::<Size4K>::from_base_unchecked(paddr);
        self.deallocate(frame, size / self.block_size, slide);
        trace!("add_memory: {size} bytes at {paddr} (slide {slide})");
    }

    /// Withdraw `[paddr, paddr+size)` (interpreted through `slide`) from the
    /// arena, the inverse of `add_memory`. A free block fully inside the
    /// range is removed outright; a block straddling one edge is split,
    /// keeping only the portion outside the range.
    ///
    /// # Safety
    /// `paddr`/`size`/`slide` must describe memory this allocator's arena
    /// actually owns (the same contract as `add_memory`).
    ///
    /// # Panics
    /// Panics if any part of `[paddr, paddr+size)` is not currently free —
    /// i.e. part of it is outstanding in a live allocation.
    pub unsafe fn release_memory(&mut self, paddr: PhysicalAddress, size: u64, slide: i64) {
        if size == 0 {
            return;
        }
        let window_start = paddr.as_u64().wrapping_add(slide as u64);
        let window_end = window_start + size;
        let blocks = self.collect_free_blocks();
        let mut kept: alloc::vec::Vec<(u64, u64, i64)> = alloc::vec::Vec::with_capacity(blocks.len());
        let mut covered = 0u64;
        for (addr, block_size, block_slide) in blocks {
            let end = addr + block_size;
            if block_slide != slide || end <= window_start || addr >= window_end {
                kept.push((addr, block_size, block_slide));
                continue;
            }
            let overlap_start = core::cmp::max(addr, window_start);
            let overlap_end = core::cmp::min(end, window_end);
            covered += overlap_end - overlap_start;
            if addr < overlap_start {
                kept.push((addr, overlap_start - addr, block_slide));
            }
            if overlap_end < end {
                kept.push((overlap_end, end - overlap_end, block_slide));
            }
        }
        assert_eq!(covered, size, "release_memory: range is not entirely free");
        kept.sort_unstable_by_key(|b| b.0);
        self.rebuild_free_list(&kept);
        trace!("release_memory: {size} bytes at {paddr} (slide {slide})");
    }

    #[must_use]
    pub fn stats(&self) -> PtaStats {
        let mut free_blocks = 0usize;
        let mut largest = 0u64;
        let mut cur = self.head.next;
        while !cur.is_null() {
            let size = unsafe { (*cur).size };
            free_blocks += 1;
            largest = largest.max(size);
            cur = unsafe { (*cur).next };
        }
        PtaStats {
            block_size: self.block_size,
            free_blocks,
            free_list_len: free_blocks,
            largest_free_block: largest,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const ARENA_FRAMES: u64 = 16;

    fn make_arena() -> (alloc::vec::Vec<u8>, PageTableAllocator) {
        let mut buf = alloc::vec![0u8; (ARENA_FRAMES * 4096) as usize];
        let vaddr = buf.as_mut_ptr() as u64;
        let mapping = AddressMapping::new(
            vmcore_addr::VirtualAddress::new(vaddr),
            PhysicalAddress::new(vaddr),
            ARENA_FRAMES * 4096,
        );
        let pta = unsafe { PageTableAllocator::create(mapping, 4096).unwrap() };
        (buf, pta)
    }

    #[test]
    fn allocate_and_deallocate_roundtrip() {
        let (_buf, mut pta) = make_arena();
        let a = pta.allocate(2).expect("alloc");
        let stats = pta.stats();
        assert_eq!(stats.free_blocks, 1);
        pta.deallocate(a, 2, 0);
        let stats = pta.stats();
        assert_eq!(stats.largest_free_block, ARENA_FRAMES * 4096);
    }

    #[test]
    fn allocated_frame_is_zeroed() {
        let (_buf, mut pta) = make_arena();
        let a = pta.allocate(1).unwrap();
        let ptr = a.base().as_u64() as *const u8;
        let slice = unsafe { core::slice::from_raw_parts(ptr, 4096) };
        assert!(slice.iter().all(|&b| b == 0));
    }

    #[test]
    fn allocate_list_covers_fragmented_free_space() {
        let (_buf, mut pta) = make_arena();
        let a = pta.allocate(4).unwrap();
        let _b = pta.allocate(4).unwrap();
        pta.deallocate(a, 4, 0);
        let mut list = PageTableList::new();
        assert!(pta.allocate_list(4, &mut list));
        assert_eq!(list.remaining(), 4);
    }

    #[test]
    fn defragment_merges_adjacent_free_blocks() {
        let (_buf, mut pta) = make_arena();
        let a = pta.allocate(2).unwrap();
        let b = pta.allocate(2).unwrap();
        pta.deallocate(a, 2, 0);
        pta.deallocate(b, 2, 0);
        pta.defragment();
        let stats = pta.stats();
        assert_eq!(stats.free_blocks, 1);
        assert_eq!(stats.largest_free_block, ARENA_FRAMES * 4096);
    }

    #[test]
    fn release_memory_removes_an_entire_free_block() {
        let (_buf, mut pta) = make_arena();
        let whole = pta.stats();
        assert_eq!(whole.free_blocks, 1);
        let paddr = PhysicalAddress::new(0);
        unsafe {
            pta.release_memory(paddr, ARENA_FRAMES * 4096, 0);
        }
        let stats = pta.stats();
        assert_eq!(stats.free_blocks, 0);
        assert_eq!(stats.largest_free_block, 0);
    }

    #[test]
    fn release_memory_splits_a_straddled_free_block() {
        let (_buf, mut pta) = make_arena();
        // Release the middle third, leaving a free prefix and suffix.
        let third = 4096 * (ARENA_FRAMES / 4);
        unsafe {
            pta.release_memory(PhysicalAddress::new(third), third * 2, 0);
        }
        let stats = pta.stats();
        assert_eq!(stats.free_blocks, 2);
        assert_eq!(stats.largest_free_block, third);
    }

    #[test]
    fn release_memory_drops_a_free_prefix() {
        let (_buf, mut pta) = make_arena();
        let half = 4096 * (ARENA_FRAMES / 2);
        unsafe {
            pta.release_memory(PhysicalAddress::new(0), half, 0);
        }
        let stats = pta.stats();
        assert_eq!(stats.free_blocks, 1);
        assert_eq!(stats.largest_free_block, half);
    }

    #[test]
    #[should_panic(expected = "release_memory: range is not entirely free")]
    fn release_memory_panics_over_an_allocated_region() {
        let (_buf, mut pta) = make_arena();
        let _a = pta.allocate(2).unwrap();
        unsafe {
            pta.release_memory(PhysicalAddress::new(0), ARENA_FRAMES * 4096, 0);
        }
    }
}
