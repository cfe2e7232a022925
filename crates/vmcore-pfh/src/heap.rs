use alloc::collections::BTreeMap;
use alloc::vec::Vec;

use log::trace;
use vmcore_addr::{PhysicalAddress, PhysicalRange, Range, Status, VmResult};
use vmcore_sync::SpinLock;

use crate::block::{Allocation, BlockId, PfhBlock};
use crate::index::{class_of, search_class_of, FL_COUNT, SL_COUNT};
use crate::stats::{PfhCompactStats, PfhStats};

struct HeapInner {
    blocks: Vec<PfhBlock>,
    /// `true` at index `i` while `blocks[i]` names a live block; `false`
    /// once the slot has been returned to `free_slots` for reuse.
    alive: Vec<bool>,
    free_slots: Vec<u32>,
    free_lists: [[Option<BlockId>; SL_COUNT]; FL_COUNT],
    top_bitmap: u64,
    sl_bitmap: [u32; FL_COUNT],
    used_index: BTreeMap<u64, BlockId>,
    used_bytes: u64,
    free_bytes: u64,
    malloc_count: u64,
    free_count: u64,
}

/// TLSF allocator over one or more physical memory ranges: aligned
/// allocation, exact-range reservation, split/splitv subdivision,
/// bounded grow/shrink, and address-keyed lookup.
pub struct PhysicalFrameHeap {
    inner: SpinLock<HeapInner>,
}

impl HeapInner {
    fn new_block(&mut self, range: PhysicalRange, free: bool, addr_prev: Option<BlockId>, addr_next: Option<BlockId>) -> BlockId {
        let block = PfhBlock {
            range,
            free,
            reserved: false,
            addr_prev,
            addr_next,
            free_prev: None,
            free_next: None,
        };
        if let Some(idx) = self.free_slots.pop() {
            self.blocks[idx as usize] = block;
            self.alive[idx as usize] = true;
            BlockId(idx)
        } else {
            let idx = self.blocks.len() as u32;
            self.blocks.push(block);
            self.alive.push(true);
            BlockId(idx)
        }
    }

    fn block(&self, id: BlockId) -> &PfhBlock {
        &self.blocks[id.0 as usize]
    }

    fn block_mut(&mut self, id: BlockId) -> &mut PfhBlock {
        &mut self.blocks[id.0 as usize]
    }

    fn retire_block(&mut self, id: BlockId) {
        self.alive[id.0 as usize] = false;
        self.free_slots.push(id.0);
    }

    fn insert_free(&mut self, id: BlockId) {
        let size = self.block(id).size();
        let (f, sl) = class_of(size);
        let head = self.free_lists[f][sl];
        {
            let b = self.block_mut(id);
            b.free = true;
            b.free_prev = None;
            b.free_next = head;
        }
        if let Some(old_head) = head {
            self.block_mut(old_head).free_prev = Some(id);
        }
        self.free_lists[f][sl] = Some(id);
        self.sl_bitmap[f] |= 1 << sl;
        self.top_bitmap |= 1 << f;
    }

    fn remove_free(&mut self, id: BlockId) {
        let size = self.block(id).size();
        let (f, sl) = class_of(size);
        let (prev, next) = {
            let b = self.block(id);
            (b.free_prev, b.free_next)
        };
        match prev {
            Some(p) => self.block_mut(p).free_next = next,
            None => self.free_lists[f][sl] = next,
        }
        if let Some(n) = next {
            self.block_mut(n).free_prev = prev;
        }
        if self.free_lists[f][sl].is_none() {
            self.sl_bitmap[f] &= !(1 << sl);
            if self.sl_bitmap[f] == 0 {
                self.top_bitmap &= !(1 << f);
            }
        }
        let b = self.block_mut(id);
        b.free = false;
        b.free_prev = None;
        b.free_next = None;
    }

    fn next_nonempty(&self, f: usize, sl: usize) -> Option<(usize, usize)> {
        let mask_here = if sl + 1 < SL_COUNT { self.sl_bitmap[f] & !((1u32 << (sl + 1)) - 1) } else { 0 };
        if mask_here != 0 {
            return Some((f, mask_here.trailing_zeros() as usize));
        }
        if f + 1 >= FL_COUNT {
            return None;
        }
        let mask_above = self.top_bitmap & !((1u64 << (f + 1)) - 1);
        if mask_above == 0 {
            return None;
        }
        let nf = mask_above.trailing_zeros() as usize;
        let nsl = self.sl_bitmap[nf].trailing_zeros() as usize;
        Some((nf, nsl))
    }

    fn find_fit(&self, size: u64, align: u64) -> Option<BlockId> {
        let (mut f, mut sl) = search_class_of(size);
        loop {
            let mut cur = self.free_lists[f][sl];
            while let Some(id) = cur {
                let b = self.block(id);
                if fits(b.range, size, align) {
                    return Some(id);
                }
                cur = b.free_next;
            }
            match self.next_nonempty(f, sl) {
                Some((nf, nsl)) => {
                    f = nf;
                    sl = nsl;
                }
                None => return None,
            }
        }
    }

    fn find_block_containing(&self, addr: PhysicalAddress) -> Option<BlockId> {
        self.blocks.iter().enumerate().find_map(|(i, b)| {
            if self.alive[i] && b.range.contains_addr(addr) {
                Some(BlockId(i as u32))
            } else {
                None
            }
        })
    }

    /// Carve `[alloc_start, alloc_start+size)` out of a free block `id`
    /// (already removed from its free list), returning the remaining gaps
    /// to free state and leaving `id` as the used allocation.
    fn carve(&mut self, id: BlockId, alloc_start: PhysicalAddress, size: u64) -> Allocation {
        let original = self.block(id).range;
        let alloc_end = alloc_start + size;
        let (orig_prev, orig_next) = {
            let b = self.block(id);
            (b.addr_prev, b.addr_next)
        };

        let mut left_of: Option<BlockId> = orig_prev;
        if alloc_start > original.front {
            let pre = self.new_block(Range::new(original.front, alloc_start), true, orig_prev, None);
            if let Some(p) = orig_prev {
                self.block_mut(p).addr_next = Some(pre);
            }
            self.insert_free(pre);
            left_of = Some(pre);
        }

        let mut right_of: Option<BlockId> = orig_next;
        if alloc_end < original.back {
            let post = self.new_block(Range::new(alloc_end, original.back), true, None, orig_next);
            if let Some(n) = orig_next {
                self.block_mut(n).addr_prev = Some(post);
            }
            self.insert_free(post);
            right_of = Some(post);
        }

        {
            let b = self.block_mut(id);
            b.range = Range::new(alloc_start, alloc_end);
            b.free = false;
            b.reserved = false;
            b.addr_prev = left_of;
            b.addr_next = right_of;
        }
        if let Some(p) = left_of {
            self.block_mut(p).addr_next = Some(id);
        }
        if let Some(n) = right_of {
            self.block_mut(n).addr_prev = Some(id);
        }

        self.used_bytes += size;
        self.used_index.insert(alloc_start.as_u64(), id);
        Allocation { id, range: Range::new(alloc_start, alloc_end) }
    }

    fn coalesce_into_free(&mut self, id: BlockId) {
        // Merge with the next neighbour first, then the previous one, so
        // `id` always survives the merge (simplifies the return value).
        if let Some(next) = self.block(id).addr_next {
            if self.block(next).free {
                self.remove_free(next);
                let next_next = self.block(next).addr_next;
                let merged_back = self.block(next).range.back;
                self.block_mut(id).range.back = merged_back;
                self.block_mut(id).addr_next = next_next;
                if let Some(nn) = next_next {
                    self.block_mut(nn).addr_prev = Some(id);
                }
                self.retire_block(next);
            }
        }
        if let Some(prev) = self.block(id).addr_prev {
            if self.block(prev).free {
                self.remove_free(prev);
                let prev_front = self.block(prev).range.front;
                let prev_prev = self.block(prev).addr_prev;
                self.block_mut(id).range.front = prev_front;
                self.block_mut(id).addr_prev = prev_prev;
                if let Some(pp) = prev_prev {
                    self.block_mut(pp).addr_next = Some(id);
                }
                self.retire_block(prev);
            }
        }
        self.insert_free(id);
    }

    /// Reserve `count` block-pool slots up front, for a command list's
    /// pre-withdraw-at-record-time step (`spec.md §4.5`/§5's "no allocation
    /// during commit" contract). Slots are marked alive with a placeholder
    /// range so any pool growth happens now; they are not yet linked into
    /// any address-ordered pool or free list.
    fn withdraw_slots(&mut self, count: usize) -> Vec<BlockId> {
        let zero = Range::new(PhysicalAddress::new(0), PhysicalAddress::new(0));
        (0..count).map(|_| self.new_block(zero, false, None, None)).collect()
    }

    /// Return slots withdrawn by `withdraw_slots` that were never installed
    /// (a command list dropped without committing).
    fn return_slots(&mut self, ids: &[BlockId]) {
        for &id in ids {
            self.retire_block(id);
        }
    }

    /// Overwrite an already-withdrawn slot with its real content.
    fn install_block(&mut self, id: BlockId, range: PhysicalRange, addr_prev: Option<BlockId>, addr_next: Option<BlockId>) {
        let b = self.block_mut(id);
        b.range = range;
        b.free = false;
        b.reserved = false;
        b.addr_prev = addr_prev;
        b.addr_next = addr_next;
    }

    /// The mutation half of `split`, drawing the "hi" block from an
    /// already-withdrawn `hi_id` instead of allocating one. Cannot fail.
    fn split_with_block(&mut self, allocation: Allocation, midpoint: PhysicalAddress, hi_id: BlockId) -> (Allocation, Allocation) {
        self.used_index.remove(&allocation.range.front.as_u64());
        let old_next = self.block(allocation.id).addr_next;
        self.install_block(hi_id, Range::new(midpoint, allocation.range.back), Some(allocation.id), old_next);
        if let Some(n) = old_next {
            self.block_mut(n).addr_prev = Some(hi_id);
        }
        self.block_mut(allocation.id).range.back = midpoint;
        self.block_mut(allocation.id).addr_next = Some(hi_id);
        self.used_index.insert(allocation.range.front.as_u64(), allocation.id);
        self.used_index.insert(midpoint.as_u64(), hi_id);
        let lo_alloc = Allocation { id: allocation.id, range: self.block(allocation.id).range };
        let hi_alloc = Allocation { id: hi_id, range: self.block(hi_id).range };
        (lo_alloc, hi_alloc)
    }

    /// The mutation half of `splitv`, drawing each new block from
    /// already-withdrawn `ids` (one per entry in `points`) instead of
    /// allocating. Cannot fail.
    fn splitv_with_blocks(&mut self, allocation: Allocation, points: &[PhysicalAddress], ids: &[BlockId]) -> Vec<Allocation> {
        self.used_index.remove(&allocation.range.front.as_u64());
        let mut out = Vec::with_capacity(points.len() + 1);
        let mut prev_id = allocation.id;
        let mut prev_front = allocation.range.front;
        let tail_next = self.block(allocation.id).addr_next;
        for (&point, &next_id) in points.iter().zip(ids) {
            self.block_mut(prev_id).range = Range::new(prev_front, point);
            self.install_block(next_id, Range::new(point, allocation.range.back), Some(prev_id), tail_next);
            self.block_mut(prev_id).addr_next = Some(next_id);
            self.used_index.insert(prev_front.as_u64(), prev_id);
            out.push(Allocation { id: prev_id, range: self.block(prev_id).range });
            prev_id = next_id;
            prev_front = point;
        }
        self.block_mut(prev_id).range = Range::new(prev_front, allocation.range.back);
        if let Some(tn) = tail_next {
            self.block_mut(tn).addr_prev = Some(prev_id);
        }
        self.used_index.insert(prev_front.as_u64(), prev_id);
        out.push(Allocation { id: prev_id, range: self.block(prev_id).range });
        out
    }
}

const fn fits(range: PhysicalRange, size: u64, align: u64) -> bool {
    let front = range.front.as_u64();
    let back = range.back.as_u64();
    let aligned_start = (front + align - 1) & !(align - 1);
    match aligned_start.checked_add(size) {
        Some(end) => end <= back,
        None => false,
    }
}

impl PhysicalFrameHeap {
    /// Create a heap over `ranges`, which must be sorted, non-empty, and
    /// non-overlapping. Each input range becomes its own address-ordered
    /// pool (no implicit linking across the gaps between ranges).
    pub fn create(ranges: &[PhysicalRange]) -> VmResult<Self> {
        if ranges.is_empty() {
            return Err(Status::InvalidInput);
        }
        for w in ranges.windows(2) {
            if w[0].back > w[1].front || w[0].is_empty() {
                return Err(Status::InvalidInput);
            }
        }
        if ranges.last().is_some_and(|r| r.is_empty()) {
            return Err(Status::InvalidInput);
        }

        let mut inner = HeapInner {
            blocks: Vec::new(),
            alive: Vec::new(),
            free_slots: Vec::new(),
            free_lists: [[None; SL_COUNT]; FL_COUNT],
            top_bitmap: 0,
            sl_bitmap: [0; FL_COUNT],
            used_index: BTreeMap::new(),
            used_bytes: 0,
            free_bytes: 0,
            malloc_count: 0,
            free_count: 0,
        };
        for &range in ranges {
            let id = inner.new_block(range, true, None, None);
            inner.free_bytes += range.size();
            inner.insert_free(id);
        }
        Ok(Self { inner: SpinLock::new(inner) })
    }

    #[must_use]
    fn natural_alignment(size: u64) -> u64 {
        if size == 0 {
            1
        } else {
            1u64 << size.trailing_zeros().min(30)
        }
    }

    pub fn malloc(&self, size: u64) -> VmResult<Allocation> {
        self.aligned_alloc(Self::natural_alignment(size), size)
    }

    pub fn aligned_alloc(&self, align: u64, size: u64) -> VmResult<Allocation> {
        if size == 0 || align == 0 || !align.is_power_of_two() {
            return Err(Status::InvalidInput);
        }
        let alloc = self.inner.with_lock(|h| {
            let Some(id) = h.find_fit(size, align) else {
                return Err(Status::OutOfMemory);
            };
            h.remove_free(id);
            let front = h.block(id).range.front.as_u64();
            let aligned_start = PhysicalAddress::new((front + align - 1) & !(align - 1));
            let alloc = h.carve(id, aligned_start, size);
            h.free_bytes -= size;
            h.malloc_count += 1;
            Ok(alloc)
        })?;
        trace!("allocated {size:#x} bytes at {}", alloc.range.front);
        Ok(alloc)
    }

    /// Allocate at or after `hint` if the block containing it can satisfy
    /// the request there; otherwise falls back to best-fit.
    pub fn allocate_with_hint(&self, align: u64, size: u64, hint: PhysicalAddress) -> VmResult<Allocation> {
        if size == 0 || align == 0 || !align.is_power_of_two() {
            return Err(Status::InvalidInput);
        }
        self.inner.with_lock(|h| {
            if let Some(id) = h.find_block_containing(hint) {
                if h.block(id).free {
                    let start = core::cmp::max(hint.as_u64(), h.block(id).range.front.as_u64());
                    let aligned = (start + align - 1) & !(align - 1);
                    if let Some(end) = aligned.checked_add(size) {
                        if end <= h.block(id).range.back.as_u64() {
                            h.remove_free(id);
                            let alloc = h.carve(id, PhysicalAddress::new(aligned), size);
                            h.free_bytes -= size;
                            h.malloc_count += 1;
                            return Ok(alloc);
                        }
                    }
                }
            }
            let Some(id) = h.find_fit(size, align) else {
                return Err(Status::OutOfMemory);
            };
            h.remove_free(id);
            let front = h.block(id).range.front.as_u64();
            let aligned_start = PhysicalAddress::new((front + align - 1) & !(align - 1));
            let alloc = h.carve(id, aligned_start, size);
            h.free_bytes -= size;
            h.malloc_count += 1;
            Ok(alloc)
        })
    }

    /// Allocate exactly `[address, address + size)`. Fails unless the
    /// address lies inside a single free block large enough for the whole
    /// request; partial overlaps with used blocks are rejected.
    pub fn allocate_at(&self, address: PhysicalAddress, size: u64) -> VmResult<Allocation> {
        if size == 0 {
            return Err(Status::InvalidInput);
        }
        self.inner.with_lock(|h| {
            let Some(id) = h.find_block_containing(address) else {
                return Err(Status::NotFound);
            };
            if !h.block(id).free {
                return Err(Status::NotAvailable);
            }
            let end = address.as_u64().checked_add(size).ok_or(Status::InvalidInput)?;
            if end > h.block(id).range.back.as_u64() {
                return Err(Status::NotAvailable);
            }
            h.remove_free(id);
            let alloc = h.carve(id, address, size);
            h.free_bytes -= size;
            h.malloc_count += 1;
            Ok(alloc)
        })
    }

    /// Mark `range` as used without giving it semantic purpose (MMIO,
    /// firmware regions, bookkeeping).
    pub fn reserve(&self, range: PhysicalRange) -> VmResult<Allocation> {
        if range.is_empty() {
            return Err(Status::InvalidInput);
        }
        let alloc = self.inner.with_lock(|h| {
            let Some(id) = h.find_block_containing(range.front) else {
                return Err(Status::NotFound);
            };
            if range.back > h.block(id).range.back {
                return Err(Status::NotFound);
            }
            if !h.block(id).free {
                return Err(Status::NotAvailable);
            }
            h.remove_free(id);
            let size = range.size();
            let alloc = h.carve(id, range.front, size);
            h.free_bytes -= size;
            h.block_mut(id).reserved = true;
            Ok(alloc)
        })?;
        trace!("reserved {} {}", range.front, range.back);
        Ok(alloc)
    }

    /// Free `allocation`, coalescing with free neighbours.
    pub fn free(&self, allocation: Allocation) {
        self.inner.with_lock(|h| {
            h.used_index.remove(&allocation.range.front.as_u64());
            h.used_bytes -= allocation.size();
            h.free_bytes += allocation.size();
            h.block_mut(allocation.id).reserved = false;
            h.coalesce_into_free(allocation.id);
            h.free_count += 1;
        });
        trace!("freed allocation at {}", allocation.range.front);
    }

    /// Grow `allocation` to `new_size` by consuming a free next neighbour.
    pub fn grow(&self, allocation: Allocation, new_size: u64) -> VmResult<Allocation> {
        if new_size <= allocation.size() {
            return Err(Status::InvalidInput);
        }
        self.inner.with_lock(|h| {
            let extra = new_size - allocation.size();
            let next = h.block(allocation.id).addr_next;
            let Some(next_id) = next else {
                return Err(Status::OutOfMemory);
            };
            if !h.block(next_id).free || h.block(next_id).size() < extra {
                return Err(Status::OutOfMemory);
            }
            h.remove_free(next_id);
            let next_back = h.block(next_id).range.back;
            let consumed_end = PhysicalAddress::new(h.block(allocation.id).range.back.as_u64() + extra);
            if consumed_end < next_back {
                h.block_mut(next_id).range.front = consumed_end;
                h.insert_free(next_id);
            } else {
                let nn = h.block(next_id).addr_next;
                if let Some(nn_id) = nn {
                    h.block_mut(nn_id).addr_prev = Some(allocation.id);
                }
                h.block_mut(allocation.id).addr_next = nn;
                h.retire_block(next_id);
            }
            h.used_index.remove(&allocation.range.front.as_u64());
            h.block_mut(allocation.id).range.back = consumed_end;
            h.used_index.insert(allocation.range.front.as_u64(), allocation.id);
            h.used_bytes += extra;
            h.free_bytes -= extra;
            Ok(Allocation { id: allocation.id, range: h.block(allocation.id).range })
        })
    }

    /// Shrink `allocation` to `new_size`, returning the trailing fragment to free.
    pub fn shrink(&self, allocation: Allocation, new_size: u64) -> VmResult<Allocation> {
        if new_size == 0 || new_size >= allocation.size() {
            return Err(Status::InvalidInput);
        }
        self.inner.with_lock(|h| {
            let new_back = PhysicalAddress::new(allocation.range.front.as_u64() + new_size);
            let old_back = h.block(allocation.id).range.back;
            let old_next = h.block(allocation.id).addr_next;
            h.used_index.remove(&allocation.range.front.as_u64());
            h.block_mut(allocation.id).range.back = new_back;
            h.used_index.insert(allocation.range.front.as_u64(), allocation.id);
            let trailing = h.new_block(Range::new(new_back, old_back), true, Some(allocation.id), old_next);
            h.block_mut(allocation.id).addr_next = Some(trailing);
            if let Some(n) = old_next {
                h.block_mut(n).addr_prev = Some(trailing);
            }
            h.used_bytes -= allocation.size() - new_size;
            h.free_bytes += allocation.size() - new_size;
            h.coalesce_into_free(trailing);
            Ok(Allocation { id: allocation.id, range: Range::new(allocation.range.front, new_back) })
        })
    }

    pub fn resize(&self, allocation: Allocation, new_size: u64) -> VmResult<Allocation> {
        use core::cmp::Ordering;
        match new_size.cmp(&allocation.size()) {
            Ordering::Greater => self.grow(allocation, new_size),
            Ordering::Less => self.shrink(allocation, new_size),
            Ordering::Equal => Ok(allocation),
        }
    }

    /// Split `allocation` at `midpoint`, invalidating the original handle.
    pub fn split(&self, allocation: Allocation, midpoint: PhysicalAddress) -> VmResult<(Allocation, Allocation)> {
        if midpoint <= allocation.range.front || midpoint >= allocation.range.back {
            return Err(Status::InvalidInput);
        }
        let result = self.inner.with_lock(|h| {
            let hi_id = h.withdraw_slots(1)[0];
            h.split_with_block(allocation, midpoint, hi_id)
        });
        trace!("split allocation at {midpoint} into {:?} and {:?}", result.0.range, result.1.range);
        Ok(result)
    }

    /// Split `allocation` at every point in `points` (strictly ascending,
    /// strictly interior, no duplicates), invalidating the original handle.
    pub fn splitv(&self, allocation: Allocation, points: &[PhysicalAddress]) -> VmResult<Vec<Allocation>> {
        if points.is_empty() {
            return Err(Status::InvalidInput);
        }
        for w in points.windows(2) {
            if w[0] >= w[1] {
                return Err(Status::InvalidInput);
            }
        }
        if points[0] <= allocation.range.front || *points.last().unwrap() >= allocation.range.back {
            return Err(Status::InvalidInput);
        }
        let out = self.inner.with_lock(|h| {
            let ids = h.withdraw_slots(points.len());
            h.splitv_with_blocks(allocation, points, &ids)
        });
        trace!("split allocation at {} {} into {} pieces", allocation.range.front, allocation.range.back, out.len());
        Ok(out)
    }

    /// Withdraw `count` block-pool slots up front without linking them into
    /// any pool or free list, for [`crate::PfhCommandList`]'s
    /// pre-reserve-at-record-time step.
    pub(crate) fn withdraw_control_blocks(&self, count: usize) -> Vec<BlockId> {
        self.inner.with_lock(|h| h.withdraw_slots(count))
    }

    /// Return slots withdrawn by [`Self::withdraw_control_blocks`] that were
    /// never installed (a command list dropped without committing).
    pub(crate) fn return_control_blocks(&self, ids: &[BlockId]) {
        self.inner.with_lock(|h| h.return_slots(ids));
    }

    /// Apply a `split` using an already-withdrawn `hi_id` instead of
    /// allocating one. Cannot fail; used by [`crate::PfhCommandList::commit`].
    pub(crate) fn commit_split(&self, allocation: Allocation, midpoint: PhysicalAddress, hi_id: BlockId) -> (Allocation, Allocation) {
        let result = self.inner.with_lock(|h| h.split_with_block(allocation, midpoint, hi_id));
        trace!("committed split at {midpoint} into {:?} and {:?}", result.0.range, result.1.range);
        result
    }

    /// Apply a `splitv` using already-withdrawn `ids` instead of allocating.
    /// Cannot fail; used by [`crate::PfhCommandList::commit`].
    pub(crate) fn commit_splitv(&self, allocation: Allocation, points: &[PhysicalAddress], ids: &[BlockId]) -> Vec<Allocation> {
        let out = self.inner.with_lock(|h| h.splitv_with_blocks(allocation, points, ids));
        trace!("committed splitv of {} {} into {} pieces", allocation.range.front, allocation.range.back, out.len());
        out
    }

    /// O(log n) lookup of the used allocation covering `address`.
    pub fn find_allocation(&self, address: PhysicalAddress) -> VmResult<Allocation> {
        self.inner.with_lock(|h| {
            h.used_index
                .range(..=address.as_u64())
                .next_back()
                .map(|(_, &id)| Allocation { id, range: h.block(id).range })
                .filter(|a| a.range.contains_addr(address))
                .ok_or(Status::NotFound)
        })
    }

    pub fn free_address(&self, address: PhysicalAddress) -> VmResult<()> {
        let allocation = self.find_allocation(address)?;
        self.free(allocation);
        Ok(())
    }

    /// Release empty internal bookkeeping back to the block pool, returning
    /// statistics. TLSF control blocks here live in a slab `Vec`, not
    /// physical memory, so compaction only shrinks that `Vec`'s tail when
    /// every retired slot at the end is unused.
    pub fn compact(&self) -> PfhCompactStats {
        self.inner.with_lock(|h| {
            let mut released = 0usize;
            while h.alive.last() == Some(&false) {
                h.alive.pop();
                h.blocks.pop();
                h.free_slots.retain(|&i| (i as usize) < h.alive.len());
                released += 1;
            }
            PfhCompactStats { blocks_released: released, bytes_reclaimed: 0 }
        })
    }

    #[must_use]
    pub fn stats(&self) -> PfhStats {
        self.inner.with_lock(|h| PfhStats {
            used_bytes: h.used_bytes,
            free_bytes: h.free_bytes,
            block_count: h.blocks.iter().enumerate().filter(|(i, _)| h.alive[*i]).count(),
            malloc_count: h.malloc_count,
            free_count: h.free_count,
        })
    }

    /// Invalidate every outstanding allocation and return to post-create state.
    pub fn reset(&self, ranges: &[PhysicalRange]) -> VmResult<()> {
        let fresh = Self::create(ranges)?;
        self.inner.with_lock(|h| {
            *h = fresh.inner.into_inner();
        });
        Ok(())
    }

    /// Panics if any invariant from the data-model section is violated.
    pub fn validate(&self) {
        self.inner.with_lock(|h| {
            for (i, b) in h.blocks.iter().enumerate() {
                if !h.alive[i] {
                    continue;
                }
                assert!(b.size() > 0, "block {i} has non-positive size");
                if let Some(next) = b.addr_next {
                    assert_eq!(h.block(next).addr_prev, Some(BlockId(i as u32)), "broken addr_prev link");
                    assert_eq!(b.range.back, h.block(next).range.front, "gap within pool at block {i}");
                }
                let should_be_free = b.free && !b.reserved;
                if should_be_free {
                    let (f, sl) = class_of(b.size());
                    let mut found = false;
                    let mut cur = h.free_lists[f][sl];
                    while let Some(id) = cur {
                        if id.0 as usize == i {
                            found = true;
                            break;
                        }
                        cur = h.block(id).free_next;
                    }
                    assert!(found, "free block {i} missing from its free list");
                }
            }
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use vmcore_addr::PhysicalAddress as Pa;

    fn range(a: u64, b: u64) -> PhysicalRange {
        Range::new(Pa::new(a), Pa::new(b))
    }

    #[test]
    fn create_rejects_empty_input() {
        assert_eq!(PhysicalFrameHeap::create(&[]).unwrap_err(), Status::InvalidInput);
    }

    #[test]
    fn malloc_then_free_restores_stats() {
        let heap = PhysicalFrameHeap::create(&[range(0x1000, 0x1_0000)]).unwrap();
        let before = heap.stats();
        let a = heap.malloc(0x1000).unwrap();
        assert_eq!(a.range.front.as_u64(), 0x1000);
        heap.free(a);
        let after = heap.stats();
        assert_eq!(before.free_bytes, after.free_bytes);
        assert_eq!(after.used_bytes, 0);
    }

    #[test]
    fn splitv_fan_out_preserves_used_bytes() {
        let heap = PhysicalFrameHeap::create(&[range(0x1000, 0x5000)]).unwrap();
        let a = heap.malloc(0x1000).unwrap();
        assert_eq!(a.range.front.as_u64(), 0x1000);
        let points = [Pa::new(0x1100), Pa::new(0x1200), Pa::new(0x1300), Pa::new(0x1400)];
        let out = heap.splitv(a, &points).unwrap();
        assert_eq!(out.len(), 5);
        for (i, alloc) in out.iter().enumerate() {
            assert_eq!(alloc.range.front.as_u64(), 0x1000 + i as u64 * 0x100);
        }
        let stats = heap.stats();
        assert_eq!(stats.used_bytes, 0x1000);
    }

    #[test]
    fn split_then_free_matches_unsplit_free() {
        let heap = PhysicalFrameHeap::create(&[range(0x1000, 0x1_0000)]).unwrap();
        let a = heap.malloc(0x2000).unwrap();
        let before_split_free = heap.stats().free_bytes;
        let (lo, hi) = heap.split(a, Pa::new(a.range.front.as_u64() + 0x1000)).unwrap();
        heap.free(lo);
        heap.free(hi);
        assert_eq!(heap.stats().free_bytes, before_split_free + 0x2000);
    }

    #[test]
    fn grow_into_free_neighbour() {
        let heap = PhysicalFrameHeap::create(&[range(0x1000, 0x5000)]).unwrap();
        let a = heap.malloc(0x1000).unwrap();
        let b = heap.malloc(0x1000).unwrap();
        heap.free(b);
        let a = heap.grow(a, 0x2000).unwrap();
        assert_eq!(a.size(), 0x2000);
    }

    #[test]
    fn allocate_at_exact_address() {
        let heap = PhysicalFrameHeap::create(&[range(0x1000, 0x5000)]).unwrap();
        let a = heap.allocate_at(Pa::new(0x2000), 0x1000).unwrap();
        assert_eq!(a.range.front.as_u64(), 0x2000);
    }

    #[test]
    fn validate_passes_after_mixed_operations() {
        let heap = PhysicalFrameHeap::create(&[range(0x1000, 0x1_0000)]).unwrap();
        let a = heap.malloc(0x1000).unwrap();
        let b = heap.malloc(0x2000).unwrap();
        heap.free(a);
        let c = heap.malloc(0x500).unwrap();
        heap.free(b);
        heap.free(c);
        heap.validate();
    }
}
