//! [`AddressSpaceManager`]: glues a shared [`PhysicalFrameHeap`] and a
//! private [`PageTables`] into one per-process view — an ordered segment
//! map keyed by virtual start address, with `map`/`unmap` that keep the
//! segment map, the backing physical allocation, and the page tables in
//! lockstep (`spec.md §4.4`).

use alloc::collections::BTreeMap;
use alloc::vec::Vec;

use log::trace;
use vmcore_addr::{
    AddressMapping, MemoryType, PageFlags, PhysicalAddress, PhysicalPage, Range, Size4K, Status,
    VirtualAddress, VirtualRange, VmResult,
};
use vmcore_pfh::{PfhCommandList, PhysicalFrameHeap};
use vmcore_pt::{EntryBits, L4Index, PageBuilder, PageTables, PtCommandList};
use vmcore_sync::SpinLock;

use crate::segment::AddressSegment;
use crate::vfree::VirtualFreeList;

/// Snapshot returned by [`AddressSpaceManager::stats`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AddressSpaceStats {
    pub segment_count: usize,
    pub virtual_free_bytes: u64,
}

/// Per-process (or per-VM-region) address space: one [`PageTables`] plus the
/// bookkeeping needed to place and release virtual ranges against it.
///
/// The placement TLSF in `spec.md §4.4` ("Initializes an empty TLSF over
/// `virtual_range`") is realized here by [`VirtualFreeList`] — a flat
/// first-fit scan rather than full TLSF bins, since one address space's own
/// segment count rarely justifies the two-level bitmap machinery the
/// system-wide physical heap needs (see `vfree.rs`'s module doc).
pub struct AddressSpaceManager {
    pt: PageTables,
    vfree: SpinLock<VirtualFreeList>,
    segments: SpinLock<BTreeMap<VirtualAddress, AddressSegment>>,
}

/// Intersection of two ranges, or `None` if they don't overlap.
fn intersect(a: VirtualRange, b: VirtualRange) -> Option<VirtualRange> {
    if !a.intersects(b) {
        return None;
    }
    let front = if a.front > b.front { a.front } else { b.front };
    let back = if a.back < b.back { a.back } else { b.back };
    Some(Range::new(front, back))
}

impl AddressSpaceManager {
    /// Create a manager with an empty segment map, a PT rooted in a fresh
    /// PML4 drawn from `pte_memory`, and a placement free list covering the
    /// whole of `virtual_range`.
    ///
    /// # Safety
    /// `pte_memory.vaddr` must already be mapped read/write for
    /// `pte_memory.size` bytes and exclusively owned by the resulting
    /// manager, per [`PageTables::create`].
    pub unsafe fn create(
        builder: PageBuilder,
        pte_memory: AddressMapping,
        middle_flags: EntryBits,
        virtual_range: VirtualRange,
    ) -> VmResult<Self> {
        let pt = unsafe { PageTables::create(builder, pte_memory, middle_flags)? };
        Ok(Self {
            pt,
            vfree: SpinLock::new(VirtualFreeList::new(virtual_range)),
            segments: SpinLock::new(BTreeMap::new()),
        })
    }

    /// The root PML4 frame, handed to the caller to load into `CR3`.
    /// Activating an address space on a core is the caller's job (out of
    /// core scope; see `spec.md §1`'s scheduler/process boundary).
    #[must_use]
    pub fn root(&self) -> PhysicalPage<Size4K> {
        self.pt.root()
    }

    /// Copy every PML4 entry at or above `boundary` from `other` into this
    /// manager's root, so a freshly created address space inherits `other`'s
    /// higher half (conventionally the kernel mapping). Only meaningful
    /// while `self` is new and not yet visible to other cores.
    pub fn clone_upper_half_from(&self, other: &AddressSpaceManager, boundary: L4Index) {
        self.pt.clone_higher_half_from(&other.pt, boundary);
    }

    /// Allocate `size` physical bytes from the shared heap, place a matching
    /// virtual range, install the mapping, and record an owned segment.
    /// Any failure after the physical allocation succeeds releases it before
    /// returning, leaving both heaps observably unchanged.
    pub fn map(
        &self,
        memory_manager: &PhysicalFrameHeap,
        size: u64,
        align: u64,
        flags: PageFlags,
        ty: MemoryType,
    ) -> VmResult<AddressMapping> {
        if size == 0 || flags.is_none() {
            return Err(Status::InvalidInput);
        }
        let allocation = memory_manager.aligned_alloc(align, size)?;
        let vrange = match self.vfree.with_lock(|v| v.allocate(align, size)) {
            Ok(r) => r,
            Err(e) => {
                memory_manager.free(allocation);
                return Err(e);
            }
        };
        let mapping = AddressMapping::new(vrange.front, allocation.range.front, size);
        if let Err(e) = self.pt.map(mapping, flags, ty) {
            // `PageTables::map` may have installed a prefix of `mapping`
            // before hitting `OutOfMemory` (spec.md §4.3: "partial failures
            // ... leave previously completed steps applied"). Tear down
            // whatever it did install before releasing the backing
            // allocation, or the freed physical range stays reachable
            // through stale present PTEs.
            let _ = self.pt.unmap(mapping.virtual_range());
            self.vfree.with_lock(|v| v.release(vrange));
            memory_manager.free(allocation);
            return Err(e);
        }
        self.segments.with_lock(|s| {
            s.insert(
                vrange.front,
                AddressSegment {
                    vrange,
                    prange: allocation.range,
                    allocation: Some(allocation),
                    flags,
                    memory_type: ty,
                },
            );
        });
        trace!("mapped segment VA={} -> PA={} size={size:#x}", vrange.front, allocation.range.front);
        Ok(mapping)
    }

    /// Shared-mapping primitive: map `other`'s segments covering
    /// `range_in_other` into `self` at a freshly placed virtual range,
    /// without taking ownership of the underlying physical allocation(s) —
    /// `other` remains responsible for releasing them. Fails with
    /// [`Status::NotFound`] if `range_in_other` is not fully covered by
    /// `other`'s segment map (no partial sharing of an unmapped hole).
    pub fn map_shared(
        &self,
        other: &AddressSpaceManager,
        range_in_other: VirtualRange,
        flags: PageFlags,
        ty: MemoryType,
    ) -> VmResult<VirtualRange> {
        if range_in_other.is_empty() || flags.is_none() {
            return Err(Status::InvalidInput);
        }
        let size = range_in_other.size();
        let pieces = other.segments.with_lock(|segs| {
            let mut out = Vec::new();
            for seg in segs.values() {
                let Some(overlap) = intersect(seg.vrange, range_in_other) else {
                    continue;
                };
                let offset = overlap.front - range_in_other.front;
                let seg_offset = overlap.front - seg.vrange.front;
                let paddr = seg.prange.front + seg_offset;
                out.push((offset, overlap.size(), paddr));
            }
            out
        });
        let covered: u64 = pieces.iter().map(|&(_, len, _)| len).sum();
        if covered != size {
            return Err(Status::NotFound);
        }

        let vrange = self.vfree.with_lock(|v| v.allocate(4096, size))?;
        for &(offset, len, paddr) in &pieces {
            let vaddr = vrange.front + offset;
            if let Err(e) = self.pt.map(AddressMapping::new(vaddr, paddr, len), flags, ty) {
                let _ = self.pt.unmap(Range::new(vrange.front, vaddr));
                self.vfree.with_lock(|v| v.release(vrange));
                return Err(e);
            }
        }
        self.segments.with_lock(|s| {
            for (offset, len, paddr) in pieces {
                let seg_vrange = Range::new(vrange.front + offset, vrange.front + offset + len);
                s.insert(
                    seg_vrange.front,
                    AddressSegment {
                        vrange: seg_vrange,
                        prange: Range::new(paddr, paddr + len),
                        allocation: None,
                        flags,
                        memory_type: ty,
                    },
                );
            }
        });
        trace!("shared VA range {}..{} from another address space's segments", vrange.front, vrange.back);
        Ok(vrange)
    }

    /// Unmap `range`, splitting or cutting every segment it partially
    /// overlaps (front overlap, back overlap, or interior cut) and freeing
    /// the vacated physical allocation back to `memory_manager` for owned
    /// segments. Borrowed (shared-mapped) segments are unmapped from this
    /// manager's page tables only; their backing stays owned elsewhere.
    ///
    /// Page-table unmaps and PFH splits are each staged through their own
    /// command list (withdrawing/pre-allocating every resource the batch
    /// needs before either commits), so a resource shortfall during staging
    /// leaves both heaps untouched; see `spec.md §4.5`.
    pub fn unmap(&self, memory_manager: &PhysicalFrameHeap, range: VirtualRange) -> VmResult<()> {
        if range.is_empty() {
            return Ok(());
        }

        enum Action {
            Full,
            Front { split_at: PhysicalAddress },
            Back { split_at: PhysicalAddress },
            Interior { lo_mid: PhysicalAddress, hi_mid: PhysicalAddress },
        }

        let overlapping: Vec<AddressSegment> =
            self.segments.with_lock(|s| s.values().filter(|seg| seg.vrange.intersects(range)).copied().collect());
        if overlapping.is_empty() {
            return Ok(());
        }

        let mut plans = Vec::with_capacity(overlapping.len());
        for seg in &overlapping {
            let removed = intersect(seg.vrange, range).expect("filtered for intersection above");
            let action = if removed == seg.vrange {
                Action::Full
            } else if removed.front == seg.vrange.front {
                let off = removed.size();
                Action::Front { split_at: seg.prange.front + off }
            } else if removed.back == seg.vrange.back {
                let off = removed.front - seg.vrange.front;
                Action::Back { split_at: seg.prange.front + off }
            } else {
                let lo_off = removed.front - seg.vrange.front;
                let hi_off = removed.back - seg.vrange.front;
                Action::Interior {
                    lo_mid: seg.prange.front + lo_off,
                    hi_mid: seg.prange.front + hi_off,
                }
            };
            plans.push((*seg, removed, action));
        }

        let mut pfh_list = PfhCommandList::new(memory_manager);
        for (seg, _, action) in &plans {
            let Some(alloc) = seg.allocation else { continue };
            match action {
                Action::Front { split_at } | Action::Back { split_at } => {
                    pfh_list.record_split(alloc, *split_at)?;
                }
                Action::Interior { lo_mid, hi_mid } => {
                    pfh_list.record_splitv(alloc, &[*lo_mid, *hi_mid])?;
                }
                Action::Full => {}
            }
        }

        let mut pt_list = PtCommandList::new(&self.pt);
        for (_, removed, _) in &plans {
            pt_list.record_unmap(*removed)?;
        }

        // Both batches fully staged: commit PFH first, then PT (the fixed
        // acquisition/ordering invariant in `spec.md §5`), then reconcile
        // the segment map using the freshly committed physical state.
        pfh_list.commit();
        pt_list.commit();
        trace!("unmapped VA range {}..{} across {} segment(s)", range.front, range.back, plans.len());

        self.segments.with_lock(|s| {
            for (seg, removed, action) in plans {
                s.remove(&seg.vrange.front);
                match action {
                    Action::Full => {
                        if let Some(alloc) = seg.allocation {
                            memory_manager.free(alloc);
                        }
                    }
                    Action::Front { split_at } => {
                        let new_vrange = Range::new(removed.back, seg.vrange.back);
                        let (new_prange, new_alloc) = match seg.allocation {
                            Some(_) => {
                                let a = memory_manager
                                    .find_allocation(split_at)
                                    .expect("split committed this fragment");
                                (a.range, Some(a))
                            }
                            None => (Range::new(split_at, seg.prange.back), None),
                        };
                        s.insert(
                            new_vrange.front,
                            AddressSegment { vrange: new_vrange, prange: new_prange, allocation: new_alloc, flags: seg.flags, memory_type: seg.memory_type },
                        );
                    }
                    Action::Back { split_at } => {
                        let new_vrange = Range::new(seg.vrange.front, removed.front);
                        let (new_prange, new_alloc) = match seg.allocation {
                            Some(_) => {
                                let a = memory_manager
                                    .find_allocation(seg.prange.front)
                                    .expect("split committed this fragment");
                                (a.range, Some(a))
                            }
                            None => (Range::new(seg.prange.front, split_at), None),
                        };
                        s.insert(
                            new_vrange.front,
                            AddressSegment { vrange: new_vrange, prange: new_prange, allocation: new_alloc, flags: seg.flags, memory_type: seg.memory_type },
                        );
                    }
                    Action::Interior { lo_mid, hi_mid } => {
                        let lo_vrange = Range::new(seg.vrange.front, removed.front);
                        let hi_vrange = Range::new(removed.back, seg.vrange.back);
                        let (lo_prange, lo_alloc) = match seg.allocation {
                            Some(_) => {
                                let a = memory_manager
                                    .find_allocation(seg.prange.front)
                                    .expect("splitv committed the lo fragment");
                                (a.range, Some(a))
                            }
                            None => (Range::new(seg.prange.front, lo_mid), None),
                        };
                        let (hi_prange, hi_alloc) = match seg.allocation {
                            Some(_) => {
                                let a = memory_manager.find_allocation(hi_mid).expect("splitv committed the hi fragment");
                                (a.range, Some(a))
                            }
                            None => (Range::new(hi_mid, seg.prange.back), None),
                        };
                        s.insert(
                            lo_vrange.front,
                            AddressSegment { vrange: lo_vrange, prange: lo_prange, allocation: lo_alloc, flags: seg.flags, memory_type: seg.memory_type },
                        );
                        s.insert(
                            hi_vrange.front,
                            AddressSegment { vrange: hi_vrange, prange: hi_prange, allocation: hi_alloc, flags: seg.flags, memory_type: seg.memory_type },
                        );
                    }
                }
            }
        });
        Ok(())
    }

    /// O(log n) lookup of the segment whose virtual range contains `addr`.
    pub fn query_segment(&self, addr: VirtualAddress) -> VmResult<AddressSegment> {
        self.segments.with_lock(|s| {
            s.range(..=addr)
                .next_back()
                .map(|(_, seg)| *seg)
                .filter(|seg| seg.vrange.contains_addr(addr))
                .ok_or(Status::NotFound)
        })
    }

    #[must_use]
    pub fn stats(&self) -> AddressSpaceStats {
        let segment_count = self.segments.with_lock(BTreeMap::len);
        let virtual_free_bytes = self.vfree.with_lock(VirtualFreeList::free_bytes);
        AddressSpaceStats { segment_count, virtual_free_bytes }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use vmcore_addr::{PatLayout, PhysicalAddress, PhysicalRange, VirtualAddress as Va};
    use vmcore_pt::EntryBits;

    fn make_manager() -> (alloc::vec::Vec<u8>, PhysicalFrameHeap, AddressSpaceManager) {
        const PTE_FRAMES: u64 = 64;
        let mut pte_buf = alloc::vec![0u8; (PTE_FRAMES * 4096) as usize];
        let pte_base = pte_buf.as_mut_ptr() as u64;
        let pte_memory = AddressMapping::new(Va::new(pte_base), PhysicalAddress::new(pte_base), PTE_FRAMES * 4096);
        let builder = PageBuilder::new(40, 48, Va::ZERO, PatLayout::default());
        let manager = unsafe {
            AddressSpaceManager::create(
                builder,
                pte_memory,
                EntryBits::permissive_middle(),
                Range::new(Va::new(0xffff_8000_0000_0000), Va::new(0xffff_8000_1000_0000)),
            )
            .unwrap()
        };
        let pfh = PhysicalFrameHeap::create(&[PhysicalRange::new(PhysicalAddress::new(0x10_0000), PhysicalAddress::new(0x20_0000))]).unwrap();
        (pte_buf, pfh, manager)
    }

    #[test]
    fn map_then_unmap_round_trips_stats() {
        let (_buf, pfh, manager) = make_manager();
        let before = pfh.stats();
        let mapping = manager.map(&pfh, 0x4000, 0x1000, PageFlags::DATA, MemoryType::WriteBack).unwrap();
        assert_eq!(manager.stats().segment_count, 1);
        assert_eq!(manager.query_segment(mapping.vaddr).unwrap().vrange, mapping.virtual_range());
        manager.unmap(&pfh, mapping.virtual_range()).unwrap();
        assert_eq!(manager.stats().segment_count, 0);
        assert_eq!(pfh.stats(), before);
        assert!(manager.query_segment(mapping.vaddr).is_err());
    }

    #[test]
    fn interior_unmap_splits_segment_in_two() {
        let (_buf, pfh, manager) = make_manager();
        let mapping = manager.map(&pfh, 0x4000, 0x1000, PageFlags::DATA, MemoryType::WriteBack).unwrap();
        let v = mapping.vaddr;
        manager.unmap(&pfh, Range::new(v + 0x1000, v + 0x3000)).unwrap();
        assert_eq!(manager.stats().segment_count, 2);
        assert_eq!(manager.query_segment(v).unwrap().vrange, Range::new(v, v + 0x1000));
        assert_eq!(manager.query_segment(v + 0x3000).unwrap().vrange, Range::new(v + 0x3000, v + 0x4000));
        assert!(manager.query_segment(v + 0x1800).is_err());
    }

    #[test]
    fn map_shared_borrows_without_taking_ownership() {
        let (_buf, pfh, owner) = make_manager();
        const FRAMES: u64 = 64;
        let mut other_pte_buf = alloc::vec![0u8; (FRAMES * 4096) as usize];
        let other_base = other_pte_buf.as_mut_ptr() as u64;
        let other_pte_memory = AddressMapping::new(Va::new(other_base), PhysicalAddress::new(other_base), FRAMES * 4096);
        let builder = PageBuilder::new(40, 48, Va::ZERO, PatLayout::default());
        let borrower = unsafe {
            AddressSpaceManager::create(
                builder,
                other_pte_memory,
                EntryBits::permissive_middle(),
                Range::new(Va::new(0xffff_8000_2000_0000), Va::new(0xffff_8000_3000_0000)),
            )
            .unwrap()
        };
        let mapping = owner.map(&pfh, 0x1000, 0x1000, PageFlags::DATA, MemoryType::WriteBack).unwrap();
        let shared = borrower.map_shared(&owner, mapping.virtual_range(), PageFlags::READ, MemoryType::WriteBack).unwrap();
        assert_eq!(shared.size(), 0x1000);
        assert!(!borrower.query_segment(shared.front).unwrap().is_owned());
        let before = pfh.stats();
        borrower.unmap(&pfh, shared).unwrap();
        assert_eq!(pfh.stats(), before);
    }
}
