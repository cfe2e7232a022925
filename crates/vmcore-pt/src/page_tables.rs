//! The four-level PML4 hierarchy: map/unmap/walk, large-page promotion, and
//! the split/cut demotion paths unmap needs when a 2 MiB leaf only partially
//! overlaps the requested range (`spec.md §4.3`).

use log::trace;
use vmcore_addr::{
    AddressMapping, MemoryType, PageFlags, PageSize as _, PageSizeKind, PhysicalAddress, PhysicalPage,
    Size2M, Size4K, Status, VirtualAddress, VirtualRange, VmResult,
};
use vmcore_pta::{PageTableAllocator, PageTableList};
use vmcore_sync::SpinLock;

use crate::bits::EntryBits;
use crate::builder::PageBuilder;
use crate::pd::{L2Index, PdEntry, PdEntryKind, PageDirectory};
use crate::pdpt::{L3Index, PdptEntry, PdptEntryKind, PageDirectoryPointerTable};
use crate::pml4::{L4Index, PageMapLevel4, Pml4Entry};
use crate::pt::{L1Index, PageTable, PtEntry4k};
use crate::walk::PageWalk;

/// Owns one PML4 and the [`PageTableAllocator`] that supplies its non-root
/// frames. One [`SpinLock`] guards every mutating operation and every query
/// (queries read entries that may be concurrently mutated, per `spec.md §5`).
pub struct PageTables {
    inner: SpinLock<Inner>,
}

pub(crate) struct Inner {
    builder: PageBuilder,
    pta: PageTableAllocator,
    /// Constant `vaddr - paddr` for the arena the root and every non-root
    /// frame are drawn from; frames are always directly addressable.
    slide: i64,
    root: PhysicalPage<Size4K>,
    /// Permissive flags applied to newly allocated middle (non-leaf) entries.
    middle_flags: EntryBits,
}

impl PageTables {
    /// Allocate the root PML4 from a fresh [`PageTableAllocator`] over `arena`.
    ///
    /// # Safety
    /// `arena.vaddr` must already be mapped read/write for `arena.size` bytes
    /// and exclusively owned by the resulting instance.
    pub unsafe fn create(
        builder: PageBuilder,
        arena: AddressMapping,
        middle_flags: EntryBits,
    ) -> VmResult<Self> {
        let mut pta = unsafe { PageTableAllocator::create(arena, Size4K::SIZE)? };
        let slide = arena.vaddr.as_u64().wrapping_sub(arena.paddr.as_u64()) as i64;
        let root = pta.allocate(1).ok_or(Status::OutOfMemory)?;
        unsafe {
            let table = Self::frame_ptr::<PageMapLevel4>(root, slide);
            table.write(PageMapLevel4::zeroed());
        }
        Ok(Self { inner: SpinLock::new(Inner { builder, pta, slide, root, middle_flags }) })
    }

    #[must_use]
    pub fn root(&self) -> PhysicalPage<Size4K> {
        self.inner.with_lock(|inner| inner.root)
    }

    /// Raw pointer to a page-table frame, valid because the arena is
    /// pre-mapped with a constant `slide` (§3 "PTA arena" invariant).
    unsafe fn frame_ptr<T>(page: PhysicalPage<Size4K>, slide: i64) -> *mut T {
        page.base().as_u64().wrapping_add(slide as u64) as *mut T
    }

    /// Install a 1:1 linear mapping. Tiles 2 MiB leaves wherever both
    /// endpoints of the remaining span are 2 MiB-aligned and at least one
    /// full 2 MiB page remains, falling back to 4 KiB entries everywhere
    /// else (the 3-segment head/body/tail shape falls out of this loop
    /// naturally without special-casing the boundaries).
    pub fn map(&self, mapping: AddressMapping, flags: PageFlags, ty: MemoryType) -> VmResult<()> {
        if !mapping.is_well_formed() || flags.is_none() {
            return Err(Status::InvalidInput);
        }
        self.inner.with_lock(|inner| inner.map_locked(mapping, flags, ty))
    }

    /// Convenience overload: map `prange` at `vaddr` with `flags`/`ty`.
    pub fn map_range(
        &self,
        vaddr: VirtualAddress,
        prange: vmcore_addr::PhysicalRange,
        flags: PageFlags,
        ty: MemoryType,
    ) -> VmResult<()> {
        self.map(AddressMapping::new(vaddr, prange.front, prange.size()), flags, ty)
    }

    /// Unmap `range`, splitting or cutting any 2 MiB leaf that only partially
    /// overlaps it. A no-op (`Ok`) on an empty range or a range with nothing
    /// mapped in it.
    pub fn unmap(&self, range: VirtualRange) -> VmResult<()> {
        if range.is_empty() {
            return Ok(());
        }
        if !range.front.is_aligned::<Size4K>() || !range.back.is_aligned::<Size4K>() {
            return Err(Status::InvalidInput);
        }
        self.inner.with_lock(|inner| inner.unmap_locked(range))
    }

    /// Like [`Self::unmap`] but requires 2 MiB alignment of both endpoints
    /// and never allocates a new page table — safe to call from contexts
    /// that must not fail with `OutOfMemory` (e.g. fault handlers).
    pub fn unmap2m(&self, range: VirtualRange) -> VmResult<()> {
        if range.is_empty() {
            return Ok(());
        }
        if !range.front.is_aligned::<Size2M>() || !range.back.is_aligned::<Size2M>() || range.size() < Size2M::SIZE {
            return Err(Status::InvalidInput);
        }
        self.inner.with_lock(|inner| inner.unmap_locked(range))
    }

    #[must_use]
    pub fn walk(&self, addr: VirtualAddress) -> PageWalk {
        self.inner.with_lock(|inner| inner.walk_locked(addr))
    }

    #[must_use]
    pub fn get_backing_address(&self, addr: VirtualAddress) -> PhysicalAddress {
        self.walk(addr).backing_address(addr)
    }

    #[must_use]
    pub fn get_memory_flags(&self, addr: VirtualAddress) -> PageFlags {
        self.walk(addr).flags()
    }

    #[must_use]
    pub fn get_page_size(&self, addr: VirtualAddress) -> PageSizeKind {
        self.walk(addr).page_size()
    }

    /// Reclaim middle tables (PD, and transitively PDPT/PML4 children) whose
    /// leaves are all non-present. Returns the number of frames returned to
    /// the allocator.
    pub fn compact(&self) -> usize {
        self.inner.with_lock(Inner::compact_locked)
    }

    pub(crate) fn with_inner<R>(&self, f: impl FnOnce(&mut Inner) -> R) -> R {
        self.inner.with_lock(f)
    }

    /// Copy every PML4 entry at or above `boundary` from `other`'s root into
    /// this instance's root, so a freshly created address space shares
    /// `other`'s mappings at and above that index (the conventional way a
    /// per-process address space inherits the kernel's higher half from the
    /// bootstrap address space). Entries below `boundary` are left untouched.
    ///
    /// Intended for use only while `self` is newly created and not yet
    /// visible to other cores; acquires `self`'s lock and then `other`'s.
    pub fn clone_higher_half_from(&self, other: &PageTables, boundary: L4Index) {
        self.inner.with_lock(|inner| {
            other.inner.with_lock(|other_inner| {
                for i in boundary.as_usize()..512 {
                    let i4 = L4Index::new(i as u16);
                    let e = other_inner.pml4_mut_const().get(i4);
                    inner.pml4_mut().set(i4, e);
                }
            });
        });
    }
}

impl Inner {
    fn table_mut<T>(&self, page: PhysicalPage<Size4K>) -> &mut T {
        unsafe { &mut *PageTables::frame_ptr::<T>(page, self.slide) }
    }

    fn pml4_mut(&self) -> &mut PageMapLevel4 {
        self.table_mut(self.root)
    }

    fn alloc_table_frame(&mut self) -> VmResult<PhysicalPage<Size4K>> {
        self.pta.allocate(1).ok_or(Status::OutOfMemory)
    }

    fn ensure_pdpt(&mut self, va: VirtualAddress) -> VmResult<(L4Index, &mut PageDirectoryPointerTable)> {
        let i4 = L4Index::from_va(va);
        let pml4 = self.pml4_mut();
        let e = pml4.get(i4);
        let page = if let Some(p) = e.next_table() {
            p
        } else {
            let p = self.alloc_table_frame()?;
            self.table_mut::<PageDirectoryPointerTable>(p).write_zeroed();
            self.pml4_mut().set(i4, Pml4Entry::make(self.middle_flags, p));
            p
        };
        Ok((i4, self.table_mut(page)))
    }

    fn ensure_pd(&mut self, va: VirtualAddress) -> VmResult<(L3Index, &mut PageDirectory)> {
        let (_, pdpt) = self.ensure_pdpt(va)?;
        let i3 = L3Index::from_va(va);
        let entry = pdpt.get(i3);
        let page = match entry.kind() {
            Some(PdptEntryKind::NextPageDirectory(p, _)) => p,
            Some(PdptEntryKind::Leaf1GiB(..)) => return Err(Status::NotSupported),
            None => {
                let p = self.alloc_table_frame()?;
                self.table_mut::<PageDirectory>(p).write_zeroed();
                let (_, pdpt) = self.ensure_pdpt(va)?;
                pdpt.set(i3, PdptEntry::make_next(self.middle_flags, p));
                p
            }
        };
        Ok((i3, self.table_mut(page)))
    }

    fn ensure_pt(&mut self, va: VirtualAddress) -> VmResult<(L2Index, &mut PageTable)> {
        let (_, pd) = self.ensure_pd(va)?;
        let i2 = L2Index::from_va(va);
        let entry = pd.get(i2);
        let page = match entry.kind() {
            Some(PdEntryKind::NextPageTable(p, _)) => p,
            Some(PdEntryKind::Leaf2MiB(..)) => return Err(Status::NotSupported),
            None => {
                let p = self.alloc_table_frame()?;
                self.table_mut::<PageTable>(p).write_zeroed();
                let (_, pd) = self.ensure_pd(va)?;
                pd.set(i2, PdEntry::make_next(self.middle_flags, p));
                p
            }
        };
        Ok((i2, self.table_mut(page)))
    }

    fn map_one_4k(&mut self, va: VirtualAddress, pa: PhysicalAddress, leaf: EntryBits) -> VmResult<()> {
        let (_, pt) = self.ensure_pt(va)?;
        let page = PhysicalPage::<Size4K>::from_base_unchecked(pa);
        pt.set(L1Index::from_va(va), PtEntry4k::make(leaf, page));
        invlpg(va);
        trace!("mapped 4 KiB page at VA={va} -> PA={pa}");
        Ok(())
    }

    fn map_one_2m(&mut self, va: VirtualAddress, pa: PhysicalAddress, leaf: EntryBits) -> VmResult<()> {
        let (_, pd) = self.ensure_pd(va)?;
        let i2 = L2Index::from_va(va);
        match pd.get(i2).kind() {
            Some(PdEntryKind::NextPageTable(child, _)) => {
                if !self.table_mut::<PageTable>(child).is_empty() {
                    return Err(Status::NotSupported);
                }
                self.pta.deallocate(child, 1, self.slide);
            }
            _ => {}
        }
        let page = PhysicalPage::<Size2M>::from_base_unchecked(pa);
        let (_, pd) = self.ensure_pd(va)?;
        pd.set(i2, PdEntry::make_2m(leaf, page));
        invlpg(va);
        trace!("mapped 2 MiB page at VA={va} -> PA={pa}");
        Ok(())
    }

    pub(crate) fn map_locked(&mut self, mapping: AddressMapping, flags: PageFlags, ty: MemoryType) -> VmResult<()> {
        let leaf = EntryBits::for_leaf(flags, ty, self.builder.pat);
        let mut off = 0u64;
        while off < mapping.size {
            let va = mapping.vaddr + off;
            let pa = mapping.paddr + off;
            let remain = mapping.size - off;
            if va.is_aligned::<Size2M>() && pa.is_aligned::<Size2M>() && remain >= Size2M::SIZE {
                self.map_one_2m(va, pa, leaf)?;
                off += Size2M::SIZE;
            } else {
                self.map_one_4k(va, pa, leaf)?;
                off += Size4K::SIZE;
            }
        }
        Ok(())
    }

    /// Resolve the PDE covering `va`, without allocating anything. Returns
    /// `None` if any level above it (PML4/PDPT/PD) is absent.
    fn find_pde(&self, va: VirtualAddress) -> Option<(L3Index, L2Index, PdEntry)> {
        let i4 = L4Index::from_va(va);
        let pml4 = self.pml4_mut_const();
        let pdpt_page = pml4.get(i4).next_table()?;
        let pdpt: &PageDirectoryPointerTable = self.table_ref(pdpt_page);
        let i3 = L3Index::from_va(va);
        match pdpt.get(i3).kind()? {
            PdptEntryKind::Leaf1GiB(..) => None,
            PdptEntryKind::NextPageDirectory(pd_page, _) => {
                let pd: &PageDirectory = self.table_ref(pd_page);
                let i2 = L2Index::from_va(va);
                Some((i3, i2, pd.get(i2)))
            }
        }
    }

    fn table_ref<T>(&self, page: PhysicalPage<Size4K>) -> &T {
        unsafe { &*PageTables::frame_ptr::<T>(page, self.slide) }
    }

    fn pml4_mut_const(&self) -> &PageMapLevel4 {
        self.table_ref(self.root)
    }

    /// Unmap exactly `[remove_start, remove_end)`, a sub-range of the 2 MiB
    /// window `[window_start, window_start + 2 MiB)`. Handles full-cover,
    /// bordering (cut), and interior (split) cases against a large leaf, and
    /// plain 4 KiB-stepped clearing against a small (PT-backed) window.
    fn unmap_window(&mut self, window_start: VirtualAddress, remove_start: VirtualAddress, remove_end: VirtualAddress) -> VmResult<()> {
        if remove_start >= remove_end {
            return Ok(());
        }
        let Some((i3, i2, pde)) = self.find_pde(window_start) else {
            return Ok(()); // nothing mapped in this window
        };
        match pde.kind() {
            None => Ok(()),
            Some(PdEntryKind::Leaf2MiB(base, leaf)) => {
                let window_end = window_start + Size2M::SIZE;
                if remove_start == window_start && remove_end == window_end {
                    let (_, pd) = self.ensure_pd_existing(window_start, i3)?;
                    pd.set(i2, PdEntry::zero());
                    invlpg(window_start);
                    trace!("unmapped 2 MiB page at VA={window_start}");
                    return Ok(());
                }
                // Bordering or interior: demote to a freshly allocated PT
                // covering the whole window, preserving the retained 4 KiB
                // sub-pages with the original leaf's flags.
                let leaf_bits = EntryBits::from(leaf);
                let new_pt = self.alloc_table_frame()?;
                {
                    let pt: &mut PageTable = self.table_mut(new_pt);
                    *pt = PageTable::zeroed();
                    for i in 0..512u64 {
                        let sub_va = window_start + i * Size4K::SIZE;
                        if sub_va >= remove_start && sub_va < remove_end {
                            continue;
                        }
                        let sub_pa = base.join(i * Size4K::SIZE);
                        let page = PhysicalPage::<Size4K>::from_base_unchecked(sub_pa);
                        pt.set(L1Index::from_va(sub_va), PtEntry4k::make(leaf_bits, page));
                    }
                }
                let (_, pd) = self.ensure_pd_existing(window_start, i3)?;
                pd.set(i2, PdEntry::make_next(self.middle_flags, new_pt));
                invlpg(window_start);
                trace!("demoted 2 MiB page at VA={window_start} to a page table for a partial unmap");
                Ok(())
            }
            Some(PdEntryKind::NextPageTable(pt_page, _)) => {
                let pt: &mut PageTable = self.table_mut(pt_page);
                let mut off = remove_start;
                while off < remove_end {
                    let i1 = L1Index::from_va(off);
                    if pt.get(i1).present() {
                        pt.set(i1, PtEntry4k::zero());
                        invlpg(off);
                    }
                    off += Size4K::SIZE;
                }
                Ok(())
            }
        }
    }

    /// Re-fetch the PD for `i3` after a possible intermediate allocation
    /// invalidated the earlier `&mut` borrow. `i3`'s PDPT entry is known
    /// present (we just walked through it), so this cannot fail.
    fn ensure_pd_existing(&mut self, va: VirtualAddress, i3: L3Index) -> VmResult<(L2Index, &mut PageDirectory)> {
        let i4 = L4Index::from_va(va);
        let pdpt_page = self.pml4_mut().get(i4).next_table().expect("pdpt present");
        let pdpt: &mut PageDirectoryPointerTable = self.table_mut(pdpt_page);
        let pd_page = match pdpt.get(i3).kind() {
            Some(PdptEntryKind::NextPageDirectory(p, _)) => p,
            _ => unreachable!("pd present by construction"),
        };
        Ok((L2Index::from_va(va), self.table_mut(pd_page)))
    }

    pub(crate) fn unmap_locked(&mut self, range: VirtualRange) -> VmResult<()> {
        let mut cur = range.front.align_down::<Size2M>();
        while cur < range.back {
            let window_end = cur + Size2M::SIZE;
            let remove_start = core::cmp::max(cur, range.front);
            let remove_end = core::cmp::min(window_end, range.back);
            self.unmap_window(cur, remove_start, remove_end)?;
            cur = window_end;
        }
        Ok(())
    }

    fn walk_locked(&self, va: VirtualAddress) -> PageWalk {
        let i4 = L4Index::from_va(va);
        let pml4 = self.pml4_mut_const();
        let l4_entry = pml4.get(i4);
        let Some(pdpt_page) = l4_entry.next_table() else {
            let mut w = PageWalk::missing(va);
            w.l4_entry = Some(l4_entry);
            return w;
        };
        let pdpt: &PageDirectoryPointerTable = self.table_ref(pdpt_page);
        let i3 = L3Index::from_va(va);
        let l3_raw = pdpt.get(i3);
        let l3_kind = l3_raw.kind();
        let (pd_page, l2_kind) = match l3_kind {
            Some(PdptEntryKind::Leaf1GiB(..)) => {
                return PageWalk {
                    l4_index: i4,
                    l3_index: i3,
                    l2_index: L2Index::from_va(va),
                    l1_index: L1Index::from_va(va),
                    l4_entry: Some(l4_entry),
                    l3_entry: l3_kind,
                    l2_entry: None,
                    l1_entry: None,
                };
            }
            Some(PdptEntryKind::NextPageDirectory(p, _)) => {
                let pd: &PageDirectory = self.table_ref(p);
                let i2 = L2Index::from_va(va);
                (p, pd.get(i2).kind())
            }
            None => {
                return PageWalk {
                    l4_index: i4,
                    l3_index: i3,
                    l2_index: L2Index::from_va(va),
                    l1_index: L1Index::from_va(va),
                    l4_entry: Some(l4_entry),
                    l3_entry: None,
                    l2_entry: None,
                    l1_entry: None,
                };
            }
        };
        let i2 = L2Index::from_va(va);
        match l2_kind {
            Some(PdEntryKind::Leaf2MiB(..)) => PageWalk {
                l4_index: i4,
                l3_index: i3,
                l2_index: i2,
                l1_index: L1Index::from_va(va),
                l4_entry: Some(l4_entry),
                l3_entry: l3_kind,
                l2_entry: l2_kind,
                l1_entry: None,
            },
            Some(PdEntryKind::NextPageTable(pt_page, _)) => {
                let pt: &PageTable = self.table_ref(pt_page);
                let i1 = L1Index::from_va(va);
                PageWalk {
                    l4_index: i4,
                    l3_index: i3,
                    l2_index: i2,
                    l1_index: i1,
                    l4_entry: Some(l4_entry),
                    l3_entry: l3_kind,
                    l2_entry: l2_kind,
                    l1_entry: Some(pt.get(i1)),
                }
            }
            None => {
                let _ = pd_page;
                PageWalk {
                    l4_index: i4,
                    l3_index: i3,
                    l2_index: i2,
                    l1_index: L1Index::from_va(va),
                    l4_entry: Some(l4_entry),
                    l3_entry: l3_kind,
                    l2_entry: None,
                    l1_entry: None,
                }
            }
        }
    }

    fn compact_locked(&mut self) -> usize {
        let mut reclaimed = 0usize;
        for i4 in 0..512u16 {
            let i4 = L4Index::new(i4);
            let Some(pdpt_page) = self.pml4_mut().get(i4).next_table() else { continue };
            let mut pdpt_has_children = false;
            for i3 in 0..512u16 {
                let i3 = L3Index::new(i3);
                let pdpt: &mut PageDirectoryPointerTable = self.table_mut(pdpt_page);
                match pdpt.get(i3).kind() {
                    Some(PdptEntryKind::Leaf1GiB(..)) => pdpt_has_children = true,
                    Some(PdptEntryKind::NextPageDirectory(pd_page, _)) => {
                        let mut pd_has_children = false;
                        for i2 in 0..512u16 {
                            let i2 = L2Index::new(i2);
                            let pd: &mut PageDirectory = self.table_mut(pd_page);
                            match pd.get(i2).kind() {
                                Some(PdEntryKind::Leaf2MiB(..)) => pd_has_children = true,
                                Some(PdEntryKind::NextPageTable(pt_page, _)) => {
                                    let pt: &PageTable = self.table_ref(pt_page);
                                    if pt.is_empty() {
                                        pd.set(i2, PdEntry::zero());
                                        self.pta.deallocate(pt_page, 1, self.slide);
                                        reclaimed += 1;
                                    } else {
                                        pd_has_children = true;
                                    }
                                }
                                None => {}
                            }
                        }
                        if pd_has_children {
                            pdpt_has_children = true;
                        } else {
                            let pdpt: &mut PageDirectoryPointerTable = self.table_mut(pdpt_page);
                            pdpt.set(i3, PdptEntry::zero());
                            self.pta.deallocate(pd_page, 1, self.slide);
                            reclaimed += 1;
                        }
                    }
                    None => {}
                }
            }
            if !pdpt_has_children {
                self.pml4_mut().set(i4, Pml4Entry::zero());
                self.pta.deallocate(pdpt_page, 1, self.slide);
                reclaimed += 1;
            }
        }
        trace!("compacted {reclaimed} empty page-table frame(s)");
        reclaimed
    }

    pub(crate) fn reserve_for_mapping(&mut self, range: VirtualRange) -> VmResult<PageTableList> {
        let mut list = PageTableList::new();
        // Worst case: a fresh PDPT child, PD child, and PT child per 2 MiB
        // window the range touches, plus headroom for a demote allocation.
        let windows = range.size().div_ceil(Size2M::SIZE).max(1);
        let count = windows.saturating_mul(3) + 1;
        if !self.pta.allocate_list(count, &mut list) {
            return Err(Status::OutOfMemory);
        }
        Ok(list)
    }

    pub(crate) fn reserve_for_unmapping(&mut self, range: VirtualRange) -> VmResult<PageTableList> {
        let mut list = PageTableList::new();
        let windows = range.size().div_ceil(Size2M::SIZE).max(1);
        // Up to one demotion (new PT) per boundary window, times two boundaries.
        let count = (windows.min(2)).max(1);
        if !self.pta.allocate_list(count, &mut list) {
            return Err(Status::OutOfMemory);
        }
        Ok(list)
    }

    pub(crate) fn return_list(&mut self, mut list: PageTableList) {
        self.pta.deallocate_list(&mut list);
    }
}

trait ZeroWrite {
    fn write_zeroed(&mut self);
}

impl ZeroWrite for PageDirectoryPointerTable {
    fn write_zeroed(&mut self) {
        *self = Self::zeroed();
    }
}

impl ZeroWrite for PageDirectory {
    fn write_zeroed(&mut self) {
        *self = Self::zeroed();
    }
}

impl ZeroWrite for PageTable {
    fn write_zeroed(&mut self) {
        *self = Self::zeroed();
    }
}

/// Invalidate the TLB entry for a single page on the executing core.
/// Cross-core shootdowns are the caller's responsibility (out of core scope).
#[inline]
fn invlpg(_va: VirtualAddress) {
    #[cfg(target_arch = "x86_64")]
    unsafe {
        core::arch::asm!("invlpg [{}]", in(reg) _va.as_u64(), options(nostack, preserves_flags));
    }
}

#[cfg(test)]
mod tests {
    use vmcore_addr::{PatLayout, PhysicalRange, Range};

    use super::*;

    fn make_pt() -> (alloc::vec::Vec<u8>, PageTables) {
        const FRAMES: u64 = 256;
        let mut buf = alloc::vec![0u8; (FRAMES * 4096) as usize];
        let base = buf.as_mut_ptr() as u64;
        let arena = AddressMapping::new(VirtualAddress::new(base), PhysicalAddress::new(base), FRAMES * 4096);
        let builder = PageBuilder::new(40, 48, VirtualAddress::ZERO, PatLayout::default());
        let pt = unsafe { PageTables::create(builder, arena, EntryBits::permissive_middle()).unwrap() };
        (buf, pt)
    }

    #[test]
    fn map_walk_unmap_round_trip() {
        let (_buf, pt) = make_pt();
        let va = VirtualAddress::new(0xffff_8000_0000_0000);
        let mapping = AddressMapping::new(va, PhysicalAddress::new(0x1000), 4096);
        pt.map(mapping, PageFlags::DATA, MemoryType::WriteBack).unwrap();
        assert_eq!(pt.get_backing_address(va), PhysicalAddress::new(0x1000));
        assert_eq!(pt.get_page_size(va), PageSizeKind::Size4K);
        pt.unmap(mapping.virtual_range()).unwrap();
        assert!(pt.get_memory_flags(va).is_none());
        assert!(!pt.walk(va).is_mapped());
    }

    #[test]
    fn large_page_partial_unmap_demotes_to_4k() {
        // spec.md's "Large-page partial unmap" scenario: an 8x2MiB mapping,
        // with a 4 KiB hole punched one page into the first 2 MiB window.
        let (_buf, pt) = make_pt();
        let v = VirtualAddress::new(0xffff_8000_0000_0000);
        let mapping = AddressMapping::new(v, PhysicalAddress::new(0x100_0000), 8 * Size2M::SIZE);
        pt.map(mapping, PageFlags::ALL, MemoryType::WriteBack).unwrap();
        assert_eq!(pt.get_page_size(v), PageSizeKind::Size2M);

        let hole = Range::new(v + Size4K::SIZE, v + 2 * Size4K::SIZE);
        pt.unmap(hole).unwrap();

        assert_eq!(pt.get_page_size(v), PageSizeKind::Size4K);
        assert!(pt.get_memory_flags(v + Size4K::SIZE).is_none());
        assert_eq!(pt.get_backing_address(v + 2 * Size4K::SIZE), PhysicalAddress::new(0x100_0000 + 2 * Size4K::SIZE));
        // The retained head page keeps its original backing and flags.
        assert_eq!(pt.get_backing_address(v), PhysicalAddress::new(0x100_0000));
        assert!(!pt.get_memory_flags(v).is_none());
    }

    #[test]
    fn full_cover_unmap_of_a_2mib_leaf_clears_it_without_demotion() {
        let (_buf, pt) = make_pt();
        let v = VirtualAddress::new(0xffff_8000_0000_0000);
        let mapping = AddressMapping::new(v, PhysicalAddress::new(0x200_0000), Size2M::SIZE);
        pt.map(mapping, PageFlags::DATA, MemoryType::WriteBack).unwrap();
        pt.unmap2m(mapping.virtual_range()).unwrap();
        assert!(!pt.walk(v).is_mapped());
    }

    #[test]
    fn compact_reclaims_page_tables_left_empty_by_unmap() {
        let (_buf, pt) = make_pt();
        let v = VirtualAddress::new(0xffff_8000_1000_0000);
        let mapping = AddressMapping::new(v, PhysicalAddress::new(0x300_0000), 4096);
        pt.map(mapping, PageFlags::DATA, MemoryType::WriteBack).unwrap();
        pt.unmap(mapping.virtual_range()).unwrap();
        assert!(pt.compact() > 0);
        assert_eq!(pt.compact(), 0);
    }

    #[test]
    fn clone_higher_half_shares_kernel_mappings_with_a_fresh_address_space() {
        let (_kbuf, kernel) = make_pt();
        let kernel_va = VirtualAddress::new(0xffff_8000_0000_0000);
        kernel.map(AddressMapping::new(kernel_va, PhysicalAddress::new(0x400_0000), 4096), PageFlags::DATA, MemoryType::WriteBack).unwrap();

        let (_ubuf, user) = make_pt();
        user.clone_higher_half_from(&kernel, L4Index::from_va(kernel_va));
        assert_eq!(user.get_backing_address(kernel_va), PhysicalAddress::new(0x400_0000));
    }

    #[test]
    fn mapping_non_canonical_or_zero_flags_is_rejected() {
        let (_buf, pt) = make_pt();
        let mapping = AddressMapping::new(VirtualAddress::new(0x1000_0000), PhysicalAddress::new(0x1000), 4096);
        assert_eq!(pt.map(mapping, PageFlags::empty(), MemoryType::WriteBack).unwrap_err(), Status::InvalidInput);
    }
}
