//! x86-64 Page Map Level 4 (PML4): the root, non-leaf-only paging level.

use bitfield_struct::bitfield;
use vmcore_addr::{PhysicalPage, Size4K, VirtualAddress};

use crate::bits::EntryBits;

/// Index into a [`PageMapLevel4`], derived from virtual-address bits `[47:39]`.
#[repr(transparent)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct L4Index(u16);

impl L4Index {
    #[inline]
    #[must_use]
    pub const fn from_va(va: VirtualAddress) -> Self {
        Self::new(va.pml4_index())
    }

    #[inline]
    #[must_use]
    pub const fn new(v: u16) -> Self {
        debug_assert!(v < 512);
        Self(v)
    }

    #[inline]
    #[must_use]
    pub const fn as_usize(self) -> usize {
        self.0 as usize
    }
}

/// A PML4 entry: always non-leaf (`PS` must be 0 at this level).
#[bitfield(u64)]
pub struct Pml4Entry {
    pub present: bool,
    pub writable: bool,
    pub user: bool,
    pub write_through: bool,
    pub cache_disable: bool,
    pub accessed: bool,
    #[bits(1)]
    __d_ignored: u8,
    #[bits(1)]
    __ps_must_be_0: u8,
    #[bits(1)]
    __g_ignored: u8,
    #[bits(3)]
    pub os_available_low: u8,
    #[bits(40)]
    phys_addr_51_12: u64,
    #[bits(7)]
    pub os_available_high: u8,
    #[bits(4)]
    pub protection_key: u8,
    pub no_execute: bool,
}

impl Pml4Entry {
    #[inline]
    #[must_use]
    pub const fn zero() -> Self {
        Self::new()
    }

    #[inline]
    #[must_use]
    pub const fn next_table(self) -> Option<PhysicalPage<Size4K>> {
        if !self.present() {
            return None;
        }
        Some(self.physical_page())
    }

    #[inline]
    #[must_use]
    pub const fn physical_page(self) -> PhysicalPage<Size4K> {
        PhysicalPage::from_base_unchecked(vmcore_addr::PhysicalAddress::new(self.phys_addr_51_12() << 12))
    }

    #[inline]
    #[must_use]
    pub const fn set_physical_page(mut self, page: PhysicalPage<Size4K>) -> Self {
        self.set_phys_addr_51_12(page.base().as_u64() >> 12);
        self
    }

    /// Build a present non-leaf entry pointing at `next` with `bits` applied.
    #[inline]
    #[must_use]
    pub const fn make(bits: EntryBits, next: PhysicalPage<Size4K>) -> Self {
        bits.to_pml4e().set_physical_page(next)
    }
}

/// The root page map: 512 entries, 4 KiB aligned, one per [`PageMapLevel4`].
#[repr(C, align(4096))]
pub struct PageMapLevel4 {
    entries: [Pml4Entry; 512],
}

impl PageMapLevel4 {
    #[inline]
    #[must_use]
    pub const fn zeroed() -> Self {
        Self { entries: [Pml4Entry::zero(); 512] }
    }

    #[inline]
    #[must_use]
    pub const fn get(&self, i: L4Index) -> Pml4Entry {
        self.entries[i.as_usize()]
    }

    #[inline]
    pub const fn set(&mut self, i: L4Index, e: Pml4Entry) {
        self.entries[i.as_usize()] = e;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use vmcore_addr::PhysicalAddress;

    #[test]
    fn make_points_at_next_table() {
        let next = PhysicalPage::<Size4K>::from_base_unchecked(PhysicalAddress::new(0x9000));
        let e = Pml4Entry::make(EntryBits { present: true, writable: true, ..EntryBits::default() }, next);
        assert!(e.present());
        assert_eq!(e.next_table().unwrap().base().as_u64(), 0x9000);
    }
}
