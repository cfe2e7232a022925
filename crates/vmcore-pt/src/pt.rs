//! x86-64 Page Table (PT / L1): the lowest level, always 4 KiB leaves.

use bitfield_struct::bitfield;
use vmcore_addr::{PhysicalAddress, PhysicalPage, Size4K, VirtualAddress};

use crate::bits::EntryBits;

/// Index into a [`PageTable`], from virtual-address bits `[20:12]`.
#[repr(transparent)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct L1Index(u16);

impl L1Index {
    #[inline]
    #[must_use]
    pub const fn from_va(va: VirtualAddress) -> Self {
        Self::new(va.pt_index())
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

#[bitfield(u64)]
pub struct PtEntry4k {
    pub present: bool,
    pub writable: bool,
    pub user: bool,
    pub write_through: bool,
    pub cache_disable: bool,
    pub accessed: bool,
    pub dirty: bool,
    pub pat_small: bool,
    pub global: bool,
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

impl PtEntry4k {
    #[inline]
    #[must_use]
    pub const fn zero() -> Self {
        Self::new()
    }

    #[inline]
    #[must_use]
    pub const fn physical_page(self) -> PhysicalPage<Size4K> {
        PhysicalPage::from_base_unchecked(PhysicalAddress::new(self.phys_addr_51_12() << 12))
    }

    #[inline]
    #[must_use]
    pub const fn set_physical_page(mut self, page: PhysicalPage<Size4K>) -> Self {
        self.set_phys_addr_51_12(page.base().as_u64() >> 12);
        self
    }

    #[inline]
    #[must_use]
    pub const fn make(bits: EntryBits, page: PhysicalPage<Size4K>) -> Self {
        bits.to_pte_4k().set_physical_page(page)
    }
}

/// The Page Table (L1) table: 512 entries, 4 KiB-aligned.
#[repr(C, align(4096))]
pub struct PageTable {
    entries: [PtEntry4k; 512],
}

impl PageTable {
    #[inline]
    #[must_use]
    pub const fn zeroed() -> Self {
        Self { entries: [PtEntry4k::zero(); 512] }
    }

    #[inline]
    #[must_use]
    pub const fn get(&self, i: L1Index) -> PtEntry4k {
        self.entries[i.as_usize()]
    }

    #[inline]
    pub const fn set(&mut self, i: L1Index, e: PtEntry4k) {
        self.entries[i.as_usize()] = e;
    }

    /// `true` if no entry in this table is present — used by `compact` to
    /// decide whether the table itself can be reclaimed.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entries.iter().all(|e| !e.present())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn make_sets_physical_page_and_flags() {
        let page = PhysicalPage::<Size4K>::from_base_unchecked(PhysicalAddress::new(0x4000));
        let e = PtEntry4k::make(EntryBits { present: true, writable: true, ..EntryBits::default() }, page);
        assert!(e.present());
        assert!(e.writable());
        assert_eq!(e.physical_page().base().as_u64(), 0x4000);
    }

    #[test]
    fn fresh_table_is_empty() {
        assert!(PageTable::zeroed().is_empty());
    }
}
