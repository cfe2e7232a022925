//! x86-64 Page Directory Pointer Table (PDPT / L3): non-leaf pointer to a PD,
//! or (optionally, per the open question in `spec.md §9`) a 1 GiB leaf.

use bitfield_struct::bitfield;
use vmcore_addr::{PhysicalAddress, PhysicalPage, Size1G, Size4K, VirtualAddress};

use crate::bits::EntryBits;

const PRESENT_BIT: u64 = 1;
const PS_BIT: u64 = 1 << 7;

/// Index into a [`PageDirectoryPointerTable`], from virtual-address bits `[38:30]`.
#[repr(transparent)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct L3Index(u16);

impl L3Index {
    #[inline]
    #[must_use]
    pub const fn from_va(va: VirtualAddress) -> Self {
        Self::new(va.pdpt_index())
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
pub struct Pdpte {
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

#[bitfield(u64)]
pub struct Pdpte1G {
    pub present: bool,
    pub writable: bool,
    pub user: bool,
    pub write_through: bool,
    pub cache_disable: bool,
    pub accessed: bool,
    pub dirty: bool,
    #[bits(default = true)]
    pub page_size: bool,
    pub global: bool,
    #[bits(3)]
    pub os_available_low: u8,
    pub pat_large: bool,
    #[bits(17)]
    __res_13_29: u32,
    #[bits(22)]
    phys_addr_51_30: u32,
    #[bits(7)]
    pub os_available_high: u8,
    #[bits(4)]
    pub protection_key: u8,
    pub no_execute: bool,
}

impl Pdpte {
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
}

impl Pdpte1G {
    #[inline]
    #[must_use]
    #[allow(clippy::cast_possible_truncation)]
    pub const fn physical_page(self) -> PhysicalPage<Size1G> {
        PhysicalPage::from_base_unchecked(PhysicalAddress::new((self.phys_addr_51_30() as u64) << 30))
    }

    #[inline]
    #[must_use]
    #[allow(clippy::cast_possible_truncation)]
    pub const fn set_physical_page(mut self, page: PhysicalPage<Size1G>) -> Self {
        self.set_phys_addr_51_30((page.base().as_u64() >> 30) as u32);
        self
    }
}

/// Decoded view of a PDPT entry: a pointer to the next-level PD, or (if the
/// PS bit is set) a 1 GiB leaf.
#[derive(Clone, Copy)]
pub enum PdptEntryKind {
    NextPageDirectory(PhysicalPage<Size4K>, Pdpte),
    Leaf1GiB(PhysicalPage<Size1G>, Pdpte1G),
}

/// Raw storage for one PDPT slot, overlaying the non-leaf and 1 GiB-leaf
/// forms on the same 64 bits; the PS bit (bit 7) disambiguates which is live.
#[derive(Clone, Copy)]
#[repr(transparent)]
pub struct PdptEntry(u64);

impl PdptEntry {
    #[inline]
    #[must_use]
    pub const fn zero() -> Self {
        Self(0)
    }

    #[inline]
    #[must_use]
    pub const fn present(self) -> bool {
        self.0 & PRESENT_BIT != 0
    }

    #[inline]
    #[must_use]
    pub const fn is_large(self) -> bool {
        self.0 & PS_BIT != 0
    }

    #[inline]
    #[must_use]
    pub const fn kind(self) -> Option<PdptEntryKind> {
        if !self.present() {
            return None;
        }
        if self.is_large() {
            let e = Pdpte1G::from_bits(self.0);
            Some(PdptEntryKind::Leaf1GiB(e.physical_page(), e))
        } else {
            let e = Pdpte::from_bits(self.0);
            Some(PdptEntryKind::NextPageDirectory(e.physical_page(), e))
        }
    }

    #[inline]
    #[must_use]
    pub const fn make_next(bits: EntryBits, next: PhysicalPage<Size4K>) -> Self {
        Self(bits.to_pdpte().set_physical_page(next).into_bits())
    }

    #[inline]
    #[must_use]
    pub const fn make_1g(bits: EntryBits, page: PhysicalPage<Size1G>) -> Self {
        Self(bits.to_pdpte_1g().set_physical_page(page).into_bits())
    }
}

/// The PDPT (L3) table: 512 entries, 4 KiB-aligned.
#[repr(C, align(4096))]
pub struct PageDirectoryPointerTable {
    entries: [PdptEntry; 512],
}

impl PageDirectoryPointerTable {
    #[inline]
    #[must_use]
    pub const fn zeroed() -> Self {
        Self { entries: [PdptEntry::zero(); 512] }
    }

    #[inline]
    #[must_use]
    pub const fn get(&self, i: L3Index) -> PdptEntry {
        self.entries[i.as_usize()]
    }

    #[inline]
    pub const fn set(&mut self, i: L3Index, e: PdptEntry) {
        self.entries[i.as_usize()] = e;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn next_pd_vs_1g_leaf() {
        let pd = PhysicalPage::<Size4K>::from_base_unchecked(PhysicalAddress::new(0x2000_0000));
        let e = PdptEntry::make_next(EntryBits { present: true, ..EntryBits::default() }, pd);
        match e.kind().unwrap() {
            PdptEntryKind::NextPageDirectory(p, _) => assert_eq!(p.base().as_u64(), 0x2000_0000),
            PdptEntryKind::Leaf1GiB(..) => panic!("expected next PD"),
        }

        let g1 = PhysicalPage::<Size1G>::from_base_unchecked(PhysicalAddress::new(0x8000_0000));
        let e1g = PdptEntry::make_1g(EntryBits { present: true, ..EntryBits::default() }, g1);
        match e1g.kind().unwrap() {
            PdptEntryKind::Leaf1GiB(p, _) => assert_eq!(p.base().as_u64(), 0x8000_0000),
            PdptEntryKind::NextPageDirectory(..) => panic!("expected 1GiB leaf"),
        }
    }
}
