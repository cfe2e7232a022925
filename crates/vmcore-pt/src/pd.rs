//! x86-64 Page Directory (PD / L2): non-leaf pointer to a PT, or a 2 MiB leaf.

use bitfield_struct::bitfield;
use vmcore_addr::{PhysicalAddress, PhysicalPage, Size2M, Size4K, VirtualAddress};

use crate::bits::EntryBits;

const PRESENT_BIT: u64 = 1;
const PS_BIT: u64 = 1 << 7;

/// Index into a [`PageDirectory`], from virtual-address bits `[29:21]`.
#[repr(transparent)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct L2Index(u16);

impl L2Index {
    #[inline]
    #[must_use]
    pub const fn from_va(va: VirtualAddress) -> Self {
        Self::new(va.pd_index())
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
pub struct Pde {
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
pub struct Pde2M {
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
    #[bits(8)]
    __res_13_20: u8,
    #[bits(31)]
    phys_addr_51_21: u32,
    #[bits(7)]
    pub os_available_high: u8,
    #[bits(4)]
    pub protection_key: u8,
    pub no_execute: bool,
}

impl Pde {
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

impl Pde2M {
    #[inline]
    #[must_use]
    #[allow(clippy::cast_possible_truncation)]
    pub const fn physical_page(self) -> PhysicalPage<Size2M> {
        PhysicalPage::from_base_unchecked(PhysicalAddress::new((self.phys_addr_51_21() as u64) << 21))
    }

    #[inline]
    #[must_use]
    #[allow(clippy::cast_possible_truncation)]
    pub const fn set_physical_page(mut self, page: PhysicalPage<Size2M>) -> Self {
        self.set_phys_addr_51_21((page.base().as_u64() >> 21) as u32);
        self
    }
}

/// Decoded view of a PD entry: a pointer to the next-level PT, or (if the PS
/// bit is set) a 2 MiB leaf.
#[derive(Clone, Copy)]
pub enum PdEntryKind {
    NextPageTable(PhysicalPage<Size4K>, Pde),
    Leaf2MiB(PhysicalPage<Size2M>, Pde2M),
}

/// Raw storage for one PD slot, disambiguated by the PS bit (bit 7).
#[derive(Clone, Copy)]
#[repr(transparent)]
pub struct PdEntry(u64);

impl PdEntry {
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
    pub const fn kind(self) -> Option<PdEntryKind> {
        if !self.present() {
            return None;
        }
        if self.is_large() {
            let e = Pde2M::from_bits(self.0);
            Some(PdEntryKind::Leaf2MiB(e.physical_page(), e))
        } else {
            let e = Pde::from_bits(self.0);
            Some(PdEntryKind::NextPageTable(e.physical_page(), e))
        }
    }

    #[inline]
    #[must_use]
    pub const fn make_next(bits: EntryBits, next: PhysicalPage<Size4K>) -> Self {
        Self(bits.to_pde().set_physical_page(next).into_bits())
    }

    #[inline]
    #[must_use]
    pub const fn make_2m(bits: EntryBits, page: PhysicalPage<Size2M>) -> Self {
        Self(bits.to_pde_2m().set_physical_page(page).into_bits())
    }
}

/// The Page Directory (L2) table: 512 entries, 4 KiB-aligned.
#[repr(C, align(4096))]
pub struct PageDirectory {
    entries: [PdEntry; 512],
}

impl PageDirectory {
    #[inline]
    #[must_use]
    pub const fn zeroed() -> Self {
        Self { entries: [PdEntry::zero(); 512] }
    }

    #[inline]
    #[must_use]
    pub const fn get(&self, i: L2Index) -> PdEntry {
        self.entries[i.as_usize()]
    }

    #[inline]
    pub const fn set(&mut self, i: L2Index, e: PdEntry) {
        self.entries[i.as_usize()] = e;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn next_pt_vs_2m_leaf() {
        let pt = PhysicalPage::<Size4K>::from_base_unchecked(PhysicalAddress::new(0x3000));
        let e = PdEntry::make_next(EntryBits { present: true, ..EntryBits::default() }, pt);
        match e.kind().unwrap() {
            PdEntryKind::NextPageTable(p, _) => assert_eq!(p.base().as_u64(), 0x3000),
            PdEntryKind::Leaf2MiB(..) => panic!("expected next PT"),
        }

        let huge = PhysicalPage::<Size2M>::from_base_unchecked(PhysicalAddress::new(0x0020_0000));
        let e2m = PdEntry::make_2m(EntryBits { present: true, ..EntryBits::default() }, huge);
        match e2m.kind().unwrap() {
            PdEntryKind::Leaf2MiB(p, _) => assert_eq!(p.base().as_u64(), 0x0020_0000),
            PdEntryKind::NextPageTable(..) => panic!("expected 2MiB leaf"),
        }
    }
}
