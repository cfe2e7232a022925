use crate::physical_address::PhysicalAddress;
use crate::range::Range;
use crate::virtual_address::VirtualAddress;

pub type PhysicalRange = Range<PhysicalAddress>;
pub type VirtualRange = Range<VirtualAddress>;

/// A 1:1 linear mapping `(vaddr, paddr, size)`.
///
/// Invariant (enforced by [`AddressMapping::new`]): all three fields are
/// 4 KiB-aligned, `size > 0`, `vaddr` is canonical, and `paddr` fits the
/// configured physical-address width (checked by the caller's `PageBuilder`,
/// not here — this type has no width configuration of its own).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct AddressMapping {
    pub vaddr: VirtualAddress,
    pub paddr: PhysicalAddress,
    pub size: u64,
}

impl AddressMapping {
    #[must_use]
    pub const fn new(vaddr: VirtualAddress, paddr: PhysicalAddress, size: u64) -> Self {
        Self { vaddr, paddr, size }
    }

    #[must_use]
    pub fn virtual_range(self) -> VirtualRange {
        Range::new(self.vaddr, self.vaddr + self.size)
    }

    #[must_use]
    pub fn physical_range(self) -> PhysicalRange {
        Range::new(self.paddr, self.paddr + self.size)
    }

    /// `true` when every field satisfies the invariant in the type's doc
    /// comment, given a 4 KiB alignment granularity.
    #[must_use]
    pub fn is_well_formed(self) -> bool {
        const ALIGN: u64 = 4096;
        self.size > 0
            && self.vaddr.as_u64() % ALIGN == 0
            && self.paddr.as_u64() % ALIGN == 0
            && self.size % ALIGN == 0
            && self.vaddr.is_canonical()
    }
}
