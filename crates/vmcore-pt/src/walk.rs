//! [`PageWalk`]: the indices and encountered entries of one virtual-address
//! resolution, per `spec.md §4.3`'s `walk(addr)` operation.

use vmcore_addr::{PageFlags, PageSize as _, PageSizeKind, PhysicalAddress, Size1G, Size2M, Size4K, VirtualAddress};

use crate::bits::EntryBits;
use crate::pd::{L2Index, PdEntryKind};
use crate::pdpt::{L3Index, PdptEntryKind};
use crate::pml4::{L4Index, Pml4Entry};
use crate::pt::{L1Index, PtEntry4k};

/// All four indices derived from a virtual address, plus whichever entries
/// were actually encountered while walking down to them. Callers infer
/// "mapped", "size", and "backing address" from the final resolved level
/// rather than this type branching on their behalf.
#[derive(Clone, Copy)]
pub struct PageWalk {
    pub l4_index: L4Index,
    pub l3_index: L3Index,
    pub l2_index: L2Index,
    pub l1_index: L1Index,
    pub l4_entry: Option<Pml4Entry>,
    pub l3_entry: Option<PdptEntryKind>,
    pub l2_entry: Option<PdEntryKind>,
    pub l1_entry: Option<PtEntry4k>,
}

impl PageWalk {
    #[must_use]
    pub(crate) const fn missing(va: VirtualAddress) -> Self {
        Self {
            l4_index: L4Index::from_va(va),
            l3_index: L3Index::from_va(va),
            l2_index: L2Index::from_va(va),
            l1_index: L1Index::from_va(va),
            l4_entry: None,
            l3_entry: None,
            l2_entry: None,
            l1_entry: None,
        }
    }

    /// `true` when the walk terminated at a present leaf entry of any size.
    #[must_use]
    pub fn is_mapped(&self) -> bool {
        match (self.l3_entry, self.l2_entry, self.l1_entry) {
            (Some(PdptEntryKind::Leaf1GiB(..)), _, _) => true,
            (_, Some(PdEntryKind::Leaf2MiB(..)), _) => true,
            (_, _, Some(pte)) => pte.present(),
            _ => false,
        }
    }

    /// The page size the walk terminated at, or `None` if unmapped.
    #[must_use]
    pub fn page_size(&self) -> PageSizeKind {
        if !self.is_mapped() {
            return PageSizeKind::None;
        }
        match self.l3_entry {
            Some(PdptEntryKind::Leaf1GiB(..)) => return PageSizeKind::Size1G,
            _ => {}
        }
        match self.l2_entry {
            Some(PdEntryKind::Leaf2MiB(..)) => return PageSizeKind::Size2M,
            _ => {}
        }
        PageSizeKind::Size4K
    }

    /// Physical address backing `va`, or [`PhysicalAddress::INVALID`] if unmapped.
    #[must_use]
    pub fn backing_address(&self, va: VirtualAddress) -> PhysicalAddress {
        if let Some(PdptEntryKind::Leaf1GiB(base, _)) = self.l3_entry {
            return base.join(va.as_u64() & (Size1G::SIZE - 1));
        }
        if let Some(PdEntryKind::Leaf2MiB(base, _)) = self.l2_entry {
            return base.join(va.as_u64() & (Size2M::SIZE - 1));
        }
        if let Some(pte) = self.l1_entry
            && pte.present()
        {
            return pte.physical_page().join(va.as_u64() & (Size4K::SIZE - 1));
        }
        PhysicalAddress::INVALID
    }

    /// Permission flags of the terminating leaf, or `PageFlags::empty()` if unmapped.
    #[must_use]
    pub fn flags(&self) -> PageFlags {
        if let Some(PdptEntryKind::Leaf1GiB(_, e)) = self.l3_entry {
            return EntryBits::from(e).to_page_flags();
        }
        if let Some(PdEntryKind::Leaf2MiB(_, e)) = self.l2_entry {
            return EntryBits::from(e).to_page_flags();
        }
        if let Some(pte) = self.l1_entry {
            return EntryBits::from(pte).to_page_flags();
        }
        PageFlags::empty()
    }
}
