//! [`AddressSegment`]: one entry of an address space's segment map.

use vmcore_addr::{MemoryType, PageFlags, PhysicalRange, VirtualRange};
use vmcore_pfh::Allocation;

/// A virtual range mapped to a physical range, with the permissions/cache
/// type installed in the owning [`crate::AddressSpaceManager`]'s page
/// tables and (for an owned segment) the physical allocation backing it.
#[derive(Debug, Clone, Copy)]
pub struct AddressSegment {
    pub vrange: VirtualRange,
    pub prange: PhysicalRange,
    /// `Some` when this segment's manager is responsible for releasing the
    /// backing allocation to the shared Physical Frame Heap on unmap.
    /// `None` for a segment created by the cross-manager shared-mapping
    /// overload of `map`, which borrows another manager's allocation and
    /// must never call `free`/`split`/`splitv` on it.
    pub(crate) allocation: Option<Allocation>,
    pub flags: PageFlags,
    pub memory_type: MemoryType,
}

impl AddressSegment {
    /// `true` if this manager owns the physical backing and must release
    /// it on unmap; `false` for a shared/borrowed mapping.
    #[must_use]
    pub const fn is_owned(&self) -> bool {
        self.allocation.is_some()
    }
}
