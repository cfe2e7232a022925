//! Firmware-discovered configuration handed to [`crate::PageTables::create`].

use vmcore_addr::{PatLayout, PhysicalAddress, VirtualAddress};

/// Inputs a boot sequence derives from CPUID/the PAT MSR and the bootloader's
/// higher-half direct-map convention, per `spec.md §6`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PageBuilder {
    /// Implemented physical-address width, in bits (typically 40 or 48).
    pub physical_width: u8,
    /// Implemented virtual-address width, in bits (48 for 4-level paging).
    pub virtual_width: u8,
    /// Base of the higher-half direct map (HHDM) the bootloader establishes.
    pub higher_half_direct_map: VirtualAddress,
    /// PAT slot assignment read from the PAT MSR (or the firmware default).
    pub pat: PatLayout,
}

impl PageBuilder {
    #[must_use]
    pub const fn new(
        physical_width: u8,
        virtual_width: u8,
        higher_half_direct_map: VirtualAddress,
        pat: PatLayout,
    ) -> Self {
        Self { physical_width, virtual_width, higher_half_direct_map, pat }
    }

    /// The highest physical address representable with `physical_width` bits.
    #[must_use]
    pub const fn max_physical_address(self) -> PhysicalAddress {
        if self.physical_width >= 64 {
            PhysicalAddress::new(u64::MAX)
        } else {
            PhysicalAddress::new((1u64 << self.physical_width) - 1)
        }
    }

    #[must_use]
    pub const fn is_in_range(self, addr: PhysicalAddress) -> bool {
        addr.as_u64() <= self.max_physical_address().as_u64()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn forty_bit_width_caps_physical_addresses() {
        let b = PageBuilder::new(40, 48, VirtualAddress::ZERO, PatLayout::default());
        assert!(b.is_in_range(PhysicalAddress::new((1u64 << 40) - 1)));
        assert!(!b.is_in_range(PhysicalAddress::new(1u64 << 40)));
    }
}
