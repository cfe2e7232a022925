//! `verify_user_range`: the syscall-boundary check for a user-supplied
//! `(address, size)` pair, per `spec.md §6`.

use vmcore_addr::{PageFlags, PageSize as _, Size4K, Status, VirtualAddress, VmResult};

use crate::page_tables::PageTables;

/// Constraints a syscall handler places on a user-supplied range, beyond
/// "canonical, lower-half, and backed with at least `required_flags`".
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct UserRangeRules {
    /// `address` must be a multiple of this, if set.
    pub alignment: Option<u64>,
    pub min_size: Option<u64>,
    pub max_size: Option<u64>,
    /// `size` must be a multiple of this, if set.
    pub size_multiple: Option<u64>,
    /// Every page in the range must carry at least these permissions.
    pub required_flags: PageFlags,
}

/// `Ok(())` only if `[address, address + size)` is canonical, entirely in
/// the lower half, satisfies every rule in `rules`, and every page it spans
/// is present in `pt` with at least `rules.required_flags`.
pub fn verify_user_range(rules: UserRangeRules, address: VirtualAddress, size: u64, pt: &PageTables) -> VmResult<()> {
    if size == 0 {
        return Err(Status::InvalidSpan);
    }
    if let Some(align) = rules.alignment
        && address.as_u64() % align != 0
    {
        return Err(Status::InvalidInput);
    }
    if let Some(min) = rules.min_size
        && size < min
    {
        return Err(Status::InvalidSpan);
    }
    if let Some(max) = rules.max_size
        && size > max
    {
        return Err(Status::InvalidSpan);
    }
    if let Some(mult) = rules.size_multiple
        && (mult == 0 || size % mult != 0)
    {
        return Err(Status::InvalidSpan);
    }

    let last_byte = address.as_u64().checked_add(size - 1).ok_or(Status::InvalidAddress)?;
    let last = VirtualAddress::new(last_byte);
    if !address.is_lower_half() || !last.is_lower_half() {
        return Err(Status::InvalidAddress);
    }

    let end = VirtualAddress::new(address.as_u64() + size);
    let mut cur = address.align_down::<Size4K>();
    while cur < end {
        let walk = pt.walk(cur);
        if !walk.is_mapped() || !walk.flags().contains(rules.required_flags) {
            return Err(Status::InvalidAddress);
        }
        cur = cur + Size4K::SIZE;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use vmcore_addr::{AddressMapping, MemoryType, PatLayout, PhysicalAddress};

    use super::*;
    use crate::bits::EntryBits;
    use crate::builder::PageBuilder;

    fn make_pt() -> (alloc::vec::Vec<u8>, PageTables) {
        const FRAMES: u64 = 64;
        let mut buf = alloc::vec![0u8; (FRAMES * 4096) as usize];
        let base = buf.as_mut_ptr() as u64;
        let arena = AddressMapping::new(VirtualAddress::new(base), PhysicalAddress::new(base), FRAMES * 4096);
        let builder = PageBuilder::new(40, 48, VirtualAddress::ZERO, PatLayout::default());
        let pt = unsafe { PageTables::create(builder, arena, EntryBits::permissive_middle()).unwrap() };
        (buf, pt)
    }

    #[test]
    fn mapped_range_with_sufficient_flags_succeeds() {
        let (_buf, pt) = make_pt();
        let mapping = AddressMapping::new(VirtualAddress::new(0x5000_0000), PhysicalAddress::new(0x5000_0000), 4096);
        pt.map(mapping, PageFlags::DATA, MemoryType::WriteBack).unwrap();
        let rules = UserRangeRules { required_flags: PageFlags::READ, ..Default::default() };
        assert!(verify_user_range(rules, VirtualAddress::new(0x5000_0000), 4096, &pt).is_ok());
    }

    #[test]
    fn unmapped_range_is_rejected() {
        let (_buf, pt) = make_pt();
        let rules = UserRangeRules::default();
        assert_eq!(
            verify_user_range(rules, VirtualAddress::new(0x6000_0000), 4096, &pt).unwrap_err(),
            Status::InvalidAddress
        );
    }

    #[test]
    fn insufficient_flags_are_rejected() {
        let (_buf, pt) = make_pt();
        let mapping = AddressMapping::new(VirtualAddress::new(0x7000_0000), PhysicalAddress::new(0x7000_0000), 4096);
        pt.map(mapping, PageFlags::READ, MemoryType::WriteBack).unwrap();
        let rules = UserRangeRules { required_flags: PageFlags::WRITE, ..Default::default() };
        assert_eq!(
            verify_user_range(rules, VirtualAddress::new(0x7000_0000), 4096, &pt).unwrap_err(),
            Status::InvalidAddress
        );
    }

    #[test]
    fn higher_half_address_is_rejected() {
        let (_buf, pt) = make_pt();
        let rules = UserRangeRules::default();
        assert_eq!(
            verify_user_range(rules, VirtualAddress::new(0xFFFF_8000_0000_0000), 4096, &pt).unwrap_err(),
            Status::InvalidAddress
        );
    }

    #[test]
    fn misaligned_address_rejected_by_alignment_rule() {
        let (_buf, pt) = make_pt();
        let rules = UserRangeRules { alignment: Some(0x1000), ..Default::default() };
        assert_eq!(
            verify_user_range(rules, VirtualAddress::new(0x5000_0123), 4096, &pt).unwrap_err(),
            Status::InvalidInput
        );
    }
}
