//! Transactional batch of `map`/`unmap` operations against one
//! [`PageTables`] instance. Unlike a direct `map`/`unmap` call, which may
//! leave a partial change behind on `OutOfMemory`, every command's worst-case
//! page-table frames are withdrawn from the allocator at `record` time, so
//! `commit` cannot fail partway through a batch.

use alloc::vec::Vec;

use vmcore_addr::{AddressMapping, MemoryType, PageFlags, Status, VirtualRange, VmResult};
use vmcore_pta::PageTableList;

use crate::page_tables::PageTables;

enum Command {
    Map { mapping: AddressMapping, flags: PageFlags, ty: MemoryType, reserved: PageTableList },
    Unmap { range: VirtualRange, reserved: PageTableList },
}

impl Command {
    fn range(&self) -> VirtualRange {
        match self {
            Self::Map { mapping, .. } => mapping.virtual_range(),
            Self::Unmap { range, .. } => *range,
        }
    }
}

/// Not thread-safe: record and commit on the same thread. Dropping an
/// uncommitted list returns every reserved frame to the owning
/// [`PageTables`]'s allocator.
pub struct PtCommandList<'a> {
    pt: &'a PageTables,
    commands: Vec<Command>,
}

impl<'a> PtCommandList<'a> {
    #[must_use]
    pub fn new(pt: &'a PageTables) -> Self {
        Self { pt, commands: Vec::new() }
    }

    /// Record a 1:1 mapping of `mapping.physical_range()` at `mapping.vaddr`.
    /// Reserves the worst-case number of page-table frames the eventual
    /// `map` could need up front; returns `Status::OutOfMemory` immediately
    /// if the allocator cannot cover that reservation.
    pub fn record_map(&mut self, mapping: AddressMapping, flags: PageFlags, ty: MemoryType) -> VmResult<()> {
        if !mapping.is_well_formed() || flags.is_none() {
            return Err(Status::InvalidInput);
        }
        let range = mapping.virtual_range();
        if self.overlaps(range) {
            return Err(Status::InvalidData);
        }
        let reserved = self.pt.with_inner(|inner| inner.reserve_for_mapping(range))?;
        self.commands.push(Command::Map { mapping, flags, ty, reserved });
        Ok(())
    }

    /// Record an unmap of `range`. `range` must not overlap any command
    /// already recorded in this list.
    pub fn record_unmap(&mut self, range: VirtualRange) -> VmResult<()> {
        if range.is_empty() {
            return Err(Status::InvalidInput);
        }
        if self.overlaps(range) {
            return Err(Status::InvalidData);
        }
        let reserved = self.pt.with_inner(|inner| inner.reserve_for_unmapping(range))?;
        self.commands.push(Command::Unmap { range, reserved });
        Ok(())
    }

    fn overlaps(&self, range: VirtualRange) -> bool {
        self.commands.iter().any(|c| c.range().intersects(range))
    }

    /// No two recorded commands touch the same virtual range. Reservation
    /// already happened at `record` time, so this is purely the
    /// target-overlap check.
    #[must_use]
    pub fn validate(&self) -> bool {
        for (i, a) in self.commands.iter().enumerate() {
            for b in &self.commands[i + 1..] {
                if a.range().intersects(b.range()) {
                    return false;
                }
            }
        }
        true
    }

    /// Apply every recorded command. Infallible: each command's frames were
    /// already withdrawn at `record` time, so handing them back to the
    /// allocator immediately before replaying the operation (all under one
    /// lock acquisition, so nothing else can intervene) guarantees the
    /// replay's own allocations succeed.
    pub fn commit(mut self) {
        let commands = core::mem::take(&mut self.commands);
        self.pt.with_inner(|inner| {
            for command in commands {
                match command {
                    Command::Map { mapping, flags, ty, reserved } => {
                        inner.return_list(reserved);
                        let _ = inner.map_locked(mapping, flags, ty);
                    }
                    Command::Unmap { range, reserved } => {
                        inner.return_list(reserved);
                        let _ = inner.unmap_locked(range);
                    }
                }
            }
        });
    }
}

impl Drop for PtCommandList<'_> {
    fn drop(&mut self) {
        let commands = core::mem::take(&mut self.commands);
        if commands.is_empty() {
            return;
        }
        self.pt.with_inner(|inner| {
            for command in commands {
                match command {
                    Command::Map { reserved, .. } | Command::Unmap { reserved, .. } => inner.return_list(reserved),
                }
            }
        });
    }
}

#[cfg(test)]
mod tests {
    use vmcore_addr::{PatLayout, PhysicalAddress, Range, VirtualAddress};

    use super::*;
    use crate::builder::PageBuilder;

    fn make_pt() -> (alloc::vec::Vec<u8>, PageTables) {
        const FRAMES: u64 = 64;
        let mut buf = alloc::vec![0u8; (FRAMES * 4096) as usize];
        let base = buf.as_mut_ptr() as u64;
        let arena = AddressMapping::new(VirtualAddress::new(base), PhysicalAddress::new(base), FRAMES * 4096);
        let builder = PageBuilder::new(40, 48, VirtualAddress::ZERO, PatLayout::default());
        let pt = unsafe { PageTables::create(builder, arena, crate::bits::EntryBits::permissive_middle()).unwrap() };
        (buf, pt)
    }

    #[test]
    fn commit_applies_every_recorded_mapping() {
        let (_buf, pt) = make_pt();
        let mut list = PtCommandList::new(&pt);
        let mapping = AddressMapping::new(VirtualAddress::new(0x1000_0000), PhysicalAddress::new(0x1000_0000), 4096);
        list.record_map(mapping, PageFlags::DATA, MemoryType::WriteBack).unwrap();
        assert!(list.validate());
        list.commit();
        assert!(pt.walk(VirtualAddress::new(0x1000_0000)).is_mapped());
    }

    #[test]
    fn drop_without_commit_returns_reserved_frames() {
        let (_buf, pt) = make_pt();
        let mapping = AddressMapping::new(VirtualAddress::new(0x2000_0000), PhysicalAddress::new(0x2000_0000), 4096);
        {
            let mut list = PtCommandList::new(&pt);
            list.record_map(mapping, PageFlags::DATA, MemoryType::WriteBack).unwrap();
        }
        assert!(!pt.walk(VirtualAddress::new(0x2000_0000)).is_mapped());
    }

    #[test]
    fn oom_during_staging_rolls_back_and_leaves_pta_untouched() {
        // spec.md's "Transactional map rollback" scenario: a PTA budget tight
        // enough that recording a second 4 KiB map fails with OutOfMemory,
        // and neither mapping ends up installed.
        const FRAMES: u64 = 6; // 1 root + 4 (first reservation) + 1 spare, short of the second's 4.
        let mut buf = alloc::vec![0u8; (FRAMES * 4096) as usize];
        let base = buf.as_mut_ptr() as u64;
        let arena = AddressMapping::new(VirtualAddress::new(base), PhysicalAddress::new(base), FRAMES * 4096);
        let builder = PageBuilder::new(40, 48, VirtualAddress::ZERO, PatLayout::default());
        let pt = unsafe { PageTables::create(builder, arena, crate::bits::EntryBits::permissive_middle()).unwrap() };

        let v1 = VirtualAddress::new(0x1000_0000);
        let v2 = VirtualAddress::new(0x2000_0000);
        let mapping1 = AddressMapping::new(v1, PhysicalAddress::new(0x1000_0000), 4096);
        let mapping2 = AddressMapping::new(v2, PhysicalAddress::new(0x2000_0000), 4096);

        let mut list = PtCommandList::new(&pt);
        list.record_map(mapping1, PageFlags::DATA, MemoryType::WriteBack).unwrap();
        let err = list.record_map(mapping2, PageFlags::DATA, MemoryType::WriteBack).unwrap_err();
        assert_eq!(err, Status::OutOfMemory);
        drop(list);

        assert!(!pt.walk(v1).is_mapped());
        assert!(!pt.walk(v2).is_mapped());
    }

    #[test]
    fn overlapping_commands_are_rejected() {
        let (_buf, pt) = make_pt();
        let mut list = PtCommandList::new(&pt);
        let a = AddressMapping::new(VirtualAddress::new(0x3000_0000), PhysicalAddress::new(0x3000_0000), 8192);
        list.record_map(a, PageFlags::DATA, MemoryType::WriteBack).unwrap();
        let overlapping = Range::new(VirtualAddress::new(0x3000_0000 + 0x1000), VirtualAddress::new(0x3000_0000 + 0x3000));
        assert_eq!(list.record_unmap(overlapping).unwrap_err(), Status::InvalidData);
    }

    #[test]
    fn unmap_command_clears_a_prior_direct_mapping() {
        let (_buf, pt) = make_pt();
        let mapping = AddressMapping::new(VirtualAddress::new(0x4000_0000), PhysicalAddress::new(0x4000_0000), 4096);
        pt.map(mapping, PageFlags::DATA, MemoryType::WriteBack).unwrap();
        let mut list = PtCommandList::new(&pt);
        list.record_unmap(mapping.virtual_range()).unwrap();
        list.commit();
        assert!(!pt.walk(VirtualAddress::new(0x4000_0000)).is_mapped());
    }
}
