//! Unified, ergonomic view over x86-64 paging-entry flags, translating
//! between [`PageFlags`]/[`MemoryType`] and the per-level bit-packed entry
//! types. Mirrors the teacher's `VirtualMemoryPageBits`: deliberately not
//! bit-packed itself, so middle/leaf flags can be built and compared without
//! touching raw entry words.

use vmcore_addr::{MemoryType, PageFlags, PatLayout};

use crate::pd::{Pde, Pde2M};
use crate::pdpt::{Pdpte, Pdpte1G};
use crate::pml4::Pml4Entry;
use crate::pt::PtEntry4k;

/// Semantic superset of fields across all four paging levels and both
/// leaf/non-leaf forms. Non-leaf encodings ignore `dirty`/`global`/`pat_bit2`.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct EntryBits {
    pub present: bool,
    pub writable: bool,
    pub user: bool,
    pub write_through: bool,
    pub cache_disable: bool,
    pub accessed: bool,
    pub dirty: bool,
    pub global: bool,
    pub no_execute: bool,
    /// PAT selector bit 2 (bit 12 on 2 MiB/1 GiB leaves, bit 7 on 4 KiB leaves).
    pub pat_bit2: bool,
}

impl EntryBits {
    /// Leaf flags for a mapping with the given permissions and cache type,
    /// with the PAT index split across `write_through`/`cache_disable`/`pat_bit2`.
    #[must_use]
    pub const fn for_leaf(flags: PageFlags, ty: MemoryType, pat: PatLayout) -> Self {
        let slot = pat.slot(ty);
        Self {
            present: true,
            writable: flags.contains(PageFlags::WRITE),
            user: flags.contains(PageFlags::USER),
            write_through: slot & 0b001 != 0,
            cache_disable: slot & 0b010 != 0,
            pat_bit2: slot & 0b100 != 0,
            accessed: false,
            dirty: false,
            global: false,
            no_execute: !flags.contains(PageFlags::EXECUTE),
        }
    }

    /// Permissive non-leaf flags: present, writable, user — so that leaf
    /// entries further down the walk always dominate (§3 invariant 7).
    #[must_use]
    pub const fn permissive_middle() -> Self {
        Self {
            present: true,
            writable: true,
            user: true,
            write_through: false,
            cache_disable: false,
            accessed: false,
            dirty: false,
            global: false,
            no_execute: false,
            pat_bit2: false,
        }
    }

    /// Recover the [`PageFlags`] a leaf entry's bits represent. Returns
    /// `PageFlags::empty()` when `present` is false (matches "`None` means
    /// not mapped" in queries).
    #[must_use]
    pub const fn to_page_flags(self) -> PageFlags {
        if !self.present {
            return PageFlags::empty();
        }
        let mut f = PageFlags::READ;
        if self.writable {
            f = f.union(PageFlags::WRITE);
        }
        if !self.no_execute {
            f = f.union(PageFlags::EXECUTE);
        }
        if self.user {
            f = f.union(PageFlags::USER);
        }
        f
    }

    #[must_use]
    pub(crate) const fn to_pml4e(self) -> Pml4Entry {
        Pml4Entry::new()
            .with_present(self.present)
            .with_writable(self.writable)
            .with_user(self.user)
            .with_write_through(self.write_through)
            .with_cache_disable(self.cache_disable)
            .with_accessed(self.accessed)
            .with_no_execute(self.no_execute)
    }

    #[must_use]
    pub(crate) const fn to_pdpte(self) -> Pdpte {
        Pdpte::new()
            .with_present(self.present)
            .with_writable(self.writable)
            .with_user(self.user)
            .with_write_through(self.write_through)
            .with_cache_disable(self.cache_disable)
            .with_accessed(self.accessed)
            .with_no_execute(self.no_execute)
    }

    #[must_use]
    pub(crate) const fn to_pdpte_1g(self) -> Pdpte1G {
        Pdpte1G::new()
            .with_present(self.present)
            .with_writable(self.writable)
            .with_user(self.user)
            .with_write_through(self.write_through)
            .with_cache_disable(self.cache_disable)
            .with_accessed(self.accessed)
            .with_dirty(self.dirty)
            .with_global(self.global)
            .with_no_execute(self.no_execute)
            .with_pat_large(self.pat_bit2)
            .with_page_size(true)
    }

    #[must_use]
    pub(crate) const fn to_pde(self) -> Pde {
        Pde::new()
            .with_present(self.present)
            .with_writable(self.writable)
            .with_user(self.user)
            .with_write_through(self.write_through)
            .with_cache_disable(self.cache_disable)
            .with_accessed(self.accessed)
            .with_no_execute(self.no_execute)
    }

    #[must_use]
    pub(crate) const fn to_pde_2m(self) -> Pde2M {
        Pde2M::new()
            .with_present(self.present)
            .with_writable(self.writable)
            .with_user(self.user)
            .with_write_through(self.write_through)
            .with_cache_disable(self.cache_disable)
            .with_accessed(self.accessed)
            .with_dirty(self.dirty)
            .with_global(self.global)
            .with_no_execute(self.no_execute)
            .with_pat_large(self.pat_bit2)
            .with_page_size(true)
    }

    #[must_use]
    pub(crate) const fn to_pte_4k(self) -> PtEntry4k {
        PtEntry4k::new()
            .with_present(self.present)
            .with_writable(self.writable)
            .with_user(self.user)
            .with_write_through(self.write_through)
            .with_cache_disable(self.cache_disable)
            .with_accessed(self.accessed)
            .with_dirty(self.dirty)
            .with_global(self.global)
            .with_no_execute(self.no_execute)
            .with_pat_small(self.pat_bit2)
    }
}

impl From<Pml4Entry> for EntryBits {
    fn from(e: Pml4Entry) -> Self {
        Self {
            present: e.present(),
            writable: e.writable(),
            user: e.user(),
            write_through: e.write_through(),
            cache_disable: e.cache_disable(),
            accessed: e.accessed(),
            dirty: false,
            global: false,
            no_execute: e.no_execute(),
            pat_bit2: false,
        }
    }
}

impl From<Pde2M> for EntryBits {
    fn from(e: Pde2M) -> Self {
        Self {
            present: e.present(),
            writable: e.writable(),
            user: e.user(),
            write_through: e.write_through(),
            cache_disable: e.cache_disable(),
            accessed: e.accessed(),
            dirty: e.dirty(),
            global: e.global(),
            no_execute: e.no_execute(),
            pat_bit2: e.pat_large(),
        }
    }
}

impl From<Pdpte1G> for EntryBits {
    fn from(e: Pdpte1G) -> Self {
        Self {
            present: e.present(),
            writable: e.writable(),
            user: e.user(),
            write_through: e.write_through(),
            cache_disable: e.cache_disable(),
            accessed: e.accessed(),
            dirty: e.dirty(),
            global: e.global(),
            no_execute: e.no_execute(),
            pat_bit2: e.pat_large(),
        }
    }
}

impl From<PtEntry4k> for EntryBits {
    fn from(e: PtEntry4k) -> Self {
        Self {
            present: e.present(),
            writable: e.writable(),
            user: e.user(),
            write_through: e.write_through(),
            cache_disable: e.cache_disable(),
            accessed: e.accessed(),
            dirty: e.dirty(),
            global: e.global(),
            no_execute: e.no_execute(),
            pat_bit2: e.pat_small(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn leaf_flags_roundtrip_permissions() {
        let bits = EntryBits::for_leaf(PageFlags::DATA, MemoryType::WriteBack, PatLayout::default());
        assert_eq!(bits.to_page_flags(), PageFlags::DATA);
    }

    #[test]
    fn code_flags_clear_no_execute() {
        let bits = EntryBits::for_leaf(PageFlags::CODE, MemoryType::WriteBack, PatLayout::default());
        assert!(!bits.no_execute);
        assert_eq!(bits.to_page_flags(), PageFlags::CODE);
    }

    #[test]
    fn absent_bits_have_no_flags() {
        assert_eq!(EntryBits::default().to_page_flags(), PageFlags::empty());
    }
}
