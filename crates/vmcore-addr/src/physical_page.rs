use core::fmt;
use core::marker::PhantomData;

use crate::page_size::PageSize;
use crate::physical_address::PhysicalAddress;

/// A page-aligned physical address, statically tagged with its page size.
#[repr(transparent)]
pub struct PhysicalPage<S: PageSize>(PhysicalAddress, PhantomData<S>);

impl<S: PageSize> Clone for PhysicalPage<S> {
    fn clone(&self) -> Self {
        *self
    }
}
impl<S: PageSize> Copy for PhysicalPage<S> {}
impl<S: PageSize> PartialEq for PhysicalPage<S> {
    fn eq(&self, other: &Self) -> bool {
        self.0 == other.0
    }
}
impl<S: PageSize> Eq for PhysicalPage<S> {}
impl<S: PageSize> PartialOrd for PhysicalPage<S> {
    fn partial_cmp(&self, other: &Self) -> Option<core::cmp::Ordering> {
        Some(self.cmp(other))
    }
}
impl<S: PageSize> Ord for PhysicalPage<S> {
    fn cmp(&self, other: &Self) -> core::cmp::Ordering {
        self.0.cmp(&other.0)
    }
}
impl<S: PageSize> core::hash::Hash for PhysicalPage<S> {
    fn hash<H: core::hash::Hasher>(&self, state: &mut H) {
        self.0.hash(state);
    }
}

impl<S: PageSize> PhysicalPage<S> {
    #[must_use]
    pub const fn from_base_unchecked(base: PhysicalAddress) -> Self {
        Self(base, PhantomData)
    }

    #[must_use]
    pub const fn containing(addr: PhysicalAddress) -> Self {
        Self(addr.align_down::<S>(), PhantomData)
    }

    #[must_use]
    pub const fn from_addr_exact(addr: PhysicalAddress) -> Option<Self> {
        if addr.is_aligned::<S>() {
            Some(Self(addr, PhantomData))
        } else {
            None
        }
    }

    #[must_use]
    pub const fn base(self) -> PhysicalAddress {
        self.0
    }

    #[must_use]
    pub const fn join(self, offset: u64) -> PhysicalAddress {
        PhysicalAddress::new(self.0.as_u64() + offset)
    }

    #[must_use]
    pub const fn next(self) -> Self {
        Self(PhysicalAddress::new(self.0.as_u64() + S::SIZE), PhantomData)
    }
}

impl<S: PageSize> fmt::Debug for PhysicalPage<S> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "PhysicalPage<{}>({:#018X})", S::as_str(), self.0.as_u64())
    }
}
