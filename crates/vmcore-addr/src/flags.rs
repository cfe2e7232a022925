use bitflags::bitflags;

bitflags! {
    /// Requested page permissions. An empty set means "not mapped" when
    /// returned from a query such as `getMemoryFlags`.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
    pub struct PageFlags: u8 {
        const READ    = 0b0001;
        const WRITE   = 0b0010;
        const EXECUTE = 0b0100;
        const USER    = 0b1000;
    }
}

impl PageFlags {
    pub const DATA: Self = Self::READ.union(Self::WRITE);
    pub const CODE: Self = Self::READ.union(Self::EXECUTE);
    pub const ALL: Self = Self::READ.union(Self::WRITE).union(Self::EXECUTE).union(Self::USER);

    #[must_use]
    pub const fn is_none(self) -> bool {
        self.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn composites() {
        assert_eq!(PageFlags::DATA, PageFlags::READ | PageFlags::WRITE);
        assert_eq!(PageFlags::CODE, PageFlags::READ | PageFlags::EXECUTE);
        assert!(PageFlags::ALL.contains(PageFlags::USER));
        assert!(PageFlags::empty().is_none());
    }
}
