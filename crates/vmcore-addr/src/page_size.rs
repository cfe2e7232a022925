//! Page-size marker types used to make address/page arithmetic zero-cost and
//! statically checked instead of branching on a runtime enum.

use core::fmt;

/// Sealed trait implemented by the three page-size marker types.
pub trait PageSize: Copy + Eq + private::Sealed {
    /// Size in bytes.
    const SIZE: u64;
    /// `log2(SIZE)`; also the low-bit width of an aligned address.
    const SHIFT: u32;
    /// Human-readable size, e.g. `"4 KiB"`.
    fn as_str() -> &'static str;
}

mod private {
    pub trait Sealed {}
    impl Sealed for super::Size4K {}
    impl Sealed for super::Size2M {}
    impl Sealed for super::Size1G {}
}

/// 4 KiB pages — the only size every x86-64 implementation must support.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Size4K;

/// 2 MiB pages (PD leaf).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Size2M;

/// 1 GiB pages (PDPT leaf); optional per the open question in the core spec.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Size1G;

impl PageSize for Size4K {
    const SIZE: u64 = 4 * 1024;
    const SHIFT: u32 = 12;
    fn as_str() -> &'static str {
        "4 KiB"
    }
}

impl PageSize for Size2M {
    const SIZE: u64 = 2 * 1024 * 1024;
    const SHIFT: u32 = 21;
    fn as_str() -> &'static str {
        "2 MiB"
    }
}

impl PageSize for Size1G {
    const SIZE: u64 = 1024 * 1024 * 1024;
    const SHIFT: u32 = 30;
    fn as_str() -> &'static str {
        "1 GiB"
    }
}

impl fmt::Display for Size4K {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(Self::as_str())
    }
}

impl fmt::Display for Size2M {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(Self::as_str())
    }
}

impl fmt::Display for Size1G {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(Self::as_str())
    }
}

/// Runtime-selected page size, returned by queries that don't know the size
/// at compile time (e.g. `PageTables::get_page_size`).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum PageSizeKind {
    None,
    Size4K,
    Size2M,
    Size1G,
}
