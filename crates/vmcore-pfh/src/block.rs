use vmcore_addr::PhysicalRange;

/// Index into the block-pool slab. Never dereferenced directly outside this
/// crate — the "arena + index" idiom instead of an owning pointer graph.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct BlockId(pub(crate) u32);

/// A TLSF control block: one physical range, free/used/reserved state, its
/// neighbours in address order within its pool, and its links in whichever
/// free list it currently belongs to (if free).
#[derive(Debug, Clone, Copy)]
pub(crate) struct PfhBlock {
    pub range: PhysicalRange,
    pub free: bool,
    pub reserved: bool,
    /// Address-order neighbours within the same contiguous pool (`None` at
    /// a pool boundary — pools created from disjoint input ranges never
    /// link to each other).
    pub addr_prev: Option<BlockId>,
    pub addr_next: Option<BlockId>,
    /// Doubly linked free-list neighbours within this block's `(fl, sl)` bin.
    pub free_prev: Option<BlockId>,
    pub free_next: Option<BlockId>,
}

impl PfhBlock {
    pub(crate) const fn size(&self) -> u64 {
        // Range::size requires the `Sub`/`Add` bounds that aren't `const`;
        // physical ranges are simple enough to compute inline here.
        self.range.back.as_u64() - self.range.front.as_u64()
    }
}

/// Handle to a live, used PFH allocation. Equal handles refer to the same
/// allocation; a handle is invalidated by `free`, `split`, or `splitv` on
/// the block it names (misuse after invalidation is a caller bug, not a
/// detected error, matching the core's "no partial mutation, no panics on
/// caller contract violations other than `validate`" design).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Allocation {
    pub(crate) id: BlockId,
    pub range: PhysicalRange,
}

impl Allocation {
    #[must_use]
    pub const fn size(&self) -> u64 {
        self.range.back.as_u64() - self.range.front.as_u64()
    }
}
