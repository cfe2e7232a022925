/// Snapshot returned by [`crate::PhysicalFrameHeap::stats`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PfhStats {
    pub used_bytes: u64,
    pub free_bytes: u64,
    pub block_count: usize,
    pub malloc_count: u64,
    pub free_count: u64,
}

impl PfhStats {
    /// Bytes spent on block-pool bookkeeping and the used-block index,
    /// rather than on backing physical memory.
    #[must_use]
    pub const fn control_memory(self) -> u64 {
        const BLOCK_OVERHEAD: u64 = 64; // PfhBlock + a used_index entry, approximately
        self.block_count as u64 * BLOCK_OVERHEAD
    }
}

/// Returned by [`crate::PhysicalFrameHeap::compact`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct PfhCompactStats {
    pub blocks_released: usize,
    pub bytes_reclaimed: u64,
}
