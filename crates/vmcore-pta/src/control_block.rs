use core::ptr;

/// Free-list node embedded directly in the free frame(s) it describes.
///
/// Mirrors the shape `original_source`'s `PageTableAllocator` calls a
/// control block: `next`/`prev` links plus the block's byte `size` and the
/// constant virtual-minus-physical `slide` of the arena segment it belongs
/// to. Stored at the *virtual* address of the block's first frame (the PTA
/// arena is always pre-mapped, so every block is directly addressable).
#[repr(C)]
pub(crate) struct ControlBlock {
    pub next: *mut ControlBlock,
    pub prev: *mut ControlBlock,
    /// Size in bytes; always a positive multiple of the allocator's block size.
    pub size: u64,
    /// `vaddr - paddr` for the arena segment this block lives in.
    pub slide: i64,
}

impl ControlBlock {
    pub(crate) unsafe fn write_at(addr: *mut ControlBlock, size: u64, slide: i64) {
        unsafe {
            ptr::write(
                addr,
                ControlBlock {
                    next: ptr::null_mut(),
                    prev: ptr::null_mut(),
                    size,
                    slide,
                },
            );
        }
    }
}
