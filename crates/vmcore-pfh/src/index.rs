//! Two-level segregated-fit bin indexing.
//!
//! First-level index `f = floor(log2(size))`; for each first-level bin, a
//! second-level index subdivides it into `2^L` bins (`L = 5`, so 32
//! sub-bins), per §4.1's "Algorithmic details".

/// Number of second-level sub-bins per first-level class (`2^L`, `L = 5`).
pub(crate) const SL_COUNT: usize = 32;
const SL_SHIFT: u32 = 5;

/// Number of first-level classes. Covers size classes up to `2^47` bytes
/// (128 TiB), comfortably beyond any realistic physical memory map.
pub(crate) const FL_COUNT: usize = 48;

/// Exact `(fl, sl)` class a block of this size is stored under when freed.
pub(crate) fn class_of(size: u64) -> (usize, usize) {
    debug_assert!(size > 0);
    let f = (63 - size.leading_zeros()) as usize;
    let f = f.min(FL_COUNT - 1);
    let sl = if f < SL_SHIFT as usize {
        0
    } else {
        (((size - (1u64 << f)) << SL_SHIFT) >> f) as usize
    };
    (f, sl.min(SL_COUNT - 1))
}

/// The smallest `(fl, sl)` class that is guaranteed to contain only blocks
/// `>= size` (the TLSF "round up" search key) — adds `2^(f-L) - 1` before
/// classifying, so any block living in the resulting class satisfies the
/// request without a per-block size check.
pub(crate) fn search_class_of(size: u64) -> (usize, usize) {
    let f = (63 - size.leading_zeros()) as usize;
    if f < SL_SHIFT as usize {
        return class_of(size);
    }
    let round = (1u64 << (f - SL_SHIFT as usize)) - 1;
    class_of(size.saturating_add(round))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn class_of_power_of_two() {
        let (f, sl) = class_of(4096);
        assert_eq!(f, 12);
        assert_eq!(sl, 0);
    }

    #[test]
    fn class_of_mid_bin() {
        let (f, sl) = class_of(4096 + 2048);
        assert_eq!(f, 12);
        assert_eq!(sl, 16);
    }

    #[test]
    fn search_class_rounds_up_to_cover_request() {
        let (f, sl) = search_class_of(4097);
        assert!((f, sl) >= class_of(4097));
    }
}
