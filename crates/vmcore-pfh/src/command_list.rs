use alloc::vec::Vec;

use log::trace;
use vmcore_addr::{PhysicalAddress, Status, VmResult};

use crate::block::{Allocation, BlockId};
use crate::heap::PhysicalFrameHeap;

enum Command {
    Split { handle: Allocation, midpoint: PhysicalAddress, hi_id: BlockId },
    SplitV { handle: Allocation, midpoints: Vec<PhysicalAddress>, ids: Vec<BlockId> },
}

/// Transactional batch of `split`/`splitv` operations against one
/// [`PhysicalFrameHeap`]. Every command's replacement control blocks are
/// withdrawn from the heap's block pool at `record` time (mirroring
/// [`crate::heap`]'s `withdraw_control_blocks`/`commit_split`/
/// `commit_splitv`), so `commit` only installs already-withdrawn blocks and
/// cannot fail partway through; dropping the list without committing
/// returns every withdrawn block to the heap untouched.
///
/// Not thread-safe: record and commit on the same thread, as with the
/// PT command list.
pub struct PfhCommandList<'a> {
    heap: &'a PhysicalFrameHeap,
    commands: Vec<Command>,
}

impl<'a> PfhCommandList<'a> {
    #[must_use]
    pub fn new(heap: &'a PhysicalFrameHeap) -> Self {
        Self { heap, commands: Vec::new() }
    }

    /// Record a two-way split of `handle` at `midpoint`, withdrawing the
    /// replacement control block from the heap's pool immediately. Returns
    /// `Status::InvalidInput` if the target is already recorded in this
    /// list or `midpoint` isn't strictly interior; no mutation occurs on
    /// failure.
    pub fn record_split(&mut self, handle: Allocation, midpoint: PhysicalAddress) -> VmResult<()> {
        if self.targets(handle) {
            return Err(Status::InvalidInput);
        }
        if midpoint <= handle.range.front || midpoint >= handle.range.back {
            return Err(Status::InvalidInput);
        }
        let hi_id = self.heap.withdraw_control_blocks(1)[0];
        self.commands.push(Command::Split { handle, midpoint, hi_id });
        Ok(())
    }

    /// Record a fan-out split of `handle` at every point in `midpoints`
    /// (strictly ascending, strictly interior), withdrawing one replacement
    /// control block per point immediately.
    pub fn record_splitv(&mut self, handle: Allocation, midpoints: &[PhysicalAddress]) -> VmResult<()> {
        if self.targets(handle) {
            return Err(Status::InvalidInput);
        }
        if midpoints.is_empty() {
            return Err(Status::InvalidInput);
        }
        for w in midpoints.windows(2) {
            if w[0] >= w[1] {
                return Err(Status::InvalidInput);
            }
        }
        if midpoints[0] <= handle.range.front || *midpoints.last().unwrap() >= handle.range.back {
            return Err(Status::InvalidInput);
        }
        let ids = self.heap.withdraw_control_blocks(midpoints.len());
        self.commands.push(Command::SplitV { handle, midpoints: midpoints.to_vec(), ids });
        Ok(())
    }

    fn targets(&self, handle: Allocation) -> bool {
        self.commands.iter().any(|c| match c {
            Command::Split { handle: h, .. } | Command::SplitV { handle: h, .. } => *h == handle,
        })
    }

    /// No two recorded commands target the same allocation. PFH's actual
    /// resource reservation happens eagerly at `record` time, so this is
    /// purely a target-overlap check.
    #[must_use]
    pub fn validate(&self) -> bool {
        let mut seen = Vec::with_capacity(self.commands.len());
        for c in &self.commands {
            let h = match c {
                Command::Split { handle, .. } | Command::SplitV { handle, .. } => *handle,
            };
            if seen.contains(&h) {
                return false;
            }
            seen.push(h);
        }
        true
    }

    /// Apply every recorded command. Infallible: every command's control
    /// blocks were already withdrawn from the heap's pool at `record` time,
    /// so `commit` only installs them — it makes no fallible call.
    pub fn commit(mut self) {
        let commands = core::mem::take(&mut self.commands);
        let count = commands.len();
        for command in commands {
            match command {
                Command::Split { handle, midpoint, hi_id } => {
                    self.heap.commit_split(handle, midpoint, hi_id);
                }
                Command::SplitV { handle, midpoints, ids } => {
                    self.heap.commit_splitv(handle, &midpoints, &ids);
                }
            }
        }
        trace!("committed {count} PFH command(s)");
    }
}

impl<'a> Drop for PfhCommandList<'a> {
    /// Return every withdrawn-but-uncommitted control block to the heap.
    fn drop(&mut self) {
        for command in self.commands.drain(..) {
            match command {
                Command::Split { hi_id, .. } => self.heap.return_control_blocks(&[hi_id]),
                Command::SplitV { ids, .. } => self.heap.return_control_blocks(&ids),
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use vmcore_addr::{PhysicalAddress as Pa, PhysicalRange, Range};

    fn range(a: u64, b: u64) -> PhysicalRange {
        Range::new(Pa::new(a), Pa::new(b))
    }

    #[test]
    fn commit_applies_all_recorded_splits() {
        let heap = PhysicalFrameHeap::create(&[range(0x1000, 0x5000)]).unwrap();
        let a = heap.malloc(0x2000).unwrap();
        let mut list = PfhCommandList::new(&heap);
        list.record_split(a, Pa::new(a.range.front.as_u64() + 0x1000)).unwrap();
        assert!(list.validate());
        list.commit();
        heap.validate();
    }

    #[test]
    fn drop_without_commit_leaves_heap_untouched() {
        let heap = PhysicalFrameHeap::create(&[range(0x1000, 0x5000)]).unwrap();
        let a = heap.malloc(0x2000).unwrap();
        let before = heap.stats();
        {
            let mut list = PfhCommandList::new(&heap);
            list.record_split(a, Pa::new(a.range.front.as_u64() + 0x1000)).unwrap();
        }
        assert_eq!(heap.stats(), before);
    }

    #[test]
    fn drop_without_commit_after_splitv_returns_every_withdrawn_block() {
        let heap = PhysicalFrameHeap::create(&[range(0x1000, 0x5000)]).unwrap();
        let a = heap.malloc(0x2000).unwrap();
        let before = heap.stats();
        {
            let mut list = PfhCommandList::new(&heap);
            let front = a.range.front.as_u64();
            list.record_splitv(a, &[Pa::new(front + 0x800), Pa::new(front + 0x1000), Pa::new(front + 0x1800)]).unwrap();
        }
        assert_eq!(heap.stats(), before);
    }

    #[test]
    fn recording_same_handle_twice_is_rejected() {
        let heap = PhysicalFrameHeap::create(&[range(0x1000, 0x5000)]).unwrap();
        let a = heap.malloc(0x2000).unwrap();
        let mut list = PfhCommandList::new(&heap);
        list.record_split(a, Pa::new(a.range.front.as_u64() + 0x800)).unwrap();
        assert_eq!(list.record_split(a, Pa::new(a.range.front.as_u64() + 0x1000)).unwrap_err(), Status::InvalidInput);
    }

    #[test]
    fn commit_applies_all_recorded_splitv_fan_outs() {
        let heap = PhysicalFrameHeap::create(&[range(0x1000, 0x5000)]).unwrap();
        let a = heap.malloc(0x1000).unwrap();
        let front = a.range.front.as_u64();
        let mut list = PfhCommandList::new(&heap);
        list.record_splitv(a, &[Pa::new(front + 0x100), Pa::new(front + 0x200), Pa::new(front + 0x300), Pa::new(front + 0x400)]).unwrap();
        list.commit();
        heap.validate();
        assert_eq!(heap.stats().used_bytes, 0x1000);
    }
}
