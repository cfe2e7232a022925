//! The single synchronization primitive used across the virtual-memory
//! core: a per-instance spinlock with no suspension and no fairness
//! guarantees, matching the "no operation suspends or yields inside the
//! core" concurrency model.
#![cfg_attr(not(test), no_std)]

mod spin_lock;

pub use spin_lock::SpinLock;
