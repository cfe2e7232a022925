use core::cell::UnsafeCell;
use core::sync::atomic::{AtomicBool, Ordering};

/// A minimal spinlock guarding a single value of type `T`.
///
/// Every PT and PFH instance embeds exactly one of these (§5 of the core
/// design: "Each PT and each PFH instance carries its own exclusive-access
/// lock"). There is no blocking, no priority inheritance, and no
/// suspension — callers that need fairness or IRQ-safety build it on top.
pub struct SpinLock<T> {
    locked: AtomicBool,
    inner: UnsafeCell<T>,
}

// Safety: access to `inner` is only ever granted from within `with_lock`,
// which holds `locked` for the duration of the closure.
unsafe impl<T: Send> Sync for SpinLock<T> {}

impl<T> SpinLock<T> {
    #[must_use]
    pub const fn new(inner: T) -> Self {
        Self {
            locked: AtomicBool::new(false),
            inner: UnsafeCell::new(inner),
        }
    }

    /// Run `f` with exclusive access to the guarded value.
    pub fn with_lock<R>(&self, f: impl FnOnce(&mut T) -> R) -> R {
        while self
            .locked
            .compare_exchange_weak(false, true, Ordering::Acquire, Ordering::Relaxed)
            .is_err()
        {
            while self.locked.load(Ordering::Relaxed) {
                core::hint::spin_loop();
            }
        }
        // Safety: we just acquired exclusive access above.
        let result = f(unsafe { &mut *self.inner.get() });
        self.locked.store(false, Ordering::Release);
        result
    }

    /// Non-blocking acquisition; returns `None` without spinning if the lock
    /// is currently held (`Status::DeviceBusy` at call sites that need it).
    pub fn try_with_lock<R>(&self, f: impl FnOnce(&mut T) -> R) -> Option<R> {
        if self
            .locked
            .compare_exchange(false, true, Ordering::Acquire, Ordering::Relaxed)
            .is_err()
        {
            return None;
        }
        let result = f(unsafe { &mut *self.inner.get() });
        self.locked.store(false, Ordering::Release);
        Some(result)
    }

    /// Consume the lock and return the guarded value.
    pub fn into_inner(self) -> T {
        self.inner.into_inner()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn mutual_exclusion_is_trivially_safe_single_threaded() {
        let lock = SpinLock::new(0u32);
        lock.with_lock(|v| *v += 1);
        lock.with_lock(|v| *v += 1);
        assert_eq!(lock.with_lock(|v| *v), 2);
    }

    #[test]
    fn try_with_lock_fails_while_held() {
        let lock = SpinLock::new(0u32);
        lock.with_lock(|outer| {
            *outer = 5;
        });
        assert_eq!(lock.try_with_lock(|v| *v), Some(5));
    }
}
