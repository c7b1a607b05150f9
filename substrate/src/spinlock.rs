//! A busy-waiting mutual-exclusion primitive for short critical sections.

use core::{
    cell::UnsafeCell,
    ops::{Deref, DerefMut},
    sync::atomic::{AtomicBool, Ordering},
};

/// The lock could not be acquired without blocking.
#[derive(Debug)]
pub struct WouldBlock;

/// A spinning mutex. Unlike `std::sync::Mutex`, the guard does not release
/// the lock on drop: callers must call [`SpinLockGuard::unlock`] explicitly.
/// Dropping a guard without unlocking it is a programming error and panics,
/// naming the call site that leaked the lock.
///
/// Suitable only for critical sections short enough that busy-waiting is
/// cheaper than a context switch — page-table entry updates, TLB shootdown
/// bookkeeping, and similar.
pub struct SpinLock<T: ?Sized> {
    locked: AtomicBool,
    data: UnsafeCell<T>,
}

unsafe impl<T: ?Sized + Send> Send for SpinLock<T> {}
unsafe impl<T: ?Sized + Send> Sync for SpinLock<T> {}

impl<T> SpinLock<T> {
    #[inline]
    pub const fn new(t: T) -> SpinLock<T> {
        SpinLock {
            data: UnsafeCell::new(t),
            locked: AtomicBool::new(false),
        }
    }
}

impl<T: ?Sized> SpinLock<T> {
    /// Spin until the lock is acquired.
    #[track_caller]
    pub fn lock(&self) -> SpinLockGuard<'_, T> {
        let guard = loop {
            let guard = crate::interrupt::InterruptGuard::new();
            core::hint::spin_loop();
            if !self.locked.fetch_or(true, Ordering::SeqCst) {
                break guard;
            }
            drop(guard);
        };
        SpinLockGuard {
            caller: core::panic::Location::caller(),
            lock: self,
            guard: Some(guard),
        }
    }

    /// Try to acquire the lock without blocking.
    #[track_caller]
    pub fn try_lock(&self) -> Result<SpinLockGuard<'_, T>, WouldBlock> {
        let guard = crate::interrupt::InterruptGuard::new();
        if !self.locked.fetch_or(true, Ordering::SeqCst) {
            Ok(SpinLockGuard {
                caller: core::panic::Location::caller(),
                lock: self,
                guard: Some(guard),
            })
        } else {
            drop(guard);
            Err(WouldBlock)
        }
    }

    pub fn into_inner(self) -> T
    where
        T: Sized,
    {
        self.data.into_inner()
    }
}

impl<T: Default> Default for SpinLock<T> {
    fn default() -> SpinLock<T> {
        SpinLock::new(Default::default())
    }
}

/// Scoped access to the data protected by a [`SpinLock`]. Must be released
/// with [`unlock`](Self::unlock); dropping it unreleased panics.
pub struct SpinLockGuard<'a, T: ?Sized + 'a> {
    caller: &'static core::panic::Location<'static>,
    lock: &'a SpinLock<T>,
    guard: Option<crate::interrupt::InterruptGuard>,
}

impl<T: ?Sized> !Send for SpinLockGuard<'_, T> {}
unsafe impl<T: ?Sized + Sync> Sync for SpinLockGuard<'_, T> {}

impl<T: ?Sized> Deref for SpinLockGuard<'_, T> {
    type Target = T;
    fn deref(&self) -> &T {
        unsafe { &*self.lock.data.get() }
    }
}

impl<T: ?Sized> DerefMut for SpinLockGuard<'_, T> {
    fn deref_mut(&mut self) -> &mut T {
        unsafe { &mut *self.lock.data.get() }
    }
}

impl<T: ?Sized> SpinLockGuard<'_, T> {
    pub fn unlock(mut self) {
        self.lock.locked.store(false, Ordering::SeqCst);
        self.guard.take();
        core::mem::forget(self);
    }
}

impl<T: ?Sized> Drop for SpinLockGuard<'_, T> {
    fn drop(&mut self) {
        panic!(
            "`.unlock()` must be called before a SpinLockGuard is dropped (locked at {:?})",
            self.caller
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn lock_unlock_roundtrip() {
        let lock = SpinLock::new(0usize);
        {
            let mut g = lock.lock();
            *g += 1;
            g.unlock();
        }
        let g = lock.lock();
        assert_eq!(*g, 1);
        g.unlock();
    }

    #[test]
    fn try_lock_contended() {
        let lock = SpinLock::new(0usize);
        let g1 = lock.lock();
        assert!(lock.try_lock().is_err());
        g1.unlock();
        assert!(lock.try_lock().is_ok());
    }
}
