//! A blocking mutex, layered on [`substrate::SpinLock`] plus a
//! platform-supplied [`Parker`](crate::contracts::Parker).
//!
//! Spinlocks are right for the handful of instructions it takes to flip a
//! page-table entry. The filesystem's five named locks (`root`,
//! `inodetable`, `superblock`, `descriptor`, `inodewrite`) can be held
//! across a block-device transfer, so spinning would burn a CPU for the
//! length of a disk read. [`Mutex`] parks the waiter instead.

use alloc::collections::VecDeque;
use core::ops::{Deref, DerefMut};
use substrate::{SpinLock, SpinLockGuard, WouldBlock};

use crate::contracts::Parker;

/// A mutual-exclusion primitive whose waiters sleep instead of spinning.
///
/// Like [`substrate::SpinLock`], the guard does not release the lock on
/// drop: [`MutexGuard::unlock`] must be called explicitly.
pub struct Mutex<'p, T, P: Parker> {
    parker: &'p P,
    data: SpinLock<T>,
    waiters: SpinLock<VecDeque<P::Handle>>,
}

unsafe impl<T: Send, P: Parker> Send for Mutex<'_, T, P> {}
unsafe impl<T: Send, P: Parker> Sync for Mutex<'_, T, P> {}

impl<'p, T, P: Parker> Mutex<'p, T, P> {
    pub const fn new(parker: &'p P, t: T) -> Self {
        Self {
            parker,
            data: SpinLock::new(t),
            waiters: SpinLock::new(VecDeque::new()),
        }
    }

    /// Block the calling thread until the lock is acquired.
    pub fn lock(&self) -> MutexGuard<'_, 'p, T, P> {
        loop {
            match self.data.try_lock() {
                Ok(guard) => {
                    return MutexGuard {
                        guard: Some(guard),
                        lock: self,
                    };
                }
                Err(WouldBlock) => {
                    self.parker.park_with(&mut |handle| {
                        let mut waiters = self.waiters.lock();
                        waiters.push_back(handle);
                        waiters.unlock();
                    });
                }
            }
        }
    }

    /// Try to acquire the lock without blocking.
    pub fn try_lock(&self) -> Result<MutexGuard<'_, 'p, T, P>, WouldBlock> {
        self.data.try_lock().map(|guard| MutexGuard {
            guard: Some(guard),
            lock: self,
        })
    }

    pub fn into_inner(self) -> T {
        self.data.into_inner()
    }

    fn wake_one(&self) {
        let mut waiters = self.waiters.lock();
        let next = waiters.pop_front();
        waiters.unlock();
        if let Some(handle) = next {
            self.parker.wake(handle);
        }
    }
}

/// A [`Parker`] with no real sleep channel: `park_with` hands the waiter a
/// `()` handle and returns immediately, so [`Mutex::lock`] degenerates into
/// a retry loop. Used where no scheduler is wired in to provide real
/// thread parking, such as the filesystem's named locks running on top of
/// a synchronous block device.
pub struct SpinParker;

impl Parker for SpinParker {
    type Handle = ();

    fn park_with(&self, before_sleep: &mut dyn FnMut(())) {
        before_sleep(());
        core::hint::spin_loop();
    }

    fn wake(&self, _handle: ()) {}
}

/// Shared instance for the common case of a [`Mutex`] with no real parker
/// behind it.
pub static SPIN_PARKER: SpinParker = SpinParker;

/// A [`Mutex`] backed by [`SpinParker`]: blocking in name and API, spinning
/// in practice. This is what the filesystem's five named locks use.
pub type FsMutex<T> = Mutex<'static, T, SpinParker>;

/// Scoped, explicit-unlock access to the data protected by a [`Mutex`].
pub struct MutexGuard<'a, 'p, T, P: Parker> {
    guard: Option<SpinLockGuard<'a, T>>,
    lock: &'a Mutex<'p, T, P>,
}

impl<T, P: Parker> Deref for MutexGuard<'_, '_, T, P> {
    type Target = T;
    fn deref(&self) -> &T {
        self.guard.as_ref().unwrap()
    }
}

impl<T, P: Parker> DerefMut for MutexGuard<'_, '_, T, P> {
    fn deref_mut(&mut self) -> &mut T {
        self.guard.as_mut().unwrap()
    }
}

impl<T, P: Parker> MutexGuard<'_, '_, T, P> {
    pub fn unlock(mut self) {
        let inner = self.guard.take().unwrap();
        inner.unlock();
        self.lock.wake_one();
        core::mem::forget(self);
    }
}

impl<T, P: Parker> Drop for MutexGuard<'_, '_, T, P> {
    fn drop(&mut self) {
        panic!("`.unlock()` must be called before a MutexGuard is dropped");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use core::cell::RefCell;

    struct InlineParker {
        handles: RefCell<VecDeque<u32>>,
        next: RefCell<u32>,
    }

    impl InlineParker {
        fn new() -> Self {
            Self {
                handles: RefCell::new(VecDeque::new()),
                next: RefCell::new(0),
            }
        }
    }

    impl Parker for InlineParker {
        type Handle = u32;
        fn park_with(&self, before_sleep: &mut dyn FnMut(Self::Handle)) {
            let mut next = self.next.borrow_mut();
            let h = *next;
            *next += 1;
            before_sleep(h);
        }
        fn wake(&self, handle: Self::Handle) {
            self.handles.borrow_mut().push_back(handle);
        }
    }

    #[test]
    fn lock_unlock_roundtrip() {
        let parker = InlineParker::new();
        let mutex = Mutex::new(&parker, 0usize);
        let mut g = mutex.lock();
        *g += 1;
        g.unlock();
        let g = mutex.lock();
        assert_eq!(*g, 1);
        g.unlock();
    }

    #[test]
    fn try_lock_contended() {
        let parker = InlineParker::new();
        let mutex = Mutex::new(&parker, 0usize);
        let g1 = mutex.lock();
        assert!(mutex.try_lock().is_err());
        g1.unlock();
        assert!(mutex.try_lock().is_ok());
    }
}
