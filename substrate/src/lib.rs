//! Low-level x86_64 primitives shared by the memory manager and the
//! filesystem core.
//!
//! This crate has no notion of scheduling, filesystems, or virtual memory
//! policy. It only wraps the hardware: physical/virtual address newtypes,
//! the interrupt-disable guard, a spinning mutual-exclusion primitive, and
//! the handful of control registers and instructions the upper layers need
//! to drive the MMU and talk to a block device.
#![cfg_attr(not(test), no_std)]
#![feature(negative_impls)]
#![allow(clippy::missing_safety_doc)]

extern crate alloc;

pub mod addressing;
pub mod dev;
pub mod interrupt;
pub mod rwlock;
pub mod spinlock;
pub mod x86_64;

pub use addressing::{Kva, Pa, Va, PAGE_MASK, PAGE_SHIFT, PAGE_SIZE};
pub use dev::{BlockOps, Sector};
pub use interrupt::InterruptGuard;
pub use rwlock::RwLock;
pub use spinlock::{SpinLock, SpinLockGuard, WouldBlock};

/// Maximum number of CPUs this build supports.
pub const MAX_CPU: usize = 4;
