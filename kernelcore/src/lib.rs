//! The architecture-independent kernel core: a four-level x86_64 MMU
//! layer ([`mm`]) and an ext2-compatible on-disk filesystem engine
//! ([`fs`]), built on the hardware primitives in `substrate`.
//!
//! Everything this crate cannot own itself — the physical-page allocator,
//! the scheduler, the block device, user-copy fault recovery — is
//! expressed as a trait in [`contracts`] and supplied by the embedding
//! kernel.
#![cfg_attr(not(test), no_std)]
#![allow(clippy::missing_safety_doc)]

extern crate alloc;

pub mod contracts;
pub mod error;
pub mod fs;
pub mod mm;
pub mod sync;

pub use error::{KernelError, Result};
