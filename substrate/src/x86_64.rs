//! Registers and instructions specific to x86_64, used by the page-table
//! walker, the fault handlers, and the TLB shootdown coordinator.

use crate::addressing::{Pa, Va};
use bitflags::bitflags;

#[cfg(target_arch = "x86_64")]
use core::arch::asm;

/// The `CR3` control register: the physical address of the active top-level
/// page table.
#[repr(transparent)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Cr3(pub Pa);

impl Cr3 {
    // `mov cr3` requires CPL0. Outside a `not(test)` x86_64 kernel build —
    // i.e. under a hosted unit test — this reads back whatever was last
    // "loaded" through the matching stub below rather than touching real
    // hardware.
    #[cfg(all(target_arch = "x86_64", not(test)))]
    pub fn current() -> Self {
        let raw: u64;
        unsafe {
            asm!("mov {}, cr3", out(reg) raw);
        }
        Self(Pa(raw as usize & !0xfff))
    }

    #[cfg(any(not(target_arch = "x86_64"), test))]
    pub fn current() -> Self {
        Self(Pa(TEST_CR3.load(core::sync::atomic::Ordering::SeqCst)))
    }

    /// # Safety
    /// `self` must name a well-formed, fully populated top-level page table
    /// whose upper half matches the kernel template, or the next memory
    /// access on this CPU is undefined behavior.
    #[cfg(all(target_arch = "x86_64", not(test)))]
    pub unsafe fn load(self) {
        asm!("mov cr3, {}", in(reg) self.0.into_usize() as u64);
    }

    #[cfg(any(not(target_arch = "x86_64"), test))]
    pub unsafe fn load(self) {
        TEST_CR3.store(self.0.into_usize(), core::sync::atomic::Ordering::SeqCst);
    }
}

#[cfg(any(not(target_arch = "x86_64"), test))]
static TEST_CR3: core::sync::atomic::AtomicUsize = core::sync::atomic::AtomicUsize::new(0);

/// Invalidate the translation cached for a single page on the local CPU.
/// `invlpg` requires CPL0; under a hosted unit test this is a no-op.
#[cfg(all(target_arch = "x86_64", not(test)))]
pub fn invlpg(va: Va) {
    unsafe {
        asm!("invlpg [{}]", in(reg) va.into_usize());
    }
}

#[cfg(any(not(target_arch = "x86_64"), test))]
pub fn invlpg(_va: Va) {}

bitflags! {
    /// `RFLAGS` bits this crate cares about.
    pub struct Rflags: u64 {
        /// Interrupt enable flag.
        const IF = 1 << 9;
    }
}

impl Rflags {
    #[cfg(target_arch = "x86_64")]
    pub fn read() -> Self {
        let raw: u64;
        unsafe {
            asm!("pushfq; pop {}", out(reg) raw);
        }
        Self::from_bits_truncate(raw)
    }

    #[cfg(not(target_arch = "x86_64"))]
    pub fn read() -> Self {
        Self::IF
    }
}

bitflags! {
    /// Bit layout of the error code x86_64 pushes for `#PF`.
    pub struct PageFaultErrorCode: u64 {
        /// Set: access violated the existing mapping's permissions.
        /// Clear: no translation existed at all.
        const PROTECTION_VIOLATION = 1 << 0;
        /// Set: the faulting access was a write.
        const WRITE = 1 << 1;
        /// Set: the faulting access originated in user mode.
        const USER = 1 << 2;
        /// Set: caused by reserved bits set to 1 in a paging-structure entry.
        const RESERVED_WRITE = 1 << 3;
        /// Set: the fault was an instruction fetch.
        const INSTRUCTION_FETCH = 1 << 4;
    }
}

/// Send an inter-processor interrupt carrying `vector` to every online CPU
/// other than the sender. The actual programmable-interrupt-controller
/// write is architecture- and platform-specific and is supplied by the
/// embedding platform through [`crate::dev::InterProcessorInterrupt`].
pub const TLB_SHOOTDOWN_VECTOR: u8 = 0xFE;
