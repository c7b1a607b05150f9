//! Interrupt masking and interrupt-priority levels.

#[cfg(target_arch = "x86_64")]
use core::arch::asm;

/// Software notion of interrupt priority level (IPL). Raising the IPL masks
/// interrupts at or below the new level on the local CPU; it is the
/// mechanism the TLB shootdown coordinator uses to make its critical
/// section atomic with respect to the local timer and device interrupts.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
#[repr(u8)]
pub enum Ipl {
    /// Normal execution level; all interrupts enabled.
    Passive = 0,
    /// Deferred-procedure-call level, used while coordinating a shootdown.
    Dpc = 1,
    /// Device-interrupt level.
    Device = 2,
    /// Highest level; used only for the cross-CPU IPI handler itself.
    High = 3,
}

/// Whether interrupts are currently enabled on the local CPU.
#[derive(Debug, PartialEq, Eq)]
pub enum InterruptState {
    On,
    Off,
}

impl InterruptState {
    #[cfg(target_arch = "x86_64")]
    pub fn current() -> Self {
        let flags: u64;
        unsafe {
            asm!("pushfq; pop {}", out(reg) flags);
        }
        if flags & (1 << 9) != 0 {
            Self::On
        } else {
            Self::Off
        }
    }

    #[cfg(not(target_arch = "x86_64"))]
    pub fn current() -> Self {
        Self::Off
    }
}

/// An RAII guard that disables interrupts on creation and restores the
/// prior interrupt state on drop.
///
/// Guards must be dropped in reverse order of creation; storing one in a
/// long-lived struct defeats that invariant and is a bug.
pub struct InterruptGuard {
    state: InterruptState,
}

impl InterruptGuard {
    pub fn new() -> Self {
        let state = InterruptState::current();
        // `cli`/`sti` require CPL0; under a hosted unit test there is no
        // real interrupt flag to mask, so only the saved/restored state
        // bookkeeping runs.
        #[cfg(all(target_arch = "x86_64", not(test)))]
        unsafe {
            asm!("cli");
        }
        Self { state }
    }
}

impl Default for InterruptGuard {
    fn default() -> Self {
        Self::new()
    }
}

impl Drop for InterruptGuard {
    fn drop(&mut self) {
        #[cfg(all(target_arch = "x86_64", not(test)))]
        if self.state == InterruptState::On {
            unsafe {
                asm!("sti");
            }
        }
    }
}

/// Raise the local IPL to at least `to`, returning a guard that restores
/// the previous level when dropped. A no-op software model: real hardware
/// masking is layered on top by the platform's interrupt controller driver,
/// which this crate does not own.
pub struct IplGuard {
    prev: Ipl,
}

impl IplGuard {
    pub fn raise(to: Ipl) -> Self {
        let prev = CURRENT_IPL.with(|c| {
            let old = *c;
            if to > old {
                *c = to;
            }
            old
        });
        Self { prev }
    }
}

impl Drop for IplGuard {
    fn drop(&mut self) {
        CURRENT_IPL.with(|c| *c = self.prev);
    }
}

/// Per-CPU current IPL. Modelled with a single cell guarded by an
/// interrupt-disable section since this crate is not itself SMP-aware; the
/// platform layer is expected to supply one instance per CPU in a real
/// build.
struct PerCpuCell(core::cell::Cell<Ipl>);
unsafe impl Sync for PerCpuCell {}

impl PerCpuCell {
    fn with<R>(&self, f: impl FnOnce(&mut Ipl) -> R) -> R {
        let _g = InterruptGuard::new();
        let mut v = self.0.get();
        let r = f(&mut v);
        self.0.set(v);
        r
    }
}

static CURRENT_IPL: PerCpuCell = PerCpuCell(core::cell::Cell::new(Ipl::Passive));
