//! Traits describing everything this crate treats as an external
//! collaborator: the physical-page allocator, the virtual-memory-mapping
//! manager, the scheduler/SMP platform, user-copy fault recovery, and the
//! thread parking primitive the blocking [`crate::sync::Mutex`] rides on.
//!
//! None of these are implemented here. The MMU and filesystem components
//! are generic (or depend on `dyn` objects) over these contracts so that a
//! concrete kernel can supply its own PMM, scheduler, and block device
//! without this crate knowing anything about them.

use bitflags::bitflags;
use substrate::{Pa, Va};

bitflags! {
    /// The kind of access that faulted, decoded from the architectural
    /// error code into something the VMM understands.
    pub struct FaultAction: u8 {
        const READ = 1 << 0;
        const WRITE = 1 << 1;
        const EXECUTE = 1 << 2;
    }
}

/// The physical-page allocator. Frames are always `PAGE_SIZE`-aligned and
/// zero-filled by... nobody: callers that need zeroed memory (every
/// intermediate page-table level) zero it themselves after allocation,
/// matching the page-table walker's invariant that it, not the allocator,
/// is responsible for the zero-fill.
pub trait PhysicalFrameAllocator: Send + Sync {
    /// Allocate one physical frame. Returns `None` when frames are
    /// exhausted.
    fn alloc_frame(&self) -> Option<Pa>;
    /// Return a frame previously returned by `alloc_frame` to the pool.
    ///
    /// # Safety
    /// `pa` must not be reachable through any live mapping after this call.
    unsafe fn free_frame(&self, pa: Pa);
}

/// The virtual-memory-mapping manager consulted by the page-fault handler
/// before giving up and escalating to recovery/signal/panic.
pub trait VirtualMemoryManager: Send + Sync {
    /// Attempt to satisfy a fault at `addr`. `from_user` is true when the
    /// faulting instruction ran in user mode. Returns `Ok(())` if the
    /// fault was resolved (e.g. a lazily-backed mapping was populated) and
    /// the faulting instruction may be retried.
    fn page_fault(
        &self,
        addr: Va,
        from_user: bool,
        action: FaultAction,
    ) -> Result<(), crate::error::KernelError>;
}

/// A saved recovery context for a single in-progress user-memory access.
/// Installed by kernel code before touching user memory it does not fully
/// trust; consulted by the fault handlers on the next `#PF`/`#GP` taken on
/// this CPU.
pub trait RecoveryContext {
    /// The trap-frame program counter and stack pointer to restore the
    /// faulting frame to, so that control resumes in the installer's
    /// recovery path instead of re-faulting at the original instruction.
    fn recovery_target(&self) -> (usize, usize);
}

/// SMP- and scheduler-facing queries the TLB shootdown coordinator and the
/// fault handlers need but do not themselves own.
pub trait Platform: Send + Sync {
    /// Index of the CPU executing the call, in `0..online_cpu_count()`.
    fn current_cpu(&self) -> usize;
    /// Number of CPUs currently participating in scheduling.
    fn online_cpu_count(&self) -> usize;
    /// Whether the scheduler has started running threads yet. Shootdowns
    /// before this point never need cross-CPU coordination: no other CPU
    /// can be touching user address spaces.
    fn scheduler_running(&self) -> bool;
    /// Number of threads currently runnable or running in the process that
    /// owns `cr3`, or `1` if `cr3` does not belong to a user process.
    fn running_threads_sharing(&self, cr3: substrate::x86_64::Cr3) -> usize;
    /// Currently installed recovery context for the calling thread, if the
    /// thread registered one before a user-memory access.
    fn recovery_context(&self) -> Option<&dyn RecoveryContext>;
    /// Deliver a segmentation-violation signal to the current thread after
    /// a user-mode fault the VMM could not satisfy.
    fn deliver_segv(&self, addr: Va);
    /// Send the TLB-shootdown IPI to every other online CPU.
    fn send_shootdown_ipi(&self);
}

/// The thread-parking primitive a blocking [`crate::sync::Mutex`] uses to
/// put a waiter to sleep and later wake it, instead of spinning.
pub trait Parker: Send + Sync {
    /// An opaque handle identifying a parked waiter, used to wake it later.
    type Handle: Send;
    /// Park the calling thread. `before_sleep` runs after the thread is
    /// marked parked but before control is actually yielded, so the caller
    /// can publish `Self::Handle` somewhere a waker will find it without
    /// racing a wakeup that arrives before the thread is actually asleep.
    fn park_with(&self, before_sleep: &mut dyn FnMut(Self::Handle));
    /// Wake a thread parked via `park_with`.
    fn wake(&self, handle: Self::Handle);
}
