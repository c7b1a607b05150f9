//! TLB shootdown coordinator (component D): serialize cross-CPU
//! invalidation by sending an inter-processor interrupt to every other
//! online CPU and spinning until each has acknowledged.

use core::sync::atomic::{AtomicUsize, Ordering};
use substrate::{
    interrupt::{Ipl, IplGuard},
    x86_64::Cr3,
    RwLock, SpinLock, Va, PAGE_SIZE,
};

use crate::contracts::Platform;

/// Above this many bytes, a range invalidation is promoted to a full
/// translation-root reload — cheaper than one `invlpg` per page.
const FULL_RELOAD_THRESHOLD: usize = 128 * PAGE_SIZE;

#[derive(Clone, Copy)]
struct Request {
    /// `None` means "full flush" rather than a specific page.
    page: Option<Va>,
    size: usize,
}

/// Process-wide shootdown state: at most one shootdown is ever in flight.
pub struct ShootdownState {
    /// Serializes initiators; held for the whole duration of a shootdown.
    serialize: SpinLock<()>,
    /// The in-flight request, published for every CPU's IPI handler to
    /// read. Readers (the handlers) and the single writer (the initiator)
    /// never contend for more than the instant it takes to publish or
    /// clear it.
    request: RwLock<Option<Request>>,
    /// Number of other online CPUs that have not yet acknowledged the
    /// in-flight request.
    remaining: AtomicUsize,
}

impl ShootdownState {
    pub const fn new() -> Self {
        Self {
            serialize: SpinLock::new(()),
            request: RwLock::new(None),
            remaining: AtomicUsize::new(0),
        }
    }
}

impl Default for ShootdownState {
    fn default() -> Self {
        Self::new()
    }
}

/// Invalidate stale translations for `[page, page + size)` (or the whole
/// address space when `page` is `None`), possibly coordinating a shootdown
/// with every other online CPU.
///
/// A shootdown is only needed when **all** of: the scheduler has started
/// (otherwise no other CPU can be touching a live mapping), two or more
/// CPUs are online, and the range is either kernel space or user space in
/// a process with more than one running thread.
pub fn invalidate_range(
    state: &ShootdownState,
    page: Option<Va>,
    size: usize,
    cr3: Cr3,
    platform: &dyn Platform,
) {
    let in_kernel = page.map(|p| !p.is_user()).unwrap_or(false);
    let needs_userspace_multithread =
        page.map(|p| p.is_user()).unwrap_or(true) && platform.running_threads_sharing(cr3) > 1;
    let in_kernel_or_shared = in_kernel || needs_userspace_multithread;
    let needs_shootdown =
        platform.scheduler_running() && platform.online_cpu_count() >= 2 && in_kernel_or_shared;

    if !needs_shootdown {
        local_invalidate(page, size);
        return;
    }

    let _ipl = IplGuard::raise(Ipl::Dpc);
    let serialize_guard = state.serialize.lock();

    {
        let mut req = state.request.write();
        *req = Some(Request { page, size });
    }
    state
        .remaining
        .store(platform.online_cpu_count() - 1, Ordering::SeqCst);

    platform.send_shootdown_ipi();
    local_invalidate(page, size);

    while state.remaining.load(Ordering::SeqCst) != 0 {
        core::hint::spin_loop();
    }

    {
        let mut req = state.request.write();
        *req = None;
    }
    serialize_guard.unlock();
}

/// Run by every CPU's `0xFE` interrupt entry point. Performs the same
/// local invalidation the initiator performed, then acknowledges.
pub fn handle_shootdown_ipi(state: &ShootdownState) {
    let req = *state.request.read();
    if let Some(req) = req {
        local_invalidate(req.page, req.size);
    }
    state.remaining.fetch_sub(1, Ordering::SeqCst);
}

fn local_invalidate(page: Option<Va>, size: usize) {
    match page {
        None => full_reload(),
        Some(_) if size >= FULL_RELOAD_THRESHOLD => full_reload(),
        Some(start) => {
            let mut addr = start.page_down();
            let end = start + size;
            while addr.into_usize() < end.into_usize() {
                substrate::x86_64::invlpg(addr);
                addr += PAGE_SIZE;
            }
        }
    }
}

fn full_reload() {
    let cr3 = Cr3::current();
    unsafe { cr3.load() };
}

#[cfg(test)]
mod tests {
    use super::*;
    use core::sync::atomic::AtomicUsize as StdAtomicUsize;

    struct FakePlatform {
        online: usize,
        scheduler_running: bool,
        threads_sharing: usize,
        ipi_sent: StdAtomicUsize,
    }

    impl Platform for FakePlatform {
        fn current_cpu(&self) -> usize {
            0
        }
        fn online_cpu_count(&self) -> usize {
            self.online
        }
        fn scheduler_running(&self) -> bool {
            self.scheduler_running
        }
        fn running_threads_sharing(&self, _cr3: Cr3) -> usize {
            self.threads_sharing
        }
        fn recovery_context(&self) -> Option<&dyn crate::contracts::RecoveryContext> {
            None
        }
        fn deliver_segv(&self, _addr: Va) {}
        fn send_shootdown_ipi(&self) {
            self.ipi_sent.fetch_add(1, Ordering::SeqCst);
            // Simulate the one other online CPU immediately running its
            // IPI handler and acknowledging.
            handle_shootdown_ipi(&SHARED);
        }
    }

    static SHARED: ShootdownState = ShootdownState::new();

    #[test]
    fn single_cpu_never_sends_ipi() {
        let platform = FakePlatform {
            online: 1,
            scheduler_running: true,
            threads_sharing: 1,
            ipi_sent: StdAtomicUsize::new(0),
        };
        invalidate_range(&SHARED, Some(Va::ZERO), PAGE_SIZE, Cr3::current(), &platform);
        assert_eq!(platform.ipi_sent.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn shootdown_completes_and_clears_remaining() {
        let platform = FakePlatform {
            online: 2,
            scheduler_running: true,
            threads_sharing: 1,
            ipi_sent: StdAtomicUsize::new(0),
        };
        // Kernel-space page: eligible regardless of thread-sharing.
        let kernel_page = Va::new(0xffff_8000_0010_0000).unwrap();
        invalidate_range(&SHARED, Some(kernel_page), PAGE_SIZE, Cr3::current(), &platform);
        assert_eq!(platform.ipi_sent.load(Ordering::SeqCst), 1);
        assert_eq!(SHARED.remaining.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn scheduler_not_running_skips_shootdown() {
        let platform = FakePlatform {
            online: 4,
            scheduler_running: false,
            threads_sharing: 1,
            ipi_sent: StdAtomicUsize::new(0),
        };
        invalidate_range(&SHARED, None, 0, Cr3::current(), &platform);
        assert_eq!(platform.ipi_sent.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn full_flush_single_thread_skips_shootdown() {
        // A full flush (`page == None`) is not unconditionally "kernel
        // space": it only needs a shootdown if the current process has more
        // than one running thread, exactly like an in-range userspace
        // address would.
        let platform = FakePlatform {
            online: 2,
            scheduler_running: true,
            threads_sharing: 1,
            ipi_sent: StdAtomicUsize::new(0),
        };
        invalidate_range(&SHARED, None, 0, Cr3::current(), &platform);
        assert_eq!(platform.ipi_sent.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn full_flush_multithreaded_process_triggers_shootdown() {
        let platform = FakePlatform {
            online: 2,
            scheduler_running: true,
            threads_sharing: 2,
            ipi_sent: StdAtomicUsize::new(0),
        };
        invalidate_range(&SHARED, None, 0, Cr3::current(), &platform);
        assert_eq!(platform.ipi_sent.load(Ordering::SeqCst), 1);
        assert_eq!(SHARED.remaining.load(Ordering::SeqCst), 0);
    }
}
