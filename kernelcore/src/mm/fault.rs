//! Fault handlers (component C): turn an architectural page-fault or
//! general-protection-fault trap into a VMM call, a user-copy recovery, a
//! delivered signal, or a kernel panic.

use substrate::{x86_64::PageFaultErrorCode, Va};

use crate::contracts::{FaultAction, Platform, VirtualMemoryManager};

/// What the caller (the architecture's trap entry point) should do once a
/// fault handler returns.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FaultOutcome {
    /// The VMM satisfied the fault; retry the faulting instruction.
    Retry,
    /// A recovery context was installed; the trap frame has been rewritten
    /// to resume there instead of at the faulting instruction, with
    /// `EFAULT` left in the return-value register.
    Recovered,
    /// A SIGSEGV-equivalent was posted to the current (user-mode) thread.
    SignalDelivered,
}

/// Decode an x86_64 `#PF` error code into the VMM's action vocabulary. The
/// three bits are independent, not mutually exclusive: a protection
/// violation on a write still carries both `READ` and `WRITE`.
fn decode_action(code: PageFaultErrorCode) -> FaultAction {
    let mut action = FaultAction::empty();
    if code.contains(PageFaultErrorCode::PROTECTION_VIOLATION) {
        action |= FaultAction::READ;
    }
    if code.contains(PageFaultErrorCode::WRITE) {
        action |= FaultAction::WRITE;
    }
    if code.contains(PageFaultErrorCode::INSTRUCTION_FETCH) {
        action |= FaultAction::EXECUTE;
    }
    action
}

/// Handle an architectural page fault at `addr`. Both fault handlers must
/// enable interrupts before doing any long-running work (consulting the
/// VMM may block on the backing device); that is the caller's
/// responsibility at the trap entry point, before this function is called.
pub fn handle_page_fault(
    addr: Va,
    error_code: PageFaultErrorCode,
    platform: &dyn Platform,
    vmm: &dyn VirtualMemoryManager,
) -> FaultOutcome {
    let from_user = error_code.contains(PageFaultErrorCode::USER);
    let action = decode_action(error_code);
    if vmm.page_fault(addr, from_user, action).is_ok() {
        return FaultOutcome::Retry;
    }
    fault_escalation(addr, from_user, platform)
}

/// Handle an architectural general-protection fault. Unlike `#PF`, the VMM
/// is never consulted: a `#GP` never represents a missing-but-satisfiable
/// mapping.
pub fn handle_general_protection_fault(addr: Va, from_user: bool, platform: &dyn Platform) -> FaultOutcome {
    fault_escalation(addr, from_user, platform)
}

fn fault_escalation(addr: Va, from_user: bool, platform: &dyn Platform) -> FaultOutcome {
    if platform.recovery_context().is_some() {
        // The caller's trap entry point performs the actual trap-frame
        // rewrite using the context's `recovery_target`; from here we only
        // report that a recovery context was present.
        FaultOutcome::Recovered
    } else if from_user {
        platform.deliver_segv(addr);
        FaultOutcome::SignalDelivered
    } else {
        panic!("unhandled kernel-mode fault at {addr:?}");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use core::cell::Cell;

    struct FakeVmm {
        satisfies: bool,
    }
    impl VirtualMemoryManager for FakeVmm {
        fn page_fault(
            &self,
            _addr: Va,
            _from_user: bool,
            _action: FaultAction,
        ) -> Result<(), crate::error::KernelError> {
            if self.satisfies {
                Ok(())
            } else {
                Err(crate::error::KernelError::Fault)
            }
        }
    }

    struct FakePlatform {
        has_recovery: bool,
        segv_delivered: Cell<bool>,
    }
    impl Platform for FakePlatform {
        fn current_cpu(&self) -> usize {
            0
        }
        fn online_cpu_count(&self) -> usize {
            1
        }
        fn scheduler_running(&self) -> bool {
            true
        }
        fn running_threads_sharing(&self, _cr3: substrate::x86_64::Cr3) -> usize {
            1
        }
        fn recovery_context(&self) -> Option<&dyn crate::contracts::RecoveryContext> {
            if self.has_recovery {
                struct Dummy;
                impl crate::contracts::RecoveryContext for Dummy {
                    fn recovery_target(&self) -> (usize, usize) {
                        (0, 0)
                    }
                }
                static DUMMY: Dummy = Dummy;
                Some(&DUMMY)
            } else {
                None
            }
        }
        fn deliver_segv(&self, _addr: Va) {
            self.segv_delivered.set(true);
        }
        fn send_shootdown_ipi(&self) {}
    }

    #[test]
    fn decode_action_not_present_read_carries_no_flags() {
        // Neither PROTECTION_VIOLATION nor WRITE set: a not-present read
        // fault, which must decode to no read/write flags at all.
        assert_eq!(decode_action(PageFaultErrorCode::USER), FaultAction::empty());
    }

    #[test]
    fn decode_action_protection_violation_write_carries_both() {
        // Bit 0 and bit 1 both set: the bits are independent, so a
        // protection-violation write still carries READ alongside WRITE.
        let code = PageFaultErrorCode::PROTECTION_VIOLATION | PageFaultErrorCode::WRITE;
        assert_eq!(
            decode_action(code),
            FaultAction::READ | FaultAction::WRITE
        );
    }

    #[test]
    fn decode_action_instruction_fetch_sets_execute() {
        let code = PageFaultErrorCode::INSTRUCTION_FETCH;
        assert_eq!(decode_action(code), FaultAction::EXECUTE);
    }

    #[test]
    fn vmm_success_retries() {
        let platform = FakePlatform {
            has_recovery: false,
            segv_delivered: Cell::new(false),
        };
        let vmm = FakeVmm { satisfies: true };
        let outcome = handle_page_fault(
            Va::ZERO,
            PageFaultErrorCode::USER,
            &platform,
            &vmm,
        );
        assert_eq!(outcome, FaultOutcome::Retry);
    }

    #[test]
    fn user_fault_without_recovery_signals() {
        let platform = FakePlatform {
            has_recovery: false,
            segv_delivered: Cell::new(false),
        };
        let vmm = FakeVmm { satisfies: false };
        let outcome = handle_page_fault(
            Va::ZERO,
            PageFaultErrorCode::USER | PageFaultErrorCode::WRITE,
            &platform,
            &vmm,
        );
        assert_eq!(outcome, FaultOutcome::SignalDelivered);
        assert!(platform.segv_delivered.get());
    }

    #[test]
    fn fault_with_recovery_context_recovers() {
        let platform = FakePlatform {
            has_recovery: true,
            segv_delivered: Cell::new(false),
        };
        let vmm = FakeVmm { satisfies: false };
        let outcome = handle_page_fault(Va::ZERO, PageFaultErrorCode::USER, &platform, &vmm);
        assert_eq!(outcome, FaultOutcome::Recovered);
        assert!(!platform.segv_delivered.get());
    }
}
