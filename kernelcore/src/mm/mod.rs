//! The architectural memory-management unit: page tables (component A),
//! address spaces (component B), fault handling (component C), and TLB
//! shootdown (component D).

pub mod address_space;
pub mod fault;
pub mod page_table;
pub mod tlb;

pub use address_space::{
    init_kernel_template, AddressSpace, BootInfo, DirectMapRegion, KernelSection, KernelTemplate,
    Permission,
};
pub use fault::{handle_general_protection_fault, handle_page_fault, FaultOutcome};
pub use tlb::{invalidate_range, ShootdownState};
