//! The address-space object (component B): one top-level table, a private
//! lower half, and a borrowed reference to the process-wide kernel
//! template's upper half.

use substrate::{x86_64::Cr3, Pa, Va, PAGE_SIZE};

use crate::{
    contracts::PhysicalFrameAllocator,
    error::KernelError,
    mm::page_table::{self, Depth, Entry, PtFlags, Table, KBASE},
};

/// Permission and attribute bits a caller asks for on a leaf mapping. A
/// subset of [`PtFlags`] that excludes bits the walker itself manages.
pub type Permission = PtFlags;

/// One contiguous, page-aligned span of boot-time physical memory that the
/// kernel template direct-maps up front: Limine's usable,
/// bootloader-reclaimable, kernel-and-modules, and framebuffer regions.
/// Everything else (reserved, ACPI, bad memory) is never passed here and
/// stays unmapped.
#[derive(Clone, Copy)]
pub struct DirectMapRegion {
    pub base: Pa,
    pub len: usize,
}

/// One contiguous range of the running kernel image — `.text`, `.rodata`,
/// or `.data` — mapped at its linked virtual address with its own
/// permissions rather than folded into the direct map.
#[derive(Clone, Copy)]
pub struct KernelSection {
    pub virt_base: Va,
    pub phys_base: Pa,
    pub len: usize,
    pub flags: Permission,
}

/// Everything [`init_kernel_template`] needs from the bootloader and the
/// linked kernel image. Kept as a trait, in the same spirit as
/// [`crate::contracts::Platform`], so this crate never depends on a
/// concrete boot protocol.
pub trait BootInfo {
    /// Regions to direct-map `PRESENT | WRITABLE | NO_EXECUTE` before the
    /// kernel image itself is mapped.
    fn direct_map_regions(&self) -> &[DirectMapRegion];
    /// The kernel image's own sections, mapped after the direct map so
    /// their tighter permissions are never shadowed by it.
    fn kernel_sections(&self) -> &[KernelSection];
}

/// Build the process-wide kernel template from the boot memory map and the
/// kernel image's section list: direct-map every region `BootInfo` reports,
/// then lay the kernel's own sections on top with their own permissions.
/// Called once, at boot, before any [`AddressSpace`] exists to race with
/// the table this allocates.
pub fn init_kernel_template(
    boot: &dyn BootInfo,
    alloc: &dyn PhysicalFrameAllocator,
) -> Result<KernelTemplate, KernelError> {
    let top = alloc.alloc_frame().ok_or(KernelError::OutOfMemory)?;
    let table = unsafe { top.into_kva().as_mut::<Table>() };
    *table = Table::zeroed();

    let direct_map_flags = PtFlags::PRESENT | PtFlags::WRITABLE | PtFlags::NO_EXECUTE;
    for region in boot.direct_map_regions() {
        let mut off = 0;
        while off < region.len {
            let pa = region.base + off;
            let va = pa.into_kva().into_va();
            unsafe { page_table::put(top, va, Entry::new(pa, direct_map_flags), Depth::Leaf, alloc)? };
            off += PAGE_SIZE;
        }
    }

    for section in boot.kernel_sections() {
        let mut off = 0;
        while off < section.len {
            let pa = section.phys_base + off;
            let va = section.virt_base + off;
            let entry = Entry::new(pa, section.flags | PtFlags::PRESENT);
            unsafe { page_table::put(top, va, entry, Depth::Leaf, alloc)? };
            off += PAGE_SIZE;
        }
    }

    Ok(KernelTemplate { top })
}

/// The process-wide kernel template: a page table whose lower half is
/// empty and whose upper half is shared, read-only, by every address
/// space. Built once at MMU initialization by [`init_kernel_template`] and
/// never mutated afterward.
pub struct KernelTemplate {
    top: Pa,
}

impl KernelTemplate {
    /// Wrap an already-populated top-level table as the kernel template.
    /// `top`'s lower half is expected to be zero; this is not re-checked
    /// here because construction happens once, at boot, before any address
    /// space exists to race with it.
    pub fn from_populated(top: Pa) -> Self {
        Self { top }
    }

    pub fn pa(&self) -> Pa {
        self.top
    }
}

/// One process's (or the kernel's own) virtual address space.
pub struct AddressSpace {
    top: Pa,
}

impl AddressSpace {
    /// Allocate a fresh top-level table, zero its lower half, and copy the
    /// template's upper half entry-for-entry so every address space shares
    /// the exact same kernel mappings (tested by property 3: entry 256 of
    /// any two address spaces compares equal).
    pub fn new(
        template: &KernelTemplate,
        alloc: &dyn PhysicalFrameAllocator,
    ) -> Result<Self, KernelError> {
        let top = alloc.alloc_frame().ok_or(KernelError::OutOfMemory)?;
        let table = unsafe { top.into_kva().as_mut::<Table>() };
        *table = Table::zeroed();
        let template_table = unsafe { template.pa().into_kva().as_ref::<Table>() };
        for i in KBASE..512 {
            table[i] = template_table[i];
        }
        page_table::zero_lower_half(table);
        Ok(Self { top })
    }

    pub fn pa(&self) -> Pa {
        self.top
    }

    /// Free every frame this address space exclusively owns (its lower
    /// half). The upper half belongs to the kernel template and survives.
    ///
    /// # Safety
    /// No CPU may have this address space loaded, and no other reference
    /// to it may be live, when this is called.
    pub unsafe fn destroy(self, alloc: &dyn PhysicalFrameAllocator) {
        unsafe { page_table::destroy(self.top, alloc) };
        core::mem::forget(self);
    }

    /// Install `pa | flags` as the leaf mapping for `va`, allocating
    /// intermediate tables as needed.
    pub fn map(
        &self,
        pa: Pa,
        va: Va,
        flags: Permission,
        alloc: &dyn PhysicalFrameAllocator,
    ) -> Result<(), KernelError> {
        if !pa.is_page_aligned() || va.offset() != 0 {
            return Err(KernelError::InvalidArgument);
        }
        let entry = Entry::new(pa, flags | PtFlags::PRESENT);
        unsafe { page_table::put(self.top, va, entry, Depth::Leaf, alloc) }
    }

    /// Clear the leaf mapping for `va`, if one is present. A no-op on an
    /// already-absent mapping.
    pub fn unmap(&self, va: Va) {
        if let Some(leaf) = unsafe { page_table::get(self.top, va) } {
            unsafe { *leaf = Entry::ZERO };
        }
    }

    /// Update the flags (and, unless `keep_pa`, the physical address) of
    /// an already-present leaf mapping.
    pub fn remap(
        &self,
        va: Va,
        pa: Option<Pa>,
        flags: Permission,
    ) -> Result<(), KernelError> {
        let leaf = unsafe { page_table::get(self.top, va) }.ok_or(KernelError::NotFound)?;
        let current = unsafe { *leaf };
        let target_pa = match pa {
            Some(p) => p,
            None => current.pa().ok_or(KernelError::NotFound)?,
        };
        unsafe { *leaf = Entry::new(target_pa, flags | PtFlags::PRESENT) };
        Ok(())
    }

    pub fn getphys(&self, va: Va) -> Option<Pa> {
        unsafe { page_table::get(self.top, va) }.and_then(|e| unsafe { (*e).pa() })
    }

    pub fn ispresent(&self, va: Va) -> bool {
        unsafe { page_table::get(self.top, va) }
            .map(|e| unsafe { (*e).is_present() })
            .unwrap_or(false)
    }

    pub fn iswritable(&self, va: Va) -> bool {
        self.getflags(va)
            .map(|f| f.contains(PtFlags::WRITABLE))
            .unwrap_or(false)
    }

    pub fn isdirty(&self, va: Va) -> bool {
        self.getflags(va)
            .map(|f| f.contains(PtFlags::DIRTY))
            .unwrap_or(false)
    }

    pub fn getflags(&self, va: Va) -> Option<PtFlags> {
        unsafe { page_table::get(self.top, va) }
            .map(|e| unsafe { (*e).flags() })
            .filter(|_| self.ispresent(va))
    }

    /// Install this address space into the current CPU's translation base
    /// register.
    ///
    /// # Safety
    /// Every mapping this address space's lower half contains must remain
    /// valid (point at live, correctly typed memory) for as long as it
    /// stays loaded.
    pub unsafe fn switch(&self) {
        unsafe { Cr3(self.top).load() };
    }
}
