//! The four-level page-table walker (component A).
//!
//! A page table is a 4 KiB frame holding 512 64-bit entries, four levels
//! deep (PML4 -> PDPT -> PD -> PT). Every level uses the same entry layout,
//! so unlike some designs this module does not need four distinct entry
//! types: an intermediate entry and a leaf entry differ only in what the
//! caller does with them. Permission is decided at the leaf; intermediate
//! entries always carry `PRESENT | WRITABLE | USER` so a restrictive leaf
//! is never shadowed by a restrictive parent.

use bitflags::bitflags;
use substrate::{Kva, Pa, Va, PAGE_SIZE};

use crate::{contracts::PhysicalFrameAllocator, error::KernelError};

bitflags! {
    /// The architectural bits this design uses. Matches the x86_64 layout:
    /// bit 0 present, bit 1 writable, bit 2 user, bit 6 dirty, bit 63
    /// no-execute; bits 12..51 carry the frame address.
    pub struct PtFlags: u64 {
        const PRESENT     = 1 << 0;
        const WRITABLE    = 1 << 1;
        const USER        = 1 << 2;
        const DIRTY       = 1 << 6;
        const NO_EXECUTE  = 1 << 63;
    }
}

impl PtFlags {
    /// The bits a leaf entry's flags are allowed to carry; used to check
    /// round-trip equality after `map`/`getflags`.
    pub const FLAG_MASK: u64 = Self::PRESENT.bits()
        | Self::WRITABLE.bits()
        | Self::USER.bits()
        | Self::DIRTY.bits()
        | Self::NO_EXECUTE.bits();
}

const ADDR_MASK: u64 = 0x000f_ffff_ffff_f000;

/// A single page-table entry, at any of the four levels.
#[repr(transparent)]
#[derive(Clone, Copy)]
pub struct Entry(pub u64);

impl Entry {
    pub const ZERO: Entry = Entry(0);

    #[inline]
    pub fn is_present(self) -> bool {
        self.0 & PtFlags::PRESENT.bits() != 0
    }

    #[inline]
    pub fn pa(self) -> Option<Pa> {
        if self.is_present() {
            Pa::new((self.0 & ADDR_MASK) as usize)
        } else {
            None
        }
    }

    #[inline]
    pub fn flags(self) -> PtFlags {
        PtFlags::from_bits_truncate(self.0 & PtFlags::FLAG_MASK)
    }

    #[inline]
    pub fn new(pa: Pa, flags: PtFlags) -> Self {
        debug_assert!(pa.is_page_aligned());
        Entry(pa.into_usize() as u64 | flags.bits())
    }
}

/// A 4 KiB, 512-entry page table at any level.
#[repr(align(4096))]
pub struct Table(pub [Entry; 512]);

impl Table {
    pub fn zeroed() -> Self {
        Table([Entry::ZERO; 512])
    }
}

impl core::ops::Index<usize> for Table {
    type Output = Entry;
    fn index(&self, i: usize) -> &Entry {
        &self.0[i]
    }
}

impl core::ops::IndexMut<usize> for Table {
    fn index_mut(&mut self, i: usize) -> &mut Entry {
        &mut self.0[i]
    }
}

/// Boundary, in PML4 entries, between the lower half (owned exclusively by
/// one address space) and the upper half (shared kernel template). Entries
/// `[0, KBASE)` are private; `[KBASE, 512)` are borrowed.
pub const KBASE: usize = 256;

#[inline]
unsafe fn table_at(pa: Pa) -> &'static mut Table {
    pa.into_kva().as_mut::<Table>()
}

/// Descend from `top` following `va`'s four indices, returning a pointer to
/// the leaf entry. Returns `None` as soon as a zero intermediate entry is
/// found — lookup never allocates and never faults.
///
/// # Safety
/// `top` must be the physical address of a live, fully formed PML4 table.
pub unsafe fn get(top: Pa, va: Va) -> Option<*mut Entry> {
    let idx = va.indices();
    let mut table = unsafe { table_at(top) };
    for level in 0..3 {
        let e = table[idx[level]];
        let next = e.pa()?;
        table = unsafe { table_at(next) };
    }
    Some(&mut table[idx[3]] as *mut Entry)
}

/// How deep to descend before installing `entry`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Depth {
    /// Install at the PDPT slot (leaves a whole PDPT's worth of mapping).
    L3,
    /// Install at the PD slot.
    L2,
    /// Install at the PT slot.
    L1,
    /// Install at the leaf (PT entry) itself. The common case.
    Leaf,
}

impl Depth {
    fn level(self) -> usize {
        match self {
            Depth::L3 => 1,
            Depth::L2 => 2,
            Depth::L1 => 3,
            Depth::Leaf => 3,
        }
    }
}

/// Descend from `top` following `va`, allocating any missing intermediate
/// table along the way, and overwrite the entry at `depth` with `entry`.
///
/// Freshly allocated intermediate frames are zeroed before being linked in,
/// and linked in with `PRESENT | WRITABLE | USER` regardless of the final
/// leaf's permission.
///
/// # Safety
/// `top` must be the physical address of a live, fully formed PML4 table,
/// exclusively owned below [`KBASE`] by the caller (no concurrent
/// `put`/`destroy` on overlapping indices).
pub unsafe fn put(
    top: Pa,
    va: Va,
    entry: Entry,
    depth: Depth,
    alloc: &dyn PhysicalFrameAllocator,
) -> Result<(), KernelError> {
    let idx = va.indices();
    let target_level = depth.level();
    let mut table = unsafe { table_at(top) };
    for level in 0..target_level {
        let cur = table[idx[level]];
        let next_pa = if let Some(pa) = cur.pa() {
            pa
        } else {
            let frame = alloc.alloc_frame().ok_or(KernelError::OutOfMemory)?;
            let fresh = unsafe { table_at(frame) };
            *fresh = Table::zeroed();
            table[idx[level]] = Entry::new(
                frame,
                PtFlags::PRESENT | PtFlags::WRITABLE | PtFlags::USER,
            );
            frame
        };
        table = unsafe { table_at(next_pa) };
    }
    table[idx[target_level]] = entry;
    Ok(())
}

/// Free every intermediate table and leaf frame reachable from `top`'s
/// lower half (`[0, KBASE)`), then free `top` itself. The upper half,
/// shared with every other address space, is never touched.
///
/// # Safety
/// `top` must be the physical address of a live PML4 table with no other
/// live references to its lower-half subtree.
pub unsafe fn destroy(top: Pa, alloc: &dyn PhysicalFrameAllocator) {
    fn walk(pa: Pa, level: usize, alloc: &dyn PhysicalFrameAllocator) {
        if level < 3 {
            let table = unsafe { table_at(pa) };
            for i in 0..512 {
                if let Some(child) = table[i].pa() {
                    walk(child, level + 1, alloc);
                }
            }
        }
        unsafe { alloc.free_frame(pa) };
    }

    let table = unsafe { table_at(top) };
    for i in 0..KBASE {
        if let Some(child) = table[i].pa() {
            walk(child, 1, alloc);
        }
    }
    unsafe { alloc.free_frame(top) };
}

/// Zero-fill a freshly allocated top-level table's lower half, leaving the
/// upper half for the caller to populate from the kernel template. Used by
/// [`crate::mm::address_space::AddressSpace::new`].
pub fn zero_lower_half(top: &mut Table) {
    for i in 0..KBASE {
        top[i] = Entry::ZERO;
    }
}

/// Number of page-table entries a 4 KiB table holds, also the fan-out
/// factor `E` used by the block-address resolver's indirect-block math.
pub const ENTRIES_PER_TABLE: usize = PAGE_SIZE / core::mem::size_of::<u64>();
