//! Software model of a paging architecture, used by tests and host builds.
//!
//! The model is a scale copy of x86_64:
//! - 256-byte pages (8-bit page offset)
//! - 3 levels of page tables with 4-bit indexes (16 entries each)
//! - 4 KiB large pages at level 1
//! - 20-bit canonical virtual addresses and 20-bit physical addresses
//!
//! Small enough that a test can hold all of "physical memory" in a few hundred
//! kilobytes, large enough for every page-table edge case to show up.

mod entry;
mod flags;
mod memory;

pub use entry::PageEntry;
pub use flags::PageFlags;
pub use memory::EmulatedMemory;

use crate::PhysicalAddress;

pub const MAX_PHYSICAL_BITS: usize = 20;
pub const MAX_VIRTUAL_BITS: usize = 20;

pub const PAGE_SHIFT: usize = 8;
pub const PAGE_SIZE: usize = 1 << PAGE_SHIFT;

/// Bits of virtual address consumed by each table level.
pub const INDEX_BITS: usize = 4;
pub const ENTRY_COUNT: usize = 1 << INDEX_BITS;
pub const PAGE_TABLE_LEVELS: usize = 3;

/// Number of levels whose entries may map a page directly (small and large).
pub const PAGE_SIZES: usize = 2;
pub const HUGE_PAGE_SIZE: usize = PAGE_SIZE << INDEX_BITS;

/// Free extents of `2^PAGE_RANGES_MAX_ORDER` pages or more go to the huge set.
pub const PAGE_RANGES_MAX_ORDER: usize = 6;

pub const LOWER_VMA_LIMIT: usize = 0;
pub const UPPER_VMA_LIMIT: usize = 0x8_0000;
pub const MMAP_BASE: usize = 0x1_0000;

pub const MIN_EMERGENCY_POOL: usize = 2 * HUGE_PAGE_SIZE;

const VIRTUAL_MASK: usize = (1 << MAX_VIRTUAL_BITS) - 1;
const SIGN_BIT: usize = 1 << (MAX_VIRTUAL_BITS - 1);

/// Returns the page table index for `address` at `level`.
///
/// - Level 0: bits 8-11
/// - Level 1: bits 12-15
/// - Level 2: bits 16-19
#[inline]
pub const fn page_index(address: usize, level: usize) -> usize {
    assert!(level < PAGE_TABLE_LEVELS, "level out of range for software emulation (0-2)");
    (address >> (PAGE_SHIFT + level * INDEX_BITS)) & (ENTRY_COUNT - 1)
}

#[inline]
pub const fn validate_physical(addr: usize) -> bool {
    addr >> MAX_PHYSICAL_BITS == 0
}

/// Virtual addresses must have bits 20-63 equal to bit 19.
#[inline]
pub const fn validate_virtual(addr: usize) -> bool {
    canonicalize_virtual(addr) == addr
}

#[inline]
pub const fn canonicalize_virtual(addr: usize) -> usize {
    if addr & SIGN_BIT != 0 {
        addr | !VIRTUAL_MASK
    } else {
        addr & VIRTUAL_MASK
    }
}

/// The emulated MMU has no TLB.
#[inline]
pub fn flush_tlb_all() {}

/// Installs `root` as the active page table. Nothing to load under emulation.
///
/// # Safety
///
/// Always safe here; the signature matches the hardware backend.
pub unsafe fn activate(root: PhysicalAddress) {
    log::trace!("emulated page table root is now {}", root);
}
