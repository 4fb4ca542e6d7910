//! x86_64 paging definitions.
//!
//! 4-level paging with 4 KiB base pages and 2 MiB large pages at level 1.
//! 1 GiB pages are never created.

mod entry;
mod flags;

pub use entry::PageEntry;
pub use flags::PageFlags;

use ::x86_64::{
    PhysAddr,
    registers::control::{Cr3, Cr3Flags},
    structures::paging::PhysFrame,
};

use crate::PhysicalAddress;

/// Conservative physical address width; most CPUs report 46 to 52 bits.
pub const MAX_PHYSICAL_BITS: usize = 48;
pub const MAX_VIRTUAL_BITS: usize = 48;

pub const PAGE_SHIFT: usize = 12;
pub const PAGE_SIZE: usize = 1 << PAGE_SHIFT;

pub const INDEX_BITS: usize = 9;
pub const ENTRY_COUNT: usize = 1 << INDEX_BITS;
pub const PAGE_TABLE_LEVELS: usize = 4;

pub const PAGE_SIZES: usize = 2;
pub const HUGE_PAGE_SIZE: usize = PAGE_SIZE << INDEX_BITS;

pub const PAGE_RANGES_MAX_ORDER: usize = 16;

pub const LOWER_VMA_LIMIT: usize = 0;
pub const UPPER_VMA_LIMIT: usize = 0x4000_0000_0000;
pub const MMAP_BASE: usize = 0x2000_0000_0000;

pub const MIN_EMERGENCY_POOL: usize = 4 << 20;

/// Returns the page table index for `address` at `level`.
///
/// Level 0 is the PT, level 1 the PD, level 2 the PDPT and level 3 the PML4.
#[inline]
pub const fn page_index(address: usize, level: usize) -> usize {
    assert!(level < PAGE_TABLE_LEVELS, "level out of range for x86_64 page table levels");
    (address >> (PAGE_SHIFT + level * INDEX_BITS)) & (ENTRY_COUNT - 1)
}

#[inline]
pub const fn validate_physical(addr: usize) -> bool {
    addr >> MAX_PHYSICAL_BITS == 0
}

/// Bits 48-63 must be copies of bit 47.
#[inline]
pub const fn validate_virtual(addr: usize) -> bool {
    canonicalize_virtual(addr) == addr
}

#[inline]
pub const fn canonicalize_virtual(addr: usize) -> usize {
    if (addr & (1 << 47)) != 0 {
        addr | 0xFFFF_0000_0000_0000
    } else {
        addr & 0x0000_FFFF_FFFF_FFFF
    }
}

#[inline]
pub fn flush_tlb_all() {
    ::x86_64::instructions::tlb::flush_all();
}

/// Loads `root` into CR3.
///
/// # Safety
///
/// `root` must be a valid PML4 that maps the running kernel, its stacks and the
/// direct map.
pub unsafe fn activate(root: PhysicalAddress) {
    let frame = PhysFrame::containing_address(PhysAddr::new(root.as_usize() as u64));
    // SAFETY: upheld by the caller.
    unsafe {
        Cr3::write(frame, Cr3Flags::empty());
    }
}
