//! Boot-time physical memory map.
//!
//! Implement [`BootMemoryRegion`] on the bootloader's memory map entry type and
//! pass the entries to [`Vm::new`](crate::Vm::new):
//!
//! ```ignore
//! impl BootMemoryRegion for MyBootEntry {
//!     fn base(&self) -> PhysicalAddress { /* ... */ }
//!     fn size(&self) -> usize { /* ... */ }
//!     fn is_usable(&self) -> bool { /* ... */ }
//! }
//! ```

use alloc::vec::Vec;

use crate::address::{AddrRange, align_down, align_up};
use crate::{PhysicalAddress, arch};

/// A single entry of the boot memory map.
pub trait BootMemoryRegion {
    fn base(&self) -> PhysicalAddress;

    fn size(&self) -> usize;

    /// Reserved, ACPI and device memory is not usable.
    fn is_usable(&self) -> bool;
}

/// Page-aligned usable extents of the boot map, sorted and disjoint.
///
/// Reserved entries punch holes in usable ones, and page 0 is never usable: a
/// zero physical address would be indistinguishable from an empty page table
/// entry.
pub(crate) fn usable_extents<R: BootMemoryRegion>(boot_map: &[R]) -> Vec<AddrRange> {
    let mut extents: Vec<AddrRange> = boot_map
        .iter()
        .filter(|region| region.is_usable())
        .filter_map(|region| {
            let base = region.base().as_usize();
            let start = align_up(base.max(arch::PAGE_SIZE), arch::PAGE_SIZE);
            let end = align_down(base + region.size(), arch::PAGE_SIZE);
            (start < end).then(|| AddrRange::new(start, end))
        })
        .collect();

    for reserved in boot_map.iter().filter(|region| !region.is_usable()) {
        let base = reserved.base().as_usize();
        let hole = AddrRange::new(
            align_down(base, arch::PAGE_SIZE),
            align_up(base + reserved.size(), arch::PAGE_SIZE),
        );
        extents = extents
            .into_iter()
            .flat_map(|extent| punch(extent, hole))
            .collect();
    }

    extents.sort_by_key(|extent| extent.start());
    let mut merged: Vec<AddrRange> = Vec::with_capacity(extents.len());
    for extent in extents {
        match merged.last_mut() {
            Some(last) if last.end() >= extent.start() => {
                *last = AddrRange::new(last.start(), last.end().max(extent.end()));
            }
            _ => merged.push(extent),
        }
    }
    merged
}

fn punch(extent: AddrRange, hole: AddrRange) -> impl Iterator<Item = AddrRange> {
    let pieces = if extent.intersects(&hole) {
        [
            AddrRange::new(extent.start(), hole.start().clamp(extent.start(), extent.end())),
            AddrRange::new(hole.end().clamp(extent.start(), extent.end()), extent.end()),
        ]
    } else {
        [extent, AddrRange::new(extent.end(), extent.end())]
    };
    pieces.into_iter().filter(|piece| !piece.is_empty())
}
