//! Address lookups that do not take the VMA registry lock.
//!
//! Every VMA and every linear mapping has an entry here. The registry keeps it
//! in step after each change, so a fault handler or a diagnostic can find what
//! owns an address while a writer holds the registry.

use alloc::collections::BTreeMap;
use alloc::string::String;
use core::fmt;

use spin::RwLock;

use crate::address::AddrRange;
use crate::vma::{MmapFlags, Perm, VmaList};
use crate::PhysicalAddress;

/// Memory attribute of a linear mapping.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MemAttr {
    Normal,
    Device,
}

impl MemAttr {
    fn letter(self) -> char {
        match self {
            MemAttr::Normal => 'n',
            MemAttr::Device => 'd',
        }
    }
}

/// A fixed virtual to physical mapping made with
/// [`Vm::linear_map`](crate::Vm::linear_map).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LinearMapping {
    pub virt: usize,
    pub phys: PhysicalAddress,
    pub size: usize,
    pub name: String,
    pub attr: MemAttr,
}

impl fmt::Display for LinearMapping {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let virt = alloc::format!("{:#x}", self.virt);
        let phys = alloc::format!("{:#x}", self.phys.as_usize());
        write!(
            f,
            "{:>18} {:>18} {:>12x} rwxp {} {}",
            virt,
            phys,
            self.size,
            self.attr.letter(),
            self.name
        )
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RangeOwner {
    Vma { perm: Perm, flags: MmapFlags },
    Linear { name: String },
}

/// What [`Vm::find_range`](crate::Vm::find_range) reports.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RangeEntry {
    pub range: AddrRange,
    pub owner: RangeOwner,
}

pub(crate) struct RangeIndex {
    entries: RwLock<BTreeMap<usize, RangeEntry>>,
}

impl RangeIndex {
    pub fn new() -> Self {
        Self {
            entries: RwLock::new(BTreeMap::new()),
        }
    }

    pub fn find(&self, addr: usize) -> Option<RangeEntry> {
        self.entries
            .read()
            .range(..=addr)
            .next_back()
            .map(|(_, entry)| entry)
            .filter(|entry| entry.range.contains(addr))
            .cloned()
    }

    pub fn insert_linear(&self, mapping: &LinearMapping) {
        let entry = RangeEntry {
            range: AddrRange::new(mapping.virt, mapping.virt + mapping.size),
            owner: RangeOwner::Linear { name: mapping.name.clone() },
        };
        self.entries.write().insert(mapping.virt, entry);
    }

    /// Replaces the VMA entries within `hull` by those of `vmas`.
    pub fn resync(&self, vmas: &VmaList, hull: AddrRange) {
        let mut entries = self.entries.write();
        entries.retain(|_, entry| {
            !(matches!(entry.owner, RangeOwner::Vma { .. }) && entry.range.intersects(&hull))
        });
        for vma in vmas.intersecting(hull) {
            let entry = RangeEntry {
                range: vma.range,
                owner: RangeOwner::Vma {
                    perm: vma.perm,
                    flags: vma.flags,
                },
            };
            entries.insert(vma.range.start(), entry);
        }
    }

    pub fn len(&self) -> usize {
        self.entries.read().len()
    }
}
