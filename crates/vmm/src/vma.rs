//! The VMA registry: non-overlapping virtual memory areas in address order.

use alloc::collections::BTreeMap;
use alloc::vec::Vec;
use core::fmt;

use bitflags::bitflags;

use crate::address::{AddrRange, align_up};
use crate::provider::Backing;
use crate::{VmError, arch};

bitflags! {
    /// Access permissions of a mapping.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
    pub struct Perm: u32 {
        const READ = 1 << 0;
        const WRITE = 1 << 1;
        const EXEC = 1 << 2;
    }
}

bitflags! {
    /// Mapping flags, as passed to `mmap` and kept on the VMA.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
    pub struct MmapFlags: u32 {
        const SHARED = 1 << 0;
        const PRIVATE = 1 << 1;
        /// Map exactly at the address, replacing whatever is there.
        const FIXED = 1 << 2;
        /// Map exactly at the address; fail if anything is there.
        const FIXED_NOREPLACE = 1 << 3;
        /// Populate the whole mapping now instead of on first access.
        const POPULATE = 1 << 4;
        /// Anonymous pages need not be zeroed.
        const UNINITIALIZED = 1 << 5;
        /// Never back this mapping with large pages.
        const SMALL = 1 << 6;
        /// Set by the VM on anonymous mappings.
        const ANONYMOUS = 1 << 7;
        /// Set by the VM on file and shared-memory mappings.
        const FILE = 1 << 8;
    }
}

bitflags! {
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct MsyncFlags: u32 {
        const ASYNC = 1 << 0;
        const INVALIDATE = 1 << 1;
        const SYNC = 1 << 2;
    }
}

impl fmt::Display for Perm {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let bit = |perm, c| if self.contains(perm) { c } else { '-' };
        write!(f, "{}{}{}", bit(Perm::READ, 'r'), bit(Perm::WRITE, 'w'), bit(Perm::EXEC, 'x'))
    }
}

/// A virtual memory area: one range with uniform permissions and backing.
#[derive(Clone)]
pub(crate) struct Vma {
    pub range: AddrRange,
    pub perm: Perm,
    pub flags: MmapFlags,
    pub backing: Backing,
}

impl Vma {
    pub fn new(range: AddrRange, perm: Perm, flags: MmapFlags, backing: Backing) -> Self {
        Self { range, perm, flags, backing }
    }

    fn sentinel(at: usize) -> Self {
        Self::new(
            AddrRange::new(at, at),
            Perm::empty(),
            MmapFlags::empty(),
            Backing::Anonymous { zero: true },
        )
    }

    pub fn is_shared(&self) -> bool {
        self.flags.contains(MmapFlags::SHARED)
    }

    /// Cuts the area at `addr`, keeping the low part and returning the high one.
    fn split_off(&mut self, addr: usize) -> Vma {
        debug_assert!(self.range.start() < addr && addr < self.range.end());
        let high = Vma {
            range: AddrRange::new(addr, self.range.end()),
            perm: self.perm,
            flags: self.flags,
            backing: self.backing.split(addr - self.range.start()),
        };
        self.range = AddrRange::new(self.range.start(), addr);
        high
    }
}

impl fmt::Debug for Vma {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Vma({} {} {:?})", self.range, self.perm, self.flags)
    }
}

/// VMAs keyed by start address.
///
/// Two empty sentinels sit at the lowest and highest addresses, so every real
/// area has a neighbour on each side and hole searches need no edge cases.
pub(crate) struct VmaList {
    vmas: BTreeMap<usize, Vma>,
}

impl VmaList {
    pub fn new() -> Self {
        let mut vmas = BTreeMap::new();
        vmas.insert(arch::LOWER_VMA_LIMIT, Vma::sentinel(arch::LOWER_VMA_LIMIT));
        vmas.insert(arch::UPPER_VMA_LIMIT, Vma::sentinel(arch::UPPER_VMA_LIMIT));
        Self { vmas }
    }

    /// Every real area in address order.
    pub fn iter(&self) -> impl Iterator<Item = &Vma> {
        self.vmas.values().filter(|vma| !vma.range.is_empty())
    }

    /// Key of the last area starting at or before `addr`.
    fn floor(&self, addr: usize) -> usize {
        self.vmas
            .range(..=addr)
            .next_back()
            .map_or(arch::LOWER_VMA_LIMIT, |(start, _)| *start)
    }

    pub fn intersecting(&self, range: AddrRange) -> impl Iterator<Item = &Vma> {
        let from = self.floor(range.start());
        self.vmas
            .range(from..)
            .map(|(_, vma)| vma)
            .take_while(move |vma| vma.range.start() < range.end())
            .filter(move |vma| vma.range.intersects(&range))
    }

    pub fn find(&self, addr: usize) -> Option<&Vma> {
        self.vmas
            .range(..=addr)
            .next_back()
            .map(|(_, vma)| vma)
            .filter(|vma| vma.range.contains(addr))
    }

    /// True if areas cover every byte of `range`.
    pub fn ismapped(&self, range: AddrRange) -> bool {
        let mut covered = range.start();
        for vma in self.intersecting(range) {
            if vma.range.start() > covered {
                return false;
            }
            covered = vma.range.end();
        }
        covered >= range.end()
    }

    /// Makes `addr` an area boundary, if an area spans it.
    pub fn split(&mut self, addr: usize) {
        let key = self.floor(addr);
        let Some(vma) = self.vmas.get_mut(&key) else {
            return;
        };
        if vma.range.start() < addr && addr < vma.range.end() {
            let high = vma.split_off(addr);
            self.vmas.insert(addr, high);
        }
    }

    /// Areas lying inside `range`, for in-place changes after [`split`](Self::split).
    pub fn inside_mut(&mut self, range: AddrRange) -> impl Iterator<Item = &mut Vma> {
        self.vmas
            .range_mut(range.start()..range.end())
            .map(|(_, vma)| vma)
            .filter(|vma| !vma.range.is_empty())
    }

    /// Detaches every area within `range`, cutting the ones straddling its ends.
    pub fn remove_range(&mut self, range: AddrRange) -> Vec<Vma> {
        self.split(range.start());
        self.split(range.end());
        let keys: Vec<usize> = self
            .vmas
            .range(range.start()..range.end())
            .filter(|(_, vma)| !vma.range.is_empty())
            .map(|(start, _)| *start)
            .collect();
        keys.iter().filter_map(|start| self.vmas.remove(start)).collect()
    }

    pub fn insert(&mut self, vma: Vma) {
        debug_assert!(self.intersecting(vma.range).next().is_none(), "overlapping {vma:?}");
        self.vmas.insert(vma.range.start(), vma);
    }

    /// Finds a free range of `size` bytes, starting the search at `hint`.
    ///
    /// Requests of at least one large page prefer a large page aligned start;
    /// the first unaligned fit is taken when no aligned one exists.
    pub fn find_hole(&self, hint: usize, size: usize) -> Result<usize, VmError> {
        let valid = hint >= arch::PAGE_SIZE
            && hint % arch::PAGE_SIZE == 0
            && hint.checked_add(size).is_some_and(|end| end <= arch::UPPER_VMA_LIMIT);
        let start = if valid { hint } else { arch::MMAP_BASE };

        self.search(start, size)
            .or_else(|| if start != arch::MMAP_BASE { self.search(arch::MMAP_BASE, size) } else { None })
            .ok_or(VmError::OutOfMemory)
    }

    fn search(&self, start: usize, size: usize) -> Option<usize> {
        let large = size >= arch::HUGE_PAGE_SIZE;
        let mut good_enough = None;
        let from = self.floor(start);
        let mut areas = self.vmas.range(from..).map(|(_, vma)| vma.range).peekable();

        while let Some(prev) = areas.next() {
            let Some(next) = areas.peek() else {
                break;
            };
            let gap_start = prev.end().max(start);
            if gap_start.checked_add(size).is_none_or(|end| end > next.start()) {
                continue;
            }
            if !large {
                return Some(gap_start);
            }
            let aligned = align_up(gap_start, arch::HUGE_PAGE_SIZE);
            if aligned + size <= next.start() {
                return Some(aligned);
            }
            good_enough.get_or_insert(gap_start);
        }
        good_enough
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const P: usize = arch::PAGE_SIZE;

    fn anon(start: usize, end: usize, perm: Perm) -> Vma {
        Vma::new(
            AddrRange::new(start, end),
            perm,
            MmapFlags::PRIVATE | MmapFlags::ANONYMOUS,
            Backing::Anonymous { zero: true },
        )
    }

    fn ranges(list: &VmaList) -> Vec<(usize, usize)> {
        list.iter().map(|vma| (vma.range.start(), vma.range.end())).collect()
    }

    #[test]
    fn sentinels_are_hidden() {
        let list = VmaList::new();
        assert_eq!(list.iter().count(), 0);
        assert!(list.find(0).is_none());
        assert!(!list.ismapped(AddrRange::new(P, 2 * P)));
    }

    #[test]
    fn split_and_remove_cut_straddling_areas() {
        let mut list = VmaList::new();
        list.insert(anon(0x1000, 0x1000 + 4 * P, Perm::READ));
        let removed = list.remove_range(AddrRange::new(0x1000 + P, 0x1000 + 2 * P));

        assert_eq!(removed.len(), 1);
        assert_eq!(removed[0].range, AddrRange::new(0x1000 + P, 0x1000 + 2 * P));
        assert_eq!(ranges(&list), [(0x1000, 0x1000 + P), (0x1000 + 2 * P, 0x1000 + 4 * P)]);
    }

    #[test]
    fn split_moves_file_offsets() {
        use crate::file::FileMode;
        use crate::testing::FakeFile;

        let mut list = VmaList::new();
        let file = FakeFile::new(alloc::vec![0; 4 * P], FileMode::READ);
        list.insert(Vma::new(
            AddrRange::new(0x2000, 0x2000 + 4 * P),
            Perm::READ,
            MmapFlags::PRIVATE | MmapFlags::FILE,
            Backing::File { file, offset: P },
        ));
        list.split(0x2000 + 2 * P);
        assert_eq!(list.find(0x2000 + 3 * P).unwrap().backing.offset(), 3 * P);
        assert_eq!(list.find(0x2000).unwrap().backing.offset(), P);
    }

    #[test]
    fn ismapped_requires_contiguous_cover() {
        let mut list = VmaList::new();
        list.insert(anon(0x1000, 0x1000 + P, Perm::READ));
        list.insert(anon(0x1000 + P, 0x1000 + 2 * P, Perm::WRITE));
        list.insert(anon(0x1000 + 3 * P, 0x1000 + 4 * P, Perm::READ));

        assert!(list.ismapped(AddrRange::new(0x1000, 0x1000 + 2 * P)));
        assert!(!list.ismapped(AddrRange::new(0x1000, 0x1000 + 4 * P)));
        assert!(!list.ismapped(AddrRange::new(0x0f00, 0x1000 + P)));
    }

    #[test]
    fn areas_stay_ordered_and_disjoint() {
        let mut list = VmaList::new();
        for i in 0..6 {
            list.insert(anon(0x4000 + i * 2 * P, 0x4000 + (i * 2 + 1) * P, Perm::READ));
        }
        list.remove_range(AddrRange::new(0x4000 + 3 * P, 0x4000 + 7 * P));
        list.split(0x4000 + 8 * P + P / 2);

        let all = ranges(&list);
        assert!(all.windows(2).all(|pair| pair[0].1 <= pair[1].0));
        assert!(all.iter().all(|(start, end)| start < end));
    }

    #[test]
    fn hole_search_starts_at_hint() {
        let mut list = VmaList::new();
        assert_eq!(list.find_hole(0, P).unwrap(), arch::MMAP_BASE);
        assert_eq!(list.find_hole(0x2000, P).unwrap(), 0x2000);

        list.insert(anon(0x2000, 0x2000 + P, Perm::READ));
        assert_eq!(list.find_hole(0x2000, P).unwrap(), 0x2000 + P);
    }

    #[test]
    fn large_requests_prefer_large_alignment() {
        let mut list = VmaList::new();
        list.insert(anon(arch::MMAP_BASE, arch::MMAP_BASE + P, Perm::READ));
        let hole = list.find_hole(0, arch::HUGE_PAGE_SIZE).unwrap();
        assert_eq!(hole, arch::MMAP_BASE + arch::HUGE_PAGE_SIZE);
    }

    #[test]
    fn unaligned_hole_is_good_enough() {
        let mut list = VmaList::new();
        let base = arch::MMAP_BASE;
        let huge = arch::HUGE_PAGE_SIZE;
        // Leave exactly one unaligned gap of one large page.
        list.insert(anon(base, base + P, Perm::READ));
        list.insert(anon(base + P + huge, arch::UPPER_VMA_LIMIT, Perm::READ));
        assert_eq!(list.find_hole(0, huge).unwrap(), base + P);
    }

    #[test]
    fn full_address_space_is_enomem() {
        let mut list = VmaList::new();
        list.insert(anon(P, arch::UPPER_VMA_LIMIT, Perm::READ));
        assert_eq!(list.find_hole(0, P), Err(VmError::OutOfMemory));
    }
}
