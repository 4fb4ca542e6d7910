//! The page table operations run through the [walker](crate::walker).

use alloc::vec::Vec;

use crate::arch::{self, PageEntry};
use crate::memory::PhysicalMemory;
use crate::page_table::{PtePtr, change_perm, is_table, make_leaf_pte};
use crate::provider::{Backing, page_bytes};
use crate::vma::Perm;
use crate::walker::PageOperation;
use crate::{PhysicalAddress, VmError};

/// Maps `[virt, virt + size)` onto the physical range starting at `phys`.
pub(crate) struct LinearPageMapper {
    phys: PhysicalAddress,
    large: bool,
}

impl LinearPageMapper {
    pub fn new(phys: PhysicalAddress, large: bool) -> Self {
        Self { phys, large }
    }
}

impl PageOperation for LinearPageMapper {
    const ALLOCATE_INTERMEDIATE: bool = true;
    const SKIP_EMPTY: bool = false;

    fn page_sizes(&self) -> usize {
        if self.large { arch::PAGE_SIZES } else { 1 }
    }

    fn page(&mut self, pte: PtePtr, offset: usize) -> bool {
        let phys = self.phys + offset;
        if !phys.is_aligned(arch::level_size(pte.level())) {
            return false;
        }
        pte.write(make_leaf_pte(phys, Perm::READ | Perm::WRITE | Perm::EXEC, pte.level()));
        true
    }
}

/// Fills empty entries with pages from the mapping's backing.
pub(crate) struct Populate<'a> {
    memory: &'a PhysicalMemory,
    backing: &'a Backing,
    perm: Perm,
    write: bool,
    large: bool,
    populated: usize,
    error: Option<VmError>,
}

impl<'a> Populate<'a> {
    pub fn new(memory: &'a PhysicalMemory, backing: &'a Backing, perm: Perm, write: bool, large: bool) -> Self {
        Self {
            memory,
            backing,
            perm,
            write,
            large,
            populated: 0,
            error: None,
        }
    }

    fn leaf(&self, page: PhysicalAddress, level: usize) -> PageEntry {
        let mut entry = make_leaf_pte(page, self.perm, level);
        if self.write && self.perm.contains(Perm::WRITE) {
            let mut flags = entry.flags();
            flags.set_dirty(true);
            entry.set_flags(flags);
        }
        entry
    }

    /// A present entry needs nothing but the dirty bit on a write.
    fn touch(&self, pte: PtePtr, old: PageEntry) {
        if self.write && self.perm.contains(Perm::WRITE) && !old.flags().is_dirty() {
            let mut entry = old;
            let mut flags = entry.flags();
            flags.set_dirty(true);
            entry.set_flags(flags);
            pte.compare_exchange(old, entry);
        }
    }
}

impl PageOperation for Populate<'_> {
    const ALLOCATE_INTERMEDIATE: bool = true;
    const SKIP_EMPTY: bool = false;
    // Only empty entries are filled, so a large page is never in the way.
    const SPLIT: bool = false;

    fn page_sizes(&self) -> usize {
        if self.large { arch::PAGE_SIZES } else { 1 }
    }

    fn page(&mut self, pte: PtePtr, offset: usize) -> bool {
        let level = pte.level();
        let old = pte.read();
        if !old.is_empty() {
            self.touch(pte, old);
            return true;
        }
        if self.error.is_some() {
            return true;
        }

        match self.backing.map(self.memory, offset, level) {
            Ok(Some(page)) => {
                if pte.compare_exchange(old, self.leaf(page, level)) {
                    self.populated += arch::level_size(level);
                } else {
                    self.backing.release(self.memory, page, level);
                }
                true
            }
            Ok(None) => false,
            Err(_) if level > 0 => false,
            Err(err) => {
                self.error = Some(err);
                true
            }
        }
    }

    fn sub_page(&mut self, pte: PtePtr, _offset: usize) {
        self.touch(pte, pte.read());
    }

    fn finalize(&mut self) -> Result<(), VmError> {
        self.error.map_or(Ok(()), Err)
    }

    fn account_results(&self) -> usize {
        self.populated
    }
}

const TLB_GATHER_PAGES: usize = 20;

#[derive(Clone, Copy)]
enum Gathered {
    Page(PhysicalAddress, usize),
    Table(PhysicalAddress),
}

/// Pages unmapped but not yet freed: other CPUs may still reach them through
/// stale TLB entries until the next flush.
struct TlbGather {
    pending: [Option<Gathered>; TLB_GATHER_PAGES],
    len: usize,
}

impl TlbGather {
    fn new() -> Self {
        Self {
            pending: [None; TLB_GATHER_PAGES],
            len: 0,
        }
    }

    fn push(&mut self, page: Gathered, memory: &PhysicalMemory, backing: &Backing) {
        if self.len == TLB_GATHER_PAGES {
            self.flush(memory, backing);
        }
        self.pending[self.len] = Some(page);
        self.len += 1;
    }

    fn flush(&mut self, memory: &PhysicalMemory, backing: &Backing) {
        if self.len == 0 {
            return;
        }
        arch::flush_tlb_all();
        for slot in &mut self.pending[..self.len] {
            match slot.take() {
                Some(Gathered::Page(page, level)) => backing.release(memory, page, level),
                Some(Gathered::Table(table)) => memory.free_page(table),
                None => {}
            }
        }
        self.len = 0;
    }
}

/// Clears entries and gives their pages back, along with tables left empty.
pub(crate) struct Unpopulate<'a> {
    memory: &'a PhysicalMemory,
    backing: &'a Backing,
    gather: TlbGather,
    freed: usize,
}

impl<'a> Unpopulate<'a> {
    pub fn new(memory: &'a PhysicalMemory, backing: &'a Backing) -> Self {
        Self {
            memory,
            backing,
            gather: TlbGather::new(),
            freed: 0,
        }
    }
}

impl PageOperation for Unpopulate<'_> {
    fn page(&mut self, pte: PtePtr, _offset: usize) -> bool {
        let entry = pte.read();
        pte.write(PageEntry::empty());
        self.freed += arch::level_size(pte.level());
        self.gather
            .push(Gathered::Page(entry.address(), pte.level()), self.memory, self.backing);
        true
    }

    fn intermediate_page_post(&mut self, pte: PtePtr, _offset: usize) {
        let entry = pte.read();
        if is_table(entry) {
            pte.write(PageEntry::empty());
            self.gather.push(Gathered::Table(entry.address()), self.memory, self.backing);
        }
    }

    fn finalize(&mut self) -> Result<(), VmError> {
        self.gather.flush(self.memory, self.backing);
        Ok(())
    }

    fn account_results(&self) -> usize {
        self.freed
    }
}

/// Rewrites the permissions of present entries.
pub(crate) struct Protection {
    perm: Perm,
    flush: bool,
}

impl Protection {
    pub fn new(perm: Perm) -> Self {
        Self { perm, flush: false }
    }
}

impl PageOperation for Protection {
    fn page(&mut self, pte: PtePtr, _offset: usize) -> bool {
        self.flush |= change_perm(pte, self.perm);
        true
    }

    fn tlb_flush_needed(&self) -> bool {
        self.flush
    }
}

/// Receives the dirty pages a [`DirtyCleaner`] finds.
pub(crate) trait DirtyHandler {
    fn dirty(&mut self, page: PhysicalAddress, offset: usize, size: usize);

    /// Acts on everything collected; returns the bytes handled.
    fn finish(&mut self) -> Result<usize, VmError>;
}

/// Clears dirty bits, reporting each dirty page to `H`.
///
/// Large pages are never split: a large page only partly inside the range is
/// handled whole.
pub(crate) struct DirtyCleaner<H> {
    handler: H,
    flush: bool,
    handled: usize,
}

impl<H: DirtyHandler> DirtyCleaner<H> {
    pub fn new(handler: H) -> Self {
        Self {
            handler,
            flush: false,
            handled: 0,
        }
    }

    fn clean(&mut self, pte: PtePtr, offset: usize) {
        let mut entry = pte.read();
        let mut flags = entry.flags();
        if entry.is_empty() || !flags.is_dirty() {
            return;
        }
        flags.set_dirty(false);
        entry.set_flags(flags);
        pte.write(entry);
        self.flush = true;
        self.handler.dirty(entry.address(), offset, arch::level_size(pte.level()));
    }
}

impl<H: DirtyHandler> PageOperation for DirtyCleaner<H> {
    const SPLIT: bool = false;

    fn page(&mut self, pte: PtePtr, offset: usize) -> bool {
        self.clean(pte, offset);
        true
    }

    fn sub_page(&mut self, pte: PtePtr, offset: usize) {
        self.clean(pte, offset);
    }

    fn tlb_flush_needed(&self) -> bool {
        self.flush
    }

    fn finalize(&mut self) -> Result<(), VmError> {
        self.handled = self.handler.finish()?;
        Ok(())
    }

    fn account_results(&self) -> usize {
        self.handled
    }
}

/// Writes dirty pages of a shared file mapping back to the file.
///
/// Pages adjacent in the file are written with one call per run, then the
/// file is flushed once.
pub(crate) struct DirtyPageSync<'a> {
    backing: &'a Backing,
    pages: Vec<(usize, PhysicalAddress, usize)>,
}

impl<'a> DirtyPageSync<'a> {
    pub fn new(backing: &'a Backing) -> Self {
        Self {
            backing,
            pages: Vec::new(),
        }
    }
}

impl DirtyHandler for DirtyPageSync<'_> {
    fn dirty(&mut self, page: PhysicalAddress, offset: usize, size: usize) {
        self.pages.push((offset, page, size));
    }

    fn finish(&mut self) -> Result<usize, VmError> {
        let Some(file) = self.backing.file() else {
            return Ok(0);
        };
        self.pages.sort_unstable_by_key(|(offset, _, _)| *offset);

        let mut written = 0;
        let mut run: Vec<u8> = Vec::new();
        let mut run_start = 0;
        for (index, &(offset, page, size)) in self.pages.iter().enumerate() {
            if run.is_empty() {
                run_start = offset;
            }
            run.extend_from_slice(&page_bytes(page, size));
            let continues = self
                .pages
                .get(index + 1)
                .is_some_and(|(next, _, _)| *next == offset + size);
            if !continues {
                written += self.backing.write_back(run_start, &run)?;
                run.clear();
            }
        }

        if let (true, Some(first), Some(last)) = (written > 0, self.pages.first(), self.pages.last()) {
            let base = self.backing.offset();
            file.sync(base + first.0, base + last.0 + last.2)?;
            file.fsync()?;
        }
        log::trace!("wrote back {} dirty pages ({} bytes)", self.pages.len(), written);
        Ok(written)
    }
}

/// Finds the entry mapping one address. Large pages are reported whole.
pub(crate) struct VirtToPhysMap {
    found: Option<(PageEntry, usize)>,
}

impl VirtToPhysMap {
    pub fn new() -> Self {
        Self { found: None }
    }

    /// The entry and its level, if the address is mapped.
    pub fn found(&self) -> Option<(PageEntry, usize)> {
        self.found
    }
}

impl PageOperation for VirtToPhysMap {
    const ONCE: bool = true;
    const SPLIT: bool = false;

    fn page(&mut self, pte: PtePtr, _offset: usize) -> bool {
        self.found = Some((pte.read(), pte.level()));
        true
    }

    fn sub_page(&mut self, pte: PtePtr, offset: usize) {
        self.page(pte, offset);
    }
}
