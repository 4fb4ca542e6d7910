//! Page table entries and the structural edits the walker makes to the tree.

use core::sync::atomic::{AtomicUsize, Ordering};

use crate::arch::{self, PageEntry, PageFlags};
use crate::memory::PhysicalMemory;
use crate::vma::Perm;
use crate::{PhysicalAddress, VmError};

/// Location of one page table entry, and the level of the table holding it.
///
/// Level 0 entries map base pages; level 1 entries map large pages or point to
/// a level 0 table, and so on up to the root.
#[derive(Debug, Clone, Copy)]
pub struct PtePtr {
    slot: *const AtomicUsize,
    level: usize,
}

impl PtePtr {
    /// Entry `index` of the table at `table`, which sits at `level`.
    pub fn entry(table: PhysicalAddress, index: usize, level: usize) -> Self {
        debug_assert!(index < arch::ENTRY_COUNT && level < arch::PAGE_TABLE_LEVELS);
        let slot = table.to_ptr::<AtomicUsize>();
        Self {
            // SAFETY: a table page holds ENTRY_COUNT entries.
            slot: unsafe { slot.add(index) },
            level,
        }
    }

    pub fn level(&self) -> usize {
        self.level
    }

    pub fn read(&self) -> PageEntry {
        // SAFETY: `slot` points into a live page table page.
        PageEntry::from_usize(unsafe { &*self.slot }.load(Ordering::Acquire))
    }

    pub fn write(&self, entry: PageEntry) {
        // SAFETY: as in `read`.
        unsafe { &*self.slot }.store(entry.as_usize(), Ordering::Release);
    }

    /// Installs `new` if the entry still holds `old`. Used wherever two faults may
    /// race to fill the same entry.
    pub fn compare_exchange(&self, old: PageEntry, new: PageEntry) -> bool {
        // SAFETY: as in `read`.
        unsafe { &*self.slot }
            .compare_exchange(old.as_usize(), new.as_usize(), Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
    }
}

/// Builds a leaf entry mapping `page` with `perm`.
///
/// The present bit doubles as the read permission: an entry with no permission
/// at all is kept non-empty but not present, so it still records its page.
pub fn make_leaf_pte(page: PhysicalAddress, perm: Perm, level: usize) -> PageEntry {
    let mut flags = PageFlags::empty();
    flags.set_present(!perm.is_empty());
    flags.set_writable(perm.contains(Perm::WRITE));
    flags.set_executable(perm.contains(Perm::EXEC));
    flags.set_user(true);
    flags.set_large(level > 0);
    PageEntry::new(page, flags)
}

fn make_intermediate_pte(table: PhysicalAddress) -> PageEntry {
    let mut flags = PageFlags::empty();
    flags.set_present(true);
    flags.set_writable(true);
    flags.set_executable(true);
    flags.set_user(true);
    PageEntry::new(table, flags)
}

/// True for an entry that points to a lower-level table.
pub fn is_table(entry: PageEntry) -> bool {
    !entry.is_empty() && !entry.is_large() && entry.is_present()
}

/// Rewrites the permission bits of a leaf entry. Returns true if a permission
/// was taken away, in which case stale TLB entries must be flushed.
///
/// Copy-on-write entries never become writable here; the fault that breaks the
/// sharing does that.
pub fn change_perm(pte: PtePtr, perm: Perm) -> bool {
    let old = pte.read();
    let mut flags = old.flags();
    let was = (flags.is_present(), flags.is_writable(), flags.is_executable());

    flags.set_present(!perm.is_empty());
    flags.set_writable(perm.contains(Perm::WRITE) && !flags.is_cow());
    flags.set_executable(perm.contains(Perm::EXEC));

    let mut new = old;
    new.set_flags(flags);
    pte.write(new);

    (was.0 && !flags.is_present()) || (was.1 && !flags.is_writable()) || (was.2 && !flags.is_executable())
}

/// Gives an empty entry a zeroed table below it. Losing a race to another
/// thread doing the same is fine; the loser's page goes back.
pub fn allocate_intermediate_level(pte: PtePtr, memory: &PhysicalMemory) -> Result<(), VmError> {
    let table = memory.alloc_zeroed_page().ok_or(VmError::OutOfMemory)?;
    if !pte.compare_exchange(PageEntry::empty(), make_intermediate_pte(table)) {
        memory.free_page(table);
    }
    Ok(())
}

/// Replaces a large page entry by a table of entries mapping the same memory
/// with the same permissions one level down.
///
/// The pieces are ordinary pages of the range allocator afterwards, so they can
/// be freed one by one.
pub fn split_large_page(pte: PtePtr, memory: &PhysicalMemory) -> Result<(), VmError> {
    let large = pte.read();
    debug_assert!(large.is_large() && pte.level() > 0);
    let level = pte.level() - 1;
    let table = memory.alloc_page().ok_or(VmError::OutOfMemory)?;

    let mut flags = large.flags();
    flags.set_large(level > 0);
    for index in 0..arch::ENTRY_COUNT {
        let page = large.address() + index * arch::level_size(level);
        PtePtr::entry(table, index, level).write(PageEntry::new(page, flags));
    }
    pte.write(make_intermediate_pte(table));
    log::trace!("split large page {} at level {}", large.address(), pte.level());
    Ok(())
}
