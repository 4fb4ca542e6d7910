//! Generic page table walker.
//!
//! One traversal serves every page table operation. The operation is a type
//! implementing [`PageOperation`]; its associated constants select the walk's
//! policy and are resolved at compile time, so each operation gets its own
//! monomorphised walker with no dynamic dispatch per entry:
//!
//! | constant                | effect when set                                          |
//! |-------------------------|----------------------------------------------------------|
//! | `ALLOCATE_INTERMEDIATE` | create missing tables instead of skipping the range      |
//! | `SKIP_EMPTY`            | do not call [`page`](PageOperation::page) on empty entries |
//! | `DESCEND`               | a fully covered entry pointing to a table is walked into  |
//! | `ONCE`                  | visit the first entry of each table only                  |
//! | `SPLIT`                 | split a partly covered large page instead of calling `sub_page` |
//!
//! Ranges are widened to the caller's `slop` at each level and clipped to each
//! entry, so a request that crosses a large page boundary is cut into pieces and
//! a linear mapping with a large slop is mapped with large pages.

use crate::arch;
use crate::memory::PhysicalMemory;
use crate::page_table::{PtePtr, allocate_intermediate_level, is_table, split_large_page};
use crate::{PhysicalAddress, VmError};

pub(crate) trait PageOperation {
    const ALLOCATE_INTERMEDIATE: bool = false;
    const SKIP_EMPTY: bool = true;
    const DESCEND: bool = true;
    const ONCE: bool = false;
    const SPLIT: bool = true;

    /// Levels at which whole entries are handed to [`page`](Self::page).
    fn page_sizes(&self) -> usize {
        arch::PAGE_SIZES
    }

    /// Handles an entry mapping `[offset, offset + level_size)` of the walk.
    ///
    /// Above level 0, returning false makes the walker go down one level and
    /// handle the range with smaller pages.
    fn page(&mut self, pte: PtePtr, offset: usize) -> bool;

    /// Handles a large page that the range covers only in part, when splitting
    /// is off. `offset` is that of the large page's start.
    fn sub_page(&mut self, pte: PtePtr, offset: usize) {
        let _ = (pte, offset);
    }

    /// Called before walking into a table whose whole span is covered.
    fn intermediate_page_pre(&mut self, pte: PtePtr, offset: usize) {
        let _ = (pte, offset);
    }

    /// Called after walking a table whose whole span is covered.
    fn intermediate_page_post(&mut self, pte: PtePtr, offset: usize) {
        let _ = (pte, offset);
    }

    fn tlb_flush_needed(&self) -> bool {
        false
    }

    fn finalize(&mut self) -> Result<(), VmError> {
        Ok(())
    }

    /// Bytes the operation accounts for (populated, freed, written back...).
    fn account_results(&self) -> usize {
        0
    }
}

/// Widens `[start, end]` to `slop`, then clips it to `[min, max]`. Both ends
/// are inclusive.
fn clamp(start: usize, end: usize, min: usize, max: usize, slop: usize) -> (usize, usize) {
    let start = (start & !(slop - 1)).max(min);
    let end = (end | (slop - 1)).min(max);
    (start, end)
}

struct Walker<'a, Op> {
    op: &'a mut Op,
    memory: &'a PhysicalMemory,
    vma_start: usize,
    slop: usize,
    split: bool,
}

impl<Op: PageOperation> Walker<'_, Op> {
    /// Walks the table below `parent` for `[start, end]`.
    fn descend(&mut self, parent: PtePtr, start: usize, end: usize, base: usize) -> Result<(), VmError> {
        let entry = parent.read();
        if entry.is_empty() {
            if !Op::ALLOCATE_INTERMEDIATE {
                return Ok(());
            }
            allocate_intermediate_level(parent, self.memory)?;
        } else if entry.is_large() {
            if !Op::SPLIT {
                self.op.sub_page(parent, base.wrapping_sub(self.vma_start));
                return Ok(());
            }
            split_large_page(parent, self.memory)?;
            self.split = true;
        }
        self.walk_table(parent.read().address(), parent.level() - 1, start, end, base)
    }

    fn walk_table(
        &mut self,
        table: PhysicalAddress,
        level: usize,
        start: usize,
        end: usize,
        base: usize,
    ) -> Result<(), VmError> {
        let step = arch::level_size(level);
        let mut index = arch::page_index(start, level);
        let last = arch::page_index(end, level);
        let mut base = arch::canonicalize_virtual(base.wrapping_add(index * step));

        loop {
            let pte = PtePtr::entry(table, index, level);
            let entry_end = base.wrapping_add(step - 1);
            let (start1, end1) = clamp(start, end, base, entry_end, self.slop);
            let offset = base.wrapping_sub(self.vma_start);
            let whole = start1 == base && end1 == entry_end;

            if whole && level < self.op.page_sizes() {
                let skip = Op::SKIP_EMPTY && pte.read().is_empty();
                if !skip {
                    if level == 0 {
                        self.op.page(pte, offset);
                    } else if (Op::DESCEND && is_table(pte.read())) || !self.op.page(pte, offset) {
                        self.op.intermediate_page_pre(pte, offset);
                        self.descend(pte, start1, end1, base)?;
                        self.op.intermediate_page_post(pte, offset);
                    }
                }
            } else if level > 0 {
                if whole {
                    self.op.intermediate_page_pre(pte, offset);
                    self.descend(pte, start1, end1, base)?;
                    self.op.intermediate_page_post(pte, offset);
                } else {
                    self.descend(pte, start1, end1, base)?;
                }
            }

            if Op::ONCE || index == last {
                return Ok(());
            }
            index += 1;
            base = base.wrapping_add(step);
        }
    }
}

/// Runs `op` over `[start, start + size)` of the page table rooted at `root`.
///
/// `vma_start` is the address offsets handed to the operation are relative to.
/// Fails only if a table could not be allocated or split; the operation keeps
/// its own failures for [`finalize`](PageOperation::finalize).
pub(crate) fn map_range<Op: PageOperation>(
    root: PhysicalAddress,
    memory: &PhysicalMemory,
    vma_start: usize,
    start: usize,
    size: usize,
    op: &mut Op,
    slop: usize,
) -> Result<bool, VmError> {
    if size == 0 {
        return Ok(false);
    }
    let mut walker = Walker {
        op,
        memory,
        vma_start,
        slop,
        split: false,
    };
    let end = start.wrapping_add(size - 1);
    walker.walk_table(root, arch::PAGE_TABLE_LEVELS - 1, start, end, 0)?;
    Ok(walker.split)
}

/// Page-aligned [`map_range`], followed by the TLB flush the walk calls for and
/// the operation's finalisation. Returns the operation's accounted bytes.
pub(crate) fn operate_range<Op: PageOperation>(
    root: PhysicalAddress,
    memory: &PhysicalMemory,
    mut op: Op,
    vma_start: usize,
    start: usize,
    size: usize,
) -> Result<usize, VmError> {
    let aligned = start & !(arch::PAGE_SIZE - 1);
    let size = crate::address::align_up(size + (start - aligned), arch::PAGE_SIZE).max(arch::PAGE_SIZE);
    let walked = map_range(root, memory, vma_start, aligned, size, &mut op, arch::PAGE_SIZE);
    if walked.as_ref().is_ok_and(|split| *split) || op.tlb_flush_needed() {
        arch::flush_tlb_all();
    }
    // Finalize even after a failed walk: the operation may hold pages it
    // already took out of the table.
    let finalized = op.finalize();
    walked?;
    finalized?;
    Ok(op.account_results())
}
