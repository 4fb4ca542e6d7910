//! Page-range allocator: free physical memory as variable-sized extents.
//!
//! Every free extent carries a [`PageRange`] header in its first page and a
//! back-pointer to that header in its last word. Extents of fewer than
//! `2^PAGE_RANGES_MAX_ORDER` pages live in segregated lists, list `k` holding
//! extents of `[2^k, 2^(k+1))` pages; anything larger lives in a tree ordered by
//! size, from which the largest extent is taken (worst fit).
//!
//! A boundary bitmap has one bit per page, set exactly on the first and last page
//! of each free extent. Freeing an extent looks at the bit just before and just
//! after it to find free neighbours in O(1), and uses the back-pointer or the
//! header to merge with them.

use core::cell::Cell;
use core::mem::size_of;
use core::ptr::{self, NonNull};

use intrusive_collections::{
    KeyAdapter, LinkedList, LinkedListLink, RBTree, RBTreeLink, UnsafeRef, intrusive_adapter,
};

use crate::address::align_up;
use crate::stats::OrderStats;
use crate::{PhysicalAddress, arch};

pub const MAX_ORDER: usize = arch::PAGE_RANGES_MAX_ORDER;

/// Header of a free extent, written into the extent itself.
#[repr(C)]
pub(crate) struct PageRange {
    size: Cell<usize>,
    list_link: LinkedListLink,
    tree_link: RBTreeLink,
}

impl PageRange {
    fn start(&self) -> PhysicalAddress {
        PhysicalAddress::from_ptr(self as *const PageRange)
    }

    fn size(&self) -> usize {
        self.size.get()
    }

    fn pages(&self) -> usize {
        self.size() / arch::PAGE_SIZE
    }
}

intrusive_adapter!(ListAdapter = UnsafeRef<PageRange>: PageRange { list_link: LinkedListLink });
intrusive_adapter!(TreeAdapter = UnsafeRef<PageRange>: PageRange { tree_link: RBTreeLink });

impl<'a> KeyAdapter<'a> for TreeAdapter {
    type Key = (usize, usize);

    fn get_key(&self, range: &'a PageRange) -> (usize, usize) {
        (range.size(), range as *const PageRange as usize)
    }
}

/// One bit per physical page, stored in pages taken from the allocator itself.
struct Bitmap {
    words: *mut u64,
    bits: usize,
    storage: Option<(PhysicalAddress, usize)>,
}

impl Bitmap {
    const fn empty() -> Self {
        Self {
            words: ptr::null_mut(),
            bits: 0,
            storage: None,
        }
    }

    fn len(&self) -> usize {
        self.bits
    }

    fn get(&self, index: usize) -> bool {
        if index >= self.bits {
            return false;
        }
        // SAFETY: index < bits, and storage holds at least bits / 64 words.
        let word = unsafe { self.words.add(index / 64).read() };
        word & (1 << (index % 64)) != 0
    }

    fn set(&mut self, index: usize, value: bool) {
        debug_assert!(index < self.bits, "bitmap index out of range");
        // SAFETY: as in `get`; the allocator lock serialises writers.
        unsafe {
            let word = self.words.add(index / 64);
            if value {
                word.write(word.read() | (1 << (index % 64)));
            } else {
                word.write(word.read() & !(1 << (index % 64)));
            }
        }
    }

    fn storage_bytes(bits: usize) -> usize {
        align_up(bits.div_ceil(64) * size_of::<u64>(), arch::PAGE_SIZE)
    }
}

/// Marks the first and last page of `[index, index + pages)`.
fn mark_boundaries(bitmap: &mut Bitmap, index: usize, pages: usize, value: bool) {
    bitmap.set(index, value);
    bitmap.set(index + pages - 1, value);
}

fn ilog2(value: usize) -> usize {
    (usize::BITS - 1 - value.leading_zeros()) as usize
}

fn ilog2_roundup(value: usize) -> usize {
    if value <= 1 {
        0
    } else {
        (usize::BITS - (value - 1).leading_zeros()) as usize
    }
}

fn order_of(size: usize) -> usize {
    ilog2(size / arch::PAGE_SIZE)
}

/// Free-extent allocator over physical memory.
///
/// Not synchronised; [`PhysicalMemory`](crate::memory::PhysicalMemory) wraps it
/// in a mutex.
pub(crate) struct PageRangeAllocator {
    free: [LinkedList<ListAdapter>; MAX_ORDER],
    free_huge: RBTree<TreeAdapter>,
    not_empty: usize,
    bitmap: Bitmap,
    /// Old bitmap storage, released once the new bitmap is valid.
    deferred_free: Option<(PhysicalAddress, usize)>,
    free_bytes: usize,
}

// SAFETY: the headers live in physical memory owned by this allocator; all access
// goes through `&mut self`.
unsafe impl Send for PageRangeAllocator {}

impl PageRangeAllocator {
    pub fn new() -> Self {
        Self {
            free: core::array::from_fn(|_| LinkedList::new(ListAdapter::new())),
            free_huge: RBTree::new(TreeAdapter::new()),
            not_empty: 0,
            bitmap: Bitmap::empty(),
            deferred_free: None,
            free_bytes: 0,
        }
    }

    /// Bytes held in free extents.
    pub fn free_bytes(&self) -> usize {
        self.free_bytes
    }

    pub fn is_empty(&self) -> bool {
        self.not_empty == 0
    }

    /// Number of free extents.
    pub fn len(&self) -> usize {
        self.free_huge.iter().count() + self.free.iter().map(|list| list.iter().count()).sum::<usize>()
    }

    /// Hands boot memory to the allocator, growing the bitmap to cover it.
    pub fn initial_add(&mut self, start: PhysicalAddress, size: usize) {
        debug_assert!(start.is_aligned(arch::PAGE_SIZE) && size % arch::PAGE_SIZE == 0);
        let index = start.page_index();
        let end_index = index + size / arch::PAGE_SIZE;
        if end_index <= self.bitmap.len() {
            self.free(start, size);
            return;
        }

        let mut range = Self::write_header(start, size);
        if index > 0 && self.bitmap.get(index - 1) {
            let left = Self::left_neighbour(start);
            self.remove(left);
            // SAFETY: both headers are live extents owned by the allocator.
            unsafe {
                left.as_ref().size.set(left.as_ref().size() + size);
            }
            range = left;
        }
        self.insert(range, false);

        self.resize_bitmap(end_index);
        for range in self.free_huge.iter() {
            mark_boundaries(&mut self.bitmap, range.start().page_index(), range.pages(), true);
        }
        for list in &self.free {
            for range in list.iter() {
                mark_boundaries(&mut self.bitmap, range.start().page_index(), range.pages(), true);
            }
        }
        if let Some((start, size)) = self.deferred_free.take() {
            self.free(start, size);
        }
    }

    /// Allocates `size` bytes (a multiple of the page size).
    ///
    /// With `contiguous` set, a size falling strictly between two size classes may
    /// be served by scanning the class below for a big enough extent. Callers
    /// without that requirement fall back to something else instead.
    pub fn alloc(&mut self, size: usize, contiguous: bool) -> Option<PhysicalAddress> {
        self.alloc_range(size, contiguous, true)
            // SAFETY: the extent was just removed from the allocator and is ours.
            .map(|range| unsafe { range.as_ref() }.start())
    }

    fn alloc_range(&mut self, size: usize, contiguous: bool, use_bitmap: bool) -> Option<NonNull<PageRange>> {
        debug_assert!(size > 0 && size % arch::PAGE_SIZE == 0);
        let exact_order = ilog2_roundup(size / arch::PAGE_SIZE).min(MAX_ORDER);
        let candidates = self.not_empty & !((1 << exact_order) - 1);

        let range = if candidates == 0 {
            if !contiguous || exact_order == 0 {
                return None;
            }
            // Linear in the length of the list; only exact contiguous requests pay it.
            let lower = &self.free[exact_order - 1];
            let found = lower.iter().find(|range| range.size() >= size)?;
            NonNull::from(found)
        } else {
            let order = candidates.trailing_zeros() as usize;
            if order == MAX_ORDER {
                let largest = self.free_huge.back();
                let largest = largest.get()?;
                if largest.size() < size {
                    return None;
                }
                NonNull::from(largest)
            } else {
                NonNull::from(self.free[order].front().get()?)
            }
        };
        self.remove(range);

        // SAFETY: `range` is an extent we just unlinked.
        let header = unsafe { range.as_ref() };
        let start = header.start();
        if header.size() > size {
            let rest = Self::write_header(start + size, header.size() - size);
            self.insert(rest, use_bitmap);
            header.size.set(size);
        }
        if use_bitmap {
            mark_boundaries(&mut self.bitmap, start.page_index(), header.pages(), false);
        }
        Some(range)
    }

    /// Allocates `size` bytes such that `start + offset` is aligned to `alignment`.
    ///
    /// The aligned piece is carved from the end of the first extent that can
    /// hold it; unaligned leftovers on either side go back to the free lists.
    pub fn alloc_aligned(&mut self, size: usize, offset: usize, alignment: usize) -> Option<PhysicalAddress> {
        debug_assert!(alignment.is_power_of_two());
        let min_order = order_of(size).max(1) - 1;

        let mut found = None;
        self.for_each(min_order, |start, extent| {
            if extent < size {
                return true;
            }
            let expected = start.as_usize() + extent - size + offset;
            let shift = expected - (expected & !(alignment - 1));
            if extent >= size + shift {
                found = Some((start, shift));
                false
            } else {
                true
            }
        });
        let (start, shift) = found?;

        let range = start.to_ptr::<PageRange>();
        // SAFETY: `for_each` only reports live extents.
        let range = unsafe { NonNull::new_unchecked(range) };
        self.remove(range);
        // SAFETY: unlinked above, owned by us until reinserted.
        let header = unsafe { range.as_ref() };
        if shift > 0 {
            let tail = Self::write_header(start + header.size() - shift, shift);
            self.insert(tail, true);
            header.size.set(header.size() - shift);
        }

        let allocated = if header.size() == size {
            start
        } else {
            header.size.set(header.size() - size);
            self.insert(range, true);
            start + header.size()
        };
        mark_boundaries(&mut self.bitmap, allocated.page_index(), size / arch::PAGE_SIZE, false);
        Some(allocated)
    }

    /// Returns `[start, start + size)` to the allocator, merging with free neighbours.
    pub fn free(&mut self, start: PhysicalAddress, size: usize) {
        debug_assert!(start.is_aligned(arch::PAGE_SIZE) && size > 0 && size % arch::PAGE_SIZE == 0);
        let mut range = Self::write_header(start, size);

        let index = start.page_index();
        if index > 0 && self.bitmap.get(index - 1) {
            let left = Self::left_neighbour(start);
            self.remove(left);
            self.bitmap.set(index - 1, false);
            // SAFETY: `left` is a free extent ending right before `start`.
            unsafe {
                left.as_ref().size.set(left.as_ref().size() + size);
            }
            range = left;
        }

        // SAFETY: `range` is the extent being freed, not linked anywhere yet.
        let header = unsafe { range.as_ref() };
        let next_index = header.start().page_index() + header.pages();
        if self.bitmap.get(next_index) {
            let right = (header.start() + header.size()).to_ptr::<PageRange>();
            // SAFETY: a set bit on the following page marks the start of a free extent.
            let right = unsafe { NonNull::new_unchecked(right) };
            self.remove(right);
            self.bitmap.set(next_index - 1, false);
            self.bitmap.set(next_index, false);
            // SAFETY: unlinked above.
            header.size.set(header.size() + unsafe { right.as_ref() }.size());
        }

        self.insert(range, true);
    }

    /// Visits free extents, huge ones first, then lists from the largest class
    /// down to `min_order`, until `f` returns false.
    pub fn for_each(&self, min_order: usize, mut f: impl FnMut(PhysicalAddress, usize) -> bool) {
        for range in self.free_huge.iter() {
            if !f(range.start(), range.size()) {
                return;
            }
        }
        for order in (min_order..MAX_ORDER).rev() {
            for range in self.free[order].iter() {
                if !f(range.start(), range.size()) {
                    return;
                }
            }
        }
    }

    /// Per-class counts; index `MAX_ORDER` is the huge set.
    pub fn stats(&self) -> [OrderStats; MAX_ORDER + 1] {
        let mut stats = [OrderStats::default(); MAX_ORDER + 1];
        for range in self.free_huge.iter() {
            stats[MAX_ORDER].ranges += 1;
            stats[MAX_ORDER].bytes += range.size();
        }
        for (order, list) in self.free.iter().enumerate() {
            for range in list.iter() {
                stats[order].ranges += 1;
                stats[order].bytes += range.size();
            }
        }
        stats
    }

    #[cfg(test)]
    fn is_boundary(&self, page_index: usize) -> bool {
        self.bitmap.get(page_index)
    }

    fn write_header(start: PhysicalAddress, size: usize) -> NonNull<PageRange> {
        let header = start.to_ptr::<PageRange>();
        // SAFETY: the extent is page-aligned free memory of at least one page.
        unsafe {
            header.write(PageRange {
                size: Cell::new(size),
                list_link: LinkedListLink::new(),
                tree_link: RBTreeLink::new(),
            });
            NonNull::new_unchecked(header)
        }
    }

    fn left_neighbour(start: PhysicalAddress) -> NonNull<PageRange> {
        let back_pointer = (start - size_of::<usize>()).to_ptr::<*mut PageRange>();
        // SAFETY: callers check the boundary bit, so the previous word is the back
        // pointer of a free extent.
        unsafe { NonNull::new_unchecked(back_pointer.read()) }
    }

    fn insert(&mut self, range: NonNull<PageRange>, use_bitmap: bool) {
        // SAFETY: `range` is an unlinked extent owned by the allocator.
        let header = unsafe { range.as_ref() };
        let size = header.size();
        // SAFETY: the last word of the extent is inside it.
        unsafe {
            let back_pointer = range.as_ptr().cast::<u8>().add(size - size_of::<usize>());
            back_pointer.cast::<*mut PageRange>().write(range.as_ptr());
        }

        let order = order_of(size);
        // SAFETY: each header is linked into exactly one collection at a time.
        let link = unsafe { UnsafeRef::from_raw(range.as_ptr()) };
        if order >= MAX_ORDER {
            self.free_huge.insert(link);
            self.not_empty |= 1 << MAX_ORDER;
        } else {
            self.free[order].push_front(link);
            self.not_empty |= 1 << order;
        }
        if use_bitmap {
            mark_boundaries(&mut self.bitmap, header.start().page_index(), header.pages(), true);
        }
        self.free_bytes += size;
    }

    fn remove(&mut self, range: NonNull<PageRange>) {
        // SAFETY: `range` is linked into the collection matching its size class.
        let size = unsafe { range.as_ref() }.size();
        let order = order_of(size);
        if order >= MAX_ORDER {
            unsafe { self.free_huge.cursor_mut_from_ptr(range.as_ptr()).remove() };
            if self.free_huge.is_empty() {
                self.not_empty &= !(1 << MAX_ORDER);
            }
        } else {
            unsafe { self.free[order].cursor_mut_from_ptr(range.as_ptr()).remove() };
            if self.free[order].is_empty() {
                self.not_empty &= !(1 << order);
            }
        }
        self.free_bytes -= size;
    }

    /// Replaces the bitmap with one covering `bits` pages, all clear.
    ///
    /// The storage comes from the free extents without touching the old bitmap;
    /// the old storage is parked in `deferred_free` until the new one is filled.
    fn resize_bitmap(&mut self, bits: usize) {
        let bytes = Bitmap::storage_bytes(bits);
        let Some(storage) = self.alloc_range(bytes, true, false) else {
            log::error!("no extent of {:#x} bytes for the page-range bitmap", bytes);
            panic!("cannot allocate the page-range bitmap");
        };
        // SAFETY: freshly allocated extent of `bytes` bytes.
        let words = storage.as_ptr().cast::<u64>();
        unsafe { ptr::write_bytes(words, 0, bytes / size_of::<u64>()) };
        let start = PhysicalAddress::from_ptr(storage.as_ptr());

        debug_assert!(self.deferred_free.is_none());
        self.deferred_free = self.bitmap.storage.take();
        self.bitmap = Bitmap {
            words,
            bits,
            storage: Some((start, bytes)),
        };
    }
}
