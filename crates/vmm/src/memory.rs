//! Physical memory: the locked page-range allocator and the page-level API on top.
//!
//! Every allocation that can wait does so through the reclaimer's wait queue
//! (see [`reclaimer`](crate::reclaimer)); huge page requests never wait and simply
//! fail, so that callers can fall back to small pages.

use alloc::sync::Arc;

use spin::{Mutex, MutexGuard};

use crate::address::AddrRange;
use crate::page_range::{MAX_ORDER, PageRangeAllocator};
use crate::reclaimer::{Reclaimer, WaiterList};
use crate::sched::Scheduler;
use crate::stats::{HumanSize, MemoryStats, OrderStats};
use crate::{PhysicalAddress, VmConfig, arch};

pub(crate) struct Inner {
    pub ranges: PageRangeAllocator,
    pub waiters: WaiterList,
}

/// Owner of all free physical memory.
pub struct PhysicalMemory {
    pub(crate) inner: Mutex<Inner>,
    pub(crate) stats: MemoryStats,
    pub(crate) reclaimer: Reclaimer,
    pub(crate) sched: Arc<dyn Scheduler>,
    watermark_percent: usize,
    pub(crate) min_emergency_pool: usize,
}

impl PhysicalMemory {
    pub fn new(config: &VmConfig, sched: Arc<dyn Scheduler>) -> Self {
        Self {
            inner: Mutex::new(Inner {
                ranges: PageRangeAllocator::new(),
                waiters: WaiterList::new(),
            }),
            stats: MemoryStats::default(),
            reclaimer: Reclaimer::new(),
            sched,
            watermark_percent: config.watermark_percent,
            min_emergency_pool: config.min_emergency_pool,
        }
    }

    /// Adds usable boot extents. They must not overlap memory already added.
    pub(crate) fn add_boot_memory(&self, extents: &[AddrRange]) {
        let mut inner = self.inner.lock();
        for extent in extents {
            inner
                .ranges
                .initial_add(PhysicalAddress::new(extent.start()), extent.size());
            self.stats.on_new_memory(extent.size(), self.watermark_percent);
            log::debug!("added physical memory {} ({})", extent, HumanSize(extent.size()));
        }
        self.stats.set_free(inner.ranges.free_bytes());
        log::info!(
            "physical memory: {} total, {} free",
            HumanSize(self.stats.total()),
            HumanSize(self.stats.free())
        );
    }

    pub fn stats(&self) -> &MemoryStats {
        &self.stats
    }

    /// Free extents per size class; the last entry is the huge set.
    pub fn order_stats(&self) -> [OrderStats; MAX_ORDER + 1] {
        self.inner.lock().ranges.stats()
    }

    /// Allocates one page, waiting for the reclaimer if memory is short.
    ///
    /// Returns `None` only on threads that must not wait (the reclaimer itself).
    pub fn alloc_page(&self) -> Option<PhysicalAddress> {
        self.alloc_pages(arch::PAGE_SIZE, arch::PAGE_SIZE, true)
    }

    pub fn free_page(&self, page: PhysicalAddress) {
        self.free_pages(page, arch::PAGE_SIZE);
    }

    /// Allocates one page and fills it with zeroes.
    pub fn alloc_zeroed_page(&self) -> Option<PhysicalAddress> {
        let page = self.alloc_page()?;
        // SAFETY: the page was just handed to us.
        unsafe { core::ptr::write_bytes(page.to_ptr::<u8>(), 0, arch::PAGE_SIZE) };
        Some(page)
    }

    /// Allocates an aligned block of `size` bytes without waiting.
    ///
    /// Failure is normal under fragmentation; callers fall back to small pages.
    pub fn alloc_huge_page(&self, size: usize) -> Option<PhysicalAddress> {
        let mut inner = self.inner.lock();
        match inner.ranges.alloc_aligned(size, 0, size) {
            Some(page) => {
                self.on_alloc(&inner);
                Some(page)
            }
            None => {
                log::debug!("no free {} block for a huge page", HumanSize(size));
                None
            }
        }
    }

    /// Frees a huge page, which may have been split and partly freed page by page
    /// before; `size` is whatever is left of it.
    pub fn free_huge_page(&self, page: PhysicalAddress, size: usize) {
        self.free_pages(page, size);
    }

    /// Allocates `size` bytes of physically contiguous memory aligned to `align`.
    ///
    /// With `block` set this waits for memory instead of failing.
    pub fn alloc_pages(&self, size: usize, align: usize, block: bool) -> Option<PhysicalAddress> {
        self.alloc_pages_offset(size, 0, align, block)
    }

    /// Like [`alloc_pages`](Self::alloc_pages), but aligns `start + offset`
    /// instead of the start.
    pub fn alloc_pages_offset(&self, size: usize, offset: usize, align: usize, block: bool) -> Option<PhysicalAddress> {
        debug_assert!(size % arch::PAGE_SIZE == 0 && align.is_power_of_two());
        let mut inner = self.inner.lock();
        loop {
            inner = self.wait_for_minimum_memory(inner);
            let page = if align > arch::PAGE_SIZE {
                inner.ranges.alloc_aligned(size, offset, align)
            } else {
                inner.ranges.alloc(size, true)
            };
            if let Some(page) = page {
                self.on_alloc(&inner);
                return Some(page);
            }
            if !block || self.sched.in_emergency_context() {
                return None;
            }
            inner = self.wait_for_memory(inner, size);
        }
    }

    /// Allocates `size` bytes of contiguous memory if a free extent of the
    /// right class holds them already. Never waits for the reclaimer.
    pub fn try_alloc_pages(&self, size: usize) -> Option<PhysicalAddress> {
        debug_assert!(size % arch::PAGE_SIZE == 0);
        let mut inner = self.wait_for_minimum_memory(self.inner.lock());
        let page = inner.ranges.alloc(size, false);
        if page.is_some() {
            self.on_alloc(&inner);
        }
        page
    }

    pub fn free_pages(&self, start: PhysicalAddress, size: usize) {
        let mut inner = self.inner.lock();
        inner.ranges.free(start, size);
        self.stats.set_free(inner.ranges.free_bytes());
        self.reclaimer.unstall();
        if inner.waiters.has_pending() {
            self.wake_waiters(&mut inner);
        }
    }

    fn on_alloc(&self, inner: &MutexGuard<'_, Inner>) {
        self.stats.set_free(inner.ranges.free_bytes());
        if self.stats.free() < self.stats.watermark_lo() {
            self.wake_reclaimer();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sched::Worker;
    use crate::testing::{TEST_MEMORY, TestScheduler, setup_memory};

    fn setup() -> (Arc<TestScheduler>, PhysicalMemory) {
        setup_memory(1)
    }

    #[test]
    fn accounts_boot_memory() {
        let (_, memory) = setup();
        assert_eq!(memory.stats().total(), TEST_MEMORY - arch::PAGE_SIZE);
        // One page holds the boundary bitmap.
        assert_eq!(memory.stats().free(), TEST_MEMORY - 2 * arch::PAGE_SIZE);
        assert_eq!(memory.stats().watermark_lo(), memory.stats().total() / 10);
    }

    #[test]
    fn page_alloc_and_free_keep_stats_current() {
        let (_, memory) = setup();
        let free = memory.stats().free();
        let page = memory.alloc_zeroed_page().unwrap();
        assert_eq!(memory.stats().free(), free - arch::PAGE_SIZE);

        // SAFETY: the page is ours.
        let bytes = unsafe { core::slice::from_raw_parts(page.to_ptr::<u8>(), arch::PAGE_SIZE) };
        assert!(bytes.iter().all(|&b| b == 0));

        memory.free_page(page);
        assert_eq!(memory.stats().free(), free);
    }

    #[test]
    fn huge_pages_are_aligned() {
        let (_, memory) = setup();
        let huge = memory.alloc_huge_page(arch::HUGE_PAGE_SIZE).unwrap();
        assert!(huge.is_aligned(arch::HUGE_PAGE_SIZE));
        memory.free_huge_page(huge, arch::HUGE_PAGE_SIZE);
    }

    #[test]
    fn offset_alignment_applies_past_the_start() {
        let (_, memory) = setup();
        let align = 4 * arch::HUGE_PAGE_SIZE;
        let block = memory
            .alloc_pages_offset(3 * arch::PAGE_SIZE, arch::PAGE_SIZE, align, false)
            .unwrap();
        assert!((block + arch::PAGE_SIZE).is_aligned(align));
        memory.free_pages(block, 3 * arch::PAGE_SIZE);
    }

    #[test]
    fn huge_page_failure_does_not_wait() {
        let (_, memory) = setup();
        assert!(memory.alloc_huge_page(TEST_MEMORY).is_none());
    }

    #[test]
    fn dropping_below_watermark_wakes_the_reclaimer() {
        let (sched, memory) = setup();
        let keep = memory.stats().watermark_lo() / 2;
        let size = crate::address::align_down(memory.stats().free() - keep, arch::PAGE_SIZE);
        let block = memory.alloc_pages(size, arch::PAGE_SIZE, false).unwrap();

        assert_eq!(sched.take_woken(), [Worker::Reclaimer]);
        memory.free_pages(block, size);
    }
}
