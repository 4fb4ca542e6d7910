//! Per-CPU small-object pools.
//!
//! A pool page starts with a [`PageHeader`]; the rest of the page is cut into
//! objects of the pool's size, threaded into the page's local free list. Each
//! CPU keeps, per size class, a list of its pages that still have free objects:
//! partly used pages at the front, completely free ones at the back.
//!
//! Objects freed on a CPU other than the one owning their page go to a
//! lock-free garbage sink for the `(owner, freer)` pair. Once enough have piled
//! up, the owner's collector worker is woken and returns them with ordinary
//! same-CPU frees.

use alloc::boxed::Box;
use alloc::vec::Vec;
use core::cell::{Cell, UnsafeCell};
use core::mem::size_of;
use core::ptr::{self, NonNull};
use core::sync::atomic::{AtomicBool, AtomicPtr, AtomicUsize, Ordering};

use intrusive_collections::{LinkedList, LinkedListLink, UnsafeRef, intrusive_adapter};

use crate::address::{align_down, align_up};
use crate::memory::PhysicalMemory;
use crate::sched::{PreemptGuard, Worker};
use crate::{PhysicalAddress, arch};

/// First word of every pool page.
pub(crate) const POOL_PAGE_TAG: usize = 0x706f_6f6c_7061_6765;

/// Smallest object handed out; a free object must hold a pointer.
const MIN_OBJECT: usize = 8;

#[repr(C)]
struct FreeObject {
    next: *mut FreeObject,
}

#[repr(C)]
pub(crate) struct PageHeader {
    tag: usize,
    owner: *const Pool,
    cpu: usize,
    nalloc: Cell<usize>,
    local_free: Cell<*mut FreeObject>,
    link: LinkedListLink,
}

intrusive_adapter!(PageAdapter = UnsafeRef<PageHeader>: PageHeader { link: LinkedListLink });

fn page_header(object: *const u8) -> &'static PageHeader {
    let page = align_down(object as usize, arch::PAGE_SIZE) as *const PageHeader;
    // SAFETY: callers only pass objects handed out by a pool; their page starts
    // with a header that lives as long as the page is owned by the pool.
    unsafe { &*page }
}

/// True if `page` (page-aligned) is a pool page.
///
/// # Safety
///
/// `page` must point to the start of a page owned by the heap.
pub(crate) unsafe fn is_pool_page(page: *const u8) -> bool {
    unsafe { page.cast::<usize>().read() == POOL_PAGE_TAG }
}

/// Objects of one size, with one page list per CPU.
pub(crate) struct Pool {
    size: usize,
    pages: Box<[UnsafeCell<LinkedList<PageAdapter>>]>,
}

// SAFETY: a CPU's list is only touched by that CPU with preemption disabled.
unsafe impl Send for Pool {}
unsafe impl Sync for Pool {}

impl Pool {
    fn new(size: usize, cpus: usize) -> Self {
        Self {
            size,
            pages: (0..cpus)
                .map(|_| UnsafeCell::new(LinkedList::new(PageAdapter::new())))
                .collect(),
        }
    }

    pub fn size(&self) -> usize {
        self.size
    }

    /// # Safety
    ///
    /// Preemption must be disabled on `cpu`.
    #[allow(clippy::mut_from_ref)]
    unsafe fn pages(&self, cpu: usize) -> &mut LinkedList<PageAdapter> {
        unsafe { &mut *self.pages[cpu].get() }
    }

    fn alloc(&self, guard: &mut PreemptGuard<'_>, memory: &PhysicalMemory) -> Option<NonNull<u8>> {
        loop {
            // SAFETY: preemption is disabled by `guard`.
            let pages = unsafe { self.pages(guard.cpu()) };
            if let Some(header) = pages.front().get() {
                let object = header.local_free.get();
                // SAFETY: pages on the list have at least one free object.
                header.local_free.set(unsafe { (*object).next });
                header.nalloc.set(header.nalloc.get() + 1);
                if header.local_free.get().is_null() {
                    pages.pop_front();
                }
                return NonNull::new(object.cast());
            }

            // The page allocator may block; the thread may come back on another CPU.
            let page = guard.enabled(|| memory.alloc_page())?;
            self.add_page(page, guard.cpu());
        }
    }

    fn add_page(&self, page: PhysicalAddress, cpu: usize) {
        let base = page.to_ptr::<u8>();
        let first = align_up(size_of::<PageHeader>(), self.size);
        let mut free = ptr::null_mut::<FreeObject>();
        for offset in (first..arch::PAGE_SIZE).step_by(self.size).rev() {
            // SAFETY: the page is ours and `offset` leaves room for one object.
            unsafe {
                let object = base.add(offset).cast::<FreeObject>();
                object.write(FreeObject { next: free });
                free = object;
            }
        }
        let header = base.cast::<PageHeader>();
        // SAFETY: the header fits before `first`.
        unsafe {
            header.write(PageHeader {
                tag: POOL_PAGE_TAG,
                owner: self,
                cpu,
                nalloc: Cell::new(0),
                local_free: Cell::new(free),
                link: LinkedListLink::new(),
            });
            self.pages(cpu).push_front(UnsafeRef::from_raw(header));
        }
        log::trace!("pool {} took page {} for cpu {}", self.size, page, cpu);
    }

    /// Returns `object` to its page. Runs on the page's CPU with preemption off.
    fn free_same_cpu(&self, object: NonNull<u8>, memory: &PhysicalMemory) {
        let header = page_header(object.as_ptr());
        // SAFETY: the caller runs on `header.cpu` with preemption disabled.
        let pages = unsafe { self.pages(header.cpu) };
        let listed = !header.local_free.get().is_null();
        header.nalloc.set(header.nalloc.get() - 1);

        if header.nalloc.get() == 0 && Self::has_other_page(pages, header) {
            if listed {
                // SAFETY: pages with free objects are on this CPU's list.
                unsafe { pages.cursor_mut_from_ptr(header).remove() };
            }
            let page = PhysicalAddress::from_ptr(header as *const PageHeader);
            log::trace!("pool {} returns page {}", self.size, page);
            memory.free_page(page);
            return;
        }

        if !listed {
            // SAFETY: the header is not linked anywhere.
            let link = unsafe { UnsafeRef::from_raw(header as *const PageHeader) };
            if header.nalloc.get() > 0 {
                pages.push_front(link);
            } else {
                // Free pages go last so they are the last to be broken up again.
                pages.push_back(link);
            }
        }
        let free = object.as_ptr().cast::<FreeObject>();
        // SAFETY: the object is ours again.
        unsafe { free.write(FreeObject { next: header.local_free.get() }) };
        header.local_free.set(free);
    }

    fn has_other_page(pages: &LinkedList<PageAdapter>, header: &PageHeader) -> bool {
        let other = |candidate: Option<&PageHeader>| {
            candidate.is_some_and(|candidate| !ptr::eq(candidate, header))
        };
        other(pages.front().get()) || other(pages.back().get())
    }
}

/// Lock-free stack of objects freed on one CPU for another.
struct GarbageSink {
    head: AtomicPtr<FreeObject>,
    count: AtomicUsize,
}

impl GarbageSink {
    fn new() -> Self {
        Self {
            head: AtomicPtr::new(ptr::null_mut()),
            count: AtomicUsize::new(0),
        }
    }

    /// Returns how many objects are queued, this one included.
    fn push(&self, object: *mut FreeObject) -> usize {
        // Counted before it is visible, so a concurrent take never drains more
        // than the count holds.
        let queued = self.count.fetch_add(1, Ordering::AcqRel) + 1;
        loop {
            let head = self.head.load(Ordering::Acquire);
            // SAFETY: the object is no longer in use by anybody.
            unsafe { (*object).next = head };
            if self
                .head
                .compare_exchange(head, object, Ordering::Release, Ordering::Acquire)
                .is_ok()
            {
                return queued;
            }
        }
    }

    /// Takes the whole stack.
    fn take(&self) -> *mut FreeObject {
        let head = self.head.swap(ptr::null_mut(), Ordering::AcqRel);
        let mut taken = 0;
        let mut object = head;
        while !object.is_null() {
            taken += 1;
            // SAFETY: objects on the stack stay put until their owner frees them.
            object = unsafe { (*object).next };
        }
        self.count.fetch_sub(taken, Ordering::AcqRel);
        head
    }

    fn len(&self) -> usize {
        self.count.load(Ordering::Acquire)
    }
}

/// All size classes plus the cross-CPU sinks.
pub(crate) struct Pools {
    classes: Box<[Pool]>,
    cpus: usize,
    /// Indexed `[owner * cpus + freer]`.
    sinks: Box<[GarbageSink]>,
    collect_pending: Box<[AtomicBool]>,
    gc_threshold: usize,
}

impl Pools {
    /// Largest object served by a pool.
    pub const MAX_OBJECT: usize = arch::PAGE_SIZE / 4;

    pub fn new(cpus: usize, gc_threshold: usize) -> Self {
        let classes: Vec<Pool> = (0..=Self::class_of(Self::MAX_OBJECT))
            .map(|class| Pool::new(MIN_OBJECT << class, cpus))
            .collect();
        Self {
            classes: classes.into_boxed_slice(),
            cpus,
            sinks: (0..cpus * cpus).map(|_| GarbageSink::new()).collect(),
            collect_pending: (0..cpus).map(|_| AtomicBool::new(false)).collect(),
            gc_threshold,
        }
    }

    fn class_of(size: usize) -> usize {
        let size = size.max(MIN_OBJECT);
        (usize::BITS - (size - 1).leading_zeros()) as usize - MIN_OBJECT.trailing_zeros() as usize
    }

    /// Object size actually used for a request of `size` bytes.
    pub fn rounded_size(size: usize) -> usize {
        MIN_OBJECT << Self::class_of(size)
    }

    /// Object size of a pool-allocated `object`.
    pub fn object_size(object: NonNull<u8>) -> usize {
        // SAFETY: the owner outlives all of its pages.
        unsafe { (*page_header(object.as_ptr()).owner).size() }
    }

    pub fn alloc(&self, size: usize, memory: &PhysicalMemory) -> Option<NonNull<u8>> {
        debug_assert!(size <= Self::MAX_OBJECT);
        let mut guard = PreemptGuard::new(&*memory.sched);
        if self.collect_pending[guard.cpu()].load(Ordering::Acquire) {
            self.collect(guard.cpu(), memory);
        }
        self.classes[Self::class_of(size)].alloc(&mut guard, memory)
    }

    pub fn free(&self, object: NonNull<u8>, memory: &PhysicalMemory) {
        let guard = PreemptGuard::new(&*memory.sched);
        let header = page_header(object.as_ptr());
        let cpu = guard.cpu();
        if header.cpu == cpu {
            // SAFETY: the owner outlives all of its pages.
            unsafe { (*header.owner).free_same_cpu(object, memory) };
            return;
        }

        let owner = header.cpu;
        let queued = self.sinks[owner * self.cpus + cpu].push(object.as_ptr().cast());
        if queued >= self.gc_threshold && !self.collect_pending[owner].swap(true, Ordering::AcqRel) {
            log::debug!("cpu {} has {} objects to collect from cpu {}", owner, queued, cpu);
            memory.sched.wake_worker(Worker::GarbageCollector(owner));
        }
    }

    /// Frees everything other CPUs queued for the current one.
    pub fn collect_garbage(&self, memory: &PhysicalMemory) {
        let guard = PreemptGuard::new(&*memory.sched);
        self.collect(guard.cpu(), memory);
    }

    fn collect(&self, cpu: usize, memory: &PhysicalMemory) {
        self.collect_pending[cpu].store(false, Ordering::Release);
        for freer in 0..self.cpus {
            let mut object = self.sinks[cpu * self.cpus + freer].take();
            while let Some(current) = NonNull::new(object) {
                // SAFETY: objects in a sink are unused until freed here.
                object = unsafe { current.as_ref().next };
                let header = page_header(current.as_ptr().cast());
                // SAFETY: as in `free`.
                unsafe { (*header.owner).free_same_cpu(current.cast(), memory) };
            }
        }
    }

    /// Objects waiting in the `(owner, freer)` sink.
    pub fn queued(&self, owner: usize, freer: usize) -> usize {
        self.sinks[owner * self.cpus + freer].len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{TestScheduler, setup_memory};
    use alloc::sync::Arc;

    fn setup(cpus: usize) -> (Arc<TestScheduler>, PhysicalMemory, Pools) {
        let (sched, memory) = setup_memory(cpus);
        (sched, memory, Pools::new(cpus, 4))
    }

    #[test]
    fn size_classes_are_powers_of_two() {
        assert_eq!(Pools::rounded_size(1), 8);
        assert_eq!(Pools::rounded_size(8), 8);
        assert_eq!(Pools::rounded_size(9), 16);
        assert_eq!(Pools::rounded_size(Pools::MAX_OBJECT), Pools::MAX_OBJECT);
    }

    #[test]
    fn objects_are_aligned_and_distinct() {
        let (sched, memory, pools) = setup(1);
        let a = pools.alloc(24, &memory).unwrap();
        let b = pools.alloc(24, &memory).unwrap();
        assert_ne!(a, b);
        assert_eq!(a.as_ptr() as usize % 32, 0);
        assert_eq!(Pools::object_size(a), 32);
        // SAFETY: the page starts with a pool header.
        assert!(unsafe { is_pool_page(align_down(a.as_ptr() as usize, arch::PAGE_SIZE) as *const u8) });
        assert_eq!(sched.preempt_depth(), 0);
        pools.free(a, &memory);
        pools.free(b, &memory);
    }

    #[test]
    fn empty_page_is_returned_when_another_page_has_room() {
        let (_, memory, pools) = setup(1);
        let size = Pools::MAX_OBJECT;
        let per_page = (arch::PAGE_SIZE - align_up(size_of::<PageHeader>(), size)) / size;
        let free_before = memory.stats().free();

        let first: Vec<_> = (0..per_page).map(|_| pools.alloc(size, &memory).unwrap()).collect();
        assert_eq!(memory.stats().free(), free_before - arch::PAGE_SIZE);
        let extra = pools.alloc(size, &memory).unwrap();
        assert_eq!(memory.stats().free(), free_before - 2 * arch::PAGE_SIZE);

        for object in first {
            pools.free(object, &memory);
        }
        // The second page still has room, so the emptied first page went back.
        assert_eq!(memory.stats().free(), free_before - arch::PAGE_SIZE);

        // The last page stays cached even once empty.
        pools.free(extra, &memory);
        assert_eq!(memory.stats().free(), free_before - arch::PAGE_SIZE);
    }

    #[test]
    fn freed_object_is_reused_first() {
        let (_, memory, pools) = setup(1);
        let a = pools.alloc(16, &memory).unwrap();
        let _b = pools.alloc(16, &memory).unwrap();
        pools.free(a, &memory);
        assert_eq!(pools.alloc(16, &memory).unwrap(), a);
    }

    #[test]
    fn cross_cpu_free_goes_through_the_sink() {
        let (sched, memory, pools) = setup(2);
        sched.set_cpu(0);
        let objects: Vec<_> = (0..4).map(|_| pools.alloc(8, &memory).unwrap()).collect();

        sched.set_cpu(1);
        for (i, object) in objects.iter().enumerate() {
            pools.free(*object, &memory);
            assert_eq!(pools.queued(0, 1), i + 1);
        }
        // Threshold of 4 reached: cpu 0's collector is signalled exactly once.
        assert_eq!(sched.take_woken(), [Worker::GarbageCollector(0)]);

        // Cpu 1 never sees cpu 0's objects.
        let other = pools.alloc(8, &memory).unwrap();
        assert!(!objects.contains(&other));

        sched.set_cpu(0);
        pools.collect_garbage(&memory);
        assert_eq!(pools.queued(0, 1), 0);
        let reused = pools.alloc(8, &memory).unwrap();
        assert!(objects.contains(&reused));

        sched.set_cpu(1);
        pools.free(other, &memory);
    }

    #[test]
    fn pending_collection_runs_on_next_alloc() {
        let (sched, memory, pools) = setup(2);
        sched.set_cpu(0);
        let objects: Vec<_> = (0..4).map(|_| pools.alloc(64, &memory).unwrap()).collect();
        sched.set_cpu(1);
        for object in &objects {
            pools.free(*object, &memory);
        }
        sched.set_cpu(0);
        let object = pools.alloc(64, &memory).unwrap();
        assert_eq!(pools.queued(0, 1), 0);
        assert!(objects.contains(&object));
    }

    fn drain(sink: &GarbageSink) -> usize {
        let mut object = sink.take();
        let mut drained = 0;
        while !object.is_null() {
            // SAFETY: every object was leaked from a box by the test.
            let boxed = unsafe { Box::from_raw(object) };
            object = boxed.next;
            drained += 1;
        }
        drained
    }

    fn leaked_object() -> *mut FreeObject {
        Box::into_raw(Box::new(FreeObject { next: ptr::null_mut() }))
    }

    #[test]
    fn sink_count_follows_what_was_taken() {
        let sink = GarbageSink::new();
        assert_eq!(sink.push(leaked_object()), 1);
        assert_eq!(sink.push(leaked_object()), 2);
        assert_eq!(drain(&sink), 2);
        assert_eq!(sink.len(), 0);
        assert_eq!(sink.push(leaked_object()), 1);
        assert_eq!(sink.len(), 1);
        assert_eq!(drain(&sink), 1);
    }

    #[test]
    fn sink_count_survives_concurrent_pushes() {
        const THREADS: usize = 4;
        const PER_THREAD: usize = 2000;
        let sink = Arc::new(GarbageSink::new());
        let done = Arc::new(AtomicUsize::new(0));
        let pushers: Vec<_> = (0..THREADS)
            .map(|_| {
                let (sink, done) = (sink.clone(), done.clone());
                std::thread::spawn(move || {
                    for _ in 0..PER_THREAD {
                        sink.push(leaked_object());
                    }
                    done.fetch_add(1, Ordering::Release);
                })
            })
            .collect();

        let mut drained = 0;
        while done.load(Ordering::Acquire) < THREADS {
            drained += drain(&sink);
            assert!(sink.len() <= THREADS * PER_THREAD - drained);
        }
        for pusher in pushers {
            pusher.join().unwrap();
        }
        assert_eq!(sink.len(), THREADS * PER_THREAD - drained);
        assert_eq!(drain(&sink) + drained, THREADS * PER_THREAD);
        assert_eq!(sink.len(), 0);
    }
}
