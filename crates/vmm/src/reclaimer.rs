//! Memory pressure handling: shrinkers, the allocation wait queue and the
//! reclaim pass.
//!
//! ```text
//!   NORMAL ──free < watermark──▶ PRESSURE ──shrinkers freed enough──▶ NORMAL
//!                                    │
//!                      waiters left and nothing can be woken
//!                                    ▼
//!                                   oom
//! ```
//!
//! The reclaimer never runs on its own: the scheduler owns its thread and calls
//! [`PhysicalMemory::reclaimer_main`] (or [`PhysicalMemory::reclaim`] for a single
//! pass) when woken through [`Worker::Reclaimer`].

use alloc::sync::Arc;
use alloc::vec::Vec;
use core::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

use intrusive_collections::{LinkedList, LinkedListLink, UnsafeRef, intrusive_adapter};
use spin::MutexGuard;

use crate::memory::{Inner, PhysicalMemory};
use crate::page_range::PageRangeAllocator;
use crate::sched::Worker;
use crate::stats::HumanSize;

/// Something holding memory it can give back on request, typically a cache.
pub trait Shrinker: Send + Sync {
    fn name(&self) -> &str;

    /// Frees up to `target` bytes and returns how much was freed. `hard` is set
    /// when allocations are already blocked waiting for memory.
    fn request_memory(&self, target: usize, hard: bool) -> usize;
}

/// Handle returned by [`Reclaimer::register`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ShrinkerId(usize);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Pressure {
    Normal,
    Pressure,
}

struct Registered {
    shrinker: Arc<dyn Shrinker>,
    enabled: bool,
}

pub(crate) struct Reclaimer {
    shrinkers: spin::Mutex<Vec<Registered>>,
    active: AtomicUsize,
    /// Set by a pass that freed nothing; cleared by anything that may change
    /// the outcome of the next one.
    stalled: AtomicBool,
}

impl Reclaimer {
    pub fn new() -> Self {
        Self {
            shrinkers: spin::Mutex::new(Vec::new()),
            active: AtomicUsize::new(0),
            stalled: AtomicBool::new(false),
        }
    }

    /// Registers an enabled shrinker.
    pub fn register(&self, shrinker: Arc<dyn Shrinker>) -> ShrinkerId {
        let mut shrinkers = self.shrinkers.lock();
        log::debug!("registered shrinker {}", shrinker.name());
        shrinkers.push(Registered { shrinker, enabled: true });
        self.active.fetch_add(1, Ordering::Relaxed);
        self.unstall();
        ShrinkerId(shrinkers.len() - 1)
    }

    pub fn activate(&self, id: ShrinkerId) {
        self.set_enabled(id, true);
    }

    pub fn deactivate(&self, id: ShrinkerId) {
        self.set_enabled(id, false);
    }

    fn set_enabled(&self, id: ShrinkerId, enabled: bool) {
        let mut shrinkers = self.shrinkers.lock();
        let Some(registered) = shrinkers.get_mut(id.0) else {
            return;
        };
        if registered.enabled != enabled {
            registered.enabled = enabled;
            if enabled {
                self.active.fetch_add(1, Ordering::Relaxed);
                self.unstall();
            } else {
                self.active.fetch_sub(1, Ordering::Relaxed);
            }
        }
    }

    pub fn active_shrinkers(&self) -> usize {
        self.active.load(Ordering::Relaxed)
    }

    pub fn unstall(&self) {
        self.stalled.store(false, Ordering::Release);
    }

    fn is_stalled(&self) -> bool {
        self.stalled.load(Ordering::Acquire)
    }

    /// Asks every enabled shrinker for `target` bytes. Must be called without the
    /// physical memory lock: shrinkers free memory.
    fn shrink(&self, target: usize, hard: bool) -> usize {
        let shrinkers = self.shrinkers.lock();
        let mut freed = 0;
        for registered in shrinkers.iter().filter(|r| r.enabled) {
            let got = registered.shrinker.request_memory(target, hard);
            log::debug!(
                "shrinker {} freed {} of {}",
                registered.shrinker.name(),
                HumanSize(got),
                HumanSize(target)
            );
            freed += got;
        }
        freed
    }
}

/// A thread blocked on memory. Lives on the blocked thread's stack.
pub(crate) struct Waiter {
    bytes: usize,
    woken: AtomicBool,
    link: LinkedListLink,
}

impl Waiter {
    fn new(bytes: usize) -> Self {
        Self {
            bytes,
            woken: AtomicBool::new(false),
            link: LinkedListLink::new(),
        }
    }

    fn is_woken(&self) -> bool {
        self.woken.load(Ordering::Acquire)
    }
}

intrusive_adapter!(WaiterAdapter = UnsafeRef<Waiter>: Waiter { link: LinkedListLink });

/// Blocked allocations, smallest request first.
pub(crate) struct WaiterList {
    list: LinkedList<WaiterAdapter>,
}

// SAFETY: only touched under the physical memory lock; each waiter unlinks itself
// before its stack frame goes away.
unsafe impl Send for WaiterList {}

impl WaiterList {
    pub fn new() -> Self {
        Self {
            list: LinkedList::new(WaiterAdapter::new()),
        }
    }

    /// True if some waiter has not been woken yet.
    pub fn has_pending(&self) -> bool {
        self.list.iter().any(|waiter| !waiter.is_woken())
    }

    pub fn pending_bytes(&self) -> usize {
        self.list
            .iter()
            .filter(|waiter| !waiter.is_woken())
            .map(|waiter| waiter.bytes)
            .sum()
    }

    fn insert(&mut self, waiter: &Waiter) {
        let mut cursor = self.list.front_mut();
        while let Some(queued) = cursor.get() {
            if queued.bytes > waiter.bytes {
                break;
            }
            cursor.move_next();
        }
        // SAFETY: the waiter stays linked only while its owner is blocked.
        cursor.insert_before(unsafe { UnsafeRef::from_raw(waiter) });
    }

    fn remove(&mut self, waiter: &Waiter) {
        // SAFETY: `insert` linked this waiter into this list.
        unsafe { self.list.cursor_mut_from_ptr(waiter).remove() };
    }

    /// Wakes every waiter whose request fits in the free extents.
    ///
    /// The allocations are simulated against each extent so that, say, four
    /// waiters are not all woken by one extent that can satisfy only one of them.
    fn wake(&self, ranges: &PageRangeAllocator) -> bool {
        let mut woken = false;
        ranges.for_each(0, |_, size| {
            let mut available = size;
            let mut pending = false;
            for waiter in self.list.iter().filter(|waiter| !waiter.is_woken()) {
                if waiter.bytes <= available {
                    available -= waiter.bytes;
                    waiter.woken.store(true, Ordering::Release);
                    woken = true;
                } else {
                    pending = true;
                }
            }
            pending
        });
        woken
    }
}

impl PhysicalMemory {
    pub fn pressure_level(&self) -> Pressure {
        if self.stats.free() < self.stats.watermark_lo() {
            Pressure::Pressure
        } else {
            Pressure::Normal
        }
    }

    pub fn bytes_until_normal(&self) -> usize {
        match self.pressure_level() {
            Pressure::Pressure => self.stats.watermark_lo() - self.stats.free(),
            Pressure::Normal => 0,
        }
    }

    /// Keeps the emergency pool for shrinkers while any are active. With none,
    /// nothing could ever refill it, so the caller may use it up.
    pub(crate) fn wait_for_minimum_memory<'a>(
        &'a self,
        inner: MutexGuard<'a, Inner>,
    ) -> MutexGuard<'a, Inner> {
        if self.sched.in_emergency_context() {
            return inner;
        }
        let free = self.stats.free();
        if free >= self.min_emergency_pool || self.reclaimer.active_shrinkers() == 0 {
            return inner;
        }
        self.wait_for_memory(inner, self.min_emergency_pool - free)
    }

    /// Blocks until the reclaimer or a free makes `bytes` available, then
    /// returns with the lock held again.
    ///
    /// # Panics
    ///
    /// Panics if `bytes` exceeds all memory: without swap that can never succeed.
    pub(crate) fn wait_for_memory<'a>(
        &'a self,
        mut inner: MutexGuard<'a, Inner>,
        bytes: usize,
    ) -> MutexGuard<'a, Inner> {
        if bytes > self.stats.total() {
            log::error!(
                "allocation of {} exceeds {} of memory",
                HumanSize(bytes),
                HumanSize(self.stats.total())
            );
            panic!("Unreasonable allocation attempt, larger than memory");
        }

        log::debug!("waiting for {} of free memory", HumanSize(bytes));
        let waiter = Waiter::new(bytes);
        inner.waiters.insert(&waiter);
        let parked = Parked { memory: self, waiter: &waiter };
        drop(inner);

        self.wake_reclaimer();
        self.sched.wait_until(&|| waiter.is_woken());
        parked.resume()
    }

    pub(crate) fn wake_reclaimer(&self) {
        self.reclaimer.unstall();
        self.sched.wake_worker(Worker::Reclaimer);
    }

    pub(crate) fn wake_waiters(&self, inner: &mut MutexGuard<'_, Inner>) -> bool {
        let woken = inner.waiters.wake(&inner.ranges);
        if woken {
            self.sched.notify_waiters();
        }
        if inner.waiters.has_pending() {
            self.wake_reclaimer();
        }
        woken
    }

    /// One reclaim pass: ask the shrinkers for what it takes to leave pressure
    /// and satisfy every blocked allocation, then wake whoever can proceed.
    ///
    /// # Panics
    ///
    /// Panics (out of memory) when allocations are blocked and none of them can
    /// be satisfied after shrinking.
    pub fn reclaim(&self) -> usize {
        let (target, hard) = {
            let inner = self.inner.lock();
            let waiting = inner.waiters.pending_bytes();
            (self.bytes_until_normal() + waiting, waiting > 0)
        };

        let freed = if target > 0 && self.reclaimer.active_shrinkers() > 0 {
            // Anything freed while the shrinkers run clears this again.
            self.reclaimer.stalled.store(true, Ordering::Release);
            self.reclaimer.shrink(target, hard)
        } else {
            0
        };
        if target > 0 {
            if freed == 0 {
                log::warn!("reclaim of {} freed nothing", HumanSize(target));
            } else {
                self.reclaimer.unstall();
                log::info!("reclaimed {} of {}", HumanSize(freed), HumanSize(target));
            }
        }

        let mut inner = self.inner.lock();
        if inner.waiters.has_pending() && !self.wake_waiters(&mut inner) {
            drop(inner);
            self.oom();
        }
        freed
    }

    /// Whether the reclaimer thread has anything to do.
    ///
    /// Pressure alone does not count after a pass that freed nothing, until
    /// memory is freed, an allocation blocks, a shrinker is enabled or the
    /// reclaimer is woken.
    pub fn reclaim_needed(&self) -> bool {
        let inner = self.inner.lock();
        let shrinkable = self.reclaimer.active_shrinkers() > 0 && !self.reclaimer.is_stalled();
        (shrinkable && self.pressure_level() == Pressure::Pressure) || inner.waiters.has_pending()
    }

    /// Body of the reclaimer thread.
    pub fn reclaimer_main(&self) -> ! {
        loop {
            self.sched.wait_until(&|| self.reclaim_needed());
            self.reclaim();
        }
    }

    fn oom(&self) -> ! {
        let free = self.stats.free();
        log::error!("out of memory with {} free and blocked allocations", HumanSize(free));
        panic!(
            "out of memory: could not reclaim any further, {} KiB free",
            free >> 10
        );
    }
}

/// Keeps a waiter linked only while its owner waits, even if the wait unwinds.
struct Parked<'m, 'w> {
    memory: &'m PhysicalMemory,
    waiter: &'w Waiter,
}

impl<'m> Parked<'m, '_> {
    /// Unlinks the waiter and hands back the lock.
    fn resume(self) -> MutexGuard<'m, Inner> {
        let mut inner = self.memory.inner.lock();
        inner.waiters.remove(self.waiter);
        core::mem::forget(self);
        inner
    }
}

impl Drop for Parked<'_, '_> {
    fn drop(&mut self) {
        self.memory.inner.lock().waiters.remove(self.waiter);
    }
}
