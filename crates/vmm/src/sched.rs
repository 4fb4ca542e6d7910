//! What the VM subsystem needs from the scheduler.

/// Background work items the VM asks the scheduler to run.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Worker {
    /// The reclaimer thread; it should call [`Vm::reclaim`](crate::Vm::reclaim).
    Reclaimer,
    /// The per-CPU collector of cross-CPU frees; it should call
    /// [`Vm::collect_garbage`](crate::Vm::collect_garbage) on that CPU.
    GarbageCollector(usize),
}

/// Scheduler services consumed by the VM subsystem.
///
/// The VM never creates threads of its own. Blocking is expressed as
/// [`wait_until`](Scheduler::wait_until); the scheduler re-evaluates the condition
/// whenever [`notify_waiters`](Scheduler::notify_waiters) is called.
pub trait Scheduler: Send + Sync {
    fn current_cpu(&self) -> usize;

    fn cpu_count(&self) -> usize;

    /// Disables preemption. Calls nest.
    fn preempt_disable(&self);

    fn preempt_enable(&self);

    /// Blocks the calling thread until `condition` returns true.
    fn wait_until(&self, condition: &dyn Fn() -> bool);

    /// Conditions passed to [`wait_until`](Scheduler::wait_until) may now hold.
    fn notify_waiters(&self) {}

    fn wake_worker(&self, worker: Worker);

    /// Makes sure the next `pages` pages of the current stack are resident, so
    /// that using them cannot fault.
    fn ensure_stack_pages(&self, pages: usize) {
        let _ = pages;
    }

    /// True on threads that must never wait for memory (the reclaimer itself).
    fn in_emergency_context(&self) -> bool {
        false
    }
}

/// A non-preemptible section on the current CPU.
pub struct PreemptGuard<'a> {
    sched: &'a dyn Scheduler,
}

impl<'a> PreemptGuard<'a> {
    pub fn new(sched: &'a dyn Scheduler) -> Self {
        sched.preempt_disable();
        Self { sched }
    }

    /// The CPU this section is pinned to.
    pub fn cpu(&self) -> usize {
        self.sched.current_cpu()
    }

    /// Runs `f` with preemption enabled; the thread may migrate meanwhile, so
    /// [`cpu`](Self::cpu) must be read again afterwards.
    pub fn enabled<R>(&mut self, f: impl FnOnce() -> R) -> R {
        self.sched.preempt_enable();
        let result = f();
        self.sched.preempt_disable();
        result
    }
}

impl Drop for PreemptGuard<'_> {
    fn drop(&mut self) {
        self.sched.preempt_enable();
    }
}
