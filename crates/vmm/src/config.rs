//! Tunables of the VM subsystem.

use crate::arch;

/// Configuration handed to [`Vm::new`](crate::Vm::new).
#[derive(Debug, Clone)]
pub struct VmConfig {
    /// Free memory below this percentage of total puts the reclaimer under pressure.
    pub watermark_percent: usize,
    /// Once free memory drops under this many bytes, allocations wait for shrinkers
    /// (if any are active) instead of eating the rest.
    pub min_emergency_pool: usize,
    /// Cross-CPU frees queued for one CPU before its collector is woken.
    pub gc_signal_threshold: usize,
    /// Stack pages touched before taking the VMA registry for write.
    pub stack_prefault_pages: usize,
    /// Wrap every heap object in red zones that are checked on free.
    pub debug_allocator: bool,
}

impl Default for VmConfig {
    fn default() -> Self {
        Self {
            watermark_percent: 10,
            min_emergency_pool: arch::MIN_EMERGENCY_POOL,
            gc_signal_threshold: 256,
            stack_prefault_pages: 2,
            debug_allocator: cfg!(feature = "memory-debug"),
        }
    }
}
