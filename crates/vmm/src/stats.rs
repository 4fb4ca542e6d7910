//! Memory accounting and its display helpers.

use core::fmt;
use core::sync::atomic::{AtomicUsize, Ordering};

/// Byte count rendered with a binary unit suffix, e.g. `12KiB` or `3.5MiB`.
#[derive(Clone, Copy, PartialEq, Eq)]
pub struct HumanSize(pub usize);

impl fmt::Display for HumanSize {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        const UNITS: [&str; 5] = ["B", "KiB", "MiB", "GiB", "TiB"];

        let mut unit = 0;
        let mut whole = self.0;
        let mut rest = 0;
        while whole >= 1024 && unit < UNITS.len() - 1 {
            rest = whole % 1024;
            whole /= 1024;
            unit += 1;
        }
        let tenths = rest * 10 / 1024;
        if tenths == 0 {
            write!(f, "{}{}", whole, UNITS[unit])
        } else {
            write!(f, "{}.{}{}", whole, tenths, UNITS[unit])
        }
    }
}

impl fmt::Debug for HumanSize {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} ({} bytes)", self, self.0)
    }
}

/// Totals kept by the physical allocator.
///
/// Free memory is exactly what sits in the page-range allocator; it starts at
/// zero and grows as boot memory is added.
#[derive(Debug, Default)]
pub struct MemoryStats {
    total: AtomicUsize,
    free: AtomicUsize,
    watermark_lo: AtomicUsize,
}

impl MemoryStats {
    pub fn total(&self) -> usize {
        self.total.load(Ordering::Relaxed)
    }

    pub fn free(&self) -> usize {
        self.free.load(Ordering::Relaxed)
    }

    /// Below this, the reclaimer is under pressure.
    pub fn watermark_lo(&self) -> usize {
        self.watermark_lo.load(Ordering::Relaxed)
    }

    /// Memory that can be handed out before the reclaimer has to act.
    pub fn max_no_reclaim(&self) -> usize {
        self.total().saturating_sub(self.watermark_lo())
    }

    pub(crate) fn on_new_memory(&self, bytes: usize, watermark_percent: usize) {
        let total = self.total.fetch_add(bytes, Ordering::Relaxed) + bytes;
        self.watermark_lo
            .store(total * watermark_percent / 100, Ordering::Relaxed);
    }

    pub(crate) fn set_free(&self, bytes: usize) {
        self.free.store(bytes, Ordering::Relaxed);
    }
}

/// Free extents of one size class of the page-range allocator.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct OrderStats {
    pub ranges: usize,
    pub bytes: usize,
}
