//! Architecture-specific paging definitions.
//!
//! The hardware backend is selected for kernel builds. Tests and the
//! `software-emulation` feature use a scaled-down software model of the same
//! radix page table so that every walker operation can run on a host.

// NOTE: the x86_64 module is compiled during tests too, so it keeps building.
#[cfg(target_arch = "x86_64")]
mod x86_64;
#[cfg(all(target_arch = "x86_64", not(test), not(feature = "software-emulation")))]
pub use self::x86_64::*;

#[cfg(any(test, feature = "software-emulation"))]
mod software;
#[cfg(any(test, feature = "software-emulation"))]
pub use software::*;

/// Number of bytes mapped by a single entry at `level`.
#[inline]
pub const fn level_size(level: usize) -> usize {
    PAGE_SIZE << (level * INDEX_BITS)
}

/// Mask selecting the offset bits inside a page mapped at `level`.
#[inline]
pub const fn level_offset_mask(level: usize) -> usize {
    level_size(level) - 1
}
