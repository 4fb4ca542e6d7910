#![cfg_attr(not(any(test, feature = "software-emulation")), no_std)]
#![feature(allocator_api)]

//! # Virtual Memory Manager (VMM)
//!
//! The virtual memory subsystem of a unikernel. It provides:
//!
//! - A generic page table walker and the operations run through it: populate,
//!   unpopulate, protect, dirty page write-back and translation.
//! - The VMA registry behind `mmap`, `munmap`, `mprotect`, `msync` and `mincore`,
//!   plus demand paging through [`Vm::fault`].
//! - Physical memory: a page-range allocator with boundary-bitmap coalescing,
//!   per-CPU small-object pools, and a reclaimer that runs shrinkers and parks
//!   allocations until memory frees up.
//! - A `malloc` family heap on top, usable as a `core::alloc::Allocator`.
//! - Software emulation of the paging hardware for testing in non-kernel
//!   environments.
//!
//! Everything hangs off one [`Vm`] context built at boot.

extern crate alloc;

mod address;
mod arch;
mod boot;
mod config;
mod error;
mod file;
mod heap;
mod memory;
mod ops;
mod page_range;
mod page_table;
mod pool;
mod provider;
mod range_index;
mod reclaimer;
mod sched;
mod stats;
mod vm;
mod vma;
mod walker;

#[cfg(test)]
mod testing;

pub use address::{AddrRange, AddressTranslator, PhysicalAddress, VirtualAddress};
pub use boot::BootMemoryRegion;
pub use config::VmConfig;
pub use error::{Fault, VmError};
pub use file::{FileBackend, FileIdentity, FileMode, ShmFile};
pub use memory::PhysicalMemory;
pub use range_index::{LinearMapping, MemAttr, RangeEntry, RangeOwner};
pub use reclaimer::{Pressure, Shrinker, ShrinkerId};
pub use sched::{PreemptGuard, Scheduler, Worker};
pub use stats::{HumanSize, MemoryStats, OrderStats};
pub use vm::{Access, MapSource, Vm};
pub use vma::{MmapFlags, MsyncFlags, Perm};

pub use arch::{HUGE_PAGE_SIZE, PAGE_SIZE};
#[cfg(any(test, feature = "software-emulation"))]
pub use arch::EmulatedMemory;
