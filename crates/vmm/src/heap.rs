//! The kernel heap: `malloc` and friends.
//!
//! Requests of up to [`Pools::MAX_OBJECT`] bytes come from the per-CPU pools.
//! Larger ones get whole pages, preceded by a header page, so every large
//! object is page aligned while no pool object ever is. `free` tells the two
//! apart by that alone.
//!
//! A large object is physically contiguous when a free extent can hold it.
//! Otherwise it gets an anonymous mapping of its own, and the header records
//! which of the two it is.

use core::alloc::{AllocError, Allocator, Layout};
use core::mem::size_of;
use core::ptr::{self, NonNull};

use crate::address::align_down;
use crate::pool::{Pools, is_pool_page};
use crate::stats::HumanSize;
use crate::{MapSource, MmapFlags, Perm, PhysicalAddress, Vm, VmError, arch};

/// Alignment of `malloc` results large enough to need it.
const MALLOC_ALIGN: usize = 16;

/// First word of the header page of a physically contiguous large object.
const LARGE_TAG: usize = 0x6c61_7267_6f62_6a21;
/// First word of the header page of a large object backed by a mapping.
const MAPPED_TAG: usize = 0x6d61_7070_6f62_6a21;

#[repr(C)]
struct LargeHeader {
    tag: usize,
    /// Pages of the block, header page included, in bytes.
    size: usize,
}

/// Red zone byte of the debug allocator.
const RED_ZONE: u8 = b'$';
const RED_ZONE_AFTER: usize = 32;
/// Bytes before the object: header plus red zone, at least.
const DEBUG_PREFIX: usize = 32;

/// Sits right before each object of the debug allocator.
#[repr(C)]
struct DebugHeader {
    /// Distance from the start of the underlying allocation to the object.
    offset: usize,
    size: usize,
}

impl Vm {
    /// Allocates `size` bytes aligned to the smaller of 16 and the size
    /// rounded up to a power of two.
    pub fn malloc(&self, size: usize) -> Option<NonNull<u8>> {
        let align = size.max(1).checked_next_power_of_two()?.min(MALLOC_ALIGN);
        self.alloc_object(size, align)
    }

    /// Allocates zeroed room for `count` objects of `size` bytes.
    pub fn calloc(&self, count: usize, size: usize) -> Option<NonNull<u8>> {
        let total = count.checked_mul(size)?;
        let object = self.malloc(total)?;
        // SAFETY: `object` holds at least `total` bytes.
        unsafe { self.fill(addr_of(object), 0, total) };
        Some(object)
    }

    /// Resizes an object, moving it if needed.
    ///
    /// `None` in means `malloc`; a zero size frees the object and returns
    /// `None`. On failure the object is left as it was.
    ///
    /// # Safety
    ///
    /// `object` must come from this heap and not have been freed.
    pub unsafe fn realloc(&self, object: Option<NonNull<u8>>, size: usize) -> Option<NonNull<u8>> {
        let Some(object) = object else {
            return self.malloc(size);
        };
        if size == 0 {
            // SAFETY: forwarded to the caller.
            unsafe { self.free(object) };
            return None;
        }
        // SAFETY: as above.
        let old = unsafe { self.usable_size(object) };
        if size <= old && !self.config.debug_allocator {
            return Some(object);
        }
        let moved = self.malloc(size)?;
        // SAFETY: both objects are live and hold at least `min(old, size)` bytes.
        unsafe {
            self.copy(addr_of(object), addr_of(moved), old.min(size));
            self.free(object);
        }
        Some(moved)
    }

    /// [`realloc`](Self::realloc) for `count` objects of `size` bytes, failing
    /// with `OutOfMemory` when the product overflows.
    ///
    /// # Safety
    ///
    /// As for [`realloc`](Self::realloc).
    pub unsafe fn reallocarray(
        &self,
        object: Option<NonNull<u8>>,
        count: usize,
        size: usize,
    ) -> Result<Option<NonNull<u8>>, VmError> {
        let total = count.checked_mul(size).ok_or(VmError::OutOfMemory)?;
        // SAFETY: forwarded to the caller.
        match unsafe { self.realloc(object, total) } {
            None if total > 0 => Err(VmError::OutOfMemory),
            moved => Ok(moved),
        }
    }

    /// # Safety
    ///
    /// `object` must come from this heap and not have been freed.
    pub unsafe fn free(&self, object: NonNull<u8>) {
        if self.config.debug_allocator {
            // SAFETY: forwarded to the caller.
            unsafe { self.debug_free(object) }
        } else {
            // SAFETY: as above.
            unsafe { self.raw_free(object) }
        }
    }

    pub fn posix_memalign(&self, align: usize, size: usize) -> Result<NonNull<u8>, VmError> {
        if !align.is_power_of_two() || align % size_of::<usize>() != 0 {
            return Err(VmError::InvalidArgument);
        }
        self.alloc_object(size, align).ok_or(VmError::OutOfMemory)
    }

    pub fn aligned_alloc(&self, align: usize, size: usize) -> Option<NonNull<u8>> {
        if !align.is_power_of_two() {
            return None;
        }
        self.alloc_object(size, align)
    }

    pub fn memalign(&self, align: usize, size: usize) -> Option<NonNull<u8>> {
        self.aligned_alloc(align, size)
    }

    /// Bytes usable at `object`, at least what was asked for.
    ///
    /// # Safety
    ///
    /// `object`, if any, must be a live object of this heap.
    pub unsafe fn malloc_usable_size(&self, object: Option<NonNull<u8>>) -> usize {
        // SAFETY: forwarded to the caller.
        object.map_or(0, |object| unsafe { self.usable_size(object) })
    }

    unsafe fn usable_size(&self, object: NonNull<u8>) -> usize {
        if self.config.debug_allocator {
            // SAFETY: debug objects are preceded by their header.
            return unsafe { self.debug_header(object).read().size };
        }
        if is_large(object) {
            // SAFETY: large objects follow their header page.
            unsafe { (*self.large_header(object)).size - arch::PAGE_SIZE }
        } else {
            Pools::object_size(object)
        }
    }

    fn alloc_object(&self, size: usize, align: usize) -> Option<NonNull<u8>> {
        if self.config.debug_allocator {
            self.debug_alloc(size, align)
        } else {
            self.raw_alloc(size, align)
        }
    }

    fn raw_alloc(&self, size: usize, align: usize) -> Option<NonNull<u8>> {
        // Pool objects are aligned to their size.
        let pooled = size.max(1).max(align);
        if pooled <= Pools::MAX_OBJECT {
            self.pools.alloc(pooled, &self.memory)
        } else {
            self.malloc_large(size, align)
        }
    }

    fn malloc_large(&self, size: usize, align: usize) -> Option<NonNull<u8>> {
        let total = size
            .checked_add(2 * arch::PAGE_SIZE - 1)
            .map(|padded| align_down(padded, arch::PAGE_SIZE))
            .filter(|total| *total <= self.memory.stats().total())?;

        if align > arch::PAGE_SIZE {
            let Some(block) = self.memory.alloc_pages_offset(total, arch::PAGE_SIZE, align, true) else {
                log::debug!("no {} block for a large object", HumanSize(total));
                return None;
            };
            return Some(contiguous_object(block, total));
        }
        if let Some(block) = self.memory.try_alloc_pages(total) {
            return Some(contiguous_object(block, total));
        }
        self.mapped_object(total)
    }

    /// Backs a large object with its own mapping when no extent can hold it.
    fn mapped_object(&self, total: usize) -> Option<NonNull<u8>> {
        let base = self
            .mmap(
                0,
                total,
                Perm::READ | Perm::WRITE,
                MmapFlags::PRIVATE | MmapFlags::POPULATE | MmapFlags::UNINITIALIZED,
                MapSource::Anonymous,
                0,
            )
            .inspect_err(|err| log::debug!("cannot map a {} large object: {}", HumanSize(total), err))
            .ok()?
            .as_usize();
        log::trace!("large object of {} mapped at {:#x}", HumanSize(total), base);
        let header = self.host_ptr(base).cast::<LargeHeader>();
        // SAFETY: the mapping is ours, populated, and starts with its header page.
        unsafe { header.write(LargeHeader { tag: MAPPED_TAG, size: total }) };
        NonNull::new((base + arch::PAGE_SIZE) as *mut u8)
    }

    unsafe fn raw_free(&self, object: NonNull<u8>) {
        if !is_large(object) {
            let page = align_down(addr_of(object), arch::PAGE_SIZE) as *const u8;
            // SAFETY: the object lies in a page of the heap.
            debug_assert!(unsafe { is_pool_page(page) }, "free of {object:p}: not a heap object");
            self.pools.free(object, &self.memory);
            return;
        }

        let header = self.large_header(object);
        // SAFETY: large objects follow their header page.
        let (tag, size) = unsafe { ((*header).tag, (*header).size) };
        match tag {
            LARGE_TAG => {
                // SAFETY: as above; the tag is cleared so a double free is caught.
                unsafe { (*header).tag = 0 };
                self.memory.free_pages(PhysicalAddress::from_ptr(header), size);
            }
            MAPPED_TAG => {
                let base = addr_of(object) - arch::PAGE_SIZE;
                // SAFETY: as above.
                unsafe { (*header).tag = 0 };
                if let Err(err) = self.munmap(base, size) {
                    log::error!("cannot unmap large object {:p}: {}", object, err);
                }
            }
            _ => {
                log::error!("free of {:p} with a bad header tag {:#x}", object, tag);
                panic!("free of a pointer the heap never handed out");
            }
        }
    }

    /// Wraps the object between red zones and records its size.
    fn debug_alloc(&self, size: usize, align: usize) -> Option<NonNull<u8>> {
        let prefix = align.max(DEBUG_PREFIX);
        let total = prefix.checked_add(size)?.checked_add(RED_ZONE_AFTER)?;
        let raw = self.raw_alloc(total, prefix)?;
        // SAFETY: `raw` holds `total` bytes.
        unsafe {
            self.fill(addr_of(raw), RED_ZONE, total);
            let object = raw.add(prefix);
            self.debug_header(object).write(DebugHeader { offset: prefix, size });
            Some(object)
        }
    }

    unsafe fn debug_free(&self, object: NonNull<u8>) {
        // SAFETY: debug objects are preceded by their header.
        let DebugHeader { offset, size } = unsafe { self.debug_header(object).read() };
        // SAFETY: `offset` leads back to the start of the underlying allocation.
        let raw = unsafe { object.sub(offset) };
        let before = offset - size_of::<DebugHeader>();
        // SAFETY: both red zones lie inside the underlying allocation.
        let intact = unsafe {
            self.all_equal(addr_of(raw), before, RED_ZONE)
                && self.all_equal(addr_of(object) + size, RED_ZONE_AFTER, RED_ZONE)
        };
        if !intact {
            log::error!("heap object {:p} of {} bytes overran its red zone", object, size);
            panic!("heap red zone corrupted");
        }
        // SAFETY: the object is dead; poison it before giving it back.
        unsafe {
            self.fill(addr_of(object), RED_ZONE, size);
            self.raw_free(raw);
        }
    }

    fn large_header(&self, object: NonNull<u8>) -> *mut LargeHeader {
        self.host_ptr(addr_of(object) - arch::PAGE_SIZE).cast()
    }

    fn debug_header(&self, object: NonNull<u8>) -> *mut DebugHeader {
        self.host_ptr(addr_of(object) - size_of::<DebugHeader>()).cast()
    }

    /// Where the heap byte at `addr` can be reached from here.
    #[cfg(any(test, feature = "software-emulation"))]
    fn host_ptr(&self, addr: usize) -> *mut u8 {
        // Emulated page tables are never walked by the host CPU.
        if is_mapped(addr) {
            if let Some(phys) = self.virt_to_phys(addr) {
                return phys.to_ptr();
            }
            log::error!("heap address {:#x} is not populated", addr);
        }
        addr as *mut u8
    }

    #[cfg(not(any(test, feature = "software-emulation")))]
    fn host_ptr(&self, addr: usize) -> *mut u8 {
        addr as *mut u8
    }

    /// Bytes from `addr` that are contiguous in [`host_ptr`](Self::host_ptr).
    fn host_run(addr: usize) -> usize {
        if is_mapped(addr) {
            arch::PAGE_SIZE - addr % arch::PAGE_SIZE
        } else {
            usize::MAX
        }
    }

    /// # Safety
    ///
    /// `[addr, addr + len)` must lie inside one live heap allocation.
    unsafe fn fill(&self, addr: usize, byte: u8, len: usize) {
        let mut done = 0;
        while done < len {
            let run = (len - done).min(Self::host_run(addr + done));
            // SAFETY: forwarded to the caller; runs never leave a page of a mapping.
            unsafe { ptr::write_bytes(self.host_ptr(addr + done), byte, run) };
            done += run;
        }
    }

    /// # Safety
    ///
    /// Both ranges must lie inside live heap allocations and not overlap.
    unsafe fn copy(&self, from: usize, to: usize, len: usize) {
        let mut done = 0;
        while done < len {
            let run = (len - done)
                .min(Self::host_run(from + done))
                .min(Self::host_run(to + done));
            // SAFETY: as for `fill`.
            unsafe { ptr::copy_nonoverlapping(self.host_ptr(from + done), self.host_ptr(to + done), run) };
            done += run;
        }
    }

    /// # Safety
    ///
    /// As for [`fill`](Self::fill).
    unsafe fn all_equal(&self, addr: usize, len: usize, byte: u8) -> bool {
        let mut done = 0;
        while done < len {
            let run = (len - done).min(Self::host_run(addr + done));
            // SAFETY: as for `fill`.
            let bytes = unsafe { core::slice::from_raw_parts(self.host_ptr(addr + done), run) };
            if bytes.iter().any(|&b| b != byte) {
                return false;
            }
            done += run;
        }
        true
    }
}

fn contiguous_object(block: PhysicalAddress, total: usize) -> NonNull<u8> {
    let header = block.to_ptr::<LargeHeader>();
    // SAFETY: the block is ours and starts with its header page.
    unsafe { header.write(LargeHeader { tag: LARGE_TAG, size: total }) };
    // SAFETY: direct map pointers are never null.
    unsafe { NonNull::new_unchecked((block + arch::PAGE_SIZE).to_ptr::<u8>()) }
}

fn addr_of(object: NonNull<u8>) -> usize {
    object.as_ptr() as usize
}

fn is_large(object: NonNull<u8>) -> bool {
    addr_of(object) % arch::PAGE_SIZE == 0
}

/// Whether `addr` lies where mappings live rather than in the direct map.
fn is_mapped(addr: usize) -> bool {
    addr < arch::UPPER_VMA_LIMIT
}

// SAFETY: objects stay valid until freed and honour the layout's alignment.
unsafe impl Allocator for Vm {
    fn allocate(&self, layout: Layout) -> Result<NonNull<[u8]>, AllocError> {
        let object = self.alloc_object(layout.size(), layout.align()).ok_or(AllocError)?;
        Ok(NonNull::slice_from_raw_parts(object, layout.size()))
    }

    unsafe fn deallocate(&self, ptr: NonNull<u8>, _layout: Layout) {
        // SAFETY: `ptr` was handed out by `allocate`.
        unsafe { self.free(ptr) }
    }
}
