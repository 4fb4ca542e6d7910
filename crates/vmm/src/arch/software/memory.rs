//! Host buffer standing in for physical memory.

use alloc::alloc::{Layout, alloc_zeroed, dealloc};
use core::ptr::NonNull;

/// Host buffer alignment; covers every alignment the allocators are asked for in tests.
const BUFFER_ALIGN: usize = 1 << 16;

/// Emulated physical memory.
///
/// Physical address `n` is byte `n` of the buffer. The buffer is aligned well past
/// the large page size so physical alignment and host pointer alignment agree, which
/// lets allocator headers be written in place with ordinary pointer casts.
pub struct EmulatedMemory {
    base: NonNull<u8>,
    layout: Layout,
}

// SAFETY: the buffer is plain memory; synchronisation of its contents is the job
// of the allocators that hand out pieces of it.
unsafe impl Send for EmulatedMemory {}
unsafe impl Sync for EmulatedMemory {}

impl EmulatedMemory {
    /// Creates a zero-filled emulated memory region of `size` bytes.
    ///
    /// # Panics
    ///
    /// Panics if `size` is zero or the host cannot provide the buffer.
    pub fn new(size: usize) -> Self {
        assert!(size > 0, "emulated memory must not be empty");
        let layout = match Layout::from_size_align(size, BUFFER_ALIGN) {
            Ok(layout) => layout,
            Err(_) => panic!("invalid emulated memory size {size:#x}"),
        };
        // SAFETY: the layout has a non-zero size.
        let base = unsafe { alloc_zeroed(layout) };
        let Some(base) = NonNull::new(base) else {
            panic!("host could not allocate {size:#x} bytes of emulated memory");
        };
        Self { base, layout }
    }

    /// Returns the host pointer for physical address `phys`.
    pub fn translate(&self, phys: usize) -> *mut u8 {
        assert!(phys < self.size(), "physical address out of bounds");
        // SAFETY: `phys` is inside the buffer.
        unsafe { self.base.as_ptr().add(phys) }
    }

    /// Returns the physical address of a host pointer into the buffer.
    pub fn ptr_to_phys(&self, ptr: *const u8) -> usize {
        let offset = (ptr as usize).wrapping_sub(self.base.as_ptr() as usize);
        assert!(offset < self.size(), "pointer not within emulated memory");
        offset
    }

    pub fn size(&self) -> usize {
        self.layout.size()
    }
}

impl Drop for EmulatedMemory {
    fn drop(&mut self) {
        // SAFETY: allocated in `new` with the same layout.
        unsafe { dealloc(self.base.as_ptr(), self.layout) }
    }
}
