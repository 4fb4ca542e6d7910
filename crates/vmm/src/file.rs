//! Files as seen by the VM: the backing contract of file mappings, and
//! shared-memory files whose pages the VM owns.

use alloc::collections::BTreeMap;
use alloc::string::String;

use bitflags::bitflags;
use spin::Mutex;

use crate::memory::PhysicalMemory;
use crate::{PhysicalAddress, VmError, arch};

bitflags! {
    /// How the file was opened, and what its mount allows.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct FileMode: u32 {
        const READ = 1 << 0;
        const WRITE = 1 << 1;
        /// The file lives on a mount that forbids execution.
        const NOEXEC = 1 << 2;
    }
}

/// What the maps dump prints for a file mapping.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FileIdentity {
    pub dev: u32,
    pub inode: u64,
    pub path: String,
}

impl FileIdentity {
    pub fn major(&self) -> u32 {
        self.dev >> 8
    }

    pub fn minor(&self) -> u32 {
        self.dev & 0xff
    }
}

/// The filesystem's side of a file mapping.
pub trait FileBackend: Send + Sync {
    fn size(&self) -> usize;

    /// Reads at most `buf.len()` bytes at `offset`; short reads happen at end of file.
    fn read_at(&self, offset: usize, buf: &mut [u8]) -> Result<usize, VmError>;

    fn write_at(&self, offset: usize, buf: &[u8]) -> Result<usize, VmError>;

    /// Flushes `[start, end)` of the file. The default flushes nothing.
    fn sync(&self, start: usize, end: usize) -> Result<(), VmError> {
        let _ = (start, end);
        Ok(())
    }

    fn fsync(&self) -> Result<(), VmError>;

    fn mode(&self) -> FileMode;

    fn identity(&self) -> FileIdentity;
}

/// A memory-only file whose content lives in large pages owned by the file.
///
/// Pages are allocated zeroed on first touch and stay with the file across
/// unmaps; [`close`](ShmFile::close) gives them back.
pub struct ShmFile {
    name: String,
    size: usize,
    pages: Mutex<BTreeMap<usize, PhysicalAddress>>,
}

impl ShmFile {
    pub fn new(name: &str, size: usize) -> Self {
        Self {
            name: String::from(name),
            size,
            pages: Mutex::new(BTreeMap::new()),
        }
    }

    pub fn size(&self) -> usize {
        self.size
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Large pages currently allocated.
    pub fn resident_pages(&self) -> usize {
        self.pages.lock().len()
    }

    /// The physical address backing byte `offset` of the file.
    pub(crate) fn page(&self, offset: usize, memory: &PhysicalMemory) -> Result<PhysicalAddress, VmError> {
        let key = offset & !(arch::HUGE_PAGE_SIZE - 1);
        let mut pages = self.pages.lock();
        let huge = match pages.get(&key) {
            Some(&huge) => huge,
            None => {
                let huge = memory
                    .alloc_huge_page(arch::HUGE_PAGE_SIZE)
                    .or_else(|| memory.alloc_pages(arch::HUGE_PAGE_SIZE, arch::HUGE_PAGE_SIZE, true))
                    .ok_or(VmError::OutOfMemory)?;
                // SAFETY: the block was just allocated for us.
                unsafe { core::ptr::write_bytes(huge.to_ptr::<u8>(), 0, arch::HUGE_PAGE_SIZE) };
                pages.insert(key, huge);
                huge
            }
        };
        Ok(huge + (offset - key))
    }

    /// Releases every page. Mappings of the file must be gone by now.
    pub(crate) fn close(&self, memory: &PhysicalMemory) {
        let pages = core::mem::take(&mut *self.pages.lock());
        log::trace!("closing shm {} with {} pages", self.name, pages.len());
        for (_, huge) in pages {
            memory.free_huge_page(huge, arch::HUGE_PAGE_SIZE);
        }
    }

    pub fn identity(&self) -> FileIdentity {
        FileIdentity {
            dev: 0,
            inode: 0,
            path: alloc::format!("/dev/shm/{}", self.name),
        }
    }
}
