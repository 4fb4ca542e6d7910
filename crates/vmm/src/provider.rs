//! Where the pages of a mapping come from, and where they go back to.

use alloc::sync::Arc;
use alloc::vec;

use crate::address::align_up;
use crate::file::{FileBackend, FileIdentity, ShmFile};
use crate::memory::PhysicalMemory;
use crate::{PhysicalAddress, VmError, arch};

#[derive(Clone)]
pub(crate) enum Backing {
    /// Fresh memory, zero filled unless the mapping asked otherwise.
    Anonymous { zero: bool },
    /// Private copies of file content, written back on sync when shared.
    File { file: Arc<dyn FileBackend>, offset: usize },
    /// Pages owned by a shared-memory file.
    Shm { shm: Arc<ShmFile>, offset: usize },
}

impl Backing {
    /// Offset into the backing object of the mapping's first byte.
    pub fn offset(&self) -> usize {
        match self {
            Backing::Anonymous { .. } => 0,
            Backing::File { offset, .. } | Backing::Shm { offset, .. } => *offset,
        }
    }

    pub fn file(&self) -> Option<&Arc<dyn FileBackend>> {
        match self {
            Backing::File { file, .. } => Some(file),
            _ => None,
        }
    }

    pub fn identity(&self) -> Option<FileIdentity> {
        match self {
            Backing::Anonymous { .. } => None,
            Backing::File { file, .. } => Some(file.identity()),
            Backing::Shm { shm, .. } => Some(shm.identity()),
        }
    }

    /// Bytes of the backing object from the mapping's start; `None` if unbounded.
    pub fn available(&self) -> Option<usize> {
        match self {
            Backing::Anonymous { .. } => None,
            Backing::File { file, offset } => Some(align_up(file.size(), arch::PAGE_SIZE).saturating_sub(*offset)),
            Backing::Shm { shm, offset } => Some(align_up(shm.size(), arch::PAGE_SIZE).saturating_sub(*offset)),
        }
    }

    /// The same backing, seen from `delta` bytes further into the mapping.
    pub fn split(&self, delta: usize) -> Backing {
        match self {
            Backing::Anonymous { zero } => Backing::Anonymous { zero: *zero },
            Backing::File { file, offset } => Backing::File {
                file: file.clone(),
                offset: offset + delta,
            },
            Backing::Shm { shm, offset } => Backing::Shm {
                shm: shm.clone(),
                offset: offset + delta,
            },
        }
    }

    /// Supplies the page mapping byte `offset` of the mapping at `level`.
    ///
    /// Above level 0 the answer may be `None`: no large page can be had and the
    /// caller should map small pages instead.
    pub fn map(&self, memory: &PhysicalMemory, offset: usize, level: usize) -> Result<Option<PhysicalAddress>, VmError> {
        let size = arch::level_size(level);
        match self {
            Backing::Anonymous { zero } => {
                let Some(page) = alloc(memory, size)? else {
                    return Ok(None);
                };
                if *zero {
                    // SAFETY: the page was just allocated.
                    unsafe { core::ptr::write_bytes(page.to_ptr::<u8>(), 0, size) };
                }
                Ok(Some(page))
            }
            Backing::File { file, offset: base } => {
                let position = base + offset;
                if level > 0 && position + size > file.size() {
                    return Ok(None);
                }
                let Some(page) = alloc(memory, size)? else {
                    return Ok(None);
                };
                // SAFETY: as above.
                let bytes = unsafe { core::slice::from_raw_parts_mut(page.to_ptr::<u8>(), size) };
                match file.read_at(position, bytes) {
                    Ok(read) => {
                        bytes[read..].fill(0);
                        Ok(Some(page))
                    }
                    Err(err) => {
                        release_block(memory, page, level);
                        Err(err)
                    }
                }
            }
            Backing::Shm { shm, offset: base } => {
                let position = base + offset;
                if level > 0 && position % arch::HUGE_PAGE_SIZE != 0 {
                    return Ok(None);
                }
                shm.page(position, memory).map(Some)
            }
        }
    }

    /// Takes back a page [`map`](Self::map) supplied.
    pub fn release(&self, memory: &PhysicalMemory, page: PhysicalAddress, level: usize) {
        match self {
            Backing::Shm { .. } => {}
            _ => release_block(memory, page, level),
        }
    }

    /// Writes dirty content back. Only file backings have anywhere to write to.
    pub fn write_back(&self, offset: usize, data: &[u8]) -> Result<usize, VmError> {
        match self {
            Backing::File { file, offset: base } => {
                let position = base + offset;
                let len = data.len().min(file.size().saturating_sub(position));
                if len == 0 {
                    return Ok(0);
                }
                file.write_at(position, &data[..len])
            }
            _ => Ok(0),
        }
    }
}

fn alloc(memory: &PhysicalMemory, size: usize) -> Result<Option<PhysicalAddress>, VmError> {
    if size == arch::PAGE_SIZE {
        memory.alloc_page().map(Some).ok_or(VmError::OutOfMemory)
    } else {
        Ok(memory.alloc_huge_page(size))
    }
}

fn release_block(memory: &PhysicalMemory, page: PhysicalAddress, level: usize) {
    if level == 0 {
        memory.free_page(page);
    } else {
        memory.free_huge_page(page, arch::level_size(level));
    }
}

/// Reads a page back as bytes; used by tests and the write-back path.
pub(crate) fn page_bytes(page: PhysicalAddress, size: usize) -> alloc::vec::Vec<u8> {
    let mut data = vec![0; size];
    // SAFETY: `page` is mapped memory of at least `size` bytes.
    unsafe { core::ptr::copy_nonoverlapping(page.to_ptr::<u8>(), data.as_mut_ptr(), size) };
    data
}
