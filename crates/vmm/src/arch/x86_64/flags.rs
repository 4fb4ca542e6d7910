//! Page table entry flags for x86_64.

use ::x86_64::structures::paging::PageTableFlags;

/// Software copy-on-write marker, one of the bits the MMU ignores.
const COW: PageTableFlags = PageTableFlags::BIT_9;

/// Flag bits of an x86_64 page table entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PageFlags(PageTableFlags);

impl PageFlags {
    pub const fn empty() -> Self {
        Self(PageTableFlags::empty())
    }

    pub const fn from_bits_retain(bits: usize) -> Self {
        Self(PageTableFlags::from_bits_retain(bits as u64))
    }

    pub const fn bits(self) -> usize {
        self.0.bits() as usize
    }

    pub fn is_present(self) -> bool {
        self.0.contains(PageTableFlags::PRESENT)
    }

    pub fn set_present(&mut self, present: bool) {
        self.0.set(PageTableFlags::PRESENT, present);
    }

    pub fn is_writable(self) -> bool {
        self.0.contains(PageTableFlags::WRITABLE)
    }

    pub fn set_writable(&mut self, writable: bool) {
        self.0.set(PageTableFlags::WRITABLE, writable);
    }

    pub fn is_executable(self) -> bool {
        !self.0.contains(PageTableFlags::NO_EXECUTE)
    }

    pub fn set_executable(&mut self, executable: bool) {
        self.0.set(PageTableFlags::NO_EXECUTE, !executable);
    }

    pub fn is_user(self) -> bool {
        self.0.contains(PageTableFlags::USER_ACCESSIBLE)
    }

    pub fn set_user(&mut self, user: bool) {
        self.0.set(PageTableFlags::USER_ACCESSIBLE, user);
    }

    pub fn is_dirty(self) -> bool {
        self.0.contains(PageTableFlags::DIRTY)
    }

    pub fn set_dirty(&mut self, dirty: bool) {
        self.0.set(PageTableFlags::DIRTY, dirty);
    }

    pub fn is_large(self) -> bool {
        self.0.contains(PageTableFlags::HUGE_PAGE)
    }

    pub fn set_large(&mut self, large: bool) {
        self.0.set(PageTableFlags::HUGE_PAGE, large);
    }

    pub fn is_cow(self) -> bool {
        self.0.contains(COW)
    }

    pub fn set_cow(&mut self, cow: bool) {
        self.0.set(COW, cow);
    }
}
