//! Page table entry flags for software emulation.

bitflags::bitflags! {
    /// Flag bits of an emulated page table entry.
    ///
    /// Bit positions mirror x86_64 so that entries read the same in a debugger.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct PageFlags: usize {
        const PRESENT = 1 << 0;
        const WRITABLE = 1 << 1;
        const USER = 1 << 2;
        /// Software copy-on-write marker, ignored by the emulated MMU.
        const COW = 1 << 3;
        const ACCESSED = 1 << 5;
        const DIRTY = 1 << 6;
        const LARGE = 1 << 7;
        const NO_EXECUTE = 1 << 63;
    }
}

impl PageFlags {
    pub fn is_present(self) -> bool {
        self.contains(Self::PRESENT)
    }

    pub fn set_present(&mut self, present: bool) {
        self.set(Self::PRESENT, present);
    }

    pub fn is_writable(self) -> bool {
        self.contains(Self::WRITABLE)
    }

    pub fn set_writable(&mut self, writable: bool) {
        self.set(Self::WRITABLE, writable);
    }

    pub fn is_executable(self) -> bool {
        !self.contains(Self::NO_EXECUTE)
    }

    pub fn set_executable(&mut self, executable: bool) {
        self.set(Self::NO_EXECUTE, !executable);
    }

    pub fn is_user(self) -> bool {
        self.contains(Self::USER)
    }

    pub fn set_user(&mut self, user: bool) {
        self.set(Self::USER, user);
    }

    pub fn is_dirty(self) -> bool {
        self.contains(Self::DIRTY)
    }

    pub fn set_dirty(&mut self, dirty: bool) {
        self.set(Self::DIRTY, dirty);
    }

    pub fn is_large(self) -> bool {
        self.contains(Self::LARGE)
    }

    pub fn set_large(&mut self, large: bool) {
        self.set(Self::LARGE, large);
    }

    pub fn is_cow(self) -> bool {
        self.contains(Self::COW)
    }

    pub fn set_cow(&mut self, cow: bool) {
        self.set(Self::COW, cow);
    }
}
