//! Page table entry for software emulation.

use crate::PhysicalAddress;

use super::{MAX_PHYSICAL_BITS, PAGE_SIZE, flags::PageFlags};

/// A single emulated page table entry.
///
/// Layout:
/// - Bits 0-7: flags
/// - Bits 8-19: physical page address
/// - Bit 63: no-execute
///
/// An all-zero entry is "empty". A non-zero entry without the present bit still
/// owns its page: that is how an inaccessible (`PROT_NONE`) mapping is stored.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(transparent)]
pub struct PageEntry(usize);

impl PageEntry {
    const ADDRESS_MASK: usize = ((1 << MAX_PHYSICAL_BITS) - 1) & !(PAGE_SIZE - 1);
    const FLAGS_MASK: usize = !Self::ADDRESS_MASK;

    pub const fn empty() -> Self {
        Self(0)
    }

    pub fn new(address: PhysicalAddress, flags: PageFlags) -> Self {
        debug_assert!(
            address.is_aligned(PAGE_SIZE),
            "physical address must be page-aligned"
        );
        Self((address.as_usize() & Self::ADDRESS_MASK) | (flags.bits() & Self::FLAGS_MASK))
    }

    pub fn address(self) -> PhysicalAddress {
        PhysicalAddress::new(self.0 & Self::ADDRESS_MASK)
    }

    pub fn set_address(&mut self, address: PhysicalAddress) {
        self.0 = (address.as_usize() & Self::ADDRESS_MASK) | (self.0 & Self::FLAGS_MASK);
    }

    pub fn flags(self) -> PageFlags {
        PageFlags::from_bits_retain(self.0 & Self::FLAGS_MASK)
    }

    pub fn set_flags(&mut self, flags: PageFlags) {
        self.0 = (self.0 & Self::ADDRESS_MASK) | (flags.bits() & Self::FLAGS_MASK);
    }

    pub const fn is_empty(self) -> bool {
        self.0 == 0
    }

    pub fn is_present(self) -> bool {
        self.flags().is_present()
    }

    pub fn is_large(self) -> bool {
        self.flags().is_large()
    }

    pub const fn as_usize(self) -> usize {
        self.0
    }

    pub const fn from_usize(value: usize) -> Self {
        Self(value)
    }
}
