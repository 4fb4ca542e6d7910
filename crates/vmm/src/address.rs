//! Physical and virtual address types, address ranges and the translator that
//! turns physical addresses into dereferenceable pointers.

use core::fmt;
use core::ops::{Add, Sub};

#[cfg(any(test, feature = "software-emulation"))]
use alloc::sync::Arc;

use crate::arch;

#[cfg(any(test, feature = "software-emulation"))]
use crate::arch::EmulatedMemory;

/// Converts between physical addresses and kernel pointers.
///
/// - Hardware: all of physical memory is mapped at a fixed offset.
/// - Emulated: physical memory is a host buffer; tests get one per thread.
pub enum AddressTranslator {
    Hardware { direct_map_offset: usize },
    #[cfg(any(test, feature = "software-emulation"))]
    Emulated(Arc<EmulatedMemory>),
}

impl AddressTranslator {
    pub const fn hardware(direct_map_offset: usize) -> Self {
        Self::Hardware { direct_map_offset }
    }

    /// Creates a translator over a fresh emulated memory of `size` bytes.
    #[cfg(any(test, feature = "software-emulation"))]
    pub fn emulated(size: usize) -> Self {
        Self::Emulated(Arc::new(EmulatedMemory::new(size)))
    }

    /// Creates a second translator over the same emulated memory, so another
    /// host thread can take part in a test.
    #[cfg(any(test, feature = "software-emulation"))]
    pub fn share(&self) -> Self {
        match self {
            Self::Hardware { direct_map_offset } => Self::hardware(*direct_map_offset),
            Self::Emulated(memory) => Self::Emulated(Arc::clone(memory)),
        }
    }

    /// Sets the translator used by this kernel (by this thread, under emulation).
    ///
    /// # Panics
    ///
    /// Panics if a translator has already been set.
    pub fn set_current(translator: AddressTranslator) {
        #[cfg(not(any(test, feature = "software-emulation")))]
        {
            if ADDRESS_TRANSLATOR.get().is_some() {
                panic!("address translator already set");
            }
            ADDRESS_TRANSLATOR.call_once(|| translator);
        }

        #[cfg(any(test, feature = "software-emulation"))]
        ADDRESS_TRANSLATOR.with(|t| {
            if t.get().is_some() {
                panic!("address translator already set");
            }
            t.call_once(|| translator);
        });
    }

    /// Returns the current translator.
    ///
    /// # Panics
    ///
    /// Panics if no translator has been set.
    pub fn current() -> &'static AddressTranslator {
        match Self::try_current() {
            Some(translator) => translator,
            None => panic!(
                "address translator not set; call AddressTranslator::set_current during initialization"
            ),
        }
    }

    pub fn try_current() -> Option<&'static AddressTranslator> {
        #[cfg(not(any(test, feature = "software-emulation")))]
        {
            ADDRESS_TRANSLATOR.get()
        }

        #[cfg(any(test, feature = "software-emulation"))]
        {
            ADDRESS_TRANSLATOR.with(|t| {
                // SAFETY: the thread-local outlives every use made by this thread
                // and a `spin::Once` is never written again after initialization.
                t.get().map(|translator| unsafe { &*(translator as *const AddressTranslator) })
            })
        }
    }

    pub fn phys_to_virt(&self, phys: usize) -> usize {
        match self {
            Self::Hardware { direct_map_offset } => phys.wrapping_add(*direct_map_offset),
            #[cfg(any(test, feature = "software-emulation"))]
            Self::Emulated(memory) => memory.translate(phys) as usize,
        }
    }

    pub fn virt_to_phys(&self, virt: usize) -> usize {
        match self {
            Self::Hardware { direct_map_offset } => virt.wrapping_sub(*direct_map_offset),
            #[cfg(any(test, feature = "software-emulation"))]
            Self::Emulated(memory) => memory.ptr_to_phys(virt as *const u8),
        }
    }
}

#[cfg(not(any(test, feature = "software-emulation")))]
static ADDRESS_TRANSLATOR: spin::Once<AddressTranslator> = spin::Once::new();

#[cfg(any(test, feature = "software-emulation"))]
std::thread_local! {
    static ADDRESS_TRANSLATOR: spin::Once<AddressTranslator> = spin::Once::new();
}

macro_rules! impl_address_common {
    ($name:ident, $doc:expr) => {
        #[doc = $doc]
        #[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
        #[repr(transparent)]
        pub struct $name(usize);

        impl $name {
            #[inline]
            pub const fn as_usize(self) -> usize {
                self.0
            }

            /// # Panics
            ///
            /// Panics if `align` is not a power of two.
            #[inline]
            pub const fn is_aligned(self, align: usize) -> bool {
                assert!(align.is_power_of_two(), "alignment must be a power of two");
                self.0 & (align - 1) == 0
            }

            #[inline]
            pub const fn align_down(self, align: usize) -> Self {
                assert!(align.is_power_of_two(), "alignment must be a power of two");
                Self(self.0 & !(align - 1))
            }

            #[inline]
            pub const fn align_up(self, align: usize) -> Self {
                assert!(align.is_power_of_two(), "alignment must be a power of two");
                Self((self.0 + align - 1) & !(align - 1))
            }
        }

        impl fmt::Debug for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, "{}({:#x})", stringify!($name), self.0)
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, "{:#x}", self.0)
            }
        }

        impl fmt::LowerHex for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                fmt::LowerHex::fmt(&self.0, f)
            }
        }

        impl Add<usize> for $name {
            type Output = Self;

            #[inline]
            fn add(self, rhs: usize) -> Self::Output {
                Self::new(self.0 + rhs)
            }
        }

        impl Sub<usize> for $name {
            type Output = Self;

            #[inline]
            fn sub(self, rhs: usize) -> Self::Output {
                Self::new(self.0 - rhs)
            }
        }

        impl Sub<$name> for $name {
            type Output = usize;

            #[inline]
            fn sub(self, rhs: $name) -> Self::Output {
                self.0 - rhs.0
            }
        }
    };
}

impl_address_common!(PhysicalAddress, "A physical memory address.");

impl PhysicalAddress {
    /// # Panics
    ///
    /// Panics if the address is wider than the architecture allows.
    #[inline]
    pub const fn new(addr: usize) -> Self {
        assert!(
            arch::validate_physical(addr),
            "physical address exceeds maximum width"
        );
        Self(addr)
    }

    /// Returns the physical address behind a kernel pointer into the direct map.
    pub fn from_ptr<T>(ptr: *const T) -> Self {
        Self::new(AddressTranslator::current().virt_to_phys(ptr as usize))
    }

    /// Returns a kernel pointer through which this physical address can be accessed.
    pub fn to_ptr<T>(self) -> *mut T {
        AddressTranslator::current().phys_to_virt(self.0) as *mut T
    }

    /// Index of the page containing this address, counted from physical zero.
    #[inline]
    pub const fn page_index(self) -> usize {
        self.0 / arch::PAGE_SIZE
    }
}

impl_address_common!(VirtualAddress, "A canonical virtual address.");

impl VirtualAddress {
    /// # Panics
    ///
    /// Panics if the address is not canonical.
    #[inline]
    pub const fn new(addr: usize) -> Self {
        assert!(arch::validate_virtual(addr), "address is not canonical");
        Self(addr)
    }

    /// Returns `None` instead of panicking on a non-canonical address.
    #[inline]
    pub const fn try_new(addr: usize) -> Option<Self> {
        if arch::validate_virtual(addr) {
            Some(Self(addr))
        } else {
            None
        }
    }

    #[inline]
    pub const fn page_offset(self) -> usize {
        self.0 & (arch::PAGE_SIZE - 1)
    }

    #[inline]
    pub const fn page_index(self, level: usize) -> usize {
        arch::page_index(self.0, level)
    }
}

/// A half-open address range `[start, end)`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct AddrRange {
    start: usize,
    end: usize,
}

impl AddrRange {
    pub const fn new(start: usize, end: usize) -> Self {
        assert!(start <= end, "address range ends before it starts");
        Self { start, end }
    }

    pub const fn start(&self) -> usize {
        self.start
    }

    pub const fn end(&self) -> usize {
        self.end
    }

    pub const fn size(&self) -> usize {
        self.end - self.start
    }

    pub const fn is_empty(&self) -> bool {
        self.start == self.end
    }

    pub const fn contains(&self, addr: usize) -> bool {
        self.start <= addr && addr < self.end
    }

    /// True if `other` lies entirely inside this range.
    pub const fn contains_range(&self, other: &AddrRange) -> bool {
        self.start <= other.start && other.end <= self.end
    }

    pub const fn intersects(&self, other: &AddrRange) -> bool {
        self.start < other.end && other.start < self.end
    }

    pub fn intersection(&self, other: &AddrRange) -> AddrRange {
        let start = self.start.max(other.start);
        let end = self.end.min(other.end).max(start);
        AddrRange { start, end }
    }
}

impl fmt::Display for AddrRange {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:#x}-{:#x}", self.start, self.end)
    }
}

#[inline]
pub(crate) const fn align_up(value: usize, align: usize) -> usize {
    (value + align - 1) & !(align - 1)
}

#[inline]
pub(crate) const fn align_down(value: usize, align: usize) -> usize {
    value & !(align - 1)
}
