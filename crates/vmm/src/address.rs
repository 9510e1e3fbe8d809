//! Physical and virtual addresses.
//!
//! Both address types are validated against the selected architecture on construction, so
//! a `VirtualAddress` is always canonical and a `PhysicalAddress` always fits the physical
//! address width. The [`AddressTranslator`] is how the VM touches physical memory at all:
//! page tables and frame contents are reached through it, either via the kernel's direct map
//! or, under emulation, via the emulated memory buffer.

use core::{
    fmt,
    ops::{Add, Sub},
};

#[cfg(any(test, feature = "software-emulation"))]
use alloc::sync::Arc;

use crate::{FrameNumber, PageNumber, arch};

#[cfg(any(test, feature = "software-emulation"))]
use crate::arch::EmulatedMemory;

/// How the kernel reaches physical frames.
pub enum AddressTranslator {
    /// Every frame is mapped at `frame + direct_map_offset`.
    Hardware { direct_map_offset: usize },
    /// Frames are offsets into an emulated memory buffer.
    #[cfg(any(test, feature = "software-emulation"))]
    Emulated(Arc<EmulatedMemory>),
}

impl AddressTranslator {
    pub const fn hardware(direct_map_offset: usize) -> Self {
        Self::Hardware { direct_map_offset }
    }

    /// A translator over `size` bytes of freshly zeroed emulated memory.
    #[cfg(any(test, feature = "software-emulation"))]
    pub fn emulated(size: usize) -> Self {
        Self::Emulated(Arc::new(EmulatedMemory::new(size)))
    }

    /// A second translator over the same memory, for another thread.
    pub fn share(&self) -> Self {
        match self {
            Self::Hardware { direct_map_offset } => Self::hardware(*direct_map_offset),
            #[cfg(any(test, feature = "software-emulation"))]
            Self::Emulated(memory) => Self::Emulated(Arc::clone(memory)),
        }
    }

    #[cfg(any(test, feature = "software-emulation"))]
    pub fn memory(&self) -> Option<&Arc<EmulatedMemory>> {
        match self {
            Self::Hardware { .. } => None,
            Self::Emulated(memory) => Some(memory),
        }
    }

    /// Pointer through which the kernel can access the frame at `frame`.
    pub fn frame_pointer<T>(&self, frame: PhysicalAddress) -> *mut T {
        match self {
            Self::Hardware { direct_map_offset } => {
                frame.as_usize().wrapping_add(*direct_map_offset) as *mut T
            }
            #[cfg(any(test, feature = "software-emulation"))]
            Self::Emulated(memory) => memory.translate(frame.as_usize()).cast(),
        }
    }

    /// Physical address behind a pointer previously returned by
    /// [`frame_pointer`](Self::frame_pointer).
    pub fn physical_address<T>(&self, pointer: *const T) -> PhysicalAddress {
        let physical = match self {
            Self::Hardware { direct_map_offset } => {
                (pointer as usize).wrapping_sub(*direct_map_offset)
            }
            #[cfg(any(test, feature = "software-emulation"))]
            Self::Emulated(memory) => memory.ptr_to_phys(pointer.cast()),
        };
        PhysicalAddress::new(physical)
    }

    /// Installs the translator for the running kernel.
    ///
    /// Under emulation each thread has its own slot, so a test thread installs a fresh
    /// translator and any thread it spawns installs a [`share`](Self::share)d one.
    ///
    /// # Panics
    ///
    /// Panics if a translator is already installed.
    pub fn set_current(translator: AddressTranslator) {
        #[cfg(not(any(test, feature = "software-emulation")))]
        {
            if ADDRESS_TRANSLATOR.get().is_some() {
                panic!("address translator already set");
            }
            ADDRESS_TRANSLATOR.call_once(|| translator);
        }

        #[cfg(any(test, feature = "software-emulation"))]
        ADDRESS_TRANSLATOR.with(|slot| {
            if slot.get().is_some() {
                panic!("address translator already set");
            }
            slot.call_once(|| translator);
        });
    }

    /// The installed translator.
    ///
    /// # Panics
    ///
    /// Panics if none has been installed.
    pub fn current() -> &'static AddressTranslator {
        Self::try_current().expect("address translator used before set_current")
    }

    pub fn try_current() -> Option<&'static AddressTranslator> {
        #[cfg(not(any(test, feature = "software-emulation")))]
        {
            ADDRESS_TRANSLATOR.get()
        }

        #[cfg(any(test, feature = "software-emulation"))]
        {
            ADDRESS_TRANSLATOR.with(|slot| {
                // SAFETY: The slot is written once and lives as long as the thread, which
                // outlives every borrow handed out on it.
                slot.get()
                    .map(|translator| unsafe { &*(translator as *const AddressTranslator) })
            })
        }
    }
}

#[cfg(not(any(test, feature = "software-emulation")))]
static ADDRESS_TRANSLATOR: spin::Once<AddressTranslator> = spin::Once::new();

#[cfg(any(test, feature = "software-emulation"))]
std::thread_local! {
    static ADDRESS_TRANSLATOR: spin::Once<AddressTranslator> = spin::Once::new();
}

macro_rules! address_type {
    ($(#[$meta:meta])* $name:ident, $valid:path, $invalid:literal) => {
        $(#[$meta])*
        #[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
        #[repr(transparent)]
        pub struct $name(usize);

        impl $name {
            /// # Panics
            ///
            #[doc = concat!("Panics if `address` is ", $invalid, ".")]
            #[inline]
            pub const fn new(address: usize) -> Self {
                assert!($valid(address), concat!("address is ", $invalid));
                Self(address)
            }

            #[inline]
            pub const fn as_usize(self) -> usize {
                self.0
            }

            /// Whether the address is a multiple of `align`, which must be a power of two.
            #[inline]
            pub const fn is_aligned(self, align: usize) -> bool {
                debug_assert!(align.is_power_of_two());
                self.0 & (align - 1) == 0
            }

            /// `self + offset`, or `None` if that overflows or leaves the valid range.
            #[inline]
            pub fn checked_add(self, offset: usize) -> Option<Self> {
                self.0
                    .checked_add(offset)
                    .filter(|&sum| $valid(sum))
                    .map(Self)
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, "{:#x}", self.0)
            }
        }

        impl fmt::Debug for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.debug_tuple(stringify!($name))
                    .field(&format_args!("{:#x}", self.0))
                    .finish()
            }
        }

        impl Add<usize> for $name {
            type Output = Self;

            #[inline]
            fn add(self, offset: usize) -> Self {
                Self::new(self.0 + offset)
            }
        }

        impl Sub<usize> for $name {
            type Output = Self;

            #[inline]
            fn sub(self, offset: usize) -> Self {
                Self::new(self.0 - offset)
            }
        }

        /// Distance in bytes.
        impl Sub for $name {
            type Output = usize;

            #[inline]
            fn sub(self, other: Self) -> usize {
                self.0 - other.0
            }
        }
    };
}

address_type!(
    /// A physical address: a frame handed out by the frame allocator, or a location in one.
    PhysicalAddress,
    arch::validate_physical,
    "wider than the physical address space"
);

address_type!(
    /// A virtual address in the kernel or a user half.
    VirtualAddress,
    arch::validate_virtual,
    "not canonical"
);

impl PhysicalAddress {
    #[inline]
    pub fn frame_number(self) -> FrameNumber {
        FrameNumber::containing(self)
    }
}

impl VirtualAddress {
    /// Start of the page containing this address.
    #[inline]
    pub const fn page_base(self) -> Self {
        Self(self.0 & !(arch::PAGE_SIZE - 1))
    }

    /// Index of this address in a table at `level`, counting the leaf table as level 0.
    #[inline]
    pub const fn page_index(self, level: usize) -> usize {
        arch::page_index(self.0, level)
    }

    #[inline]
    pub fn page_number(self) -> PageNumber {
        PageNumber::containing(self)
    }
}
