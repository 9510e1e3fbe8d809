//! Page and frame numbers.

use core::{fmt, iter::Step};

use crate::{PhysicalAddress, VirtualAddress, arch::PAGE_SIZE};

/// Index of a physical frame. Keys the shared-frame owner table.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct FrameNumber(usize);

/// Index of a virtual page.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct PageNumber(usize);

impl FrameNumber {
    pub const fn new(number: usize) -> Self {
        Self(number)
    }

    pub const fn containing(address: PhysicalAddress) -> Self {
        Self(address.as_usize() / PAGE_SIZE)
    }

    pub const fn as_usize(self) -> usize {
        self.0
    }

    pub const fn start(self) -> PhysicalAddress {
        PhysicalAddress::new(self.0 * PAGE_SIZE)
    }
}

impl PageNumber {
    pub const fn new(number: usize) -> Self {
        Self(number)
    }

    pub const fn containing(address: VirtualAddress) -> Self {
        Self(address.as_usize() / PAGE_SIZE)
    }

    pub const fn as_usize(self) -> usize {
        self.0
    }

    pub const fn start(self) -> VirtualAddress {
        VirtualAddress::new(self.0 * PAGE_SIZE)
    }
}

macro_rules! number_traits {
    ($($name:ident),*) => {$(
        impl fmt::Debug for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, concat!(stringify!($name), "({:#x})"), self.0)
            }
        }

        impl Step for $name {
            fn steps_between(start: &Self, end: &Self) -> (usize, Option<usize>) {
                match end.0.checked_sub(start.0) {
                    Some(steps) => (steps, Some(steps)),
                    None => (0, None),
                }
            }

            fn forward_checked(start: Self, count: usize) -> Option<Self> {
                start.0.checked_add(count).map(Self)
            }

            fn backward_checked(start: Self, count: usize) -> Option<Self> {
                start.0.checked_sub(count).map(Self)
            }
        }
    )*};
}

number_traits!(FrameNumber, PageNumber);
