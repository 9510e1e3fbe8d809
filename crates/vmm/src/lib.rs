#![cfg_attr(not(any(test, feature = "software-emulation")), no_std)]
#![feature(step_trait)]

//! # Polaris Virtual Memory Manager (VMM)
//!
//! The virtual-memory core of the Polaris kernel. It provides:
//!
//! - Address spaces: one kernel singleton plus one per user process, each pairing an ordered
//!   map of virtual memory areas with a hardware translation map.
//! - Area creation with exact, lowest-fit and highest-fit placement, backed either by
//!   zero-filled anonymous memory or by a file.
//! - Demand paging through the page fault resolver, including copy-on-write after
//!   [`clone_address_space`] and downward growth of stack-like areas.
//! - Software emulation of a 32-bit two-level MMU for testing in non-kernel environments.
//!
//! Physical frames, backing files and inter-processor TLB shootdowns are supplied by the
//! embedding kernel through the traits in [`platform`].

extern crate alloc;

mod address;
mod address_space;
mod arch;
mod area;
mod area_map;
mod error;
mod fault;
mod frame;
mod manager;
mod numbers;
pub mod platform;
mod translation_map;

#[cfg(test)]
mod testing;

pub use address::{AddressTranslator, PhysicalAddress, VirtualAddress};
pub use address_space::{AddressSpace, AddressSpaceKind};
pub use area::{Area, AreaFlags, AreaId, Backing, Placement, STACK_GROWTH_WINDOW};
pub use area_map::AreaMap;
pub use error::VmError;
pub use fault::{AccessKind, Privilege};
pub use frame::SharedFrames;
pub use manager::{
    AddressSpaceManager, clone_address_space, create_address_space, create_area, destroy_area,
    get_kernel_address_space, handle_page_fault, initialize, manager,
};
pub use numbers::{FrameNumber, PageNumber};
pub use platform::{
    BackingFile, CpuControl, CpuSet, FileError, FileHandle, FrameAllocator, Platform,
    Uniprocessor,
};
pub use translation_map::{Protection, Translation, TranslationMap};

pub use arch::{KERNEL_END, KERNEL_START, PAGE_SIZE, USER_END, USER_START};

#[cfg(any(test, feature = "software-emulation"))]
pub use arch::{EmulatedFrameAllocator, EmulatedMemory};

#[cfg(target_arch = "x86_64")]
pub use arch::decode_page_fault;
