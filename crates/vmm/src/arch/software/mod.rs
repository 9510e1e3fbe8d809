//! Software MMU model for testing and development.
//!
//! The model is a 32-bit, two-level MMU in the style of small embedded cores:
//! - 32-bit virtual and physical addresses
//! - 4 KiB pages (12-bit page offset)
//! - 2 levels of page tables, each a single page of 1024 32-bit entries (10-bit indices)
//! - the top gigabyte (`0xC000_0000..`) is the kernel half
//!
//! Physical memory is an [`EmulatedMemory`] buffer; page tables are ordinary frames inside it.
//! Each host thread plays the part of one CPU: [`PageTable::activate`] records the active root
//! for the calling thread and [`flush_page`] counts the invalidations it performed.

mod entry;
mod flags;
mod memory;
mod table;

use core::cell::Cell;

pub use entry::PageEntry;
pub use flags::PageFlags;
pub use memory::{EmulatedFrameAllocator, EmulatedMemory};
pub use table::PageTable;

use crate::{PhysicalAddress, VirtualAddress};

/// Maximum number of bits in an emulated physical address.
pub const MAX_PHYSICAL_BITS: usize = 32;

/// Maximum number of bits in an emulated virtual address.
pub const MAX_VIRTUAL_BITS: usize = 32;

/// Page size in bytes (4 KiB).
pub const PAGE_SIZE: usize = 4096;

/// log2 of [`PAGE_SIZE`].
pub const PAGE_SHIFT: usize = 12;

/// Number of virtual address bits consumed by each table level.
pub const INDEX_BITS: usize = 10;

/// Number of page table levels (level 1 is the root directory, level 0 holds leaves).
pub const PAGE_TABLE_LEVELS: usize = 2;

/// Number of entries in one page table.
pub const ENTRY_COUNT: usize = 1 << INDEX_BITS;

/// Lowest user address. The first page stays unmapped to catch null dereferences.
pub const USER_START: usize = 0x0000_1000;

/// End (exclusive) of the user half.
pub const USER_END: usize = 0xC000_0000;

/// Start of the kernel half.
pub const KERNEL_START: usize = 0xC000_0000;

/// End (exclusive) of the kernel half. The last page is never handed out.
pub const KERNEL_END: usize = 0xFFFF_F000;

/// Returns the table index for `address` at `level`.
#[inline]
pub const fn page_index(address: usize, level: usize) -> usize {
    assert!(level < PAGE_TABLE_LEVELS, "level out of range for software emulation (0-1)");
    (address >> (PAGE_SHIFT + level * INDEX_BITS)) & (ENTRY_COUNT - 1)
}

/// Physical addresses must fit in 32 bits.
#[inline]
pub const fn validate_physical(addr: usize) -> bool {
    addr as u64 <= u32::MAX as u64
}

/// Virtual addresses must fit in 32 bits; there is no sign extension in this model.
#[inline]
pub const fn validate_virtual(addr: usize) -> bool {
    addr as u64 <= u32::MAX as u64
}

/// Truncates an address to the 32 bits the model translates.
#[inline]
pub const fn canonicalize_virtual(addr: usize) -> usize {
    addr & 0xFFFF_FFFF
}

std::thread_local! {
    static ACTIVE_ROOT: Cell<Option<PhysicalAddress>> = const { Cell::new(None) };
    static LOCAL_FLUSHES: Cell<usize> = const { Cell::new(0) };
}

/// Returns the root table active on the calling emulated CPU.
pub fn current_root() -> Option<PhysicalAddress> {
    ACTIVE_ROOT.with(|root| root.get())
}

pub(crate) fn set_current_root(root: PhysicalAddress) {
    ACTIVE_ROOT.with(|active| active.set(Some(root)));
}

/// Invalidates the cached translation of `page` on the calling emulated CPU.
pub fn flush_page(_page: VirtualAddress) {
    LOCAL_FLUSHES.with(|flushes| flushes.set(flushes.get() + 1));
}

/// Number of local invalidations performed by the calling emulated CPU.
pub fn local_flushes() -> usize {
    LOCAL_FLUSHES.with(|flushes| flushes.get())
}
