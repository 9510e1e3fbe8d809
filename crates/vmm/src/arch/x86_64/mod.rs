//! x86_64 hardware implementation.
//!
//! Four-level paging with 4 KiB pages. The lower canonical half belongs to user address
//! spaces and the upper canonical half to the kernel.

mod entry;
mod flags;
mod table;

pub use entry::PageEntry;
pub use flags::PageFlags;
pub use table::PageTable;

use x86_64::{
    VirtAddr,
    instructions::tlb,
    registers::control::Cr3,
    structures::idt::PageFaultErrorCode,
};

use crate::{AccessKind, PhysicalAddress, Privilege, VirtualAddress};

/// Maximum number of bits in a physical address.
/// This is typically 52 bits on modern CPUs, but we use 48 as a conservative default.
pub const MAX_PHYSICAL_BITS: usize = 48;

/// Maximum number of bits in a virtual address with 4-level paging.
pub const MAX_VIRTUAL_BITS: usize = 48;

/// Page size in bytes (4 KiB).
pub const PAGE_SIZE: usize = 4096;

/// log2 of [`PAGE_SIZE`].
pub const PAGE_SHIFT: usize = 12;

/// Number of virtual address bits consumed by each table level.
pub const INDEX_BITS: usize = 9;

/// PML4 (level 3) down to PT (level 0).
pub const PAGE_TABLE_LEVELS: usize = 4;

/// Number of entries in one page table.
pub const ENTRY_COUNT: usize = 1 << INDEX_BITS;

/// Lowest user address. The first page stays unmapped to catch null dereferences.
pub const USER_START: usize = 0x0000_0000_0000_1000;

/// End (exclusive) of the user half. The last page below the canonical hole is never handed
/// out, so the bound itself stays canonical.
pub const USER_END: usize = 0x0000_7FFF_FFFF_F000;

/// Start of the upper canonical half.
pub const KERNEL_START: usize = 0xFFFF_8000_0000_0000;

/// End (exclusive) of the kernel half. The last page is never handed out.
pub const KERNEL_END: usize = 0xFFFF_FFFF_FFFF_F000;

/// Returns the table index for `address` at `level`.
#[inline]
pub const fn page_index(address: usize, level: usize) -> usize {
    assert!(level < PAGE_TABLE_LEVELS, "level out of range for x86_64 page table levels");
    (address >> (PAGE_SHIFT + level * INDEX_BITS)) & (ENTRY_COUNT - 1)
}

/// Physical addresses must not exceed the maximum physical address width.
#[inline]
pub const fn validate_physical(addr: usize) -> bool {
    addr <= (1usize << MAX_PHYSICAL_BITS) - 1
}

/// Virtual addresses must be canonical (bits 48-63 sign-extended from bit 47).
#[inline]
pub const fn validate_virtual(addr: usize) -> bool {
    canonicalize_virtual(addr) == addr
}

/// Sign-extends bit 47 to bits 48-63.
#[inline]
pub const fn canonicalize_virtual(addr: usize) -> usize {
    if (addr & (1 << 47)) != 0 {
        addr | 0xFFFF_0000_0000_0000
    } else {
        addr & 0x0000_FFFF_FFFF_FFFF
    }
}

/// Returns the PML4 currently loaded in CR3.
pub fn current_root() -> Option<PhysicalAddress> {
    let (frame, _) = Cr3::read();
    Some(PhysicalAddress::new(frame.start_address().as_u64() as usize))
}

/// Invalidates the TLB entry for `page` on the current CPU.
pub fn flush_page(page: VirtualAddress) {
    tlb::flush(VirtAddr::new(page.as_usize() as u64));
}

/// Converts the page fault error code pushed by the CPU into the access that faulted.
pub fn decode_page_fault(error_code: PageFaultErrorCode) -> (AccessKind, Privilege) {
    let access = if error_code.contains(PageFaultErrorCode::INSTRUCTION_FETCH) {
        AccessKind::Execute
    } else if error_code.contains(PageFaultErrorCode::CAUSED_BY_WRITE) {
        AccessKind::Write
    } else {
        AccessKind::Read
    };

    let privilege = if error_code.contains(PageFaultErrorCode::USER_MODE) {
        Privilege::User
    } else {
        Privilege::Kernel
    };

    (access, privilege)
}
