//! Page table structure for x86_64.

use x86_64::{
    PhysAddr,
    registers::control::{Cr3, Cr3Flags},
    structures::paging::PhysFrame,
};

use crate::{PhysicalAddress, address::AddressTranslator};

use super::{ENTRY_COUNT, entry::PageEntry};

/// One level of the x86_64 page table hierarchy: PML4 (level 3), PDPT (level 2),
/// PD (level 1) or PT (level 0).
///
/// Tables live in frames obtained from the frame allocator and are accessed through the
/// direct map; a zeroed frame is a valid empty table.
#[repr(transparent)]
pub struct PageTable(x86_64::structures::paging::PageTable);

impl PageTable {
    /// Returns the entry at `index`.
    ///
    /// # Panics
    /// Panics if index >= 512.
    pub fn entry(&self, index: usize) -> PageEntry {
        assert!(index < ENTRY_COUNT, "page table index out of bounds");
        // SAFETY: PageEntry is a transparent u64 with the same layout as the x86_64 entry.
        unsafe { *(&self.0[index] as *const _ as *const PageEntry) }
    }

    /// Returns a mutable reference to the entry at `index`.
    ///
    /// # Panics
    /// Panics if index >= 512.
    pub fn entry_mut(&mut self, index: usize) -> &mut PageEntry {
        assert!(index < ENTRY_COUNT, "page table index out of bounds");
        // SAFETY: As above.
        unsafe { &mut *(&mut self.0[index] as *mut _ as *mut PageEntry) }
    }

    /// Returns the physical address of this table via the direct map.
    pub fn physical_address(&self) -> PhysicalAddress {
        AddressTranslator::current().physical_address(self as *const Self)
    }

    /// Loads this table into CR3.
    ///
    /// # Safety
    /// The table must map the kernel, including the code performing the switch and the
    /// current stack, and must stay alive while it is loaded.
    pub unsafe fn activate(&self) {
        let frame = PhysFrame::containing_address(PhysAddr::new(
            self.physical_address().as_usize() as u64,
        ));
        // SAFETY: Upheld by the caller.
        unsafe { Cr3::write(frame, Cr3Flags::empty()) };
    }
}
