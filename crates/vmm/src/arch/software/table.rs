//! Page table structure for the software MMU model.

use crate::{PhysicalAddress, address::AddressTranslator};

use super::{ENTRY_COUNT, entry::PageEntry};

/// One level of the software page table hierarchy.
///
/// A table is exactly one 4 KiB frame of 1024 entries and lives in emulated physical memory.
/// Tables are never constructed on the host stack: a zeroed frame is a valid empty table, and
/// the translation map reinterprets frames in place.
///
/// Address layout:
/// - Bits 0-11: page offset
/// - Bits 12-21: level 0 index (page table)
/// - Bits 22-31: level 1 index (page directory/root)
#[repr(C, align(4096))]
pub struct PageTable {
    entries: [PageEntry; ENTRY_COUNT],
}

impl PageTable {
    /// Returns the entry at `index`.
    ///
    /// # Panics
    /// Panics if index >= 1024.
    pub fn entry(&self, index: usize) -> PageEntry {
        assert!(index < ENTRY_COUNT, "page table index out of bounds");
        self.entries[index]
    }

    /// Returns a mutable reference to the entry at `index`.
    ///
    /// # Panics
    /// Panics if index >= 1024.
    pub fn entry_mut(&mut self, index: usize) -> &mut PageEntry {
        assert!(index < ENTRY_COUNT, "page table index out of bounds");
        &mut self.entries[index]
    }

    /// Returns the emulated physical address of this table.
    pub fn physical_address(&self) -> PhysicalAddress {
        AddressTranslator::current().physical_address(self as *const Self)
    }

    /// Makes this table the active root of the calling emulated CPU.
    ///
    /// # Safety
    /// Mirrors the hardware contract: the table must stay alive while it is active.
    pub unsafe fn activate(&self) {
        super::set_current_root(self.physical_address());
    }
}
