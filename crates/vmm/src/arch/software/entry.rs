//! Page table entry for the software MMU model.

use crate::PhysicalAddress;

use super::flags::PageFlags;

/// A single 32-bit page table entry.
///
/// Entry format:
/// - Bits 0-11: flags (see [`PageFlags`])
/// - Bits 12-31: physical frame address
///
/// Intermediate and leaf entries share the format; the level being walked decides which one
/// an entry is.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
#[repr(transparent)]
pub struct PageEntry(u32);

impl PageEntry {
    const ADDRESS_MASK: u32 = 0xFFFF_F000;
    const FLAGS_MASK: u32 = 0x0000_0FFF;

    /// Creates an entry pointing at `address`, which must be page-aligned.
    pub fn new(address: PhysicalAddress, flags: PageFlags) -> Self {
        debug_assert!(
            address.as_usize() & 0xFFF == 0,
            "physical address must be page-aligned"
        );

        let addr_bits = address.as_usize() as u32 & Self::ADDRESS_MASK;
        Self(addr_bits | (flags.to_raw() & Self::FLAGS_MASK))
    }

    /// Returns the physical address stored in this entry, if the entry is present.
    pub fn address(self) -> Option<PhysicalAddress> {
        self.is_present()
            .then(|| PhysicalAddress::new((self.0 & Self::ADDRESS_MASK) as usize))
    }

    pub fn flags(self) -> PageFlags {
        PageFlags::from_raw(self.0 & Self::FLAGS_MASK)
    }

    pub fn is_present(self) -> bool {
        self.flags().is_present()
    }

    /// Whether this entry maps memory directly from above the last level.
    ///
    /// Such an entry has an address but it is not a table, so walks must stop here.
    pub fn is_leaf(self) -> bool {
        self.is_present() && self.flags().is_huge()
    }

    /// Clears this entry, making it not present.
    pub fn clear(&mut self) {
        self.0 = 0;
    }
}
