//! Page table entry for x86_64.

use crate::PhysicalAddress;

use super::flags::PageFlags;

/// A single 64-bit x86_64 page table entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
#[repr(transparent)]
pub struct PageEntry(u64);

impl PageEntry {
    /// Bits 12-51 contain the physical address.
    const ADDRESS_MASK: u64 = 0x000F_FFFF_FFFF_F000;

    /// Flag bits (bits 0-11 and 52-63, including NX).
    const FLAGS_MASK: u64 = !Self::ADDRESS_MASK;

    /// Creates an entry pointing at `address`, which must be page-aligned.
    pub fn new(address: PhysicalAddress, flags: PageFlags) -> Self {
        debug_assert!(
            address.as_usize() & 0xFFF == 0,
            "physical address must be page-aligned"
        );

        let addr_bits = address.as_usize() as u64 & Self::ADDRESS_MASK;
        Self(addr_bits | (flags.bits() & Self::FLAGS_MASK))
    }

    /// Returns the physical address stored in this entry, if the entry is present.
    pub fn address(self) -> Option<PhysicalAddress> {
        self.is_present()
            .then(|| PhysicalAddress::new((self.0 & Self::ADDRESS_MASK) as usize))
    }

    pub fn flags(self) -> PageFlags {
        PageFlags::from_bits(self.0 & Self::FLAGS_MASK)
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

    pub fn clear(&mut self) {
        self.0 = 0;
    }
}
