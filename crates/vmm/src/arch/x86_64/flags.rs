//! Page table entry flags for x86_64.

use x86_64::structures::paging::PageTableFlags;

/// Page table entry flags.
///
/// Wraps the x86_64 crate's flags behind the same accessor surface as the software model so
/// the translation map can stay architecture-neutral.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PageFlags(PageTableFlags);

impl Default for PageFlags {
    fn default() -> Self {
        Self::empty()
    }
}

impl PageFlags {
    /// Creates empty flags (entry not present).
    pub const fn empty() -> Self {
        Self(PageTableFlags::empty())
    }

    pub const fn from_bits(bits: u64) -> Self {
        Self(PageTableFlags::from_bits_truncate(bits))
    }

    pub const fn bits(self) -> u64 {
        self.0.bits()
    }

    pub fn is_present(self) -> bool {
        self.0.contains(PageTableFlags::PRESENT)
    }

    pub fn set_present(&mut self, present: bool) {
        self.0.set(PageTableFlags::PRESENT, present);
    }

    pub fn is_writable(self) -> bool {
        self.0.contains(PageTableFlags::WRITABLE)
    }

    pub fn set_writable(&mut self, writable: bool) {
        self.0.set(PageTableFlags::WRITABLE, writable);
    }

    pub fn is_user(self) -> bool {
        self.0.contains(PageTableFlags::USER_ACCESSIBLE)
    }

    pub fn set_user(&mut self, user: bool) {
        self.0.set(PageTableFlags::USER_ACCESSIBLE, user);
    }

    /// Only honoured once EFER.NXE is enabled by the kernel.
    pub fn is_no_execute(self) -> bool {
        self.0.contains(PageTableFlags::NO_EXECUTE)
    }

    pub fn set_no_execute(&mut self, no_execute: bool) {
        self.0.set(PageTableFlags::NO_EXECUTE, no_execute);
    }

    /// Set on a PDPT or PD entry that maps a 1 GiB or 2 MiB page instead of a table.
    pub fn is_huge(self) -> bool {
        self.0.contains(PageTableFlags::HUGE_PAGE)
    }

    pub fn set_huge(&mut self, huge: bool) {
        self.0.set(PageTableFlags::HUGE_PAGE, huge);
    }

    pub fn is_accessed(self) -> bool {
        self.0.contains(PageTableFlags::ACCESSED)
    }

    pub fn set_accessed(&mut self, accessed: bool) {
        self.0.set(PageTableFlags::ACCESSED, accessed);
    }

    pub fn is_dirty(self) -> bool {
        self.0.contains(PageTableFlags::DIRTY)
    }

    pub fn set_dirty(&mut self, dirty: bool) {
        self.0.set(PageTableFlags::DIRTY, dirty);
    }
}
