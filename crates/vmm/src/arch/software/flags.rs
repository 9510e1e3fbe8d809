//! Page table entry flags for the software MMU model.

/// Flag bits of a software page table entry.
///
/// The layout follows the low bits of an x86 entry where the two overlap, with bit 3 used as
/// a no-execute bit since the model has no cache-control bits. Bit 7 is the large-page bit.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct PageFlags(u32);

impl PageFlags {
    const PRESENT: u32 = 1 << 0;
    const WRITABLE: u32 = 1 << 1;
    const USER: u32 = 1 << 2;
    const NO_EXECUTE: u32 = 1 << 3;
    const ACCESSED: u32 = 1 << 5;
    const DIRTY: u32 = 1 << 6;
    const HUGE: u32 = 1 << 7;

    /// Creates empty flags (entry not present).
    pub const fn empty() -> Self {
        Self(0)
    }

    pub const fn from_raw(raw: u32) -> Self {
        Self(raw)
    }

    pub const fn to_raw(self) -> u32 {
        self.0
    }

    fn with(&mut self, bit: u32, value: bool) {
        if value {
            self.0 |= bit;
        } else {
            self.0 &= !bit;
        }
    }

    pub fn is_present(self) -> bool {
        self.0 & Self::PRESENT != 0
    }

    pub fn set_present(&mut self, present: bool) {
        self.with(Self::PRESENT, present);
    }

    pub fn is_writable(self) -> bool {
        self.0 & Self::WRITABLE != 0
    }

    pub fn set_writable(&mut self, writable: bool) {
        self.with(Self::WRITABLE, writable);
    }

    pub fn is_user(self) -> bool {
        self.0 & Self::USER != 0
    }

    pub fn set_user(&mut self, user: bool) {
        self.with(Self::USER, user);
    }

    pub fn is_no_execute(self) -> bool {
        self.0 & Self::NO_EXECUTE != 0
    }

    pub fn set_no_execute(&mut self, no_execute: bool) {
        self.with(Self::NO_EXECUTE, no_execute);
    }

    /// Set on a directory entry that maps a 4 MiB region directly, as with PSE on 32-bit x86.
    pub fn is_huge(self) -> bool {
        self.0 & Self::HUGE != 0
    }

    pub fn set_huge(&mut self, huge: bool) {
        self.with(Self::HUGE, huge);
    }

    /// Set by the (emulated) MMU when the page is read or written.
    pub fn is_accessed(self) -> bool {
        self.0 & Self::ACCESSED != 0
    }

    pub fn set_accessed(&mut self, accessed: bool) {
        self.with(Self::ACCESSED, accessed);
    }

    /// Set by the (emulated) MMU when the page is written.
    pub fn is_dirty(self) -> bool {
        self.0 & Self::DIRTY != 0
    }

    pub fn set_dirty(&mut self, dirty: bool) {
        self.with(Self::DIRTY, dirty);
    }
}
