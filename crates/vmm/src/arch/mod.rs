//! Architecture-specific translation primitives.
//!
//! Exactly one architecture is re-exported: the x86_64 hardware MMU for kernel builds, or the
//! software MMU model when testing or when `software-emulation` is enabled. The rest of the
//! crate only names items through this module, so the translation map is monomorphic.

// The x86_64 module is compiled on x86_64 hosts even under test so that it keeps building.
#[cfg(target_arch = "x86_64")]
mod x86_64;
#[cfg(all(target_arch = "x86_64", not(test), not(feature = "software-emulation")))]
pub use self::x86_64::*;

#[cfg(target_arch = "x86_64")]
pub use self::x86_64::decode_page_fault;

#[cfg(any(test, feature = "software-emulation"))]
mod software;
#[cfg(any(test, feature = "software-emulation"))]
pub use self::software::*;

/// Size in bytes of the region translated by one entry of a table at `level`.
#[inline]
pub const fn level_span(level: usize) -> usize {
    1 << (PAGE_SHIFT + level * INDEX_BITS)
}

/// Index of the first root-table entry that belongs to the kernel half.
#[inline]
pub const fn kernel_root_index() -> usize {
    page_index(KERNEL_START, PAGE_TABLE_LEVELS - 1)
}

/// Strips sign extension so that addresses compare as offsets into the translated space.
#[inline]
pub const fn raw_virtual(addr: usize) -> usize {
    addr & ((1 << MAX_VIRTUAL_BITS) - 1)
}
