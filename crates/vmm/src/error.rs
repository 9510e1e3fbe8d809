use core::fmt;

/// Errors reported by virtual memory operations.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VmError {
    /// Misaligned address or size, zero size, or a range outside the address space.
    InvalidArgument,
    /// An exact placement overlaps an existing area.
    RangeConflict,
    /// No gap of the requested size exists in the address space.
    OutOfSpace,
    /// No area covers the given address.
    NotFound,
    /// The frame allocator is exhausted.
    NoMemory,
    /// The faulting address is not covered by any area.
    SegmentationViolation,
    /// The covering area does not permit the attempted access.
    AccessViolation,
    /// The backing file could not be read.
    Io,
}

impl fmt::Display for VmError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let message = match self {
            Self::InvalidArgument => "invalid argument",
            Self::RangeConflict => "range overlaps an existing area",
            Self::OutOfSpace => "no free range large enough",
            Self::NotFound => "no area at address",
            Self::NoMemory => "out of physical memory",
            Self::SegmentationViolation => "segmentation violation",
            Self::AccessViolation => "access violation",
            Self::Io => "backing file read failed",
        };
        f.write_str(message)
    }
}

impl core::error::Error for VmError {}
