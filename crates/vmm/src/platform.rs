//! Services the VM consumes from the rest of the kernel.
//!
//! The VM does not own physical memory, files or processors. The embedding kernel supplies
//! them through these traits, bundled into a [`Platform`] that is handed to the bootstrap
//! translation map. Implementations synchronize themselves: the VM calls them without
//! holding any address space lock when the call may block.

use alloc::sync::Arc;
use core::fmt;

use crate::{PhysicalAddress, VirtualAddress, VmError};

/// Source of physical frames.
///
/// A returned frame is exclusively owned by the caller until it is given back with
/// [`free_frame`](Self::free_frame). Contents are unspecified; the VM zero-fills or
/// overwrites every frame before mapping it.
pub trait FrameAllocator: Send + Sync {
    /// Allocates one page-aligned frame, or fails with [`VmError::NoMemory`].
    fn allocate_frame(&self) -> Result<PhysicalAddress, VmError>;

    /// Returns a frame previously obtained from [`allocate_frame`](Self::allocate_frame).
    fn free_frame(&self, frame: PhysicalAddress);
}

/// Failure reading a backing file, as opposed to a short read at end of file.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FileError;

impl fmt::Display for FileError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("file read failed")
    }
}

impl From<FileError> for VmError {
    fn from(_: FileError) -> Self {
        VmError::Io
    }
}

/// A file that can back an area.
pub trait BackingFile: Send + Sync {
    /// Reads into `buffer` starting at byte `offset` and returns the number of bytes read.
    ///
    /// Fewer bytes than requested means the file ended; the VM zero-fills the rest of the
    /// page. May block.
    fn read_at(&self, offset: u64, buffer: &mut [u8]) -> Result<usize, FileError>;
}

/// Shared handle to a backing file. Areas and in-flight faults each hold a clone.
pub type FileHandle = Arc<dyn BackingFile>;

/// Maximum number of CPUs tracked by a [`CpuSet`].
pub const MAX_CPUS: usize = 64;

/// A set of CPU indices.
#[derive(Clone, Copy, Default, PartialEq, Eq)]
pub struct CpuSet(u64);

impl CpuSet {
    pub const fn empty() -> Self {
        Self(0)
    }

    pub const fn single(cpu: usize) -> Self {
        assert!(cpu < MAX_CPUS, "cpu index out of range");
        Self(1 << cpu)
    }

    pub const fn from_bits(bits: u64) -> Self {
        Self(bits)
    }

    pub const fn bits(self) -> u64 {
        self.0
    }

    pub const fn contains(self, cpu: usize) -> bool {
        cpu < MAX_CPUS && self.0 & (1 << cpu) != 0
    }

    pub const fn is_empty(self) -> bool {
        self.0 == 0
    }

    /// This set with `cpu` removed.
    pub const fn without(self, cpu: usize) -> Self {
        if cpu < MAX_CPUS {
            Self(self.0 & !(1 << cpu))
        } else {
            self
        }
    }

    pub fn iter(self) -> impl Iterator<Item = usize> {
        (0..MAX_CPUS).filter(move |&cpu| self.contains(cpu))
    }
}

impl fmt::Debug for CpuSet {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_set().entries(self.iter()).finish()
    }
}

/// Processor services needed to keep translation caches coherent.
pub trait CpuControl: Send + Sync {
    /// Index of the calling CPU, below [`MAX_CPUS`].
    fn current_cpu(&self) -> usize;

    /// CPUs that may hold cached kernel translations, i.e. every CPU that is running.
    fn online_cpus(&self) -> CpuSet;

    /// Invalidates the translation of `page` on every CPU in `targets` and returns once all
    /// of them have acknowledged. Never called with the calling CPU in `targets`.
    fn shootdown(&self, targets: CpuSet, page: VirtualAddress);

    /// Called while waiting for another CPU to finish resolving a fault on the same page.
    fn relax(&self) {
        core::hint::spin_loop();
    }
}

/// [`CpuControl`] for single-processor systems and early boot.
pub struct Uniprocessor;

impl CpuControl for Uniprocessor {
    fn current_cpu(&self) -> usize {
        0
    }

    fn online_cpus(&self) -> CpuSet {
        CpuSet::single(0)
    }

    fn shootdown(&self, targets: CpuSet, page: VirtualAddress) {
        debug_assert!(
            targets.is_empty(),
            "shootdown of {page} requested on a uniprocessor: {targets:?}"
        );
    }
}

/// The kernel services a set of address spaces runs against.
#[derive(Clone, Copy)]
pub struct Platform {
    frames: &'static dyn FrameAllocator,
    cpus: &'static dyn CpuControl,
}

impl Platform {
    pub const fn new(frames: &'static dyn FrameAllocator, cpus: &'static dyn CpuControl) -> Self {
        Self { frames, cpus }
    }

    pub fn frames(&self) -> &'static dyn FrameAllocator {
        self.frames
    }

    pub fn cpus(&self) -> &'static dyn CpuControl {
        self.cpus
    }
}

impl fmt::Debug for Platform {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Platform").finish_non_exhaustive()
    }
}
