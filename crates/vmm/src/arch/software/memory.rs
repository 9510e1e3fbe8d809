//! Emulated physical memory and a frame allocator over it.

use alloc::{
    alloc::{Layout, alloc_zeroed, dealloc, handle_alloc_error},
    vec::Vec,
};
use core::{
    ops::Range,
    ptr::NonNull,
    sync::atomic::{AtomicUsize, Ordering},
};

use crate::{PhysicalAddress, VmError, platform::FrameAllocator};

use super::PAGE_SIZE;

/// Emulated physical memory.
///
/// A page-aligned host buffer whose offsets are the emulated physical addresses. Page tables
/// and data frames are both carved out of it, so tables can be walked through the same
/// direct-map translation the kernel uses on hardware.
pub struct EmulatedMemory {
    base: NonNull<u8>,
    size: usize,
}

// SAFETY: The buffer is owned exclusively by this value and only handed out as raw pointers;
// callers synchronize access to individual frames the same way they would on hardware.
unsafe impl Send for EmulatedMemory {}
unsafe impl Sync for EmulatedMemory {}

impl EmulatedMemory {
    /// Creates a zeroed emulated memory region of `size` bytes.
    ///
    /// # Panics
    /// Panics if `size` is zero, not a multiple of the page size, or beyond the 32-bit
    /// physical address space.
    pub fn new(size: usize) -> Self {
        assert!(
            size > 0 && size % PAGE_SIZE == 0,
            "emulated memory must be a whole number of pages"
        );
        assert!(
            super::validate_physical(size - 1),
            "emulated memory exceeds the physical address space"
        );

        let layout = Self::layout(size);
        // SAFETY: The layout has a non-zero size.
        let ptr = unsafe { alloc_zeroed(layout) };
        let Some(base) = NonNull::new(ptr) else {
            handle_alloc_error(layout);
        };
        Self { base, size }
    }

    fn layout(size: usize) -> Layout {
        match Layout::from_size_align(size, PAGE_SIZE) {
            Ok(layout) => layout,
            Err(_) => panic!("invalid emulated memory layout"),
        }
    }

    /// Translates a physical address to a pointer into the buffer.
    pub fn translate(&self, phys: usize) -> *mut u8 {
        assert!(phys < self.size, "physical address out of bounds");
        // SAFETY: `phys` is within the allocation.
        unsafe { self.base.as_ptr().add(phys) }
    }

    /// Translates a pointer into the buffer back to a physical address.
    pub fn ptr_to_phys(&self, ptr: *const u8) -> usize {
        let offset = (ptr as usize).wrapping_sub(self.base.as_ptr() as usize);
        assert!(offset < self.size, "pointer not within emulated memory");
        offset
    }

    pub fn size(&self) -> usize {
        self.size
    }

    /// Number of whole frames in the region.
    pub fn frame_count(&self) -> usize {
        self.size / PAGE_SIZE
    }
}

impl Drop for EmulatedMemory {
    fn drop(&mut self) {
        // SAFETY: Allocated in `new` with the same layout.
        unsafe { dealloc(self.base.as_ptr(), Self::layout(self.size)) };
    }
}

/// Frame allocator handing out frames of an [`EmulatedMemory`] region.
///
/// Frames are served lowest address first. The number of outstanding frames is tracked so
/// callers can check that nothing leaked, and a limit can be set to simulate exhaustion.
pub struct EmulatedFrameAllocator {
    free: spin::Mutex<Vec<PhysicalAddress>>,
    outstanding: AtomicUsize,
    limit: AtomicUsize,
}

impl EmulatedFrameAllocator {
    /// Creates an allocator over the frames in `frames`.
    pub fn new(frames: Range<PhysicalAddress>) -> Self {
        assert!(
            frames.start.is_aligned(PAGE_SIZE) && frames.end.is_aligned(PAGE_SIZE),
            "frame range must be page-aligned"
        );

        let free = (frames.start.as_usize()..frames.end.as_usize())
            .step_by(PAGE_SIZE)
            .rev()
            .map(PhysicalAddress::new)
            .collect();

        Self {
            free: spin::Mutex::new(free),
            outstanding: AtomicUsize::new(0),
            limit: AtomicUsize::new(usize::MAX),
        }
    }

    /// Creates an allocator over every frame of `memory` except frame zero.
    pub fn for_memory(memory: &EmulatedMemory) -> Self {
        Self::new(PhysicalAddress::new(PAGE_SIZE)..PhysicalAddress::new(memory.size()))
    }

    /// Number of frames handed out and not yet freed.
    pub fn outstanding(&self) -> usize {
        self.outstanding.load(Ordering::Acquire)
    }

    /// Number of frames still available.
    pub fn available(&self) -> usize {
        self.free.lock().len()
    }

    /// Caps the number of outstanding frames; `None` removes the cap.
    pub fn set_limit(&self, limit: Option<usize>) {
        self.limit
            .store(limit.unwrap_or(usize::MAX), Ordering::Release);
    }
}

impl FrameAllocator for EmulatedFrameAllocator {
    fn allocate_frame(&self) -> Result<PhysicalAddress, VmError> {
        let mut free = self.free.lock();
        if self.outstanding.load(Ordering::Acquire) >= self.limit.load(Ordering::Acquire) {
            return Err(VmError::NoMemory);
        }

        let frame = free.pop().ok_or(VmError::NoMemory)?;
        self.outstanding.fetch_add(1, Ordering::AcqRel);
        Ok(frame)
    }

    fn free_frame(&self, frame: PhysicalAddress) {
        let mut free = self.free.lock();
        debug_assert!(!free.contains(&frame), "frame {frame} freed twice");
        free.push(frame);
        self.outstanding.fetch_sub(1, Ordering::AcqRel);
    }
}
