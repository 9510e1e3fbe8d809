//! Physical frame ownership and contents.
//!
//! A frame moves through three states once the VM has it: mapped by one translation entry,
//! shared by several (after [`clone_address_space`](crate::clone_address_space) or while a
//! copy-on-write fault copies from it), and back to the allocator when the last owner lets
//! go. Single ownership is the common case and is implicit; only frames with more than one
//! owner have an entry in [`SharedFrames`].

use alloc::collections::BTreeMap;
use core::slice;

use crate::{
    AddressTranslator, FrameNumber, PhysicalAddress, arch::PAGE_SIZE, platform::FrameAllocator,
};

/// Owner counts for frames referenced by more than one translation entry or in-flight fault.
pub struct SharedFrames {
    owners: spin::Mutex<BTreeMap<FrameNumber, usize>>,
}

impl SharedFrames {
    pub const fn new() -> Self {
        Self {
            owners: spin::Mutex::new(BTreeMap::new()),
        }
    }

    /// Number of owners of `frame`. Untracked frames have exactly one.
    pub fn owners(&self, frame: PhysicalAddress) -> usize {
        self.owners
            .lock()
            .get(&frame.frame_number())
            .copied()
            .unwrap_or(1)
    }

    /// Adds an owner to `frame` and returns the new owner count.
    pub fn share(&self, frame: PhysicalAddress) -> usize {
        let mut owners = self.owners.lock();
        let count = owners.entry(frame.frame_number()).or_insert(1);
        *count += 1;
        *count
    }

    /// Drops one owner of `frame`, returning it to `allocator` if that was the last one.
    ///
    /// Returns `true` if the frame was freed.
    pub fn release(&self, frame: PhysicalAddress, allocator: &dyn FrameAllocator) -> bool {
        {
            let mut owners = self.owners.lock();
            let number = frame.frame_number();
            if let Some(count) = owners.get_mut(&number) {
                *count -= 1;
                if *count == 1 {
                    owners.remove(&number);
                }
                return false;
            }
        }

        allocator.free_frame(frame);
        true
    }

    /// Number of frames that currently have more than one owner.
    pub fn tracked(&self) -> usize {
        self.owners.lock().len()
    }
}

impl Default for SharedFrames {
    fn default() -> Self {
        Self::new()
    }
}

/// Returns the contents of `frame` as seen through the current translator.
///
/// # Safety
/// The caller must have exclusive access to the frame for the lifetime `'a`, or only read
/// it while no other context writes it.
pub(crate) unsafe fn frame_bytes<'a>(frame: PhysicalAddress) -> &'a mut [u8] {
    let base = AddressTranslator::current().frame_pointer::<u8>(frame);
    // SAFETY: The translator maps the whole frame; exclusivity is upheld by the caller.
    unsafe { slice::from_raw_parts_mut(base, PAGE_SIZE) }
}

/// Fills `frame` with zeroes.
///
/// # Safety
/// The caller must own `frame` exclusively.
pub(crate) unsafe fn zero_frame(frame: PhysicalAddress) {
    // SAFETY: Upheld by the caller.
    unsafe { frame_bytes(frame) }.fill(0);
}

/// Copies the contents of `source` into `destination`.
///
/// # Safety
/// The caller must own `destination` exclusively and `source` must not be written while
/// the copy runs. The two frames must differ.
pub(crate) unsafe fn copy_frame(destination: PhysicalAddress, source: PhysicalAddress) {
    debug_assert_ne!(destination, source, "copying a frame onto itself");
    // SAFETY: Upheld by the caller; distinct frames do not overlap.
    unsafe { frame_bytes(destination).copy_from_slice(frame_bytes(source)) };
}
