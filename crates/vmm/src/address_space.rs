//! Address spaces.
//!
//! An [`AddressSpace`] is one protection domain: the kernel singleton or a user process. It
//! pairs an [`AreaMap`] (what the process asked for) with a [`TranslationMap`] (what is
//! actually mapped) under a single spin lock. The lock is only ever held for short,
//! non-blocking sections; work that may block (allocating frames, reading files, copying
//! pages) happens with the lock released, see the fault resolver.

use alloc::{collections::BTreeSet, sync::Arc, vec::Vec};
use core::ops::Range;

use crate::{
    Area, AreaFlags, AreaMap, Backing, KERNEL_END, KERNEL_START, PhysicalAddress, Placement,
    USER_END, USER_START, VirtualAddress, VmError,
    arch::PAGE_SIZE,
    frame::SharedFrames,
    platform::{FrameAllocator, Platform},
    translation_map::{Protection, Translation, TranslationMap},
};

/// Which half of the virtual address space an address space manages.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum AddressSpaceKind {
    Kernel,
    User,
}

impl AddressSpaceKind {
    /// The range of addresses areas of this kind may occupy.
    pub fn domain(self) -> Range<VirtualAddress> {
        match self {
            Self::Kernel => VirtualAddress::new(KERNEL_START)..VirtualAddress::new(KERNEL_END),
            Self::User => VirtualAddress::new(USER_START)..VirtualAddress::new(USER_END),
        }
    }
}

/// State guarded by the address space lock.
pub(crate) struct Inner {
    pub(crate) areas: AreaMap,
    pub(crate) translation: TranslationMap,
    /// Pages whose fault is being resolved with the lock released.
    pub(crate) busy: BTreeSet<VirtualAddress>,
}

/// A protection domain: its areas, its translation map, and the lock serializing both.
pub struct AddressSpace {
    kind: AddressSpaceKind,
    pub(crate) inner: spin::Mutex<Inner>,
    pub(crate) shared: Arc<SharedFrames>,
    pub(crate) platform: Platform,
}

impl AddressSpace {
    pub(crate) fn new(
        kind: AddressSpaceKind,
        translation: TranslationMap,
        shared: Arc<SharedFrames>,
    ) -> Self {
        let platform = translation.platform();
        Self {
            kind,
            inner: spin::Mutex::new(Inner {
                areas: AreaMap::new(kind.domain()),
                translation,
                busy: BTreeSet::new(),
            }),
            shared,
            platform,
        }
    }

    pub fn kind(&self) -> AddressSpaceKind {
        self.kind
    }

    pub fn domain(&self) -> Range<VirtualAddress> {
        self.kind.domain()
    }

    /// Physical address of the root page table, as loaded on context switch.
    pub fn translation_root(&self) -> PhysicalAddress {
        self.inner.lock().translation.root()
    }

    /// Installs this address space's translation map on the calling CPU.
    ///
    /// # Safety
    /// See [`TranslationMap::activate`].
    pub unsafe fn activate(&self) {
        // SAFETY: Upheld by the caller.
        unsafe { self.inner.lock().translation.activate() };
    }

    /// Records that the calling CPU switched away from this address space.
    pub fn deactivate(&self) {
        self.inner.lock().translation.deactivate();
    }

    /// Creates an area without mapping any of it; pages are populated on first fault.
    ///
    /// `address` and `size` must be page-aligned and `size` non-zero. An exact placement must
    /// lie entirely inside this address space's half, and file offsets must be page-aligned.
    pub fn create_area(
        &self,
        address: VirtualAddress,
        size: usize,
        placement: Placement,
        name: Option<&str>,
        flags: AreaFlags,
        backing: Backing,
    ) -> Result<Area, VmError> {
        if !address.is_aligned(PAGE_SIZE) || size == 0 || size % PAGE_SIZE != 0 {
            return Err(VmError::InvalidArgument);
        }
        match &backing {
            Backing::File { offset, .. } if *offset % PAGE_SIZE as u64 != 0 => {
                return Err(VmError::InvalidArgument);
            }
            Backing::File { .. } if flags.contains(AreaFlags::GROWABLE) => {
                return Err(VmError::InvalidArgument);
            }
            _ => {}
        }
        if placement == Placement::Exact {
            let domain = self.domain();
            let end = address.checked_add(size).ok_or(VmError::InvalidArgument)?;
            if address < domain.start || end > domain.end {
                return Err(VmError::InvalidArgument);
            }
        }

        let request = Area::new(address, size, flags, backing, name);
        let area = self.inner.lock().areas.insert(request, placement)?.clone();

        log::debug!(
            "created area {:?} {}..{} {:?} ({})",
            area.id(),
            area.start(),
            area.end(),
            area.flags(),
            area.name().unwrap_or("anonymous")
        );
        Ok(area)
    }

    /// Removes the area containing `address`, unmapping its pages and releasing their frames.
    pub fn destroy_area(&self, address: VirtualAddress) -> Result<Area, VmError> {
        let mut guard = self.inner.lock();
        let inner = &mut *guard;
        let area = inner.areas.remove(address)?;
        let released = self.unmap_range(&mut inner.translation, area.start()..area.end());
        drop(guard);

        log::debug!(
            "destroyed area {:?} {}..{}: {} pages unmapped",
            area.id(),
            area.start(),
            area.end(),
            released
        );
        Ok(area)
    }

    /// Snapshot of the area containing `address`.
    pub fn find_area(&self, address: VirtualAddress) -> Option<Area> {
        self.inner.lock().areas.find(address).cloned()
    }

    /// Snapshot of every area in ascending order.
    pub fn areas(&self) -> Vec<Area> {
        self.inner.lock().areas.iter().cloned().collect()
    }

    /// Current translation of the page containing `address`.
    pub fn query(&self, address: VirtualAddress) -> Option<Translation> {
        self.inner.lock().translation.query(address)
    }

    /// Logs every area of this address space.
    pub fn dump_areas(&self) {
        let inner = self.inner.lock();
        log::info!(
            "{:?} address space {} ({} areas)",
            self.kind,
            inner.translation.root(),
            inner.areas.len()
        );
        for area in inner.areas.iter() {
            log::info!(
                "  {:#018x}-{:#018x} {:>6} pages {:?} {:?} {}",
                area.start().as_usize(),
                area.end().as_usize(),
                area.pages().count(),
                area.flags(),
                area.backing(),
                area.name().unwrap_or("")
            );
        }
    }

    /// Copies the kernel root entry covering `address` into this space if it is missing.
    pub(crate) fn sync_kernel_entry(&self, kernel: &AddressSpace, address: VirtualAddress) -> bool {
        // Lock order: kernel before user.
        let kernel = kernel.inner.lock();
        self.inner
            .lock()
            .translation
            .sync_kernel_entry(&kernel.translation, address)
    }

    /// Replicates every area of this space into `child`, which must be new and empty.
    ///
    /// Shared areas map the same frames with the same rights. Private areas share their
    /// frames read-only; private writable areas become copy-on-write in both spaces. On
    /// failure this space is restored to how it was; `child` keeps what it got and releases
    /// it when dropped.
    pub(crate) fn clone_into(&self, child: &AddressSpace) -> Result<(), VmError> {
        let mut parent = self.inner.lock();
        let mut child_inner = child.inner.lock();
        let Inner {
            areas, translation, ..
        } = &mut *parent;

        let mut undo = Vec::new();
        let result = self.replicate(areas, translation, &mut child_inner, &mut undo);
        if let Err(error) = result {
            log::warn!(
                "clone of address space {} failed ({error}), restoring {} changes",
                translation.root(),
                undo.len()
            );
            for change in undo.into_iter().rev() {
                match change {
                    CloneChange::Flags { start, flags } => {
                        if let Some(area) = areas.iter_mut().find(|area| area.start() == start) {
                            area.flags = flags;
                        }
                    }
                    // The leaf table exists, so restoring cannot allocate or fail.
                    CloneChange::Protection { page, frame, protection } => {
                        let _ = translation.map(page, frame, protection);
                    }
                }
            }
        }
        result
    }

    fn replicate(
        &self,
        areas: &mut AreaMap,
        translation: &mut TranslationMap,
        child: &mut Inner,
        undo: &mut Vec<CloneChange>,
    ) -> Result<(), VmError> {
        for area in areas.iter_mut() {
            let shared = area.flags().contains(AreaFlags::SHARED);
            if !shared && area.flags().contains(AreaFlags::WRITE) && !area.is_copy_on_write() {
                undo.push(CloneChange::Flags {
                    start: area.start(),
                    flags: area.flags(),
                });
                area.flags |= AreaFlags::COPY_ON_WRITE;
            }

            let copy = child.areas.insert(area.clone(), Placement::Exact)?;
            debug_assert_eq!(copy.start(), area.start());

            let protection = if shared {
                area.protection()
            } else {
                area.shared_protection()
            };

            for (page, mapping) in translation.mapped(area.start()..area.end()) {
                self.shared.share(mapping.frame);
                if let Err(error) = child.translation.map(page, mapping.frame, protection) {
                    self.shared.release(mapping.frame, self.platform.frames());
                    return Err(error);
                }
                if mapping.protection != protection {
                    translation.map(page, mapping.frame, protection)?;
                    undo.push(CloneChange::Protection {
                        page,
                        frame: mapping.frame,
                        protection: mapping.protection,
                    });
                }
            }
        }
        Ok(())
    }

    fn unmap_range(&self, translation: &mut TranslationMap, range: Range<VirtualAddress>) -> usize {
        unmap_range(translation, &self.shared, self.platform.frames(), range)
    }
}

/// A change `clone_into` made to the parent, with what it replaced.
enum CloneChange {
    Flags {
        start: VirtualAddress,
        flags: AreaFlags,
    },
    Protection {
        page: VirtualAddress,
        frame: PhysicalAddress,
        protection: Protection,
    },
}

/// Unmaps every page in `range` and drops the owning space's claim on each frame.
fn unmap_range(
    translation: &mut TranslationMap,
    shared: &SharedFrames,
    frames: &dyn FrameAllocator,
    range: Range<VirtualAddress>,
) -> usize {
    let pages = translation.mapped(range);
    for (page, _) in &pages {
        if let Some(removed) = translation.unmap(*page) {
            shared.release(removed.frame, frames);
        }
    }
    pages.len()
}

impl Drop for AddressSpace {
    fn drop(&mut self) {
        let domain = self.domain();
        let frames = self.platform.frames();
        let shared = &self.shared;
        let inner = self.inner.get_mut();
        let areas = core::mem::replace(&mut inner.areas, AreaMap::new(domain));

        let mut released = 0;
        for area in areas.iter() {
            released += unmap_range(
                &mut inner.translation,
                shared,
                frames,
                area.start()..area.end(),
            );
        }

        // The translation map frees its own tables when it drops after this.
        log::debug!(
            "{:?} address space {} torn down: {} areas, {} pages released",
            self.kind,
            inner.translation.root(),
            areas.len(),
            released
        );
    }
}
