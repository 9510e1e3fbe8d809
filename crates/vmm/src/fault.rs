//! Page fault resolution.
//!
//! A fault is resolved against the faulting address space in rounds. Each round takes the
//! address space lock, classifies the fault against the current areas and translations,
//! and either finishes (success, violation, permission upgrade) or decides that the page
//! needs a freshly populated frame. Populating may block, so the page is marked busy, the
//! lock is dropped, and the frame is allocated and filled. The next round re-classifies
//! from scratch: the prepared frame is installed only if the fault still wants exactly that
//! content for the same area, otherwise it is discarded and the round's decision stands.
//!
//! Busy pages make a second fault on the same page wait instead of preparing its own frame,
//! so a copy-on-write page is duplicated once no matter how many threads hit it.

use alloc::sync::Arc;

use crate::{
    AddressSpace, Area, AreaFlags, AreaId, AreaMap, PhysicalAddress, STACK_GROWTH_WINDOW,
    VirtualAddress, VmError,
    address_space::Inner,
    frame,
    platform::FileHandle,
    translation_map::Protection,
};

macro_rules! fault_trace {
    ($($arg:tt)*) => {
        #[cfg(feature = "detailed-logging")]
        log::trace!($($arg)*);
    };
}

/// The kind of access that faulted.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum AccessKind {
    Read,
    Write,
    Execute,
}

/// The privilege level the faulting access was made at.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Privilege {
    User,
    Kernel,
}

/// Where the contents of a new frame come from.
#[derive(Clone)]
enum Source {
    Zero,
    File { file: FileHandle, offset: u64 },
    /// Copy of a frame shared copy-on-write. The frame is pinned while the copy is prepared.
    Copy(PhysicalAddress),
}

impl Source {
    fn same_as(&self, other: &Source) -> bool {
        match (self, other) {
            (Source::Zero, Source::Zero) => true,
            (
                Source::File { file, offset },
                Source::File {
                    file: other_file,
                    offset: other_offset,
                },
            ) => Arc::ptr_eq(file, other_file) && offset == other_offset,
            (Source::Copy(frame), Source::Copy(other)) => frame == other,
            _ => false,
        }
    }
}

/// Outcome of one classification round.
enum Step {
    Finished(Result<(), VmError>),
    Populate {
        area: AreaId,
        source: Source,
        protection: Protection,
        /// Area start and new start if the fault extends a growable area.
        growth: Option<(VirtualAddress, VirtualAddress)>,
    },
}

/// A frame filled with the lock released, waiting to be installed.
struct Prepared {
    area: AreaId,
    source: Source,
    frame: PhysicalAddress,
}

impl AddressSpace {
    /// Resolves a page fault at `address` in this address space.
    ///
    /// Returns `Ok` once the faulting access can be retried, or the reason it cannot. A
    /// violation leaves the address space untouched.
    pub fn handle_fault(
        &self,
        address: VirtualAddress,
        access: AccessKind,
        privilege: Privilege,
    ) -> Result<(), VmError> {
        fault_trace!("{privilege:?} {access:?} fault at {address}");

        let result = self.resolve(address.page_base(), access, privilege);
        if let Err(error) = result {
            match (error, privilege) {
                (VmError::NoMemory | VmError::Io, _) | (_, Privilege::Kernel) => log::error!(
                    "{:?} {:?} fault at {} in {:?} space: {}",
                    privilege,
                    access,
                    address,
                    self.kind(),
                    error
                ),
                _ => log::warn!(
                    "{:?} {:?} fault at {}: {}",
                    privilege,
                    access,
                    address,
                    error
                ),
            }
        }
        result
    }

    fn resolve(
        &self,
        page: VirtualAddress,
        access: AccessKind,
        privilege: Privilege,
    ) -> Result<(), VmError> {
        let mut prepared: Option<Prepared> = None;
        loop {
            let mut inner = self.inner.lock();
            if prepared.is_some() {
                inner.busy.remove(&page);
            } else if inner.busy.contains(&page) {
                drop(inner);
                self.platform.cpus().relax();
                continue;
            }

            match self.classify(&mut inner, page, access, privilege) {
                Step::Finished(result) => {
                    if let Some(stale) = prepared.take() {
                        self.discard(stale);
                    }
                    return result;
                }
                Step::Populate {
                    area,
                    source,
                    protection,
                    growth,
                } => {
                    if let Some(ready) = prepared.take() {
                        if ready.area == area && ready.source.same_as(&source) {
                            return self.install(&mut inner, page, ready, protection, growth);
                        }
                        fault_trace!("discarding stale frame {} for {page}", ready.frame);
                        self.discard(ready);
                    }

                    if let Source::Copy(original) = source {
                        self.shared.share(original);
                    }
                    inner.busy.insert(page);
                    drop(inner);

                    match self.populate(area, source) {
                        Ok(ready) => prepared = Some(ready),
                        Err(error) => {
                            self.inner.lock().busy.remove(&page);
                            return Err(error);
                        }
                    }
                }
            }
        }
    }

    fn classify(
        &self,
        inner: &mut Inner,
        page: VirtualAddress,
        access: AccessKind,
        privilege: Privilege,
    ) -> Step {
        let Inner {
            areas, translation, ..
        } = inner;

        let (area, growth) = match areas.find(page) {
            Some(area) => (area, None),
            None => match growth_target(areas, page) {
                Some(area) => (area, Some((area.start(), page))),
                None => return Step::Finished(Err(VmError::SegmentationViolation)),
            },
        };
        if !area.permits(access, privilege) {
            return Step::Finished(Err(VmError::AccessViolation));
        }

        let Some(current) = translation.query(page) else {
            let source = match area.file_offset(page) {
                Some((file, offset)) => Source::File { file, offset },
                None => Source::Zero,
            };
            return Step::Populate {
                area: area.id(),
                source,
                protection: area.protection(),
                growth,
            };
        };

        if current.protection.permits(access, privilege) {
            // Another CPU resolved it first, or the TLB was stale.
            return Step::Finished(Ok(()));
        }

        let exclusive = self.shared.owners(current.frame) == 1;
        if access == AccessKind::Write && area.is_copy_on_write() && !exclusive {
            return Step::Populate {
                area: area.id(),
                source: Source::Copy(current.frame),
                protection: area.protection(),
                growth: None,
            };
        }

        // The page is ours alone, or the area grants more than the mapping does.
        let protection = if exclusive || area.flags().contains(AreaFlags::SHARED) {
            area.protection()
        } else {
            area.shared_protection()
        };
        if !protection.permits(access, privilege) {
            return Step::Finished(Err(VmError::AccessViolation));
        }
        fault_trace!("upgrading {page} in place to {protection:?}");
        Step::Finished(translation.map(page, current.frame, protection).map(|_| ()))
    }

    /// Allocates a frame and fills it from `source`. Runs without the address space lock.
    fn populate(&self, area: AreaId, source: Source) -> Result<Prepared, VmError> {
        let frames = self.platform.frames();
        let frame = match frames.allocate_frame() {
            Ok(frame) => frame,
            Err(error) => {
                self.unpin(&source);
                return Err(error);
            }
        };

        match &source {
            // SAFETY: The frame was just allocated and is not mapped anywhere.
            Source::Zero => unsafe { frame::zero_frame(frame) },
            // SAFETY: As above; the original is pinned and only ever read once shared.
            Source::Copy(original) => unsafe { frame::copy_frame(frame, *original) },
            Source::File { file, offset } => {
                // SAFETY: As above.
                let bytes = unsafe { frame::frame_bytes(frame) };
                let len = bytes.len();
                match file.read_at(*offset, bytes) {
                    Ok(count) => bytes[count.min(len)..].fill(0),
                    Err(error) => {
                        frames.free_frame(frame);
                        return Err(error.into());
                    }
                }
            }
        }

        Ok(Prepared {
            area,
            source,
            frame,
        })
    }

    fn install(
        &self,
        inner: &mut Inner,
        page: VirtualAddress,
        ready: Prepared,
        protection: Protection,
        growth: Option<(VirtualAddress, VirtualAddress)>,
    ) -> Result<(), VmError> {
        let previous = match inner.translation.map(page, ready.frame, protection) {
            Ok(previous) => previous,
            Err(error) => {
                self.discard(ready);
                return Err(error);
            }
        };

        if let Some((start, new_start)) = growth {
            if let Err(error) = inner.areas.grow_down(start, new_start) {
                // Classification checked the gap under this same lock hold.
                debug_assert!(false, "growth of {start} to {new_start} failed: {error}");
                inner.translation.unmap(page);
                self.discard(ready);
                return Err(error);
            }
            log::debug!("grew area at {start} down to {new_start}");
        }

        if let Some(previous) = previous {
            self.shared.release(previous.frame, self.platform.frames());
        }
        self.unpin(&ready.source);
        fault_trace!("mapped {page} to {} as {protection:?}", ready.frame);
        Ok(())
    }

    fn discard(&self, prepared: Prepared) {
        self.platform.frames().free_frame(prepared.frame);
        self.unpin(&prepared.source);
    }

    fn unpin(&self, source: &Source) {
        if let Source::Copy(original) = source {
            self.shared.release(*original, self.platform.frames());
        }
    }
}

/// The growable area a fault at `page` would extend, if any.
fn growth_target(areas: &AreaMap, page: VirtualAddress) -> Option<&Area> {
    let above = areas.next_above(page)?;
    if !above.flags().contains(AreaFlags::GROWABLE)
        || above.start() - page > STACK_GROWTH_WINDOW
        || !areas.is_free(page, above.start())
    {
        return None;
    }
    Some(above)
}
