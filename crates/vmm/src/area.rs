//! Virtual memory areas.

use alloc::{string::String, sync::Arc};
use core::{fmt, ops::Range};

use bitflags::bitflags;

use crate::{
    AccessKind, PageNumber, Privilege, VirtualAddress,
    arch::PAGE_SIZE,
    platform::FileHandle,
    translation_map::Protection,
};

/// How far below a growable area a fault may extend it.
pub const STACK_GROWTH_WINDOW: usize = 16 * PAGE_SIZE;

bitflags! {
    /// Protection and behaviour of an area.
    #[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
    pub struct AreaFlags: u32 {
        const READ = 1 << 0;
        const WRITE = 1 << 1;
        const EXECUTE = 1 << 2;
        /// Frames are shared with every address space the area is cloned into.
        const SHARED = 1 << 3;
        /// Accessible from user mode.
        const USER = 1 << 4;
        /// Grows downward when a fault lands just below it.
        const GROWABLE = 1 << 5;
        /// Pages may be shared read-only and are copied on the first write.
        const COPY_ON_WRITE = 1 << 6;
    }
}

/// Stable identity of an area within its address space.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct AreaId(u64);

impl AreaId {
    pub(crate) const UNASSIGNED: AreaId = AreaId(0);

    pub(crate) const fn new(id: u64) -> Self {
        Self(id)
    }

    pub const fn as_u64(self) -> u64 {
        self.0
    }
}

/// Where the contents of an area's pages come from.
#[derive(Clone)]
pub enum Backing {
    /// Zero-filled on first touch.
    Anonymous,
    /// Read from `file`; the area's first page corresponds to byte `offset`.
    File { file: FileHandle, offset: u64 },
}

impl Backing {
    pub fn file(file: FileHandle, offset: u64) -> Self {
        Self::File { file, offset }
    }

    pub fn is_file(&self) -> bool {
        matches!(self, Self::File { .. })
    }
}

impl fmt::Debug for Backing {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Anonymous => f.write_str("Anonymous"),
            Self::File { file, offset } => f
                .debug_struct("File")
                .field("file", &Arc::as_ptr(file))
                .field("offset", offset)
                .finish(),
        }
    }
}

/// How [`AreaMap::insert`](crate::AreaMap::insert) chooses the start of a new area.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Placement {
    /// Exactly at the requested address.
    Exact,
    /// The lowest free range at or above the requested address.
    SearchLow,
    /// The highest free range ending at or below the requested address.
    SearchHigh,
}

/// A contiguous, page-aligned range of virtual memory with uniform protection and backing.
#[derive(Clone, Debug)]
pub struct Area {
    pub(crate) id: AreaId,
    pub(crate) start: VirtualAddress,
    pub(crate) size: usize,
    pub(crate) flags: AreaFlags,
    pub(crate) backing: Backing,
    pub(crate) name: Option<String>,
}

impl Area {
    /// Describes an area that has not been inserted anywhere yet.
    ///
    /// For searching placements `start` is the hint; the map picks the final address.
    pub fn new(
        start: VirtualAddress,
        size: usize,
        flags: AreaFlags,
        backing: Backing,
        name: Option<&str>,
    ) -> Self {
        Self {
            id: AreaId::UNASSIGNED,
            start,
            size,
            flags,
            backing,
            name: name.map(String::from),
        }
    }

    pub fn id(&self) -> AreaId {
        self.id
    }

    pub fn start(&self) -> VirtualAddress {
        self.start
    }

    /// First address past the area.
    pub fn end(&self) -> VirtualAddress {
        self.start + self.size
    }

    pub fn size(&self) -> usize {
        self.size
    }

    /// The pages the area covers.
    pub fn pages(&self) -> Range<PageNumber> {
        self.start.page_number()..self.end().page_number()
    }

    pub fn flags(&self) -> AreaFlags {
        self.flags
    }

    pub fn backing(&self) -> &Backing {
        &self.backing
    }

    pub fn name(&self) -> Option<&str> {
        self.name.as_deref()
    }

    pub fn contains(&self, address: VirtualAddress) -> bool {
        address >= self.start && address - self.start < self.size
    }

    /// Whether the area's flags allow `access` at `privilege`.
    pub fn permits(&self, access: AccessKind, privilege: Privilege) -> bool {
        if privilege == Privilege::User && !self.flags.contains(AreaFlags::USER) {
            return false;
        }
        match access {
            AccessKind::Read => self.flags.contains(AreaFlags::READ),
            AccessKind::Write => self.flags.contains(AreaFlags::WRITE),
            AccessKind::Execute => self.flags.contains(AreaFlags::EXECUTE),
        }
    }

    /// Protection for a page of this area that the faulting space owns exclusively.
    pub fn protection(&self) -> Protection {
        let mut protection = Protection::READ;
        protection.set(Protection::WRITE, self.flags.contains(AreaFlags::WRITE));
        protection.set(Protection::EXECUTE, self.flags.contains(AreaFlags::EXECUTE));
        protection.set(Protection::USER, self.flags.contains(AreaFlags::USER));
        protection
    }

    /// Protection for a page whose frame is shared copy-on-write.
    pub fn shared_protection(&self) -> Protection {
        self.protection().difference(Protection::WRITE)
    }

    pub fn is_copy_on_write(&self) -> bool {
        self.flags.contains(AreaFlags::COPY_ON_WRITE)
    }

    /// Offset into the backing file of the page starting at `page`.
    pub(crate) fn file_offset(&self, page: VirtualAddress) -> Option<(FileHandle, u64)> {
        match &self.backing {
            Backing::Anonymous => None,
            Backing::File { file, offset } => {
                Some((Arc::clone(file), offset + (page - self.start) as u64))
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::MemoryFile;

    fn area(flags: AreaFlags) -> Area {
        Area::new(
            VirtualAddress::new(0x0001_0000),
            4 * PAGE_SIZE,
            flags,
            Backing::Anonymous,
            Some("test"),
        )
    }

    #[test]
    fn contains_is_half_open() {
        let area = area(AreaFlags::READ);
        assert!(area.contains(VirtualAddress::new(0x0001_0000)));
        assert!(area.contains(VirtualAddress::new(0x0001_3fff)));
        assert!(!area.contains(VirtualAddress::new(0x0001_4000)));
        assert!(!area.contains(VirtualAddress::new(0x0000_ffff)));
        assert_eq!(area.end(), VirtualAddress::new(0x0001_4000));
        assert_eq!(area.pages().count(), 4);
        assert_eq!(
            area.pages().last().map(PageNumber::start),
            Some(VirtualAddress::new(0x0001_3000))
        );
        assert_eq!(area.name(), Some("test"));
    }

    #[test]
    fn kernel_areas_reject_user_access() {
        let kernel = area(AreaFlags::READ | AreaFlags::WRITE);
        assert!(kernel.permits(AccessKind::Write, Privilege::Kernel));
        assert!(!kernel.permits(AccessKind::Read, Privilege::User));

        let user = area(AreaFlags::READ | AreaFlags::USER);
        assert!(user.permits(AccessKind::Read, Privilege::User));
        assert!(!user.permits(AccessKind::Write, Privilege::User));
        assert!(!user.permits(AccessKind::Execute, Privilege::User));
    }

    #[test]
    fn protection_follows_flags() {
        let area = area(AreaFlags::READ | AreaFlags::WRITE | AreaFlags::USER | AreaFlags::COPY_ON_WRITE);
        assert_eq!(
            area.protection(),
            Protection::READ | Protection::WRITE | Protection::USER
        );
        assert_eq!(area.shared_protection(), Protection::READ | Protection::USER);
        assert!(area.is_copy_on_write());
    }

    #[test]
    fn file_offset_tracks_page_position() {
        let file = MemoryFile::new(alloc::vec![0; 8 * PAGE_SIZE]);
        let mut area = area(AreaFlags::READ);
        area.backing = Backing::file(file.handle(), 2 * PAGE_SIZE as u64);

        let (_, offset) = area
            .file_offset(VirtualAddress::new(0x0001_1000))
            .unwrap();
        assert_eq!(offset, 3 * PAGE_SIZE as u64);
        assert!(area.backing().is_file());
    }
}
