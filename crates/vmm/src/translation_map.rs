//! Architecture-neutral translation maps.
//!
//! A [`TranslationMap`] owns one hardware page table hierarchy and is the single source of
//! truth for what an address space has actually mapped. The concrete entry encoding comes from
//! the `arch` module selected at compile time; this module only walks tables, which live in
//! frames obtained from the platform's frame allocator and are reached through the
//! [`AddressTranslator`].
//!
//! Leaf frames are never freed here. `unmap` hands the old translation back so the address
//! space can release the frame once every owner is gone.

use alloc::vec::Vec;
use core::{
    ops::Range,
    sync::atomic::{AtomicU64, Ordering},
};

use bitflags::bitflags;

use crate::{
    AccessKind, PhysicalAddress, Privilege, VirtualAddress, VmError,
    address::AddressTranslator,
    arch::{self, ENTRY_COUNT, PAGE_SIZE, PAGE_TABLE_LEVELS, PageEntry, PageFlags, PageTable},
    frame,
    platform::{CpuSet, Platform},
};

bitflags! {
    /// Access rights of a single mapped page.
    #[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
    pub struct Protection: u32 {
        const READ = 1 << 0;
        const WRITE = 1 << 1;
        const EXECUTE = 1 << 2;
        const USER = 1 << 3;
    }
}

impl Protection {
    /// Returns whether a mapping with this protection satisfies `access` at `privilege`.
    pub fn permits(self, access: AccessKind, privilege: Privilege) -> bool {
        let needed = match access {
            AccessKind::Read => Protection::READ,
            AccessKind::Write => Protection::WRITE,
            AccessKind::Execute => Protection::EXECUTE,
        };
        self.contains(needed) && (privilege == Privilege::Kernel || self.contains(Protection::USER))
    }

    fn page_flags(self) -> PageFlags {
        let mut flags = PageFlags::empty();
        flags.set_present(true);
        flags.set_writable(self.contains(Protection::WRITE));
        flags.set_user(self.contains(Protection::USER));
        flags.set_no_execute(!self.contains(Protection::EXECUTE));
        flags
    }

    fn from_page_flags(flags: PageFlags) -> Self {
        let mut protection = Protection::READ;
        protection.set(Protection::WRITE, flags.is_writable());
        protection.set(Protection::USER, flags.is_user());
        protection.set(Protection::EXECUTE, !flags.is_no_execute());
        protection
    }
}

/// What a present leaf entry translates to.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Translation {
    pub frame: PhysicalAddress,
    pub protection: Protection,
    /// The page has been touched since it was mapped.
    pub accessed: bool,
    /// The page has been written since it was mapped.
    pub dirty: bool,
}

impl Translation {
    fn from_entry(entry: PageEntry) -> Option<Self> {
        let frame = entry.address()?;
        let flags = entry.flags();
        Some(Self {
            frame,
            protection: Protection::from_page_flags(flags),
            accessed: flags.is_accessed(),
            dirty: flags.is_dirty(),
        })
    }

    /// The 4 KiB slice of the large page `entry` at `level` that covers `address`.
    fn within_large_page(entry: PageEntry, level: usize, address: VirtualAddress) -> Option<Self> {
        let offset = arch::raw_virtual(address.as_usize()) & (arch::level_span(level) - 1);
        let mut translation = Self::from_entry(entry)?;
        translation.frame = translation.frame + (offset & !(PAGE_SIZE - 1));
        Some(translation)
    }
}

/// Returns the table stored in `frame`.
///
/// # Safety
/// `frame` must hold a page table and no mutable reference to it may be live.
unsafe fn table<'a>(frame: PhysicalAddress) -> &'a PageTable {
    let translator = AddressTranslator::current();
    // SAFETY: Upheld by the caller.
    unsafe { &*translator.frame_pointer::<PageTable>(frame) }
}

/// Returns the table stored in `frame` for modification.
///
/// # Safety
/// `frame` must hold a page table and no other reference to it may be live.
unsafe fn table_mut<'a>(frame: PhysicalAddress) -> &'a mut PageTable {
    let translator = AddressTranslator::current();
    // SAFETY: Upheld by the caller.
    unsafe { &mut *translator.frame_pointer::<PageTable>(frame) }
}

/// One hardware page table hierarchy.
pub struct TranslationMap {
    root: PhysicalAddress,
    platform: Platform,
    /// Whether the tables were allocated by this map and must be freed with it.
    owns_tables: bool,
    /// Root entries that point into another map's tables (the kernel half of a user map).
    borrowed: Range<usize>,
    /// Kernel maps are visible on every CPU, so their shootdowns go to all online CPUs.
    global: bool,
    active_cpus: AtomicU64,
}

impl TranslationMap {
    /// Creates an empty map with a freshly allocated root table.
    pub fn new(platform: Platform) -> Result<Self, VmError> {
        let root = Self::allocate_table(platform)?;
        Ok(Self {
            root,
            platform,
            owns_tables: true,
            borrowed: 0..0,
            global: false,
            active_cpus: AtomicU64::new(0),
        })
    }

    /// Creates an empty user map whose kernel-half root entries are borrowed from the kernel
    /// map, see [`borrow_kernel_half`](Self::borrow_kernel_half).
    pub fn for_user(platform: Platform) -> Result<Self, VmError> {
        let mut map = Self::new(platform)?;
        map.borrowed = arch::kernel_root_index()..ENTRY_COUNT;
        Ok(map)
    }

    /// Copies the present kernel-half root entries of `kernel` into this user map.
    ///
    /// Allocates nothing, so it is safe to call with the kernel address space locked.
    pub fn borrow_kernel_half(&mut self, kernel: &TranslationMap) {
        // SAFETY: Both roots are live tables; `&mut self` covers this map's root.
        let (source, destination) = unsafe { (table(kernel.root), table_mut(self.root)) };
        for index in self.borrowed.clone() {
            let entry = source.entry(index);
            if entry.is_present() {
                *destination.entry_mut(index) = entry;
            }
        }
    }

    /// Adopts an existing page table hierarchy, such as the one the bootloader built.
    ///
    /// The tables are never freed by the returned map.
    ///
    /// # Safety
    /// `root` must be the root of a valid hierarchy reachable through the current
    /// [`AddressTranslator`], and nothing else may modify it afterwards.
    pub unsafe fn bootstrap(root: PhysicalAddress, platform: Platform) -> Self {
        Self {
            root,
            platform,
            owns_tables: false,
            borrowed: 0..0,
            global: false,
            active_cpus: AtomicU64::new(0),
        }
    }

    /// Adopts the hierarchy active on the calling CPU, if there is one.
    ///
    /// # Safety
    /// As for [`bootstrap`](Self::bootstrap).
    pub unsafe fn from_active(platform: Platform) -> Option<Self> {
        let root = arch::current_root()?;
        // SAFETY: Upheld by the caller.
        let map = unsafe { Self::bootstrap(root, platform) };
        map.active_cpus.store(
            CpuSet::single(platform.cpus().current_cpu()).bits(),
            Ordering::Release,
        );
        Some(map)
    }

    pub fn root(&self) -> PhysicalAddress {
        self.root
    }

    pub fn platform(&self) -> Platform {
        self.platform
    }

    /// Marks this map as the kernel map, whose translations every CPU may cache.
    pub(crate) fn set_global(&mut self) {
        self.global = true;
    }

    /// CPUs on which this map is currently active.
    pub fn active_cpus(&self) -> CpuSet {
        CpuSet::from_bits(self.active_cpus.load(Ordering::Acquire))
    }

    /// Installs this map on the calling CPU.
    ///
    /// # Safety
    /// The map must translate the kernel, including the running code and stack, and must
    /// not be dropped while active.
    pub unsafe fn activate(&self) {
        let cpu = self.platform.cpus().current_cpu();
        self.active_cpus
            .fetch_or(CpuSet::single(cpu).bits(), Ordering::AcqRel);
        // SAFETY: The root is a live table; the rest is upheld by the caller.
        unsafe { table(self.root).activate() };
    }

    /// Records that the calling CPU switched away from this map.
    pub fn deactivate(&self) {
        let cpu = self.platform.cpus().current_cpu();
        self.active_cpus
            .fetch_and(!CpuSet::single(cpu).bits(), Ordering::AcqRel);
    }

    /// Maps `page` to `frame` with `protection`, replacing any existing translation.
    ///
    /// Returns the replaced translation, which has been invalidated on every CPU. Missing
    /// intermediate tables are allocated first; if that fails nothing is modified. A page
    /// inside a large page, such as the bootloader's direct map, is a `RangeConflict`.
    ///
    /// # Panics
    /// Panics if `page` or `frame` is not page-aligned.
    pub fn map(
        &mut self,
        page: VirtualAddress,
        frame: PhysicalAddress,
        protection: Protection,
    ) -> Result<Option<Translation>, VmError> {
        assert!(page.is_aligned(PAGE_SIZE), "virtual address must be page-aligned");
        assert!(frame.is_aligned(PAGE_SIZE), "physical address must be page-aligned");

        // Levels from which the walk has to create tables.
        let mut missing = 0;
        let mut current = self.root;
        for level in (1..PAGE_TABLE_LEVELS).rev() {
            // SAFETY: `current` is a live table of this map.
            let entry = unsafe { table(current) }.entry(page.page_index(level));
            if entry.is_leaf() {
                log::warn!("cannot map {page}: covered by a level {level} large page");
                return Err(VmError::RangeConflict);
            }
            match entry.address() {
                Some(next) => current = next,
                None => {
                    missing = level;
                    break;
                }
            }
        }

        let mut fresh = [None; PAGE_TABLE_LEVELS];
        for index in 0..missing {
            match Self::allocate_table(self.platform) {
                Ok(table) => fresh[index] = Some(table),
                Err(error) => {
                    for table in fresh[..index].iter().flatten() {
                        self.platform.frames().free_frame(*table);
                    }
                    return Err(error);
                }
            }
        }
        let mut fresh = fresh.into_iter().flatten();

        let mut current = self.root;
        for level in (1..PAGE_TABLE_LEVELS).rev() {
            // SAFETY: `&mut self` gives exclusive access to this map's tables.
            let entry = unsafe { table_mut(current) }.entry_mut(page.page_index(level));
            current = match entry.address() {
                Some(next) => next,
                None => {
                    let next = fresh.next().ok_or(VmError::NoMemory)?;
                    *entry = PageEntry::new(next, Self::directory_flags());
                    next
                }
            };
        }

        // SAFETY: As above.
        let entry = unsafe { table_mut(current) }.entry_mut(page.page_index(0));
        let previous = Translation::from_entry(*entry);
        *entry = PageEntry::new(frame, protection.page_flags());

        if previous.is_some() {
            self.invalidate(page);
        }
        Ok(previous)
    }

    /// Removes the translation of `page`, invalidating it on every CPU that may cache it.
    ///
    /// Returns the removed translation, or `None` if the page was not mapped.
    pub fn unmap(&mut self, page: VirtualAddress) -> Option<Translation> {
        assert!(page.is_aligned(PAGE_SIZE), "virtual address must be page-aligned");

        let entry = self.leaf_entry_mut(page)?;
        let previous = Translation::from_entry(*entry)?;
        entry.clear();

        self.invalidate(page);
        Some(previous)
    }

    /// Returns the translation of the page containing `address`.
    ///
    /// Inside a large page this is the 4 KiB frame of it that backs `address`.
    pub fn query(&self, address: VirtualAddress) -> Option<Translation> {
        let mut current = self.root;
        for level in (1..PAGE_TABLE_LEVELS).rev() {
            // SAFETY: `current` is a live table of this map.
            let entry = unsafe { table(current) }.entry(address.page_index(level));
            if entry.is_leaf() {
                return Translation::within_large_page(entry, level, address);
            }
            current = entry.address()?;
        }
        // SAFETY: As above.
        Translation::from_entry(unsafe { table(current) }.entry(address.page_index(0)))
    }

    /// Returns every mapped page in `range`, in ascending order.
    ///
    /// Absent intermediate tables are skipped whole, so sparse ranges are cheap to scan. Large
    /// pages are never part of an area and are not reported.
    pub fn mapped(&self, range: Range<VirtualAddress>) -> Vec<(VirtualAddress, Translation)> {
        let mut found = Vec::new();
        let start = arch::raw_virtual(range.start.as_usize());
        let end = arch::raw_virtual(range.end.as_usize());
        if start < end {
            self.collect(self.root, PAGE_TABLE_LEVELS - 1, 0, start..end, &mut found);
        }
        found
    }

    fn collect(
        &self,
        frame: PhysicalAddress,
        level: usize,
        base: usize,
        range: Range<usize>,
        found: &mut Vec<(VirtualAddress, Translation)>,
    ) {
        let span = arch::level_span(level);
        let first = range.start.saturating_sub(base) / span;
        let last = range.end.saturating_sub(base).div_ceil(span).min(ENTRY_COUNT);

        // SAFETY: `frame` is a live table of this map.
        let table = unsafe { table(frame) };
        for index in first..last {
            let entry = table.entry(index);
            let address = base + index * span;
            if level == 0 {
                if let Some(translation) = Translation::from_entry(entry) {
                    found.push((VirtualAddress::new(arch::canonicalize_virtual(address)), translation));
                }
            } else if let Some(next) = entry.address().filter(|_| !entry.is_leaf()) {
                self.collect(next, level - 1, address, range.clone(), found);
            }
        }
    }

    /// Copies the root entry covering kernel `address` from `kernel` if this map lacks it.
    ///
    /// Kernel tables created after this map was built only become visible here this way.
    /// Returns whether an entry was copied.
    pub fn sync_kernel_entry(&mut self, kernel: &TranslationMap, address: VirtualAddress) -> bool {
        let index = address.page_index(PAGE_TABLE_LEVELS - 1);
        if !self.borrowed.contains(&index) {
            return false;
        }

        // SAFETY: Both roots are live tables; `&mut self` covers this map's root.
        let source = unsafe { table(kernel.root) }.entry(index);
        let destination = unsafe { table_mut(self.root) }.entry_mut(index);
        if destination.is_present() || !source.is_present() {
            return false;
        }
        *destination = source;
        true
    }

    fn leaf_entry_mut(&mut self, page: VirtualAddress) -> Option<&mut PageEntry> {
        let mut current = self.root;
        for level in (1..PAGE_TABLE_LEVELS).rev() {
            // SAFETY: `current` is a live table of this map.
            let entry = unsafe { table(current) }.entry(page.page_index(level));
            if entry.is_leaf() {
                return None;
            }
            current = entry.address()?;
        }
        // SAFETY: `&mut self` gives exclusive access to this map's tables.
        Some(unsafe { table_mut(current) }.entry_mut(page.page_index(0)))
    }

    /// Flushes `page` locally and shoots it down on every other CPU that may cache it.
    fn invalidate(&self, page: VirtualAddress) {
        let cpus = self.platform.cpus();
        let current = cpus.current_cpu();
        arch::flush_page(page);

        let candidates = if self.global {
            cpus.online_cpus()
        } else {
            self.active_cpus()
        };
        let targets = candidates.without(current);
        if !targets.is_empty() {
            cpus.shootdown(targets, page);
        }
    }

    fn directory_flags() -> PageFlags {
        let mut flags = PageFlags::empty();
        flags.set_present(true);
        flags.set_writable(true);
        flags.set_user(true);
        flags
    }

    fn allocate_table(platform: Platform) -> Result<PhysicalAddress, VmError> {
        let table = platform.frames().allocate_frame()?;
        // SAFETY: The frame was just allocated and is not referenced anywhere else.
        unsafe { frame::zero_frame(table) };
        Ok(table)
    }

    /// Frees the tables below `frame`, returning how many leaf pages were still mapped.
    fn free_subtables(&self, frame: PhysicalAddress, level: usize, skip: Range<usize>) -> usize {
        let mut still_mapped = 0;
        for index in 0..ENTRY_COUNT {
            if skip.contains(&index) {
                continue;
            }
            // SAFETY: `frame` is a live table of this map.
            let entry = unsafe { table(frame) }.entry(index);
            let Some(next) = entry.address() else {
                continue;
            };
            if level == 0 {
                still_mapped += 1;
            } else if !entry.is_leaf() {
                still_mapped += self.free_subtables(next, level - 1, 0..0);
                self.platform.frames().free_frame(next);
            }
        }
        still_mapped
    }
}

impl Drop for TranslationMap {
    fn drop(&mut self) {
        if !self.owns_tables {
            return;
        }

        debug_assert!(
            self.active_cpus().is_empty(),
            "translation map dropped while active on {:?}",
            self.active_cpus()
        );

        let still_mapped = self.free_subtables(self.root, PAGE_TABLE_LEVELS - 1, self.borrowed.clone());
        if still_mapped > 0 {
            log::warn!(
                "translation map {} released with {} pages still mapped",
                self.root,
                still_mapped
            );
        }
        self.platform.frames().free_frame(self.root);
    }
}
