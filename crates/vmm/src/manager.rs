//! The address space manager.
//!
//! Owns the kernel address space and creates user address spaces that share its kernel
//! mappings. The kernel keeps one manager, installed once during boot with [`initialize`]
//! and reached afterwards through [`manager`] or the free functions in this module.

use alloc::sync::Arc;

use crate::{
    AccessKind, AddressSpace, AddressSpaceKind, Area, AreaFlags, Backing, Placement, Privilege,
    SharedFrames, TranslationMap, VirtualAddress, VmError, platform::Platform,
};

/// Process-wide registry of address spaces.
pub struct AddressSpaceManager {
    platform: Platform,
    kernel: Arc<AddressSpace>,
    shared: Arc<SharedFrames>,
}

impl AddressSpaceManager {
    /// Builds the kernel address space around the page tables the kernel booted with.
    ///
    /// The bootstrap map becomes global: changes to it are shot down on every online CPU,
    /// since every user space shares its kernel half.
    pub fn new(mut bootstrap: TranslationMap) -> Self {
        bootstrap.set_global();
        let platform = bootstrap.platform();
        let shared = Arc::new(SharedFrames::new());
        let kernel = Arc::new(AddressSpace::new(
            AddressSpaceKind::Kernel,
            bootstrap,
            Arc::clone(&shared),
        ));

        let domain = kernel.domain();
        log::info!(
            "kernel address space {}..{} on page tables at {}",
            domain.start,
            domain.end,
            kernel.translation_root()
        );

        Self {
            platform,
            kernel,
            shared,
        }
    }

    pub fn platform(&self) -> Platform {
        self.platform
    }

    pub fn kernel_address_space(&self) -> &Arc<AddressSpace> {
        &self.kernel
    }

    /// Owner counts for frames shared between address spaces.
    pub fn shared_frames(&self) -> &SharedFrames {
        &self.shared
    }

    /// Creates an empty user address space whose translation map borrows the kernel half.
    pub fn create_address_space(&self) -> Result<Arc<AddressSpace>, VmError> {
        // Allocated before taking the kernel lock.
        let mut translation = TranslationMap::for_user(self.platform)?;
        translation.borrow_kernel_half(&self.kernel.inner.lock().translation);
        let space = AddressSpace::new(AddressSpaceKind::User, translation, Arc::clone(&self.shared));
        log::debug!("created user address space {}", space.translation_root());
        Ok(Arc::new(space))
    }

    /// Creates a user address space with the same areas and contents as `source`.
    ///
    /// Writable private memory is shared copy-on-write until either side writes it.
    pub fn clone_address_space(&self, source: &AddressSpace) -> Result<Arc<AddressSpace>, VmError> {
        if source.kind() != AddressSpaceKind::User {
            return Err(VmError::InvalidArgument);
        }

        // On failure dropping the partial child releases whatever it already shares.
        let child = self.create_address_space()?;
        source.clone_into(&child)?;

        log::debug!(
            "cloned address space {} into {}",
            source.translation_root(),
            child.translation_root()
        );
        Ok(child)
    }

    /// Resolves a page fault raised while `current` was the active user address space.
    ///
    /// Kernel-half addresses resolve against the kernel address space; any kernel table the
    /// resolution needed is then copied into `current` so the retried access sees it.
    pub fn handle_page_fault(
        &self,
        current: Option<&AddressSpace>,
        address: VirtualAddress,
        access: AccessKind,
        privilege: Privilege,
    ) -> Result<(), VmError> {
        if self.kernel.domain().contains(&address) {
            self.kernel.handle_fault(address, access, privilege)?;
            if let Some(current) = current {
                current.sync_kernel_entry(&self.kernel, address);
            }
            return Ok(());
        }

        match current {
            Some(space) => space.handle_fault(address, access, privilege),
            None => {
                log::error!("{privilege:?} {access:?} fault at {address} with no user address space");
                Err(VmError::SegmentationViolation)
            }
        }
    }
}

#[cfg(not(any(test, feature = "software-emulation")))]
static MANAGER: spin::Once<AddressSpaceManager> = spin::Once::new();

// Leaked rather than owned so nothing is torn down during thread-local destruction, when
// the thread's translator may already be gone.
#[cfg(any(test, feature = "software-emulation"))]
std::thread_local! {
    static MANAGER: spin::Once<&'static AddressSpaceManager> = spin::Once::new();
}

/// Installs the manager, wrapping the boot page tables as the kernel address space.
///
/// Must run once, before other processors start and before any user address space exists.
/// Under emulation the manager is per thread.
///
/// # Panics
///
/// Panics if the manager has already been initialized.
pub fn initialize(bootstrap: TranslationMap) -> &'static AddressSpaceManager {
    if try_manager().is_some() {
        panic!("virtual memory manager already initialized");
    }

    #[cfg(not(any(test, feature = "software-emulation")))]
    {
        MANAGER.call_once(|| AddressSpaceManager::new(bootstrap))
    }

    #[cfg(any(test, feature = "software-emulation"))]
    {
        let manager: &'static AddressSpaceManager =
            alloc::boxed::Box::leak(alloc::boxed::Box::new(AddressSpaceManager::new(bootstrap)));
        MANAGER.with(|slot| *slot.call_once(|| manager))
    }
}

/// Returns the manager.
///
/// # Panics
///
/// Panics if [`initialize`] has not run.
pub fn manager() -> &'static AddressSpaceManager {
    try_manager().expect("virtual memory manager used before initialize")
}

fn try_manager() -> Option<&'static AddressSpaceManager> {
    #[cfg(not(any(test, feature = "software-emulation")))]
    {
        MANAGER.get()
    }

    #[cfg(any(test, feature = "software-emulation"))]
    {
        MANAGER.with(|slot| slot.get().copied())
    }
}

/// The kernel address space singleton.
pub fn get_kernel_address_space() -> Arc<AddressSpace> {
    Arc::clone(manager().kernel_address_space())
}

/// See [`AddressSpaceManager::create_address_space`].
pub fn create_address_space() -> Result<Arc<AddressSpace>, VmError> {
    manager().create_address_space()
}

/// Creates an area in `space`; see [`AddressSpace::create_area`].
pub fn create_area(
    space: &AddressSpace,
    address: VirtualAddress,
    size: usize,
    placement: Placement,
    name: Option<&str>,
    flags: AreaFlags,
    backing: Backing,
) -> Result<Area, VmError> {
    space.create_area(address, size, placement, name, flags, backing)
}

/// Removes the area of `space` containing `address`; see [`AddressSpace::destroy_area`].
pub fn destroy_area(space: &AddressSpace, address: VirtualAddress) -> Result<Area, VmError> {
    space.destroy_area(address)
}

/// See [`AddressSpaceManager::clone_address_space`].
pub fn clone_address_space(source: &AddressSpace) -> Result<Arc<AddressSpace>, VmError> {
    manager().clone_address_space(source)
}

/// Entry point for the trap dispatcher; see [`AddressSpaceManager::handle_page_fault`].
pub fn handle_page_fault(
    current: Option<&AddressSpace>,
    address: VirtualAddress,
    access: AccessKind,
    privilege: Privilege,
) -> Result<(), VmError> {
    manager().handle_page_fault(current, address, access, privilege)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        EmulatedFrameAllocator, KERNEL_START, PAGE_SIZE, PhysicalAddress, Protection,
        platform::FrameAllocator,
        testing::{MemoryFile, TestPlatform, fill_frame, read_frame_byte},
    };
    use alloc::boxed::Box;
    use core::sync::atomic::{AtomicUsize, Ordering};

    const HEAP: usize = 0x0001_0000;
    const DATA: AreaFlags = AreaFlags::READ.union(AreaFlags::WRITE).union(AreaFlags::USER);

    fn at(address: usize) -> VirtualAddress {
        VirtualAddress::new(address)
    }

    fn heap(space: &AddressSpace, pages: usize, flags: AreaFlags) -> Area {
        create_area(
            space,
            at(HEAP),
            pages * PAGE_SIZE,
            Placement::Exact,
            Some("heap"),
            flags,
            Backing::Anonymous,
        )
        .unwrap()
    }

    #[test]
    #[should_panic(expected = "used before initialize")]
    fn kernel_space_before_initialize_is_fatal() {
        let _test = TestPlatform::new();
        get_kernel_address_space();
    }

    #[test]
    #[should_panic(expected = "already initialized")]
    fn initializing_twice_is_fatal() {
        let test = TestPlatform::new();
        initialize(test.bootstrap_map());
        initialize(test.bootstrap_map());
    }

    #[test]
    fn initialize_wraps_the_bootstrap_map() {
        let test = TestPlatform::new();
        let bootstrap = test.bootstrap_map();
        let root = bootstrap.root();
        initialize(bootstrap);

        let kernel = get_kernel_address_space();
        assert_eq!(kernel.kind(), AddressSpaceKind::Kernel);
        assert_eq!(kernel.translation_root(), root);
        assert!(kernel.areas().is_empty());
        assert!(Arc::ptr_eq(&kernel, &get_kernel_address_space()));
    }

    #[test]
    fn new_user_spaces_are_empty_and_distinct() {
        let test = TestPlatform::new();
        initialize(test.bootstrap_map());

        let first = create_address_space().unwrap();
        let second = create_address_space().unwrap();
        assert_eq!(first.kind(), AddressSpaceKind::User);
        assert!(first.areas().is_empty());
        assert_ne!(first.translation_root(), second.translation_root());
    }

    #[test]
    fn create_address_space_out_of_memory_leaks_nothing() {
        let test = TestPlatform::new();
        let manager = AddressSpaceManager::new(test.bootstrap_map());
        let before = test.frames.outstanding();

        test.frames.set_limit(Some(before));
        assert!(matches!(
            manager.create_address_space(),
            Err(VmError::NoMemory)
        ));
        assert_eq!(test.frames.outstanding(), before);
    }

    /// Frame allocator that counts allocations made while the kernel space is locked.
    struct WatchedFrames {
        frames: &'static EmulatedFrameAllocator,
        kernel: spin::Once<Arc<AddressSpace>>,
        under_kernel_lock: AtomicUsize,
    }

    impl FrameAllocator for WatchedFrames {
        fn allocate_frame(&self) -> Result<PhysicalAddress, VmError> {
            if self.kernel.get().is_some_and(|kernel| kernel.inner.is_locked()) {
                self.under_kernel_lock.fetch_add(1, Ordering::AcqRel);
            }
            self.frames.allocate_frame()
        }

        fn free_frame(&self, frame: PhysicalAddress) {
            self.frames.free_frame(frame);
        }
    }

    #[test]
    fn user_roots_are_allocated_outside_the_kernel_lock() {
        let test = TestPlatform::new();
        let watched: &'static WatchedFrames = Box::leak(Box::new(WatchedFrames {
            frames: test.frames,
            kernel: spin::Once::new(),
            under_kernel_lock: AtomicUsize::new(0),
        }));
        let platform = Platform::new(watched, test.cpus);
        let manager = AddressSpaceManager::new(TranslationMap::new(platform).unwrap());
        watched
            .kernel
            .call_once(|| Arc::clone(manager.kernel_address_space()));

        let space = manager.create_address_space().unwrap();
        assert_eq!(watched.under_kernel_lock.load(Ordering::Acquire), 0);
        assert_eq!(test.frames.outstanding(), 2);
        drop(space);
    }

    #[test]
    fn create_area_validates_its_arguments() {
        let test = TestPlatform::new();
        let manager = AddressSpaceManager::new(test.bootstrap_map());
        let space = manager.create_address_space().unwrap();
        let create = |address: usize, size: usize, placement: Placement| {
            create_area(
                &space,
                at(address),
                size,
                placement,
                None,
                DATA,
                Backing::Anonymous,
            )
        };

        assert_eq!(create(HEAP + 1, PAGE_SIZE, Placement::Exact).unwrap_err(), VmError::InvalidArgument);
        assert_eq!(create(HEAP, 0, Placement::Exact).unwrap_err(), VmError::InvalidArgument);
        assert_eq!(create(HEAP, PAGE_SIZE + 1, Placement::Exact).unwrap_err(), VmError::InvalidArgument);
        assert_eq!(create(KERNEL_START, PAGE_SIZE, Placement::Exact).unwrap_err(), VmError::InvalidArgument);

        let area = create(HEAP, 2 * PAGE_SIZE, Placement::Exact).unwrap();
        assert_eq!(area.start(), at(HEAP));
        assert_eq!(create(HEAP + PAGE_SIZE, PAGE_SIZE, Placement::Exact).unwrap_err(), VmError::RangeConflict);
        assert_eq!(create(HEAP, PAGE_SIZE, Placement::SearchLow).unwrap().start(), at(HEAP + 2 * PAGE_SIZE));

        // Creating an area maps nothing.
        assert_eq!(space.query(at(HEAP)), None);
    }

    #[test]
    fn file_areas_reject_growth_and_misaligned_offsets() {
        let test = TestPlatform::new();
        let manager = AddressSpaceManager::new(test.bootstrap_map());
        let space = manager.create_address_space().unwrap();
        let file = MemoryFile::new(alloc::vec![0; PAGE_SIZE]);

        let misaligned = space.create_area(
            at(HEAP),
            PAGE_SIZE,
            Placement::Exact,
            None,
            AreaFlags::READ,
            Backing::file(file.handle(), 12),
        );
        assert_eq!(misaligned.unwrap_err(), VmError::InvalidArgument);

        let growable = space.create_area(
            at(HEAP),
            PAGE_SIZE,
            Placement::Exact,
            None,
            AreaFlags::READ | AreaFlags::GROWABLE,
            Backing::file(file.handle(), 0),
        );
        assert_eq!(growable.unwrap_err(), VmError::InvalidArgument);
    }

    #[test]
    fn destroy_area_unmaps_and_releases_its_pages() {
        let test = TestPlatform::new();
        let manager = AddressSpaceManager::new(test.bootstrap_map());
        let space = manager.create_address_space().unwrap();
        heap(&space, 2, DATA);
        let before = test.frames.outstanding();

        space
            .handle_fault(at(HEAP), AccessKind::Write, Privilege::User)
            .unwrap();
        space
            .handle_fault(at(HEAP + PAGE_SIZE), AccessKind::Write, Privilege::User)
            .unwrap();
        let table = 1;
        assert_eq!(test.frames.outstanding(), before + table + 2);

        let removed = destroy_area(&space, at(HEAP + PAGE_SIZE)).unwrap();
        assert_eq!(removed.name(), Some("heap"));
        assert_eq!(space.query(at(HEAP)), None);
        assert_eq!(test.frames.outstanding(), before + table);
        assert_eq!(destroy_area(&space, at(HEAP)).unwrap_err(), VmError::NotFound);
        assert_eq!(
            space.handle_fault(at(HEAP), AccessKind::Read, Privilege::User),
            Err(VmError::SegmentationViolation)
        );
    }

    #[test]
    fn dropping_a_user_space_returns_every_frame() {
        let test = TestPlatform::new();
        let manager = AddressSpaceManager::new(test.bootstrap_map());
        let baseline = test.frames.outstanding();

        let space = manager.create_address_space().unwrap();
        heap(&space, 4, DATA);
        create_area(
            &space,
            at(0x0080_0000),
            PAGE_SIZE,
            Placement::Exact,
            Some("far"),
            DATA,
            Backing::Anonymous,
        )
        .unwrap();
        for page in 0..4 {
            space
                .handle_fault(at(HEAP + page * PAGE_SIZE), AccessKind::Write, Privilege::User)
                .unwrap();
        }
        space
            .handle_fault(at(0x0080_0000), AccessKind::Read, Privilege::User)
            .unwrap();
        assert!(test.frames.outstanding() > baseline);

        drop(space);
        assert_eq!(test.frames.outstanding(), baseline);
    }

    #[test]
    fn clone_shares_private_pages_copy_on_write() {
        let test = TestPlatform::new();
        let manager = AddressSpaceManager::new(test.bootstrap_map());
        let parent = manager.create_address_space().unwrap();
        heap(&parent, 1, DATA);
        parent
            .handle_fault(at(HEAP), AccessKind::Write, Privilege::User)
            .unwrap();
        let frame = parent.query(at(HEAP)).unwrap().frame;
        fill_frame(frame, 0x42);

        let child = manager.clone_address_space(&parent).unwrap();

        let child_area = child.find_area(at(HEAP)).unwrap();
        assert_eq!(child_area.name(), Some("heap"));
        assert!(child_area.is_copy_on_write());
        assert!(parent.find_area(at(HEAP)).unwrap().is_copy_on_write());

        let (in_parent, in_child) = (parent.query(at(HEAP)).unwrap(), child.query(at(HEAP)).unwrap());
        assert_eq!(in_parent.frame, frame);
        assert_eq!(in_child.frame, frame);
        assert!(!in_parent.protection.contains(Protection::WRITE));
        assert!(!in_child.protection.contains(Protection::WRITE));
        assert_eq!(manager.shared_frames().owners(frame), 2);

        child
            .handle_fault(at(HEAP), AccessKind::Write, Privilege::User)
            .unwrap();
        let copy = child.query(at(HEAP)).unwrap().frame;
        assert_ne!(copy, frame);
        assert_eq!(read_frame_byte(copy, 7), 0x42);
        assert_eq!(manager.shared_frames().owners(frame), 1);
    }

    #[test]
    fn clone_keeps_shared_areas_writable_in_both() {
        let test = TestPlatform::new();
        let manager = AddressSpaceManager::new(test.bootstrap_map());
        let parent = manager.create_address_space().unwrap();
        heap(&parent, 1, DATA | AreaFlags::SHARED);
        parent
            .handle_fault(at(HEAP), AccessKind::Write, Privilege::User)
            .unwrap();
        let frame = parent.query(at(HEAP)).unwrap().frame;

        let child = manager.clone_address_space(&parent).unwrap();
        let in_child = child.query(at(HEAP)).unwrap();
        assert_eq!(in_child.frame, frame);
        assert!(in_child.protection.contains(Protection::WRITE));
        assert!(!child.find_area(at(HEAP)).unwrap().is_copy_on_write());

        // The frame outlives whichever space lets go first.
        let before = test.frames.outstanding();
        drop(parent);
        assert_eq!(child.query(at(HEAP)).unwrap().frame, frame);
        assert!(test.frames.outstanding() < before);
        drop(child);
        assert_eq!(manager.shared_frames().tracked(), 0);
    }

    #[test]
    fn clones_release_everything_when_both_sides_drop() {
        let test = TestPlatform::new();
        let manager = AddressSpaceManager::new(test.bootstrap_map());
        let baseline = test.frames.outstanding();

        let parent = manager.create_address_space().unwrap();
        heap(&parent, 2, DATA);
        parent
            .handle_fault(at(HEAP), AccessKind::Write, Privilege::User)
            .unwrap();
        let child = manager.clone_address_space(&parent).unwrap();
        child
            .handle_fault(at(HEAP + PAGE_SIZE), AccessKind::Write, Privilege::User)
            .unwrap();

        drop(parent);
        drop(child);
        assert_eq!(test.frames.outstanding(), baseline);
        assert_eq!(manager.shared_frames().tracked(), 0);
    }

    #[test]
    fn the_kernel_space_cannot_be_cloned() {
        let test = TestPlatform::new();
        let manager = AddressSpaceManager::new(test.bootstrap_map());
        assert!(matches!(
            manager.clone_address_space(manager.kernel_address_space()),
            Err(VmError::InvalidArgument)
        ));
    }

    #[test]
    fn kernel_faults_resolve_in_the_kernel_space_and_reach_the_current_space() {
        let test = TestPlatform::new();
        initialize(test.bootstrap_map());
        let user = create_address_space().unwrap();

        let address = at(KERNEL_START + 0x0100_0000);
        let kernel = get_kernel_address_space();
        create_area(
            &kernel,
            address,
            PAGE_SIZE,
            Placement::Exact,
            Some("kernel heap"),
            AreaFlags::READ | AreaFlags::WRITE,
            Backing::Anonymous,
        )
        .unwrap();
        assert_eq!(user.query(address), None);

        handle_page_fault(Some(&user), address, AccessKind::Write, Privilege::Kernel).unwrap();

        let mapped = kernel.query(address).unwrap();
        assert_eq!(user.query(address), Some(mapped));
        assert!(user.areas().is_empty());

        assert_eq!(
            handle_page_fault(Some(&user), address, AccessKind::Read, Privilege::User),
            Err(VmError::AccessViolation)
        );
    }

    #[test]
    fn user_faults_resolve_in_the_current_space() {
        let test = TestPlatform::new();
        initialize(test.bootstrap_map());
        let user = create_address_space().unwrap();
        heap(&user, 1, DATA);

        handle_page_fault(Some(&user), at(HEAP + 0x10), AccessKind::Write, Privilege::User).unwrap();
        assert!(user.query(at(HEAP)).is_some());
        assert_eq!(
            handle_page_fault(None, at(HEAP), AccessKind::Read, Privilege::User),
            Err(VmError::SegmentationViolation)
        );
    }
}
