//! Emulated kernel services for unit tests.

use alloc::{boxed::Box, sync::Arc, vec::Vec};
use core::{
    cell::Cell,
    sync::atomic::{AtomicBool, AtomicUsize, Ordering},
};

use crate::{
    AddressTranslator, EmulatedFrameAllocator, PhysicalAddress, TranslationMap, VirtualAddress,
    arch::PAGE_SIZE,
    frame,
    platform::{BackingFile, CpuControl, CpuSet, FileError, FileHandle, Platform},
};

/// Size of the emulated physical memory given to each test thread.
pub const TEST_MEMORY_SIZE: usize = 2 * 1024 * 1024;

std::thread_local! {
    static CPU_INDEX: Cell<usize> = const { Cell::new(0) };
}

/// Emulated CPUs: each test thread is a CPU (index 0 unless changed), shootdowns are recorded.
pub struct TestCpus {
    online: AtomicUsize,
    shootdowns: spin::Mutex<Vec<(CpuSet, VirtualAddress)>>,
}

impl TestCpus {
    /// Makes the calling thread act as CPU `cpu`.
    pub fn set_current(&self, cpu: usize) {
        CPU_INDEX.with(|index| index.set(cpu));
    }

    pub fn set_online(&self, count: usize) {
        self.online.store(count, Ordering::Release);
    }

    pub fn shootdowns(&self) -> Vec<(CpuSet, VirtualAddress)> {
        self.shootdowns.lock().clone()
    }
}

impl CpuControl for TestCpus {
    fn current_cpu(&self) -> usize {
        CPU_INDEX.with(|index| index.get())
    }

    fn online_cpus(&self) -> CpuSet {
        let count = self.online.load(Ordering::Acquire);
        CpuSet::from_bits((1u64 << count) - 1)
    }

    fn shootdown(&self, targets: CpuSet, page: VirtualAddress) {
        self.shootdowns.lock().push((targets, page));
    }

    fn relax(&self) {
        std::thread::yield_now();
    }
}

/// Emulated memory, frame allocator and CPUs for one test.
///
/// Installs a fresh emulated translator on the calling thread, so create exactly one per
/// test and call [`attach`](Self::attach) on any thread the test spawns.
pub struct TestPlatform {
    pub frames: &'static EmulatedFrameAllocator,
    pub cpus: &'static TestCpus,
    pub platform: Platform,
}

impl TestPlatform {
    pub fn new() -> Self {
        AddressTranslator::set_current(AddressTranslator::emulated(TEST_MEMORY_SIZE));
        let memory = AddressTranslator::current()
            .memory()
            .expect("test translator is emulated");

        let frames: &'static EmulatedFrameAllocator =
            Box::leak(Box::new(EmulatedFrameAllocator::for_memory(memory)));
        let cpus: &'static TestCpus = Box::leak(Box::new(TestCpus {
            online: AtomicUsize::new(1),
            shootdowns: spin::Mutex::new(Vec::new()),
        }));

        Self {
            frames,
            cpus,
            platform: Platform::new(frames, cpus),
        }
    }

    /// Returns a closure that installs this test's emulated memory on another thread.
    pub fn attach(&self) -> impl FnOnce() + Send + 'static {
        let translator = AddressTranslator::current().share();
        move || AddressTranslator::set_current(translator)
    }

    /// A fresh, owned translation map to stand in for the boot page tables.
    pub fn bootstrap_map(&self) -> TranslationMap {
        TranslationMap::new(self.platform).expect("bootstrap map")
    }
}

/// Reads the byte at `offset` within `frame`.
pub fn read_frame_byte(frame: PhysicalAddress, offset: usize) -> u8 {
    assert!(offset < PAGE_SIZE);
    // SAFETY: Tests only read frames while no fault is writing them.
    unsafe { frame::frame_bytes(frame)[offset] }
}

/// Fills `frame` with `byte`.
pub fn fill_frame(frame: PhysicalAddress, byte: u8) {
    // SAFETY: Tests fill frames they mapped themselves while nothing else touches them.
    unsafe { frame::frame_bytes(frame).fill(byte) };
}

/// In-memory backing file.
pub struct MemoryFile {
    contents: Vec<u8>,
    failing: AtomicBool,
    reads: AtomicUsize,
}

impl MemoryFile {
    pub fn new(contents: Vec<u8>) -> Arc<Self> {
        Arc::new(Self {
            contents,
            failing: AtomicBool::new(false),
            reads: AtomicUsize::new(0),
        })
    }

    pub fn handle(self: &Arc<Self>) -> FileHandle {
        Arc::clone(self) as FileHandle
    }

    /// Makes every subsequent read fail.
    pub fn fail_reads(&self) {
        self.failing.store(true, Ordering::Release);
    }

    pub fn reads(&self) -> usize {
        self.reads.load(Ordering::Acquire)
    }
}

impl BackingFile for MemoryFile {
    fn read_at(&self, offset: u64, buffer: &mut [u8]) -> Result<usize, FileError> {
        self.reads.fetch_add(1, Ordering::AcqRel);
        if self.failing.load(Ordering::Acquire) {
            return Err(FileError);
        }

        let start = (offset as usize).min(self.contents.len());
        let available = &self.contents[start..];
        let count = available.len().min(buffer.len());
        buffer[..count].copy_from_slice(&available[..count]);
        Ok(count)
    }
}
