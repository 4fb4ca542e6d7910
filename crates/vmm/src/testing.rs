//! Test doubles shared by the unit tests.

use alloc::string::String;
use alloc::sync::Arc;
use alloc::vec::Vec;
use core::sync::atomic::{AtomicBool, AtomicIsize, AtomicU64, AtomicUsize, Ordering};
use std::time::{Duration, Instant};

use crate::boot::usable_extents;
use crate::file::{FileBackend, FileIdentity, FileMode};
use crate::memory::PhysicalMemory;
use crate::sched::{Scheduler, Worker};
use crate::{AddressTranslator, BootMemoryRegion, PhysicalAddress, Vm, VmConfig, VmError};

/// Emulated physical memory given to every test VM.
pub const TEST_MEMORY: usize = 512 * 1024;

pub struct TestRegion {
    base: usize,
    size: usize,
    usable: bool,
}

impl TestRegion {
    pub fn usable(base: usize, size: usize) -> Self {
        Self { base, size, usable: true }
    }

    pub fn reserved(base: usize, size: usize) -> Self {
        Self { base, size, usable: false }
    }
}

impl BootMemoryRegion for TestRegion {
    fn base(&self) -> PhysicalAddress {
        PhysicalAddress::new(self.base)
    }

    fn size(&self) -> usize {
        self.size
    }

    fn is_usable(&self) -> bool {
        self.usable
    }
}

/// Scheduler whose "current CPU" is whatever the test says it is.
pub struct TestScheduler {
    cpu: AtomicUsize,
    cpus: usize,
    preempt_depth: AtomicIsize,
    woken: spin::Mutex<Vec<Worker>>,
    stack_prefaults: AtomicUsize,
    emergency: AtomicBool,
    wait_timeout_ms: AtomicU64,
}

impl TestScheduler {
    pub fn new(cpus: usize) -> Arc<Self> {
        Arc::new(Self {
            cpu: AtomicUsize::new(0),
            cpus,
            preempt_depth: AtomicIsize::new(0),
            woken: spin::Mutex::new(Vec::new()),
            stack_prefaults: AtomicUsize::new(0),
            emergency: AtomicBool::new(false),
            wait_timeout_ms: AtomicU64::new(10_000),
        })
    }

    pub fn set_cpu(&self, cpu: usize) {
        assert!(cpu < self.cpus);
        self.cpu.store(cpu, Ordering::SeqCst);
    }

    pub fn set_emergency(&self, emergency: bool) {
        self.emergency.store(emergency, Ordering::SeqCst);
    }

    /// How long `wait_until` spins before it panics.
    pub fn set_wait_timeout(&self, timeout: Duration) {
        self.wait_timeout_ms.store(timeout.as_millis() as u64, Ordering::SeqCst);
    }

    /// Workers woken since the last call.
    pub fn take_woken(&self) -> Vec<Worker> {
        core::mem::take(&mut *self.woken.lock())
    }

    pub fn stack_prefaults(&self) -> usize {
        self.stack_prefaults.load(Ordering::SeqCst)
    }

    pub fn preempt_depth(&self) -> isize {
        self.preempt_depth.load(Ordering::SeqCst)
    }
}

impl Scheduler for TestScheduler {
    fn current_cpu(&self) -> usize {
        self.cpu.load(Ordering::SeqCst)
    }

    fn cpu_count(&self) -> usize {
        self.cpus
    }

    fn preempt_disable(&self) {
        self.preempt_depth.fetch_add(1, Ordering::SeqCst);
    }

    fn preempt_enable(&self) {
        let previous = self.preempt_depth.fetch_sub(1, Ordering::SeqCst);
        assert!(previous > 0, "unbalanced preempt_enable");
    }

    fn wait_until(&self, condition: &dyn Fn() -> bool) {
        let deadline = Instant::now() + Duration::from_millis(self.wait_timeout_ms.load(Ordering::SeqCst));
        while !condition() {
            assert!(Instant::now() < deadline, "wait_until timed out");
            std::thread::yield_now();
        }
    }

    fn wake_worker(&self, worker: Worker) {
        let mut woken = self.woken.lock();
        if !woken.contains(&worker) {
            woken.push(worker);
        }
    }

    fn ensure_stack_pages(&self, pages: usize) {
        self.stack_prefaults.fetch_add(pages, Ordering::SeqCst);
    }

    fn in_emergency_context(&self) -> bool {
        self.emergency.load(Ordering::SeqCst)
    }
}

/// In-memory file.
pub struct FakeFile {
    data: spin::Mutex<Vec<u8>>,
    mode: FileMode,
    inode: u64,
    fsyncs: AtomicUsize,
    writes: AtomicUsize,
}

impl FakeFile {
    pub fn new(data: Vec<u8>, mode: FileMode) -> Arc<Self> {
        static NEXT_INODE: AtomicUsize = AtomicUsize::new(100);
        Arc::new(Self {
            data: spin::Mutex::new(data),
            mode,
            inode: NEXT_INODE.fetch_add(1, Ordering::Relaxed) as u64,
            fsyncs: AtomicUsize::new(0),
            writes: AtomicUsize::new(0),
        })
    }

    /// A readable and writable file of `len` bytes where byte `i` is `i % 251`.
    pub fn patterned(len: usize) -> Arc<Self> {
        Self::new((0..len).map(|i| (i % 251) as u8).collect(), FileMode::READ | FileMode::WRITE)
    }

    pub fn contents(&self) -> Vec<u8> {
        self.data.lock().clone()
    }

    pub fn fsyncs(&self) -> usize {
        self.fsyncs.load(Ordering::SeqCst)
    }

    pub fn writes(&self) -> usize {
        self.writes.load(Ordering::SeqCst)
    }
}

impl FileBackend for FakeFile {
    fn size(&self) -> usize {
        self.data.lock().len()
    }

    fn read_at(&self, offset: usize, buf: &mut [u8]) -> Result<usize, VmError> {
        let data = self.data.lock();
        if offset >= data.len() {
            return Ok(0);
        }
        let len = buf.len().min(data.len() - offset);
        buf[..len].copy_from_slice(&data[offset..offset + len]);
        Ok(len)
    }

    fn write_at(&self, offset: usize, buf: &[u8]) -> Result<usize, VmError> {
        let mut data = self.data.lock();
        if offset + buf.len() > data.len() {
            data.resize(offset + buf.len(), 0);
        }
        data[offset..offset + buf.len()].copy_from_slice(buf);
        self.writes.fetch_add(1, Ordering::SeqCst);
        Ok(buf.len())
    }

    fn fsync(&self) -> Result<(), VmError> {
        self.fsyncs.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    fn mode(&self) -> FileMode {
        self.mode
    }

    fn identity(&self) -> FileIdentity {
        FileIdentity {
            dev: 0x0801,
            inode: self.inode,
            path: String::from("/data/fake"),
        }
    }
}

/// Installs emulated memory for this thread if the test has none yet.
pub fn emulated_memory() {
    if AddressTranslator::try_current().is_none() {
        AddressTranslator::set_current(AddressTranslator::emulated(TEST_MEMORY));
    }
}

/// Physical memory over all of [`TEST_MEMORY`], without a VM around it.
pub fn setup_memory(cpus: usize) -> (Arc<TestScheduler>, PhysicalMemory) {
    emulated_memory();
    let sched = TestScheduler::new(cpus);
    let memory = PhysicalMemory::new(&VmConfig::default(), sched.clone());
    memory.add_boot_memory(&usable_extents(&[TestRegion::usable(0, TEST_MEMORY)]));
    (sched, memory)
}

/// A VM over all of [`TEST_MEMORY`] with `cpus` CPUs.
pub fn setup_vm(cpus: usize) -> (Arc<TestScheduler>, Vm) {
    setup_vm_with(cpus, VmConfig::default())
}

pub fn setup_vm_with(cpus: usize, config: VmConfig) -> (Arc<TestScheduler>, Vm) {
    emulated_memory();
    let sched = TestScheduler::new(cpus);
    let vm = match Vm::new(config, sched.clone(), &[TestRegion::usable(0, TEST_MEMORY)]) {
        Ok(vm) => vm,
        Err(err) => panic!("cannot build test VM: {err}"),
    };
    (sched, vm)
}
