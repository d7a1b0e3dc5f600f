//! Test doubles and constructors shared by the unit tests.

use alloc::collections::BTreeMap;
use alloc::sync::Arc;
use alloc::vec::Vec;
use std::cell::Cell;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::time::Duration;

use crate::arch::{PAGE_SHIFT, PAGE_SIZE};
use crate::{
    AddressTranslator, BootMemoryRegion, CpuSet, InitFlags, InitState, Pager, PghashNode,
    PhysicalAddress, PhysicalAllocator, Platform, Pressure, PressureConfig, VirtualAddress, Vm,
    VmConfig, VmError,
};

std::thread_local! {
    static CPU: Cell<usize> = const { Cell::new(0) };
}

/// A platform whose CPU id is per test thread and whose shootdowns are recorded.
pub struct TestPlatform {
    cpus: usize,
    signal: AtomicBool,
    shootdowns: spin::Mutex<Vec<(CpuSet, VirtualAddress, usize)>>,
}

impl TestPlatform {
    pub fn new(cpus: usize) -> Self {
        Self {
            cpus,
            signal: AtomicBool::new(false),
            shootdowns: spin::Mutex::new(Vec::new()),
        }
    }

    /// Makes the calling thread run as `cpu`.
    pub fn set_cpu(&self, cpu: usize) {
        assert!(cpu < self.cpus, "cpu {cpu} out of range");
        CPU.with(|c| c.set(cpu));
    }

    pub fn raise_signal(&self) {
        self.signal.store(true, Ordering::SeqCst);
    }

    pub fn clear_signal(&self) {
        self.signal.store(false, Ordering::SeqCst);
    }

    pub fn shootdowns(&self) -> Vec<(CpuSet, VirtualAddress, usize)> {
        self.shootdowns.lock().clone()
    }
}

impl Platform for TestPlatform {
    fn cpu_id(&self) -> usize {
        CPU.with(Cell::get)
    }

    fn cpu_count(&self) -> usize {
        self.cpus
    }

    fn yield_now(&self) {
        std::thread::yield_now();
    }

    fn signal_pending(&self) -> bool {
        self.signal.load(Ordering::SeqCst)
    }

    fn shootdown(&self, cpus: CpuSet, addr: VirtualAddress, size: usize) {
        self.shootdowns.lock().push((cpus, addr, size));
    }
}

/// A firmware memory-map entry.
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

/// A physical allocator over `frames` frames that has finished early init only.
pub fn phys_allocator_early(frames: usize) -> Arc<PhysicalAllocator> {
    phys_allocator_early_on(frames, Arc::new(TestPlatform::new(1)))
}

fn phys_allocator_early_on(frames: usize, platform: Arc<TestPlatform>) -> Arc<PhysicalAllocator> {
    let size = frames * PAGE_SIZE;
    let pressure = Arc::new(Pressure::new(PressureConfig::default(), platform));
    let phys = Arc::new(PhysicalAllocator::new(
        AddressTranslator::emulated(size),
        pressure,
        Arc::new(InitState::new()),
    ));
    phys.add_segment(PhysicalAddress::new(0), size);
    phys.init_early();
    phys
}

/// Completes init of an allocator made by [`phys_allocator_early`].
pub fn finish_phys(phys: &PhysicalAllocator) {
    phys.init_state().mark(InitFlags::KMALLOC);
    phys.init();
}

/// A ready physical allocator over `frames` frames with `reserved` (base, size)
/// ranges withheld.
pub fn phys_allocator(frames: usize, reserved: &[(usize, usize)]) -> Arc<PhysicalAllocator> {
    phys_allocator_on(frames, reserved, Arc::new(TestPlatform::new(1)))
}

/// Like [`phys_allocator`], on a caller-supplied platform.
pub fn phys_allocator_on(
    frames: usize,
    reserved: &[(usize, usize)],
    platform: Arc<TestPlatform>,
) -> Arc<PhysicalAllocator> {
    let phys = phys_allocator_early_on(frames, platform);
    for &(base, size) in reserved {
        phys.reserve(PhysicalAddress::new(base), size, "test");
    }
    finish_phys(&phys);
    phys
}

/// A fully booted VM over `frames` frames of memory.
pub fn boot_with_frames(frames: usize) -> Arc<Vm> {
    boot_on(frames, Arc::new(TestPlatform::new(1)))
}

/// A fully booted VM over `frames` frames, on a caller-supplied platform.
pub fn boot_on(frames: usize, platform: Arc<TestPlatform>) -> Arc<Vm> {
    let size = frames * PAGE_SIZE;
    let result = Vm::boot(
        VmConfig::default(),
        AddressTranslator::emulated(size),
        platform,
        &[TestRegion::usable(0, size)],
        &[],
    );
    match result {
        Ok(vm) => vm,
        Err(err) => panic!("test boot failed: {err}"),
    }
}

/// A fully booted VM over 4KiB of memory.
pub fn boot() -> Arc<Vm> {
    boot_with_frames(256)
}

enum Mode {
    Normal,
    Slow,
    Failing,
}

/// A pager that serves a per-offset byte pattern, stores what is paged out and counts
/// calls.
pub struct CountingPager {
    mode: Mode,
    pub pageins: AtomicUsize,
    pub pageouts: AtomicUsize,
    stored: spin::Mutex<BTreeMap<usize, Vec<u8>>>,
    next_handle: AtomicUsize,
    fail_next: AtomicBool,
}

impl CountingPager {
    fn with_mode(mode: Mode) -> Self {
        Self {
            mode,
            pageins: AtomicUsize::new(0),
            pageouts: AtomicUsize::new(0),
            stored: spin::Mutex::new(BTreeMap::new()),
            next_handle: AtomicUsize::new(1),
            fail_next: AtomicBool::new(false),
        }
    }

    pub fn new() -> Self {
        Self::with_mode(Mode::Normal)
    }

    /// Takes a while over every pagein, so concurrent faulters overlap.
    pub fn slow() -> Self {
        Self::with_mode(Mode::Slow)
    }

    /// Fails every pagein with an I/O error.
    pub fn failing() -> Self {
        Self::with_mode(Mode::Failing)
    }

    /// Makes the next pagein fail with an I/O error.
    pub fn fail_next_pagein(&self) {
        self.fail_next.store(true, Ordering::SeqCst);
    }

    /// Contents served for a page that was never paged out.
    pub fn pattern(offset: u64) -> [u8; PAGE_SIZE] {
        let base = (offset >> PAGE_SHIFT) as u8;
        core::array::from_fn(|i| base.wrapping_mul(16).wrapping_add(i as u8))
    }
}

impl Pager for CountingPager {
    fn pagein(&self, offset: u64, node: Option<&PghashNode>, page: &mut [u8]) -> Result<(), VmError> {
        self.pageins.fetch_add(1, Ordering::SeqCst);
        if self.fail_next.swap(false, Ordering::SeqCst) {
            return Err(VmError::Io);
        }
        match self.mode {
            Mode::Failing => return Err(VmError::Io),
            Mode::Slow => std::thread::sleep(Duration::from_millis(20)),
            Mode::Normal => {}
        }
        match node.and_then(|n| self.stored.lock().get(&n.handle()).cloned()) {
            Some(data) => page.copy_from_slice(&data),
            None => page.copy_from_slice(&Self::pattern(offset)),
        }
        Ok(())
    }

    fn pageout(&self, _offset: u64, page: &[u8]) -> Result<Option<usize>, VmError> {
        self.pageouts.fetch_add(1, Ordering::SeqCst);
        let handle = self.next_handle.fetch_add(1, Ordering::SeqCst);
        self.stored.lock().insert(handle, page.to_vec());
        Ok(Some(handle))
    }
}
