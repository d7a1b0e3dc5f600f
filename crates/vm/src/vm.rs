//! The VM context.
//!
//! [`Vm`] owns every VM service: the physical allocator, the page hash, the kernel MMU
//! context, vmem, the kernel address space, the pressure counters and the reclaim
//! registry. It is built once at boot and passed by reference to everything that
//! needs memory; tests build as many as they like.
//!
//! Boot runs in stages, each asserted by the next:
//!
//! 1. [`Vm::add_segment`] / [`Vm::reserve`] while probing memory, then
//!    [`Vm::init_phys_early`].
//! 2. [`Vm::init_mmu`] creates the kernel MMU context.
//! 3. [`Vm::init_vmem`] hands the rest of kernel space to vmem.
//! 4. [`Vm::init_kmalloc`] once the heap (outside this crate) is up.
//! 5. [`Vm::init_phys`] moves all free memory to the buddy allocator.
//!
//! [`Vm::boot`] runs all of them.

use alloc::boxed::Box;
use alloc::sync::Arc;
use core::sync::atomic::{AtomicUsize, Ordering};

use crate::arch::{EARLY_MAP_LIMIT, KERNEL_VM_START, PAGE_SIZE, VMEM_END};
use crate::{
    AddressTranslator, BootMemoryRegion, HumanSize, InitFlags, InitState, MemoryType, Mmu, PageHash,
    Pager, PhysicalAddress, PhysicalAllocator, Platform, Pressure, Reclaim, Vas, VirtualAddress,
    VmConfig, VmError, VmFlags, VmObject, Vmem,
};

pub struct Vm {
    config: VmConfig,
    pub(crate) init: Arc<InitState>,
    platform: Arc<dyn Platform>,
    pressure: Arc<Pressure>,
    phys: Arc<PhysicalAllocator>,
    pghash: spin::Once<Arc<PageHash>>,
    kernel_mmu: spin::Once<Arc<Mmu>>,
    vmem: spin::Once<Arc<Vmem>>,
    kernel_vas: spin::Once<Arc<Vas>>,
    /// End of the kernel image plus early mappings; vmem starts here.
    pub(crate) kern_end: AtomicUsize,
    cpus: Box<[spin::Mutex<Option<Arc<Vas>>>]>,
    reclaim: Reclaim,
    pub(crate) faults: AtomicUsize,
}

impl Vm {
    pub fn new(config: VmConfig, memory: AddressTranslator, platform: Arc<dyn Platform>) -> Self {
        config.validate();
        let init = Arc::new(InitState::new());
        let pressure = Arc::new(Pressure::new(config.pressure, platform.clone()));
        let phys = Arc::new(PhysicalAllocator::new(memory, pressure.clone(), init.clone()));
        Self {
            config,
            init,
            platform,
            pressure,
            phys,
            pghash: spin::Once::new(),
            kernel_mmu: spin::Once::new(),
            vmem: spin::Once::new(),
            kernel_vas: spin::Once::new(),
            kern_end: AtomicUsize::new(KERNEL_VM_START + EARLY_MAP_LIMIT),
            cpus: (0..config.cpus).map(|_| spin::Mutex::new(None)).collect(),
            reclaim: Reclaim::new(),
            faults: AtomicUsize::new(0),
        }
    }

    /// Runs every boot stage over the firmware memory map.
    ///
    /// `reserved` lists ranges inside usable regions that must never be handed out
    /// (kernel image, boot modules, firmware tables).
    pub fn boot<R: BootMemoryRegion>(
        config: VmConfig,
        memory: AddressTranslator,
        platform: Arc<dyn Platform>,
        regions: &[R],
        reserved: &[(PhysicalAddress, usize, &'static str)],
    ) -> Result<Arc<Vm>, VmError> {
        let vm = Vm::new(config, memory, platform);
        for region in regions.iter().filter(|r| r.is_usable()) {
            vm.add_segment(region.base(), region.size());
        }
        for &(base, size, name) in reserved {
            vm.reserve(base, size, name);
        }
        vm.init_phys_early();
        vm.init_mmu()?;
        vm.init_vmem();
        vm.init_kmalloc();
        vm.init_phys();
        Ok(Arc::new(vm))
    }

    pub fn add_segment(&self, base: PhysicalAddress, size: usize) {
        log::debug!("vm: segment {:?} ({})", base, HumanSize(size));
        self.phys.add_segment(base, size);
    }

    pub fn reserve(&self, base: PhysicalAddress, size: usize, name: &'static str) {
        log::debug!("vm: reserve {:?} ({}) for {}", base, HumanSize(size), name);
        self.phys.reserve(base, size, name);
    }

    pub fn init_phys_early(&self) {
        self.phys.init_early();
    }

    pub fn init_mmu(&self) -> Result<(), VmError> {
        self.init.assert_ready(InitFlags::PHYS_EARLY);
        self.init.assert_not_ready(InitFlags::MMU);
        let mmu = Mmu::kernel(self.phys.clone(), self.platform.clone())?;
        self.kernel_mmu.call_once(|| Arc::new(mmu));
        self.init.mark(InitFlags::MMU);
        Ok(())
    }

    pub fn init_vmem(&self) {
        self.init.assert_ready(InitFlags::MMU);
        self.init.assert_not_ready(InitFlags::VMEM);
        let start = VirtualAddress::new(self.kern_end.load(Ordering::Acquire));
        let mmu = self.kernel_mmu().clone();
        let vmem = Arc::new(Vmem::new(start, VirtualAddress::new(VMEM_END), mmu.clone()));
        self.kernel_vas.call_once(|| Arc::new(Vas::kernel(mmu, vmem.clone())));
        self.vmem.call_once(|| vmem);
        self.init.mark(InitFlags::VMEM);
    }

    /// Records that the kernel heap is usable.
    pub fn init_kmalloc(&self) {
        self.init.assert_ready(InitFlags::VMEM);
        self.init.mark(InitFlags::KMALLOC);
    }

    pub fn init_phys(&self) {
        self.phys.init();
        let total = self.pressure.total(MemoryType::Phys);
        self.pghash
            .call_once(|| Arc::new(PageHash::for_memory(total, self.config.pghash_shift)));
        log::info!("vm: ready, {} free", HumanSize(self.phys.free_count() * PAGE_SIZE));
    }

    pub fn config(&self) -> &VmConfig {
        &self.config
    }

    pub fn init_state(&self) -> &InitState {
        &self.init
    }

    pub fn platform(&self) -> &Arc<dyn Platform> {
        &self.platform
    }

    pub fn pressure(&self) -> &Arc<Pressure> {
        &self.pressure
    }

    pub fn phys(&self) -> &Arc<PhysicalAllocator> {
        &self.phys
    }

    pub fn reclaim(&self) -> &Reclaim {
        &self.reclaim
    }

    fn stage<'a, T>(&self, cell: &'a spin::Once<T>, stage: InitFlags) -> &'a T {
        match cell.get() {
            Some(value) => value,
            None => panic!("{stage:?} used before init (completed: {:?})", self.init.current()),
        }
    }

    pub fn pghash(&self) -> &Arc<PageHash> {
        self.stage(&self.pghash, InitFlags::PHYS)
    }

    pub fn kernel_mmu(&self) -> &Arc<Mmu> {
        self.stage(&self.kernel_mmu, InitFlags::MMU)
    }

    pub fn vmem(&self) -> &Arc<Vmem> {
        self.stage(&self.vmem, InitFlags::VMEM)
    }

    pub fn kernel_vas(&self) -> &Arc<Vas> {
        self.stage(&self.kernel_vas, InitFlags::VMEM)
    }

    /// A zero-filled anonymous object of `size` bytes.
    pub fn anon_object(&self, size: u64) -> Arc<VmObject> {
        VmObject::anonymous(size, self.phys.clone(), self.pghash().clone())
    }

    /// An object of `size` bytes backed by `pager`.
    pub fn pager_object(&self, size: u64, pager: Arc<dyn Pager>) -> Arc<VmObject> {
        VmObject::paged(size, pager, self.phys.clone(), self.pghash().clone())
    }

    /// A new, empty user address space.
    pub fn vas_create(&self) -> Result<Vas, VmError> {
        self.init.assert_ready(InitFlags::PHYS);
        Vas::user(self.kernel_mmu().clone())
    }

    /// Makes `vas` the active address space of the calling CPU and returns the one it
    /// replaces. `None` leaves only the kernel half loaded.
    pub fn switch(&self, vas: Option<Arc<Vas>>) -> Option<Arc<Vas>> {
        let cpu = self.platform.cpu_id();
        let mut slot = self.cpus[cpu].lock();
        if let Some(old) = slot.as_ref() {
            old.mmu().deactivate(cpu);
        }
        match vas.as_ref() {
            Some(vas) => vas.mmu().activate(cpu),
            None => self.kernel_mmu().activate(cpu),
        }
        core::mem::replace(&mut *slot, vas)
    }

    /// The address space active on `cpu`.
    pub fn active_vas(&self, cpu: usize) -> Option<Arc<Vas>> {
        self.cpus[cpu].lock().clone()
    }

    /// Translates a kernel address, or a user address of the calling CPU's active
    /// address space.
    pub fn translate(&self, virt: VirtualAddress) -> Option<(PhysicalAddress, VmFlags)> {
        let addr = virt.as_usize();
        if (KERNEL_VM_START..KERNEL_VM_START + EARLY_MAP_LIMIT).contains(&addr) {
            return Some((PhysicalAddress::new(addr - KERNEL_VM_START), VmFlags::RW | VmFlags::KERN));
        }
        if virt.is_kernel() {
            return self.kernel_mmu.get()?.translate(virt);
        }
        self.active_vas(self.platform.cpu_id())?.translate(virt)
    }
}
