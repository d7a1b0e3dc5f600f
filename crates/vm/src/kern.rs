//! Kernel-space mapping helpers.
//!
//! Objects are mapped into the kernel address space like any other map and fault in
//! lazily. Physical ranges and single pages are wired immediately into a range taken
//! from vmem. Before vmem exists, [`Vm::map_phys_early`] reaches low memory through the
//! boot linear mapping and bumps a cursor past it for everything else.

use alloc::sync::Arc;
use core::sync::atomic::Ordering;

use crate::arch::{EARLY_MAP_LIMIT, KERNEL_VM_START, PAGE_SIZE, VMEM_END};
use crate::{InitFlags, Page, PhysicalAddress, VirtualAddress, Vm, VmError, VmFlags, VmObject};

impl Vm {
    /// Maps `size` bytes of `object` from `offset` into kernel space. Pages fault in on
    /// first touch and writes go straight to the object.
    pub fn kern_map_object(
        &self,
        object: Arc<VmObject>,
        offset: u64,
        size: usize,
        prot: VmFlags,
    ) -> Result<VirtualAddress, VmError> {
        let prot = prot.prot() | VmFlags::RD;
        self.kernel_vas()
            .map(None, size, object, offset, prot | VmFlags::SHARED, prot)
    }

    /// Removes a mapping made by [`Vm::kern_map_object`].
    pub fn kern_unmap_object(&self, addr: VirtualAddress, size: usize) -> Result<(), VmError> {
        self.kernel_vas().unmap(addr, size)
    }

    /// Maps the physical range `[phys, phys + size)` into kernel space.
    ///
    /// The range need not be page aligned; the returned address has the same offset
    /// into its page as `phys`.
    pub fn kern_map_phys(&self, phys: PhysicalAddress, size: usize, prot: VmFlags) -> Result<VirtualAddress, VmError> {
        if size == 0 {
            return Err(VmError::InvalidArgument);
        }
        let base = phys.align_down(PAGE_SIZE);
        let span = (phys.page_offset() + size).next_multiple_of(PAGE_SIZE);
        let prot = prot.prot() | VmFlags::RD | VmFlags::KERN;

        let vmem = self.vmem();
        let virt = vmem.alloc(span, VmFlags::empty())?;
        let mmu = self.kernel_mmu();
        for off in (0..span).step_by(PAGE_SIZE) {
            if let Err(err) = mmu.map_page(virt + off, base + off, prot) {
                mmu.unmap_range(virt, off);
                vmem.free(virt, span);
                return Err(err);
            }
        }
        log::debug!("kern: mapped {:?}+{:#x} at {:?}", base, span, virt);
        Ok(virt + phys.page_offset())
    }

    /// Removes a mapping made by [`Vm::kern_map_phys`].
    pub fn kern_unmap_phys(&self, addr: VirtualAddress, size: usize) {
        let base = addr.align_down(PAGE_SIZE);
        let span = (addr.page_offset() + size).next_multiple_of(PAGE_SIZE);
        self.kernel_mmu().unmap_range(base, span);
        self.vmem().free(base, span);
    }

    /// Maps an allocated block into kernel space.
    pub fn kern_map_page(&self, page: Page, prot: VmFlags) -> Result<VirtualAddress, VmError> {
        self.kern_map_phys(page.phys(), self.phys().size(page), prot)
    }

    /// Removes a mapping made by [`Vm::kern_map_page`].
    pub fn kern_unmap_page(&self, addr: VirtualAddress, page: Page) {
        self.kern_unmap_phys(addr, self.phys().size(page));
    }

    /// Makes `[phys, phys + size)` reachable before vmem is up.
    ///
    /// Memory below [`EARLY_MAP_LIMIT`] is already covered by the boot linear mapping.
    /// Anything else is mapped at the kernel end cursor, which vmem later starts from.
    pub fn map_phys_early(&self, phys: PhysicalAddress, size: usize) -> Result<VirtualAddress, VmError> {
        self.init.assert_ready(InitFlags::PHYS_EARLY);
        if phys.as_usize().checked_add(size).is_some_and(|end| end <= EARLY_MAP_LIMIT) {
            return Ok(VirtualAddress::new(KERNEL_VM_START + phys.as_usize()));
        }

        self.init.assert_ready(InitFlags::MMU);
        self.init.assert_not_ready(InitFlags::VMEM);
        let base = phys.align_down(PAGE_SIZE);
        let span = (phys.page_offset() + size).next_multiple_of(PAGE_SIZE);
        let start = self.kern_end.load(Ordering::Acquire);
        if start.checked_add(span).is_none_or(|end| end > VMEM_END) {
            return Err(VmError::OutOfMemory);
        }
        let virt = VirtualAddress::new(start);
        let mmu = self.kernel_mmu();
        for off in (0..span).step_by(PAGE_SIZE) {
            if let Err(err) = mmu.map_page(virt + off, base + off, VmFlags::RW | VmFlags::KERN) {
                mmu.unmap_range(virt, off);
                return Err(err);
            }
        }
        self.kern_end.store(start + span, Ordering::Release);
        log::debug!("kern: early map {:?}+{:#x} at {:?}", base, span, virt);
        Ok(virt + phys.page_offset())
    }

    /// Undoes [`Vm::map_phys_early`]. The cursor moves back only if this was the most
    /// recent early mapping.
    pub fn unmap_phys_early(&self, addr: VirtualAddress, size: usize) {
        let start = addr.as_usize();
        if start >= KERNEL_VM_START && start - KERNEL_VM_START + size <= EARLY_MAP_LIMIT {
            return;
        }
        self.init.assert_not_ready(InitFlags::VMEM);
        let base = addr.align_down(PAGE_SIZE);
        let span = (addr.page_offset() + size).next_multiple_of(PAGE_SIZE);
        self.kernel_mmu().unmap_range(base, span);
        let rolled_back = self.kern_end.compare_exchange(
            base.as_usize() + span,
            base.as_usize(),
            Ordering::AcqRel,
            Ordering::Acquire,
        );
        if rolled_back.is_err() {
            log::debug!("kern: early unmap of {:?}+{:#x} leaves a hole below the cursor", base, span);
        }
    }
}
