//! Binding of an address space to the MMU.
//!
//! Wraps the architecture's [`MmuContext`] with TLB maintenance: every change that can
//! leave a stale translation is flushed locally and shot down on the other CPUs that
//! have the context loaded. The kernel context is global, so its flushes go to every
//! CPU.

use alloc::sync::Arc;
use alloc::vec::Vec;
use core::sync::atomic::{AtomicU32, Ordering};

use crate::arch::{self, MmuContext, PAGE_SIZE, PageFlags};
use crate::{CpuSet, PhysicalAddress, PhysicalAllocator, Platform, VirtualAddress, VmError, VmFlags};

pub struct Mmu {
    context: MmuContext,
    active: AtomicU32,
    global: bool,
    phys: Arc<PhysicalAllocator>,
    platform: Arc<dyn Platform>,
}

impl Mmu {
    pub(crate) fn kernel(phys: Arc<PhysicalAllocator>, platform: Arc<dyn Platform>) -> Result<Self, VmError> {
        let context = MmuContext::new_kernel(&*phys)?;
        Ok(Self {
            context,
            active: AtomicU32::new(0),
            global: true,
            phys,
            platform,
        })
    }

    /// A user context sharing the kernel half of `kernel`.
    pub(crate) fn user(kernel: &Mmu) -> Result<Self, VmError> {
        let context = MmuContext::new_user(&kernel.context, &*kernel.phys)?;
        Ok(Self {
            context,
            active: AtomicU32::new(0),
            global: false,
            phys: kernel.phys.clone(),
            platform: kernel.platform.clone(),
        })
    }

    pub fn is_global(&self) -> bool {
        self.global
    }

    pub(crate) fn phys(&self) -> &Arc<PhysicalAllocator> {
        &self.phys
    }

    /// CPUs that currently have this context loaded.
    pub fn active_cpus(&self) -> CpuSet {
        CpuSet::from_bits(self.active.load(Ordering::Acquire))
    }

    /// Installs a translation for one page, replacing any previous one.
    pub fn map_page(&self, virt: VirtualAddress, phys: PhysicalAddress, prot: VmFlags) -> Result<(), VmError> {
        let old = self
            .context
            .map(virt, phys, PageFlags::from_prot(prot), &*self.phys)?;
        if old.is_some() {
            self.flush(virt, PAGE_SIZE);
        }
        Ok(())
    }

    /// Removes the translation of one page, returning the frame it pointed to.
    pub fn unmap_page(&self, virt: VirtualAddress) -> Option<PhysicalAddress> {
        let old = self.context.unmap(virt, &*self.phys);
        if old.is_some() {
            self.flush(virt, PAGE_SIZE);
        }
        old
    }

    /// Removes the translation of `virt` only if it points at `phys`.
    ///
    /// Callers serialize against installs of the same page with the owning map's lock.
    pub fn unmap_frame(&self, virt: VirtualAddress, phys: PhysicalAddress) -> bool {
        match self.context.translate(virt, &*self.phys) {
            Some((current, _)) if current == phys => self.unmap_page(virt).is_some(),
            _ => false,
        }
    }

    /// Removes every translation in `[start, start + size)` with a single flush and
    /// returns the frames that were mapped.
    pub fn unmap_range(&self, start: VirtualAddress, size: usize) -> Vec<PhysicalAddress> {
        let frames: Vec<PhysicalAddress> = (0..size)
            .step_by(PAGE_SIZE)
            .filter_map(|off| self.context.unmap(start + off, &*self.phys))
            .collect();
        if !frames.is_empty() {
            self.flush(start, size);
        }
        frames
    }

    /// Restricts present translations in a range to `prot`. Pages left with no access
    /// are unmapped.
    pub fn protect_range(&self, start: VirtualAddress, size: usize, prot: VmFlags) {
        let access = VmFlags::RD | VmFlags::WR | VmFlags::EXEC;
        let mut changed = false;
        for off in (0..size).step_by(PAGE_SIZE) {
            let virt = start + off;
            let Some((_, flags)) = self.context.translate(virt, &*self.phys) else {
                continue;
            };
            let current = flags.to_prot();
            let wanted = (current & prot & access) | (current & VmFlags::KERN);
            if wanted == current {
                continue;
            }
            if wanted.intersects(access) {
                self.context
                    .protect(virt, PageFlags::from_prot(wanted), &*self.phys);
            } else {
                self.context.unmap(virt, &*self.phys);
            }
            changed = true;
        }
        if changed {
            self.flush(start, size);
        }
    }

    /// The frame-relative physical address and protection `virt` translates to.
    pub fn translate(&self, virt: VirtualAddress) -> Option<(PhysicalAddress, VmFlags)> {
        let page = virt.align_down(PAGE_SIZE);
        self.context
            .translate(page, &*self.phys)
            .map(|(phys, flags)| (phys + virt.page_offset(), flags.to_prot()))
    }

    /// Loads the context on `cpu`, which must be the calling CPU.
    pub(crate) fn activate(&self, cpu: usize) {
        self.active.fetch_or(1 << cpu, Ordering::AcqRel);
        // SAFETY: every context maps the kernel half, so the running kernel stays
        // mapped across the switch.
        unsafe { self.context.activate(&*self.phys) };
    }

    pub(crate) fn deactivate(&self, cpu: usize) {
        self.active.fetch_and(!(1 << cpu), Ordering::AcqRel);
    }

    fn flush(&self, start: VirtualAddress, size: usize) {
        for off in (0..size).step_by(PAGE_SIZE) {
            arch::invalidate_local(start + off);
        }
        let targets = match self.global {
            true => CpuSet::all(self.platform.cpu_count()),
            false => self.active_cpus(),
        };
        let others = targets.without(self.platform.cpu_id());
        if !others.is_empty() {
            #[cfg(feature = "detailed-logging")]
            log::trace!("mmu: shootdown {:?}+{:#x} on {:?}", start, size, others);
            self.platform.shootdown(others, start, size);
        }
    }
}

impl Drop for Mmu {
    fn drop(&mut self) {
        self.context.destroy(&*self.phys);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{self, TestPlatform};

    fn user_mmu(platform: &Arc<TestPlatform>) -> Mmu {
        let phys = testing::phys_allocator(16, &[]);
        let kernel = Mmu::kernel(phys, platform.clone()).unwrap();
        Mmu::user(&kernel).unwrap()
    }

    #[test]
    fn translate_keeps_the_page_offset() {
        let platform = Arc::new(TestPlatform::new(1));
        let mmu = user_mmu(&platform);
        let virt = VirtualAddress::new(0x1000);
        mmu.map_page(virt, PhysicalAddress::new(0x40), VmFlags::RW).unwrap();

        let (phys, prot) = mmu.translate(virt + 5).unwrap();
        assert_eq!(phys, PhysicalAddress::new(0x45));
        assert!(prot.contains(VmFlags::RW));
        assert!(!prot.contains(VmFlags::KERN));
    }

    #[test]
    fn remote_cpus_are_shot_down_only_when_active() {
        let platform = Arc::new(TestPlatform::new(4));
        let mmu = user_mmu(&platform);
        let virt = VirtualAddress::new(0x1000);
        mmu.map_page(virt, PhysicalAddress::new(0x40), VmFlags::RW).unwrap();
        mmu.unmap_page(virt);
        assert!(platform.shootdowns().is_empty());

        mmu.activate(0);
        mmu.activate(2);
        mmu.map_page(virt, PhysicalAddress::new(0x40), VmFlags::RW).unwrap();
        mmu.map_page(virt, PhysicalAddress::new(0x80), VmFlags::RW).unwrap();
        assert_eq!(platform.shootdowns(), [(CpuSet::empty().with(2), virt, PAGE_SIZE)]);

        mmu.deactivate(2);
        mmu.unmap_page(virt);
        assert_eq!(platform.shootdowns().len(), 1);
    }

    #[test]
    fn kernel_flushes_reach_every_cpu() {
        let platform = Arc::new(TestPlatform::new(3));
        let phys = testing::phys_allocator(16, &[]);
        let kernel = Mmu::kernel(phys, platform.clone()).unwrap();
        let virt = VirtualAddress::new(0xD000);
        kernel.map_page(virt, PhysicalAddress::new(0x40), VmFlags::RW | VmFlags::KERN).unwrap();
        kernel.unmap_page(virt);
        assert_eq!(platform.shootdowns(), [(CpuSet::all(3).without(0), virt, PAGE_SIZE)]);
    }

    #[test]
    fn protect_range_only_downgrades() {
        let platform = Arc::new(TestPlatform::new(1));
        let mmu = user_mmu(&platform);
        let a = VirtualAddress::new(0x1000);
        let b = a + PAGE_SIZE;
        mmu.map_page(a, PhysicalAddress::new(0x40), VmFlags::RW).unwrap();
        mmu.map_page(b, PhysicalAddress::new(0x50), VmFlags::RD).unwrap();

        mmu.protect_range(a, 2 * PAGE_SIZE, VmFlags::RD);
        assert!(!mmu.translate(a).unwrap().1.contains(VmFlags::WR));

        mmu.protect_range(a, 2 * PAGE_SIZE, VmFlags::RW);
        assert!(!mmu.translate(a).unwrap().1.contains(VmFlags::WR));

        mmu.protect_range(a, 2 * PAGE_SIZE, VmFlags::empty());
        assert!(mmu.translate(a).is_none());
        assert!(mmu.translate(b).is_none());
    }

    #[test]
    fn unmap_range_returns_frames() {
        let platform = Arc::new(TestPlatform::new(1));
        let mmu = user_mmu(&platform);
        let start = VirtualAddress::new(0x2000);
        mmu.map_page(start, PhysicalAddress::new(0x40), VmFlags::RW).unwrap();
        mmu.map_page(start + 2 * PAGE_SIZE, PhysicalAddress::new(0x60), VmFlags::RW).unwrap();
        let frames = mmu.unmap_range(start, 4 * PAGE_SIZE);
        assert_eq!(frames, [PhysicalAddress::new(0x40), PhysicalAddress::new(0x60)]);
        assert!(!mmu.unmap_frame(start, PhysicalAddress::new(0x40)));
    }
}
