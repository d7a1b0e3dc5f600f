//! Kernel virtual memory allocator.
//!
//! Hands out page-granular ranges of kernel address space. Free ranges are kept in an
//! address-ordered map (for coalescing) and in size-class sets (for allocation); a
//! range of `n` pages sits in class `floor(log2 n)`. Allocation takes the lowest
//! fitting range of the smallest class that can hold the request and carves the
//! request off its end.

use alloc::collections::{BTreeMap, BTreeSet};
use alloc::sync::Arc;
use alloc::vec::Vec;

use crate::arch::{MAX_VIRTUAL_BITS, PAGE_SHIFT, PAGE_SIZE, VMEM_END};
use crate::{HumanSize, MemoryType, Mmu, PhysicalAllocator, Pressure, VirtualAddress, VmError, VmFlags};

/// Number of size classes.
const FREELISTS: usize = MAX_VIRTUAL_BITS - PAGE_SHIFT;

fn class(pages: usize) -> usize {
    (pages.ilog2() as usize).min(FREELISTS - 1)
}

struct VmemState {
    /// Free ranges: start address to length in pages.
    regions: BTreeMap<usize, usize>,
    lists: Vec<BTreeSet<usize>>,
}

impl VmemState {
    fn insert(&mut self, start: usize, pages: usize) {
        self.regions.insert(start, pages);
        self.lists[class(pages)].insert(start);
    }

    fn remove(&mut self, start: usize) -> usize {
        let Some(pages) = self.regions.remove(&start) else {
            panic!("vmem: no free region at {start:#x}");
        };
        self.lists[class(pages)].remove(&start);
        pages
    }

    fn take(&mut self, pages: usize) -> Option<usize> {
        let start = (class(pages)..FREELISTS).find_map(|c| {
            self.lists[c]
                .iter()
                .copied()
                .find(|start| self.regions[start] >= pages)
        })?;
        let available = self.remove(start);
        let rest = available - pages;
        if rest > 0 {
            self.insert(start, rest);
        }
        Some(start + (rest << PAGE_SHIFT))
    }
}

/// The kernel virtual memory allocator.
pub struct Vmem {
    start: usize,
    end: usize,
    state: spin::Mutex<VmemState>,
    pressure: Arc<Pressure>,
    phys: Arc<PhysicalAllocator>,
    mmu: Arc<Mmu>,
}

impl Vmem {
    /// Manages `[start, end)`, which must stay below the page-table window.
    pub(crate) fn new(start: VirtualAddress, end: VirtualAddress, mmu: Arc<Mmu>) -> Self {
        let (start, end) = (start.as_usize(), end.as_usize());
        assert!(
            start < end && end <= VMEM_END,
            "vmem range {start:#x}..{end:#x} overlaps the page-table window"
        );
        assert!(
            start % PAGE_SIZE == 0 && end % PAGE_SIZE == 0,
            "vmem range must be page aligned"
        );
        let phys = mmu.phys().clone();
        let pressure = phys.pressure().clone();

        let mut state = VmemState {
            regions: BTreeMap::new(),
            lists: (0..FREELISTS).map(|_| BTreeSet::new()).collect(),
        };
        state.insert(start, (end - start) >> PAGE_SHIFT);
        pressure.init(MemoryType::Kern, end - start, end - start);
        log::info!("vmem: {:#x}..{:#x} ({})", start, end, HumanSize(end - start));

        Self {
            start,
            end,
            state: spin::Mutex::new(state),
            pressure,
            phys,
            mmu,
        }
    }

    fn check(&self, addr: usize, size: usize) {
        assert!(size > 0 && size % PAGE_SIZE == 0, "vmem: size {size:#x} is not a page multiple");
        assert_eq!(addr % PAGE_SIZE, 0, "vmem: unaligned address {addr:#x}");
        assert!(
            addr >= self.start && addr.checked_add(size).is_some_and(|end| end <= self.end),
            "vmem: range {addr:#x}+{size:#x} outside {:#x}..{:#x}",
            self.start,
            self.end
        );
    }

    /// Reserves `size` bytes of address space.
    pub fn alloc(&self, size: usize, flags: VmFlags) -> Result<VirtualAddress, VmError> {
        assert!(size > 0 && size % PAGE_SIZE == 0, "vmem: size {size:#x} is not a page multiple");
        let pages = size >> PAGE_SHIFT;
        loop {
            let ticket = self.pressure.free_ticket(MemoryType::Kern);
            if let Some(start) = self.state.lock().take(pages) {
                self.pressure.add(MemoryType::Kern, -(size as isize));
                #[cfg(feature = "detailed-logging")]
                log::trace!("vmem: alloc {:#x}+{:#x}", start, size);
                return Ok(VirtualAddress::new(start));
            }
            if !flags.contains(VmFlags::WAIT) {
                return Err(VmError::OutOfMemory);
            }
            if self.pressure.mem_wait_p(MemoryType::Kern, size) {
                self.pressure.mem_wait(MemoryType::Kern, size)?;
            } else {
                self.pressure.mem_wait_free(MemoryType::Kern, ticket)?;
            }
        }
    }

    /// Returns a range to the allocator.
    ///
    /// # Panics
    ///
    /// Panics if any part of the range is already free.
    pub fn free(&self, addr: VirtualAddress, size: usize) {
        let (mut start, mut pages) = (addr.as_usize(), size >> PAGE_SHIFT);
        self.check(start, size);
        let end = start + size;

        let mut state = self.state.lock();
        let before = state
            .regions
            .range(..=start)
            .next_back()
            .map(|(&s, &n)| (s, n));
        let after = state.regions.range(start..).next().map(|(&s, &n)| (s, n));
        if before.is_some_and(|(s, n)| s + (n << PAGE_SHIFT) > start) || after.is_some_and(|(s, _)| s < end) {
            panic!("vmem: double free of {start:#x}+{size:#x}");
        }

        if let Some((s, n)) = before.filter(|&(s, n)| s + (n << PAGE_SHIFT) == start) {
            state.remove(s);
            start = s;
            pages += n;
        }
        if let Some((s, n)) = after.filter(|&(s, _)| s == end) {
            state.remove(s);
            pages += n;
        }
        state.insert(start, pages);
        drop(state);

        self.pressure.add(MemoryType::Kern, size as isize);
        #[cfg(feature = "detailed-logging")]
        log::trace!("vmem: free {:?}+{:#x}", addr, size);
    }

    /// Backs a reserved range with physical memory. On failure nothing stays backed.
    pub fn back(&self, addr: VirtualAddress, size: usize, flags: VmFlags) -> Result<(), VmError> {
        self.check(addr.as_usize(), size);
        let alloc_flags = flags & (VmFlags::WAIT | VmFlags::ZERO);
        for off in (0..size).step_by(PAGE_SIZE) {
            let phys = self.phys.alloc_phys(alloc_flags);
            let result = match phys.is_err() {
                true => Err(VmError::OutOfMemory),
                false => self
                    .mmu
                    .map_page(addr + off, phys, VmFlags::RW | VmFlags::KERN),
            };
            if let Err(err) = result {
                if !phys.is_err() {
                    self.phys.free_phys(phys);
                }
                if off > 0 {
                    self.unback(addr, off);
                }
                log::warn!("vmem: backing {:?}+{:#x} failed: {err}", addr, size);
                return Err(err);
            }
        }
        Ok(())
    }

    /// Unmaps a range and frees the frames behind it.
    pub fn unback(&self, addr: VirtualAddress, size: usize) {
        self.check(addr.as_usize(), size);
        for phys in self.mmu.unmap_range(addr, size) {
            self.phys.free_phys(phys);
        }
    }

    /// Reserves a range and backs it.
    pub fn alloc_backed(&self, size: usize, flags: VmFlags) -> Result<VirtualAddress, VmError> {
        let addr = self.alloc(size, flags)?;
        if let Err(err) = self.back(addr, size, flags) {
            self.free(addr, size);
            return Err(err);
        }
        Ok(addr)
    }

    pub fn free_backed(&self, addr: VirtualAddress, size: usize) {
        self.unback(addr, size);
        self.free(addr, size);
    }

    /// Bytes not currently reserved.
    pub fn free_bytes(&self) -> usize {
        self.state.lock().regions.values().sum::<usize>() << PAGE_SHIFT
    }

    /// Free ranges in address order, as (start, size in bytes).
    pub fn free_ranges(&self) -> Vec<(VirtualAddress, usize)> {
        self.state
            .lock()
            .regions
            .iter()
            .map(|(&start, &pages)| (VirtualAddress::new(start), pages << PAGE_SHIFT))
            .collect()
    }

    pub fn start(&self) -> VirtualAddress {
        VirtualAddress::new(self.start)
    }

    pub fn end(&self) -> VirtualAddress {
        VirtualAddress::new(self.end)
    }
}
