//! Page tables and MMU contexts for software emulation.

use alloc::boxed::Box;
use alloc::vec::Vec;

use crate::arch::TableAllocator;
use crate::{PhysicalAddress, VirtualAddress, VmError};

use super::{ENTRY_COUNT, PT_ADDR, entry::PageEntry, flags::PageFlags, page_index};

/// A second-level page table for software emulation.
///
/// Tables live in host memory rather than in emulated frames; the MMU context owns
/// them and walks them directly.
pub struct PageTable {
    entries: Box<[PageEntry; ENTRY_COUNT]>,
}

impl PageTable {
    /// Creates a new, empty page table.
    pub fn new() -> Self {
        Self {
            entries: Box::new([PageEntry::default(); ENTRY_COUNT]),
        }
    }

    /// Returns the entry at the given index.
    pub fn entry(&self, index: usize) -> PageEntry {
        self.entries[index]
    }

    /// Returns a mutable reference to the entry at the given index.
    pub fn entry_mut(&mut self, index: usize) -> &mut PageEntry {
        &mut self.entries[index]
    }

    fn is_empty(&self) -> bool {
        self.entries.iter().all(|entry| !entry.is_present())
    }
}

impl Default for PageTable {
    fn default() -> Self {
        Self::new()
    }
}

/// The per-address-space translation state: a directory of lazily created tables.
///
/// The last directory slot stands in for the recursive page-table window and can never
/// hold a mapping.
pub struct MmuContext {
    directory: spin::Mutex<Vec<Option<PageTable>>>,
}

impl MmuContext {
    fn empty() -> Self {
        Self {
            directory: spin::Mutex::new((0..ENTRY_COUNT).map(|_| None).collect()),
        }
    }

    /// Creates the kernel context.
    pub fn new_kernel(_tables: &dyn TableAllocator) -> Result<Self, VmError> {
        Ok(Self::empty())
    }

    /// Creates a user context.
    ///
    /// The emulator resolves kernel addresses against the kernel context directly, so
    /// nothing is shared here.
    pub fn new_user(_kernel: &MmuContext, _tables: &dyn TableAllocator) -> Result<Self, VmError> {
        Ok(Self::empty())
    }

    /// Maps one page, returning the frame that was previously mapped there (if any).
    pub fn map(
        &self,
        virt: VirtualAddress,
        phys: PhysicalAddress,
        flags: PageFlags,
        _tables: &dyn TableAllocator,
    ) -> Result<Option<PhysicalAddress>, VmError> {
        assert!(
            virt.as_usize() < PT_ADDR,
            "{virt:?} lies in the recursive page-table window"
        );
        let mut directory = self.directory.lock();
        let table = directory[page_index(virt.as_usize(), 1)].get_or_insert_with(PageTable::new);
        let entry = table.entry_mut(page_index(virt.as_usize(), 0));
        let old = entry.address();
        *entry = PageEntry::new(phys, flags);
        Ok(old)
    }

    /// Removes the mapping of one page, returning the frame it pointed to.
    pub fn unmap(&self, virt: VirtualAddress, _tables: &dyn TableAllocator) -> Option<PhysicalAddress> {
        let mut directory = self.directory.lock();
        let slot = &mut directory[page_index(virt.as_usize(), 1)];
        let table = slot.as_mut()?;
        let entry = table.entry_mut(page_index(virt.as_usize(), 0));
        let old = entry.address();
        entry.clear();
        if table.is_empty() {
            *slot = None;
        }
        old
    }

    /// Replaces the flags of a present mapping. Returns false if nothing is mapped.
    pub fn protect(&self, virt: VirtualAddress, flags: PageFlags, _tables: &dyn TableAllocator) -> bool {
        let mut directory = self.directory.lock();
        let Some(table) = directory[page_index(virt.as_usize(), 1)].as_mut() else {
            return false;
        };
        let entry = table.entry_mut(page_index(virt.as_usize(), 0));
        if !entry.is_present() {
            return false;
        }
        entry.set_flags(flags);
        true
    }

    /// Looks up the frame and flags backing a virtual address.
    pub fn translate(
        &self,
        virt: VirtualAddress,
        _tables: &dyn TableAllocator,
    ) -> Option<(PhysicalAddress, PageFlags)> {
        let directory = self.directory.lock();
        let table = directory[page_index(virt.as_usize(), 1)].as_ref()?;
        let entry = table.entry(page_index(virt.as_usize(), 0));
        entry.address().map(|phys| (phys, entry.flags()))
    }

    /// Releases every page table owned by this context.
    pub fn destroy(&self, _tables: &dyn TableAllocator) {
        self.directory.lock().iter_mut().for_each(|slot| *slot = None);
    }

    /// Loads this context on the current CPU.
    ///
    /// # Safety
    ///
    /// The context must map the code and data the caller continues to use. The emulator
    /// has no hardware state, so this is always sound here.
    pub unsafe fn activate(&self, _tables: &dyn TableAllocator) {}
}

#[cfg(test)]
mod tests {
    use super::*;

    struct NoTables;

    impl TableAllocator for NoTables {
        fn alloc_table(&self) -> Result<PhysicalAddress, VmError> {
            Err(VmError::OutOfMemory)
        }

        fn free_table(&self, _table: PhysicalAddress) {}

        fn table_ptr(&self, _table: PhysicalAddress) -> *mut u8 {
            core::ptr::null_mut()
        }
    }

    fn rw() -> PageFlags {
        PageFlags::from_prot(crate::VmFlags::RD | crate::VmFlags::WR)
    }

    #[test]
    fn maps_and_translates() {
        let ctx = MmuContext::new_kernel(&NoTables).unwrap();
        let virt = VirtualAddress::new(0x1230);
        assert_eq!(ctx.map(virt, PhysicalAddress::new(0x40), rw(), &NoTables), Ok(None));

        let (phys, flags) = ctx.translate(virt, &NoTables).unwrap();
        assert_eq!(phys, PhysicalAddress::new(0x40));
        assert!(flags.is_writable());
        assert!(flags.is_user());
        assert!(ctx.translate(VirtualAddress::new(0x1240), &NoTables).is_none());
    }

    #[test]
    fn remap_reports_previous_frame() {
        let ctx = MmuContext::new_kernel(&NoTables).unwrap();
        let virt = VirtualAddress::new(0x0100);
        ctx.map(virt, PhysicalAddress::new(0x40), rw(), &NoTables).unwrap();
        let old = ctx.map(virt, PhysicalAddress::new(0x80), rw(), &NoTables).unwrap();
        assert_eq!(old, Some(PhysicalAddress::new(0x40)));
    }

    #[test]
    fn unmap_and_protect() {
        let ctx = MmuContext::new_kernel(&NoTables).unwrap();
        let virt = VirtualAddress::new(0x2000);
        ctx.map(virt, PhysicalAddress::new(0x40), rw(), &NoTables).unwrap();

        let ro = PageFlags::from_prot(crate::VmFlags::RD);
        assert!(ctx.protect(virt, ro, &NoTables));
        assert!(!ctx.translate(virt, &NoTables).unwrap().1.is_writable());

        assert_eq!(ctx.unmap(virt, &NoTables), Some(PhysicalAddress::new(0x40)));
        assert_eq!(ctx.unmap(virt, &NoTables), None);
        assert!(!ctx.protect(virt, ro, &NoTables));
    }

    #[test]
    #[should_panic(expected = "recursive page-table window")]
    fn refuses_recursive_window() {
        let ctx = MmuContext::new_kernel(&NoTables).unwrap();
        let _ = ctx.map(VirtualAddress::new(PT_ADDR), PhysicalAddress::new(0), rw(), &NoTables);
    }
}
