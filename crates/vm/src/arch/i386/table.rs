//! i386 page directories.

use crate::arch::TableAllocator;
use crate::{PhysicalAddress, VirtualAddress, VmError};

use super::{ENTRY_COUNT, KERNEL_VM_START, PT_ADDR, entry::PageEntry, flags::PageFlags, page_index};

/// First directory slot of the kernel half.
const KERNEL_SLOT: usize = KERNEL_VM_START >> 22;

/// Directory slot holding the recursive mapping.
const RECURSIVE_SLOT: usize = PT_ADDR >> 22;

/// A page directory living in a physical frame.
///
/// Kernel page tables are allocated once when the kernel context is built and every user
/// directory copies those slots, so kernel mappings are shared by construction.
pub struct MmuContext {
    directory: PhysicalAddress,
    lock: spin::Mutex<()>,
}

fn entries(tables: &dyn TableAllocator, table: PhysicalAddress) -> *mut PageEntry {
    tables.table_ptr(table).cast()
}

unsafe fn read(table: *mut PageEntry, index: usize) -> PageEntry {
    debug_assert!(index < ENTRY_COUNT);
    // SAFETY: table points at a mapped frame of ENTRY_COUNT entries.
    unsafe { table.add(index).read_volatile() }
}

unsafe fn write(table: *mut PageEntry, index: usize, entry: PageEntry) {
    debug_assert!(index < ENTRY_COUNT);
    // SAFETY: table points at a mapped frame of ENTRY_COUNT entries.
    unsafe { table.add(index).write_volatile(entry) }
}

fn table_flags() -> PageFlags {
    PageFlags::from_bits(PageFlags::PRESENT | PageFlags::WRITABLE | PageFlags::USER)
}

impl MmuContext {
    fn with_directory(tables: &dyn TableAllocator) -> Result<Self, VmError> {
        let directory = tables.alloc_table()?;
        let dir = entries(tables, directory);
        // SAFETY: freshly allocated (zeroed) table frame.
        unsafe {
            write(dir, RECURSIVE_SLOT, PageEntry::new(directory, PageFlags::from_bits(
                PageFlags::PRESENT | PageFlags::WRITABLE,
            )));
        }
        Ok(Self {
            directory,
            lock: spin::Mutex::new(()),
        })
    }

    /// Creates the kernel context and preallocates every kernel page table.
    pub fn new_kernel(tables: &dyn TableAllocator) -> Result<Self, VmError> {
        let ctx = Self::with_directory(tables)?;
        let dir = entries(tables, ctx.directory);
        for slot in KERNEL_SLOT..RECURSIVE_SLOT {
            let table = tables.alloc_table()?;
            // SAFETY: the directory frame is owned by this context.
            unsafe {
                write(dir, slot, PageEntry::new(table, PageFlags::from_bits(
                    PageFlags::PRESENT | PageFlags::WRITABLE,
                )));
            }
        }
        Ok(ctx)
    }

    /// Creates a user context sharing the kernel's page tables.
    pub fn new_user(kernel: &MmuContext, tables: &dyn TableAllocator) -> Result<Self, VmError> {
        let ctx = Self::with_directory(tables)?;
        let src = entries(tables, kernel.directory);
        let dst = entries(tables, ctx.directory);
        for slot in KERNEL_SLOT..RECURSIVE_SLOT {
            // SAFETY: both directories are valid table frames.
            unsafe { write(dst, slot, read(src, slot)) };
        }
        Ok(ctx)
    }

    fn leaf(&self, virt: VirtualAddress, tables: &dyn TableAllocator, create: bool) -> Result<Option<*mut PageEntry>, VmError> {
        let dir = entries(tables, self.directory);
        let slot = page_index(virt.as_usize(), 1);
        // SAFETY: the directory frame is owned by this context.
        let pde = unsafe { read(dir, slot) };
        let table = match pde.address() {
            Some(table) => table,
            None if create => {
                let table = tables.alloc_table()?;
                // SAFETY: as above.
                unsafe { write(dir, slot, PageEntry::new(table, table_flags())) };
                table
            }
            None => return Ok(None),
        };
        Ok(Some(entries(tables, table)))
    }

    /// Maps one page, returning the frame that was previously mapped there (if any).
    pub fn map(
        &self,
        virt: VirtualAddress,
        phys: PhysicalAddress,
        flags: PageFlags,
        tables: &dyn TableAllocator,
    ) -> Result<Option<PhysicalAddress>, VmError> {
        assert!(
            virt.as_usize() < PT_ADDR,
            "{virt:?} lies in the recursive page-table window"
        );
        let _guard = self.lock.lock();
        let Some(table) = self.leaf(virt, tables, true)? else {
            return Err(VmError::OutOfMemory);
        };
        let index = page_index(virt.as_usize(), 0);
        // SAFETY: table is a live page table of this context.
        unsafe {
            let old = read(table, index).address();
            write(table, index, PageEntry::new(phys, flags));
            Ok(old)
        }
    }

    /// Removes the mapping of one page, returning the frame it pointed to.
    pub fn unmap(&self, virt: VirtualAddress, tables: &dyn TableAllocator) -> Option<PhysicalAddress> {
        let _guard = self.lock.lock();
        let table = self.leaf(virt, tables, false).ok().flatten()?;
        let index = page_index(virt.as_usize(), 0);
        // SAFETY: table is a live page table of this context.
        unsafe {
            let old = read(table, index).address();
            write(table, index, PageEntry::default());
            old
        }
    }

    /// Replaces the flags of a present mapping. Returns false if nothing is mapped.
    pub fn protect(&self, virt: VirtualAddress, flags: PageFlags, tables: &dyn TableAllocator) -> bool {
        let _guard = self.lock.lock();
        let Some(table) = self.leaf(virt, tables, false).ok().flatten() else {
            return false;
        };
        let index = page_index(virt.as_usize(), 0);
        // SAFETY: table is a live page table of this context.
        unsafe {
            let mut entry = read(table, index);
            if !entry.is_present() {
                return false;
            }
            entry.set_flags(flags);
            write(table, index, entry);
        }
        true
    }

    /// Looks up the frame and flags backing a virtual address.
    pub fn translate(
        &self,
        virt: VirtualAddress,
        tables: &dyn TableAllocator,
    ) -> Option<(PhysicalAddress, PageFlags)> {
        let _guard = self.lock.lock();
        let table = self.leaf(virt, tables, false).ok().flatten()?;
        // SAFETY: table is a live page table of this context.
        let entry = unsafe { read(table, page_index(virt.as_usize(), 0)) };
        entry.address().map(|phys| (phys, entry.flags()))
    }

    /// Frees the user page tables and the directory of a user context.
    pub fn destroy(&self, tables: &dyn TableAllocator) {
        let _guard = self.lock.lock();
        let dir = entries(tables, self.directory);
        for slot in 0..KERNEL_SLOT {
            // SAFETY: the directory frame is owned by this context.
            let pde = unsafe { read(dir, slot) };
            if let Some(table) = pde.address() {
                tables.free_table(table);
                // SAFETY: as above.
                unsafe { write(dir, slot, PageEntry::default()) };
            }
        }
        tables.free_table(self.directory);
    }

    /// Loads this context on the current CPU.
    ///
    /// # Safety
    ///
    /// The context must map the code and data the caller continues to use.
    pub unsafe fn activate(&self, _tables: &dyn TableAllocator) {
        // SAFETY: guaranteed by the caller.
        unsafe { super::load_directory(self.directory.as_usize()) };
    }
}
