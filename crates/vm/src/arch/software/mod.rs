//! Software emulation backend for testing and development.
//!
//! The software-emulated architecture is a "scale model" of 32-bit x86 paging:
//! - 16-bit addresses (vs 32-bit on i386)
//! - 2 levels of page tables, like i386 without PAE
//! - 6-bit indexes (64 entries per table, vs 10-bit/1024 entries on i386)
//! - 4-bit page offset (16-byte pages, vs 12-bit/4KB on i386)
//!
//! The virtual layout mirrors i386 as well: the kernel owns the top quarter of the
//! address space and the last directory slot is reserved for the recursive page-table
//! window.

mod entry;
mod flags;
mod table;

pub use entry::PageEntry;
pub use flags::PageFlags;
pub use table::{MmuContext, PageTable};

use alloc::boxed::Box;
use core::cell::UnsafeCell;

use crate::VirtualAddress;

/// Maximum number of bits in a physical address for software emulation.
pub const MAX_PHYSICAL_BITS: usize = 16;

/// Maximum number of bits in a virtual address for software emulation.
pub const MAX_VIRTUAL_BITS: usize = 16;

/// log2 of the page size.
pub const PAGE_SHIFT: usize = 4;

/// Page size in bytes (16 bytes = 2^4).
pub const PAGE_SIZE: usize = 1 << PAGE_SHIFT;

/// Number of index bits per table level.
pub const ENTRY_BITS: usize = 6;

/// Number of entries in a directory or a page table.
pub const ENTRY_COUNT: usize = 1 << ENTRY_BITS;

/// Bytes of virtual memory covered by one directory entry.
pub const PDE_SIZE: usize = 1 << (PAGE_SHIFT + ENTRY_BITS);

/// Start of the kernel half of every address space.
pub const KERNEL_VM_START: usize = 0xC000;

/// Last byte of the kernel half.
pub const KERNEL_VM_END: usize = 0xFFFF;

/// The first page is never mapped so that null dereferences fault.
pub const USER_VM_START: usize = PAGE_SIZE;

/// Last byte of user space.
pub const USER_VM_END: usize = KERNEL_VM_START - 1;

/// Base of the recursive page-table window (the last directory slot).
pub const PT_ADDR: usize = KERNEL_VM_END - PDE_SIZE + 1;

/// End (exclusive) of the range the kernel virtual memory allocator may manage.
pub const VMEM_END: usize = PT_ADDR;

/// Amount of low physical memory reachable through the boot-time linear mapping at
/// [`KERNEL_VM_START`].
pub const EARLY_MAP_LIMIT: usize = 0x1000;

/// Returns the table index for a given virtual address at the specified level.
///
/// - Level 0: Bits 4-9 (page table)
/// - Level 1: Bits 10-15 (page directory)
#[inline]
pub const fn page_index(address: usize, level: usize) -> usize {
    assert!(level < 2, "level out of range for software emulation (0-1)");
    (address >> (PAGE_SHIFT + level * ENTRY_BITS)) & (ENTRY_COUNT - 1)
}

/// Validates a physical address for software emulation.
#[inline]
pub const fn validate_physical(addr: usize) -> bool {
    addr <= 0xFFFF
}

/// Validates a virtual address for software emulation.
#[inline]
pub const fn validate_virtual(addr: usize) -> bool {
    addr <= 0xFFFF
}

/// Invalidates the local translation cache for one page.
///
/// The emulated MMU walks its tables on every access, so there is nothing to flush.
#[inline]
pub fn invalidate_local(_addr: VirtualAddress) {}

/// Emulated physical memory.
///
/// Frames handed out by the physical allocator are backed by this buffer, so page
/// contents (zero-fill, copy-on-write copies, pagein data) are real bytes that tests can
/// inspect.
pub struct EmulatedMemory {
    memory: Box<[UnsafeCell<u8>]>,
}

// SAFETY: concurrent access to the same frame is serialized by the page busy/pin
// protocol and the owning object's lock, exactly as it is for real RAM.
unsafe impl Sync for EmulatedMemory {}
unsafe impl Send for EmulatedMemory {}

impl EmulatedMemory {
    /// Creates a new zeroed emulated memory region of the specified size.
    pub fn new(size: usize) -> Self {
        assert!(
            validate_physical(size.saturating_sub(1)),
            "emulated memory exceeds the physical address width"
        );
        Self {
            memory: (0..size).map(|_| UnsafeCell::new(0)).collect(),
        }
    }

    /// Translates a physical address to a pointer into the buffer.
    pub fn translate(&self, phys: usize) -> *mut u8 {
        assert!(phys < self.memory.len(), "physical address out of bounds");
        self.memory[phys].get()
    }

    /// Returns the size of the emulated memory region.
    pub fn size(&self) -> usize {
        self.memory.len()
    }
}
