//! 32-bit x86 (i386, non-PAE) hardware backend.
//!
//! Two-level paging with 4KB pages. The kernel owns the top gigabyte of every address
//! space and the last directory slot maps the directory onto itself, which makes every
//! page table of the active context visible at [`PT_ADDR`].

mod entry;
mod flags;
mod table;

pub use entry::PageEntry;
pub use flags::PageFlags;
pub use table::MmuContext;

use core::arch::asm;

use crate::VirtualAddress;

/// Maximum number of bits in a physical address (no PAE).
pub const MAX_PHYSICAL_BITS: usize = 32;

/// Maximum number of bits in a virtual address.
pub const MAX_VIRTUAL_BITS: usize = 32;

/// log2 of the page size.
pub const PAGE_SHIFT: usize = 12;

/// Page size in bytes (4 KiB).
pub const PAGE_SIZE: usize = 1 << PAGE_SHIFT;

/// Number of index bits per table level.
pub const ENTRY_BITS: usize = 10;

/// Number of entries in a directory or a page table.
pub const ENTRY_COUNT: usize = 1 << ENTRY_BITS;

/// Bytes of virtual memory covered by one directory entry (4 MiB).
pub const PDE_SIZE: usize = 1 << (PAGE_SHIFT + ENTRY_BITS);

/// Start of the kernel half of every address space.
pub const KERNEL_VM_START: usize = 0xC000_0000;

/// Last byte of the kernel half.
pub const KERNEL_VM_END: usize = 0xFFFF_FFFF;

/// The first page is never mapped so that null dereferences fault.
pub const USER_VM_START: usize = PAGE_SIZE;

/// Last byte of user space.
pub const USER_VM_END: usize = KERNEL_VM_START - 1;

/// Base of the recursive page-table window (the last directory slot).
pub const PT_ADDR: usize = KERNEL_VM_END - PDE_SIZE + 1;

/// End (exclusive) of the range the kernel virtual memory allocator may manage.
pub const VMEM_END: usize = PT_ADDR;

/// Amount of low physical memory covered by the boot page tables at
/// [`KERNEL_VM_START`].
pub const EARLY_MAP_LIMIT: usize = PDE_SIZE;

/// Returns the table index for a given virtual address at the specified level.
#[inline]
pub const fn page_index(address: usize, level: usize) -> usize {
    assert!(level < 2, "level out of range for i386 (0-1)");
    (address >> (PAGE_SHIFT + level * ENTRY_BITS)) & (ENTRY_COUNT - 1)
}

/// Every 32-bit value is a valid physical address without PAE.
#[inline]
pub const fn validate_physical(_addr: usize) -> bool {
    true
}

/// Every 32-bit value is a valid virtual address.
#[inline]
pub const fn validate_virtual(_addr: usize) -> bool {
    true
}

/// Invalidates the local TLB entry for one page.
#[inline]
pub fn invalidate_local(addr: VirtualAddress) {
    // SAFETY: invlpg only drops a cached translation.
    unsafe {
        asm!("invlpg [{}]", in(reg) addr.as_usize(), options(nostack, preserves_flags));
    }
}

/// Loads a page directory into CR3.
///
/// # Safety
///
/// The directory must map the currently executing code, stack and kernel data.
#[inline]
pub unsafe fn load_directory(directory: usize) {
    // SAFETY: guaranteed by the caller.
    unsafe {
        asm!("mov cr3, {}", in(reg) directory, options(nostack, preserves_flags));
    }
}
