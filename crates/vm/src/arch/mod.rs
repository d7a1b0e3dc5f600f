//! Architecture-specific implementations for memory management.
//!
//! Selects either the i386 hardware backend or the software emulation backend. Both
//! export the same constants, `PageEntry`, `PageFlags` and `MmuContext`.

use crate::{PhysicalAddress, VmError};

// Use the i386 hardware implementation when targeting 32-bit x86 and not emulating.
#[cfg(all(target_arch = "x86", not(test), not(feature = "software-emulation")))]
mod i386;
#[cfg(all(target_arch = "x86", not(test), not(feature = "software-emulation")))]
pub use i386::*;

// Use software emulation when:
// - Running tests, OR
// - software-emulation feature is explicitly enabled, OR
// - building for a host that is not 32-bit x86
#[cfg(any(test, feature = "software-emulation", not(target_arch = "x86")))]
mod software;
#[cfg(any(test, feature = "software-emulation", not(target_arch = "x86")))]
pub use software::*;

/// Source of frames for page tables.
///
/// Backends that keep page tables in physical memory allocate them through this; the
/// software backend never calls it.
pub trait TableAllocator {
    /// Allocates a zeroed frame for a page table.
    fn alloc_table(&self) -> Result<PhysicalAddress, VmError>;

    /// Returns a page table frame.
    fn free_table(&self, table: PhysicalAddress);

    /// Returns a kernel pointer through which the table frame can be accessed.
    fn table_ptr(&self, table: PhysicalAddress) -> *mut u8;
}
