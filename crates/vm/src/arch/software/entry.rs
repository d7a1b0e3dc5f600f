//! Page table entry for software emulation.

use crate::PhysicalAddress;

use super::flags::PageFlags;

/// A single page table entry for software emulation.
///
/// The entry is laid out like an i386 PTE scaled down to 16-bit addresses:
/// - Bits 0-3: Flags
/// - Bits 4-15: Frame address (16-byte aligned)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
#[repr(transparent)]
pub struct PageEntry(u16);

impl PageEntry {
    const ADDRESS_MASK: u16 = 0xFFF0;
    const FLAGS_MASK: u16 = 0x000F;

    /// Creates a new page table entry.
    pub fn new(address: PhysicalAddress, flags: PageFlags) -> Self {
        debug_assert!(
            address.as_usize() & 0xF == 0,
            "physical address must be page-aligned (16-byte alignment)"
        );
        let addr_bits = address.as_usize() as u16 & Self::ADDRESS_MASK;
        Self(addr_bits | (flags.to_raw() as u16 & Self::FLAGS_MASK))
    }

    /// Returns the physical address stored in this entry, if present.
    pub fn address(self) -> Option<PhysicalAddress> {
        self.is_present()
            .then(|| PhysicalAddress::new((self.0 & Self::ADDRESS_MASK) as usize))
    }

    /// Returns the flags for this entry.
    pub fn flags(self) -> PageFlags {
        PageFlags::from_raw((self.0 & Self::FLAGS_MASK) as usize)
    }

    /// Sets the flags for this entry, preserving the address.
    pub fn set_flags(&mut self, flags: PageFlags) {
        self.0 = (self.0 & Self::ADDRESS_MASK) | (flags.to_raw() as u16 & Self::FLAGS_MASK);
    }

    /// Returns whether this entry is present (valid).
    pub fn is_present(self) -> bool {
        self.flags().is_present()
    }

    /// Clears this entry.
    pub fn clear(&mut self) {
        self.0 = 0;
    }
}
