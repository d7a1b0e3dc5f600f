//! i386 page directory / page table entry.

use crate::PhysicalAddress;

use super::flags::PageFlags;

/// A 32-bit PDE or PTE: frame address in bits 12-31, flags in bits 0-11.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
#[repr(transparent)]
pub struct PageEntry(u32);

impl PageEntry {
    const ADDRESS_MASK: u32 = 0xFFFF_F000;
    const FLAGS_MASK: u32 = 0x0000_0FFF;

    /// Creates a new entry. The address must be page aligned.
    pub fn new(address: PhysicalAddress, flags: PageFlags) -> Self {
        debug_assert!(
            address.as_usize() & 0xFFF == 0,
            "physical address must be page-aligned"
        );
        Self((address.as_usize() as u32 & Self::ADDRESS_MASK) | (flags.bits() & Self::FLAGS_MASK))
    }

    /// Returns the frame this entry points at, if present.
    pub fn address(self) -> Option<PhysicalAddress> {
        self.is_present()
            .then(|| PhysicalAddress::new((self.0 & Self::ADDRESS_MASK) as usize))
    }

    /// Returns the flag bits.
    pub fn flags(self) -> PageFlags {
        PageFlags::from_bits(self.0 & Self::FLAGS_MASK)
    }

    /// Replaces the flag bits, keeping the address.
    pub fn set_flags(&mut self, flags: PageFlags) {
        self.0 = (self.0 & Self::ADDRESS_MASK) | (flags.bits() & Self::FLAGS_MASK);
    }

    pub fn is_present(self) -> bool {
        self.flags().is_present()
    }

    pub fn clear(&mut self) {
        self.0 = 0;
    }
}
