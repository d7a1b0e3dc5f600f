//! i386 page table entry flags.

use crate::VmFlags;

/// Low twelve bits of an i386 PDE/PTE.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct PageFlags(u32);

impl PageFlags {
    pub const PRESENT: u32 = 1 << 0;
    pub const WRITABLE: u32 = 1 << 1;
    pub const USER: u32 = 1 << 2;
    pub const WRITE_THROUGH: u32 = 1 << 3;
    pub const CACHE_DISABLE: u32 = 1 << 4;
    pub const ACCESSED: u32 = 1 << 5;
    pub const DIRTY: u32 = 1 << 6;
    pub const GLOBAL: u32 = 1 << 8;

    pub const fn empty() -> Self {
        Self(0)
    }

    pub const fn from_bits(bits: u32) -> Self {
        Self(bits)
    }

    pub const fn bits(self) -> u32 {
        self.0
    }

    /// Builds the entry flags for a mapping with the given protection.
    ///
    /// Without PAE there is no no-execute bit, so `EXEC` is implied by `RD`.
    pub fn from_prot(prot: VmFlags) -> Self {
        let mut bits = Self::PRESENT;
        if prot.contains(VmFlags::WR) {
            bits |= Self::WRITABLE;
        }
        if prot.contains(VmFlags::KERN) {
            bits |= Self::GLOBAL;
        } else {
            bits |= Self::USER;
        }
        Self(bits)
    }

    /// Converts the entry flags back into a protection.
    pub fn to_prot(self) -> VmFlags {
        if !self.is_present() {
            return VmFlags::empty();
        }
        let mut prot = VmFlags::RD | VmFlags::EXEC;
        if self.0 & Self::WRITABLE != 0 {
            prot |= VmFlags::WR;
        }
        if self.0 & Self::USER == 0 {
            prot |= VmFlags::KERN;
        }
        prot
    }

    pub fn is_present(self) -> bool {
        self.0 & Self::PRESENT != 0
    }

    pub fn is_writable(self) -> bool {
        self.0 & Self::WRITABLE != 0
    }

    pub fn is_user(self) -> bool {
        self.0 & Self::USER != 0
    }
}
