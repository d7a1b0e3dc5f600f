//! Page table entry flags for software emulation.

use crate::VmFlags;

/// Page table entry flags for software emulation.
///
/// Flags are stored as raw bits with the same meaning as the low bits of an i386 PTE,
/// plus a no-execute bit the emulator enforces on instruction fetches.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct PageFlags(usize);

impl PageFlags {
    const PRESENT: usize = 1 << 0;
    const WRITABLE: usize = 1 << 1;
    const USER: usize = 1 << 2;
    const NO_EXECUTE: usize = 1 << 3;

    /// Creates empty page flags (page not present).
    pub const fn empty() -> Self {
        Self(0)
    }

    /// Creates page flags from a raw value.
    pub const fn from_raw(raw: usize) -> Self {
        Self(raw)
    }

    /// Returns the raw value of these flags.
    pub const fn to_raw(self) -> usize {
        self.0
    }

    /// Builds the entry flags for a mapping with the given protection.
    pub fn from_prot(prot: VmFlags) -> Self {
        let mut flags = Self(Self::PRESENT);
        if prot.contains(VmFlags::WR) {
            flags.0 |= Self::WRITABLE;
        }
        if !prot.contains(VmFlags::KERN) {
            flags.0 |= Self::USER;
        }
        if !prot.contains(VmFlags::EXEC) {
            flags.0 |= Self::NO_EXECUTE;
        }
        flags
    }

    /// Converts the entry flags back into a protection.
    pub fn to_prot(self) -> VmFlags {
        let mut prot = VmFlags::empty();
        if self.is_present() {
            prot |= VmFlags::RD;
        }
        if self.is_writable() {
            prot |= VmFlags::WR;
        }
        if !self.is_user() {
            prot |= VmFlags::KERN;
        }
        if self.is_present() && !self.is_no_execute() {
            prot |= VmFlags::EXEC;
        }
        prot
    }

    /// Returns whether the present bit is set.
    pub fn is_present(self) -> bool {
        (self.0 & Self::PRESENT) != 0
    }

    /// Returns whether the writable bit is set.
    pub fn is_writable(self) -> bool {
        (self.0 & Self::WRITABLE) != 0
    }

    /// Returns whether the user-accessible bit is set.
    pub fn is_user(self) -> bool {
        (self.0 & Self::USER) != 0
    }

    /// Returns whether the no-execute bit is set.
    pub fn is_no_execute(self) -> bool {
        (self.0 & Self::NO_EXECUTE) != 0
    }
}
