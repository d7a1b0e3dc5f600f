//! Flag sets shared by allocation, mapping and fault APIs.

use bitflags::bitflags;

bitflags! {
    /// Protection, access and allocation flags.
    ///
    /// The same set describes a mapping's protection (`RD`, `WR`, `EXEC`, `KERN`), a
    /// fault's access (`RD` or `WR`, plus `KERN` for kernel-mode faults) and allocation
    /// behaviour (`WAIT`, `ZERO`).
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
    pub struct VmFlags: u32 {
        const RD = 1 << 0;
        const WR = 1 << 1;
        const EXEC = 1 << 2;
        /// Kernel-only mapping, or a fault taken in kernel mode.
        const KERN = 1 << 3;
        /// Block until the request can be satisfied.
        const WAIT = 1 << 4;
        /// Zero newly backed memory.
        const ZERO = 1 << 5;
        /// Changes through the mapping are visible to other mappings of the object.
        const SHARED = 1 << 6;
        /// Place the mapping exactly at the requested address.
        const FIXED = 1 << 7;
        /// Private copy-on-write mapping; a shadow object is inserted on first fault.
        const SHADOW = 1 << 8;

        const RW = Self::RD.bits() | Self::WR.bits();
        const PROT = Self::RD.bits() | Self::WR.bits() | Self::EXEC.bits() | Self::KERN.bits();
    }
}

impl VmFlags {
    /// The protection bits of this set.
    pub fn prot(self) -> Self {
        self & Self::PROT
    }

    /// Returns true if `self` grants every protection bit requested by `access`.
    ///
    /// `KERN` is not a permission: a kernel-only mapping refuses user accesses, and
    /// kernel accesses may touch any mapping.
    pub fn permits(self, access: Self) -> bool {
        if self.contains(Self::KERN) && !access.contains(Self::KERN) {
            return false;
        }
        let wanted = access & (Self::RD | Self::WR | Self::EXEC);
        self.contains(wanted)
    }
}

bitflags! {
    /// Capabilities advertised by a pager.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
    pub struct PagerFlags: u32 {
        /// The pager handles offsets with no page-hash node itself (zero-fill), so the
        /// generic pagein path must not call it for them.
        const PGHASH = 1 << 0;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn user_access_to_kernel_mapping_is_refused() {
        let kernel_rw = VmFlags::RW | VmFlags::KERN;
        assert!(!kernel_rw.permits(VmFlags::RD));
        assert!(kernel_rw.permits(VmFlags::RD | VmFlags::KERN));
    }

    #[test]
    fn write_needs_write_permission() {
        assert!(!VmFlags::RD.permits(VmFlags::WR));
        assert!(VmFlags::RW.permits(VmFlags::WR));
        assert!(VmFlags::RW.permits(VmFlags::WR | VmFlags::KERN));
    }

    #[test]
    fn prot_strips_behaviour_bits() {
        let flags = VmFlags::RW | VmFlags::WAIT | VmFlags::SHADOW;
        assert_eq!(flags.prot(), VmFlags::RW);
    }
}
