//! Address types for physical and virtual memory, and access to physical memory contents.

use core::fmt;
use core::ops::{Add, Sub};

use crate::{FrameNumber, PageNumber, arch};

#[cfg(any(test, feature = "software-emulation"))]
use crate::arch::EmulatedMemory;

/// Gives the kernel access to the contents of physical frames.
///
/// - Hardware: frames are reached through a linear kernel mapping at a fixed offset.
/// - Emulated: frames live in a host buffer (testing mode).
///
/// The translator is owned by the physical allocator; there is no global instance.
pub enum AddressTranslator {
    /// Hardware translation using a linear-map offset.
    Hardware { direct_map_offset: usize },
    /// Emulated translation using a simulated memory region.
    #[cfg(any(test, feature = "software-emulation"))]
    Emulated(EmulatedMemory),
}

impl AddressTranslator {
    /// Creates a new hardware translator with the given linear-map offset.
    pub const fn hardware(direct_map_offset: usize) -> Self {
        Self::Hardware { direct_map_offset }
    }

    /// Creates a new emulated translator with the given memory size.
    #[cfg(any(test, feature = "software-emulation"))]
    pub fn emulated(size: usize) -> Self {
        Self::Emulated(EmulatedMemory::new(size))
    }

    /// Translates a physical address to a kernel pointer.
    pub fn phys_to_ptr(&self, phys: PhysicalAddress) -> *mut u8 {
        match self {
            Self::Hardware { direct_map_offset } => {
                phys.as_usize().wrapping_add(*direct_map_offset) as *mut u8
            }
            #[cfg(any(test, feature = "software-emulation"))]
            Self::Emulated(mem) => mem.translate(phys.as_usize()),
        }
    }

    /// Copies bytes out of physical memory.
    pub fn read(&self, phys: PhysicalAddress, buf: &mut [u8]) {
        if buf.is_empty() {
            return;
        }
        self.assert_backed(phys, buf.len());
        // SAFETY: the range was checked to be backed by memory.
        unsafe {
            core::ptr::copy_nonoverlapping(self.phys_to_ptr(phys), buf.as_mut_ptr(), buf.len());
        }
    }

    /// Copies bytes into physical memory.
    pub fn write(&self, phys: PhysicalAddress, data: &[u8]) {
        if data.is_empty() {
            return;
        }
        self.assert_backed(phys, data.len());
        // SAFETY: the range was checked to be backed by memory.
        unsafe {
            core::ptr::copy_nonoverlapping(data.as_ptr(), self.phys_to_ptr(phys), data.len());
        }
    }

    /// Fills a physical range with `byte`.
    pub fn fill(&self, phys: PhysicalAddress, len: usize, byte: u8) {
        if len == 0 {
            return;
        }
        self.assert_backed(phys, len);
        // SAFETY: the range was checked to be backed by memory.
        unsafe { core::ptr::write_bytes(self.phys_to_ptr(phys), byte, len) };
    }

    /// Copies `len` bytes between two non-overlapping physical ranges.
    pub fn copy(&self, dst: PhysicalAddress, src: PhysicalAddress, len: usize) {
        if len == 0 {
            return;
        }
        self.assert_backed(dst, len);
        self.assert_backed(src, len);
        assert!(
            dst.as_usize() + len <= src.as_usize() || src.as_usize() + len <= dst.as_usize(),
            "overlapping physical copy"
        );
        // SAFETY: both ranges are backed and disjoint.
        unsafe {
            core::ptr::copy_nonoverlapping(self.phys_to_ptr(src), self.phys_to_ptr(dst), len);
        }
    }

    /// Panics if `[phys, phys + len)` is not backed by memory. Hardware translation
    /// trusts the caller.
    #[allow(unused_variables)]
    pub fn assert_backed(&self, phys: PhysicalAddress, len: usize) {
        #[cfg(any(test, feature = "software-emulation"))]
        if let Self::Emulated(mem) = self {
            assert!(
                phys.as_usize() + len <= mem.size(),
                "physical range {phys:?}+{len:#x} outside emulated memory"
            );
        }
    }
}

/// Macro to define common address type functionality.
macro_rules! impl_address_common {
    ($name:ident, $doc:expr) => {
        #[doc = $doc]
        #[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
        #[repr(transparent)]
        pub struct $name(usize);

        impl $name {
            /// Returns the raw address value.
            #[inline]
            pub const fn as_usize(self) -> usize {
                self.0
            }

            /// Checks if the address is aligned to the given alignment.
            #[inline]
            pub const fn is_aligned(self, align: usize) -> bool {
                assert!(align.is_power_of_two(), "alignment must be a power of two");
                self.0 & (align - 1) == 0
            }

            /// Aligns the address down to the given alignment.
            #[inline]
            pub const fn align_down(self, align: usize) -> Self {
                assert!(align.is_power_of_two(), "alignment must be a power of two");
                Self(self.0 & !(align - 1))
            }

            /// Aligns the address up to the given alignment.
            #[inline]
            pub const fn align_up(self, align: usize) -> Self {
                assert!(align.is_power_of_two(), "alignment must be a power of two");
                Self((self.0 + align - 1) & !(align - 1))
            }

            /// Offset of this address within its page.
            #[inline]
            pub const fn page_offset(self) -> usize {
                self.0 & (arch::PAGE_SIZE - 1)
            }
        }

        impl fmt::Debug for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, "{}({:#x})", stringify!($name), self.0)
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, "{:#x}", self.0)
            }
        }

        impl From<usize> for $name {
            #[inline]
            fn from(addr: usize) -> Self {
                Self::new(addr)
            }
        }

        impl Add<usize> for $name {
            type Output = Self;

            #[inline]
            fn add(self, rhs: usize) -> Self::Output {
                Self::new(self.0 + rhs)
            }
        }

        impl Sub<usize> for $name {
            type Output = Self;

            #[inline]
            fn sub(self, rhs: usize) -> Self::Output {
                Self::new(self.0 - rhs)
            }
        }

        impl Sub<$name> for $name {
            type Output = usize;

            #[inline]
            fn sub(self, rhs: $name) -> Self::Output {
                self.0 - rhs.0
            }
        }
    };
}

impl_address_common!(
    PhysicalAddress,
    "A physical memory address."
);

impl PhysicalAddress {
    /// All-ones sentinel returned by raw-address allocation APIs on failure.
    pub const ERR: Self = Self(usize::MAX);

    /// Creates a new physical address.
    ///
    /// # Panics
    ///
    /// Panics if the address exceeds the architecture's physical address width.
    #[inline]
    pub const fn new(addr: usize) -> Self {
        assert!(
            arch::validate_physical(addr),
            "physical address exceeds maximum width"
        );
        Self(addr)
    }

    /// Returns true for the [`PhysicalAddress::ERR`] sentinel.
    #[inline]
    pub const fn is_err(self) -> bool {
        self.0 == usize::MAX
    }

    /// Returns the frame containing this address.
    #[inline]
    pub const fn frame_number(self) -> FrameNumber {
        FrameNumber::new(self.0 >> arch::PAGE_SHIFT)
    }
}

impl_address_common!(
    VirtualAddress,
    "A virtual memory address."
);

impl VirtualAddress {
    /// Creates a new virtual address.
    ///
    /// # Panics
    ///
    /// Panics if the address does not fit the architecture's virtual address width.
    #[inline]
    pub const fn new(addr: usize) -> Self {
        assert!(
            arch::validate_virtual(addr),
            "virtual address exceeds maximum width"
        );
        Self(addr)
    }

    /// Returns the page containing this address.
    #[inline]
    pub const fn page_number(self) -> PageNumber {
        PageNumber::new(self.0 >> arch::PAGE_SHIFT)
    }

    /// Returns true if the address lies in the kernel half of the address space.
    #[inline]
    pub const fn is_kernel(self) -> bool {
        self.0 >= arch::KERNEL_VM_START
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use arch::PAGE_SIZE;

    #[test]
    fn alignment_helpers() {
        let addr = VirtualAddress::new(3 * PAGE_SIZE + 5);
        assert_eq!(addr.align_down(PAGE_SIZE), VirtualAddress::new(3 * PAGE_SIZE));
        assert_eq!(addr.align_up(PAGE_SIZE), VirtualAddress::new(4 * PAGE_SIZE));
        assert_eq!(addr.page_offset(), 5);
        assert!(!addr.is_aligned(PAGE_SIZE));
    }

    #[test]
    fn kernel_half() {
        assert!(VirtualAddress::new(arch::KERNEL_VM_START).is_kernel());
        assert!(!VirtualAddress::new(arch::USER_VM_END).is_kernel());
    }

    #[test]
    fn error_sentinel_is_all_ones() {
        assert!(PhysicalAddress::ERR.is_err());
        assert_eq!(PhysicalAddress::ERR.as_usize(), usize::MAX);
        assert!(!PhysicalAddress::new(0).is_err());
    }

    #[test]
    fn debug_format_names_the_type() {
        assert_eq!(format!("{:?}", PhysicalAddress::new(0x40)), "PhysicalAddress(0x40)");
    }

    #[test]
    fn emulated_memory_round_trip() {
        let memory = AddressTranslator::emulated(0x100);
        memory.write(PhysicalAddress::new(0x10), b"frame");
        memory.copy(PhysicalAddress::new(0x40), PhysicalAddress::new(0x10), 5);
        memory.fill(PhysicalAddress::new(0x42), 2, b'-');

        let mut buf = [0u8; 5];
        memory.read(PhysicalAddress::new(0x40), &mut buf);
        assert_eq!(&buf, b"fr--e");
    }

    #[test]
    #[should_panic(expected = "outside emulated memory")]
    fn emulated_memory_bounds() {
        let memory = AddressTranslator::emulated(0x20);
        memory.fill(PhysicalAddress::new(0x10), 0x20, 0);
    }
}
