//! Page and frame number types.

use crate::{
    address::{PhysicalAddress, VirtualAddress},
    arch,
};
use core::{
    fmt,
    ops::{Add, Sub},
};

/// Macro to define common page/frame number functionality.
macro_rules! impl_page_number_common {
    ($name:ident, $doc:expr) => {
        #[doc = $doc]
        #[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
        #[repr(transparent)]
        pub struct $name(usize);

        impl $name {
            /// Creates a new page/frame number.
            #[inline]
            pub const fn new(number: usize) -> Self {
                Self(number)
            }

            /// Returns the raw page/frame number.
            #[inline]
            pub const fn as_usize(self) -> usize {
                self.0
            }
        }

        impl fmt::Debug for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, "{}({})", stringify!($name), self.0)
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, "{}", self.0)
            }
        }

        impl Add<usize> for $name {
            type Output = Self;

            #[inline]
            fn add(self, rhs: usize) -> Self::Output {
                Self(self.0 + rhs)
            }
        }

        impl Sub<usize> for $name {
            type Output = Self;

            #[inline]
            fn sub(self, rhs: usize) -> Self::Output {
                Self(self.0 - rhs)
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

impl_page_number_common!(
    FrameNumber,
    "A physical memory frame number.\n\n\
     Frame numbers are zero-indexed and correspond to PAGE_SIZE-aligned physical addresses."
);

impl FrameNumber {
    /// Returns the physical address at the start of this frame.
    #[inline]
    pub const fn start(self) -> PhysicalAddress {
        PhysicalAddress::new(self.0 << arch::PAGE_SHIFT)
    }

    /// Returns the buddy of the order-`order` block starting at this frame.
    #[inline]
    pub const fn buddy(self, order: usize) -> Self {
        Self(self.0 ^ (1 << order))
    }

    /// Returns true if this frame can start a block of the given order.
    #[inline]
    pub const fn is_order_aligned(self, order: usize) -> bool {
        self.0 & ((1 << order) - 1) == 0
    }
}

impl From<PhysicalAddress> for FrameNumber {
    #[inline]
    fn from(addr: PhysicalAddress) -> Self {
        addr.frame_number()
    }
}

impl_page_number_common!(
    PageNumber,
    "A virtual memory page number."
);

impl PageNumber {
    /// Returns the virtual address at the start of this page.
    #[inline]
    pub const fn start(self) -> VirtualAddress {
        VirtualAddress::new(self.0 << arch::PAGE_SHIFT)
    }
}

impl From<VirtualAddress> for PageNumber {
    #[inline]
    fn from(addr: VirtualAddress) -> Self {
        addr.page_number()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn frame_start_address() {
        assert_eq!(FrameNumber::new(3).start().as_usize(), 3 * arch::PAGE_SIZE);
        assert_eq!(
            FrameNumber::from(PhysicalAddress::new(arch::PAGE_SIZE * 5 + 1)),
            FrameNumber::new(5)
        );
    }

    #[test]
    fn buddies_pair_up() {
        let frame = FrameNumber::new(8);
        assert_eq!(frame.buddy(0), FrameNumber::new(9));
        assert_eq!(frame.buddy(2), FrameNumber::new(12));
        assert_eq!(frame.buddy(3), FrameNumber::new(0));
        assert_eq!(frame.buddy(3).buddy(3), frame);
    }

    #[test]
    fn order_alignment() {
        assert!(FrameNumber::new(16).is_order_aligned(4));
        assert!(!FrameNumber::new(24).is_order_aligned(4));
        assert!(FrameNumber::new(7).is_order_aligned(0));
    }

    #[test]
    fn page_numbers() {
        let page = PageNumber::from(VirtualAddress::new(arch::PAGE_SIZE * 7 + 3));
        assert_eq!(page, PageNumber::new(7));
        assert_eq!(page.start(), VirtualAddress::new(arch::PAGE_SIZE * 7));
        assert_eq!(page + 2 - page, 2);
    }
}
