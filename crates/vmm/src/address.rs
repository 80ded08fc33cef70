//! Address types for the virtual memory manager.
//!
//! Physical and virtual addresses are plain machine words in this kernel, but
//! wrapping them in distinct newtypes keeps the frame table and the page
//! table from ever confusing the two. Both types carry the page-arithmetic
//! helpers the fault path needs.

use core::fmt;
use core::ops::{Add, Sub};

use crate::config::PAGE_SIZE;

/// Generates the structure and methods shared by both address types.
macro_rules! impl_address_common {
    ($name:ident, $doc:expr) => {
        #[doc = $doc]
        #[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
        #[repr(transparent)]
        pub struct $name(usize);

        impl $name {
            /// Creates a new address.
            #[inline]
            pub const fn new(addr: usize) -> Self {
                Self(addr)
            }

            /// Returns the raw address value.
            #[inline]
            pub const fn as_usize(self) -> usize {
                self.0
            }

            /// Returns the page-aligned base of the page containing this address.
            #[inline]
            pub const fn page_base(self) -> Self {
                Self(self.0 & !(PAGE_SIZE - 1))
            }

            /// Returns the offset of this address within its page.
            #[inline]
            pub const fn page_offset(self) -> usize {
                self.0 & (PAGE_SIZE - 1)
            }

            /// Returns true if this address is page-aligned.
            #[inline]
            pub const fn is_page_aligned(self) -> bool {
                self.page_offset() == 0
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
    "The base address of a physical page frame, or an address within one.\n\n\
     The zero address is never a valid frame base; the frame table hands out\n\
     frames starting at its configured base address."
);

impl_address_common!(
    VirtualAddress,
    "A user virtual address.\n\n\
     Page table entries and swap slots store the page-aligned form; fault\n\
     addresses arrive unaligned and are masked with [`VirtualAddress::page_base`]."
);

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn page_base_masks_offset() {
        let addr = VirtualAddress::new(PAGE_SIZE * 3 + 0x123);
        assert_eq!(addr.page_base(), VirtualAddress::new(PAGE_SIZE * 3));
        assert_eq!(addr.page_offset(), 0x123);
    }

    #[test]
    fn aligned_address_is_its_own_base() {
        let addr = PhysicalAddress::new(PAGE_SIZE * 7);
        assert!(addr.is_page_aligned());
        assert_eq!(addr.page_base(), addr);
        assert_eq!(addr.page_offset(), 0);
    }

    #[test]
    fn arithmetic() {
        let addr = VirtualAddress::new(0x1000);
        assert_eq!((addr + 0x500).as_usize(), 0x1500);
        assert_eq!((addr - 0x800).as_usize(), 0x800);
        assert_eq!(VirtualAddress::new(0x3000) - addr, 0x2000);
    }

    #[test]
    fn distinct_types_compare_within_type() {
        let a = PhysicalAddress::new(0x2000);
        let b = PhysicalAddress::new(0x3000);
        assert!(a < b);
        assert_ne!(a, b);
    }

    #[test]
    fn display_is_hex() {
        let addr = VirtualAddress::new(0x4000);
        assert_eq!(format!("{addr}"), "0x4000");
        assert!(format!("{addr:?}").contains("VirtualAddress"));
    }
}
