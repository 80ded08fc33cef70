//! Error types for the virtual memory manager.
//!
//! The taxonomy separates three classes: fatal conditions that the trap
//! layer must collapse into a kernel stop, recoverable I/O and resource
//! failures reported to the caller, and capacity exhaustion during address
//! space setup. Structural invariant violations (a corrupted frame table, a
//! missing swap mapping) are not represented here at all; those are
//! asserted where they are detected, since no caller can repair them.

use core::fmt;

use crate::address::VirtualAddress;

/// An error reported by the underlying swap storage.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SwapIoError {
    /// The device transferred fewer bytes than requested.
    ShortTransfer {
        /// Number of bytes the operation asked for.
        requested: usize,
        /// Number of bytes the device actually moved.
        transferred: usize,
    },
    /// The underlying device reported a failure.
    Device,
}

impl fmt::Display for SwapIoError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::ShortTransfer {
                requested,
                transferred,
            } => write!(
                f,
                "short swap transfer: {transferred} of {requested} bytes"
            ),
            Self::Device => write!(f, "swap device error"),
        }
    }
}

/// Errors surfaced by fault handling and address space operations.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VmError {
    /// A fault arrived with no current address space (e.g. a kernel-mode
    /// fault before any process exists).
    NoAddressSpace,
    /// The faulting address was never defined as part of any region or stack.
    UnmappedAddress(VirtualAddress),
    /// A read-only violation fault. Every page is created writable, so this
    /// indicates a logic error elsewhere in the kernel.
    ReadOnlyViolation(VirtualAddress),
    /// No free translation cache slot was found even after invalidating the
    /// whole cache and retrying once.
    TranslationCacheExhausted,
    /// A region or stack definition would exceed the fixed page table (and
    /// swap slot) capacity.
    CapacityExceeded {
        /// Pages the definition asked for, on top of those already defined.
        requested_pages: usize,
        /// Total page capacity of the address space.
        capacity: usize,
    },
    /// No physical frame could be provided. Raised when every frame is
    /// claimed by an in-flight fault, or during duplication, which never
    /// evicts.
    OutOfFrames,
    /// The swap store reported an I/O failure.
    Io(SwapIoError),
}

impl VmError {
    /// Returns true if this error must collapse into a kernel stop.
    ///
    /// Non-fatal errors are reported to the process layer instead: capacity
    /// exhaustion refuses to run the program, and I/O or frame exhaustion
    /// surfaces as an out-of-memory result from the triggering operation.
    pub fn is_fatal(&self) -> bool {
        match self {
            Self::NoAddressSpace
            | Self::UnmappedAddress(_)
            | Self::ReadOnlyViolation(_)
            | Self::TranslationCacheExhausted => true,
            Self::CapacityExceeded { .. } | Self::OutOfFrames | Self::Io(_) => false,
        }
    }
}

impl From<SwapIoError> for VmError {
    fn from(err: SwapIoError) -> Self {
        Self::Io(err)
    }
}

impl fmt::Display for VmError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::NoAddressSpace => write!(f, "fault with no current address space"),
            Self::UnmappedAddress(addr) => {
                write!(f, "fault at {addr}, which no region defines")
            }
            Self::ReadOnlyViolation(addr) => {
                write!(f, "read-only violation at {addr} (all pages are writable)")
            }
            Self::TranslationCacheExhausted => {
                write!(f, "translation cache exhausted after invalidate-and-retry")
            }
            Self::CapacityExceeded {
                requested_pages,
                capacity,
            } => write!(
                f,
                "region of {requested_pages} pages exceeds page table capacity of {capacity}"
            ),
            Self::OutOfFrames => write!(f, "no physical frame available"),
            Self::Io(err) => write!(f, "swap I/O failed: {err}"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fatal_classification() {
        assert!(VmError::NoAddressSpace.is_fatal());
        assert!(VmError::UnmappedAddress(VirtualAddress::new(0x1000)).is_fatal());
        assert!(VmError::ReadOnlyViolation(VirtualAddress::new(0x1000)).is_fatal());
        assert!(VmError::TranslationCacheExhausted.is_fatal());

        assert!(
            !VmError::CapacityExceeded {
                requested_pages: 2000,
                capacity: 1024
            }
            .is_fatal()
        );
        assert!(!VmError::OutOfFrames.is_fatal());
        assert!(!VmError::Io(SwapIoError::Device).is_fatal());
    }

    #[test]
    fn io_error_converts() {
        let err: VmError = SwapIoError::ShortTransfer {
            requested: 4096,
            transferred: 100,
        }
        .into();
        assert!(matches!(err, VmError::Io(SwapIoError::ShortTransfer { .. })));
        assert!(format!("{err}").contains("100 of 4096"));
    }
}
