//! The translation cache seam.
//!
//! The fault handler finishes by installing the faulting translation into
//! the processor's translation cache. That hardware interface is reached
//! through [`TranslationCache`] so the paging machinery stays portable and
//! host-testable; a software implementation backs hosted runs and tests.

use crate::address::{PhysicalAddress, VirtualAddress};

/// A per-processor virtual-to-physical translation cache.
///
/// Implementations are accessed with interrupts disabled on the owning
/// processor; that obligation belongs to the trap layer, not to callers
/// inside this crate.
pub trait TranslationCache {
    /// Installs a writable translation from the page containing `vaddr` to
    /// the frame at `paddr`.
    ///
    /// If an entry for the same page already exists it is replaced in
    /// place. Returns false when the cache is full and nothing could be
    /// installed; the caller is expected to invalidate and retry once.
    fn insert(&mut self, vaddr: VirtualAddress, paddr: PhysicalAddress) -> bool;

    /// Drops every cached translation.
    fn invalidate_all(&mut self);
}

#[cfg(any(test, feature = "software-emulation"))]
mod software {
    use super::*;
    use crate::config::TLB_SLOTS;

    /// A software [`TranslationCache`] with fixed slot geometry.
    pub struct SoftwareTlb {
        slots: [Option<(VirtualAddress, PhysicalAddress)>; TLB_SLOTS],
    }

    impl SoftwareTlb {
        pub fn new() -> Self {
            Self {
                slots: [None; TLB_SLOTS],
            }
        }

        /// Looks up the frame cached for the page containing `vaddr`.
        pub fn lookup(&self, vaddr: VirtualAddress) -> Option<PhysicalAddress> {
            let page = vaddr.page_base();
            self.slots
                .iter()
                .flatten()
                .find(|(v, _)| *v == page)
                .map(|(_, p)| *p)
        }

        /// Returns the number of occupied slots.
        pub fn occupied(&self) -> usize {
            self.slots.iter().flatten().count()
        }
    }

    impl Default for SoftwareTlb {
        fn default() -> Self {
            Self::new()
        }
    }

    impl TranslationCache for SoftwareTlb {
        fn insert(&mut self, vaddr: VirtualAddress, paddr: PhysicalAddress) -> bool {
            let page = vaddr.page_base();
            if let Some(slot) = self
                .slots
                .iter_mut()
                .find(|s| matches!(s, Some((v, _)) if *v == page))
            {
                *slot = Some((page, paddr));
                return true;
            }
            if let Some(slot) = self.slots.iter_mut().find(|s| s.is_none()) {
                *slot = Some((page, paddr));
                return true;
            }
            false
        }

        fn invalidate_all(&mut self) {
            self.slots = [None; TLB_SLOTS];
        }
    }
}

#[cfg(any(test, feature = "software-emulation"))]
pub use software::SoftwareTlb;

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{PAGE_SIZE, TLB_SLOTS};

    #[test]
    fn insert_and_lookup() {
        let mut tlb = SoftwareTlb::new();
        let page = VirtualAddress::new(0x1000);
        let frame = PhysicalAddress::new(0x8000);
        assert!(tlb.insert(page, frame));

        assert_eq!(tlb.lookup(page), Some(frame));
        assert_eq!(tlb.lookup(page + 0x123), Some(frame));
        assert_eq!(tlb.lookup(VirtualAddress::new(0x2000)), None);
    }

    #[test]
    fn reinsert_replaces_in_place() {
        let mut tlb = SoftwareTlb::new();
        let page = VirtualAddress::new(0x1000);
        assert!(tlb.insert(page, PhysicalAddress::new(0x8000)));
        assert!(tlb.insert(page, PhysicalAddress::new(0x9000)));

        assert_eq!(tlb.occupied(), 1);
        assert_eq!(tlb.lookup(page), Some(PhysicalAddress::new(0x9000)));
    }

    #[test]
    fn full_cache_rejects_new_pages() {
        let mut tlb = SoftwareTlb::new();
        for i in 0..TLB_SLOTS {
            assert!(tlb.insert(
                VirtualAddress::new((i + 1) * PAGE_SIZE),
                PhysicalAddress::new((i + 1) * PAGE_SIZE),
            ));
        }
        assert!(!tlb.insert(
            VirtualAddress::new((TLB_SLOTS + 1) * PAGE_SIZE),
            PhysicalAddress::new(PAGE_SIZE),
        ));
        // A page already present can still be replaced.
        assert!(tlb.insert(VirtualAddress::new(PAGE_SIZE), PhysicalAddress::new(0x4000)));
    }

    #[test]
    fn invalidate_all_empties_the_cache() {
        let mut tlb = SoftwareTlb::new();
        tlb.insert(VirtualAddress::new(0x1000), PhysicalAddress::new(0x8000));
        tlb.invalidate_all();
        assert_eq!(tlb.occupied(), 0);
        assert_eq!(tlb.lookup(VirtualAddress::new(0x1000)), None);
    }
}
