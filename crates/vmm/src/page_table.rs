//! Per-address-space page tables.
//!
//! A page table is a bounded, append-only sequence of entries, one per
//! virtual page ever defined for its address space. The sequence's shape is
//! frozen once the owning process starts executing; after that only the
//! residency, reference, dirty, and busy state of individual entries
//! changes. Lookup is a linear scan, as in any teaching kernel without a
//! hierarchical table.

use alloc::vec::Vec;

use crate::address::{PhysicalAddress, VirtualAddress};
use crate::config::PAGE_TABLE_CAPACITY;
use crate::error::VmError;

/// One virtual page's mapping state.
///
/// Residency is encoded as `frame: Option<PhysicalAddress>`: a page is
/// resident exactly when it holds a frame address, which is always non-zero
/// and owned by this entry in the frame table.
#[derive(Debug, Clone)]
pub struct PageTableEntry {
    vaddr: VirtualAddress,
    frame: Option<PhysicalAddress>,
    referenced: bool,
    dirty: bool,
    /// Set while a fault is paging this entry in. A second fault on the same
    /// page waits for the first to publish rather than allocating a second
    /// frame for one logical page.
    busy: bool,
}

impl PageTableEntry {
    fn new(vaddr: VirtualAddress) -> Self {
        Self {
            vaddr,
            frame: None,
            referenced: false,
            dirty: false,
            busy: false,
        }
    }

    /// The page-aligned virtual address this entry maps. Assigned once at
    /// definition time and never changed.
    pub fn vaddr(&self) -> VirtualAddress {
        self.vaddr
    }

    /// The backing frame, if the page is resident.
    pub fn frame(&self) -> Option<PhysicalAddress> {
        self.frame
    }

    /// Returns true if the page is resident.
    pub fn is_resident(&self) -> bool {
        self.frame.is_some()
    }

    /// Returns true if the page has been touched since definition.
    pub fn is_referenced(&self) -> bool {
        self.referenced
    }

    /// Returns true if a write fault has touched the page.
    pub fn is_dirty(&self) -> bool {
        self.dirty
    }

    pub(crate) fn is_busy(&self) -> bool {
        self.busy
    }

    pub(crate) fn set_busy(&mut self, busy: bool) {
        self.busy = busy;
    }

    /// Records an access. A write additionally dirties the page.
    pub(crate) fn touch(&mut self, write: bool) {
        self.referenced = true;
        if write {
            self.dirty = true;
        }
    }

    /// Publishes residency at `frame`.
    pub(crate) fn set_resident(&mut self, frame: PhysicalAddress) {
        debug_assert!(frame.as_usize() != 0);
        self.frame = Some(frame);
    }

    /// Clears residency; the frame is being reassigned or released.
    pub(crate) fn clear_resident(&mut self) {
        self.frame = None;
        self.dirty = false;
    }
}

/// A bounded page table.
pub struct PageTable {
    entries: Vec<PageTableEntry>,
}

impl PageTable {
    /// Creates an empty table.
    pub fn new() -> Self {
        Self {
            entries: Vec::new(),
        }
    }

    /// Returns the number of defined pages.
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Returns true if no pages have been defined yet.
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Returns the defined entries in definition order.
    pub fn entries(&self) -> &[PageTableEntry] {
        &self.entries
    }

    /// Checks that `additional` more pages fit within capacity.
    pub fn check_capacity(&self, additional: usize) -> Result<(), VmError> {
        if self.entries.len() + additional > PAGE_TABLE_CAPACITY {
            return Err(VmError::CapacityExceeded {
                requested_pages: additional,
                capacity: PAGE_TABLE_CAPACITY,
            });
        }
        Ok(())
    }

    /// Appends an entry for `vaddr`, not resident.
    ///
    /// Callers check capacity first; definition of a region is all-or-nothing.
    pub(crate) fn push(&mut self, vaddr: VirtualAddress) {
        debug_assert!(vaddr.is_page_aligned());
        debug_assert!(self.entries.len() < PAGE_TABLE_CAPACITY);
        debug_assert!(self.find(vaddr).is_none(), "page defined twice: {vaddr}");
        self.entries.push(PageTableEntry::new(vaddr));
    }

    /// Finds the entry mapping the page containing `vaddr`.
    pub fn find(&self, vaddr: VirtualAddress) -> Option<&PageTableEntry> {
        let page = vaddr.page_base();
        self.entries.iter().find(|e| e.vaddr == page)
    }

    /// Mutable variant of [`PageTable::find`].
    pub(crate) fn find_mut(&mut self, vaddr: VirtualAddress) -> Option<&mut PageTableEntry> {
        let page = vaddr.page_base();
        self.entries.iter_mut().find(|e| e.vaddr == page)
    }
}

impl Default for PageTable {
    fn default() -> Self {
        Self::new()
    }
}
