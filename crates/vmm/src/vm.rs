//! The fault handler.
//!
//! [`Vm`] ties the frame table, the per-space page tables, the swap stores,
//! and the translation cache together into the paging state machine. The
//! trap layer owns exactly one `Vm` and calls [`Vm::handle_fault`] for every
//! translation miss; everything else in this module is in service of that
//! call.
//!
//! A fault resolves in one of two ways. If the page is already resident the
//! access bits are refreshed and the translation is reinstalled, with no
//! I/O.
//! Otherwise the entry is marked busy, a frame is acquired (evicting and
//! writing back a victim if necessary), the page's bytes are read from its
//! swap slot, and residency is published. The busy bit serializes concurrent
//! faults on the same page: the loser spins until the winner publishes, then
//! takes the resident path.

use alloc::sync::Arc;
use alloc::vec;

use crate::address::{PhysicalAddress, VirtualAddress};
use crate::address_space::{AddressSpace, AsShared};
use crate::config::PAGE_SIZE;
use crate::error::VmError;
use crate::frame_table::{FrameTable, TaskId};
use crate::stats::VmStats;
use crate::tlb::TranslationCache;

/// The access that faulted, as decoded by the trap layer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FaultKind {
    Read,
    Write,
    /// A write hit a translation installed read-only. Every page in this
    /// system is writable, so this means a kernel logic error, not a
    /// copy-on-write opportunity.
    ReadOnlyViolation,
}

/// The paging state machine.
pub struct Vm {
    frames: FrameTable,
    stats: VmStats,
}

impl Vm {
    /// Creates the paging machinery over `frames`.
    pub fn new(frames: FrameTable) -> Self {
        Self {
            frames,
            stats: VmStats::new(),
        }
    }

    /// Returns the frame table.
    pub fn frames(&self) -> &FrameTable {
        &self.frames
    }

    /// Returns the paging counters.
    pub fn stats(&self) -> &VmStats {
        &self.stats
    }

    /// Clears every frame's reference bit. Called by the aging driver.
    pub fn on_aging_tick(&self) {
        log::trace!("vm: aging pass");
        self.frames.clear_all_reference_bits();
    }

    /// Resolves a translation fault at `addr`.
    ///
    /// On success the faulting translation has been installed in `tlb` and
    /// the access can be retried. Errors for which [`VmError::is_fatal`]
    /// holds mean the fault cannot be resolved for this address at all;
    /// non-fatal errors are transient resource or I/O failures that left
    /// every page table consistent.
    pub fn handle_fault(
        &self,
        space: Option<&AddressSpace>,
        task: Option<TaskId>,
        kind: FaultKind,
        addr: VirtualAddress,
        tlb: &mut dyn TranslationCache,
    ) -> Result<(), VmError> {
        self.stats.record_fault();
        log::trace!("vm: {kind:?} fault at {addr}");

        if kind == FaultKind::ReadOnlyViolation {
            return Err(VmError::ReadOnlyViolation(addr));
        }
        let shared = space.ok_or(VmError::NoAddressSpace)?.shared();
        let write = kind == FaultKind::Write;
        let page = addr.page_base();

        loop {
            // Decide the fault's path under the page table lock, so the
            // entry cannot change state between inspection and action.
            enum Path {
                Resident { paddr: PhysicalAddress, dirty: bool },
                Busy,
                PageIn,
            }
            let path = {
                let mut table = shared.page_table().lock();
                let Some(entry) = table.find_mut(page) else {
                    return Err(VmError::UnmappedAddress(addr));
                };
                // Busy wins over resident: during a page-in, residency is
                // published while the winning fault still holds its frame
                // claim, and nobody else may touch the frame's table entry
                // until that claim is dropped.
                if entry.is_busy() {
                    Path::Busy
                } else if let Some(paddr) = entry.frame() {
                    entry.touch(write);
                    Path::Resident {
                        paddr,
                        dirty: entry.is_dirty(),
                    }
                } else {
                    entry.set_busy(true);
                    Path::PageIn
                }
            };

            match path {
                Path::Resident { paddr, dirty } => {
                    // The frame lock was not held while we inspected the
                    // entry, so an eviction may have reassigned the frame in
                    // the window. `bind` detects that; the retry then takes
                    // the page-in path.
                    if !self.frames.bind(paddr, shared, page, true, dirty, task) {
                        continue;
                    }
                    self.stats.record_resident_hit();
                    return self.install(tlb, page, paddr);
                }
                Path::Busy => {
                    core::hint::spin_loop();
                    continue;
                }
                Path::PageIn => {
                    self.stats.record_page_fault();
                    let result = self.page_in(shared, page, write, task);
                    {
                        let mut table = shared.page_table().lock();
                        if let Some(entry) = table.find_mut(page) {
                            entry.set_busy(false);
                        }
                    }
                    let paddr = result?;
                    return self.install(tlb, page, paddr);
                }
            }
        }
    }

    /// Brings `page` into a frame and publishes residency.
    ///
    /// Caller holds the entry's busy bit; no other fault can be paging this
    /// page while this runs.
    fn page_in(
        &self,
        shared: &Arc<AsShared>,
        page: VirtualAddress,
        write: bool,
        task: Option<TaskId>,
    ) -> Result<PhysicalAddress, VmError> {
        let grant = self.frames.allocate(shared, page, task)?;
        if grant.fast {
            self.stats.record_fast_allocation();
        }

        // Write the victim back before touching the frame. All I/O happens
        // with no frame table lock held; the claim pin keeps the frame ours.
        if let Some(evicted) = &grant.evicted {
            if let Some(data) = &evicted.data {
                if let Some(victim_space) = evicted.owner.upgrade() {
                    if let Err(err) = victim_space.swap().write_page(evicted.vaddr, data) {
                        // The victim's bytes are still in the frame: undo the
                        // eviction instead of losing the page.
                        log::warn!(
                            "vm: write-back of {} failed ({err}), restoring victim",
                            evicted.vaddr
                        );
                        self.frames.restore_victim(grant.paddr, evicted);
                        return Err(err);
                    }
                }
                // Owner already torn down; its bytes are no longer needed.
            }
            self.stats.record_eviction(evicted.data.is_some());
        }

        let mut buf = vec![0u8; PAGE_SIZE];
        let live = match shared.swap().read_page(page, &mut buf) {
            Ok(live) => live,
            Err(err) => {
                self.frames.release_claim(grant.paddr);
                return Err(err);
            }
        };
        self.frames.copy_into_frame(grant.paddr, &buf[..live]);

        // Publish residency first, while the claim pin still shields the
        // frame from victim selection; only then drop the pin via `bind`.
        // In the other order, an eviction could take the frame in between
        // and the entry would go resident at a frame another space owns.
        {
            let mut table = shared.page_table().lock();
            let entry = table
                .find_mut(page)
                .expect("entry existed when the fault started");
            entry.set_resident(grant.paddr);
            entry.touch(write);
        }
        let bound = self.frames.bind(grant.paddr, shared, page, true, write, task);
        debug_assert!(bound, "a pinned claim cannot lose its frame");
        Ok(grant.paddr)
    }

    /// Installs `page -> paddr`, invalidating and retrying once if the cache
    /// is full.
    fn install(
        &self,
        tlb: &mut dyn TranslationCache,
        page: VirtualAddress,
        paddr: PhysicalAddress,
    ) -> Result<(), VmError> {
        if tlb.insert(page, paddr) {
            return Ok(());
        }
        log::debug!("vm: translation cache full, invalidating");
        tlb.invalidate_all();
        if tlb.insert(page, paddr) {
            return Ok(());
        }
        Err(VmError::TranslationCacheExhausted)
    }
}
