//! Address spaces: the per-process view of virtual memory.
//!
//! An address space bundles a page table with a swap store whose slot table
//! is kept in lock-step with it: every defined page has exactly one swap
//! slot, created at definition time, so the fault path never allocates swap
//! space. Region and stack definition happen before the owning program runs;
//! after that the shape of the space is frozen and only residency changes.
//!
//! The page table and swap store live behind an [`Arc`] so the frame table
//! can hold non-owning references to the spaces occupying its frames. Those
//! references never keep a space alive and never tear one down; teardown is
//! explicit via [`AddressSpace::destroy`].

use alloc::sync::Arc;
use alloc::vec;
use alloc::vec::Vec;
use core::fmt;
use core::sync::atomic::{AtomicU64, Ordering};

use crate::address::{PhysicalAddress, VirtualAddress};
use crate::config::{PAGE_SIZE, STACK_PAGES, USER_TOP};
use crate::error::VmError;
use crate::frame_table::FrameTable;
use crate::page_table::{PageTable, PageTableEntry};
use crate::swap::{SwapStore, SwapVolume};
use crate::tlb::TranslationCache;

static NEXT_AS_ID: AtomicU64 = AtomicU64::new(1);

/// Declared permissions of a region.
///
/// Accepted and logged, not enforced: every page behaves read-write. This
/// is a stated simplification of the paging model, not a hidden bug.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Permissions {
    pub read: bool,
    pub write: bool,
    pub execute: bool,
}

impl Permissions {
    /// An ordinary data region.
    pub const fn read_write() -> Self {
        Self {
            read: true,
            write: true,
            execute: false,
        }
    }

    /// A text segment.
    pub const fn read_execute() -> Self {
        Self {
            read: true,
            write: false,
            execute: true,
        }
    }
}

/// Identifier of an address space, unique for the lifetime of the system.
///
/// Also names the space's swap file, so ids are never reused even after a
/// space is destroyed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct AsId(u64);

impl AsId {
    /// Draws the next id from a global counter.
    pub(crate) fn allocate() -> Self {
        Self(NEXT_AS_ID.fetch_add(1, Ordering::Relaxed))
    }
}

impl fmt::Display for AsId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// The shared core of an address space.
///
/// Held behind an [`Arc`] by the owning [`AddressSpace`] and behind [`Weak`]
/// references by frame table entries.
///
/// [`Weak`]: alloc::sync::Weak
pub(crate) struct AsShared {
    id: AsId,
    page_table: spin::Mutex<PageTable>,
    swap: SwapStore,
}

impl AsShared {
    pub(crate) fn id(&self) -> AsId {
        self.id
    }

    pub(crate) fn page_table(&self) -> &spin::Mutex<PageTable> {
        &self.page_table
    }

    pub(crate) fn swap(&self) -> &SwapStore {
        &self.swap
    }
}

/// A process address space.
pub struct AddressSpace {
    shared: Arc<AsShared>,
}

impl fmt::Debug for AddressSpace {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AddressSpace")
            .field("id", &self.shared.id)
            .field("pages", &self.shared.page_table.lock().len())
            .finish()
    }
}

impl AddressSpace {
    /// Creates an empty address space with a fresh swap file on `volume`.
    pub fn new(volume: Arc<dyn SwapVolume>) -> Result<Self, VmError> {
        let id = AsId::allocate();
        let swap = SwapStore::create(volume, id)?;
        log::debug!("as {id}: created (swap file {})", swap.name());
        Ok(Self {
            shared: Arc::new(AsShared {
                id,
                page_table: spin::Mutex::new(PageTable::new()),
                swap,
            }),
        })
    }

    /// Returns this space's identifier.
    pub fn id(&self) -> AsId {
        self.shared.id
    }

    pub(crate) fn shared(&self) -> &Arc<AsShared> {
        &self.shared
    }

    /// Returns the number of pages defined so far.
    pub fn defined_pages(&self) -> usize {
        self.shared.page_table.lock().len()
    }

    /// Runs `f` with the page table locked. For diagnostics and tests; the
    /// fault path goes through [`Vm::handle_fault`].
    ///
    /// [`Vm::handle_fault`]: crate::Vm::handle_fault
    pub fn with_page_table<R>(&self, f: impl FnOnce(&PageTable) -> R) -> R {
        f(&self.shared.page_table.lock())
    }

    /// Returns the frame backing `vaddr`, if that page is resident.
    pub fn resident_frame(&self, vaddr: VirtualAddress) -> Option<PhysicalAddress> {
        self.shared
            .page_table
            .lock()
            .find(vaddr)
            .and_then(|entry| entry.frame())
    }

    /// Defines a region of `len` bytes starting at `base`.
    ///
    /// `base` need not be page-aligned: the region is extended downward to
    /// its page base and the definition covers every page the byte range
    /// touches. Each page gets a page table entry and a swap slot whose live
    /// length is the number of region bytes falling in that page, so
    /// eviction never writes more of an edge page than the region owns.
    ///
    /// `perms` is recorded in the log only; see [`Permissions`].
    ///
    /// The capacity check is all-or-nothing: a region that does not fit
    /// defines no pages at all.
    pub fn define_region(
        &self,
        base: VirtualAddress,
        len: usize,
        perms: Permissions,
    ) -> Result<(), VmError> {
        if len == 0 {
            return Ok(());
        }
        let offset = base.page_offset();
        let first_page = base.page_base();
        let span = offset + len;
        let npages = span.div_ceil(PAGE_SIZE);

        self.shared.page_table.lock().check_capacity(npages)?;
        log::debug!(
            "as {}: region {base}+{len:#x} ({npages} pages, {perms:?})",
            self.shared.id
        );

        for i in 0..npages {
            let page = first_page + i * PAGE_SIZE;
            let live_start = offset.max(i * PAGE_SIZE);
            let live_end = span.min((i + 1) * PAGE_SIZE);
            self.shared.page_table.lock().push(page);
            self.shared.swap.define_slot(page, live_end - live_start, false)?;
        }
        Ok(())
    }

    /// Defines the user stack and returns its initial stack pointer.
    ///
    /// [`STACK_PAGES`] pages are laid out directly below [`USER_TOP`], each
    /// with a full-page, zero-filled swap slot: a first-ever fault on a
    /// stack page reads zeros, never stale device contents.
    pub fn define_stack(&self) -> Result<VirtualAddress, VmError> {
        self.shared.page_table.lock().check_capacity(STACK_PAGES)?;
        let top = VirtualAddress::new(USER_TOP);
        for j in 1..=STACK_PAGES {
            let page = top - j * PAGE_SIZE;
            self.shared.page_table.lock().push(page);
            self.shared.swap.define_slot(page, PAGE_SIZE, true)?;
        }
        log::debug!("as {}: stack of {STACK_PAGES} pages below {top}", self.shared.id);
        Ok(top)
    }

    /// Asserts the space is ready for its program image to be loaded.
    ///
    /// Loading writes segment bytes to swap with [`AddressSpace::preload_page`];
    /// nothing may be resident yet, since a resident page would shadow the
    /// loaded bytes until evicted.
    pub fn prepare_load(&self) {
        let table = self.shared.page_table.lock();
        assert!(
            table.entries().iter().all(|e| !e.is_resident()),
            "prepare_load on a space with resident pages"
        );
    }

    /// Writes the initial contents of one page directly to its swap slot.
    ///
    /// This is the loader's interface: segment bytes go to swap before the
    /// program runs and are paged in on first touch. `bytes` may be shorter
    /// than the slot's live length (a segment's file size can be smaller
    /// than its memory size); the remainder is zero.
    pub fn preload_page(&self, vaddr: VirtualAddress, bytes: &[u8]) -> Result<(), VmError> {
        assert!(vaddr.is_page_aligned());
        assert!(bytes.len() <= PAGE_SIZE);
        debug_assert!(
            self.resident_frame(vaddr).is_none(),
            "preload of a resident page"
        );

        let mut page = vec![0u8; PAGE_SIZE];
        page[..bytes.len()].copy_from_slice(bytes);
        self.shared.swap.write_page(vaddr, &page)
    }

    /// Creates a complete copy of this space: same shape, same contents.
    ///
    /// Swap slots are cloned byte-for-byte; each resident page additionally
    /// gets its own frame in the copy, filled from the source frame, so the
    /// copy observes the source's current bytes rather than a stale swap
    /// image. Duplication never evicts: if the frame table cannot supply
    /// enough free frames the copy is torn down and
    /// [`VmError::OutOfFrames`] is returned, leaving every resident page of
    /// every other space untouched.
    ///
    /// The caller must quiesce paging against this space for the duration:
    /// no thread may fault in it, and it must not be selected for eviction.
    /// The process layer guarantees this by duplicating from the only thread
    /// executing in the space.
    pub fn duplicate(&self, frames: &FrameTable) -> Result<AddressSpace, VmError> {
        let copy = AddressSpace::new(self.shared.swap.volume())?;
        log::debug!("as {}: duplicating into as {}", self.shared.id, copy.id());

        match self.duplicate_into(&copy, frames) {
            Ok(()) => Ok(copy),
            Err(err) => {
                frames.release_owned_by(copy.shared());
                Err(err)
            }
        }
    }

    fn duplicate_into(&self, copy: &AddressSpace, frames: &FrameTable) -> Result<(), VmError> {
        let snapshot: Vec<PageTableEntry> =
            self.shared.page_table.lock().entries().to_vec();

        self.shared.swap.clone_into(&copy.shared.swap)?;

        for entry in &snapshot {
            copy.shared.page_table.lock().push(entry.vaddr());
            let Some(src_frame) = entry.frame() else {
                continue;
            };

            let grant = frames.allocate_free_only(copy.shared(), entry.vaddr(), None)?;
            frames.copy_frame_to_frame(src_frame, grant.paddr);

            // Publish residency while the claim pin still shields the frame
            // from victim selection, then drop the pin via `bind`.
            {
                let mut table = copy.shared.page_table.lock();
                let pte = table
                    .find_mut(entry.vaddr())
                    .expect("entry pushed above");
                pte.set_resident(grant.paddr);
                pte.touch(entry.is_dirty());
            }
            let bound = frames.bind(
                grant.paddr,
                copy.shared(),
                entry.vaddr(),
                true,
                entry.is_dirty(),
                None,
            );
            debug_assert!(bound, "fresh claim cannot lose a bind race");
        }
        Ok(())
    }

    /// Makes this space current on the executing processor.
    ///
    /// The translation cache carries no space tags, so every activation
    /// drops all cached translations; stale entries from the previous space
    /// must never serve this one.
    pub fn activate(&self, tlb: &mut dyn TranslationCache) {
        tlb.invalidate_all();
    }

    /// Tears the space down: frees every frame it occupies and removes its
    /// swap file. The caller guarantees no fault for this space is in
    /// flight and the space is not active on any processor.
    pub fn destroy(self, frames: &FrameTable) {
        log::debug!("as {}: destroying", self.shared.id);
        frames.release_owned_by(&self.shared);
        // Dropping the last Arc drops the SwapStore, which removes the file.
    }
}
