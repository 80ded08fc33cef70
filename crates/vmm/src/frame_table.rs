//! The shared physical frame table.
//!
//! One [`FrameTable`] describes every physical page frame in the system:
//! its occupancy, its owning address space, and the aging bits driving
//! eviction. The table also owns the frame contents themselves, so page
//! copies for swap-in, swap-out, and duplication stay inside its API instead
//! of going through raw direct-map pointers.
//!
//! All mutation is serialized by a single internal lock. When a fault needs
//! a frame, the scan for a free entry, the victim selection, and the claim
//! happen under one lock hold so two concurrent faults can never pick the
//! same frame. The claim pins the frame until [`FrameTable::bind`] publishes
//! it; pinned frames are exempt from victim selection.
//!
//! Lock order: the frame lock may briefly take a victim's page-table lock
//! (to invalidate the evicted translation); page-table holders never take
//! the frame lock.

use alloc::boxed::Box;
use alloc::sync::{Arc, Weak};
use alloc::vec;
use alloc::vec::Vec;

use crate::address::{PhysicalAddress, VirtualAddress};
use crate::address_space::{AsId, AsShared};
use crate::config::PAGE_SIZE;
use crate::error::VmError;

/// Identifies the thread a frame was faulted in for. Diagnostic only; never
/// consulted for correctness.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct TaskId(pub u64);

/// Metadata for one physical page frame.
pub struct FrameEntry {
    /// Physical base address. Immutable once the table is built.
    base: PhysicalAddress,
    /// Non-owning reference to the address space backing this frame. Never
    /// used to keep that space alive or to free it.
    owner: Option<Weak<AsShared>>,
    /// The virtual page occupying this frame, when not free.
    vaddr: VirtualAddress,
    task: Option<TaskId>,
    free: bool,
    /// Claimed by an in-flight fault; exempt from victim selection until
    /// the fault publishes via `bind` or unwinds.
    pinned: bool,
    referenced: bool,
    dirty: bool,
    valid: bool,
}

impl FrameEntry {
    fn new(base: PhysicalAddress) -> Self {
        Self {
            base,
            owner: None,
            vaddr: VirtualAddress::new(0),
            task: None,
            free: true,
            pinned: false,
            referenced: false,
            dirty: false,
            valid: false,
        }
    }

    /// Physical base address of this frame.
    pub fn base(&self) -> PhysicalAddress {
        self.base
    }

    /// Returns true iff the frame is unassigned.
    pub fn is_free(&self) -> bool {
        self.free
    }

    /// Returns true while an in-flight fault holds a claim on the frame.
    pub fn is_pinned(&self) -> bool {
        self.pinned
    }

    /// Returns true if the frame has been accessed since the last aging pass.
    pub fn is_referenced(&self) -> bool {
        self.referenced
    }

    /// Returns true if eviction of this frame requires a swap write.
    pub fn is_dirty(&self) -> bool {
        self.dirty
    }

    /// Mirrors whether the owning page table entry currently points here.
    pub fn is_valid(&self) -> bool {
        self.valid
    }

    /// The virtual page backing this frame. Meaningful only when not free.
    pub fn vaddr(&self) -> VirtualAddress {
        self.vaddr
    }

    /// The thread the frame was last faulted in for, if known.
    pub fn task(&self) -> Option<TaskId> {
        self.task
    }

    fn owner_matches(&self, owner: &Arc<AsShared>) -> bool {
        match &self.owner {
            Some(weak) => core::ptr::eq(weak.as_ptr(), Arc::as_ptr(owner)),
            None => false,
        }
    }

    fn reset(&mut self) {
        self.owner = None;
        self.vaddr = VirtualAddress::new(0);
        self.task = None;
        self.free = true;
        self.pinned = false;
        self.referenced = false;
        self.dirty = false;
        self.valid = false;
    }
}

/// Selects the frame to evict when none are free.
///
/// Implementations see the whole entry table in index order and must skip
/// free and pinned entries. The default is [`SecondChance`]; a rotating-hand
/// clock can be substituted without touching any caller.
pub trait VictimPolicy: Send + Sync {
    /// Returns the index of the frame to evict, or `None` if no frame is
    /// currently evictable.
    fn select(&self, entries: &[FrameEntry]) -> Option<usize>;
}

/// Second-chance victim selection.
///
/// Scans in table order for the first entry whose reference bit is clear; a
/// frame that survived an aging pass untouched is the approximated
/// least-recently-used choice. When every entry still has its bit set, the
/// first evictable entry is forcibly chosen, which biases eviction toward
/// low-index frames. The scan restarts from index zero on every call rather
/// than sweeping a rotating pointer.
pub struct SecondChance;

impl VictimPolicy for SecondChance {
    fn select(&self, entries: &[FrameEntry]) -> Option<usize> {
        let evictable = |e: &FrameEntry| !e.free && !e.pinned;

        if let Some(idx) = entries
            .iter()
            .position(|e| evictable(e) && !e.referenced)
        {
            return Some(idx);
        }
        entries.iter().position(evictable)
    }
}

/// A frame handed to a fault by [`FrameTable::allocate`].
///
/// The frame is pinned until the caller publishes it with
/// [`FrameTable::bind`] or unwinds with [`FrameTable::release_claim`].
#[derive(Debug)]
pub(crate) struct FrameGrant {
    pub paddr: PhysicalAddress,
    /// True when a free frame was found without eviction.
    pub fast: bool,
    pub evicted: Option<EvictedPage>,
}

/// The page displaced by an allocation.
///
/// If the victim was dirty, `data` holds a copy of its bytes; the caller
/// must write them to the owner's swap store before treating the grant as
/// durable. The victim's page table entry has already been marked
/// non-resident.
#[derive(Debug)]
pub(crate) struct EvictedPage {
    pub owner: Weak<AsShared>,
    pub vaddr: VirtualAddress,
    /// `Some` iff the victim was dirty.
    pub data: Option<Box<[u8]>>,
}

struct FrameTableInner {
    entries: Vec<FrameEntry>,
    /// Frame contents; entry `i`'s page lives at `i * PAGE_SIZE`.
    storage: Box<[u8]>,
}

impl FrameTableInner {
    fn claim(&mut self, index: usize, owner: &Arc<AsShared>, vaddr: VirtualAddress, task: Option<TaskId>) {
        let entry = &mut self.entries[index];
        entry.owner = Some(Arc::downgrade(owner));
        entry.vaddr = vaddr;
        entry.task = task;
        entry.free = false;
        entry.pinned = true;
        entry.referenced = true;
        entry.dirty = false;
        entry.valid = false;
    }
}

/// A read-only copy of one frame entry's state, for diagnostics and tests.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FrameSnapshot {
    pub base: PhysicalAddress,
    pub owner: Option<AsId>,
    pub vaddr: VirtualAddress,
    pub free: bool,
    pub pinned: bool,
    pub referenced: bool,
    pub dirty: bool,
    pub valid: bool,
}

/// The system-wide table of physical page frames.
pub struct FrameTable {
    inner: spin::Mutex<FrameTableInner>,
    policy: Box<dyn VictimPolicy>,
    base: PhysicalAddress,
    total_frames: usize,
}

impl FrameTable {
    /// Builds the table for `total_frames` frames starting at `base`, every
    /// entry free and all aging bits clear. Constructed exactly once at boot
    /// before any fault can occur.
    pub fn new(base: PhysicalAddress, total_frames: usize) -> Self {
        Self::with_policy(base, total_frames, Box::new(SecondChance))
    }

    /// Like [`FrameTable::new`] with an explicit victim selection policy.
    pub fn with_policy(
        base: PhysicalAddress,
        total_frames: usize,
        policy: Box<dyn VictimPolicy>,
    ) -> Self {
        assert!(base.as_usize() != 0, "frame base must be non-zero");
        assert!(base.is_page_aligned(), "frame base must be page-aligned");

        let entries = (0..total_frames)
            .map(|i| FrameEntry::new(base + i * PAGE_SIZE))
            .collect();
        log::info!("frame table: {total_frames} frames starting at {base}");
        Self {
            inner: spin::Mutex::new(FrameTableInner {
                entries,
                storage: vec![0u8; total_frames * PAGE_SIZE].into_boxed_slice(),
            }),
            policy,
            base,
            total_frames,
        }
    }

    /// Returns the number of frames in the table.
    pub fn total_frames(&self) -> usize {
        self.total_frames
    }

    /// Returns the number of currently free frames.
    pub fn free_frames(&self) -> usize {
        self.inner.lock().entries.iter().filter(|e| e.free).count()
    }

    /// Returns the physical base address of the frame at `index`.
    pub fn frame_address(&self, index: usize) -> PhysicalAddress {
        assert!(index < self.total_frames);
        self.base + index * PAGE_SIZE
    }

    /// Returns a read-only snapshot of every entry, in table order.
    pub fn snapshot(&self) -> Vec<FrameSnapshot> {
        self.inner
            .lock()
            .entries
            .iter()
            .map(|e| FrameSnapshot {
                base: e.base,
                owner: e
                    .owner
                    .as_ref()
                    .and_then(|w| w.upgrade())
                    .map(|shared| shared.id()),
                vaddr: e.vaddr,
                free: e.free,
                pinned: e.pinned,
                referenced: e.referenced,
                dirty: e.dirty,
                valid: e.valid,
            })
            .collect()
    }

    /// Acquires a frame for `vaddr` in `owner`, evicting if necessary.
    ///
    /// The free-entry scan, victim selection, victim invalidation, and claim
    /// are one critical section. If the chosen victim was dirty, the grant
    /// carries a copy of its bytes and the caller must write them to the
    /// victim owner's swap store after this call returns, so the I/O never
    /// happens under the frame lock.
    pub(crate) fn allocate(
        &self,
        owner: &Arc<AsShared>,
        vaddr: VirtualAddress,
        task: Option<TaskId>,
    ) -> Result<FrameGrant, VmError> {
        self.allocate_inner(owner, vaddr, task, true)
    }

    /// Acquires a free frame for `vaddr` in `owner`, never evicting.
    ///
    /// Used by address space duplication, which must not disturb any
    /// resident page while it copies. Fails with [`VmError::OutOfFrames`]
    /// when no frame is free.
    pub(crate) fn allocate_free_only(
        &self,
        owner: &Arc<AsShared>,
        vaddr: VirtualAddress,
        task: Option<TaskId>,
    ) -> Result<FrameGrant, VmError> {
        self.allocate_inner(owner, vaddr, task, false)
    }

    fn allocate_inner(
        &self,
        owner: &Arc<AsShared>,
        vaddr: VirtualAddress,
        task: Option<TaskId>,
        may_evict: bool,
    ) -> Result<FrameGrant, VmError> {
        let mut inner = self.inner.lock();

        if let Some(index) = inner.entries.iter().position(|e| e.free) {
            inner.claim(index, owner, vaddr, task);
            return Ok(FrameGrant {
                paddr: self.frame_address(index),
                fast: true,
                evicted: None,
            });
        }

        if !may_evict {
            return Err(VmError::OutOfFrames);
        }

        let victim = self
            .policy
            .select(&inner.entries)
            .ok_or(VmError::OutOfFrames)?;

        let (ev_owner, ev_vaddr, ev_dirty) = {
            let entry = &inner.entries[victim];
            debug_assert!(!entry.free && !entry.pinned);
            let weak = entry
                .owner
                .clone()
                .expect("occupied frame entry has no owner");
            (weak, entry.vaddr, entry.dirty)
        };

        let data = if ev_dirty {
            let start = victim * PAGE_SIZE;
            Some(Box::<[u8]>::from(&inner.storage[start..start + PAGE_SIZE]))
        } else {
            None
        };

        // Mark the victim's page non-resident inside this critical section,
        // so its owner cannot take the resident fast path against a frame
        // that is being reassigned.
        if let Some(victim_space) = ev_owner.upgrade() {
            if let Some(pte) = victim_space.page_table().lock().find_mut(ev_vaddr) {
                pte.clear_resident();
            }
        }
        log::debug!(
            "frame table: evicting {ev_vaddr} from frame {} (dirty: {ev_dirty})",
            self.frame_address(victim)
        );

        inner.claim(victim, owner, vaddr, task);
        Ok(FrameGrant {
            paddr: self.frame_address(victim),
            fast: false,
            evicted: Some(EvictedPage {
                owner: ev_owner,
                vaddr: ev_vaddr,
                data,
            }),
        })
    }

    /// Publishes `paddr` as backing `vaddr` in `owner`: updates the entry's
    /// owner, backing address, validity, and dirty state, sets the reference
    /// bit, and drops the claim pin.
    ///
    /// Returns false if the entry is no longer associated with
    /// `(owner, vaddr)`: the resident fast path can lose a race with an
    /// eviction, in which case the caller retries the fault.
    ///
    /// # Panics
    ///
    /// Panics if no entry matches `paddr`; that is frame table corruption
    /// and retrying cannot fix a corrupted table.
    pub(crate) fn bind(
        &self,
        paddr: PhysicalAddress,
        owner: &Arc<AsShared>,
        vaddr: VirtualAddress,
        valid: bool,
        dirty: bool,
        task: Option<TaskId>,
    ) -> bool {
        let index = self.index_of(paddr);
        let mut inner = self.inner.lock();
        let entry = &mut inner.entries[index];

        if entry.free || !entry.owner_matches(owner) || entry.vaddr != vaddr {
            return false;
        }
        entry.task = task;
        entry.valid = valid;
        entry.dirty = dirty;
        entry.referenced = true;
        entry.pinned = false;
        true
    }

    /// Abandons a claim taken by `allocate`, returning the frame to the free
    /// pool. Used when a fault unwinds after an I/O failure.
    pub(crate) fn release_claim(&self, paddr: PhysicalAddress) {
        let index = self.index_of(paddr);
        let mut inner = self.inner.lock();
        debug_assert!(inner.entries[index].pinned);
        inner.entries[index].reset();
    }

    /// Puts an evicted page back: rebinds the frame to its previous owner
    /// and re-marks the owner's page table entry resident. Used when the
    /// victim's dirty write-back fails: the bytes are still in the frame,
    /// so the victim can be restored instead of lost.
    pub(crate) fn restore_victim(&self, paddr: PhysicalAddress, evicted: &EvictedPage) {
        let index = self.index_of(paddr);
        let dirty = evicted.data.is_some();
        let mut inner = self.inner.lock();

        let entry = &mut inner.entries[index];
        entry.owner = Some(evicted.owner.clone());
        entry.vaddr = evicted.vaddr;
        entry.task = None;
        entry.free = false;
        entry.pinned = false;
        entry.referenced = false;
        entry.dirty = dirty;
        entry.valid = true;

        if let Some(victim_space) = evicted.owner.upgrade() {
            if let Some(pte) = victim_space.page_table().lock().find_mut(evicted.vaddr) {
                pte.set_resident(paddr);
                if dirty {
                    pte.touch(true);
                }
            }
        }
    }

    /// Frees every frame owned by `owner`. Called on address space teardown;
    /// the caller guarantees no fault for `owner` is in flight.
    pub(crate) fn release_owned_by(&self, owner: &Arc<AsShared>) {
        let mut inner = self.inner.lock();
        let mut released = 0usize;
        for entry in inner.entries.iter_mut() {
            if entry.owner_matches(owner) {
                entry.reset();
                released += 1;
            }
        }
        log::trace!("frame table: released {released} frames owned by {}", owner.id());
    }

    /// Clears every entry's reference bit in one pass. Invoked only by the
    /// aging driver; a frame becomes eviction-eligible once it survives a
    /// clear without being touched again.
    pub fn clear_all_reference_bits(&self) {
        let mut inner = self.inner.lock();
        for entry in inner.entries.iter_mut() {
            entry.referenced = false;
        }
    }

    /// Copies `bytes` into the frame at `paddr`, zeroing the remainder of
    /// the page so no previous occupant's bytes survive.
    pub(crate) fn copy_into_frame(&self, paddr: PhysicalAddress, bytes: &[u8]) {
        assert!(bytes.len() <= PAGE_SIZE);
        let start = self.index_of(paddr) * PAGE_SIZE;
        let mut inner = self.inner.lock();
        inner.storage[start..start + bytes.len()].copy_from_slice(bytes);
        inner.storage[start + bytes.len()..start + PAGE_SIZE].fill(0);
    }

    /// Copies the frame at `paddr` into `buf`.
    pub(crate) fn copy_out_frame(&self, paddr: PhysicalAddress, buf: &mut [u8]) {
        assert!(buf.len() <= PAGE_SIZE);
        let start = self.index_of(paddr) * PAGE_SIZE;
        let inner = self.inner.lock();
        buf.copy_from_slice(&inner.storage[start..start + buf.len()]);
    }

    /// Copies one frame's contents to another. Used by duplication.
    pub(crate) fn copy_frame_to_frame(&self, src: PhysicalAddress, dst: PhysicalAddress) {
        let src_start = self.index_of(src) * PAGE_SIZE;
        let dst_start = self.index_of(dst) * PAGE_SIZE;
        let mut inner = self.inner.lock();
        inner
            .storage
            .copy_within(src_start..src_start + PAGE_SIZE, dst_start);
    }

    /// Maps a physical address back to its table index.
    ///
    /// # Panics
    ///
    /// Panics when `paddr` does not name a frame in this table.
    fn index_of(&self, paddr: PhysicalAddress) -> usize {
        let end = self.base + self.total_frames * PAGE_SIZE;
        if paddr < self.base || paddr >= end || !paddr.is_page_aligned() {
            panic!("frame table corruption: no entry for {paddr}");
        }
        (paddr - self.base) / PAGE_SIZE
    }
}
