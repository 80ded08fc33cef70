//! Per-address-space swap storage.
//!
//! Every address space owns one [`SwapStore`]: a slot table mapping virtual
//! pages to fixed offsets in a backing file, plus the file itself. Slot
//! `i` backs exactly one page at byte offset `i * PAGE_SIZE`; no metadata is
//! stored in the file, so the in-memory slot table is authoritative and the
//! file is deleted with the address space.
//!
//! The raw storage layer is a collaborator, reached through the
//! [`SwapVolume`] / [`SwapFile`] traits. An in-memory implementation with
//! fault injection ([`MemSwapVolume`]) is available for hosted runs.

use alloc::boxed::Box;
use alloc::format;
use alloc::string::String;
use alloc::sync::Arc;
use alloc::vec;
use alloc::vec::Vec;

use crate::address::VirtualAddress;
use crate::address_space::AsId;
use crate::config::{PAGE_SIZE, PAGE_TABLE_CAPACITY};
use crate::error::{SwapIoError, VmError};

/// An open swap file supporting positioned reads and writes.
///
/// Both operations return the number of bytes actually transferred; the
/// store treats anything short of the request as an error.
pub trait SwapFile: Send + Sync {
    /// Reads into `buf` starting at `offset`.
    fn read_at(&self, offset: u64, buf: &mut [u8]) -> Result<usize, SwapIoError>;

    /// Writes `buf` starting at `offset`.
    fn write_at(&self, offset: u64, buf: &[u8]) -> Result<usize, SwapIoError>;
}

/// The persistent volume swap files live on.
///
/// Implemented by the kernel's file layer; the store only ever creates one
/// uniquely-named file per address space and removes it on teardown.
pub trait SwapVolume: Send + Sync {
    /// Creates (or truncates) the named file and opens it.
    fn create(&self, name: &str) -> Result<Box<dyn SwapFile>, SwapIoError>;

    /// Removes the named file. Removal of a missing file is not an error.
    fn remove(&self, name: &str);
}

/// Metadata for one swap slot.
///
/// The slot's position in the table determines its file offset. `len` may be
/// shorter than a page at the edges of a region; the bytes past `len` within
/// the slot are never meaningful.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SwapSlot {
    vaddr: VirtualAddress,
    len: usize,
    is_stack: bool,
}

impl SwapSlot {
    /// The page-aligned virtual address this slot backs.
    pub fn vaddr(&self) -> VirtualAddress {
        self.vaddr
    }

    /// Byte length of the live data in this slot.
    pub fn len(&self) -> usize {
        self.len
    }

    /// Returns true if the slot holds no live bytes.
    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Returns true if this slot backs a stack page.
    pub fn is_stack(&self) -> bool {
        self.is_stack
    }
}

/// The swap store for one address space.
pub struct SwapStore {
    name: String,
    volume: Arc<dyn SwapVolume>,
    file: Box<dyn SwapFile>,
    slots: spin::Mutex<Vec<SwapSlot>>,
}

impl SwapStore {
    /// Creates an empty store backed by a fresh file on `volume`.
    ///
    /// The file name is derived from the owning address space's id, which is
    /// unique among live address spaces, so concurrently live stores never
    /// collide.
    pub fn create(volume: Arc<dyn SwapVolume>, owner: AsId) -> Result<Self, VmError> {
        let name = format!("swap.{owner}");
        let file = volume.create(&name)?;
        log::trace!("swap: created {name}");
        Ok(Self {
            name,
            volume,
            file,
            slots: spin::Mutex::new(Vec::new()),
        })
    }

    /// Returns the store's file name.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Returns the volume this store's file lives on.
    pub(crate) fn volume(&self) -> Arc<dyn SwapVolume> {
        Arc::clone(&self.volume)
    }

    /// Returns the number of defined slots.
    pub fn slot_count(&self) -> usize {
        self.slots.lock().len()
    }

    /// Returns a snapshot of the slot table.
    pub fn slots(&self) -> Vec<SwapSlot> {
        self.slots.lock().clone()
    }

    /// Appends a slot backing `vaddr`, in lock-step with the page table.
    ///
    /// Stack slots are zero-filled eagerly so a first-ever fault on a stack
    /// page reads defined data rather than whatever the device held.
    pub fn define_slot(
        &self,
        vaddr: VirtualAddress,
        len: usize,
        is_stack: bool,
    ) -> Result<usize, VmError> {
        debug_assert!(vaddr.is_page_aligned());
        debug_assert!(len <= PAGE_SIZE);

        let index = {
            let mut slots = self.slots.lock();
            if slots.len() >= PAGE_TABLE_CAPACITY {
                return Err(VmError::CapacityExceeded {
                    requested_pages: 1,
                    capacity: PAGE_TABLE_CAPACITY,
                });
            }
            slots.push(SwapSlot {
                vaddr,
                len,
                is_stack,
            });
            slots.len() - 1
        };

        if is_stack {
            let zeros = vec![0u8; PAGE_SIZE];
            self.write_all((index * PAGE_SIZE) as u64, &zeros)?;
        }

        Ok(index)
    }

    /// Reads the slot backing `vaddr` into `buf`, returning the live length.
    ///
    /// # Panics
    ///
    /// Panics if no slot backs `vaddr`. Every fault-capable page has its slot
    /// defined before first execution, so a miss here is a logic error.
    pub fn read_page(&self, vaddr: VirtualAddress, buf: &mut [u8]) -> Result<usize, VmError> {
        let (index, slot) = self.find_slot(vaddr);
        let transferred = self
            .file
            .read_at((index * PAGE_SIZE) as u64, &mut buf[..slot.len])?;
        if transferred != slot.len {
            return Err(SwapIoError::ShortTransfer {
                requested: slot.len,
                transferred,
            }
            .into());
        }
        Ok(slot.len)
    }

    /// Writes `bytes` to the slot backing `vaddr`.
    ///
    /// Only the slot's live length is written; `bytes` must cover it.
    ///
    /// # Panics
    ///
    /// Panics if no slot backs `vaddr` (see [`SwapStore::read_page`]).
    pub fn write_page(&self, vaddr: VirtualAddress, bytes: &[u8]) -> Result<(), VmError> {
        let (index, slot) = self.find_slot(vaddr);
        assert!(
            bytes.len() >= slot.len,
            "swap write of {} bytes into slot of {}",
            bytes.len(),
            slot.len
        );
        self.write_all((index * PAGE_SIZE) as u64, &bytes[..slot.len])
    }

    /// Copies every defined slot, metadata and bytes, into `dst`.
    ///
    /// `dst` must be a freshly created, empty store. Used when duplicating an
    /// address space.
    pub fn clone_into(&self, dst: &SwapStore) -> Result<(), VmError> {
        assert_eq!(dst.slot_count(), 0, "clone target store is not empty");

        let slots = self.slots();
        let mut buf = vec![0u8; PAGE_SIZE];
        for (index, slot) in slots.iter().enumerate() {
            let offset = (index * PAGE_SIZE) as u64;
            let transferred = self.file.read_at(offset, &mut buf[..slot.len])?;
            if transferred != slot.len {
                return Err(SwapIoError::ShortTransfer {
                    requested: slot.len,
                    transferred,
                }
                .into());
            }
            dst.write_all(offset, &buf[..slot.len])?;
        }
        *dst.slots.lock() = slots;
        Ok(())
    }

    /// Writes `bytes` at `offset`, treating a short write as an error.
    fn write_all(&self, offset: u64, bytes: &[u8]) -> Result<(), VmError> {
        let transferred = self.file.write_at(offset, bytes)?;
        if transferred != bytes.len() {
            return Err(SwapIoError::ShortTransfer {
                requested: bytes.len(),
                transferred,
            }
            .into());
        }
        Ok(())
    }

    /// Locates the slot whose page matches `vaddr`.
    fn find_slot(&self, vaddr: VirtualAddress) -> (usize, SwapSlot) {
        let page = vaddr.page_base();
        let slots = self.slots.lock();
        for (index, slot) in slots.iter().enumerate() {
            if slot.vaddr.page_base() == page {
                return (index, *slot);
            }
        }
        panic!("no swap mapping for {page} in {}", self.name);
    }
}

impl Drop for SwapStore {
    fn drop(&mut self) {
        log::trace!("swap: removing {}", self.name);
        self.volume.remove(&self.name);
    }
}

#[cfg(any(test, feature = "software-emulation"))]
mod mem {
    //! In-memory swap volume for hosted runs.

    use alloc::collections::BTreeMap;
    use alloc::string::ToString;
    use core::sync::atomic::{AtomicBool, Ordering};

    use super::*;

    struct VolumeState {
        files: spin::Mutex<BTreeMap<String, Arc<spin::Mutex<Vec<u8>>>>>,
        fail_reads: AtomicBool,
        fail_writes: AtomicBool,
    }

    /// An in-memory [`SwapVolume`].
    ///
    /// Files behave like sparse storage: writes extend them with zeros and
    /// reads past the written length return zeros, matching a preallocated
    /// swap partition. Read and write failures can be injected for testing
    /// the fault handler's error paths.
    pub struct MemSwapVolume {
        state: Arc<VolumeState>,
    }

    impl MemSwapVolume {
        /// Creates an empty volume.
        pub fn new() -> Self {
            Self {
                state: Arc::new(VolumeState {
                    files: spin::Mutex::new(BTreeMap::new()),
                    fail_reads: AtomicBool::new(false),
                    fail_writes: AtomicBool::new(false),
                }),
            }
        }

        /// Makes every subsequent read fail with a device error.
        pub fn set_fail_reads(&self, fail: bool) {
            self.state.fail_reads.store(fail, Ordering::SeqCst);
        }

        /// Makes every subsequent write fail with a device error.
        pub fn set_fail_writes(&self, fail: bool) {
            self.state.fail_writes.store(fail, Ordering::SeqCst);
        }

        /// Returns the names of all live files, in name order.
        pub fn file_names(&self) -> Vec<String> {
            self.state.files.lock().keys().cloned().collect()
        }

        /// Returns the raw contents of the named file, if it exists.
        pub fn file_contents(&self, name: &str) -> Option<Vec<u8>> {
            self.state
                .files
                .lock()
                .get(name)
                .map(|data| data.lock().clone())
        }
    }

    impl Default for MemSwapVolume {
        fn default() -> Self {
            Self::new()
        }
    }

    struct MemSwapFile {
        data: Arc<spin::Mutex<Vec<u8>>>,
        state: Arc<VolumeState>,
    }

    impl SwapFile for MemSwapFile {
        fn read_at(&self, offset: u64, buf: &mut [u8]) -> Result<usize, SwapIoError> {
            if self.state.fail_reads.load(Ordering::SeqCst) {
                return Err(SwapIoError::Device);
            }
            let data = self.data.lock();
            let offset = offset as usize;
            for (i, byte) in buf.iter_mut().enumerate() {
                *byte = data.get(offset + i).copied().unwrap_or(0);
            }
            Ok(buf.len())
        }

        fn write_at(&self, offset: u64, buf: &[u8]) -> Result<usize, SwapIoError> {
            if self.state.fail_writes.load(Ordering::SeqCst) {
                return Err(SwapIoError::Device);
            }
            let mut data = self.data.lock();
            let offset = offset as usize;
            if data.len() < offset + buf.len() {
                data.resize(offset + buf.len(), 0);
            }
            data[offset..offset + buf.len()].copy_from_slice(buf);
            Ok(buf.len())
        }
    }

    impl SwapVolume for MemSwapVolume {
        fn create(&self, name: &str) -> Result<Box<dyn SwapFile>, SwapIoError> {
            let data = Arc::new(spin::Mutex::new(Vec::new()));
            self.state
                .files
                .lock()
                .insert(name.to_string(), Arc::clone(&data));
            Ok(Box::new(MemSwapFile {
                data,
                state: Arc::clone(&self.state),
            }))
        }

        fn remove(&self, name: &str) {
            self.state.files.lock().remove(name);
        }
    }
}

#[cfg(any(test, feature = "software-emulation"))]
pub use mem::MemSwapVolume;

#[cfg(test)]
mod tests {
    use super::*;

    fn test_store(volume: &Arc<MemSwapVolume>) -> SwapStore {
        SwapStore::create(
            Arc::clone(volume) as Arc<dyn SwapVolume>,
            AsId::allocate(),
        )
        .unwrap()
    }

    #[test]
    fn round_trip_preserves_bytes() {
        let volume = Arc::new(MemSwapVolume::new());
        let store = test_store(&volume);
        let vaddr = VirtualAddress::new(0x4000);
        store.define_slot(vaddr, PAGE_SIZE, false).unwrap();

        let written: Vec<u8> = (0..PAGE_SIZE).map(|i| (i % 251) as u8).collect();
        store.write_page(vaddr, &written).unwrap();

        let mut read = vec![0u8; PAGE_SIZE];
        let len = store.read_page(vaddr, &mut read).unwrap();
        assert_eq!(len, PAGE_SIZE);
        assert_eq!(read, written);
    }

    #[test]
    fn sub_page_slot_reads_its_live_length() {
        let volume = Arc::new(MemSwapVolume::new());
        let store = test_store(&volume);
        let vaddr = VirtualAddress::new(0x4000);
        store.define_slot(vaddr, 100, false).unwrap();

        store.write_page(vaddr, &[0xAA; 100]).unwrap();
        let mut buf = vec![0u8; PAGE_SIZE];
        let len = store.read_page(vaddr, &mut buf).unwrap();
        assert_eq!(len, 100);
        assert!(buf[..100].iter().all(|&b| b == 0xAA));
    }

    #[test]
    fn unaligned_fault_address_finds_the_slot() {
        let volume = Arc::new(MemSwapVolume::new());
        let store = test_store(&volume);
        let page = VirtualAddress::new(0x4000);
        store.define_slot(page, PAGE_SIZE, false).unwrap();
        store.write_page(page, &[7u8; PAGE_SIZE]).unwrap();

        let mut buf = vec![0u8; PAGE_SIZE];
        let len = store.read_page(page + 0x123, &mut buf).unwrap();
        assert_eq!(len, PAGE_SIZE);
        assert_eq!(buf[0], 7);
    }

    #[test]
    fn stack_slots_are_zero_filled_at_definition() {
        let volume = Arc::new(MemSwapVolume::new());
        let store = test_store(&volume);
        let vaddr = VirtualAddress::new(0x7000_0000);
        store.define_slot(vaddr, PAGE_SIZE, true).unwrap();

        // A first-ever read must see zeros that were actually written, not
        // sparse-file defaults: the backing file has real length.
        let contents = volume.file_contents(store.name()).unwrap();
        assert_eq!(contents.len(), PAGE_SIZE);
        assert!(contents.iter().all(|&b| b == 0));

        let mut buf = vec![0xFFu8; PAGE_SIZE];
        store.read_page(vaddr, &mut buf).unwrap();
        assert!(buf.iter().all(|&b| b == 0));
    }

    #[test]
    fn slot_offsets_follow_definition_order() {
        let volume = Arc::new(MemSwapVolume::new());
        let store = test_store(&volume);
        let a = VirtualAddress::new(0x1000);
        let b = VirtualAddress::new(0x9000);
        assert_eq!(store.define_slot(a, PAGE_SIZE, false).unwrap(), 0);
        assert_eq!(store.define_slot(b, PAGE_SIZE, false).unwrap(), 1);

        store.write_page(b, &[2u8; PAGE_SIZE]).unwrap();
        let contents = volume.file_contents(store.name()).unwrap();
        // Slot 1 lives at byte offset PAGE_SIZE regardless of its vaddr.
        assert_eq!(contents[PAGE_SIZE], 2);
    }

    #[test]
    fn capacity_is_enforced() {
        let volume = Arc::new(MemSwapVolume::new());
        let store = test_store(&volume);
        for i in 0..PAGE_TABLE_CAPACITY {
            store
                .define_slot(VirtualAddress::new(i * PAGE_SIZE), PAGE_SIZE, false)
                .unwrap();
        }
        let err = store
            .define_slot(
                VirtualAddress::new(PAGE_TABLE_CAPACITY * PAGE_SIZE),
                PAGE_SIZE,
                false,
            )
            .unwrap_err();
        assert!(matches!(err, VmError::CapacityExceeded { .. }));
    }

    #[test]
    #[should_panic(expected = "no swap mapping")]
    fn missing_mapping_is_fatal() {
        let volume = Arc::new(MemSwapVolume::new());
        let store = test_store(&volume);
        let mut buf = vec![0u8; PAGE_SIZE];
        let _ = store.read_page(VirtualAddress::new(0xDEAD_000), &mut buf);
    }

    #[test]
    fn device_errors_propagate() {
        let volume = Arc::new(MemSwapVolume::new());
        let store = test_store(&volume);
        let vaddr = VirtualAddress::new(0x4000);
        store.define_slot(vaddr, PAGE_SIZE, false).unwrap();

        volume.set_fail_writes(true);
        let err = store.write_page(vaddr, &[0u8; PAGE_SIZE]).unwrap_err();
        assert_eq!(err, VmError::Io(SwapIoError::Device));
        volume.set_fail_writes(false);

        volume.set_fail_reads(true);
        let mut buf = vec![0u8; PAGE_SIZE];
        let err = store.read_page(vaddr, &mut buf).unwrap_err();
        assert_eq!(err, VmError::Io(SwapIoError::Device));
    }

    #[test]
    fn stores_get_unique_names() {
        let volume = Arc::new(MemSwapVolume::new());
        let a = test_store(&volume);
        let b = test_store(&volume);
        assert_ne!(a.name(), b.name());
        assert_eq!(volume.file_names().len(), 2);
    }

    #[test]
    fn file_is_removed_on_drop() {
        let volume = Arc::new(MemSwapVolume::new());
        let store = test_store(&volume);
        assert_eq!(volume.file_names().len(), 1);
        drop(store);
        assert!(volume.file_names().is_empty());
    }

    mod clone_into {
        use super::*;

        // Lightly exercised in the original; tested explicitly here rather
        // than assumed correct.

        #[test]
        fn copies_metadata_and_bytes() {
            let volume = Arc::new(MemSwapVolume::new());
            let src = test_store(&volume);
            let a = VirtualAddress::new(0x1000);
            let b = VirtualAddress::new(0x2000);
            src.define_slot(a, PAGE_SIZE, false).unwrap();
            src.define_slot(b, 64, true).unwrap();
            src.write_page(a, &[0x11; PAGE_SIZE]).unwrap();
            src.write_page(b, &[0x22; 64]).unwrap();

            let dst = test_store(&volume);
            src.clone_into(&dst).unwrap();

            assert_eq!(src.slots(), dst.slots());
            let mut buf = vec![0u8; PAGE_SIZE];
            dst.read_page(a, &mut buf).unwrap();
            assert!(buf.iter().all(|&x| x == 0x11));
            let len = dst.read_page(b, &mut buf).unwrap();
            assert_eq!(len, 64);
            assert!(buf[..64].iter().all(|&x| x == 0x22));
        }

        #[test]
        fn source_is_unchanged() {
            let volume = Arc::new(MemSwapVolume::new());
            let src = test_store(&volume);
            let a = VirtualAddress::new(0x1000);
            src.define_slot(a, PAGE_SIZE, false).unwrap();
            src.write_page(a, &[0x33; PAGE_SIZE]).unwrap();
            let before = volume.file_contents(src.name()).unwrap();

            let dst = test_store(&volume);
            src.clone_into(&dst).unwrap();

            assert_eq!(volume.file_contents(src.name()).unwrap(), before);
        }

        #[test]
        #[should_panic(expected = "clone target store is not empty")]
        fn rejects_non_empty_target() {
            let volume = Arc::new(MemSwapVolume::new());
            let src = test_store(&volume);
            let dst = test_store(&volume);
            dst.define_slot(VirtualAddress::new(0x1000), PAGE_SIZE, false)
                .unwrap();
            let _ = src.clone_into(&dst);
        }
    }
}
