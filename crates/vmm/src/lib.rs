//! Caldera Virtual Memory Manager
//!
//! Demand paging for the kernel: per-process address spaces whose pages
//! live on swap and are brought into physical frames on first touch, with
//! second-chance eviction when frames run out.
//!
//! The crate is `no_std + alloc` and reaches the machine only through
//! traits: swap storage via [`SwapVolume`]/[`SwapFile`], the processor's
//! translation cache via [`TranslationCache`]. The `software-emulation`
//! feature provides in-memory implementations of both, which is how the
//! crate is developed and tested on a host.
//!
//! The pieces fit together like this:
//!
//! * [`FrameTable`]: the system-wide table of physical frames, their
//!   contents, and the aging bits that drive eviction.
//! * [`AddressSpace`]: a page table plus a private [`SwapStore`], created
//!   per process and torn down with it.
//! * [`Vm`]: the fault handler; owns the frame table and the paging
//!   counters.
//! * [`AgingTimer`]: divides timer ticks down to reference-bit sweeps.

#![cfg_attr(not(any(test, feature = "software-emulation")), no_std)]

extern crate alloc;

mod address;
mod address_space;
mod aging;
pub mod config;
mod error;
mod frame_table;
mod page_table;
mod stats;
mod swap;
mod tlb;
mod vm;

pub use address::{PhysicalAddress, VirtualAddress};
pub use address_space::{AddressSpace, AsId, Permissions};
pub use aging::AgingTimer;
pub use error::{SwapIoError, VmError};
pub use frame_table::{FrameEntry, FrameSnapshot, FrameTable, SecondChance, TaskId, VictimPolicy};
pub use page_table::{PageTable, PageTableEntry};
pub use stats::{StatsSnapshot, VmStats};
pub use swap::{SwapFile, SwapSlot, SwapStore, SwapVolume};
pub use tlb::TranslationCache;
pub use vm::{FaultKind, Vm};

#[cfg(any(test, feature = "software-emulation"))]
pub use swap::MemSwapVolume;
#[cfg(any(test, feature = "software-emulation"))]
pub use tlb::SoftwareTlb;
