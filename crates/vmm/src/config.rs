//! Compile-time tunables for the virtual memory manager.
//!
//! These mirror the constants a port would normally pull from its platform
//! headers. They are collected here so the rest of the crate never hard-codes
//! a page geometry.

/// Size of one page (and one physical frame) in bytes.
pub const PAGE_SIZE: usize = 4096;

/// Maximum number of pages a single address space may define.
///
/// Page table entries and swap slots are created in lock-step, so this is
/// also the capacity of each address space's swap mapping table.
pub const PAGE_TABLE_CAPACITY: usize = 1024;

/// Number of pages reserved for each user stack.
pub const STACK_PAGES: usize = 12;

/// First address above user space. The stack grows downward from here.
pub const USER_TOP: usize = 0x8000_0000;

/// Number of slots in a per-processor translation cache.
///
/// Only used by the software translation cache; hardware ports report their
/// own geometry.
pub const TLB_SLOTS: usize = 64;

/// Default number of timer ticks between reference-bit clears.
///
/// The cadence trades the CPU cost of sweeping the frame table against the
/// accuracy of the recency approximation used for victim selection.
pub const AGING_PERIOD_TICKS: u32 = 10;
