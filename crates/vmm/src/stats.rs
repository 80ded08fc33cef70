//! Paging counters.
//!
//! Cheap enough to keep always-on; read at shutdown or from a diagnostic
//! shell to see how hard the system is paging.

/// A point-in-time copy of the paging counters.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct StatsSnapshot {
    /// Faults taken, of any kind.
    pub tlb_faults: u64,
    /// Faults resolved without I/O because the page was already resident.
    pub resident_hits: u64,
    /// Faults that had to page data in from swap.
    pub page_faults: u64,
    /// Frame allocations satisfied from the free pool.
    pub fast_allocations: u64,
    /// Frame allocations that displaced a resident page.
    pub evictions: u64,
    /// Evictions that required writing the victim to swap.
    pub eviction_writebacks: u64,
}

/// Shared mutable paging counters.
pub struct VmStats {
    inner: spin::Mutex<StatsSnapshot>,
}

impl VmStats {
    pub(crate) fn new() -> Self {
        Self {
            inner: spin::Mutex::new(StatsSnapshot::default()),
        }
    }

    pub(crate) fn record_fault(&self) {
        self.inner.lock().tlb_faults += 1;
    }

    pub(crate) fn record_resident_hit(&self) {
        self.inner.lock().resident_hits += 1;
    }

    pub(crate) fn record_page_fault(&self) {
        self.inner.lock().page_faults += 1;
    }

    pub(crate) fn record_fast_allocation(&self) {
        self.inner.lock().fast_allocations += 1;
    }

    pub(crate) fn record_eviction(&self, wrote_back: bool) {
        let mut stats = self.inner.lock();
        stats.evictions += 1;
        if wrote_back {
            stats.eviction_writebacks += 1;
        }
    }

    /// Returns a copy of the current counters.
    pub fn snapshot(&self) -> StatsSnapshot {
        *self.inner.lock()
    }

    /// Logs a one-line summary of the counters.
    pub fn log_summary(&self) {
        let s = self.snapshot();
        log::info!(
            "vm stats: {} faults ({} resident, {} paged in), {} fast allocations, {} evictions ({} written back)",
            s.tlb_faults,
            s.resident_hits,
            s.page_faults,
            s.fast_allocations,
            s.evictions,
            s.eviction_writebacks,
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn counters_accumulate() {
        let stats = VmStats::new();
        stats.record_fault();
        stats.record_fault();
        stats.record_resident_hit();
        stats.record_page_fault();
        stats.record_fast_allocation();
        stats.record_eviction(false);
        stats.record_eviction(true);

        let s = stats.snapshot();
        assert_eq!(s.tlb_faults, 2);
        assert_eq!(s.resident_hits, 1);
        assert_eq!(s.page_faults, 1);
        assert_eq!(s.fast_allocations, 1);
        assert_eq!(s.evictions, 2);
        assert_eq!(s.eviction_writebacks, 1);
    }

    #[test]
    fn snapshot_is_detached() {
        let stats = VmStats::new();
        let before = stats.snapshot();
        stats.record_fault();
        assert_eq!(before.tlb_faults, 0);
        assert_eq!(stats.snapshot().tlb_faults, 1);
    }
}
