//! The reference-bit aging driver.
//!
//! Victim selection approximates LRU by giving every resident page a
//! reference bit that faults set and a periodic sweep clears. The sweep is
//! driven from the hardware timer interrupt; [`AgingTimer`] divides that
//! tick rate down to the aging cadence so the trap layer stays a one-line
//! caller.

use crate::config::AGING_PERIOD_TICKS;
use crate::vm::Vm;

/// Divides timer ticks down to reference-bit aging passes.
///
/// One of these lives per system, owned by whoever owns the timer handler.
/// Not internally synchronized: timer ticks are inherently serialized on
/// the processor that takes them.
pub struct AgingTimer {
    period: u32,
    ticks: u32,
}

impl AgingTimer {
    /// Creates a timer that ages every [`AGING_PERIOD_TICKS`] ticks.
    pub fn new() -> Self {
        Self::with_period(AGING_PERIOD_TICKS)
    }

    /// Creates a timer with an explicit period.
    ///
    /// # Panics
    ///
    /// Panics if `period` is zero.
    pub fn with_period(period: u32) -> Self {
        assert!(period > 0, "aging period must be at least one tick");
        Self { period, ticks: 0 }
    }

    /// Called from the timer interrupt. Every `period`-th call runs an
    /// aging pass over the frame table; returns true when one ran.
    pub fn on_timer_tick(&mut self, vm: &Vm) -> bool {
        self.ticks += 1;
        if self.ticks < self.period {
            return false;
        }
        self.ticks = 0;
        vm.on_aging_tick();
        true
    }
}

impl Default for AgingTimer {
    fn default() -> Self {
        Self::new()
    }
}
