//! Control cycle statistics.
//!
//! The loop is paced by frame acquisition, so cycle time is mostly camera
//! time. A cycle longer than the soft budget counts as an overrun and is
//! logged but never treated as a fault.

use std::time::Duration;

// ─── Cycle Statistics ───────────────────────────────────────────────

/// O(1) per-cycle timing statistics.
#[derive(Debug, Clone, PartialEq)]
pub struct CycleStats {
    /// Total cycles executed.
    pub cycle_count: u64,
    /// Last cycle duration [ns].
    pub last_cycle_ns: u64,
    /// Minimum cycle duration [ns].
    pub min_cycle_ns: u64,
    /// Maximum cycle duration [ns].
    pub max_cycle_ns: u64,
    /// Running sum for average computation.
    pub sum_cycle_ns: u128,
    /// Cycles exceeding the soft budget.
    pub overruns: u64,
    /// ROI fits that produced no position.
    pub fit_failures: u64,
    /// Cycles where the camera returned an error instead of a frame.
    pub acquisition_errors: u64,
    /// Stage commands that failed.
    pub actuator_faults: u64,
    /// Panics caught in the controller or the telemetry sink.
    pub callback_panics: u64,
    budget_ns: u64,
}

impl CycleStats {
    pub fn new(budget: Duration) -> Self {
        Self {
            cycle_count: 0,
            last_cycle_ns: 0,
            min_cycle_ns: u64::MAX,
            max_cycle_ns: 0,
            sum_cycle_ns: 0,
            overruns: 0,
            fit_failures: 0,
            acquisition_errors: 0,
            actuator_faults: 0,
            callback_panics: 0,
            budget_ns: budget.as_nanos().min(u64::MAX as u128) as u64,
        }
    }

    /// Record a cycle duration. Returns true on overrun.
    #[inline]
    pub fn record(&mut self, duration: Duration) -> bool {
        let ns = duration.as_nanos().min(u64::MAX as u128) as u64;
        self.cycle_count += 1;
        self.last_cycle_ns = ns;
        self.min_cycle_ns = self.min_cycle_ns.min(ns);
        self.max_cycle_ns = self.max_cycle_ns.max(ns);
        self.sum_cycle_ns += ns as u128;
        let overrun = self.budget_ns > 0 && ns > self.budget_ns;
        if overrun {
            self.overruns += 1;
        }
        overrun
    }

    /// Average cycle time [ns] (0 if no cycles).
    #[inline]
    pub fn avg_cycle_ns(&self) -> u64 {
        if self.cycle_count == 0 {
            0
        } else {
            (self.sum_cycle_ns / self.cycle_count as u128) as u64
        }
    }

    /// Minimum cycle time [ns] (0 if no cycles).
    pub fn min_or_zero_ns(&self) -> u64 {
        if self.cycle_count == 0 { 0 } else { self.min_cycle_ns }
    }
}

impl Default for CycleStats {
    fn default() -> Self {
        Self::new(Duration::ZERO)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_stats() {
        let s = CycleStats::new(Duration::from_millis(50));
        assert_eq!(s.avg_cycle_ns(), 0);
        assert_eq!(s.min_or_zero_ns(), 0);
    }

    #[test]
    fn records_min_max_avg() {
        let mut s = CycleStats::new(Duration::from_millis(50));
        assert!(!s.record(Duration::from_millis(10)));
        assert!(!s.record(Duration::from_millis(30)));
        assert!(s.record(Duration::from_millis(80)));
        assert_eq!(s.cycle_count, 3);
        assert_eq!(s.min_cycle_ns, 10_000_000);
        assert_eq!(s.max_cycle_ns, 80_000_000);
        assert_eq!(s.avg_cycle_ns(), 40_000_000);
        assert_eq!(s.overruns, 1);
    }

    #[test]
    fn zero_budget_never_overruns() {
        let mut s = CycleStats::default();
        assert!(!s.record(Duration::from_secs(5)));
        assert_eq!(s.overruns, 0);
    }
}
