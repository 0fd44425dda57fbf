//! In-process telemetry history.
//!
//! Keeps the most recent records for callers inside the process (the
//! calibration routine, tests) and lets them block until a given cycle has
//! been published. The external sink is fed separately.

use drift_common::telemetry::TelemetryRecord;
use parking_lot::{Condvar, Mutex};
use std::collections::VecDeque;
use std::time::{Duration, Instant};

#[derive(Debug)]
struct TapInner {
    history: VecDeque<TelemetryRecord>,
    latest_cycle: u64,
}

#[derive(Debug)]
pub struct TelemetryTap {
    inner: Mutex<TapInner>,
    published: Condvar,
    capacity: usize,
}

impl TelemetryTap {
    pub fn new(capacity: usize) -> Self {
        Self {
            inner: Mutex::new(TapInner {
                history: VecDeque::with_capacity(capacity.max(1)),
                latest_cycle: 0,
            }),
            published: Condvar::new(),
            capacity: capacity.max(1),
        }
    }

    pub fn push(&self, record: TelemetryRecord) {
        let mut inner = self.inner.lock();
        inner.latest_cycle = record.cycle;
        if inner.history.len() == self.capacity {
            inner.history.pop_front();
        }
        inner.history.push_back(record);
        drop(inner);
        self.published.notify_all();
    }

    /// Cycle number of the newest record, 0 before the first.
    pub fn latest_cycle(&self) -> u64 {
        self.inner.lock().latest_cycle
    }

    pub fn latest(&self) -> Option<TelemetryRecord> {
        self.inner.lock().history.back().cloned()
    }

    /// Retained records with `cycle >= from`, oldest first.
    pub fn since(&self, from: u64) -> Vec<TelemetryRecord> {
        self.inner
            .lock()
            .history
            .iter()
            .filter(|r| r.cycle >= from)
            .cloned()
            .collect()
    }

    /// Block until a record with `cycle >= target` exists and return the
    /// oldest such record still retained. `None` on timeout.
    pub fn wait_for(&self, target: u64, timeout: Duration) -> Option<TelemetryRecord> {
        let deadline = Instant::now() + timeout;
        let mut inner = self.inner.lock();
        loop {
            if inner.latest_cycle >= target {
                return inner.history.iter().find(|r| r.cycle >= target).cloned();
            }
            if self.published.wait_until(&mut inner, deadline).timed_out() {
                return None;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use drift_common::types::{Correction, GroupState};
    use std::sync::Arc;

    fn record(cycle: u64) -> TelemetryRecord {
        TelemetryRecord {
            cycle,
            timestamp: cycle as f64,
            xy_state: GroupState::Idle,
            z_state: GroupState::Idle,
            xy: Vec::new(),
            z: None,
            correction: Correction::ZERO,
            applied: Correction::ZERO,
            stage: None,
        }
    }

    #[test]
    fn history_is_bounded() {
        let tap = TelemetryTap::new(3);
        for c in 1..=5 {
            tap.push(record(c));
        }
        assert_eq!(tap.latest_cycle(), 5);
        assert_eq!(tap.since(0).iter().map(|r| r.cycle).collect::<Vec<_>>(), vec![3, 4, 5]);
    }

    #[test]
    fn wait_for_future_cycle() {
        let tap = Arc::new(TelemetryTap::new(8));
        let producer = {
            let tap = tap.clone();
            std::thread::spawn(move || {
                for c in 1..=4 {
                    std::thread::sleep(Duration::from_millis(5));
                    tap.push(record(c));
                }
            })
        };
        let r = tap.wait_for(3, Duration::from_secs(2)).unwrap();
        assert_eq!(r.cycle, 3);
        producer.join().unwrap();
    }

    #[test]
    fn wait_times_out() {
        let tap = TelemetryTap::new(4);
        tap.push(record(1));
        assert!(tap.wait_for(2, Duration::from_millis(20)).is_none());
    }
}
