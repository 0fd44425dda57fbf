//! Parallel localization pool.
//!
//! One `submit` call fans the ROI crops of a frame out to N worker threads
//! over a shared job queue and blocks until every result is in or the
//! per-cycle deadline passes. Results come back in submission order.
//!
//! Failure containment:
//! - a fitter error is a per-ROI [`FitFailure`], never an abort
//! - a panicking fitter is caught and reported as `WorkerPanicked`
//! - a missed deadline reports `Timeout` for the missing ROIs only
//! - workers still busy with an earlier cycle are not counted as capacity;
//!   replacements are spawned and the surplus retires once the stuck ones
//!   return

use super::SpotFitter;
use crossbeam_channel::{Receiver, RecvTimeoutError, Sender, unbounded};
use drift_common::error::FitFailure;
use drift_common::types::{AxisGroup, Measurement, Roi, SpotPosition};
use ndarray::{Array2, ArrayView2, s};
use std::panic::{AssertUnwindSafe, catch_unwind};
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::thread::JoinHandle;
use std::time::{Duration, Instant};
use tracing::{debug, error, warn};

/// Upper bound on live threads, as a multiple of the configured worker count.
const MAX_LIVE_FACTOR: usize = 4;

/// Fitter used for each axis group.
#[derive(Clone)]
pub struct FitterSet {
    pub xy: Arc<dyn SpotFitter>,
    pub z: Arc<dyn SpotFitter>,
}

impl FitterSet {
    pub fn for_group(&self, group: AxisGroup) -> &Arc<dyn SpotFitter> {
        match group {
            AxisGroup::Xy => &self.xy,
            AxisGroup::Z => &self.z,
        }
    }
}

impl std::fmt::Debug for FitterSet {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FitterSet")
            .field("xy", &self.xy.name())
            .field("z", &self.z.name())
            .finish()
    }
}

/// Running counters, readable between cycles.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PoolStats {
    pub cycles: u64,
    pub fits_ok: u64,
    pub fit_failures: u64,
    pub timeouts: u64,
    pub panics: u64,
    pub respawns: u64,
    pub unavailable: u64,
}

struct FitJob {
    cycle: u64,
    slot: usize,
    row_origin: usize,
    col_origin: usize,
    crop: Array2<f64>,
    fitter: Arc<dyn SpotFitter>,
}

struct FitResult {
    cycle: u64,
    slot: usize,
    measurement: Measurement,
}

struct PoolShared {
    current_cycle: AtomicU64,
    live: AtomicUsize,
    busy: AtomicUsize,
    target: usize,
}

/// Decrements the live count when a worker exits by any path.
struct LiveGuard {
    shared: Arc<PoolShared>,
    armed: bool,
}

impl Drop for LiveGuard {
    fn drop(&mut self) {
        if self.armed {
            self.shared.live.fetch_sub(1, Ordering::AcqRel);
        }
    }
}

pub struct LocalizationPool {
    job_tx: Option<Sender<FitJob>>,
    job_rx: Receiver<FitJob>,
    result_tx: Sender<FitResult>,
    result_rx: Receiver<FitResult>,
    shared: Arc<PoolShared>,
    handles: Vec<JoinHandle<()>>,
    fitters: FitterSet,
    timeout: Duration,
    cycle: u64,
    next_worker_id: usize,
    stats: PoolStats,
}

impl LocalizationPool {
    /// Start `workers` threads (0 means available parallelism).
    pub fn new(workers: usize, timeout: Duration, fitters: FitterSet) -> Self {
        let target = if workers == 0 {
            std::thread::available_parallelism().map_or(2, |n| n.get())
        } else {
            workers
        };
        let (job_tx, job_rx) = unbounded();
        let (result_tx, result_rx) = unbounded();
        let mut pool = Self {
            job_tx: Some(job_tx),
            job_rx,
            result_tx,
            result_rx,
            shared: Arc::new(PoolShared {
                current_cycle: AtomicU64::new(0),
                live: AtomicUsize::new(0),
                busy: AtomicUsize::new(0),
                target,
            }),
            handles: Vec::with_capacity(target),
            fitters,
            timeout,
            cycle: 0,
            next_worker_id: 0,
            stats: PoolStats::default(),
        };
        for _ in 0..target {
            pool.spawn_worker();
        }
        debug!(workers = target, timeout_ms = timeout.as_millis() as u64, "Localization pool started");
        pool
    }

    pub fn target_workers(&self) -> usize {
        self.shared.target
    }

    pub fn live_workers(&self) -> usize {
        self.shared.live.load(Ordering::Acquire)
    }

    pub fn stats(&self) -> PoolStats {
        self.stats
    }

    pub fn fitters(&self) -> &FitterSet {
        &self.fitters
    }

    /// Localize every ROI in `frame`. One measurement per ROI, in order.
    pub fn submit(&mut self, frame: ArrayView2<'_, u16>, rois: &[Roi]) -> Vec<Measurement> {
        self.cycle += 1;
        let cycle = self.cycle;
        self.stats.cycles += 1;
        self.shared.current_cycle.store(cycle, Ordering::Release);
        // Late results of earlier cycles.
        while self.result_rx.try_recv().is_ok() {}

        let have_workers = self.maintain_workers();
        let (rows, cols) = frame.dim();
        let mut out: Vec<Option<Measurement>> = vec![None; rois.len()];
        let mut pending = 0usize;

        for (slot, roi) in rois.iter().enumerate() {
            let Some(b) = roi.crop_bounds(rows, cols) else {
                out[slot] = Some(Err(FitFailure::OutOfBounds));
                continue;
            };
            let sent = have_workers
                && match &self.job_tx {
                    Some(tx) => tx
                        .send(FitJob {
                            cycle,
                            slot,
                            row_origin: b.row_start,
                            col_origin: b.col_start,
                            crop: frame
                                .slice(s![b.row_start..b.row_end, b.col_start..b.col_end])
                                .mapv(f64::from),
                            fitter: self.fitters.for_group(roi.group).clone(),
                        })
                        .is_ok(),
                    None => false,
                };
            if sent {
                pending += 1;
            } else {
                self.stats.unavailable += 1;
                out[slot] = Some(Err(FitFailure::WorkerUnavailable));
            }
        }

        let deadline = Instant::now() + self.timeout;
        while pending > 0 {
            match self.result_rx.recv_deadline(deadline) {
                Ok(r) if r.cycle == cycle => {
                    if let Some(entry) = out.get_mut(r.slot) {
                        if entry.is_none() {
                            *entry = Some(r.measurement);
                            pending -= 1;
                        }
                    }
                }
                Ok(_) => {}
                Err(RecvTimeoutError::Timeout) | Err(RecvTimeoutError::Disconnected) => break,
            }
        }
        if pending > 0 {
            self.stats.timeouts += pending as u64;
            warn!(cycle, missing = pending, "Localization deadline passed");
        }

        out.into_iter()
            .map(|m| {
                let m = m.unwrap_or(Err(FitFailure::Timeout));
                match &m {
                    Ok(_) => self.stats.fits_ok += 1,
                    Err(FitFailure::WorkerPanicked) => {
                        self.stats.panics += 1;
                        self.stats.fit_failures += 1;
                    }
                    Err(e) => {
                        debug!(cycle, reason = %e, "ROI fit failed");
                        self.stats.fit_failures += 1;
                    }
                }
                m
            })
            .collect()
    }

    /// Replace exited workers and those stuck in an earlier cycle.
    ///
    /// Returns false when no worker could be made available.
    fn maintain_workers(&mut self) -> bool {
        self.reap_finished();
        if self.job_tx.is_none() {
            return false;
        }
        let target = self.shared.target;
        let live = self.shared.live.load(Ordering::Acquire);
        let busy = self.shared.busy.load(Ordering::Acquire);
        let mut missing = target.saturating_sub(live.saturating_sub(busy));
        let cap = target * MAX_LIVE_FACTOR;

        while missing > 0 && self.shared.live.load(Ordering::Acquire) < cap {
            if !self.spawn_worker() {
                break;
            }
            self.stats.respawns += 1;
            missing -= 1;
        }
        if missing > 0 {
            warn!(live, busy, target, "Localization pool degraded, worker cap reached");
        } else if busy > 0 {
            warn!(stuck = busy, "Replaced stuck localization workers");
        }
        let live = self.shared.live.load(Ordering::Acquire);
        live > self.shared.busy.load(Ordering::Acquire)
    }

    fn spawn_worker(&mut self) -> bool {
        let id = self.next_worker_id;
        self.next_worker_id += 1;
        let jobs = self.job_rx.clone();
        let results = self.result_tx.clone();
        let shared = self.shared.clone();
        shared.live.fetch_add(1, Ordering::AcqRel);
        let guard = LiveGuard {
            shared: shared.clone(),
            armed: true,
        };

        let spawned = std::thread::Builder::new()
            .name(format!("drift-fit-{id}"))
            .spawn(move || worker_loop(jobs, results, shared, guard));
        match spawned {
            Ok(handle) => {
                self.handles.push(handle);
                true
            }
            Err(e) => {
                // The guard went down with the closure and released its slot.
                error!(error = %e, "Failed to spawn localization worker");
                false
            }
        }
    }

    fn reap_finished(&mut self) {
        let (done, running): (Vec<_>, Vec<_>) = self.handles.drain(..).partition(|h| h.is_finished());
        self.handles = running;
        for handle in done {
            let _ = handle.join();
        }
    }

    /// Stop accepting work and join workers that exit within `grace`.
    /// Workers stuck inside a fit are detached.
    pub fn shutdown(&mut self, grace: Duration) {
        self.job_tx = None;
        let deadline = Instant::now() + grace;
        while self.shared.live.load(Ordering::Acquire) > 0 && Instant::now() < deadline {
            std::thread::sleep(Duration::from_millis(1));
        }
        self.reap_finished();
        if !self.handles.is_empty() {
            warn!(detached = self.handles.len(), "Localization workers still busy at shutdown");
            self.handles.clear();
        }
    }
}

impl Drop for LocalizationPool {
    fn drop(&mut self) {
        if self.job_tx.is_some() {
            self.shutdown(Duration::from_millis(50));
        }
    }
}

fn worker_loop(jobs: Receiver<FitJob>, results: Sender<FitResult>, shared: Arc<PoolShared>, mut guard: LiveGuard) {
    while let Ok(job) = jobs.recv() {
        if job.cycle < shared.current_cycle.load(Ordering::Acquire) {
            continue;
        }
        shared.busy.fetch_add(1, Ordering::AcqRel);
        let outcome = catch_unwind(AssertUnwindSafe(|| job.fitter.fit(job.crop.view())));
        shared.busy.fetch_sub(1, Ordering::AcqRel);

        let measurement = match outcome {
            Ok(Ok(p)) => Ok(SpotPosition {
                x: p.x + job.col_origin as f64,
                y: p.y + job.row_origin as f64,
            }),
            Ok(Err(failure)) => Err(failure),
            Err(_) => Err(FitFailure::WorkerPanicked),
        };
        let sent = results.send(FitResult {
            cycle: job.cycle,
            slot: job.slot,
            measurement,
        });
        if sent.is_err() {
            break;
        }

        // Surplus left over after stuck workers came back: retire one.
        // Workers still inside a fit are not capacity, so their
        // replacements stay.
        let retire = shared
            .live
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |n| {
                let idle = n.saturating_sub(shared.busy.load(Ordering::Acquire));
                (idle > shared.target).then(|| n - 1)
            })
            .is_ok();
        if retire {
            guard.armed = false;
            break;
        }
    }
}
