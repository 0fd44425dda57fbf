//! Per-cycle telemetry.
//!
//! The engine builds one [`TelemetryRecord`] per control cycle and hands it
//! to a [`TelemetrySink`] by value. Sinks run on the control thread and must
//! return quickly; anything slow belongs behind a [`ChannelSink`].

use crate::types::{AxisGroup, Correction, GroupState, Measurement, Offset2, RoiId, StagePosition};
use crossbeam_channel::{Sender, TrySendError};
use serde::Serialize;
use std::io::Write;
use tracing::warn;

/// Measurement of one ROI in one cycle.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RoiSample {
    pub id: RoiId,
    /// Fitted spot center, or why there is none.
    pub measurement: Measurement,
    /// Shift from the reference position, pixels.
    pub shift_px: Option<Offset2>,
}

/// Everything observable about a single control cycle.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct TelemetryRecord {
    /// Monotonic cycle counter since the engine started.
    pub cycle: u64,
    /// POSIX seconds at frame acquisition.
    pub timestamp: f64,
    pub xy_state: GroupState,
    pub z_state: GroupState,
    /// XY fiducial samples, in snapshot order. Empty while XY is idle.
    pub xy: Vec<RoiSample>,
    /// Axial spot sample. `None` while Z is idle.
    pub z: Option<RoiSample>,
    /// Controller output after the safety clamp, nm. Computed for every
    /// engaged group, locked or not.
    pub correction: Correction,
    /// Part of `correction` sent to the stage this cycle: the axes of
    /// locked groups whose command succeeded.
    pub applied: Correction,
    /// Stage target after this cycle's command, if any group is locked.
    pub stage: Option<StagePosition>,
}

impl TelemetryRecord {
    pub fn state(&self, group: AxisGroup) -> GroupState {
        match group {
            AxisGroup::Xy => self.xy_state,
            AxisGroup::Z => self.z_state,
        }
    }

    /// Number of ROIs with a successful fit this cycle.
    pub fn valid_fits(&self) -> usize {
        self.xy
            .iter()
            .chain(self.z.iter())
            .filter(|s| s.measurement.is_ok())
            .count()
    }
}

/// Consumer of telemetry records.
pub trait TelemetrySink: Send {
    fn publish(&mut self, record: TelemetryRecord);
}

impl<F> TelemetrySink for F
where
    F: FnMut(TelemetryRecord) + Send,
{
    fn publish(&mut self, record: TelemetryRecord) {
        self(record)
    }
}

/// Discards every record.
#[derive(Debug, Default)]
pub struct NullSink;

impl TelemetrySink for NullSink {
    fn publish(&mut self, _record: TelemetryRecord) {}
}

/// Enqueue-and-return sink. Records are dropped when the receiver lags.
#[derive(Debug)]
pub struct ChannelSink {
    tx: Sender<TelemetryRecord>,
    dropped: u64,
}

impl ChannelSink {
    pub fn new(tx: Sender<TelemetryRecord>) -> Self {
        Self { tx, dropped: 0 }
    }

    pub fn dropped(&self) -> u64 {
        self.dropped
    }
}

impl TelemetrySink for ChannelSink {
    fn publish(&mut self, record: TelemetryRecord) {
        match self.tx.try_send(record) {
            Ok(()) => {}
            Err(TrySendError::Full(_)) => {
                self.dropped += 1;
                if self.dropped.is_power_of_two() {
                    warn!(dropped = self.dropped, "Telemetry receiver lagging, records dropped");
                }
            }
            Err(TrySendError::Disconnected(_)) => {
                self.dropped += 1;
            }
        }
    }
}

/// Writes each record as one JSON object per line.
pub struct JsonLinesSink<W: Write + Send> {
    out: W,
    failed: bool,
}

impl<W: Write + Send> JsonLinesSink<W> {
    pub fn new(out: W) -> Self {
        Self { out, failed: false }
    }

    pub fn into_inner(self) -> W {
        self.out
    }
}

impl<W: Write + Send> TelemetrySink for JsonLinesSink<W> {
    fn publish(&mut self, record: TelemetryRecord) {
        let result = serde_json::to_writer(&mut self.out, &record)
            .map_err(std::io::Error::from)
            .and_then(|()| self.out.write_all(b"\n"));
        match result {
            Ok(()) => self.failed = false,
            Err(e) => {
                // Log once per failure streak.
                if !self.failed {
                    warn!(error = %e, "Telemetry write failed");
                }
                self.failed = true;
            }
        }
    }
}
