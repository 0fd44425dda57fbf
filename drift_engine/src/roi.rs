//! Region tracker: the editable ROI set and the per-group frozen snapshots.
//!
//! A group's ROI list is frozen when tracking engages and stays immutable
//! for the whole session. Edits touching an engaged group are rejected with
//! `RoiEditDeferred` and queued; they are applied when that group next
//! engages.

use crate::error::{Result, StabilizerError};
use drift_common::types::{AxisGroup, Roi, RoiId};
use std::sync::Arc;
use tracing::{debug, info};

/// Smallest usable ROI half size, pixels.
pub const MIN_HALF_SIZE: usize = 2;

/// Largest accepted ROI center coordinate, pixels.
pub const MAX_COORDINATE: usize = 1 << 16;

/// Largest accepted ROI half size, pixels.
pub const MAX_HALF_SIZE: usize = 1 << 12;

/// At most one axial reference spot.
pub const MAX_Z_ROIS: usize = 1;

#[derive(Debug, Clone, PartialEq)]
enum PendingEdit {
    Add(Roi),
    Remove(RoiId),
    Move { id: RoiId, x: usize, y: usize },
}

impl PendingEdit {
    fn describe(&self) -> &'static str {
        match self {
            PendingEdit::Add(_) => "add",
            PendingEdit::Remove(_) => "remove",
            PendingEdit::Move { .. } => "move",
        }
    }
}

#[derive(Debug, Default)]
pub struct RegionTracker {
    /// Editable set, insertion order.
    rois: Vec<Roi>,
    next_id: u32,
    xy_session: Option<Arc<[Roi]>>,
    z_session: Option<Arc<[Roi]>>,
    pending: Vec<(AxisGroup, PendingEdit)>,
}

impl RegionTracker {
    pub fn new() -> Self {
        Self::default()
    }

    fn session(&self, group: AxisGroup) -> &Option<Arc<[Roi]>> {
        match group {
            AxisGroup::Xy => &self.xy_session,
            AxisGroup::Z => &self.z_session,
        }
    }

    fn session_mut(&mut self, group: AxisGroup) -> &mut Option<Arc<[Roi]>> {
        match group {
            AxisGroup::Xy => &mut self.xy_session,
            AxisGroup::Z => &mut self.z_session,
        }
    }

    pub fn is_engaged(&self, group: AxisGroup) -> bool {
        self.session(group).is_some()
    }

    /// Frozen ROI list of an engaged group.
    pub fn active(&self, group: AxisGroup) -> Option<Arc<[Roi]>> {
        self.session(group).clone()
    }

    /// Editable ROIs of a group, pending edits not applied.
    pub fn rois(&self, group: AxisGroup) -> Vec<Roi> {
        self.rois.iter().filter(|r| r.group == group).copied().collect()
    }

    pub fn get(&self, id: RoiId) -> Option<Roi> {
        self.rois.iter().find(|r| r.id == id).copied()
    }

    pub fn pending_edits(&self, group: AxisGroup) -> usize {
        self.pending.iter().filter(|(g, _)| *g == group).count()
    }

    /// Add a ROI. Returns its id; while the group is engaged the id is
    /// reported inside `RoiEditDeferred`.
    pub fn add_roi(&mut self, group: AxisGroup, center_x: usize, center_y: usize, half_size: usize) -> Result<RoiId> {
        if !(MIN_HALF_SIZE..=MAX_HALF_SIZE).contains(&half_size) {
            return Err(StabilizerError::InvalidParameter(format!(
                "ROI half size must be in {MIN_HALF_SIZE}..={MAX_HALF_SIZE}, got {half_size}"
            )));
        }
        check_center(center_x, center_y)?;
        if group == AxisGroup::Z && self.projected_count(AxisGroup::Z) >= MAX_Z_ROIS {
            return Err(StabilizerError::InvalidParameter(
                "only one Z reference ROI is supported".to_string(),
            ));
        }
        let roi = Roi {
            id: RoiId(self.next_id),
            group,
            center_x,
            center_y,
            half_size,
        };
        self.next_id += 1;
        self.apply_or_defer(group, PendingEdit::Add(roi))?;
        Ok(roi.id)
    }

    pub fn remove_roi(&mut self, id: RoiId) -> Result<()> {
        let group = self.group_of(id)?;
        self.apply_or_defer(group, PendingEdit::Remove(id))
    }

    /// Move a ROI center.
    pub fn move_roi(&mut self, id: RoiId, center_x: usize, center_y: usize) -> Result<()> {
        check_center(center_x, center_y)?;
        let group = self.group_of(id)?;
        self.apply_or_defer(
            group,
            PendingEdit::Move {
                id,
                x: center_x,
                y: center_y,
            },
        )
    }

    /// Freeze the group's ROI list for a new tracking session.
    ///
    /// Queued edits for the group are applied first.
    pub fn snapshot(&mut self, group: AxisGroup) -> Arc<[Roi]> {
        let (mine, rest): (Vec<_>, Vec<_>) = std::mem::take(&mut self.pending)
            .into_iter()
            .partition(|(g, _)| *g == group);
        self.pending = rest;
        if !mine.is_empty() {
            info!(%group, edits = mine.len(), "Applying queued ROI edits");
        }
        for (_, edit) in mine {
            self.apply(edit);
        }
        let frozen: Arc<[Roi]> = self.rois(group).into();
        *self.session_mut(group) = Some(frozen.clone());
        debug!(%group, rois = frozen.len(), "ROI snapshot taken");
        frozen
    }

    /// End the group's session. The snapshot is dropped; queued edits stay
    /// queued until the next `snapshot`.
    pub fn release(&mut self, group: AxisGroup) {
        *self.session_mut(group) = None;
    }

    fn group_of(&self, id: RoiId) -> Result<AxisGroup> {
        if let Some(r) = self.get(id) {
            return Ok(r.group);
        }
        // A ROI whose add is still queued can be edited too.
        self.pending
            .iter()
            .find_map(|(g, e)| matches!(e, PendingEdit::Add(r) if r.id == id).then_some(*g))
            .ok_or(StabilizerError::UnknownRoi(id))
    }

    fn projected_count(&self, group: AxisGroup) -> usize {
        let mut n = self.rois.iter().filter(|r| r.group == group).count() as isize;
        for (g, edit) in &self.pending {
            if *g != group {
                continue;
            }
            match edit {
                PendingEdit::Add(_) => n += 1,
                PendingEdit::Remove(_) => n -= 1,
                PendingEdit::Move { .. } => {}
            }
        }
        n.max(0) as usize
    }

    fn apply_or_defer(&mut self, group: AxisGroup, edit: PendingEdit) -> Result<()> {
        if self.is_engaged(group) {
            let roi = match &edit {
                PendingEdit::Add(r) => r.id,
                PendingEdit::Remove(id) | PendingEdit::Move { id, .. } => *id,
            };
            debug!(%group, %roi, edit = edit.describe(), "ROI edit queued");
            self.pending.push((group, edit));
            return Err(StabilizerError::RoiEditDeferred { group, roi });
        }
        self.apply(edit);
        Ok(())
    }

    fn apply(&mut self, edit: PendingEdit) {
        match edit {
            PendingEdit::Add(roi) => self.rois.push(roi),
            PendingEdit::Remove(id) => self.rois.retain(|r| r.id != id),
            PendingEdit::Move { id, x, y } => {
                if let Some(r) = self.rois.iter_mut().find(|r| r.id == id) {
                    r.center_x = x;
                    r.center_y = y;
                }
            }
        }
    }
}

fn check_center(x: usize, y: usize) -> Result<()> {
    if x > MAX_COORDINATE || y > MAX_COORDINATE {
        return Err(StabilizerError::InvalidParameter(format!(
            "ROI center ({x}, {y}) beyond {MAX_COORDINATE} px"
        )));
    }
    Ok(())
}
