//! Tiled volume collection across a full rotation.
//!
//! For each angle, interpolates the expected top and bottom bounding
//! points from the caller-supplied polylines (typically the trace-ellipse
//! output), points a tile workflow at them, and runs it to completion
//! before advancing.

use tracing::info;

use crate::calc;
use crate::core::{CancelToken, Position};
use crate::doc::Workflow;
use crate::error::{Result, SessionError};
use crate::session::Session;

use super::{check_cancel, vet_workflow, FRAMERATE_FPS};

/// Tile overlap written into the collection workflows, percent.
const TILE_OVERLAP_PCT: u32 = 10;

/// Inputs of the multi-angle collection routine.
#[derive(Clone, Debug)]
pub struct MultiAngleParams {
    pub sample_name: String,
    pub angle_step_deg: f64,
    /// Free-text comment stamped into every collection workflow.
    pub comment: String,
    /// `Save image drive` root; the sample name is appended.
    pub save_drive: String,
}

/// Collect a tiled volume at every angle in `[0°, 360°)`.
///
/// `top_points` and `bottom_points` are bounding polylines over one
/// revolution; each angle's volume spans the interpolated pair.
pub fn multi_angle_collect(
    session: &Session,
    token: &CancelToken,
    template: &Workflow,
    params: &MultiAngleParams,
    top_points: &[Position],
    bottom_points: &[Position],
) -> Result<()> {
    if top_points.is_empty() || bottom_points.is_empty() {
        return Err(SessionError::InvalidConfig(
            "multi-angle collection needs non-empty bounding polylines".to_string(),
        ));
    }

    let mut workflow = template.clone();
    workflow.set_tile(TILE_OVERLAP_PCT);
    workflow.set_comment(&params.comment);
    // Forward slashes: the save drive path is interpreted by the
    // controller, which runs Linux.
    let drive = format!(
        "{}/{}",
        params.save_drive.trim_end_matches('/'),
        params.sample_name
    );

    let steps = (360.0 / params.angle_step_deg).floor() as usize;
    info!(sample = %params.sample_name, steps, "multi-angle collection start");
    for i in 0..steps {
        check_cancel(token)?;
        let angle = params.angle_step_deg * i as f64;

        let top = calc::bounding_point_from_angle(top_points, angle)
            .ok_or_else(|| SessionError::InvalidConfig("empty top polyline".to_string()))?;
        let bottom = calc::bounding_point_from_angle(bottom_points, angle)
            .ok_or_else(|| SessionError::InvalidConfig("empty bottom polyline".to_string()))?;

        let z_range_mm = (top.z_mm - bottom.z_mm).abs();
        workflow.set_positions(top, bottom);
        workflow.plan_z_stack(z_range_mm, FRAMERATE_FPS)?;
        workflow.set_save_target(&drive, &format!("{}_{}", params.sample_name, angle as i64));

        vet_workflow(session, &workflow)?;
        info!(angle, z_range_mm, "collecting volume");
        session.run_workflow(&workflow)?;
    }
    info!("multi-angle collection complete");
    Ok(())
}
