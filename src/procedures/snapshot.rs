//! Single-frame snapshot acquisition.

use tracing::debug;

use crate::core::{ImageFrame, Position};
use crate::doc::Workflow;
use crate::error::Result;
use crate::session::Session;

use super::{expect_frame, FRAMERATE_FPS, PLANE_SPACING_UM};

/// Take one snapshot at `position` with the given laser line enabled.
///
/// `template` is any stack workflow; it is collapsed to a one-plane MIP
/// job at the target position before submission.
pub fn take_snapshot(
    session: &Session,
    template: &Workflow,
    position: Position,
    laser_channel: &str,
    laser_power_pct: f64,
) -> Result<ImageFrame> {
    let mut workflow = template.clone();
    workflow.snapshot_at(position, FRAMERATE_FPS, PLANE_SPACING_UM);
    workflow.set_illumination(laser_channel, laser_power_pct, true);
    workflow.set_comment("Snapshot");
    debug!(%position, laser_channel, "taking snapshot");
    expect_frame(session.run_workflow(&workflow)?)
}
