//! Locate a specimen and box it.
//!
//! Walks down the sample holder in field-of-view steps, boxing the
//! specimen along Y from MIP intensity profiles, then along Z from
//! buffered sub-stacks, then along X from centring snapshots. The two
//! opposite corners land in the per-sample bounds file and the stage is
//! left at the box centre.

use tracing::{debug, info};

use crate::calc;
use crate::core::{Axis, BoundingBox, CancelToken, Position};
use crate::doc::Workflow;
use crate::error::{DocError, Result};
use crate::session::Session;

use super::search::{x_center_search, y_axis_search, z_axis_search};
use super::{check_cancel, snapshot::take_snapshot, write_bounds, FRAMERATE_FPS};

/// Inputs of the locate-sample routine.
#[derive(Clone, Debug)]
pub struct LocateSampleParams {
    pub sample_name: String,
    /// How many distinct specimens the Y scan should try to box.
    pub sample_count: usize,
    /// Tip of the sample holder; the search proceeds in +Y from here.
    pub start: Position,
    /// Total Z range to search, centred on `start.z_mm`.
    pub z_search_depth_mm: f64,
    pub laser_channel: String,
    pub laser_power_pct: f64,
    /// `Save image drive` written into the search workflows.
    pub save_drive: String,
}

/// Find the specimen, write its bounds file, and move to its centre.
///
/// `template` is a stack workflow (typically the instrument's stock
/// Z-stack template); illumination, save target, and geometry are rewritten
/// here. Returns the detected bounding box.
pub fn locate_sample(
    session: &Session,
    token: &CancelToken,
    template: &Workflow,
    params: &LocateSampleParams,
) -> Result<BoundingBox> {
    let pixel_mm = session.pixel_size_mm();
    let frame_px = f64::from(session.frame_size_px());
    let fov_mm = session.fov_mm();
    let y_max = session
        .scope_settings()
        .y_max()
        .ok_or_else(|| DocError::Missing("Stage limits.Soft limit max y-axis".to_string()))?;
    info!(
        sample = %params.sample_name,
        %fov_mm,
        y_max,
        "locating sample"
    );

    session.move_to(params.start)?;

    let mut workflow = template.clone();
    workflow.set_illumination(&params.laser_channel, params.laser_power_pct, true);
    workflow.set_save_target(&params.save_drive, "Sample Search");
    workflow.set_comment("Delete");
    workflow.set_display_max_projection(true);
    workflow.plan_z_stack(params.z_search_depth_mm, FRAMERATE_FPS)?;

    // ---- Y extent ---------------------------------------------------------
    let z_init = params.start.z_mm;
    let z_start = z_init - params.z_search_depth_mm / 2.0;
    let z_end = z_init + params.z_search_depth_mm / 2.0;

    let y_scan = y_axis_search(
        session,
        token,
        &mut workflow,
        params.start,
        (z_start, z_end),
        fov_mm,
        y_max,
        params.sample_count,
    )?;
    let scanned_px = y_scan.tiles * frame_px as usize;
    let (y_low_px, y_high_px) = first_region(&y_scan.bounds, scanned_px);
    let y_top_mm = params.start.y_mm + y_low_px as f64 * pixel_mm;
    let y_bottom_mm = params.start.y_mm + y_high_px as f64 * pixel_mm;
    info!(y_top_mm, y_bottom_mm, "Y bounds detected");

    // Centre the specimen vertically in the field of view.
    let y_centre = (y_top_mm + y_bottom_mm) / 2.0 - frame_px * pixel_mm / 2.0;
    check_cancel(token)?;
    let mut here = params.start.with_axis(Axis::Y, y_centre);
    session.move_to(here)?;

    // ---- Z extent ---------------------------------------------------------
    info!("finding Z bounds");
    let z_scan = z_axis_search(
        session,
        token,
        &mut workflow,
        here,
        z_init,
        params.z_search_depth_mm,
    )?;
    let (z_low_idx, z_high_idx) = first_region(&z_scan.bounds, z_scan.loops as usize);
    let z_search_start = z_init - params.z_search_depth_mm / 2.0;
    let z_top_mm = z_search_start + z_low_idx as f64 * z_scan.step_depth_mm;
    let z_bottom_mm = z_search_start + z_high_idx as f64 * z_scan.step_depth_mm;
    let z_mid_mm = (z_top_mm + z_bottom_mm) / 2.0;
    info!(z_top_mm, z_bottom_mm, "Z bounds detected");

    here = here.with_axis(Axis::Z, z_mid_mm);
    session.move_to(here)?;

    // ---- X extent ---------------------------------------------------------
    info!("finding X bounds");
    let x_scan = x_center_search(
        session,
        token,
        template,
        here,
        &params.laser_channel,
        params.laser_power_pct,
    )?;
    let x_top_mm = x_scan.x_mm + x_scan.low_px as f64 * pixel_mm;
    let x_bottom_mm = x_scan.x_mm + x_scan.high_px as f64 * pixel_mm;
    info!(x_top_mm, x_bottom_mm, "X bounds detected");

    let bounds = BoundingBox::new(
        Position::new(x_top_mm, y_top_mm, z_top_mm, params.start.r_deg),
        Position::new(x_bottom_mm, y_bottom_mm, z_bottom_mm, params.start.r_deg),
    );
    write_bounds(&session.config().bounds_path(&params.sample_name), &bounds)?;
    debug!(?bounds, "bounds file written");

    // Park at the centre and leave a confirmation frame in the preview.
    let centre = calc::find_center(&bounds.a, &bounds.b, frame_px * pixel_mm / 2.0);
    check_cancel(token)?;
    session.move_to(centre)?;
    take_snapshot(
        session,
        template,
        centre,
        &params.laser_channel,
        params.laser_power_pct,
    )?;
    info!(%centre, "sample located");
    Ok(bounds)
}

/// First detected region with open ends clamped to `[0, max]`. An empty
/// detection means the whole scanned range.
fn first_region(bounds: &[(Option<usize>, Option<usize>)], max: usize) -> (usize, usize) {
    calc::replace_none(bounds, max)
        .first()
        .copied()
        .unwrap_or((0, max))
}
