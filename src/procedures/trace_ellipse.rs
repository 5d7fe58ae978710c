//! Trace the specimen's bounding geometry across a full rotation.
//!
//! Starting from the locate-sample bounds file, rotates the sample in
//! fixed angle steps and re-runs the Z and X boundary searches at each
//! angle. The Y extent does not change: the sample rotates around Y.
//! Produces one (top, centre, bottom) triple per angle and saves the top
//! and bottom polylines for multi-angle collection to interpolate.

use tracing::info;

use crate::calc;
use crate::core::{Axis, CancelToken, Position};
use crate::doc::Workflow;
use crate::error::Result;
use crate::session::Session;

use super::search::{x_center_search, z_axis_search};
use super::{check_cancel, read_bounds, write_points, FRAMERATE_FPS};

/// Inputs of the trace-ellipse routine.
#[derive(Clone, Debug)]
pub struct TraceEllipseParams {
    pub sample_name: String,
    pub angle_step_deg: f64,
    pub laser_channel: String,
    pub laser_power_pct: f64,
    pub z_search_depth_mm: f64,
    pub save_drive: String,
}

/// Bounding geometry found at one rotation angle.
#[derive(Clone, Debug, PartialEq)]
pub struct AngleBounds {
    pub angle_deg: f64,
    pub top: Position,
    pub center: Position,
    pub bottom: Position,
}

/// Rotate through `[0°, 360°)` in `angle_step_deg` increments, boxing the
/// specimen at each angle. Returns the per-angle bounds, first entry taken
/// verbatim from the locate-sample output.
pub fn trace_ellipse(
    session: &Session,
    token: &CancelToken,
    template: &Workflow,
    params: &TraceEllipseParams,
) -> Result<Vec<AngleBounds>> {
    let config = session.config();
    let stored = read_bounds(&config.bounds_path(&params.sample_name))?;
    let pixel_mm = session.pixel_size_mm();
    let frame_shift_mm = 0.5 * f64::from(session.frame_size_px()) * pixel_mm;

    // Y does not move during rotation; carry the stored extent through.
    let y_top = stored.a.y_mm;
    let y_bottom = stored.b.y_mm;
    // Centre Z searches on the middle of the stage's Z travel when the
    // dump carries limits, else on the stored box.
    let z_init = session
        .scope_settings()
        .z_midpoint()
        .unwrap_or_else(|| stored.center().z_mm);

    let mut workflow = template.clone();
    workflow.set_illumination(&params.laser_channel, params.laser_power_pct, true);
    workflow.set_save_target(&params.save_drive, "Sample Search");
    workflow.set_comment("Delete");
    workflow.set_display_max_projection(true);
    workflow.plan_z_stack(params.z_search_depth_mm, FRAMERATE_FPS)?;

    let start_center = calc::find_center(&stored.a, &stored.b, frame_shift_mm);
    let mut results = vec![AngleBounds {
        angle_deg: start_center.r_deg,
        top: stored.a,
        center: start_center,
        bottom: stored.b,
    }];

    let steps = (360.0 / params.angle_step_deg).floor() as usize;
    let mut here = start_center;
    for i in 1..steps {
        check_cancel(token)?;
        let angle = start_center.r_deg + params.angle_step_deg * i as f64;
        here = here.with_axis(Axis::R, angle);
        info!(angle, "tracing bounds at angle");

        let (mut top, mut bottom) = find_bounds_at_angle(
            session,
            token,
            template,
            &mut workflow,
            here,
            z_init,
            params,
        )?;
        top.y_mm = y_top;
        bottom.y_mm = y_bottom;

        let center = calc::find_center(&top, &bottom, frame_shift_mm);
        // Keep the specimen centred in X while rotating.
        here.x_mm = center.x_mm;

        results.push(AngleBounds {
            angle_deg: angle,
            top,
            center,
            bottom,
        });
    }

    let sample_dir = config.sample_dir(&params.sample_name);
    let tops: Vec<Position> = results.iter().map(|b| b.top).collect();
    let bottoms: Vec<Position> = results.iter().map(|b| b.bottom).collect();
    write_points(
        &sample_dir.join(format!("top_bounds_{}.txt", params.sample_name)),
        &tops,
    )?;
    write_points(
        &sample_dir.join(format!("bottom_bounds_{}.txt", params.sample_name)),
        &bottoms,
    )?;
    info!(angles = results.len(), "ellipse trace complete");
    Ok(results)
}

/// Z then X search at one angle; Y is left untouched.
fn find_bounds_at_angle(
    session: &Session,
    token: &CancelToken,
    template: &Workflow,
    workflow: &mut Workflow,
    position: Position,
    z_init_mm: f64,
    params: &TraceEllipseParams,
) -> Result<(Position, Position)> {
    let pixel_mm = session.pixel_size_mm();

    let z_scan = z_axis_search(
        session,
        token,
        workflow,
        position,
        z_init_mm,
        params.z_search_depth_mm,
    )?;
    let clamped = calc::replace_none(&z_scan.bounds, z_scan.loops as usize);
    let (z_low_idx, z_high_idx) = clamped.first().copied().unwrap_or((0, z_scan.loops as usize));
    let z_search_start = z_init_mm - params.z_search_depth_mm / 2.0;
    let z_top = z_search_start + z_low_idx as f64 * z_scan.step_depth_mm;
    let z_bottom = z_search_start + z_high_idx as f64 * z_scan.step_depth_mm;
    let z_mid = (z_top + z_bottom) / 2.0;

    let x_scan = x_center_search(
        session,
        token,
        template,
        position.with_axis(Axis::Z, z_mid),
        &params.laser_channel,
        params.laser_power_pct,
    )?;
    let x_top = x_scan.x_mm + x_scan.low_px as f64 * pixel_mm;
    let x_bottom = x_scan.x_mm + x_scan.high_px as f64 * pixel_mm;

    Ok((
        Position::new(x_top, position.y_mm, z_top, position.r_deg),
        Position::new(x_bottom, position.y_mm, z_bottom, position.r_deg),
    ))
}
