//! Axis boundary searches shared by locate-sample and trace-ellipse.
//!
//! Each search runs MIP workflows (or snapshots, for X) and feeds the
//! resulting intensity reductions into the peak-bound detector until the
//! specimen's extent along that axis is boxed or the scan range runs out.

use tracing::{debug, info};

use crate::calc;
use crate::core::{Axis, CancelToken, Measurement, Position};
use crate::doc::Workflow;
use crate::error::{Result, SessionError};
use crate::session::Session;

use super::{
    check_cancel, snapshot::take_snapshot, vet_workflow, FRAMERATE_FPS, PEAK_THRESHOLD_PCT,
    X_ROLLING_WINDOW, Z_PEAK_THRESHOLD_PCT,
};

/// Peak bounds in sample units, possibly open-ended.
pub(crate) type OpenBounds = Vec<(Option<usize>, Option<usize>)>;

/// Outcome of the Y scan: pixel bounds over the concatenated tile curve
/// plus the number of tiles acquired.
pub(crate) struct YScan {
    pub bounds: OpenBounds,
    pub tiles: usize,
}

/// Outcome of the Z scan: sub-stack index bounds plus the sub-stack count
/// and depth.
pub(crate) struct ZScan {
    pub bounds: OpenBounds,
    pub loops: u32,
    pub step_depth_mm: f64,
}

/// Number of sub-stacks needed to cover `total_planes` without exceeding
/// the controller's image buffer.
pub(crate) fn substack_count(total_planes: f64, buffer_max_planes: u32) -> u32 {
    ((total_planes / f64::from(buffer_max_planes)).ceil() as u32).max(1)
}

/// Scan along +Y one field of view per step, accumulating the rolling row
/// intensity of each tile's MIP into one long curve, until peak bounds
/// close on both ends or the stage soft limit stops the walk.
pub(crate) fn y_axis_search(
    session: &Session,
    token: &CancelToken,
    workflow: &mut Workflow,
    start: Position,
    z_span: (f64, f64),
    y_move_mm: f64,
    y_max_mm: f64,
    sample_count: usize,
) -> Result<YScan> {
    let (z_start, z_end) = z_span;
    let mut curve: Vec<f64> = Vec::new();
    let mut bounds = OpenBounds::new();
    let mut position = start;
    let mut tiles = 0usize;

    while position.y_mm <= y_max_mm {
        check_cancel(token)?;
        info!(tile = tiles + 1, y_mm = position.y_mm, "Y search tile");

        workflow.set_positions(
            position.with_axis(Axis::Z, z_start),
            position.with_axis(Axis::Z, z_end),
        );
        vet_workflow(session, workflow)?;

        match session.run_workflow_processed(workflow)? {
            Measurement::Intensity { profile, .. } => curve.extend(profile),
            Measurement::FocusPlane(_) => {
                return Err(SessionError::InvalidConfig(
                    "Y search workflow must produce a max projection frame".to_string(),
                ))
            }
        }
        tiles += 1;

        bounds = calc::find_peak_bounds(&curve, sample_count, PEAK_THRESHOLD_PCT);
        if calc::bounds_closed(&bounds) {
            debug!(?bounds, "Y bounds closed");
            break;
        }
        position.y_mm += y_move_mm;
    }

    Ok(YScan { bounds, tiles })
}

/// Sweep the Z search depth in buffer-sized sub-stacks centred on
/// `position`, tracking the MIP brightness of each, until peak bounds
/// close over the sub-stack index axis.
pub(crate) fn z_axis_search(
    session: &Session,
    token: &CancelToken,
    workflow: &mut Workflow,
    position: Position,
    z_center_mm: f64,
    z_search_depth_mm: f64,
) -> Result<ZScan> {
    let spacing_mm = workflow.plane_spacing_mm()?;
    let buffer_max = session.config().buffer_max_planes;
    let total_planes = z_search_depth_mm / spacing_mm;
    let loops = substack_count(total_planes, buffer_max);
    let step_depth_mm = spacing_mm * f64::from(buffer_max);
    workflow.plan_z_stack(step_depth_mm, FRAMERATE_FPS)?;

    info!(loops, step_depth_mm, "Z search start");
    let z_search_start = z_center_mm - z_search_depth_mm / 2.0;
    let mut means: Vec<f64> = Vec::new();
    let mut bounds = OpenBounds::new();

    for i in 0..loops {
        check_cancel(token)?;
        let z_lo = z_search_start + f64::from(i) * step_depth_mm;
        let z_hi = z_lo + step_depth_mm;
        debug!(substack = i, z_lo, z_hi, "Z sub-stack");

        workflow.set_positions(
            position.with_axis(Axis::Z, z_lo),
            position.with_axis(Axis::Z, z_hi),
        );
        vet_workflow(session, workflow)?;

        match session.run_workflow_processed(workflow)? {
            Measurement::Intensity {
                mean_top_quartile, ..
            } => means.push(mean_top_quartile),
            Measurement::FocusPlane(_) => {
                return Err(SessionError::InvalidConfig(
                    "Z search workflow must produce a max projection frame".to_string(),
                ))
            }
        }

        // The detector needs a baseline before a peak means anything.
        if means.len() > 4 {
            bounds = calc::find_peak_bounds(&means, 1, Z_PEAK_THRESHOLD_PCT);
            if calc::bounds_closed(&bounds) {
                debug!(?bounds, "Z bounds closed");
                break;
            }
        }
    }

    Ok(ZScan {
        bounds,
        loops,
        step_depth_mm,
    })
}

/// Outcome of the X centring loop: pixel bounds within the final frame and
/// the X position the stage ended at.
pub(crate) struct XScan {
    pub low_px: usize,
    pub high_px: usize,
    pub x_mm: f64,
}

/// Iterate snapshots at the current Y/Z/R, nudging X toward the intensity
/// peak until the specimen's X extent fits inside the frame (or the
/// stage stops moving meaningfully).
pub(crate) fn x_center_search(
    session: &Session,
    token: &CancelToken,
    template: &Workflow,
    mut position: Position,
    laser_channel: &str,
    laser_power_pct: f64,
) -> Result<XScan> {
    let pixel_mm = session.pixel_size_mm();
    let frame_px = session.frame_size_px() as usize;
    let mut low_px = 0usize;
    let mut high_px = frame_px;
    let mut iterations = 0usize;

    loop {
        check_cancel(token)?;
        iterations += 1;
        let x_before = position.x_mm;

        let frame = take_snapshot(session, template, position, laser_channel, laser_power_pct)?;
        let (_, profile) = calc::rolling_x_intensity(&frame, X_ROLLING_WINDOW);
        let bounds = calc::find_peak_bounds(&profile, 1, PEAK_THRESHOLD_PCT);

        if calc::bounds_closed(&bounds) {
            if let Some(&(Some(lo), Some(hi))) = bounds.first() {
                low_px = lo;
                high_px = hi;
            }
        } else {
            // Peak clipped by the frame edge: walk toward the brightest
            // column and look again.
            let peak_col = profile
                .iter()
                .enumerate()
                .max_by(|a, b| a.1.total_cmp(b.1))
                .map(|(i, _)| i)
                .unwrap_or(frame_px / 2);
            position.x_mm -= (frame_px as f64 / 2.0 - peak_col as f64) * pixel_mm;
            if let Some(clamped) = calc::replace_none(&bounds, frame_px).first() {
                low_px = clamped.0;
                high_px = clamped.1;
            }
        }

        // Converged: the stage barely moved.
        if (x_before - position.x_mm).abs() <= 0.05 {
            debug!(low_px, high_px, x_mm = position.x_mm, "X search converged");
            break;
        }
        // In-frame bounds after a few looks is good enough.
        if iterations >= 5 && low_px > 0 && high_px < frame_px {
            break;
        }
        if iterations >= 20 {
            debug!("X search iteration cap reached");
            break;
        }
    }

    Ok(XScan {
        low_px,
        high_px,
        x_mm: position.x_mm,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_substack_count_rounds_up() {
        assert_eq!(substack_count(200.0, 10), 20);
        assert_eq!(substack_count(21.0, 10), 3);
        assert_eq!(substack_count(20.0, 10), 2);
        assert_eq!(substack_count(3.0, 10), 1);
        assert_eq!(substack_count(0.5, 10), 1);
    }
}
