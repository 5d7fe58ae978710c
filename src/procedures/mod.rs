//! High-level acquisition procedures.
//!
//! These orchestrate the session API: they mutate workflow documents,
//! submit them, block on the result queues, and iterate. Three entry
//! points mirror the operator-facing routines:
//!
//! - [`locate_sample`]: walk down the sample holder and box the specimen
//! - [`trace_ellipse`]: re-box the specimen across a full rotation
//! - [`multi_angle_collect`]: acquire tiled volumes at every angle
//!
//! All procedures take a [`CancelToken`] and honour it between workflow
//! submissions; a workflow already on the controller is never aborted.

pub mod locate_sample;
pub mod multi_angle;
pub mod search;
pub mod snapshot;
pub mod trace_ellipse;

pub use locate_sample::{locate_sample, LocateSampleParams};
pub use multi_angle::{multi_angle_collect, MultiAngleParams};
pub use snapshot::take_snapshot;
pub use trace_ellipse::{trace_ellipse, AngleBounds, TraceEllipseParams};

use std::path::Path;

use tracing::warn;

use crate::calc;
use crate::core::{Acquisition, BoundingBox, CancelToken, ImageFrame, Position, WorkflowOutcome};
use crate::doc::{Section, Workflow};
use crate::error::{DocError, Result, SessionError};
use crate::session::Session;

/// Acquisition frame rate used for generated workflows.
pub(crate) const FRAMERATE_FPS: f64 = 40.0032;

/// Plane spacing for search stacks and snapshots, in micrometres.
pub(crate) const PLANE_SPACING_UM: f64 = 10.0;

/// Rolling window for X intensity profiles; wider than the Y window
/// because columns are noisier on this camera geometry.
pub(crate) const X_ROLLING_WINDOW: usize = 101;

/// Peak threshold for Y and X boundary detection, percent of global max.
pub(crate) const PEAK_THRESHOLD_PCT: f64 = 50.0;

/// Peak threshold for the Z boundary search.
pub(crate) const Z_PEAK_THRESHOLD_PCT: f64 = 30.0;

/// Fail fast with [`SessionError::Cancelled`] when the token has fired.
pub(crate) fn check_cancel(token: &CancelToken) -> Result<()> {
    if token.is_cancelled() {
        return Err(SessionError::Cancelled);
    }
    Ok(())
}

/// Ask the controller to vet a workflow and log its verdict. A missing
/// verdict is tolerated: vetting guards against silent clipping, it is
/// not a precondition.
pub(crate) fn vet_workflow(session: &Session, workflow: &Workflow) -> Result<()> {
    match session.check_stack(workflow) {
        Ok(payload) => {
            let text = String::from_utf8_lossy(&payload);
            if text.contains("hard limit") {
                warn!(verdict = %text.trim(), "controller flagged the workflow");
            }
            Ok(())
        }
        Err(SessionError::WorkflowTimeout(_)) => {
            warn!("no check-stack verdict from controller");
            Ok(())
        }
        Err(e) => Err(e),
    }
}

/// Collapse a workflow outcome into one frame, max-projecting stacks.
/// Workflows that completed without pushing data are a template problem
/// (live view and max projection both disabled).
pub(crate) fn expect_frame(outcome: WorkflowOutcome) -> Result<ImageFrame> {
    match outcome {
        WorkflowOutcome::Data(Acquisition::Frame(frame)) => Ok(frame),
        WorkflowOutcome::Data(Acquisition::Stack(stack)) => {
            calc::max_project(&stack).ok_or_else(|| {
                SessionError::InvalidConfig("workflow produced an empty stack".to_string())
            })
        }
        WorkflowOutcome::Completed => Err(SessionError::InvalidConfig(
            "workflow produced no live image data; enable 'Display max projection'".to_string(),
        )),
    }
}

const BOUNDS_SECTIONS: [&str; 2] = ["bounding box 1", "bounding box 2"];

/// Write a sample bounding box file:
///
/// ```text
/// <bounding box 1>
/// x (mm) = ...
/// y (mm) = ...
/// z (mm) = ...
/// r (°) = ...
/// </bounding box 1>
/// <bounding box 2>
/// ...
/// ```
pub(crate) fn write_bounds(path: &Path, bounds: &BoundingBox) -> Result<()> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent).map_err(DocError::Io)?;
    }
    let mut doc = Section::new();
    for (name, corner) in BOUNDS_SECTIONS.into_iter().zip([bounds.a, bounds.b]) {
        let section = doc.ensure_child(name);
        section.set("x (mm)", format!("{}", corner.x_mm));
        section.set("y (mm)", format!("{}", corner.y_mm));
        section.set("z (mm)", format!("{}", corner.z_mm));
        section.set("r (°)", format!("{}", corner.r_deg));
    }
    let mut file = std::fs::File::create(path).map_err(DocError::Io)?;
    doc.write_to(&mut file).map_err(DocError::Io)?;
    Ok(())
}

/// Read a bounding box file written by [`write_bounds`].
pub(crate) fn read_bounds(path: &Path) -> Result<BoundingBox> {
    let doc = Section::from_reader(std::fs::File::open(path).map_err(DocError::Io)?)?;
    let corner = |name: &str| -> Result<Position> {
        let section = doc
            .child(name)
            .ok_or_else(|| DocError::Missing(format!("section '{name}'")))?;
        Ok(Position {
            x_mm: section.get_f64("x (mm)")?,
            y_mm: section.get_f64("y (mm)")?,
            z_mm: section.get_f64("z (mm)")?,
            r_deg: section.get_f64("r (°)")?,
        })
    };
    Ok(BoundingBox::new(
        corner(BOUNDS_SECTIONS[0])?,
        corner(BOUNDS_SECTIONS[1])?,
    ))
}

/// Write a per-angle point list (`<point 0>`, `<point 1>`, ...).
pub(crate) fn write_points(path: &Path, points: &[Position]) -> Result<()> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent).map_err(DocError::Io)?;
    }
    let mut doc = Section::new();
    for (index, point) in points.iter().enumerate() {
        let section = doc.ensure_child(&format!("point {index}"));
        section.set("x (mm)", format!("{}", point.x_mm));
        section.set("y (mm)", format!("{}", point.y_mm));
        section.set("z (mm)", format!("{}", point.z_mm));
        section.set("r (°)", format!("{}", point.r_deg));
    }
    let mut file = std::fs::File::create(path).map_err(DocError::Io)?;
    doc.write_to(&mut file).map_err(DocError::Io)?;
    Ok(())
}
