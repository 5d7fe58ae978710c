//! Core data types shared across the session runtime.
//!
//! These are the value types that cross thread and module boundaries:
//! stage coordinates, decoded camera frames, processor outputs, and the
//! cancellation token honoured by the acquisition procedures.

use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use serde::{Deserialize, Serialize};

/// A stage axis. The wire protocol addresses axes through small integer
/// selectors carried in `param0` of a command frame.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Axis {
    X,
    Y,
    Z,
    R,
}

impl Axis {
    /// All axes, in selector order.
    pub const ALL: [Axis; 4] = [Axis::X, Axis::Y, Axis::Z, Axis::R];

    /// The `param0` selector used on stage position commands.
    pub fn selector(self) -> i32 {
        match self {
            Axis::X => 1,
            Axis::Y => 2,
            Axis::Z => 3,
            Axis::R => 4,
        }
    }

    /// Inverse of [`Axis::selector`].
    pub fn from_selector(selector: i32) -> Option<Axis> {
        match selector {
            1 => Some(Axis::X),
            2 => Some(Axis::Y),
            3 => Some(Axis::Z),
            4 => Some(Axis::R),
            _ => None,
        }
    }

    pub(crate) fn index(self) -> usize {
        match self {
            Axis::X => 0,
            Axis::Y => 1,
            Axis::Z => 2,
            Axis::R => 3,
        }
    }
}

impl fmt::Display for Axis {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            Axis::X => "X",
            Axis::Y => "Y",
            Axis::Z => "Z",
            Axis::R => "R",
        };
        f.write_str(label)
    }
}

/// A stage position. X, Y and Z are in millimetres, the rotation axis in
/// degrees.
#[derive(Clone, Copy, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct Position {
    pub x_mm: f64,
    pub y_mm: f64,
    pub z_mm: f64,
    pub r_deg: f64,
}

impl Position {
    pub fn new(x_mm: f64, y_mm: f64, z_mm: f64, r_deg: f64) -> Self {
        Self {
            x_mm,
            y_mm,
            z_mm,
            r_deg,
        }
    }

    /// Value along one axis, in that axis' native unit.
    pub fn axis_value(&self, axis: Axis) -> f64 {
        match axis {
            Axis::X => self.x_mm,
            Axis::Y => self.y_mm,
            Axis::Z => self.z_mm,
            Axis::R => self.r_deg,
        }
    }

    /// Copy of this position with one axis replaced.
    pub fn with_axis(mut self, axis: Axis, value: f64) -> Self {
        match axis {
            Axis::X => self.x_mm = value,
            Axis::Y => self.y_mm = value,
            Axis::Z => self.z_mm = value,
            Axis::R => self.r_deg = value,
        }
        self
    }
}

impl fmt::Display for Position {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "x={:.3}mm y={:.3}mm z={:.3}mm r={:.2}°",
            self.x_mm, self.y_mm, self.z_mm, self.r_deg
        )
    }
}

/// Two opposite corners of the sample envelope at a single rotation angle.
#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize)]
pub struct BoundingBox {
    pub a: Position,
    pub b: Position,
}

impl BoundingBox {
    pub fn new(a: Position, b: Position) -> Self {
        Self { a, b }
    }

    /// Geometric centre of the box. Rotation is taken from corner `a`; both
    /// corners are expected to share it.
    pub fn center(&self) -> Position {
        Position {
            x_mm: (self.a.x_mm + self.b.x_mm) / 2.0,
            y_mm: (self.a.y_mm + self.b.y_mm) / 2.0,
            z_mm: (self.a.z_mm + self.b.z_mm) / 2.0,
            r_deg: self.a.r_deg,
        }
    }
}

/// A single decoded camera frame, 16-bit grayscale, row-major.
///
/// Frames are stored in display orientation: the wire image has already been
/// transposed and flipped by the image channel decoder, so `data[y * width + x]`
/// addresses the pixel at display row `y`, column `x`.
#[derive(Clone, Debug, PartialEq)]
pub struct ImageFrame {
    width: u32,
    height: u32,
    data: Vec<u16>,
}

impl ImageFrame {
    /// Wrap pixel data that is already in display orientation.
    ///
    /// Returns `None` when `data` does not hold exactly `width * height`
    /// pixels.
    pub fn new(width: u32, height: u32, data: Vec<u16>) -> Option<Self> {
        if data.len() != (width as usize) * (height as usize) {
            return None;
        }
        Some(Self {
            width,
            height,
            data,
        })
    }

    pub fn width(&self) -> u32 {
        self.width
    }

    pub fn height(&self) -> u32 {
        self.height
    }

    pub fn pixels(&self) -> &[u16] {
        &self.data
    }

    /// One display row of pixels.
    pub fn row(&self, y: u32) -> &[u16] {
        let w = self.width as usize;
        let start = y as usize * w;
        &self.data[start..start + w]
    }

    /// Pixel at display row `y`, column `x`.
    pub fn get(&self, x: u32, y: u32) -> u16 {
        self.data[y as usize * self.width as usize + x as usize]
    }
}

/// An ordered set of frames acquired as one Z-stack.
#[derive(Clone, Debug, PartialEq)]
pub struct ImageStack {
    planes: Vec<ImageFrame>,
}

impl ImageStack {
    pub fn new(planes: Vec<ImageFrame>) -> Self {
        Self { planes }
    }

    pub fn planes(&self) -> &[ImageFrame] {
        &self.planes
    }

    pub fn len(&self) -> usize {
        self.planes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.planes.is_empty()
    }

    pub fn into_planes(self) -> Vec<ImageFrame> {
        self.planes
    }
}

/// What the image channel delivered for one workflow.
#[derive(Clone, Debug, PartialEq)]
pub enum Acquisition {
    Frame(ImageFrame),
    Stack(ImageStack),
}

/// Outcome of running a workflow to completion.
#[derive(Clone, Debug, PartialEq)]
pub enum WorkflowOutcome {
    /// Image data arrived on the live channel.
    Data(Acquisition),
    /// The controller reported idle without pushing any image data
    /// (save-to-disk workflows with live view disabled).
    Completed,
}

impl WorkflowOutcome {
    /// The acquisition, if any data arrived.
    pub fn into_data(self) -> Option<Acquisition> {
        match self {
            WorkflowOutcome::Data(acquisition) => Some(acquisition),
            WorkflowOutcome::Completed => None,
        }
    }
}

/// A reduction computed by the processor thread from one image-queue item.
#[derive(Clone, Debug, PartialEq)]
pub enum Measurement {
    /// From a 2-D frame: mean of the brightest quartile of pixels plus the
    /// rolling-window Y intensity curve (one sample per display row).
    Intensity {
        mean_top_quartile: f64,
        profile: Vec<f64>,
    },
    /// From a 3-D stack: index of the sharpest plane.
    FocusPlane(usize),
}

/// Cooperative cancellation flag for long-running acquisition procedures.
///
/// Procedures check the token between workflow submissions; a running
/// workflow is never aborted in flight.
#[derive(Clone, Debug, Default)]
pub struct CancelToken {
    cancelled: Arc<AtomicBool>,
}

impl CancelToken {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.cancelled.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancelled.load(Ordering::SeqCst)
    }
}

/// A non-fatal or fatal fault reported by one of the session threads.
///
/// Faults are never swallowed: every listener error lands on the session's
/// diagnostics channel for the host to inspect.
#[derive(Clone, Debug)]
pub struct Diagnostic {
    /// Which thread or component reported the fault.
    pub origin: &'static str,
    pub message: String,
    /// Whether the fault terminated the session runtime.
    pub fatal: bool,
}

impl fmt::Display for Diagnostic {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "[{}] {}{}",
            self.origin,
            self.message,
            if self.fatal { " (fatal)" } else { "" }
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_axis_selector_round_trip() {
        for axis in Axis::ALL {
            assert_eq!(Axis::from_selector(axis.selector()), Some(axis));
        }
        assert_eq!(Axis::from_selector(0), None);
        assert_eq!(Axis::from_selector(5), None);
    }

    #[test]
    fn test_position_axis_access() {
        let pos = Position::new(12.5, 1.737, 13.7, 90.0);
        assert_eq!(pos.axis_value(Axis::X), 12.5);
        assert_eq!(pos.axis_value(Axis::R), 90.0);
        let moved = pos.with_axis(Axis::Y, 2.0);
        assert_eq!(moved.y_mm, 2.0);
        assert_eq!(moved.x_mm, 12.5);
    }

    #[test]
    fn test_bounding_box_center() {
        let bbox = BoundingBox::new(
            Position::new(1.0, 2.0, 3.0, 45.0),
            Position::new(3.0, 6.0, 5.0, 45.0),
        );
        let center = bbox.center();
        assert_eq!(center, Position::new(2.0, 4.0, 4.0, 45.0));
    }

    #[test]
    fn test_image_frame_rejects_mismatched_data() {
        assert!(ImageFrame::new(4, 4, vec![0u16; 15]).is_none());
        let frame = ImageFrame::new(4, 2, vec![0u16; 8]).unwrap();
        assert_eq!(frame.row(1).len(), 4);
    }

    #[test]
    fn test_cancel_token() {
        let token = CancelToken::new();
        let clone = token.clone();
        assert!(!clone.is_cancelled());
        token.cancel();
        assert!(clone.is_cancelled());
    }

    #[test]
    fn test_index_helper_matches_all_order() {
        for (i, axis) in Axis::ALL.iter().enumerate() {
            assert_eq!(axis.index(), i);
        }
    }
}
