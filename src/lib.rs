//! Remote control and acquisition core for Flamingo light-sheet
//! microscopes.
//!
//! This library drives a microscope controller over two TCP sockets: a
//! command channel carrying fixed-layout 128-byte frames and an image
//! channel pushing headers plus 16-bit pixel data. On top of the wire
//! protocol it provides the concurrent session runtime (listener, sender,
//! and processor threads coordinated by queues and events), the
//! hierarchical workflow text format, and the higher-level procedures that
//! search for a specimen and trace its bounding geometry across rotation
//! angles.
//!
//! The GUI, visualization, and export layers are external collaborators:
//! they consume the typed command API of [`session::Session`], the decoded
//! frame stream, and the workflow builder in [`doc::Workflow`].

pub mod calc;
pub mod config;
pub mod core;
pub mod doc;
pub mod error;
pub mod procedures;
pub mod protocol;
pub mod session;
pub mod transport;

pub use crate::config::CoreConfig;
pub use crate::core::{
    Acquisition, Axis, BoundingBox, CancelToken, Diagnostic, ImageFrame, ImageStack, Measurement,
    Position, WorkflowOutcome,
};
pub use crate::doc::{PlaneCount, ScopeSettings, Workflow};
pub use crate::error::{DocError, ProtocolError, Result, SessionError};
pub use crate::session::Session;
