//! Error types for the microscope session core.
//!
//! Three error families cover the failure taxonomy of the system:
//!
//! - [`ProtocolError`]: the wire said something we cannot parse (bad frame
//!   markers, truncated frames, pixel payloads that do not match their
//!   header). Individually non-fatal to the listeners, but counted; repeated
//!   faults on the command channel escalate to
//!   [`SessionError::ProtocolDesync`].
//! - [`DocError`]: a text document (workflow, scope settings, opcode table)
//!   is malformed or missing required content. Always caller-recoverable.
//! - [`SessionError`]: the umbrella type returned by the public session and
//!   procedure APIs. Wraps the other two plus transport failures, timeouts,
//!   semantic range checks, and cancellation.

use std::time::Duration;

use thiserror::Error;

/// Convenience alias for results using the session error type.
pub type Result<T> = std::result::Result<T, SessionError>;

/// Binary protocol violations on either channel.
#[derive(Error, Debug)]
pub enum ProtocolError {
    #[error("bad frame marker at byte {offset}: expected {expected:#010x}, found {found:#010x}")]
    BadMarker {
        offset: usize,
        expected: u32,
        found: u32,
    },

    #[error("command frame must be exactly 128 bytes, got {0}")]
    ShortFrame(usize),

    #[error("image header must be exactly 40 bytes, got {0}")]
    ShortHeader(usize),

    #[error("image payload of {len} bytes does not match a {width}x{height} 16-bit frame")]
    PayloadMismatch { len: usize, width: u32, height: u32 },
}

/// Errors in the hierarchical `key = value` text documents.
#[derive(Error, Debug)]
pub enum DocError {
    #[error("syntax error at line {line}: {message}")]
    Syntax { line: usize, message: String },

    #[error("missing {0}")]
    Missing(String),

    #[error("bad value for '{key}': {value:?}")]
    BadValue { key: String, value: String },

    #[error("document I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// Top-level error type of the session core.
#[derive(Error, Debug)]
pub enum SessionError {
    #[error("connection to microscope failed: {reason}")]
    ConnectFailed { reason: String },

    #[error("transport error: {0}")]
    Transport(#[from] std::io::Error),

    #[error("command channel lost frame synchronization")]
    ProtocolDesync,

    #[error(transparent)]
    Protocol(#[from] ProtocolError),

    #[error(transparent)]
    Document(#[from] DocError),

    #[error("out of range: {0}")]
    OutOfRange(String),

    #[error("workflow did not complete within {0:?}")]
    WorkflowTimeout(Duration),

    #[error("microscope settings were not received within {0:?}")]
    SettingsTimeout(Duration),

    #[error("stage position query did not complete within {0:?}")]
    PositionQueryTimeout(Duration),

    #[error("operation cancelled")]
    Cancelled,

    #[error("session is closed")]
    Closed,

    #[error("configuration error: {0}")]
    Config(#[from] figment::Error),

    #[error("invalid configuration: {0}")]
    InvalidConfig(String),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let err = SessionError::OutOfRange("Z span exceeds camera buffer".to_string());
        assert_eq!(err.to_string(), "out of range: Z span exceeds camera buffer");
    }

    #[test]
    fn test_protocol_error_wraps_transparently() {
        let err = SessionError::from(ProtocolError::ShortFrame(64));
        assert_eq!(err.to_string(), "command frame must be exactly 128 bytes, got 64");
    }
}
