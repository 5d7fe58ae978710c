//! The 128-byte command frame.
//!
//! Every message on the control channel is a fixed-layout little-endian
//! frame, optionally followed by `additional_data_bytes` of payload (a
//! serialized workflow, a settings dump). Layout:
//!
//! ```text
//! offset size field
//!      0    4 start marker          0xF321E654
//!      4    4 command code
//!      8    4 status                0 = request
//!     12    4 hardware id
//!     16    4 subsystem id
//!     20    4 client id
//!     24    4 param0               axis selector / enum
//!     28    4 param1
//!     32    4 param2
//!     36    4 cmd bits
//!     40    8 value                IEEE-754 double
//!     48    4 additional data bytes
//!     52   72 reserved             zero-filled on encode
//!    124    4 end marker            0xFEDC4321
//! ```
//!
//! The reserved region carries no meaning to this crate but is retained
//! verbatim on decode so protocol faults can be dumped in full.

use bytes::{Buf, BufMut};

use crate::error::ProtocolError;

/// Wire length of a command frame, excluding any payload.
pub const FRAME_LEN: usize = 128;

/// Length of the reserved region.
pub const RESERVED_LEN: usize = 72;

/// Leading frame marker.
pub const START_MARKER: u32 = 0xF321_E654;

/// Trailing frame marker.
pub const END_MARKER: u32 = 0xFEDC_4321;

/// A decoded command frame.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct CommandFrame {
    pub command_code: u32,
    /// 0 on requests; response frames use it to carry a condition.
    pub status: u32,
    pub hardware_id: u32,
    pub subsystem_id: u32,
    pub client_id: u32,
    /// `param0..param2`; `param0` selects an axis on stage commands.
    pub params: [i32; 3],
    pub cmd_bits: u32,
    pub value: f64,
    /// Advisory length of the payload following this frame on the wire.
    pub additional_data_bytes: u32,
    pub reserved: [u8; RESERVED_LEN],
}

impl Default for CommandFrame {
    fn default() -> Self {
        Self {
            command_code: 0,
            status: 0,
            hardware_id: 0,
            subsystem_id: 0,
            client_id: 0,
            params: [0; 3],
            cmd_bits: 0,
            value: 0.0,
            additional_data_bytes: 0,
            reserved: [0; RESERVED_LEN],
        }
    }
}

impl CommandFrame {
    /// A request frame for `command_code` with all other fields zero.
    pub fn request(command_code: u32) -> Self {
        Self {
            command_code,
            ..Self::default()
        }
    }

    /// A request frame carrying parameters and a value.
    pub fn with_params(command_code: u32, params: [i32; 3], value: f64) -> Self {
        Self {
            command_code,
            params,
            value,
            ..Self::default()
        }
    }

    /// Encode to the 128-byte wire form. The reserved region is written as
    /// zeros; `additional_data_bytes` is taken from the struct.
    pub fn encode(&self) -> [u8; FRAME_LEN] {
        let mut frame = [0u8; FRAME_LEN];
        let mut buf = &mut frame[..];
        buf.put_u32_le(START_MARKER);
        buf.put_u32_le(self.command_code);
        buf.put_u32_le(self.status);
        buf.put_u32_le(self.hardware_id);
        buf.put_u32_le(self.subsystem_id);
        buf.put_u32_le(self.client_id);
        for param in self.params {
            buf.put_i32_le(param);
        }
        buf.put_u32_le(self.cmd_bits);
        buf.put_f64_le(self.value);
        buf.put_u32_le(self.additional_data_bytes);
        buf.put_bytes(0, RESERVED_LEN);
        buf.put_u32_le(END_MARKER);
        frame
    }

    /// Encode with a trailing payload, setting `additional_data_bytes` to
    /// the payload length.
    pub fn encode_with_payload(mut self, payload: &[u8]) -> Vec<u8> {
        self.additional_data_bytes = payload.len() as u32;
        let mut out = Vec::with_capacity(FRAME_LEN + payload.len());
        out.extend_from_slice(&self.encode());
        out.extend_from_slice(payload);
        out
    }

    /// Decode a 128-byte buffer.
    ///
    /// Fails with [`ProtocolError::ShortFrame`] unless the input is exactly
    /// 128 bytes and [`ProtocolError::BadMarker`] when either marker is
    /// wrong. The payload, if any, is *not* consumed here: the caller must
    /// read `additional_data_bytes` further bytes from the same socket
    /// before decoding the next frame.
    pub fn decode(bytes: &[u8]) -> Result<CommandFrame, ProtocolError> {
        if bytes.len() != FRAME_LEN {
            return Err(ProtocolError::ShortFrame(bytes.len()));
        }
        let mut buf = bytes;

        let start = buf.get_u32_le();
        if start != START_MARKER {
            return Err(ProtocolError::BadMarker {
                offset: 0,
                expected: START_MARKER,
                found: start,
            });
        }

        let command_code = buf.get_u32_le();
        let status = buf.get_u32_le();
        let hardware_id = buf.get_u32_le();
        let subsystem_id = buf.get_u32_le();
        let client_id = buf.get_u32_le();
        let params = [buf.get_i32_le(), buf.get_i32_le(), buf.get_i32_le()];
        let cmd_bits = buf.get_u32_le();
        let value = buf.get_f64_le();
        let additional_data_bytes = buf.get_u32_le();
        let mut reserved = [0u8; RESERVED_LEN];
        buf.copy_to_slice(&mut reserved);

        let end = buf.get_u32_le();
        if end != END_MARKER {
            return Err(ProtocolError::BadMarker {
                offset: FRAME_LEN - 4,
                expected: END_MARKER,
                found: end,
            });
        }

        Ok(CommandFrame {
            command_code,
            status,
            hardware_id,
            subsystem_id,
            client_id,
            params,
            cmd_bits,
            value,
            additional_data_bytes,
            reserved,
        })
    }
}
