//! Wire protocol of the microscope controller.
//!
//! Two binary formats live here: the 128-byte command frame exchanged on
//! the control channel ([`frame`]) and the 40-byte image header pushed on
//! the live channel ([`image`]), plus the firmware opcode table loaded from
//! a text resource ([`commands`]).

pub mod commands;
pub mod frame;
pub mod image;

pub use commands::CommandSet;
pub use frame::{CommandFrame, END_MARKER, FRAME_LEN, START_MARKER};
pub use image::{ImageHeader, HEADER_LEN};
