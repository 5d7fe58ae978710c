//! The command listener thread: decodes control-channel responses and turns
//! them into in-memory effects.
//!
//! One loop: read exactly 128 bytes, decode, dispatch on the opcode. Every
//! effect is a queue push, an event, or a cache write; the listener never
//! calls back into the session API. Protocol faults are diagnosed with a
//! full hex dump of the offending frame; three consecutive faults mean the
//! stream has lost framing and the session is torn down.

use std::fmt::Write as _;
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::Duration;

use tracing::{debug, info, trace};

use crate::core::Axis;
use crate::protocol::{CommandFrame, FRAME_LEN};
use crate::session::{atomic_write, Shared};
use crate::transport::Channel;

/// Consecutive undecodable frames tolerated before declaring desync.
const MAX_CONSECUTIVE_FAULTS: u32 = 3;

pub(crate) fn run(mut channel: Channel, shared: Arc<Shared>) {
    info!("command listener running");
    let mut consecutive_faults = 0u32;
    let mut unknown_opcodes = 0u64;

    loop {
        if shared.events.terminate.is_set() {
            break;
        }

        let mut buf = [0u8; FRAME_LEN];
        if let Err(e) = channel.recv_exact(&mut buf) {
            if !shared.events.terminate.is_set() {
                shared.diagnose(
                    "command-listener",
                    format!("control socket read failed: {e}"),
                    true,
                );
            }
            break;
        }

        match CommandFrame::decode(&buf) {
            Ok(frame) => {
                consecutive_faults = 0;
                match handle_frame(&mut channel, &shared, &frame) {
                    Ok(known) => {
                        if !known {
                            unknown_opcodes += 1;
                        }
                    }
                    Err(e) => {
                        shared.diagnose(
                            "command-listener",
                            format!("payload read failed: {e}"),
                            true,
                        );
                        break;
                    }
                }
            }
            Err(e) => {
                consecutive_faults += 1;
                shared.protocol_faults.fetch_add(1, Ordering::Relaxed);
                shared.diagnose(
                    "command-listener",
                    format!("protocol fault: {e}; frame: {}", hex_dump(&buf)),
                    false,
                );
                if consecutive_faults >= MAX_CONSECUTIVE_FAULTS {
                    shared.diagnose(
                        "command-listener",
                        format!(
                            "{MAX_CONSECUTIVE_FAULTS} consecutive protocol faults, stream desynchronized"
                        ),
                        true,
                    );
                    break;
                }
            }
        }
    }
    debug!(unknown_opcodes, "command listener exiting");
}

/// Dispatch one decoded frame. Returns whether the opcode was recognized.
fn handle_frame(
    channel: &mut Channel,
    shared: &Shared,
    frame: &CommandFrame,
) -> std::io::Result<bool> {
    let commands = &shared.commands;
    let code = frame.command_code;
    trace!(
        code,
        name = commands.name_of(code).unwrap_or("?"),
        status = frame.status,
        "response frame"
    );

    if code == commands.system_state_idle {
        if frame.status == 1 {
            shared.events.idle.set();
        }
    } else if code == commands.scope_settings {
        // Settings dump follows as payload. Replace the on-disk resource
        // atomically so a blocked load_settings caller sees a full file.
        let payload = read_trailing(channel, frame)?;
        atomic_write(&shared.config.scope_settings_path(), &payload)?;
        debug!(bytes = payload.len(), "settings dump stored");
        shared.events.settings_changed.set();
    } else if code == commands.camera_pixel_fov_get {
        if frame.value > 0.0 {
            let _ = shared.queues.scalar_tx.send(frame.value);
        } else {
            shared.diagnose(
                "command-listener",
                format!("controller reported pixel field of view {}", frame.value),
                false,
            );
        }
    } else if code == commands.camera_image_size_get {
        let _ = shared.queues.scalar_tx.send(f64::from(frame.params[1]));
    } else if code == commands.camera_check_stack {
        let payload = read_trailing(channel, frame)?;
        let _ = shared.queues.blob_tx.send(payload);
    } else if code == commands.stage_position_get {
        match Axis::from_selector(frame.params[0]) {
            Some(axis) => {
                shared.position().update(axis, frame.value);
                shared.events.position_updated.set();
            }
            None => shared.diagnose(
                "command-listener",
                format!("position response with bad axis selector {}", frame.params[0]),
                false,
            ),
        }
    } else if code == commands.stage_motion_stopped {
        if let Some(axis) = Axis::from_selector(frame.params[0]) {
            let _ = shared.queues.motion_tx.send((axis, frame.status != 0));
        }
    } else {
        debug!(code, "unknown opcode in response, ignored");
        return Ok(false);
    }
    Ok(true)
}

/// Read the payload advertised by `additional_data_bytes`. Older firmware
/// omits the length on some responses; fall back to whatever is readable
/// after a short settling delay.
fn read_trailing(channel: &mut Channel, frame: &CommandFrame) -> std::io::Result<Vec<u8>> {
    let mut len = frame.additional_data_bytes as usize;
    if len == 0 {
        std::thread::sleep(Duration::from_millis(50));
        len = channel.bytes_waiting()?;
    }
    let mut payload = vec![0u8; len];
    channel.recv_exact(&mut payload)?;
    Ok(payload)
}

fn hex_dump(bytes: &[u8]) -> String {
    let mut out = String::with_capacity(bytes.len() * 2);
    for byte in bytes {
        let _ = write!(out, "{byte:02x}");
    }
    out
}
