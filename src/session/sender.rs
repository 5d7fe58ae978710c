//! The sender thread: serializes outgoing commands onto the control socket.
//!
//! Commands reach the wire strictly in queue order. Workflow-start is the
//! special case: the payload is the active workflow *file* (read as bytes,
//! LF endings preserved; the file is the artifact the controller
//! negotiates against), and after the command is sent the thread gates on
//! the `idle` event so no later command interleaves with a running
//! workflow. If idle stays away the sender re-prods the controller with
//! system-state-get every five seconds; it never times the microscope out
//! on its own. Only the calling procedure decides when to give up.

use std::sync::Arc;
use std::time::{Duration, Instant};

use tracing::{debug, info, warn};

use crate::protocol::CommandFrame;
use crate::session::{Outbound, Shared};
use crate::transport::Channel;

const IDLE_POLL: Duration = Duration::from_millis(100);
const IDLE_PROD_INTERVAL: Duration = Duration::from_secs(5);

pub(crate) fn run(mut channel: Channel, shared: Arc<Shared>) {
    info!("sender thread running");
    loop {
        if shared.events.terminate.is_set() {
            break;
        }
        if !shared.events.send.wait_timeout(Duration::from_millis(200)) {
            continue;
        }

        let outbound = match shared.queues.command_rx.try_recv() {
            Ok(outbound) => outbound,
            Err(_) => {
                shared.events.send.clear();
                // A submit may have enqueued between the failed take and
                // the clear; re-arm so that command is not stranded.
                if !shared.queues.command_rx.is_empty() {
                    shared.events.send.set();
                }
                continue;
            }
        };

        if let Err(e) = dispatch(&mut channel, &shared, outbound) {
            shared.diagnose("sender", format!("control socket write failed: {e}"), true);
            break;
        }
    }
    debug!("sender thread exiting");
}

fn dispatch(
    channel: &mut Channel,
    shared: &Shared,
    outbound: Outbound,
) -> std::io::Result<()> {
    match outbound {
        Outbound::Workflow { ack } => {
            let Some(payload) = read_payload(shared, &shared.config.active_workflow_path()) else {
                drop(ack);
                return Ok(());
            };
            shared.events.idle.clear();
            let wire = CommandFrame::request(shared.commands.workflow_start)
                .encode_with_payload(&payload);
            channel.send_all(&wire)?;
            debug!(payload_bytes = payload.len(), "workflow-start sent");
            if let Some(ack) = ack {
                let _ = ack.send(());
            }
            gate_on_idle(channel, shared)?;
        }
        Outbound::CheckStack { ack } => {
            let Some(payload) = read_payload(shared, &shared.config.active_workflow_path()) else {
                drop(ack);
                return Ok(());
            };
            let wire = CommandFrame::request(shared.commands.camera_check_stack)
                .encode_with_payload(&payload);
            channel.send_all(&wire)?;
            debug!(payload_bytes = payload.len(), "check-stack sent");
            if let Some(ack) = ack {
                let _ = ack.send(());
            }
        }
        Outbound::SaveSettings { ack } => {
            let Some(payload) = read_payload(shared, &shared.config.send_settings_path()) else {
                drop(ack);
                return Ok(());
            };
            let wire = CommandFrame::request(shared.commands.scope_settings_save)
                .encode_with_payload(&payload);
            channel.send_all(&wire)?;
            debug!(payload_bytes = payload.len(), "settings-save sent");
            if let Some(ack) = ack {
                let _ = ack.send(());
            }
        }
        Outbound::Plain {
            code,
            params,
            value,
            ack,
        } => {
            let frame = CommandFrame::with_params(code, params, value);
            channel.send_all(&frame.encode())?;
            debug!(
                code,
                name = shared.commands.name_of(code).unwrap_or("?"),
                "command sent"
            );
            if let Some(ack) = ack {
                let _ = ack.send(());
            }
        }
    }
    Ok(())
}

/// Read a staged payload file. A missing or unreadable file is a caller
/// contract violation, not a transport fault: the command is dropped and
/// diagnosed, the session stays up.
fn read_payload(shared: &Shared, path: &std::path::Path) -> Option<Vec<u8>> {
    match std::fs::read(path) {
        Ok(bytes) => Some(bytes),
        Err(e) => {
            shared.diagnose(
                "sender",
                format!("cannot read payload file {}: {e}", path.display()),
                false,
            );
            None
        }
    }
}

/// Block until the controller reports idle, re-prodding it with
/// system-state-get every [`IDLE_PROD_INTERVAL`].
fn gate_on_idle(channel: &mut Channel, shared: &Shared) -> std::io::Result<()> {
    let mut last_prod = Instant::now();
    loop {
        if shared.events.terminate.is_set() {
            return Ok(());
        }
        if shared.events.idle.wait_timeout(IDLE_POLL) {
            return Ok(());
        }
        if last_prod.elapsed() >= IDLE_PROD_INTERVAL {
            warn!("no idle after workflow-start; sending system-state-get");
            let frame = CommandFrame::request(shared.commands.system_state_get);
            channel.send_all(&frame.encode())?;
            last_prod = Instant::now();
        }
    }
}
