//! The image listener thread: assembles frames and Z-stacks from the live
//! channel.
//!
//! The controller pushes a 40-byte header before every frame but does not
//! say how many frames a stack holds; that plan lives in the active
//! workflow file, which this thread consults per acquisition (the file is
//! the shared contract with the sender; see the session docs). Max
//! projection workflows and single-plane stacks produce one frame;
//! everything else collects `planes` frames into a stack, tolerating a
//! truncated tail when the controller stops sending mid-stack.

use std::io::ErrorKind;
use std::sync::Arc;
use std::time::Duration;

use tracing::{debug, info, warn};

use crate::core::{Acquisition, ImageFrame, ImageStack};
use crate::doc::{PlaneCount, Workflow};
use crate::protocol::image::{decode_frame, ImageHeader};
use crate::protocol::HEADER_LEN;
use crate::session::Shared;
use crate::transport::Channel;

/// How long to wait for the next per-plane header before treating a stack
/// as truncated and emitting what was collected.
const STACK_HEADER_TIMEOUT: Duration = Duration::from_secs(1);

pub(crate) fn run(mut channel: Channel, shared: Arc<Shared>) {
    info!("image listener running");
    loop {
        if shared.events.terminate.is_set() {
            break;
        }

        let mut header_buf = [0u8; HEADER_LEN];
        if let Err(e) = channel.recv_exact(&mut header_buf) {
            if !shared.events.terminate.is_set() {
                shared.diagnose(
                    "image-listener",
                    format!("image socket read failed: {e}"),
                    true,
                );
            }
            break;
        }
        let Ok(header) = ImageHeader::decode(&header_buf) else {
            // decode of a full 40-byte buffer cannot fail on length
            continue;
        };

        if let Err(e) = receive_acquisition(&mut channel, &shared, &header) {
            shared.diagnose(
                "image-listener",
                format!("image reception failed: {e}"),
                true,
            );
            break;
        }
    }
    debug!("image listener exiting");
}

/// What the active workflow says about the acquisition now arriving:
/// `(planes, is_max_projection)`.
fn acquisition_plan(shared: &Shared) -> (u32, bool) {
    let workflow = match Workflow::load_file(&shared.config.active_workflow_path()) {
        Ok(workflow) => workflow,
        Err(e) => {
            shared.diagnose(
                "image-listener",
                format!("cannot read active workflow, assuming single frame: {e}"),
                false,
            );
            return (1, true);
        }
    };
    let mip = workflow.display_max_projection();
    let planes = match workflow.plane_count() {
        Ok(PlaneCount::Planes(n)) => n,
        Ok(PlaneCount::Auto) => {
            let cap = shared.config.plane_count_default;
            warn!(cap, "workflow plane count is 'auto'; using configured cap");
            cap
        }
        Err(e) => {
            shared.diagnose(
                "image-listener",
                format!("bad plane count in active workflow, assuming single frame: {e}"),
                false,
            );
            1
        }
    };
    (planes, mip)
}

fn receive_acquisition(
    channel: &mut Channel,
    shared: &Shared,
    header: &ImageHeader,
) -> std::io::Result<()> {
    let (planes, mip) = acquisition_plan(shared);

    if mip || planes == 1 {
        let frame = read_frame(channel, header)?;
        debug!(
            width = frame.width(),
            height = frame.height(),
            "single frame received"
        );
        push_preview(shared, &frame);
        let _ = shared.queues.image_tx.send(Acquisition::Frame(frame));
        return Ok(());
    }

    let mut collected: Vec<ImageFrame> = Vec::with_capacity(planes as usize);
    let mut current = *header;
    loop {
        let frame = read_frame(channel, &current)?;
        push_preview(shared, &frame);
        collected.push(frame);
        if collected.len() as u32 >= planes {
            break;
        }

        // Frames 2..n are each preceded by their own header.
        let mut header_buf = [0u8; HEADER_LEN];
        match channel.recv_exact_timeout(&mut header_buf, STACK_HEADER_TIMEOUT) {
            Ok(()) => {
                if let Ok(next) = ImageHeader::decode(&header_buf) {
                    current = next;
                }
            }
            Err(e) if e.kind() == ErrorKind::TimedOut => {
                warn!(
                    received = collected.len(),
                    expected = planes,
                    "stack truncated waiting for next plane header"
                );
                break;
            }
            Err(e) => return Err(e),
        }
    }

    debug!(planes = collected.len(), "stack received");
    let _ = shared
        .queues
        .image_tx
        .send(Acquisition::Stack(ImageStack::new(collected)));
    Ok(())
}

fn read_frame(channel: &mut Channel, header: &ImageHeader) -> std::io::Result<ImageFrame> {
    let mut bytes = vec![0u8; header.image_size as usize];
    channel.recv_exact(&mut bytes)?;
    decode_frame(header.image_width, header.image_height, &bytes)
        .map_err(|e| std::io::Error::new(ErrorKind::InvalidData, e))
}

/// Forward the latest frame to the bounded preview queue, dropping the
/// stale one when a consumer has fallen behind.
fn push_preview(shared: &Shared, frame: &ImageFrame) {
    if shared.queues.visualize_tx.try_send(frame.clone()).is_err() {
        let _ = shared.queues.visualize_rx.try_recv();
        let _ = shared.queues.visualize_tx.try_send(frame.clone());
    }
}
