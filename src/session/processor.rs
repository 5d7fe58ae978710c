//! The processor thread: reductions over incoming image data.
//!
//! Armed through the `process` event. When armed, it takes exactly one
//! item from the image queue and publishes a [`Measurement`] on the
//! results queue: an intensity profile for a 2-D frame, the sharpest plane
//! index for a stack. When the event is clear the thread sleeps and the
//! image queue belongs to `run_workflow`'s caller.

use std::sync::Arc;
use std::time::{Duration, Instant};

use tracing::{debug, info, trace};

use crate::calc;
use crate::core::{Acquisition, Measurement};
use crate::session::Shared;

pub(crate) fn run(shared: Arc<Shared>) {
    info!("processor thread running");
    loop {
        if shared.events.terminate.is_set() {
            break;
        }
        if !shared.events.process.wait_timeout(Duration::from_millis(200)) {
            continue;
        }
        if shared.events.terminate.is_set() {
            break;
        }
        shared.events.process.clear();

        // The workflow that will feed this item may still be running; wait
        // up to the same deadline its caller does, so an abandoned arm does
        // not leave the processor holding the image queue forever.
        let deadline = Instant::now() + shared.config.workflow_timeout();
        let acquisition = loop {
            match shared
                .queues
                .image_rx
                .recv_timeout(Duration::from_millis(200))
            {
                Ok(acquisition) => break Some(acquisition),
                Err(_) => {
                    if shared.events.terminate.is_set() || Instant::now() >= deadline {
                        break None;
                    }
                }
            }
        };
        let Some(acquisition) = acquisition else {
            trace!("processor arm expired without image data");
            continue;
        };

        let measurement = reduce(&shared, acquisition);
        let _ = shared.queues.results_tx.send(measurement);
    }
    debug!("processor thread exiting");
}

fn reduce(shared: &Shared, acquisition: Acquisition) -> Measurement {
    match acquisition {
        Acquisition::Frame(frame) => {
            let (mean_top_quartile, profile) =
                calc::rolling_y_intensity(&frame, shared.config.rolling_window_px);
            trace!(mean_top_quartile, rows = profile.len(), "frame reduced");
            Measurement::Intensity {
                mean_top_quartile,
                profile,
            }
        }
        Acquisition::Stack(stack) => {
            let plane = calc::find_most_in_focus_plane(&stack);
            trace!(plane, planes = stack.len(), "stack reduced");
            Measurement::FocusPlane(plane)
        }
    }
}
