//! The microscope session: sockets, threads, queues, and the typed command
//! API.
//!
//! A [`Session`] owns the two TCP connections to the controller and the
//! four long-running threads that service them:
//!
//! ```text
//! caller ──┬─ command queue ─> sender ───────────> control socket ──> scope
//!          │                                            │
//!          │            command listener <── responses ─┘
//!          │                │  (idle / settings / scalars / positions)
//!          │                v
//!          │   events + scalar/blob/motion queues
//!          │
//!          │   image listener <─────────── image socket <──────────── scope
//!          │        │
//!          │        v
//!          └── image queue ──> processor ──> results queue
//! ```
//!
//! All public calls are serialized through an internal mutex; the session
//! is safe to share behind an `Arc` but callers take turns. Re-entering the
//! API from listener callbacks is impossible by construction (listeners
//! only touch queues and events).

mod command_listener;
mod event;
mod image_listener;
mod processor;
mod sender;

pub use event::Event;

use std::path::Path;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

use crossbeam_channel::{bounded, unbounded, Receiver, RecvTimeoutError, Sender};
use tracing::{debug, error, info, warn};

use crate::config::CoreConfig;
use crate::core::{
    Acquisition, Axis, CancelToken, Diagnostic, ImageFrame, Measurement, Position, WorkflowOutcome,
};
use crate::doc::{PlaneCount, ScopeSettings, Workflow, WorkflowKind};
use crate::error::{Result, SessionError};
use crate::protocol::CommandSet;
use crate::transport::Channel;

/// How long a queued command may wait before its on-wire acknowledgement is
/// treated as a transport fault.
const SEND_ACK_TIMEOUT: Duration = Duration::from_secs(5);

/// Cadence of the motion-stopped poll in `move_to_verified`.
const MOTION_POLL_INTERVAL: Duration = Duration::from_millis(500);

/// A command staged for the sender thread.
pub(crate) enum Outbound {
    /// Send the active workflow file as a workflow-start payload.
    Workflow { ack: Option<Sender<()>> },
    /// Send the active workflow file as a check-stack payload.
    CheckStack { ack: Option<Sender<()>> },
    /// Send the staged settings file as a settings-save payload.
    SaveSettings { ack: Option<Sender<()>> },
    /// Any other opcode, sent with parameters and no payload.
    Plain {
        code: u32,
        params: [i32; 3],
        value: f64,
        ack: Option<Sender<()>>,
    },
}

/// The session's signalling events.
pub(crate) struct Events {
    /// Controller reported system-state-idle.
    pub idle: Event,
    /// The command queue has work for the sender.
    pub send: Event,
    /// The processor should consume the next image-queue item.
    pub process: Event,
    /// Runtime shutdown; all threads drain and exit.
    pub terminate: Event,
    /// A settings payload has been written to disk.
    pub settings_changed: Event,
    /// The position cache gained a fresh axis value.
    pub position_updated: Event,
}

impl Events {
    fn new() -> Self {
        Self {
            idle: Event::new(),
            send: Event::new(),
            process: Event::new(),
            terminate: Event::new(),
            settings_changed: Event::new(),
            position_updated: Event::new(),
        }
    }
}

/// The session's channel-typed queues.
pub(crate) struct Queues {
    pub command_tx: Sender<Outbound>,
    pub command_rx: Receiver<Outbound>,
    pub image_tx: Sender<Acquisition>,
    pub image_rx: Receiver<Acquisition>,
    pub results_tx: Sender<Measurement>,
    pub results_rx: Receiver<Measurement>,
    pub scalar_tx: Sender<f64>,
    pub scalar_rx: Receiver<f64>,
    pub blob_tx: Sender<Vec<u8>>,
    pub blob_rx: Receiver<Vec<u8>>,
    pub motion_tx: Sender<(Axis, bool)>,
    pub motion_rx: Receiver<(Axis, bool)>,
    pub visualize_tx: Sender<ImageFrame>,
    pub visualize_rx: Receiver<ImageFrame>,
    pub diagnostics_tx: Sender<Diagnostic>,
    pub diagnostics_rx: Receiver<Diagnostic>,
}

impl Queues {
    fn new() -> Self {
        let (command_tx, command_rx) = unbounded();
        let (image_tx, image_rx) = unbounded();
        let (results_tx, results_rx) = unbounded();
        let (scalar_tx, scalar_rx) = unbounded();
        let (blob_tx, blob_rx) = unbounded();
        let (motion_tx, motion_rx) = unbounded();
        // Depth one: UI preview consumers only ever want the latest frame.
        let (visualize_tx, visualize_rx) = bounded(1);
        let (diagnostics_tx, diagnostics_rx) = unbounded();
        Self {
            command_tx,
            command_rx,
            image_tx,
            image_rx,
            results_tx,
            results_rx,
            scalar_tx,
            scalar_rx,
            blob_tx,
            blob_rx,
            motion_tx,
            motion_rx,
            visualize_tx,
            visualize_rx,
            diagnostics_tx,
            diagnostics_rx,
        }
    }
}

/// Last-known stage coordinates, fed by stage-position-get responses.
#[derive(Default)]
pub(crate) struct PositionCache {
    values: [Option<f64>; 4],
}

impl PositionCache {
    pub fn update(&mut self, axis: Axis, value: f64) {
        self.values[axis.index()] = Some(value);
    }

    pub fn invalidate(&mut self) {
        self.values = [None; 4];
    }

    pub fn position(&self) -> Option<Position> {
        Some(Position {
            x_mm: self.values[Axis::X.index()]?,
            y_mm: self.values[Axis::Y.index()]?,
            z_mm: self.values[Axis::Z.index()]?,
            r_deg: self.values[Axis::R.index()]?,
        })
    }
}

/// Camera and instrument facts established during `open`.
#[derive(Default)]
pub(crate) struct ScopeMeta {
    pub settings: ScopeSettings,
    /// Size of one image pixel, in millimetres at the sample.
    pub pixel_size_mm: f64,
    /// Side length of a camera frame, in pixels.
    pub frame_size_px: u32,
}

/// State shared between the caller-facing API and the four threads.
pub(crate) struct Shared {
    pub config: CoreConfig,
    pub commands: CommandSet,
    pub events: Events,
    pub queues: Queues,
    pub position: Mutex<PositionCache>,
    pub meta: Mutex<ScopeMeta>,
    /// Count of non-fatal protocol faults observed on the command channel.
    pub protocol_faults: AtomicU64,
}

impl Shared {
    pub(crate) fn meta(&self) -> MutexGuard<'_, ScopeMeta> {
        self.meta.lock().unwrap_or_else(|e| e.into_inner())
    }

    pub(crate) fn position(&self) -> MutexGuard<'_, PositionCache> {
        self.position.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Publish a fault to the diagnostics channel; a fatal fault also tears
    /// the runtime down.
    pub(crate) fn diagnose(&self, origin: &'static str, message: String, fatal: bool) {
        if fatal {
            error!(origin, %message, "fatal session fault");
        } else {
            warn!(origin, %message, "session fault");
        }
        let _ = self.queues.diagnostics_tx.send(Diagnostic {
            origin,
            message,
            fatal,
        });
        if fatal {
            self.events.terminate.set();
        }
    }
}

/// A live connection to a microscope controller.
pub struct Session {
    shared: Arc<Shared>,
    /// Extra socket handles, kept only so `close` can unblock the readers.
    control: Channel,
    image: Channel,
    threads: Mutex<Vec<(&'static str, JoinHandle<()>)>>,
    /// Serializes the public API; one caller at a time.
    api: Mutex<()>,
    closed: AtomicBool,
    cancel: CancelToken,
}

impl Session {
    /// Connect to the controller and bring the runtime up.
    ///
    /// Connects the control socket to `(control_ip, control_port)` and the
    /// image socket to the next port, spawns the listener/sender/processor
    /// threads, performs the settings-load round trip, and queries the
    /// camera geometry. The returned session is ready for workflows.
    pub fn open(config: CoreConfig) -> Result<Session> {
        config.validate()?;
        let commands = CommandSet::load(&config.resolved_command_list_path())?;
        std::fs::create_dir_all(config.workflows_dir())?;
        std::fs::create_dir_all(config.settings_dir())?;

        info!(
            ip = %config.control_ip,
            port = config.control_port,
            "connecting to microscope controller"
        );
        let mut control =
            Channel::connect(&config.control_ip, config.control_port, config.connect_timeout())?;
        let image = Channel::connect(
            &config.control_ip,
            config.control_port + 1,
            config.connect_timeout(),
        )?;

        // Start from a clean control channel; stale bytes from a previous
        // client would break framing immediately.
        control.drain()?;

        let control_read = control.try_clone()?;
        let control_write = control.try_clone()?;
        let image_read = image.try_clone()?;

        let shared = Arc::new(Shared {
            config,
            commands,
            events: Events::new(),
            queues: Queues::new(),
            position: Mutex::new(PositionCache::default()),
            meta: Mutex::new(ScopeMeta::default()),
            protocol_faults: AtomicU64::new(0),
        });
        shared.events.idle.set();

        // Join order on close matters: sender first, processor last.
        let threads = vec![
            (
                "sender",
                spawn("sender", {
                    let shared = Arc::clone(&shared);
                    move || sender::run(control_write, shared)
                })?,
            ),
            (
                "image-listener",
                spawn("image-listener", {
                    let shared = Arc::clone(&shared);
                    move || image_listener::run(image_read, shared)
                })?,
            ),
            (
                "command-listener",
                spawn("command-listener", {
                    let shared = Arc::clone(&shared);
                    move || command_listener::run(control_read, shared)
                })?,
            ),
            (
                "processor",
                spawn("processor", {
                    let shared = Arc::clone(&shared);
                    move || processor::run(shared)
                })?,
            ),
        ];

        let session = Session {
            shared,
            control,
            image,
            threads: Mutex::new(threads),
            api: Mutex::new(()),
            closed: AtomicBool::new(false),
            cancel: CancelToken::new(),
        };

        match session.handshake() {
            Ok(()) => Ok(session),
            Err(e) => {
                let _ = session.close();
                Err(e)
            }
        }
    }

    /// Settings-load plus camera geometry queries, run once at open.
    fn handshake(&self) -> Result<()> {
        self.load_settings()?;
        let frame_size = self.query_scalar(self.shared.commands.camera_image_size_get)?;
        let pixel_size = self.query_scalar(self.shared.commands.camera_pixel_fov_get)?;
        let mut meta = self.shared.meta();
        meta.frame_size_px = frame_size as u32;
        meta.pixel_size_mm = pixel_size;
        info!(
            frame_size_px = meta.frame_size_px,
            pixel_size_mm = meta.pixel_size_mm,
            "session handshake complete"
        );
        Ok(())
    }

    fn guard_open(&self) -> Result<()> {
        if self.closed.load(Ordering::SeqCst) || self.shared.events.terminate.is_set() {
            return Err(SessionError::Closed);
        }
        Ok(())
    }

    fn api_lock(&self) -> MutexGuard<'_, ()> {
        self.api.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// The token acquisition procedures poll between workflow boundaries.
    pub fn cancel_token(&self) -> CancelToken {
        self.cancel.clone()
    }

    /// Whether the controller currently reports idle.
    pub fn is_idle(&self) -> bool {
        self.shared.events.idle.is_set()
    }

    /// Size of one image pixel at the sample, in millimetres.
    pub fn pixel_size_mm(&self) -> f64 {
        self.shared.meta().pixel_size_mm
    }

    /// Side length of one camera frame, in pixels.
    pub fn frame_size_px(&self) -> u32 {
        self.shared.meta().frame_size_px
    }

    /// Physical extent of one camera frame, in millimetres.
    pub fn fov_mm(&self) -> f64 {
        let meta = self.shared.meta();
        meta.pixel_size_mm * f64::from(meta.frame_size_px)
    }

    /// The settings dump received from the controller.
    pub fn scope_settings(&self) -> ScopeSettings {
        self.shared.meta().settings.clone()
    }

    /// Runtime configuration.
    pub fn config(&self) -> &CoreConfig {
        &self.shared.config
    }

    /// Drain every diagnostic published since the last call.
    pub fn take_diagnostics(&self) -> Vec<Diagnostic> {
        let mut out = Vec::new();
        while let Ok(diag) = self.shared.queues.diagnostics_rx.try_recv() {
            out.push(diag);
        }
        out
    }

    /// Latest frame pushed for preview consumers, if any.
    pub fn latest_preview(&self) -> Option<ImageFrame> {
        self.shared.queues.visualize_rx.try_recv().ok()
    }

    fn submit(&self, outbound: Outbound) -> Result<()> {
        self.guard_open()?;
        self.shared
            .queues
            .command_tx
            .send(outbound)
            .map_err(|_| SessionError::Closed)?;
        self.shared.events.send.set();
        Ok(())
    }

    fn submit_acked(&self, outbound: impl FnOnce(Sender<()>) -> Outbound) -> Result<()> {
        let (ack_tx, ack_rx) = bounded(1);
        self.submit(outbound(ack_tx))?;
        match ack_rx.recv_timeout(SEND_ACK_TIMEOUT) {
            Ok(()) => Ok(()),
            Err(RecvTimeoutError::Timeout) => Err(SessionError::Transport(std::io::Error::new(
                std::io::ErrorKind::TimedOut,
                "queued command was not sent within the ack deadline",
            ))),
            Err(RecvTimeoutError::Disconnected) => Err(SessionError::Closed),
        }
    }

    /// Enqueue an arbitrary opcode with parameters and block until it is on
    /// the wire. This is the raw surface GUI-level collaborators build on.
    pub fn send_command(&self, code: u32, params: [i32; 3], value: f64) -> Result<()> {
        let _guard = self.api_lock();
        self.submit_acked(|ack| Outbound::Plain {
            code,
            params,
            value,
            ack: Some(ack),
        })
    }

    /// One request/scalar-response round trip on the command channel.
    fn query_scalar(&self, code: u32) -> Result<f64> {
        while self.shared.queues.scalar_rx.try_recv().is_ok() {}
        self.submit(Outbound::Plain {
            code,
            params: [0; 3],
            value: 0.0,
            ack: None,
        })?;
        let timeout = self.shared.config.settings_load_timeout();
        match self.shared.queues.scalar_rx.recv_timeout(timeout) {
            Ok(value) => Ok(value),
            Err(RecvTimeoutError::Timeout) => Err(SessionError::SettingsTimeout(timeout)),
            Err(RecvTimeoutError::Disconnected) => Err(SessionError::Closed),
        }
    }

    /// Ask the controller for its settings dump and parse the result.
    ///
    /// Blocks until the command listener has atomically replaced the
    /// on-disk settings resource or the configured deadline passes.
    pub fn load_settings(&self) -> Result<ScopeSettings> {
        self.guard_open()?;
        let timeout = self.shared.config.settings_load_timeout();
        self.shared.events.settings_changed.clear();
        self.submit(Outbound::Plain {
            code: self.shared.commands.scope_settings_load,
            params: [0; 3],
            value: 0.0,
            ack: None,
        })?;
        if !self.shared.events.settings_changed.wait_timeout(timeout) {
            return Err(SessionError::SettingsTimeout(timeout));
        }
        let settings = ScopeSettings::load_file(&self.shared.config.scope_settings_path())?;
        self.shared.meta().settings = settings.clone();
        Ok(settings)
    }

    /// Stage a settings payload and ask the controller to persist it.
    pub fn save_settings(&self, settings_text: &str) -> Result<()> {
        let _guard = self.api_lock();
        self.guard_open()?;
        atomic_write(
            &self.shared.config.send_settings_path(),
            settings_text.as_bytes(),
        )?;
        self.submit_acked(|ack| Outbound::SaveSettings { ack: Some(ack) })
    }

    /// Move the stage to `position`.
    ///
    /// Axes are commanded in the order X, Z, R, Y. Y is the collision-risk
    /// axis and moves last, once everything else has settled.
    /// Each command is confirmed on the wire before the next is queued.
    /// Targets outside the controller's soft limits are rejected without
    /// touching the hardware.
    pub fn move_to(&self, position: Position) -> Result<()> {
        let _guard = self.api_lock();
        self.move_to_inner(position)
    }

    /// [`Session::move_to`], then poll stage-motion-stopped per axis at a
    /// 500 ms cadence until all four axes report stopped.
    pub fn move_to_verified(&self, position: Position) -> Result<()> {
        let _guard = self.api_lock();
        self.move_to_inner(position)?;

        let mut stopped = [false; 4];
        while !self.shared.queues.motion_rx.is_empty() {
            let _ = self.shared.queues.motion_rx.try_recv();
        }
        while !stopped.iter().all(|s| *s) {
            self.guard_open()?;
            for axis in Axis::ALL {
                if !stopped[axis.index()] {
                    self.submit(Outbound::Plain {
                        code: self.shared.commands.stage_motion_stopped,
                        params: [axis.selector(), 0, 0],
                        value: 0.0,
                        ack: None,
                    })?;
                }
            }
            let deadline = Instant::now() + MOTION_POLL_INTERVAL;
            loop {
                let remaining = deadline.saturating_duration_since(Instant::now());
                if remaining.is_zero() {
                    break;
                }
                match self.shared.queues.motion_rx.recv_timeout(remaining) {
                    Ok((axis, is_stopped)) => {
                        if is_stopped {
                            stopped[axis.index()] = true;
                        }
                    }
                    Err(RecvTimeoutError::Timeout) => break,
                    Err(RecvTimeoutError::Disconnected) => return Err(SessionError::Closed),
                }
            }
        }
        Ok(())
    }

    fn move_to_inner(&self, position: Position) -> Result<()> {
        self.guard_open()?;
        self.check_soft_limits(&position)?;
        debug!(%position, "moving stage");
        for axis in [Axis::X, Axis::Z, Axis::R, Axis::Y] {
            self.submit_acked(|ack| Outbound::Plain {
                code: self.shared.commands.stage_position_set,
                params: [axis.selector(), 0, 0],
                value: position.axis_value(axis),
                ack: Some(ack),
            })?;
        }
        Ok(())
    }

    fn check_soft_limits(&self, position: &Position) -> Result<()> {
        let meta = self.shared.meta();
        for axis in Axis::ALL {
            if let Some((min, max)) = meta.settings.soft_limits(axis) {
                let value = position.axis_value(axis);
                if value < min - 1e-9 || value > max + 1e-9 {
                    return Err(SessionError::OutOfRange(format!(
                        "{axis} target {value} outside soft limits [{min}, {max}]"
                    )));
                }
            }
        }
        Ok(())
    }

    /// Validate, stage, and run a workflow, blocking until image data
    /// arrives or the controller reports idle.
    ///
    /// The workflow is serialized to the active workflow file (atomic
    /// rename, so the sender and image listener never observe a partial
    /// write) plus a `current<Kind>.txt` audit copy. Returns the received
    /// frame or stack; a workflow that completes without pushing data
    /// returns [`WorkflowOutcome::Completed`].
    pub fn run_workflow(&self, workflow: &Workflow) -> Result<WorkflowOutcome> {
        let _guard = self.api_lock();
        self.start_workflow(workflow)?;

        let deadline = Instant::now() + self.shared.config.workflow_timeout();
        loop {
            match self
                .shared
                .queues
                .image_rx
                .recv_timeout(Duration::from_millis(100))
            {
                Ok(acquisition) => return Ok(WorkflowOutcome::Data(acquisition)),
                Err(RecvTimeoutError::Timeout) => {}
                Err(RecvTimeoutError::Disconnected) => return Err(SessionError::Closed),
            }
            if self.shared.events.terminate.is_set() {
                return Err(SessionError::Closed);
            }
            if self.shared.events.idle.is_set() {
                // Completed; give in-flight data a short grace window.
                return match self
                    .shared
                    .queues
                    .image_rx
                    .recv_timeout(Duration::from_millis(500))
                {
                    Ok(acquisition) => Ok(WorkflowOutcome::Data(acquisition)),
                    Err(RecvTimeoutError::Timeout) => Ok(WorkflowOutcome::Completed),
                    Err(RecvTimeoutError::Disconnected) => Err(SessionError::Closed),
                };
            }
            if Instant::now() >= deadline {
                return Err(SessionError::WorkflowTimeout(
                    self.shared.config.workflow_timeout(),
                ));
            }
        }
    }

    /// Run a workflow and hand its image data to the processor thread
    /// instead of returning it; blocks for the processor's reduction.
    pub fn run_workflow_processed(&self, workflow: &Workflow) -> Result<Measurement> {
        let _guard = self.api_lock();
        while self.shared.queues.results_rx.try_recv().is_ok() {}
        self.shared.events.process.set();
        let armed = self.start_workflow(workflow);
        if let Err(e) = armed {
            self.shared.events.process.clear();
            return Err(e);
        }

        let timeout = self.shared.config.workflow_timeout();
        let deadline = Instant::now() + timeout;
        loop {
            match self
                .shared
                .queues
                .results_rx
                .recv_timeout(Duration::from_millis(100))
            {
                Ok(measurement) => return Ok(measurement),
                Err(RecvTimeoutError::Timeout) => {}
                Err(RecvTimeoutError::Disconnected) => return Err(SessionError::Closed),
            }
            if self.shared.events.terminate.is_set() {
                return Err(SessionError::Closed);
            }
            if Instant::now() >= deadline {
                return Err(SessionError::WorkflowTimeout(timeout));
            }
        }
    }

    fn start_workflow(&self, workflow: &Workflow) -> Result<()> {
        self.guard_open()?;
        workflow.validate()?;
        self.check_workflow_limits(workflow)?;
        self.write_active_workflow(workflow)?;
        while self.shared.queues.image_rx.try_recv().is_ok() {}
        self.shared.events.idle.clear();
        self.submit(Outbound::Workflow { ack: None })
    }

    fn check_workflow_limits(&self, workflow: &Workflow) -> Result<()> {
        for position in [workflow.start_position()?, workflow.end_position()?] {
            self.check_soft_limits(&position)?;
        }
        // The controller's image buffer only holds buffer_max_planes; a
        // deeper live stack must be subdivided by the caller. MIP workflows
        // push one projected frame and tile workflows save on the
        // controller, so neither hits the live buffer.
        if !workflow.display_max_projection() && workflow.kind() == WorkflowKind::ZStack {
            if let PlaneCount::Planes(planes) = workflow.plane_count()? {
                let max = self.shared.config.buffer_max_planes;
                if planes > max {
                    return Err(SessionError::OutOfRange(format!(
                        "{planes} planes exceed the controller buffer of {max}; subdivide the stack"
                    )));
                }
            }
        }
        Ok(())
    }

    fn write_active_workflow(&self, workflow: &Workflow) -> Result<()> {
        let text = workflow.render();
        let audit = self
            .shared
            .config
            .audit_workflow_path(workflow.kind().audit_name());
        std::fs::write(&audit, text.as_bytes())?;
        atomic_write(&self.shared.config.active_workflow_path(), text.as_bytes())?;
        Ok(())
    }

    /// Ask the controller to vet the active workflow (check-stack) and
    /// return its textual verdict payload.
    pub fn check_stack(&self, workflow: &Workflow) -> Result<Vec<u8>> {
        let _guard = self.api_lock();
        self.guard_open()?;
        workflow.validate()?;
        self.write_active_workflow(workflow)?;
        while self.shared.queues.blob_rx.try_recv().is_ok() {}
        self.submit(Outbound::CheckStack { ack: None })?;
        let timeout = self.shared.config.settings_load_timeout();
        match self.shared.queues.blob_rx.recv_timeout(timeout) {
            Ok(payload) => Ok(payload),
            Err(RecvTimeoutError::Timeout) => Err(SessionError::WorkflowTimeout(timeout)),
            Err(RecvTimeoutError::Disconnected) => Err(SessionError::Closed),
        }
    }

    /// Current stage position, refreshed from the controller.
    ///
    /// Issues stage-position-get for each axis and waits for the command
    /// listener to fill the cache; the round trip is retried once before
    /// giving up.
    pub fn get_position(&self) -> Result<Position> {
        let _guard = self.api_lock();
        let timeout = self.shared.config.position_query_timeout();
        let mut last_err = SessionError::PositionQueryTimeout(timeout);
        for attempt in 0..2 {
            if attempt > 0 {
                debug!("position query retry");
            }
            match self.query_position_once(timeout) {
                Ok(position) => return Ok(position),
                Err(e @ SessionError::PositionQueryTimeout(_)) => last_err = e,
                Err(e) => return Err(e),
            }
        }
        Err(last_err)
    }

    fn query_position_once(&self, timeout: Duration) -> Result<Position> {
        self.guard_open()?;
        self.shared.position().invalidate();
        self.shared.events.position_updated.clear();
        for axis in Axis::ALL {
            self.submit(Outbound::Plain {
                code: self.shared.commands.stage_position_get,
                params: [axis.selector(), 0, 0],
                value: 0.0,
                ack: None,
            })?;
        }
        let deadline = Instant::now() + timeout;
        loop {
            if let Some(position) = self.shared.position().position() {
                return Ok(position);
            }
            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                return Err(SessionError::PositionQueryTimeout(timeout));
            }
            self.shared.events.position_updated.wait_timeout(remaining);
            self.shared.events.position_updated.clear();
        }
    }

    /// Tear the runtime down: set terminate, unblock the socket readers,
    /// and join all threads. Idempotent.
    pub fn close(&self) -> Result<()> {
        if self.closed.swap(true, Ordering::SeqCst) {
            return Ok(());
        }
        info!("closing session");
        self.shared.events.terminate.set();
        self.shared.events.send.set();
        self.shared.events.process.set();
        self.control.shutdown();
        self.image.shutdown();

        let mut threads = self.threads.lock().unwrap_or_else(|e| e.into_inner());
        for (name, handle) in threads.drain(..) {
            if handle.join().is_err() {
                warn!(thread = name, "session thread panicked during shutdown");
            }
        }
        Ok(())
    }
}

impl Drop for Session {
    fn drop(&mut self) {
        let _ = self.close();
    }
}

/// Spawn a named session thread.
fn spawn<F>(name: &'static str, body: F) -> Result<JoinHandle<()>>
where
    F: FnOnce() + Send + 'static,
{
    std::thread::Builder::new()
        .name(format!("flamingo-{name}"))
        .spawn(body)
        .map_err(SessionError::Transport)
}

/// Write a file through a temporary sibling and an atomic rename, so
/// concurrent readers always observe a complete document.
pub(crate) fn atomic_write(path: &Path, bytes: &[u8]) -> std::io::Result<()> {
    let tmp = path.with_extension("tmp");
    std::fs::write(&tmp, bytes)?;
    std::fs::rename(&tmp, path)
}
