//! Scripted in-process microscope controller for integration tests.
//!
//! `MockScope` binds an adjacent TCP port pair (control, control + 1),
//! accepts the session's two connections, and answers command frames the
//! way the real controller firmware does: settings dumps with trailing
//! payloads, scalar camera replies, image pushes on the live channel, and
//! an idle frame after every workflow.

#![allow(dead_code)]

use std::io::{ErrorKind, Read, Write};
use std::net::{TcpListener, TcpStream};
use std::path::Path;
use std::sync::mpsc::{channel, Receiver, Sender, TryRecvError};
use std::thread::JoinHandle;
use std::time::Duration;

use flamingo_core::protocol::{CommandFrame, FRAME_LEN};

pub const WORKFLOW_START: u32 = 12292;
pub const SCOPE_SETTINGS: u32 = 4107;
pub const SCOPE_SETTINGS_LOAD: u32 = 4105;
pub const SCOPE_SETTINGS_SAVE: u32 = 4104;
pub const STAGE_POSITION_SET: u32 = 24580;
pub const STAGE_POSITION_GET: u32 = 24584;
pub const STAGE_MOTION_STOPPED: u32 = 24588;
pub const SYSTEM_STATE_IDLE: u32 = 40962;
pub const SYSTEM_STATE_GET: u32 = 40965;
pub const PIXEL_FOV_GET: u32 = 12347;
pub const IMAGE_SIZE_GET: u32 = 12346;
pub const CHECK_STACK: u32 = 12295;

/// Route session logs through the test harness when `RUST_LOG` asks.
pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

/// Write the opcode table resource the session loads at startup.
pub fn write_command_list(work_dir: &Path) {
    let dir = work_dir.join("microscope_settings");
    std::fs::create_dir_all(&dir).unwrap();
    let text = format!(
        "<CommandCodes.h>\n\
         COMMAND_CODES_CAMERA_WORK_FLOW_START = {WORKFLOW_START}\n\
         COMMAND_CODES_COMMON_SCOPE_SETTINGS = {SCOPE_SETTINGS}\n\
         COMMAND_CODES_COMMON_SCOPE_SETTINGS_LOAD = {SCOPE_SETTINGS_LOAD}\n\
         COMMAND_CODES_COMMON_SCOPE_SETTINGS_SAVE = {SCOPE_SETTINGS_SAVE}\n\
         COMMAND_CODES_STAGE_POSITION_SET = {STAGE_POSITION_SET}\n\
         COMMAND_CODES_STAGE_POSITION_GET = {STAGE_POSITION_GET}\n\
         COMMAND_CODES_STAGE_MOTION_STOPPED = {STAGE_MOTION_STOPPED}\n\
         COMMAND_CODES_SYSTEM_STATE_IDLE = {SYSTEM_STATE_IDLE}\n\
         COMMAND_CODES_SYSTEM_STATE_GET = {SYSTEM_STATE_GET}\n\
         COMMAND_CODES_CAMERA_PIXEL_FIELD_Of_VIEW_GET = {PIXEL_FOV_GET}\n\
         COMMAND_CODES_CAMERA_IMAGE_SIZE_GET = {IMAGE_SIZE_GET}\n\
         COMMAND_CODES_CAMERA_CHECK_STACK = {CHECK_STACK}\n\
         </CommandCodes.h>\n"
    );
    std::fs::write(dir.join("command_list.txt"), text).unwrap();
}

/// The settings dump the harness serves on settings-load.
pub fn settings_payload() -> Vec<u8> {
    b"<Instrument>\n    <Type>\n    Objective lens magnification = 16\n    </Type>\n</Instrument>\n\
      <Stage limits>\n    Soft limit min x-axis = 0.0\n    Soft limit max x-axis = 26.0\n\
    Soft limit min y-axis = 0.0\n    Soft limit max y-axis = 28.0\n\
    Soft limit min z-axis = 10.0\n    Soft limit max z-axis = 16.0\n</Stage limits>\n"
        .to_vec()
}

/// Harness behaviour knobs.
#[derive(Clone)]
pub struct ScopeConfig {
    /// Side length of the frames the harness pushes, in pixels.
    pub frame_px: u32,
    /// Pixel field of view reported to the session, millimetres.
    pub pixel_size_mm: f64,
    /// Frames pushed on the image channel per workflow-start.
    pub workflow_frames: u32,
    /// Verdict payload for check-stack commands.
    pub check_stack_verdict: &'static str,
}

impl Default for ScopeConfig {
    fn default() -> Self {
        Self {
            frame_px: 16,
            pixel_size_mm: 0.001,
            workflow_frames: 1,
            check_stack_verdict: "stack ok",
        }
    }
}

/// Out-of-band instructions for the harness thread.
pub enum Inject {
    /// Send `n` frames with a corrupted end marker.
    CorruptFrames(usize),
    /// Send a bare idle frame.
    Idle,
    /// Exit the harness loop.
    Shutdown,
}

/// A command frame received by the harness, with its payload if one
/// followed.
pub struct ReceivedCommand {
    pub frame: CommandFrame,
    pub payload: Vec<u8>,
}

pub struct MockScope {
    pub port: u16,
    pub frames: Receiver<ReceivedCommand>,
    inject_tx: Sender<Inject>,
    handle: Option<JoinHandle<()>>,
}

impl MockScope {
    /// Bind an adjacent port pair and start the harness thread.
    pub fn spawn(config: ScopeConfig) -> MockScope {
        let (control_listener, image_listener, port) = bind_adjacent_pair();
        let (frames_tx, frames_rx) = channel();
        let (inject_tx, inject_rx) = channel();

        let handle = std::thread::spawn(move || {
            serve(control_listener, image_listener, &config, &frames_tx, &inject_rx);
        });

        MockScope {
            port,
            frames: frames_rx,
            inject_tx,
            handle: Some(handle),
        }
    }

    pub fn inject(&self, inject: Inject) {
        let _ = self.inject_tx.send(inject);
    }

    /// Next recorded command frame, with a generous deadline.
    pub fn next_frame(&self) -> ReceivedCommand {
        self.frames
            .recv_timeout(Duration::from_secs(10))
            .expect("harness did not record a frame in time")
    }
}

impl Drop for MockScope {
    fn drop(&mut self) {
        let _ = self.inject_tx.send(Inject::Shutdown);
        if let Some(handle) = self.handle.take() {
            let _ = handle.join();
        }
    }
}

fn bind_adjacent_pair() -> (TcpListener, TcpListener, u16) {
    for _ in 0..64 {
        let control = TcpListener::bind("127.0.0.1:0").unwrap();
        let port = control.local_addr().unwrap().port();
        if port == u16::MAX {
            continue;
        }
        if let Ok(image) = TcpListener::bind(("127.0.0.1", port + 1)) {
            return (control, image, port);
        }
    }
    panic!("could not bind an adjacent port pair");
}

fn serve(
    control_listener: TcpListener,
    image_listener: TcpListener,
    config: &ScopeConfig,
    frames_tx: &Sender<ReceivedCommand>,
    inject_rx: &Receiver<Inject>,
) {
    let Ok((mut control, _)) = control_listener.accept() else {
        return;
    };
    let Ok((mut image, _)) = image_listener.accept() else {
        return;
    };
    control
        .set_read_timeout(Some(Duration::from_millis(50)))
        .unwrap();

    loop {
        match inject_rx.try_recv() {
            Ok(Inject::CorruptFrames(n)) => {
                for _ in 0..n {
                    let mut bytes = CommandFrame::request(SYSTEM_STATE_IDLE).encode();
                    bytes[127] ^= 0xFF;
                    if control.write_all(&bytes).is_err() {
                        return;
                    }
                }
            }
            Ok(Inject::Idle) => {
                if send_idle(&mut control).is_err() {
                    return;
                }
            }
            Ok(Inject::Shutdown) | Err(TryRecvError::Disconnected) => return,
            Err(TryRecvError::Empty) => {}
        }

        let Some(frame) = read_frame(&mut control) else {
            continue;
        };
        let payload = if frame.additional_data_bytes > 0 {
            let mut payload = vec![0u8; frame.additional_data_bytes as usize];
            control.set_read_timeout(None).unwrap();
            if control.read_exact(&mut payload).is_err() {
                return;
            }
            control
                .set_read_timeout(Some(Duration::from_millis(50)))
                .unwrap();
            payload
        } else {
            Vec::new()
        };

        let code = frame.command_code;
        let _ = frames_tx.send(ReceivedCommand { frame, payload });

        let result = match code {
            SCOPE_SETTINGS_LOAD => reply_with_payload(
                &mut control,
                SCOPE_SETTINGS,
                &settings_payload(),
            ),
            IMAGE_SIZE_GET => {
                let mut reply = CommandFrame::request(IMAGE_SIZE_GET);
                reply.params[1] = config.frame_px as i32;
                control.write_all(&reply.encode())
            }
            PIXEL_FOV_GET => {
                let mut reply = CommandFrame::request(PIXEL_FOV_GET);
                reply.value = config.pixel_size_mm;
                control.write_all(&reply.encode())
            }
            CHECK_STACK => reply_with_payload(
                &mut control,
                CHECK_STACK,
                config.check_stack_verdict.as_bytes(),
            ),
            STAGE_POSITION_GET => {
                let mut reply = CommandFrame::request(STAGE_POSITION_GET);
                reply.params[0] = frame.params[0];
                reply.value = f64::from(frame.params[0]);
                control.write_all(&reply.encode())
            }
            STAGE_MOTION_STOPPED => {
                let mut reply = CommandFrame::request(STAGE_MOTION_STOPPED);
                reply.params[0] = frame.params[0];
                reply.status = 1;
                control.write_all(&reply.encode())
            }
            WORKFLOW_START => {
                let mut result = Ok(());
                for _ in 0..config.workflow_frames {
                    result = result.and_then(|()| push_image(&mut image, config.frame_px));
                }
                result.and_then(|()| send_idle(&mut control))
            }
            SYSTEM_STATE_GET => send_idle(&mut control),
            _ => Ok(()),
        };
        if result.is_err() {
            return;
        }
    }
}

/// Read one 128-byte frame, tolerating idle timeouts.
fn read_frame(control: &mut TcpStream) -> Option<CommandFrame> {
    let mut probe = [0u8; 1];
    match control.peek(&mut probe) {
        Ok(0) => return None,
        Ok(_) => {}
        Err(e) if matches!(e.kind(), ErrorKind::WouldBlock | ErrorKind::TimedOut) => return None,
        Err(_) => return None,
    }
    control.set_read_timeout(None).unwrap();
    let mut buf = [0u8; FRAME_LEN];
    let result = control.read_exact(&mut buf);
    control
        .set_read_timeout(Some(Duration::from_millis(50)))
        .unwrap();
    result.ok()?;
    CommandFrame::decode(&buf).ok()
}

fn send_idle(control: &mut TcpStream) -> std::io::Result<()> {
    let mut idle = CommandFrame::request(SYSTEM_STATE_IDLE);
    idle.status = 1;
    control.write_all(&idle.encode())
}

fn reply_with_payload(
    control: &mut TcpStream,
    code: u32,
    payload: &[u8],
) -> std::io::Result<()> {
    let wire = CommandFrame::request(code).encode_with_payload(payload);
    control.write_all(&wire)
}

/// Push one image header + pixel payload on the live channel.
fn push_image(image: &mut TcpStream, frame_px: u32) -> std::io::Result<()> {
    let pixel_count = frame_px * frame_px;
    let image_size = pixel_count * 2;
    let header: [u32; 10] = [image_size, frame_px, frame_px, 1, 0, 0, 0, 0, 0, 0];
    let header_bytes: Vec<u8> = header.iter().flat_map(|f| f.to_le_bytes()).collect();
    image.write_all(&header_bytes)?;

    // Diagonal gradient so orientation-sensitive consumers see structure.
    let mut pixels = Vec::with_capacity(image_size as usize);
    for i in 0..pixel_count {
        pixels.extend_from_slice(&((i % 4096) as u16).to_le_bytes());
    }
    image.write_all(&pixels)
}
