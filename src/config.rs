//! Strongly-typed configuration for the session core.
//!
//! Configuration is loaded from three layers, later layers overriding
//! earlier ones:
//!
//! 1. Built-in defaults
//! 2. A `flamingo.toml` file (path overridable at call site)
//! 3. Environment variables prefixed with `FLAMINGO_`
//!
//! ```text
//! FLAMINGO_CONTROL_IP=10.129.37.17
//! FLAMINGO_CONTROL_PORT=53717
//! FLAMINGO_WORKFLOW_TIMEOUT_S=240
//! ```
//!
//! The opcode table is deliberately *not* part of this struct: numeric
//! command codes are controller-firmware specific and are loaded from the
//! text resource at [`CoreConfig::command_list_path`], so a firmware
//! revision needs a file swap, not a recompile.

use std::path::{Path, PathBuf};
use std::time::Duration;

use figment::providers::{Env, Format, Serialized, Toml};
use figment::Figment;
use serde::{Deserialize, Serialize};

use crate::error::{Result, SessionError};

/// Default config file name, resolved relative to the working directory.
pub const DEFAULT_CONFIG_FILE: &str = "flamingo.toml";

/// Runtime configuration of the session core.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct CoreConfig {
    /// Microscope controller address. The image channel connects to
    /// `control_port + 1`.
    pub control_ip: String,
    pub control_port: u16,

    /// Root directory for `workflows/`, `microscope_settings/` and
    /// `sample_txt/`.
    pub work_dir: PathBuf,

    /// Opcode table resource, relative to `work_dir` unless absolute.
    pub command_list_path: PathBuf,

    /// Largest number of planes the controller buffers in one stack. Do not
    /// raise above the vendor-approved value without consulting them.
    pub buffer_max_planes: u32,

    /// Per-workflow completion deadline in seconds.
    pub workflow_timeout_s: u64,

    /// Settings-load round-trip deadline in seconds.
    pub settings_load_timeout_s: u64,

    /// Stage position query deadline in seconds.
    pub position_query_timeout_s: u64,

    /// TCP connect deadline in seconds.
    pub connect_timeout_s: u64,

    /// Width in pixels of the rolling mean applied to Y intensity profiles.
    pub rolling_window_px: usize,

    /// Plane count assumed when a workflow says `Number of planes = auto`.
    /// This is a safety cap on the receive loop, not a tuning knob; its use
    /// is logged.
    pub plane_count_default: u32,

    /// Illumination value written for an enabled laser line when a procedure
    /// does not specify a power: `"<percent> <on>"`.
    pub laser_on_default: String,

    /// Illumination value written for every disabled source line.
    pub led_off_default: String,
}

impl Default for CoreConfig {
    fn default() -> Self {
        Self {
            control_ip: "127.0.0.1".to_string(),
            control_port: 53717,
            work_dir: PathBuf::from("."),
            command_list_path: PathBuf::from("microscope_settings/command_list.txt"),
            buffer_max_planes: 10,
            workflow_timeout_s: 120,
            settings_load_timeout_s: 5,
            position_query_timeout_s: 2,
            connect_timeout_s: 2,
            rolling_window_px: 21,
            plane_count_default: 200,
            laser_on_default: "5.00 1".to_string(),
            led_off_default: "0.00 0".to_string(),
        }
    }
}

impl CoreConfig {
    /// Load configuration from `flamingo.toml` and the environment.
    pub fn load() -> Result<Self> {
        Self::load_from(DEFAULT_CONFIG_FILE)
    }

    /// Load configuration from a specific TOML file and the environment.
    /// The file is optional; missing files fall back to defaults.
    pub fn load_from<P: AsRef<Path>>(path: P) -> Result<Self> {
        let config: CoreConfig = Figment::from(Serialized::defaults(CoreConfig::default()))
            .merge(Toml::file(path.as_ref()))
            .merge(Env::prefixed("FLAMINGO_"))
            .extract()?;
        config.validate()?;
        Ok(config)
    }

    /// Reject configurations that parse but cannot work.
    pub fn validate(&self) -> Result<()> {
        if self.control_ip.is_empty() {
            return Err(SessionError::InvalidConfig(
                "control_ip must not be empty".to_string(),
            ));
        }
        if self.control_port == u16::MAX {
            return Err(SessionError::InvalidConfig(
                "control_port leaves no room for the image channel port".to_string(),
            ));
        }
        if self.buffer_max_planes == 0 {
            return Err(SessionError::InvalidConfig(
                "buffer_max_planes must be at least 1".to_string(),
            ));
        }
        for (name, value) in [
            ("workflow_timeout_s", self.workflow_timeout_s),
            ("settings_load_timeout_s", self.settings_load_timeout_s),
            ("position_query_timeout_s", self.position_query_timeout_s),
            ("connect_timeout_s", self.connect_timeout_s),
        ] {
            if value == 0 {
                return Err(SessionError::InvalidConfig(format!(
                    "{name} must be nonzero"
                )));
            }
        }
        if self.rolling_window_px == 0 || self.rolling_window_px % 2 == 0 {
            // The rolling mean is centred, so the window needs a middle sample.
            return Err(SessionError::InvalidConfig(
                "rolling_window_px must be odd and nonzero".to_string(),
            ));
        }
        if self.plane_count_default == 0 {
            return Err(SessionError::InvalidConfig(
                "plane_count_default must be at least 1".to_string(),
            ));
        }
        Ok(())
    }

    pub fn workflow_timeout(&self) -> Duration {
        Duration::from_secs(self.workflow_timeout_s)
    }

    pub fn settings_load_timeout(&self) -> Duration {
        Duration::from_secs(self.settings_load_timeout_s)
    }

    pub fn position_query_timeout(&self) -> Duration {
        Duration::from_secs(self.position_query_timeout_s)
    }

    pub fn connect_timeout(&self) -> Duration {
        Duration::from_secs(self.connect_timeout_s)
    }

    /// Directory holding the active and audit workflow files.
    pub fn workflows_dir(&self) -> PathBuf {
        self.work_dir.join("workflows")
    }

    /// The workflow file the sender transmits on workflow-start.
    pub fn active_workflow_path(&self) -> PathBuf {
        self.workflows_dir().join("workflow.txt")
    }

    /// Audit copy of the most recent workflow of a given kind
    /// (e.g. `currentSnapshot.txt`).
    pub fn audit_workflow_path(&self, kind: &str) -> PathBuf {
        self.workflows_dir().join(format!("current{kind}.txt"))
    }

    pub fn settings_dir(&self) -> PathBuf {
        self.work_dir.join("microscope_settings")
    }

    /// Last settings payload received from the controller.
    pub fn scope_settings_path(&self) -> PathBuf {
        self.settings_dir().join("ScopeSettings.txt")
    }

    /// Settings payload staged for a settings-save command.
    pub fn send_settings_path(&self) -> PathBuf {
        self.settings_dir().join("send_settings.txt")
    }

    /// Resolved path of the opcode table resource.
    pub fn resolved_command_list_path(&self) -> PathBuf {
        if self.command_list_path.is_absolute() {
            self.command_list_path.clone()
        } else {
            self.work_dir.join(&self.command_list_path)
        }
    }

    pub fn sample_dir(&self, sample_name: &str) -> PathBuf {
        self.work_dir.join("sample_txt").join(sample_name)
    }

    /// Bounding-box file written by locate-sample.
    pub fn bounds_path(&self, sample_name: &str) -> PathBuf {
        self.sample_dir(sample_name)
            .join(format!("bounds_{sample_name}.txt"))
    }
}
