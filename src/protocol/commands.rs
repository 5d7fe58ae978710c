//! The opcode table.
//!
//! Numeric command codes are firmware-specific and ship with the controller
//! as a `CommandCodes.h`-style listing. The session loads them from a text
//! resource at startup so a firmware revision means swapping a file, never
//! recompiling. The resource uses the same sectioned text format as the
//! other controller documents:
//!
//! ```text
//! <CommandCodes.h>
//!     COMMAND_CODES_CAMERA_WORK_FLOW_START = 12292
//!     ...
//! </CommandCodes.h>
//! ```

use std::fmt;
use std::path::Path;

use crate::doc::Section;
use crate::error::DocError;

const SECTION: &str = "CommandCodes.h";

/// The opcodes the session core understands, resolved to numeric codes.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct CommandSet {
    pub workflow_start: u32,
    pub scope_settings: u32,
    pub scope_settings_load: u32,
    pub scope_settings_save: u32,
    pub stage_position_set: u32,
    pub stage_position_get: u32,
    pub stage_motion_stopped: u32,
    pub system_state_idle: u32,
    pub system_state_get: u32,
    pub camera_pixel_fov_get: u32,
    pub camera_image_size_get: u32,
    pub camera_check_stack: u32,
}

impl CommandSet {
    /// Load the opcode table from a text resource.
    ///
    /// Unknown names in the file are ignored; each required name must be
    /// present or loading fails with [`DocError::Missing`].
    pub fn load(path: &Path) -> Result<CommandSet, DocError> {
        let doc = Section::from_reader(std::fs::File::open(path)?)?;
        Self::from_doc(&doc)
    }

    /// Build the opcode table from an already-parsed document.
    pub fn from_doc(doc: &Section) -> Result<CommandSet, DocError> {
        let codes = doc
            .find_section(SECTION)
            .ok_or_else(|| DocError::Missing(format!("section '{SECTION}'")))?;

        let lookup = |name: &str| -> Result<u32, DocError> {
            let raw = codes
                .get(name)
                .ok_or_else(|| DocError::Missing(format!("command code '{name}'")))?;
            raw.trim().parse::<u32>().map_err(|_| DocError::BadValue {
                key: name.to_string(),
                value: raw.to_string(),
            })
        };

        Ok(CommandSet {
            workflow_start: lookup("COMMAND_CODES_CAMERA_WORK_FLOW_START")?,
            scope_settings: lookup("COMMAND_CODES_COMMON_SCOPE_SETTINGS")?,
            scope_settings_load: lookup("COMMAND_CODES_COMMON_SCOPE_SETTINGS_LOAD")?,
            scope_settings_save: lookup("COMMAND_CODES_COMMON_SCOPE_SETTINGS_SAVE")?,
            stage_position_set: lookup("COMMAND_CODES_STAGE_POSITION_SET")?,
            stage_position_get: lookup("COMMAND_CODES_STAGE_POSITION_GET")?,
            stage_motion_stopped: lookup("COMMAND_CODES_STAGE_MOTION_STOPPED")?,
            system_state_idle: lookup("COMMAND_CODES_SYSTEM_STATE_IDLE")?,
            system_state_get: lookup("COMMAND_CODES_SYSTEM_STATE_GET")?,
            camera_pixel_fov_get: lookup("COMMAND_CODES_CAMERA_PIXEL_FIELD_Of_VIEW_GET")?,
            camera_image_size_get: lookup("COMMAND_CODES_CAMERA_IMAGE_SIZE_GET")?,
            camera_check_stack: lookup("COMMAND_CODES_CAMERA_CHECK_STACK")?,
        })
    }

    /// Symbolic name of a code, for diagnostics.
    pub fn name_of(&self, code: u32) -> Option<&'static str> {
        let entries = [
            (self.workflow_start, "workflow-start"),
            (self.scope_settings, "scope-settings"),
            (self.scope_settings_load, "scope-settings-load"),
            (self.scope_settings_save, "scope-settings-save"),
            (self.stage_position_set, "stage-position-set"),
            (self.stage_position_get, "stage-position-get"),
            (self.stage_motion_stopped, "stage-motion-stopped"),
            (self.system_state_idle, "system-state-idle"),
            (self.system_state_get, "system-state-get"),
            (self.camera_pixel_fov_get, "camera-pixel-fov-get"),
            (self.camera_image_size_get, "camera-image-size-get"),
            (self.camera_check_stack, "camera-check-stack"),
        ];
        entries
            .iter()
            .find(|(c, _)| *c == code)
            .map(|(_, name)| *name)
    }
}

impl fmt::Display for CommandSet {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "workflow-start={} settings-load={} position-set={} state-idle={}",
            self.workflow_start,
            self.scope_settings_load,
            self.stage_position_set,
            self.system_state_idle
        )
    }
}
