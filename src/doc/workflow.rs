//! The workflow document: a declarative imaging job.
//!
//! A workflow is the single payload the controller accepts to start an
//! acquisition. On disk and on the wire it is a `<Workflow Settings>`
//! document with a fixed list of top-level sections; this module wraps the
//! generic [`Section`] tree with typed accessors for the fields the session
//! and the acquisition procedures mutate.
//!
//! Unknown sections and keys are preserved verbatim and in order, so a
//! workflow template written by the vendor GUI survives a load/mutate/dump
//! cycle untouched apart from the fields that were changed.

use std::io::{Read, Write};

use chrono::Local;

use crate::core::Position;
use crate::doc::Section;
use crate::error::DocError;

pub const EXPERIMENT_SETTINGS: &str = "Experiment Settings";
pub const CAMERA_SETTINGS: &str = "Camera Settings";
pub const STACK_SETTINGS: &str = "Stack Settings";
pub const START_POSITION: &str = "Start Position";
pub const END_POSITION: &str = "End Position";
pub const ILLUMINATION_SOURCE: &str = "Illumination Source";
pub const ILLUMINATION_PATH: &str = "Illumination Path";
pub const ILLUMINATION_OPTIONS: &str = "Illumination Options";

/// Top-level sections of a workflow, in canonical order.
pub const SECTIONS: [&str; 8] = [
    EXPERIMENT_SETTINGS,
    CAMERA_SETTINGS,
    STACK_SETTINGS,
    START_POSITION,
    END_POSITION,
    ILLUMINATION_SOURCE,
    ILLUMINATION_PATH,
    ILLUMINATION_OPTIONS,
];

const ROOT_TAG: &str = "Workflow Settings";

/// `Stack Settings.Number of planes`: either a concrete count or `auto`,
/// in which case the image listener falls back to the configured cap.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum PlaneCount {
    Auto,
    Planes(u32),
}

/// Broad classification of a workflow, used for audit file naming.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum WorkflowKind {
    Snapshot,
    ZStack,
    Tile,
}

impl WorkflowKind {
    /// Name fragment used in `workflows/current<Kind>.txt`.
    pub fn audit_name(self) -> &'static str {
        match self {
            WorkflowKind::Snapshot => "Snapshot",
            WorkflowKind::ZStack => "ZStack",
            WorkflowKind::Tile => "Tile",
        }
    }
}

/// A workflow document.
#[derive(Clone, Debug, PartialEq)]
pub struct Workflow {
    sections: Section,
}

impl Default for Workflow {
    /// An empty workflow with the canonical sections present in order.
    fn default() -> Self {
        let mut sections = Section::new();
        for name in SECTIONS {
            sections.ensure_child(name);
        }
        Self { sections }
    }
}

impl Workflow {
    /// Parse a workflow from a reader.
    ///
    /// Fails with [`DocError::Missing`] when the `<Workflow Settings>` root
    /// is absent and [`DocError::Syntax`] on malformed lines.
    pub fn load_text<R: Read>(reader: R) -> Result<Workflow, DocError> {
        let doc = Section::from_reader(reader)?;
        let sections = doc
            .child(ROOT_TAG)
            .cloned()
            .ok_or_else(|| DocError::Missing(format!("section '{ROOT_TAG}'")))?;
        Ok(Workflow { sections })
    }

    /// Parse a workflow from a string.
    pub fn parse(text: &str) -> Result<Workflow, DocError> {
        Self::load_text(text.as_bytes())
    }

    /// Load a workflow from a file.
    pub fn load_file(path: &std::path::Path) -> Result<Workflow, DocError> {
        Self::load_text(std::fs::File::open(path)?)
    }

    /// Serialize with LF line endings, 4-space indentation, and the section
    /// order of the source document.
    pub fn dump_text<W: Write>(&self, writer: &mut W) -> std::io::Result<()> {
        let mut doc = Section::new();
        *doc.ensure_child(ROOT_TAG) = self.sections.clone();
        doc.write_to(writer)
    }

    /// Render to a string.
    pub fn render(&self) -> String {
        let mut out = Vec::new();
        let _ = self.dump_text(&mut out);
        String::from_utf8_lossy(&out).into_owned()
    }

    /// Raw access to one top-level section.
    pub fn section(&self, name: &str) -> Option<&Section> {
        self.sections.child(name)
    }

    fn require(&self, name: &str) -> Result<&Section, DocError> {
        self.section(name)
            .ok_or_else(|| DocError::Missing(format!("section '{name}'")))
    }

    /// Raw string field access.
    pub fn get(&self, section: &str, key: &str) -> Option<&str> {
        self.section(section).and_then(|s| s.get(key))
    }

    /// Raw string field mutation; creates section and key as needed.
    pub fn set(&mut self, section: &str, key: &str, value: impl Into<String>) {
        self.sections.ensure_child(section).set(key, value);
    }

    fn position_of(&self, section: &str) -> Result<Position, DocError> {
        let s = self.require(section)?;
        Ok(Position {
            x_mm: s.get_f64("X (mm)")?,
            y_mm: s.get_f64("Y (mm)")?,
            z_mm: s.get_f64("Z (mm)")?,
            r_deg: s.get_f64("Angle (degrees)")?,
        })
    }

    pub fn start_position(&self) -> Result<Position, DocError> {
        self.position_of(START_POSITION)
    }

    pub fn end_position(&self) -> Result<Position, DocError> {
        self.position_of(END_POSITION)
    }

    /// Set both stage endpoints and keep `Change in Z axis (mm)` consistent.
    pub fn set_positions(&mut self, start: Position, end: Position) {
        for (name, pos) in [(START_POSITION, start), (END_POSITION, end)] {
            let section = self.sections.ensure_child(name);
            section.set("X (mm)", fmt_num(pos.x_mm));
            section.set("Y (mm)", fmt_num(pos.y_mm));
            section.set("Z (mm)", fmt_num(pos.z_mm));
            section.set("Angle (degrees)", fmt_num(pos.r_deg));
        }
        self.set(
            STACK_SETTINGS,
            "Change in Z axis (mm)",
            fmt_num((end.z_mm - start.z_mm).abs()),
        );
    }

    /// Laser/LED line as `(power_percent, on)`.
    pub fn illumination(&self, source_key: &str) -> Result<(f64, bool), DocError> {
        let raw = self
            .get(ILLUMINATION_SOURCE, source_key)
            .ok_or_else(|| DocError::Missing(format!("illumination source '{source_key}'")))?;
        parse_laser_tuple(source_key, raw)
    }

    /// Point `source_key` at `power_percent` and switch it on or off.
    ///
    /// Unless `Illumination Options.Run stack with multiple lasers on` is
    /// true, enabling one laser clears the on-flag of every other laser
    /// line; LED lines are left alone.
    pub fn set_illumination(&mut self, source_key: &str, power_percent: f64, on: bool) {
        let multi = self.multiple_lasers_allowed();
        let section = self.sections.ensure_child(ILLUMINATION_SOURCE);
        section.set(source_key, format!("{power_percent:.2} {}", u8::from(on)));
        if on && !multi {
            let others: Vec<(String, f64)> = section
                .values()
                .filter(|(key, _)| key.starts_with("Laser") && *key != source_key)
                .filter_map(|(key, value)| {
                    parse_laser_tuple(key, value)
                        .ok()
                        .map(|(power, _)| (key.to_string(), power))
                })
                .collect();
            for (key, power) in others {
                section.set(&key, format!("{power:.2} 0"));
            }
        }
    }

    pub fn multiple_lasers_allowed(&self) -> bool {
        self.get(ILLUMINATION_OPTIONS, "Run stack with multiple lasers on")
            .is_some_and(|v| v.eq_ignore_ascii_case("true"))
    }

    /// Plane-to-plane spacing, in millimetres.
    pub fn plane_spacing_mm(&self) -> Result<f64, DocError> {
        Ok(self.require(EXPERIMENT_SETTINGS)?.get_f64("Plane spacing (um)")? / 1000.0)
    }

    /// Set the Z step between planes.
    pub fn set_stack_step_mm(&mut self, step_mm: f64) {
        self.set(EXPERIMENT_SETTINGS, "Plane spacing (um)", fmt_num(step_mm * 1000.0));
    }

    pub fn plane_count(&self) -> Result<PlaneCount, DocError> {
        let raw = match self.get(STACK_SETTINGS, "Number of planes") {
            None => return Ok(PlaneCount::Auto),
            Some(raw) => raw,
        };
        if raw.eq_ignore_ascii_case("auto") || raw.is_empty() {
            return Ok(PlaneCount::Auto);
        }
        match raw.parse::<u32>() {
            Ok(n) if n > 0 => Ok(PlaneCount::Planes(n)),
            _ => Err(DocError::BadValue {
                key: "Number of planes".to_string(),
                value: raw.to_string(),
            }),
        }
    }

    pub fn set_plane_count(&mut self, count: PlaneCount) {
        let value = match count {
            PlaneCount::Auto => "auto".to_string(),
            PlaneCount::Planes(n) => n.to_string(),
        };
        self.set(STACK_SETTINGS, "Number of planes", value);
    }

    pub fn display_max_projection(&self) -> bool {
        self.get(EXPERIMENT_SETTINGS, "Display max projection")
            .is_some_and(|v| v.eq_ignore_ascii_case("true"))
    }

    pub fn set_display_max_projection(&mut self, enabled: bool) {
        self.set(
            EXPERIMENT_SETTINGS,
            "Display max projection",
            if enabled { "true" } else { "false" },
        );
    }

    pub fn set_save_target(&mut self, drive: &str, directory: &str) {
        self.set(EXPERIMENT_SETTINGS, "Save image drive", drive);
        self.set(EXPERIMENT_SETTINGS, "Save image directory", directory);
    }

    pub fn set_comment(&mut self, text: &str) {
        self.set(EXPERIMENT_SETTINGS, "Comments", text);
    }

    /// Collapse this workflow into a single-plane snapshot at `position`
    /// with the max projection pushed to the live channel.
    pub fn snapshot_at(&mut self, position: Position, framerate_fps: f64, plane_spacing_um: f64) {
        self.set(EXPERIMENT_SETTINGS, "Frame rate (f/s)", fmt_num(framerate_fps));
        self.set(EXPERIMENT_SETTINGS, "Plane spacing (um)", fmt_num(plane_spacing_um));
        self.set_positions(position, position);
        self.set(
            STACK_SETTINGS,
            "Change in Z axis (mm)",
            fmt_num(plane_spacing_um / 1000.0),
        );
        self.set_plane_count(PlaneCount::Planes(1));
        self.set_display_max_projection(true);
        self.stamp();
    }

    /// Plan a Z sweep of `depth_mm` using the current plane spacing.
    ///
    /// Sets the plane count, Z span, and a stage velocity matched to the
    /// frame rate, stamps the stack, and returns the plane count.
    pub fn plan_z_stack(&mut self, depth_mm: f64, framerate_fps: f64) -> Result<u32, DocError> {
        let spacing_mm = self.plane_spacing_mm()?;
        if spacing_mm <= 0.0 {
            return Err(DocError::BadValue {
                key: "Plane spacing (um)".to_string(),
                value: format!("{}", spacing_mm * 1000.0),
            });
        }
        let planes = ((depth_mm / spacing_mm).round() as u32).max(1);
        self.set_plane_count(PlaneCount::Planes(planes));
        self.set(STACK_SETTINGS, "Change in Z axis (mm)", fmt_num(depth_mm));
        self.set(
            STACK_SETTINGS,
            "Stage velocity (mm/s)",
            fmt_num(spacing_mm * framerate_fps),
        );
        self.stamp();
        Ok(planes)
    }

    /// Switch the stack option to a tiled volume with the given overlap.
    pub fn set_tile(&mut self, overlap_percent: u32) {
        self.set(STACK_SETTINGS, "Stack option", "Tile");
        self.set(STACK_SETTINGS, "Stack option settings 1", overlap_percent.to_string());
    }

    fn stamp(&mut self) {
        self.set(
            STACK_SETTINGS,
            "Date time stamp",
            Local::now().format("%Y-%m-%d %H:%M:%S").to_string(),
        );
    }

    /// Classify for audit file naming.
    pub fn kind(&self) -> WorkflowKind {
        if self
            .get(STACK_SETTINGS, "Stack option")
            .is_some_and(|v| v.eq_ignore_ascii_case("tile"))
        {
            return WorkflowKind::Tile;
        }
        match self.plane_count() {
            Ok(PlaneCount::Planes(1)) => WorkflowKind::Snapshot,
            _ => WorkflowKind::ZStack,
        }
    }

    /// Check the document invariants a workflow must satisfy before it can
    /// be sent to the controller.
    pub fn validate(&self) -> Result<(), DocError> {
        let start = self.start_position()?;
        let end = self.end_position()?;

        // Single-plane snapshots keep a nominal nonzero Z change with
        // coincident endpoints; the span invariant only binds real sweeps.
        let snapshot = self.plane_count()? == PlaneCount::Planes(1)
            || (end.z_mm - start.z_mm).abs() <= 1e-9;
        if !snapshot {
            let span = self.require(STACK_SETTINGS)?.get_f64("Change in Z axis (mm)")?;
            if (span - (end.z_mm - start.z_mm).abs()).abs() > 1e-6 {
                return Err(DocError::BadValue {
                    key: "Change in Z axis (mm)".to_string(),
                    value: format!("{span} (positions span {})", (end.z_mm - start.z_mm).abs()),
                });
            }
        }

        let mut lasers_on = 0usize;
        if let Some(sources) = self.section(ILLUMINATION_SOURCE) {
            for (key, value) in sources.values() {
                let (_, on) = parse_laser_tuple(key, value)?;
                if on && key.starts_with("Laser") {
                    lasers_on += 1;
                }
            }
        }
        if lasers_on > 1 && !self.multiple_lasers_allowed() {
            return Err(DocError::BadValue {
                key: "Illumination Source".to_string(),
                value: format!("{lasers_on} lasers enabled without multi-laser option"),
            });
        }

        Ok(())
    }
}

/// Parse `"<power_percent> <0|1>"`.
fn parse_laser_tuple(key: &str, raw: &str) -> Result<(f64, bool), DocError> {
    let bad = || DocError::BadValue {
        key: key.to_string(),
        value: raw.to_string(),
    };
    let mut parts = raw.split_whitespace();
    let power = parts
        .next()
        .and_then(|p| p.parse::<f64>().ok())
        .ok_or_else(bad)?;
    let on = match parts.next() {
        Some("0") => false,
        Some("1") => true,
        _ => return Err(bad()),
    };
    if parts.next().is_some() {
        return Err(bad());
    }
    Ok((power, on))
}

/// Compact numeric formatting: integral values render without an exponent or
/// trailing fraction noise, everything else keeps up to six decimals.
fn fmt_num(value: f64) -> String {
    let rounded = (value * 1e6).round() / 1e6;
    format!("{rounded}")
}

#[cfg(test)]
mod tests {
    use super::*;

    fn template() -> Workflow {
        let mut wf = Workflow::default();
        wf.set(EXPERIMENT_SETTINGS, "Plane spacing (um)", "10");
        wf.set(EXPERIMENT_SETTINGS, "Frame rate (f/s)", "40.0032");
        wf.set(EXPERIMENT_SETTINGS, "Display max projection", "false");
        wf.set(STACK_SETTINGS, "Stack option", "ZStack");
        wf.set(ILLUMINATION_SOURCE, "Laser 1 640 nm", "0.00 0");
        wf.set(ILLUMINATION_SOURCE, "Laser 3 488 nm", "0.00 0");
        wf.set(ILLUMINATION_SOURCE, "LED_RGB_Board", "20.56 1");
        wf.set_positions(
            Position::new(14.17, 1.737, 13.7, 0.0),
            Position::new(14.17, 1.737, 13.8, 0.0),
        );
        wf.set_plane_count(PlaneCount::Planes(10));
        wf
    }

    #[test]
    fn test_round_trip_preserves_document() {
        let wf = template();
        let text = wf.render();
        let reloaded = Workflow::parse(&text).unwrap();
        assert_eq!(wf, reloaded);
        // section order survives
        let names: Vec<_> = reloaded.sections.children().map(|(n, _)| n.to_string()).collect();
        assert_eq!(names, SECTIONS.to_vec());
    }

    #[test]
    fn test_missing_root_is_rejected() {
        let err = Workflow::parse("<Something Else>\nkey = 1\n</Something Else>\n");
        assert!(matches!(err, Err(DocError::Missing(_))));
    }

    #[test]
    fn test_positions_round_trip() {
        let wf = template();
        assert_eq!(wf.start_position().unwrap(), Position::new(14.17, 1.737, 13.7, 0.0));
        assert_eq!(wf.end_position().unwrap().z_mm, 13.8);
        assert_eq!(wf.get(STACK_SETTINGS, "Change in Z axis (mm)"), Some("0.1"));
    }

    #[test]
    fn test_validate_accepts_template() {
        template().validate().unwrap();
    }

    #[test]
    fn test_validate_rejects_inconsistent_z_span() {
        let mut wf = template();
        wf.set(STACK_SETTINGS, "Change in Z axis (mm)", "0.5");
        assert!(matches!(wf.validate(), Err(DocError::BadValue { .. })));
    }

    #[test]
    fn test_single_laser_exclusivity() {
        let mut wf = template();
        wf.set_illumination("Laser 1 640 nm", 3.5, true);
        wf.set_illumination("Laser 3 488 nm", 5.0, true);
        assert_eq!(wf.illumination("Laser 1 640 nm").unwrap(), (3.5, false));
        assert_eq!(wf.illumination("Laser 3 488 nm").unwrap(), (5.0, true));
        // the LED line is not a laser and keeps its state
        assert_eq!(wf.illumination("LED_RGB_Board").unwrap(), (20.56, true));
        wf.validate().unwrap();
    }

    #[test]
    fn test_multi_laser_option_disables_exclusivity() {
        let mut wf = template();
        wf.set(ILLUMINATION_OPTIONS, "Run stack with multiple lasers on", "true");
        wf.set_illumination("Laser 1 640 nm", 3.5, true);
        wf.set_illumination("Laser 3 488 nm", 5.0, true);
        assert_eq!(wf.illumination("Laser 1 640 nm").unwrap(), (3.5, true));
        wf.validate().unwrap();
    }

    #[test]
    fn test_bad_laser_tuple_rejected() {
        let mut wf = template();
        wf.set(ILLUMINATION_SOURCE, "Laser 3 488 nm", "5.00 2");
        assert!(matches!(wf.validate(), Err(DocError::BadValue { .. })));
    }

    #[test]
    fn test_plane_count_auto_and_missing() {
        let mut wf = template();
        wf.set(STACK_SETTINGS, "Number of planes", "auto");
        assert_eq!(wf.plane_count().unwrap(), PlaneCount::Auto);
        let empty = Workflow::default();
        assert_eq!(empty.plane_count().unwrap(), PlaneCount::Auto);
        wf.set(STACK_SETTINGS, "Number of planes", "0");
        assert!(wf.plane_count().is_err());
    }

    #[test]
    fn test_snapshot_conversion() {
        let mut wf = template();
        let pos = Position::new(10.0, 2.0, 12.0, 45.0);
        wf.snapshot_at(pos, 40.0032, 10.0);
        assert_eq!(wf.start_position().unwrap(), pos);
        assert_eq!(wf.end_position().unwrap(), pos);
        assert_eq!(wf.plane_count().unwrap(), PlaneCount::Planes(1));
        assert!(wf.display_max_projection());
        assert_eq!(wf.kind(), WorkflowKind::Snapshot);
        wf.validate().unwrap();
    }

    #[test]
    fn test_plan_z_stack_derives_plane_count() {
        let mut wf = template();
        // 2 mm sweep at 10 um spacing -> 200 planes
        let planes = wf.plan_z_stack(2.0, 40.0032).unwrap();
        assert_eq!(planes, 200);
        assert_eq!(wf.plane_count().unwrap(), PlaneCount::Planes(200));
        assert_eq!(wf.get(STACK_SETTINGS, "Change in Z axis (mm)"), Some("2"));
        assert!(wf.get(STACK_SETTINGS, "Date time stamp").is_some());
    }

    #[test]
    fn test_tile_kind() {
        let mut wf = template();
        wf.set_tile(10);
        assert_eq!(wf.kind(), WorkflowKind::Tile);
        assert_eq!(wf.get(STACK_SETTINGS, "Stack option settings 1"), Some("10"));
    }

    #[test]
    fn test_fmt_num_is_compact() {
        assert_eq!(fmt_num(0.1), "0.1");
        assert_eq!(fmt_num(2.0), "2");
        assert_eq!(fmt_num(13.800000000000001), "13.8");
    }
}
