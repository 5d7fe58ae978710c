//! Microscope settings dumps (`ScopeSettings.txt`).
//!
//! The controller answers a settings-load command with a nested text
//! document describing the installed hardware: objective data, stage soft
//! limits, filter wheel assignments and so on. The session stores the raw
//! payload on disk verbatim and wraps it here for the handful of values the
//! core actually consults.

use std::io::Read;
use std::path::Path;

use crate::core::Axis;
use crate::doc::Section;
use crate::error::DocError;

/// Parsed view over a settings dump.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct ScopeSettings {
    doc: Section,
}

impl ScopeSettings {
    pub fn from_reader<R: Read>(reader: R) -> Result<Self, DocError> {
        Ok(Self {
            doc: Section::from_reader(reader)?,
        })
    }

    pub fn parse(text: &str) -> Result<Self, DocError> {
        Self::from_reader(text.as_bytes())
    }

    pub fn load_file(path: &Path) -> Result<Self, DocError> {
        Self::from_reader(std::fs::File::open(path)?)
    }

    /// The underlying document.
    pub fn doc(&self) -> &Section {
        &self.doc
    }

    /// Objective lens magnification from the instrument type block.
    ///
    /// The block nesting varies between firmware revisions (`Instrument` →
    /// `Type` on current controllers, bare `Type` on older dumps), so the
    /// lookup searches by section name.
    pub fn objective_magnification(&self) -> Result<f64, DocError> {
        self.doc
            .find_section("Type")
            .ok_or_else(|| DocError::Missing("section 'Type'".to_string()))?
            .get_f64("Objective lens magnification")
    }

    /// Stage soft limits for one axis as `(min, max)`, if the dump carries
    /// them.
    pub fn soft_limits(&self, axis: Axis) -> Option<(f64, f64)> {
        let limits = self.doc.find_section("Stage limits")?;
        let suffix = match axis {
            Axis::X => "x-axis",
            Axis::Y => "y-axis",
            Axis::Z => "z-axis",
            Axis::R => "r-axis",
        };
        let min = limits.get_f64(&format!("Soft limit min {suffix}")).ok()?;
        let max = limits.get_f64(&format!("Soft limit max {suffix}")).ok()?;
        Some((min, max))
    }

    /// Upper Y soft limit, the bound the Y-axis sample search runs against.
    pub fn y_max(&self) -> Option<f64> {
        self.soft_limits(Axis::Y).map(|(_, max)| max)
    }

    /// Midpoint of the Z travel range, used to centre Z searches when no
    /// better estimate exists.
    pub fn z_midpoint(&self) -> Option<f64> {
        self.soft_limits(Axis::Z).map(|(min, max)| (min + max) / 2.0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const DUMP: &str = "\
<Instrument>
    <Type>
    Objective lens magnification = 16
    Tube lens design focal length (mm) = 200
    </Type>
</Instrument>
<Stage limits>
    Soft limit min x-axis = 0.0
    Soft limit max x-axis = 26.0
    Soft limit min y-axis = 0.0
    Soft limit max y-axis = 28.0
    Soft limit min z-axis = 12.0
    Soft limit max z-axis = 15.0
</Stage limits>
";

    #[test]
    fn test_objective_magnification_nested() {
        let settings = ScopeSettings::parse(DUMP).unwrap();
        assert_eq!(settings.objective_magnification().unwrap(), 16.0);
    }

    #[test]
    fn test_objective_magnification_flat_dump() {
        // Truncated dump without the Instrument wrapper or closing tags.
        let settings =
            ScopeSettings::parse("<Type>\n    Objective lens magnification = 16\n").unwrap();
        assert_eq!(settings.objective_magnification().unwrap(), 16.0);
    }

    #[test]
    fn test_soft_limits() {
        let settings = ScopeSettings::parse(DUMP).unwrap();
        assert_eq!(settings.soft_limits(Axis::Y), Some((0.0, 28.0)));
        assert_eq!(settings.soft_limits(Axis::R), None);
        assert_eq!(settings.y_max(), Some(28.0));
        assert_eq!(settings.z_midpoint(), Some(13.5));
    }

    #[test]
    fn test_missing_type_section() {
        let settings = ScopeSettings::parse("<Other>\nkey = 1\n</Other>\n").unwrap();
        assert!(matches!(
            settings.objective_magnification(),
            Err(DocError::Missing(_))
        ));
    }
}
