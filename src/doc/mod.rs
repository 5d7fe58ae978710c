//! Hierarchical `key = value` text documents.
//!
//! The controller exchanges several kinds of sectioned text files: workflow
//! descriptions, microscope settings dumps, the opcode table, and the
//! bounding-box files written by the acquisition procedures. They all share
//! one shape:
//!
//! ```text
//! <Section Name>
//!     <Nested Section>
//!     key = value
//!     </Nested Section>
//! </Section Name>
//! ```
//!
//! [`Section`] models one node of that tree as an ordered list of entries,
//! preserving the order in which keys and subsections appear. The parser is
//! permissive about indentation and unknown sections, strict about malformed
//! `key = value` lines, and tolerates sections left unclosed at end of
//! input (settings dumps from the controller routinely omit closing tags).
//!
//! Writing always emits LF line endings regardless of the host platform;
//! the controller runs Linux and its parser is newline-sensitive.

pub mod settings;
pub mod workflow;

pub use settings::ScopeSettings;
pub use workflow::{PlaneCount, Workflow, WorkflowKind};

use std::io::{BufRead, BufReader, Read, Write};

use crate::error::DocError;

/// One entry of a section: a scalar value or a nested child section.
#[derive(Clone, Debug, PartialEq)]
pub enum Entry {
    Value { key: String, value: String },
    Child { name: String, section: Section },
}

/// An ordered collection of `key = value` pairs and named child sections.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct Section {
    entries: Vec<Entry>,
}

impl Section {
    pub fn new() -> Self {
        Self::default()
    }

    /// Parse a document from a reader. The returned section is an unnamed
    /// root holding the top-level sections and keys of the input.
    pub fn from_reader<R: Read>(reader: R) -> Result<Section, DocError> {
        let mut root = Section::new();
        let mut stack: Vec<(String, Section)> = Vec::new();

        for (index, line) in BufReader::new(reader).lines().enumerate() {
            let line_no = index + 1;
            let line = line?;
            let trimmed = line.trim();
            if trimmed.is_empty() {
                continue;
            }

            if let Some(name) = tag_name(trimmed, true) {
                let (open_name, section) = match stack.pop() {
                    Some(frame) => frame,
                    None => {
                        return Err(DocError::Syntax {
                            line: line_no,
                            message: format!("closing tag </{name}> without an open section"),
                        })
                    }
                };
                if open_name != name {
                    return Err(DocError::Syntax {
                        line: line_no,
                        message: format!("closing tag </{name}> does not match <{open_name}>"),
                    });
                }
                attach_child(&mut root, &mut stack, open_name, section);
            } else if let Some(name) = tag_name(trimmed, false) {
                stack.push((name.to_string(), Section::new()));
            } else if let Some((key, value)) = trimmed.split_once('=') {
                let key = key.trim();
                if key.is_empty() {
                    return Err(DocError::Syntax {
                        line: line_no,
                        message: "empty key before '='".to_string(),
                    });
                }
                let entry = Entry::Value {
                    key: key.to_string(),
                    value: value.trim().to_string(),
                };
                match stack.last_mut() {
                    Some((_, section)) => section.entries.push(entry),
                    None => root.entries.push(entry),
                }
            } else {
                return Err(DocError::Syntax {
                    line: line_no,
                    message: format!("expected 'key = value' or a section tag, got {trimmed:?}"),
                });
            }
        }

        // Implicitly close whatever is still open; controller dumps often
        // omit the trailing tags.
        while let Some((name, section)) = stack.pop() {
            attach_child(&mut root, &mut stack, name, section);
        }

        Ok(root)
    }

    /// Parse a document from a string.
    pub fn parse_str(text: &str) -> Result<Section, DocError> {
        Self::from_reader(text.as_bytes())
    }

    /// Serialize this section's entries as a document rooted at depth zero.
    pub fn write_to<W: Write>(&self, writer: &mut W) -> std::io::Result<()> {
        self.write_entries(writer, 0)
    }

    fn write_entries<W: Write>(&self, writer: &mut W, depth: usize) -> std::io::Result<()> {
        for entry in &self.entries {
            match entry {
                Entry::Value { key, value } => {
                    write_indent(writer, depth.saturating_sub(1))?;
                    writer.write_all(format!("{key} = {value}\n").as_bytes())?;
                }
                Entry::Child { name, section } => {
                    write_indent(writer, depth)?;
                    writer.write_all(format!("<{name}>\n").as_bytes())?;
                    section.write_entries(writer, depth + 1)?;
                    write_indent(writer, depth)?;
                    writer.write_all(format!("</{name}>\n").as_bytes())?;
                }
            }
        }
        Ok(())
    }

    /// Render to a string with LF endings.
    pub fn render(&self) -> String {
        let mut out = Vec::new();
        // Writing to a Vec cannot fail.
        let _ = self.write_to(&mut out);
        String::from_utf8_lossy(&out).into_owned()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn entries(&self) -> &[Entry] {
        &self.entries
    }

    /// First scalar value stored under `key`.
    pub fn get(&self, key: &str) -> Option<&str> {
        self.entries.iter().find_map(|entry| match entry {
            Entry::Value { key: k, value } if k == key => Some(value.as_str()),
            _ => None,
        })
    }

    /// Value under `key`, parsed as `f64`.
    pub fn get_f64(&self, key: &str) -> Result<f64, DocError> {
        let raw = self
            .get(key)
            .ok_or_else(|| DocError::Missing(format!("key '{key}'")))?;
        raw.parse::<f64>().map_err(|_| DocError::BadValue {
            key: key.to_string(),
            value: raw.to_string(),
        })
    }

    /// Replace the first value stored under `key`, or append a new entry.
    pub fn set(&mut self, key: &str, value: impl Into<String>) {
        let value = value.into();
        for entry in &mut self.entries {
            if let Entry::Value { key: k, value: v } = entry {
                if k == key {
                    *v = value;
                    return;
                }
            }
        }
        self.entries.push(Entry::Value {
            key: key.to_string(),
            value,
        });
    }

    /// First direct child section named `name`.
    pub fn child(&self, name: &str) -> Option<&Section> {
        self.entries.iter().find_map(|entry| match entry {
            Entry::Child { name: n, section } if n == name => Some(section),
            _ => None,
        })
    }

    pub fn child_mut(&mut self, name: &str) -> Option<&mut Section> {
        self.entries.iter_mut().find_map(|entry| match entry {
            Entry::Child { name: n, section } if n == name => Some(section),
            _ => None,
        })
    }

    /// Direct child section named `name`, created at the end if absent.
    pub fn ensure_child(&mut self, name: &str) -> &mut Section {
        if let Some(index) = self.entries.iter().position(
            |entry| matches!(entry, Entry::Child { name: n, .. } if n == name),
        ) {
            match &mut self.entries[index] {
                Entry::Child { section, .. } => return section,
                Entry::Value { .. } => unreachable!("position matched a child entry"),
            }
        }
        self.entries.push(Entry::Child {
            name: name.to_string(),
            section: Section::new(),
        });
        match self.entries.last_mut() {
            Some(Entry::Child { section, .. }) => section,
            _ => unreachable!("entry was just pushed"),
        }
    }

    /// Iterate over direct child sections in order of appearance.
    pub fn children(&self) -> impl Iterator<Item = (&str, &Section)> {
        self.entries.iter().filter_map(|entry| match entry {
            Entry::Child { name, section } => Some((name.as_str(), section)),
            _ => None,
        })
    }

    /// Iterate over direct scalar entries in order of appearance.
    pub fn values(&self) -> impl Iterator<Item = (&str, &str)> {
        self.entries.iter().filter_map(|entry| match entry {
            Entry::Value { key, value } => Some((key.as_str(), value.as_str())),
            _ => None,
        })
    }

    /// Depth-first search for a section named `name`, at any nesting level.
    pub fn find_section(&self, name: &str) -> Option<&Section> {
        for (child_name, child) in self.children() {
            if child_name == name {
                return Some(child);
            }
            if let Some(found) = child.find_section(name) {
                return Some(found);
            }
        }
        None
    }
}

fn attach_child(
    root: &mut Section,
    stack: &mut [(String, Section)],
    name: String,
    section: Section,
) {
    let entry = Entry::Child { name, section };
    match stack.last_mut() {
        Some((_, parent)) => parent.entries.push(entry),
        None => root.entries.push(entry),
    }
}

fn tag_name(line: &str, closing: bool) -> Option<&str> {
    let inner = line.strip_prefix(if closing { "</" } else { "<" })?;
    let name = inner.strip_suffix('>')?;
    if name.is_empty() || name.starts_with('/') {
        return None;
    }
    Some(name)
}

fn write_indent<W: Write>(writer: &mut W, depth: usize) -> std::io::Result<()> {
    for _ in 0..depth {
        writer.write_all(b"    ")?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    const SAMPLE: &str = "<Workflow Settings>\n    <Stack Settings>\n    Number of planes = 5\n    Change in Z axis (mm) = 0.05\n    </Stack Settings>\n</Workflow Settings>\n";

    #[test]
    fn test_parse_nested_sections() {
        let doc = Section::parse_str(SAMPLE).unwrap();
        let stack = doc
            .child("Workflow Settings")
            .and_then(|wf| wf.child("Stack Settings"))
            .unwrap();
        assert_eq!(stack.get("Number of planes"), Some("5"));
        assert_eq!(stack.get_f64("Change in Z axis (mm)").unwrap(), 0.05);
    }

    #[test]
    fn test_round_trip_preserves_order_and_content() {
        let doc = Section::parse_str(SAMPLE).unwrap();
        let rendered = doc.render();
        assert_eq!(rendered, SAMPLE);
        let again = Section::parse_str(&rendered).unwrap();
        assert_eq!(doc, again);
    }

    #[test]
    fn test_malformed_line_reports_line_number() {
        let text = "<Top>\nkey = ok\nthis line has no equals\n</Top>\n";
        match Section::parse_str(text) {
            Err(DocError::Syntax { line, .. }) => assert_eq!(line, 3),
            other => panic!("expected syntax error, got {other:?}"),
        }
    }

    #[test]
    fn test_mismatched_closing_tag_rejected() {
        let text = "<Top>\n</Bottom>\n";
        assert!(matches!(
            Section::parse_str(text),
            Err(DocError::Syntax { line: 2, .. })
        ));
    }

    #[test]
    fn test_unclosed_sections_are_implicitly_closed() {
        // Settings dumps from the controller can be cut off mid-document.
        let text = "<Type>\n    Objective lens magnification = 16\n";
        let doc = Section::parse_str(text).unwrap();
        assert_eq!(
            doc.child("Type").and_then(|t| t.get("Objective lens magnification")),
            Some("16")
        );
    }

    #[test]
    fn test_set_replaces_in_place() {
        let mut section = Section::new();
        section.set("a", "1");
        section.set("b", "2");
        section.set("a", "3");
        let keys: Vec<_> = section.values().collect();
        assert_eq!(keys, vec![("a", "3"), ("b", "2")]);
    }

    #[test]
    fn test_find_section_recurses() {
        let text = "<Instrument>\n    <Type>\n    Objective lens magnification = 16\n    </Type>\n</Instrument>\n";
        let doc = Section::parse_str(text).unwrap();
        let ty = doc.find_section("Type").unwrap();
        assert_eq!(ty.get("Objective lens magnification"), Some("16"));
    }

    #[test]
    fn test_values_may_be_empty() {
        let doc = Section::parse_str("<S>\nCamera 1 capture range = \n</S>\n").unwrap();
        assert_eq!(doc.child("S").unwrap().get("Camera 1 capture range"), Some(""));
    }
}
