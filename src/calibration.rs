// CLEN Gateway - Sensor network control node
// Copyright (c) 2025 David Martin Venti
//
// Dual-licensed under AGPL-3.0 and Commercial License.
// See LICENSE file for details.

//! Calibration table
//!
//! Maps `(node, tag)` to a linear transform plus descriptive metadata. The
//! table also defines which nodes are configured and which tags each of them
//! reports. It is immutable once loaded.
//!
//! # File Format
//!
//! ```text
//! ; node,position,tag,measured item,unit,offset,multiplier
//! 00A,greenhouse,TE,temperature,C,-50.0,0.1
//! ```

use std::collections::HashMap;
use std::fs::File;
use std::path::Path;

use tracing::{debug, info};

use crate::error::CalibrationError;
use crate::measurement::Tag;
use crate::protocol::NodeId;

const FIELD_COUNT: usize = 7;

/// Calibration of one tag on one node
#[derive(Debug, Clone, PartialEq)]
pub struct CalibrationEntry {
    pub position: String,
    pub measured_item: String,
    pub unit: String,
    pub offset: f64,
    pub multiplier: f64,
}

impl CalibrationEntry {
    /// `raw * multiplier + offset`
    pub fn apply(&self, raw: i64) -> f64 {
        raw as f64 * self.multiplier + self.offset
    }
}

/// The loaded calibration table
#[derive(Debug, Clone, Default)]
pub struct CalibrationTable {
    entries: HashMap<(NodeId, Tag), CalibrationEntry>,
    nodes: Vec<NodeId>,
    tags_by_node: HashMap<NodeId, Vec<Tag>>,
}

impl CalibrationTable {
    /// Create an empty table
    pub fn new() -> Self {
        Self::default()
    }

    /// Add an entry; duplicates are refused
    pub fn insert(
        &mut self,
        node: NodeId,
        tag: Tag,
        entry: CalibrationEntry,
    ) -> Result<(), CalibrationError> {
        let key = (node.clone(), tag.clone());
        if self.entries.contains_key(&key) {
            return Err(CalibrationError::DuplicateEntry {
                node,
                tag: tag.to_string(),
            });
        }

        match self.tags_by_node.get_mut(&node) {
            Some(tags) => tags.push(tag),
            None => {
                self.nodes.push(node.clone());
                self.tags_by_node.insert(node, vec![tag]);
            }
        }
        self.entries.insert(key, entry);
        Ok(())
    }

    /// Load the table from a calibration file
    pub fn load(path: impl AsRef<Path>) -> Result<Self, CalibrationError> {
        let path = path.as_ref();
        let file = File::open(path).map_err(|source| CalibrationError::Io {
            path: path.display().to_string(),
            source,
        })?;
        let table = Self::from_reader(file)?;
        info!(
            path = %path.display(),
            nodes = table.nodes.len(),
            entries = table.entries.len(),
            "Calibration table loaded"
        );
        Ok(table)
    }

    /// Parse a calibration file from any reader
    pub fn from_reader(reader: impl std::io::Read) -> Result<Self, CalibrationError> {
        let mut csv = csv::ReaderBuilder::new()
            .has_headers(false)
            .comment(Some(b';'))
            .flexible(true)
            .trim(csv::Trim::All)
            .from_reader(reader);

        let mut table = Self::new();
        for record in csv.records() {
            let record = record?;
            let line = record.position().map(|p| p.line()).unwrap_or(0);

            // Short lines carry no entry
            let raw_len: usize = record.iter().map(str::len).sum::<usize>() + record.len().saturating_sub(1);
            if raw_len <= 5 {
                debug!(line, "Skipping short calibration line");
                continue;
            }
            if record.len() != FIELD_COUNT {
                return Err(CalibrationError::FieldCount {
                    line,
                    expected: FIELD_COUNT,
                    actual: record.len(),
                });
            }

            let node = NodeId::new(&record[0]).map_err(|_| CalibrationError::InvalidField {
                line,
                field: "node id",
                value: record[0].to_string(),
            })?;
            let tag = Tag::new(&record[2]).ok_or_else(|| CalibrationError::InvalidField {
                line,
                field: "tag",
                value: record[2].to_string(),
            })?;
            let number = |idx: usize, field: &'static str| {
                record[idx]
                    .parse::<f64>()
                    .map_err(|_| CalibrationError::InvalidField {
                        line,
                        field,
                        value: record[idx].to_string(),
                    })
            };
            let entry = CalibrationEntry {
                position: record[1].to_string(),
                measured_item: record[3].to_string(),
                unit: record[4].to_string(),
                offset: number(5, "offset")?,
                multiplier: number(6, "multiplier")?,
            };
            table.insert(node, tag, entry)?;
        }
        Ok(table)
    }

    /// Entry for `(node, tag)`
    pub fn get(&self, node: &NodeId, tag: &Tag) -> Option<&CalibrationEntry> {
        self.entries.get(&(node.clone(), tag.clone()))
    }

    /// Calibrate a raw reading; `None` when `(node, tag)` is not configured
    pub fn calibrate(&self, node: &NodeId, tag: &Tag, raw: i64) -> Option<f64> {
        self.get(node, tag).map(|entry| entry.apply(raw))
    }

    /// Configured nodes, in file order
    pub fn nodes(&self) -> &[NodeId] {
        &self.nodes
    }

    /// Configured tags of a node, in file order
    pub fn tags(&self, node: &NodeId) -> &[Tag] {
        self.tags_by_node.get(node).map(Vec::as_slice).unwrap_or(&[])
    }

    pub fn is_configured(&self, node: &NodeId) -> bool {
        self.tags_by_node.contains_key(node)
    }

    /// Number of entries
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;

    const SAMPLE: &str = "\
; node,position,tag,item,unit,offset,mult
00A,greenhouse,TE,temperature,C,-50.0,0.1
00A,greenhouse,HU,humidity,%,0,1

00B,cellar,TE,temperature,C,0.5,0.01
";

    fn node(s: &str) -> NodeId {
        NodeId::new(s).unwrap()
    }

    fn tag(s: &str) -> Tag {
        Tag::new(s).unwrap()
    }

    #[test]
    fn test_load_sample() {
        let table = CalibrationTable::from_reader(SAMPLE.as_bytes()).unwrap();
        assert_eq!(table.len(), 3);
        assert_eq!(table.nodes(), &[node("00A"), node("00B")]);
        assert_eq!(table.tags(&node("00A")), &[tag("TE"), tag("HU")]);
        assert!(table.tags(&node("00C")).is_empty());

        let entry = table.get(&node("00B"), &tag("TE")).unwrap();
        assert_eq!(entry.position, "cellar");
        assert_eq!(entry.unit, "C");
    }

    #[test]
    fn test_calibrate_linear() {
        let table = CalibrationTable::from_reader(SAMPLE.as_bytes()).unwrap();
        assert_relative_eq!(table.calibrate(&node("00A"), &tag("TE"), 715).unwrap(), 21.5, epsilon = 1e-9);
        assert_relative_eq!(table.calibrate(&node("00B"), &tag("TE"), 2000).unwrap(), 20.5, epsilon = 1e-9);
        assert_relative_eq!(table.calibrate(&node("00A"), &tag("TE"), -100).unwrap(), -60.0, epsilon = 1e-9);
        assert!(table.calibrate(&node("00B"), &tag("HU"), 10).is_none());
    }

    #[test]
    fn test_duplicate_entry_is_fatal() {
        let text = "00A,p,TE,t,C,0,1\n00A,q,TE,t,C,0,1\n";
        let err = CalibrationTable::from_reader(text.as_bytes()).unwrap_err();
        assert!(matches!(err, CalibrationError::DuplicateEntry { .. }));
    }

    #[test]
    fn test_bad_field_count() {
        let err = CalibrationTable::from_reader("00A,p,TE,t,C,0\n".as_bytes()).unwrap_err();
        assert!(matches!(err, CalibrationError::FieldCount { actual: 6, .. }));
    }

    #[test]
    fn test_bad_number() {
        let err = CalibrationTable::from_reader("00A,p,TE,t,C,zero,1\n".as_bytes()).unwrap_err();
        assert!(matches!(
            err,
            CalibrationError::InvalidField { field: "offset", .. }
        ));
    }

    #[test]
    fn test_bad_node_id() {
        let err = CalibrationTable::from_reader("0A,p,TE,t,C,0,1\n".as_bytes()).unwrap_err();
        assert!(matches!(
            err,
            CalibrationError::InvalidField { field: "node id", .. }
        ));
    }

    #[test]
    fn test_load_from_file() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        std::io::Write::write_all(&mut file, SAMPLE.as_bytes()).unwrap();
        let table = CalibrationTable::load(file.path()).unwrap();
        assert!(table.is_configured(&node("00B")));
    }

    #[test]
    fn test_missing_file() {
        let err = CalibrationTable::load("/nonexistent/clen.cfg").unwrap_err();
        assert!(matches!(err, CalibrationError::Io { .. }));
    }
}
