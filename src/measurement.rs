// CLEN Gateway - Sensor network control node
// Copyright (c) 2025 David Martin Venti
//
// Dual-licensed under AGPL-3.0 and Commercial License.
// See LICENSE file for details.

//! Measurement values and the measurement-response payload
//!
//! A response payload is a `:`-joined list of `<TAG><VALUE>` segments where
//! the tag is always two characters.

use std::collections::BTreeMap;
use std::fmt;

use tracing::warn;

use crate::protocol::NodeId;

/// Two-character measurement tag
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Tag(String);

impl Tag {
    pub const LEN: usize = 2;

    /// Validate and wrap a tag
    pub fn new(tag: impl Into<String>) -> Option<Self> {
        let tag = tag.into();
        (tag.len() == Self::LEN && tag.is_ascii()).then_some(Self(tag))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for Tag {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// A calibrated value, or the unknown sentinel
#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub enum Reading {
    #[default]
    Unknown,
    Value(f64),
}

impl Reading {
    /// Text used for unknown values in stores
    pub const UNKNOWN_TEXT: &'static str = "U";

    pub fn value(&self) -> Option<f64> {
        match self {
            Self::Value(v) => Some(*v),
            Self::Unknown => None,
        }
    }

    pub fn is_unknown(&self) -> bool {
        matches!(self, Self::Unknown)
    }

    /// Parse the store text form
    pub fn parse(text: &str) -> Option<Self> {
        if text == Self::UNKNOWN_TEXT {
            Some(Self::Unknown)
        } else {
            text.parse().ok().map(Self::Value)
        }
    }
}

impl fmt::Display for Reading {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Unknown => f.write_str(Self::UNKNOWN_TEXT),
            Self::Value(v) => write!(f, "{}", v),
        }
    }
}

/// Readings of one node for one timestamp.
///
/// The key set is fixed at construction to the node's configured tags and
/// never changes, so every store write has the same arity.
#[derive(Debug, Clone, PartialEq)]
pub struct MeasurementSet {
    readings: BTreeMap<Tag, Reading>,
}

impl MeasurementSet {
    /// All tags set to unknown
    pub fn unknown<'a>(tags: impl IntoIterator<Item = &'a Tag>) -> Self {
        Self {
            readings: tags.into_iter().map(|t| (t.clone(), Reading::Unknown)).collect(),
        }
    }

    /// Build from explicit readings
    pub fn from_readings(readings: impl IntoIterator<Item = (Tag, Reading)>) -> Self {
        Self {
            readings: readings.into_iter().collect(),
        }
    }

    /// Set a reading; tags outside the key set are refused
    pub fn set(&mut self, tag: &Tag, value: f64) -> bool {
        match self.readings.get_mut(tag) {
            Some(slot) => {
                *slot = Reading::Value(value);
                true
            }
            None => false,
        }
    }

    pub fn get(&self, tag: &Tag) -> Option<Reading> {
        self.readings.get(tag).copied()
    }

    /// Tags in key order
    pub fn tags(&self) -> impl Iterator<Item = &Tag> {
        self.readings.keys()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&Tag, &Reading)> {
        self.readings.iter()
    }

    pub fn len(&self) -> usize {
        self.readings.len()
    }

    pub fn is_empty(&self) -> bool {
        self.readings.is_empty()
    }

    /// Number of tags holding a value
    pub fn known_count(&self) -> usize {
        self.readings.values().filter(|r| !r.is_unknown()).count()
    }
}

/// One calibrated measurement ready for a telemetry sink
#[derive(Debug, Clone, PartialEq)]
pub struct MeasurementRecord {
    pub node: NodeId,
    pub tag: Tag,
    pub position: String,
    pub measured_item: String,
    pub unit: String,
    pub value: f64,
}

/// Split a measurement payload into `(tag, raw value)` pairs.
///
/// Segments shorter than a tag are dropped with a warning.
pub fn parse_payload(data: &str) -> Vec<(Tag, String)> {
    if data.is_empty() {
        return Vec::new();
    }

    data.split(':')
        .filter_map(|segment| {
            let tag = segment.get(..Tag::LEN).and_then(Tag::new);
            match tag {
                Some(tag) => Some((tag, segment[Tag::LEN..].to_string())),
                None => {
                    warn!(segment, "Malformed measurement segment ignored");
                    None
                }
            }
        })
        .collect()
}
