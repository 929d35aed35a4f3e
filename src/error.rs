// CLEN Gateway - Sensor network control node
// Copyright (c) 2025 David Martin Venti
//
// Dual-licensed under AGPL-3.0 and Commercial License.
// See LICENSE file for details.

//! Error types for the control node
//!
//! This module defines all error types used throughout the library.

use thiserror::Error;

use crate::protocol::NodeId;

/// Result type alias for control node operations
pub type Result<T> = std::result::Result<T, ClenError>;

/// Main error type for control node operations
#[derive(Error, Debug)]
pub enum ClenError {
    /// Frame decoding error
    #[error("Frame error: {0}")]
    Frame(#[from] FrameError),

    /// Calibration table error
    #[error("Calibration error: {0}")]
    Calibration(#[from] CalibrationError),

    /// Transport error
    #[error("Transport error: {0}")]
    Transport(#[from] TransportError),

    /// Time-series store error
    #[error("Store error: {0}")]
    Store(#[from] StoreError),

    /// Discovery error
    #[error("Discovery error: {0}")]
    Discovery(#[from] DiscoveryError),

    /// Telemetry sink error
    #[error("Sink error: {0}")]
    Sink(#[from] SinkError),
}

/// Reasons a wire string is not a valid frame
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum FrameError {
    /// Nothing to decode
    #[error("Empty frame")]
    Empty,

    /// First or last character is not the delimiter
    #[error("Missing frame delimiter")]
    MissingDelimiter,

    /// Shorter than a header-only frame
    #[error("Frame too short: {len} bytes (min: {min})")]
    TooShort { len: usize, min: usize },

    /// Header bytes outside the ASCII range
    #[error("Frame header is not ASCII")]
    NonAsciiHeader,

    /// Node id is not three ASCII characters
    #[error("Invalid node id: {0:?}")]
    InvalidNodeId(String),
}

/// Errors while loading the calibration table
#[derive(Error, Debug)]
pub enum CalibrationError {
    /// File could not be read
    #[error("Cannot read calibration file {path}: {source}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },

    /// CSV layer failure
    #[error("Malformed calibration file: {0}")]
    Csv(#[from] csv::Error),

    /// Line does not have the expected seven fields
    #[error("Line {line}: expected {expected} fields, got {actual}")]
    FieldCount {
        line: u64,
        expected: usize,
        actual: usize,
    },

    /// Invalid node id, tag or number
    #[error("Line {line}: invalid {field}: {value:?}")]
    InvalidField {
        line: u64,
        field: &'static str,
        value: String,
    },

    /// Same (node, tag) configured twice
    #[error("Duplicate sensor tag {tag} for node {node}")]
    DuplicateEntry { node: NodeId, tag: String },
}

/// Errors related to the sensor transport
#[derive(Error, Debug)]
pub enum TransportError {
    /// Physical link could not be opened
    #[error("Cannot open serial port {port}: {reason}")]
    Open { port: String, reason: String },

    /// I/O failure on an open link
    #[error("Serial I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// A previous command is still waiting for its reply
    #[error("Command to {dest} still outstanding")]
    CommandOutstanding { dest: NodeId },

    /// Pub/sub broker failure
    #[error("Broker error: {0}")]
    Broker(String),

    /// Transport has been closed
    #[error("Transport closed")]
    Closed,
}

/// Reasons a relay message is not a valid envelope
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum EnvelopeError {
    /// Fewer than four `;`-separated fields
    #[error("Envelope has {0} fields, expected 4")]
    FieldCount(usize),

    /// Purpose is neither COMMAND nor RESPONSE
    #[error("Unknown envelope purpose: {0:?}")]
    UnknownPurpose(String),

    /// Wait budget is not an integer
    #[error("Invalid wait budget: {0:?}")]
    InvalidBudget(String),
}

/// Errors related to the local time-series store
#[derive(Error, Debug)]
pub enum StoreError {
    /// Write does not carry the node's full template
    #[error("Template mismatch for node {node}: expected {expected:?}, got {actual:?}")]
    TemplateMismatch {
        node: NodeId,
        expected: Vec<String>,
        actual: Vec<String>,
    },

    /// Write is not newer than the last stored row
    #[error("Stale write for node {node}: timestamp {timestamp} <= last {last}")]
    StaleTimestamp {
        node: NodeId,
        timestamp: u64,
        last: u64,
    },

    /// Backing file failure
    #[error("Store I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Backing file is malformed
    #[error("Corrupt store file {path}: {reason}")]
    Corrupt { path: String, reason: String },
}

/// Errors that end discovery
#[derive(Error, Debug)]
pub enum DiscoveryError {
    /// Discovered nodes without calibration entries
    #[error("Discovered nodes not present in calibration: {0:?}")]
    UnknownNodes(Vec<NodeId>),

    /// Transport failure during discovery
    #[error("Transport failed during discovery: {0}")]
    Transport(#[from] TransportError),
}

/// Errors from a telemetry sink
#[derive(Error, Debug)]
pub enum SinkError {
    /// `connect` has not succeeded
    #[error("Sink not connected")]
    NotConnected,

    /// Remote answered with a rejection
    #[error("Rejected by remote: {0}")]
    Rejected(String),

    /// Request failed before an answer
    #[error("Request failed: {0}")]
    Request(String),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let err = ClenError::Frame(FrameError::TooShort { len: 5, min: 14 });
        let msg = format!("{}", err);
        assert!(msg.contains("too short"));
        assert!(msg.contains("14"));
    }

    #[test]
    fn test_error_conversion() {
        let err: ClenError = SinkError::NotConnected.into();
        assert!(matches!(err, ClenError::Sink(SinkError::NotConnected)));
    }

    #[test]
    fn test_unknown_nodes_display() {
        let err = DiscoveryError::UnknownNodes(vec![NodeId::new("00D").unwrap()]);
        assert!(err.to_string().contains("00D"));
    }
}
