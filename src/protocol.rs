// CLEN Gateway - Sensor network control node
// Copyright (c) 2025 David Martin Venti
//
// Dual-licensed under AGPL-3.0 and Commercial License.
// See LICENSE file for details.

//! Wire frame used between the control node and the sensor nodes
//!
//! # Frame Format
//!
//! ```text
//! # SENDER(3) DEST(3) TYPE(6) [DATA] #
//! ```
//!
//! The frame is bounded by a single delimiter byte on each side. There is no
//! escaping: payloads must not contain the delimiter.

use std::fmt;

use crate::error::FrameError;

/// Start/end delimiter of every frame
pub const DELIMITER: char = '#';

/// Length of a frame with no data: two delimiters plus the 12-byte header
pub const HEADER_FRAME_LEN: usize = 14;

/// Offset where the data field starts
const DATA_OFFSET: usize = 13;

/// A 3-character sensor network address
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct NodeId(String);

impl NodeId {
    /// Length of every node id
    pub const LEN: usize = 3;

    /// Validate and wrap a node id
    pub fn new(id: impl Into<String>) -> Result<Self, FrameError> {
        let id = id.into();
        if id.len() == Self::LEN && id.is_ascii() {
            Ok(Self(id))
        } else {
            Err(FrameError::InvalidNodeId(id))
        }
    }

    /// Reserved broadcast address `000`
    pub fn broadcast() -> Self {
        Self("000".to_string())
    }

    /// Reserved address of the control node itself, `001`
    pub fn control() -> Self {
        Self("001".to_string())
    }

    /// True for the broadcast address
    pub fn is_broadcast(&self) -> bool {
        self.0 == "000"
    }

    /// True for either reserved address
    pub fn is_reserved(&self) -> bool {
        self.0 == "000" || self.0 == "001"
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for NodeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl std::str::FromStr for NodeId {
    type Err = FrameError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::new(s)
    }
}

/// Six-character message type code
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum MessageType {
    /// Discovery request, broadcast, no data
    IdnReq,
    /// Node configuration, data `TG<minutes>`
    Config,
    /// Configuration acknowledgement
    CfgAck,
    /// Measurement query, no data
    QryMsr,
    /// Any other code, including measurement responses
    Other(String),
}

impl MessageType {
    /// Length of every type code
    pub const LEN: usize = 6;

    /// Wire code
    pub fn code(&self) -> &str {
        match self {
            Self::IdnReq => "IDNREQ",
            Self::Config => "CONFIG",
            Self::CfgAck => "CFGACK",
            Self::QryMsr => "QRYMSR",
            Self::Other(code) => code,
        }
    }

    /// Map a wire code to a type
    pub fn from_code(code: &str) -> Self {
        match code {
            "IDNREQ" => Self::IdnReq,
            "CONFIG" => Self::Config,
            "CFGACK" => Self::CfgAck,
            "QRYMSR" => Self::QryMsr,
            other => Self::Other(other.to_string()),
        }
    }
}

impl fmt::Display for MessageType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.code())
    }
}

/// A decoded frame
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    pub sender: NodeId,
    pub dest: NodeId,
    pub msg_type: MessageType,
    pub data: String,
}

impl Frame {
    /// Build a frame
    pub fn new(sender: NodeId, dest: NodeId, msg_type: MessageType, data: impl Into<String>) -> Self {
        Self {
            sender,
            dest,
            msg_type,
            data: data.into(),
        }
    }

    /// Wire form of this frame
    pub fn to_wire(&self) -> String {
        encode(&self.sender, &self.dest, &self.msg_type, &self.data)
    }

    /// Parse a wire string
    pub fn from_wire(wire: &str) -> Result<Self, FrameError> {
        decode(wire)
    }
}

impl fmt::Display for Frame {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.to_wire())
    }
}

/// Encode a frame to its wire form.
///
/// `data` must not contain [`DELIMITER`].
pub fn encode(sender: &NodeId, dest: &NodeId, msg_type: &MessageType, data: &str) -> String {
    let mut wire = String::with_capacity(HEADER_FRAME_LEN + data.len());
    wire.push(DELIMITER);
    wire.push_str(sender.as_str());
    wire.push_str(dest.as_str());
    wire.push_str(msg_type.code());
    wire.push_str(data);
    wire.push(DELIMITER);
    wire
}

/// Decode a wire string.
///
/// Fields are at fixed offsets: sender `[1,4)`, dest `[4,7)`, type `[7,13)`,
/// data `[13, len-1)`. Anything not bounded by delimiters or shorter than a
/// header-only frame is rejected whole.
pub fn decode(wire: &str) -> Result<Frame, FrameError> {
    let len = wire.len();
    if len == 0 {
        return Err(FrameError::Empty);
    }
    if !wire.starts_with(DELIMITER) || !wire.ends_with(DELIMITER) {
        return Err(FrameError::MissingDelimiter);
    }
    if len < HEADER_FRAME_LEN {
        return Err(FrameError::TooShort {
            len,
            min: HEADER_FRAME_LEN,
        });
    }
    let bytes = wire.as_bytes();
    if !bytes[..DATA_OFFSET].is_ascii() {
        return Err(FrameError::NonAsciiHeader);
    }

    Ok(Frame {
        sender: NodeId(wire[1..4].to_string()),
        dest: NodeId(wire[4..7].to_string()),
        msg_type: MessageType::from_code(&wire[7..DATA_OFFSET]),
        data: wire[DATA_OFFSET..len - 1].to_string(),
    })
}

/// Reassembles frames from a byte stream that may split or merge them.
///
/// CR/LF are stripped, bytes before a start delimiter are dropped as noise.
#[derive(Debug, Default)]
pub struct FrameAccumulator {
    buffer: Vec<u8>,
}

impl FrameAccumulator {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append raw bytes from the link
    pub fn push(&mut self, bytes: &[u8]) {
        self.buffer
            .extend(bytes.iter().copied().filter(|b| *b != b'\r' && *b != b'\n'));
    }

    /// Take the next delimited candidate and decode it.
    ///
    /// Returns `None` while no complete candidate is buffered.
    pub fn next_frame(&mut self) -> Option<Result<Frame, FrameError>> {
        let delim = DELIMITER as u8;
        loop {
            let start = match self.buffer.iter().position(|b| *b == delim) {
                Some(pos) => pos,
                None => {
                    self.buffer.clear();
                    return None;
                }
            };
            if start > 0 {
                self.buffer.drain(..start);
            }

            let end = self.buffer[1..].iter().position(|b| *b == delim)? + 1;

            // A header never contains the delimiter, so a shorter candidate
            // means we started on the closing delimiter of a lost frame.
            if end + 1 < HEADER_FRAME_LEN {
                self.buffer.drain(..end);
                continue;
            }

            let candidate: Vec<u8> = self.buffer.drain(..=end).collect();
            return Some(decode(&String::from_utf8_lossy(&candidate)));
        }
    }

    /// Number of buffered bytes
    pub fn pending(&self) -> usize {
        self.buffer.len()
    }

    /// Drop everything buffered
    pub fn clear(&mut self) {
        self.buffer.clear();
    }
}
