// CLEN Gateway - Sensor network control node
// Copyright (c) 2025 David Martin Venti
//
// Dual-licensed under AGPL-3.0 and Commercial License.
// See LICENSE file for details.

//! # CLEN - Control node for a wireless sensor network
//!
//! Discovers sensor nodes over a serial link (direct or relayed through a
//! pub/sub broker), polls them on a wall-clock schedule, calibrates their
//! readings into a local time-series store and delivers them to a remote
//! telemetry sink at its own pace.
//!
//! ## Key Features
//!
//! - **Fixed framing**: `#SSSDDDTTTTTT[data]#`, no checksums, no escaping
//! - **One command at a time**: replies are matched to the single open exchange
//! - **Fixed arity**: every stored row carries the node's full tag set
//! - **Forward-only delivery**: durable progress, gaps skipped once passed
//!
//! ## Quick Start
//!
//! ```rust
//! use clen::{decode, encode, MessageType, NodeId};
//!
//! let node = NodeId::new("00A").unwrap();
//! let wire = encode(&NodeId::control(), &node, &MessageType::QryMsr, "");
//! assert_eq!(wire, "#00100AQRYMSR#");
//!
//! let frame = decode("#00A001MSRVALTE215:HU48#").unwrap();
//! assert_eq!(frame.sender, node);
//! assert_eq!(frame.data, "TE215:HU48");
//! ```
//!
//! ## Modules
//!
//! - [`protocol`]: Wire frame, node ids and message types
//! - [`calibration`]: Per-(node, tag) linear calibration
//! - [`transport`]: Direct, relayed and in-memory transports
//! - [`relay`]: Relay envelope and the serial-side bridge
//! - [`discovery`]: Broadcast discovery state machine
//! - [`collector`]: Collection scheduler
//! - [`retriever`]: Delivery to telemetry sinks
//! - [`store`]: Local time-series store

// Modules
pub mod calibration;
pub mod collector;
pub mod config;
pub mod discovery;
pub mod error;
pub mod measurement;
pub mod progress;
pub mod protocol;
pub mod pubsub;
pub mod relay;
pub mod retriever;
pub mod sink;
pub mod store;
pub mod time;
pub mod transport;

// Re-exports for convenient access
pub use calibration::{CalibrationEntry, CalibrationTable};
pub use collector::{CollectionScheduler, CollectorStats};
pub use config::{
    CollectionConfig, MqttConfig, RelayConfig, RelayedConfig, RetrieverConfig, SerialConfig,
    StoreConfig, TransportConfig,
};
pub use discovery::{DiscoveryEngine, DiscoveryState};
pub use error::{
    CalibrationError, ClenError, DiscoveryError, EnvelopeError, FrameError, Result, SinkError,
    StoreError, TransportError,
};
pub use measurement::{MeasurementRecord, MeasurementSet, Reading, Tag};
pub use progress::{CollectionProgress, ProgressFile};
pub use protocol::{decode, encode, Frame, FrameAccumulator, MessageType, NodeId};
pub use pubsub::{MemoryBroker, MqttBroker, PubSub};
pub use relay::{Envelope, Purpose, RelayBridge};
pub use retriever::{next_timestamp, RetrieverStats, RetrieverSync, StepOutcome};
pub use sink::{MemorySink, TelemetrySink};
pub use store::{FileStore, MeasurementStore, MemoryStore};
pub use time::{align, Clock, ManualClock, SystemClock};
pub use transport::{
    DirectTransport, MemoryTransport, RelayedTransport, Transport, TransportKind, TransportMetrics,
};

/// Library version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_version() {
        assert!(!VERSION.is_empty());
    }

    #[test]
    fn test_basic_roundtrip() {
        let frame = Frame::new(
            NodeId::new("00A").unwrap(),
            NodeId::control(),
            MessageType::CfgAck,
            "",
        );
        assert_eq!(decode(&encode(&frame.sender, &frame.dest, &frame.msg_type, "")).unwrap(), frame);
    }
}
