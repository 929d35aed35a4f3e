// CLEN Gateway - Sensor network control node
// Copyright (c) 2025 David Martin Venti
//
// Dual-licensed under AGPL-3.0 and Commercial License.
// See LICENSE file for details.

//! Relayed transport talking to a relay bridge over an in-process broker

use std::sync::Arc;
use std::time::Duration;

use clen::transport::serial::MemorySerial;
use clen::transport::SerialLink;
use clen::*;
use tokio_util::sync::CancellationToken;

/// Simulated serial network behind the bridge: one sensor, 00A
fn serial_network() -> MemorySerial {
    MemorySerial::new().with_responder(|written| {
        let Ok(frame) = decode(written) else {
            return Vec::new();
        };
        match (frame.msg_type, frame.dest.as_str()) {
            (MessageType::IdnReq, _) => vec!["#00A001IDNRES#\r\n".to_string()],
            (MessageType::Config, "00A") => vec!["#00A001CFGACK#".to_string()],
            (MessageType::QryMsr, "00A") => vec!["#00A001MSRVALTE715#".to_string()],
            _ => Vec::new(),
        }
    })
}

async fn start_bridge(broker: Arc<MemoryBroker>, port: MemorySerial, cancel: CancellationToken) {
    let bridge = RelayBridge::new(broker.clone(), SerialLink::new(port), "clen/serial");
    bridge.start(cancel).await.unwrap();
}

#[tokio::test(start_paused = true)]
async fn discovery_and_collection_through_relay() {
    let broker = Arc::new(MemoryBroker::new());
    let port = serial_network();
    let cancel = CancellationToken::new();
    start_bridge(broker.clone(), port.clone(), cancel.clone()).await;

    let mut transport = RelayedTransport::open(broker.clone(), &RelayedConfig::default(), "test")
        .await
        .unwrap();

    let calibration = Arc::new(
        CalibrationTable::from_reader("00A,roof,TE,temperature,C,-50,0.1\n".as_bytes()).unwrap(),
    );
    let config = CollectionConfig {
        max_nodes: 2,
        ..Default::default()
    };
    assert_eq!(transport.kind().discovery_window(config.max_nodes), Duration::from_secs(10));

    let mut discovery = DiscoveryEngine::new(calibration.clone(), config.clone());
    let nodes = discovery.run(&mut transport, &cancel).await.unwrap().unwrap();
    assert_eq!(nodes, vec![NodeId::new("00A").unwrap()]);

    let store = Arc::new(MemoryStore::new(store::templates(&calibration), 10_800));
    let collector = CollectionScheduler::new(
        calibration,
        store,
        Arc::new(ManualClock::new(0)),
        CollectionProgress::new(),
        config,
        nodes,
    );
    let sets = collector.collect(&mut transport, &cancel).await;
    let te = sets[0].1.get(&Tag::new("TE").unwrap()).unwrap();
    assert!((te.value().unwrap() - 21.5).abs() < 1e-9);

    let written = port.written();
    assert_eq!(written[0], "#001000IDNREQ#");
    assert_eq!(written[1], "#00100ACONFIGTG1#");
    assert_eq!(written[2], "#00100AQRYMSR#");

    cancel.cancel();
}

#[tokio::test(start_paused = true)]
async fn relayed_send_is_refused_while_outstanding() {
    let broker = Arc::new(MemoryBroker::new());
    let mut transport = RelayedTransport::open(broker, &RelayedConfig::default(), "test")
        .await
        .unwrap();
    let a = NodeId::new("00A").unwrap();

    transport
        .send(&a, MessageType::QryMsr, "", Duration::from_millis(600))
        .await
        .unwrap();
    let err = transport
        .send(&a, MessageType::QryMsr, "", Duration::from_millis(600))
        .await
        .unwrap_err();
    assert!(matches!(err, TransportError::CommandOutstanding { .. }));

    // no bridge: the receive times out and closes the exchange
    assert!(transport.receive(Duration::from_millis(600)).await.unwrap().is_none());
    transport
        .send(&a, MessageType::QryMsr, "", Duration::from_millis(600))
        .await
        .unwrap();
}
