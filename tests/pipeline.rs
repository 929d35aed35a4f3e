// CLEN Gateway - Sensor network control node
// Copyright (c) 2025 David Martin Venti
//
// Dual-licensed under AGPL-3.0 and Commercial License.
// See LICENSE file for details.

//! End-to-end tests: discovery, collection and delivery over a simulated network

use std::sync::Arc;

use approx::assert_relative_eq;
use clen::*;
use tokio_util::sync::CancellationToken;

const CALIBRATION: &str = "\
; node,position,tag,item,unit,offset,multiplier
00A,greenhouse,TE,temperature,C,-50.0,0.1
00A,greenhouse,HU,humidity,%,0,1
00B,cellar,TE,temperature,C,0,0.01
00C,barn,TE,temperature,C,0,0.01
";

fn node(s: &str) -> NodeId {
    NodeId::new(s).unwrap()
}

fn tag(s: &str) -> Tag {
    Tag::new(s).unwrap()
}

fn response(sender: &str, msg_type: &str, data: &str) -> Frame {
    Frame::new(node(sender), NodeId::control(), MessageType::from_code(msg_type), data)
}

/// Two sensors answering every command; 00C is configured but absent
fn network() -> MemoryTransport {
    MemoryTransport::new().with_responder(|cmd| match (&cmd.msg_type, cmd.dest.as_str()) {
        (MessageType::IdnReq, _) => vec![response("00A", "IDNRES", ""), response("00B", "IDNRES", "")],
        (MessageType::Config, dest) => vec![response(dest, "CFGACK", "")],
        (MessageType::QryMsr, "00A") => vec![response("00A", "MSRVAL", "TE715:HU48")],
        (MessageType::QryMsr, "00B") => vec![response("00B", "MSRVAL", "TE2000:ZZ5")],
        _ => Vec::new(),
    })
}

#[tokio::test(start_paused = true)]
async fn collect_then_deliver() {
    let calibration = Arc::new(CalibrationTable::from_reader(CALIBRATION.as_bytes()).unwrap());
    let store = Arc::new(MemoryStore::new(store::templates(&calibration), 10_800));
    let progress = CollectionProgress::new();
    let config = CollectionConfig::default();
    let cancel = CancellationToken::new();
    let mut transport = network();

    let mut discovery = DiscoveryEngine::new(calibration.clone(), config.clone());
    let nodes = discovery.run(&mut transport, &cancel).await.unwrap().unwrap();
    assert_eq!(nodes, vec![node("00A"), node("00B")]);

    let collector = CollectionScheduler::new(
        calibration.clone(),
        store.clone(),
        Arc::new(ManualClock::new(0)),
        progress.clone(),
        config.clone(),
        nodes,
    );
    for t in [60, 120, 180] {
        collector.run_cycle(&mut transport, t, &cancel).await;
    }
    assert_eq!(progress.get(), 180);
    assert!(store.last_timestamp(&node("00C")).is_none());

    let dir = tempfile::tempdir().unwrap();
    let retriever_config = RetrieverConfig {
        progress_file: dir.path().join("last_sent_ts.dat"),
        ..Default::default()
    };
    let mut retriever = RetrieverSync::new(
        calibration.clone(),
        store.clone(),
        progress.clone(),
        retriever_config.clone(),
        config.interval_secs,
        MemorySink::new(),
    );
    retriever.sink_mut().connect().await.unwrap();

    assert_eq!(retriever.step().await, StepOutcome::Delivered(120));
    assert_eq!(retriever.step().await, StepOutcome::Delivered(180));
    assert_eq!(retriever.step().await, StepOutcome::Idle);

    let (ts, batch) = &retriever.sink().batches()[0];
    assert_eq!(*ts, 120);
    assert_eq!(batch.len(), 3);
    let te_a = batch
        .iter()
        .find(|r| r.node == node("00A") && r.tag == tag("TE"))
        .unwrap();
    assert_relative_eq!(te_a.value, 21.5, epsilon = 1e-9);
    assert_eq!(te_a.position, "greenhouse");
    let te_b = batch.iter().find(|r| r.node == node("00B")).unwrap();
    assert_relative_eq!(te_b.value, 20.0, epsilon = 1e-9);

    // A restarted retriever resumes from the persisted progress
    let restarted = RetrieverSync::new(
        calibration,
        store,
        progress,
        retriever_config,
        config.interval_secs,
        MemorySink::new(),
    );
    assert_eq!(restarted.last_sent(), 180);
}

#[tokio::test(start_paused = true)]
async fn silent_cycle_becomes_gap() {
    let calibration = Arc::new(CalibrationTable::from_reader(CALIBRATION.as_bytes()).unwrap());
    let store = Arc::new(MemoryStore::new(store::templates(&calibration), 10_800));
    let progress = CollectionProgress::new();
    let cancel = CancellationToken::new();

    let collector = CollectionScheduler::new(
        calibration.clone(),
        store.clone(),
        Arc::new(ManualClock::new(0)),
        progress.clone(),
        CollectionConfig::default(),
        vec![node("00A")],
    );

    let mut answering = network();
    let mut silent = MemoryTransport::new();
    collector.run_cycle(&mut answering, 60, &cancel).await;
    collector.run_cycle(&mut silent, 120, &cancel).await;
    collector.run_cycle(&mut answering, 180, &cancel).await;

    // the silent cycle still stored a full-arity row of unknowns
    let silent_row = store.fetch(&node("00A"), 120).unwrap();
    assert_eq!(silent_row.len(), 2);
    assert_eq!(silent_row.known_count(), 0);

    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("last_sent_ts.dat");
    ProgressFile::new(&path).save(60).unwrap();
    let mut retriever = RetrieverSync::new(
        calibration,
        store,
        progress,
        RetrieverConfig {
            progress_file: path,
            ..Default::default()
        },
        60,
        MemorySink::new(),
    );
    retriever.sink_mut().connect().await.unwrap();

    assert_eq!(retriever.step().await, StepOutcome::GapSkipped(120));
    assert_eq!(retriever.step().await, StepOutcome::Delivered(180));
    assert_eq!(retriever.sink().timestamps(), vec![180]);
}

#[tokio::test(start_paused = true)]
async fn retriever_run_stops_on_cancel() {
    let calibration = Arc::new(CalibrationTable::from_reader(CALIBRATION.as_bytes()).unwrap());
    let store: Arc<dyn MeasurementStore> = Arc::new(MemoryStore::new(store::templates(&calibration), 10_800));
    let dir = tempfile::tempdir().unwrap();
    let mut retriever = RetrieverSync::new(
        calibration,
        store,
        CollectionProgress::new(),
        RetrieverConfig {
            progress_file: dir.path().join("p.dat"),
            ..Default::default()
        },
        60,
        MemorySink::new(),
    );

    let cancel = CancellationToken::new();
    let trigger = cancel.clone();
    tokio::spawn(async move {
        tokio::time::sleep(std::time::Duration::from_secs(90)).await;
        trigger.cancel();
    });
    let start = tokio::time::Instant::now();
    retriever.run(&cancel).await;
    assert!(start.elapsed() < std::time::Duration::from_secs(91));
    assert_eq!(retriever.last_sent(), 0);
}
