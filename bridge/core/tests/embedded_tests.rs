//! Embedded Transport Integration Tests
//!
//! Drive a worker-hosted interpreter through the public capability surface:
//! bootstrap phases, call isolation, snapshot pushes and file staging.

use std::collections::BTreeMap;
use std::time::Duration;

use futures::future::join_all;
use pretty_assertions::assert_eq;
use serde_json::{json, Map};
use tokio::sync::broadcast;

use flowbridge_core::{
    CallError, CapabilityClient, ClientEvent, ConnectionStatus, EmbeddedSettings,
    EmbeddedTransportClient, LastUpdateSnapshot, NodeId, SessionCall, SessionMethod,
};

async fn ready_client() -> EmbeddedTransportClient {
    let client = EmbeddedTransportClient::start(&EmbeddedSettings::default()).unwrap();
    client.wait_ready().await.unwrap();
    client
}

async fn next_snapshot(events: &mut broadcast::Receiver<ClientEvent>) -> LastUpdateSnapshot {
    tokio::time::timeout(Duration::from_secs(5), async {
        loop {
            if let ClientEvent::Snapshot(snapshot) = events.recv().await.unwrap() {
                return snapshot;
            }
        }
    })
    .await
    .expect("no snapshot pushed")
}

fn value_input(value: i64) -> Map<String, serde_json::Value> {
    let mut inputs = Map::new();
    inputs.insert("value".into(), json!(value));
    inputs
}

#[tokio::test]
async fn test_bootstrap_reports_every_phase_in_order() {
    let client = EmbeddedTransportClient::start(&EmbeddedSettings::default()).unwrap();
    // Nothing has been forwarded yet on the current-thread runtime
    let mut events = client.subscribe();

    let mut seen = Vec::new();
    let mut snapshot_before_ready = false;
    loop {
        match events.recv().await.unwrap() {
            ClientEvent::StatusChanged(status) => seen.push(status.code()),
            ClientEvent::Snapshot(_) => snapshot_before_ready = true,
            ClientEvent::Connected => break,
            other => panic!("unexpected event {other:?}"),
        }
    }

    assert_eq!(seen, vec![101, 102, 103, 104, 200]);
    assert!(snapshot_before_ready);
    assert!(client.status().is_ready());
}

#[tokio::test]
async fn test_concurrent_calls_get_their_own_results() {
    let client = ready_client().await;

    let calls = (0..20).map(|i| client.create_node("Constant", value_input(i), BTreeMap::new()));
    let nodes: Vec<_> = join_all(calls)
        .await
        .into_iter()
        .collect::<Result<_, _>>()
        .unwrap();

    for (i, node) in nodes.iter().enumerate() {
        assert_eq!(node.class_id, "Constant");
        assert_eq!(node.inputs["value"], json!(i));
    }
    let mut ids: Vec<NodeId> = nodes.iter().map(|n| n.id).collect();
    ids.sort();
    ids.dedup();
    assert_eq!(ids.len(), 20);
    assert_eq!(client.get_nodes().await.unwrap().len(), 20);
}

#[tokio::test]
async fn test_every_mutating_call_pushes_a_newer_snapshot() {
    let client = ready_client().await;
    let mut events = client.subscribe();

    let node = client
        .create_node("Add", Map::new(), BTreeMap::new())
        .await
        .unwrap();
    let first = next_snapshot(&mut events).await;

    let mut inputs = Map::new();
    inputs.insert("a".into(), json!(5));
    client
        .update_node_inputs(node.id, inputs, BTreeMap::new())
        .await
        .unwrap();
    let second = next_snapshot(&mut events).await;

    assert!(second.nodes > first.nodes);
    assert_eq!(second.node_classes, first.node_classes);
}

#[tokio::test]
async fn test_each_successful_call_pushes_exactly_one_snapshot() {
    let client = ready_client().await;
    let mut events = client.subscribe();

    let node = client
        .create_node("Constant", value_input(1), BTreeMap::new())
        .await
        .unwrap();
    client
        .update_node_inputs(node.id, value_input(2), BTreeMap::new())
        .await
        .unwrap();
    client.run_code("session.node_count()").await.unwrap();

    // Pushes travel separately from replies; let them land
    tokio::time::sleep(Duration::from_millis(100)).await;
    let mut snapshots = 0;
    while let Ok(event) = events.try_recv() {
        if matches!(event, ClientEvent::Snapshot(_)) {
            snapshots += 1;
        }
    }
    assert_eq!(snapshots, 3);
}

#[tokio::test]
async fn test_engine_error_rejects_only_that_call() {
    let client = ready_client().await;
    let mut events = client.subscribe();

    let err = client.remove_node(NodeId(42)).await.unwrap_err();
    let CallError::Engine(message) = err else {
        panic!("expected engine error, got {err:?}");
    };
    assert!(message.contains("does not exist"));

    // The snapshot still follows the failed call
    next_snapshot(&mut events).await;

    assert!(client.status().is_ready());
    assert!(client.get_nodes().await.unwrap().is_empty());
}

#[tokio::test]
async fn test_unknown_method_is_rejected() {
    let client = ready_client().await;

    assert_eq!(
        client.invoke(SessionCall::named("__init__")).await,
        Err(CallError::UnknownMethod("__init__".into()))
    );
    assert!(client
        .invoke(SessionCall::new(SessionMethod::GetFlows))
        .await
        .is_ok());
}

#[tokio::test]
async fn test_staged_files_are_visible_to_code() {
    let client = ready_client().await;

    let files = BTreeMap::from([("data/input.txt".to_string(), b"hello graph".to_vec())]);
    client.stage_files(files).await.unwrap();

    assert_eq!(
        client.run_code("read(\"data/input.txt\")").await.unwrap(),
        "hello graph"
    );
    assert_eq!(
        client.run_code("exists(\"missing.txt\")").await.unwrap(),
        "False"
    );
}

#[tokio::test]
async fn test_staging_queued_before_code_completes_first() {
    let client = ready_client().await;

    let files = BTreeMap::from([("queued.csv".to_string(), b"a,b".to_vec())]);
    let (staged, output) = tokio::join!(
        client.stage_files(files),
        client.run_code("exists(\"queued.csv\")"),
    );
    staged.unwrap();
    assert_eq!(output.unwrap(), "True");
}

#[tokio::test]
async fn test_run_code_loads_imported_packages() {
    let client = ready_client().await;
    client
        .create_node("Text", Map::new(), BTreeMap::new())
        .await
        .unwrap();

    let output = client
        .run_code("import numpy\n# count what the session holds\nsession.node_count()")
        .await
        .unwrap();
    assert_eq!(output, "1");

    let err = client.run_code("import nonexistent_pkg").await.unwrap_err();
    assert!(matches!(err, CallError::Engine(_)));
}

#[tokio::test]
async fn test_unreachable_runtime_halts_bootstrap() {
    let dir = tempfile::tempdir().unwrap();
    let settings = EmbeddedSettings {
        runtime_dir: Some(dir.path().join("missing")),
        ..Default::default()
    };
    let client = EmbeddedTransportClient::start(&settings).unwrap();

    let failure = client.wait_ready().await.unwrap_err();
    assert_eq!(failure.phase, ConnectionStatus::RUNTIME_LOADING);
    assert!(failure.reason.contains("unreachable"));

    assert_eq!(client.status(), ConnectionStatus::RUNTIME_LOADING);
    assert_eq!(client.bootstrap_failure(), Some(failure));
    assert_eq!(
        client.invoke(SessionCall::new(SessionMethod::GetNodes)).await,
        Err(CallError::NotReady(ConnectionStatus::RUNTIME_LOADING))
    );
}

#[tokio::test]
async fn test_unknown_extension_package_halts_at_installing() {
    let settings = EmbeddedSettings {
        extension_packages: vec!["no-such-package".into()],
        ..Default::default()
    };
    let client = EmbeddedTransportClient::start(&settings).unwrap();

    let failure = client.wait_ready().await.unwrap_err();
    assert_eq!(failure.phase, ConnectionStatus::PACKAGES_INSTALLING);
    assert!(!client.status().is_ready());
}

#[tokio::test]
async fn test_materialize_input_links_new_node() {
    let client = ready_client().await;
    let mut inputs = Map::new();
    inputs.insert("a".into(), json!(7));
    let add = client
        .create_node("Add", inputs, BTreeMap::new())
        .await
        .unwrap();

    let constant = client
        .materialize_input_as_node(add.id, "a", None)
        .await
        .unwrap();
    assert_eq!(constant.class_id, "Constant");
    assert_eq!(constant.inputs["value"], json!(7));

    let script = client
        .render_node_as_script(add.id, false, true, "build")
        .await
        .unwrap();
    assert!(script.starts_with("def build():"));
    assert!(script.contains(&format!("node_{} = Constant(value=7)", constant.id.0)));
    assert!(script.ends_with(&format!("return node_{}", add.id.0)));
}
