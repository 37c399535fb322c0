//! Whole-broker integration tests, one per testable-property scenario that
//! isn't already exercised as a unit test closer to the code it covers
//! (`S1` drop-oldest and `S2` batch flush live in `optimizer.rs`).

use procbroker::transport::UdsTransport;
use procbroker::{Broker, BrokerConfig};
use serde_json::json;
use std::time::Duration;
use tokio_util::sync::CancellationToken;

fn config(dir: &std::path::Path) -> BrokerConfig {
    BrokerConfig {
        socket_dir: dir.to_path_buf(),
        service_dir: dir.to_path_buf(),
        optimizer: None,
        ..BrokerConfig::default()
    }
}

/// S3: a broker-issued `InvokeRPC` to a connected child round-trips its
/// response back through the pending table.
#[tokio::test]
async fn s3_invoke_rpc_round_trips_to_a_connected_child() {
    let dir = tempfile::tempdir().unwrap();
    let broker = Broker::new(config(dir.path()));

    let server_transport = broker.transport_manager().register_uds_transport("worker").await.unwrap();
    let client = UdsTransport::new(server_transport.socket_path());

    let accept = tokio::spawn({
        let server_transport = server_transport.clone();
        async move { server_transport.accept().await }
    });
    client.dial().await.unwrap();
    accept.await.unwrap().unwrap();

    let responder = tokio::spawn(async move {
        let request = client.receive().await.unwrap();
        let response = procbroker::Message::new_response(
            &request.id,
            "worker",
            &request.source,
            &request.correlation_id,
            &json!({"echo": true}),
        )
        .unwrap();
        client.send(&response).await.unwrap();
    });

    let reply = broker
        .invoke_rpc("broker", "worker", "Ping", &json!({}), Duration::from_secs(3))
        .await
        .unwrap();

    responder.await.unwrap();
    assert_eq!(reply.message_type, procbroker::MessageType::Response);
    let payload: serde_json::Value = reply.decode_payload().unwrap();
    assert_eq!(payload["echo"], true);

    broker.shutdown().await;
}

/// S4: an `InvokeRPC` against a registered but unresponsive child times out
/// and leaves the router's pending table empty.
#[tokio::test]
async fn s4_invoke_rpc_times_out_against_a_silent_child() {
    let dir = tempfile::tempdir().unwrap();
    let broker = Broker::new(config(dir.path()));
    broker.transport_manager().register_uds_transport("silent").await.unwrap();

    let err = broker
        .invoke_rpc("broker", "silent", "Ping", &json!({}), Duration::from_millis(100))
        .await
        .unwrap_err();

    assert!(matches!(err, procbroker::BrokerError::Timeout(_)));
    assert_eq!(broker.router().pending_count(), 0);

    broker.shutdown().await;
}

/// S5: a spawned process's exit is observable as a `process_exited` event on
/// the internal bus well within the scenario's 500ms bound.
#[tokio::test]
async fn s5_process_exit_is_observable_on_the_bus_within_500ms() {
    let dir = tempfile::tempdir().unwrap();
    let broker = Broker::new(config(dir.path()));

    broker
        .supervisor()
        .spawn("short-lived", "sh", &["-c".to_string(), "exit 3".to_string()])
        .await
        .unwrap();

    let msg = tokio::time::timeout(Duration::from_millis(500), broker.bus().receive(&CancellationToken::new()))
        .await
        .expect("process_exited observed within 500ms")
        .unwrap();

    assert_eq!(msg.id, "process_exited");
    let payload: serde_json::Value = msg.decode_payload().unwrap();
    assert_eq!(payload["id"], "short-lived");
    assert_eq!(payload["exit_code"], 3);

    broker.shutdown().await;
}

/// S6: a restart-enabled RPC child keeps the same registered transport
/// across one exit-and-respawn cycle.
#[tokio::test]
async fn s6_restart_preserves_the_same_transport_across_one_exit() {
    let dir = tempfile::tempdir().unwrap();
    let broker = Broker::new(config(dir.path()));

    broker
        .supervisor()
        .spawn_rpc_with_restart(
            "flaky",
            "sh",
            &["-c".to_string(), "exit 7".to_string()],
            5,
            Duration::from_millis(20),
        )
        .await
        .unwrap();

    let before = broker.transport_manager().get_transport("flaky").await.unwrap();

    // Let it exit, wait out the restart delay, and respawn at least once.
    tokio::time::sleep(Duration::from_millis(300)).await;

    let after = broker.transport_manager().get_transport("flaky").await.unwrap();
    assert!(std::sync::Arc::ptr_eq(&before, &after));

    let info = broker.supervisor().get_process("flaky").unwrap();
    assert!(info.restart_count >= 1);

    broker.shutdown().await;
}

/// A restart-enabled process that keeps failing eventually exhausts its
/// restart budget and its transport is unregistered.
#[tokio::test]
async fn restart_budget_exhaustion_unregisters_the_transport() {
    let dir = tempfile::tempdir().unwrap();
    let broker = Broker::new(config(dir.path()));

    broker
        .supervisor()
        .spawn_rpc_with_restart(
            "doomed",
            "sh",
            &["-c".to_string(), "exit 1".to_string()],
            1,
            Duration::from_millis(10),
        )
        .await
        .unwrap();

    tokio::time::sleep(Duration::from_millis(500)).await;

    assert!(broker.transport_manager().get_transport("doomed").await.is_none());

    broker.shutdown().await;
}
