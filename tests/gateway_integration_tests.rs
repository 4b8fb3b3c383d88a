mod common;

use api_observatory::{
    Config,
    artifacts::{CostBreakdown, CostSnapshot},
};
use chrono::Utc;
use common::TestHarness;
use futures_util::{SinkExt, StreamExt};
use serde_json::Value;
use std::{net::SocketAddr, time::Duration};
use tokio::{net::TcpStream, time::timeout};
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream, connect_async, tungstenite::Message};

type Client = WebSocketStream<MaybeTlsStream<TcpStream>>;

const READ_TIMEOUT: Duration = Duration::from_secs(3);

fn gateway_config(ping_interval_ms: u64, max_connections: usize) -> Config {
    let mut config = Config::default();
    config.analysis.enabled = false;
    config.gateway.ping_interval_ms = ping_interval_ms;
    config.gateway.max_connections = max_connections;
    config.gateway.relay_initial_backoff_ms = 10;
    config
}

async fn connect(addr: SocketAddr) -> Client {
    let (client, _) = connect_async(format!("ws://{addr}/ws")).await.unwrap();
    client
}

/// Next text frame as JSON. `None` once the server closes the connection.
async fn next_json(client: &mut Client) -> Option<Value> {
    loop {
        let frame = timeout(READ_TIMEOUT, client.next())
            .await
            .expect("timed out waiting for a frame");
        match frame {
            Some(Ok(Message::Text(text))) => return Some(serde_json::from_str(&text).unwrap()),
            Some(Ok(Message::Close(_))) | None | Some(Err(_)) => return None,
            Some(Ok(_)) => continue,
        }
    }
}

/// Next message that is not a keepalive ping
async fn next_event(client: &mut Client) -> Option<Value> {
    loop {
        let message = next_json(client).await?;
        if message["type"] != "ping" {
            return Some(message);
        }
    }
}

async fn wait_for_relay(harness: &TestHarness) {
    for _ in 0..200 {
        if harness.server.gateway.relay.is_connected() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("relay never subscribed");
}

#[tokio::test]
async fn test_initial_snapshot_is_first_message() {
    let harness = TestHarness::with_config(gateway_config(30_000, 10)).await;
    let snapshot = CostSnapshot {
        breakdown: vec![CostBreakdown {
            label: "anthropic".to_string(),
            cost: 4.2,
            request_count: 12,
            avg_latency: 800.0,
            error_count: 0,
        }],
        total_cost: 4.2,
        updated_at: Some(Utc::now()),
    };
    harness
        .cache
        .put_artifact(&snapshot, Duration::from_secs(60))
        .await
        .unwrap();
    let addr = harness.spawn_listener().await;

    let mut client = connect(addr).await;
    let first = next_json(&mut client).await.unwrap();

    assert_eq!(first["type"], "initial_data");
    assert!(first["timestamp"].is_i64());
    let data: CostSnapshot = serde_json::from_value(first["data"].clone()).unwrap();
    assert_eq!(data, snapshot);
}

#[tokio::test]
async fn test_initial_snapshot_defaults_when_cache_empty() {
    let harness = TestHarness::with_config(gateway_config(30_000, 10)).await;
    let addr = harness.spawn_listener().await;

    let mut client = connect(addr).await;
    let first = next_json(&mut client).await.unwrap();

    assert_eq!(first["type"], "initial_data");
    assert_eq!(first["data"]["total_cost"], 0.0);
    assert_eq!(first["data"]["breakdown"], serde_json::json!([]));
}

#[tokio::test]
async fn test_pings_keep_flowing_after_client_garbage() {
    let harness = TestHarness::with_config(gateway_config(100, 10)).await;
    let addr = harness.spawn_listener().await;

    let mut client = connect(addr).await;
    assert_eq!(next_json(&mut client).await.unwrap()["type"], "initial_data");

    client
        .send(Message::Text("definitely not json".to_string()))
        .await
        .unwrap();

    for _ in 0..2 {
        let message = next_json(&mut client).await.unwrap();
        assert_eq!(message["type"], "ping");
    }
    assert_eq!(harness.server.gateway.registry.active_count().await, 1);
}

#[tokio::test]
async fn test_relayed_events_are_forwarded_and_invalid_ones_skipped() {
    let harness = TestHarness::with_config(gateway_config(30_000, 10)).await;
    harness.server.start_background().await.unwrap();
    wait_for_relay(&harness).await;
    let addr = harness.spawn_listener().await;

    let mut first = connect(addr).await;
    let mut second = connect(addr).await;
    assert_eq!(next_json(&mut first).await.unwrap()["type"], "initial_data");
    assert_eq!(next_json(&mut second).await.unwrap()["type"], "initial_data");

    let channel = harness.cache.events_channel().to_string();
    harness
        .cache
        .publish(&channel, "<<not json>>".to_string())
        .await
        .unwrap();
    harness
        .cache
        .publish(
            &channel,
            r#"{"type":"costs_updated","total_cost":9.5,"providers":3}"#.to_string(),
        )
        .await
        .unwrap();

    for client in [&mut first, &mut second] {
        let event = next_event(client).await.unwrap();
        assert_eq!(event["type"], "costs_updated");
        assert_eq!(event["total_cost"], 9.5);
    }

    harness.server.gateway.relay.stop().await;
}

#[tokio::test]
async fn test_connection_cap_evicts_idle_connection() {
    let harness = TestHarness::with_config(gateway_config(30_000, 1)).await;
    let addr = harness.spawn_listener().await;

    let mut oldest = connect(addr).await;
    assert_eq!(next_json(&mut oldest).await.unwrap()["type"], "initial_data");

    let mut newest = connect(addr).await;
    assert_eq!(next_json(&mut newest).await.unwrap()["type"], "initial_data");

    assert!(next_json(&mut oldest).await.is_none());
    assert_eq!(harness.server.gateway.registry.active_count().await, 1);
}

#[tokio::test]
async fn test_client_close_unregisters_connection() {
    let harness = TestHarness::with_config(gateway_config(30_000, 10)).await;
    let addr = harness.spawn_listener().await;

    let mut client = connect(addr).await;
    assert_eq!(next_json(&mut client).await.unwrap()["type"], "initial_data");
    client.close(None).await.unwrap();

    let registry = harness.server.gateway.registry.clone();
    assert!(registry.wait_for_all(Duration::from_secs(2)).await);
}

#[tokio::test]
async fn test_shutdown_closes_open_connections() {
    let harness = TestHarness::with_config(gateway_config(30_000, 10)).await;
    let addr = harness.spawn_listener().await;

    let mut client = connect(addr).await;
    assert_eq!(next_json(&mut client).await.unwrap()["type"], "initial_data");

    let registry = harness.server.gateway.registry.clone();
    registry.signal_all_to_close().await;

    assert!(next_json(&mut client).await.is_none());
    assert!(registry.wait_for_all(Duration::from_secs(2)).await);
}
