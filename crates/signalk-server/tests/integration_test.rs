//! Integration tests for the SignalK server.
//!
//! WebSocket behaviour is checked against a real listener with a
//! tokio-tungstenite client; HTTP routes go through `oneshot`.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use axum::body::Body;
use axum::http::{Request, StatusCode};
use chrono::Utc;
use futures::{SinkExt, StreamExt};
use pretty_assertions::assert_eq;
use tokio::net::TcpStream;
use tokio::time::timeout;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream};
use tower::ServiceExt;

use signalk_bus::Publisher;
use signalk_core::{CacheConfig, Delta, PathValue, SingleValueMapped, Source, Update};
use signalk_protocol::codec::encode_delta;
use signalk_server::{ServerConfig, SignalKServer};
use signalk_store::{MemoryStore, StoreError, TimeRange, TimeSeriesStore};

const SELF: &str = "vessels.urn:mrn:imo:mmsi:230099999";
const OTHER: &str = "vessels.urn:mrn:imo:mmsi:211000000";

type Client = WebSocketStream<MaybeTlsStream<TcpStream>>;

fn config() -> ServerConfig {
    ServerConfig {
        name: "test-server".to_string(),
        self_context: SELF.to_string(),
        ..ServerConfig::default()
    }
}

fn delta(context: &str, path: &str, value: f64) -> Delta {
    Delta::single(
        context,
        Update {
            source: Source::new("gps", "nmea0183"),
            timestamp: Utc::now(),
            values: vec![PathValue {
                path: path.to_string(),
                value: serde_json::json!(value),
            }],
        },
    )
}

async fn start_test_server(server: &SignalKServer) -> SocketAddr {
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let app = server.router();
    tokio::spawn(async move {
        let _ = axum::serve(listener, app).await;
    });
    addr
}

async fn connect_client(addr: SocketAddr, params: &str) -> Client {
    let url = format!("ws://{}/signalk/v1/stream{}", addr, params);
    let (ws, _) = tokio_tungstenite::connect_async(url)
        .await
        .expect("Failed to connect");
    ws
}

async fn recv_json(ws: &mut Client) -> serde_json::Value {
    loop {
        match timeout(Duration::from_secs(5), ws.next()).await {
            Ok(Some(Ok(Message::Text(text)))) => return serde_json::from_str(&text).unwrap(),
            Ok(Some(Ok(Message::Ping(_)))) | Ok(Some(Ok(Message::Pong(_)))) => continue,
            other => panic!("expected a text frame, got {other:?}"),
        }
    }
}

async fn wait_for_cache(server: &SignalKServer, len: usize) {
    let cache = server.cache();
    for _ in 0..200 {
        if cache.read().len() >= len {
            return;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("cache never reached {len} entries");
}

#[tokio::test]
async fn test_hello_message_on_connect() {
    let server = SignalKServer::start(config(), None).await;
    let addr = start_test_server(&server).await;
    let mut ws = connect_client(addr, "").await;

    let hello = recv_json(&mut ws).await;
    assert_eq!(hello["name"], "test-server");
    assert_eq!(hello["version"], "1.7.0");
    assert_eq!(hello["self"], SELF);
    assert_eq!(hello["roles"], serde_json::json!(["main", "master"]));
    assert!(hello["timestamp"].as_str().unwrap().ends_with('Z'));
}

#[tokio::test]
async fn test_default_subscription_is_self_only() {
    let server = SignalKServer::start(config(), None).await;
    let addr = start_test_server(&server).await;
    let mut ws = connect_client(addr, "?sendCachedValues=false").await;
    recv_json(&mut ws).await;

    let hub = server.hub();
    hub.broadcast(delta(OTHER, "navigation.speedOverGround", 1.0)).await;
    hub.broadcast(delta(SELF, "navigation.speedOverGround", 2.0)).await;

    let frame = recv_json(&mut ws).await;
    assert_eq!(frame["context"], SELF);
    assert_eq!(frame["updates"][0]["values"][0]["value"], 2.0);
}

#[tokio::test]
async fn test_unknown_subscribe_value_falls_back_to_self() {
    let server = SignalKServer::start(config(), None).await;
    let addr = start_test_server(&server).await;
    let mut ws = connect_client(addr, "?subscribe=bogus&sendCachedValues=maybe").await;
    assert_eq!(recv_json(&mut ws).await["self"], SELF);

    let hub = server.hub();
    hub.broadcast(delta(OTHER, "navigation.speedOverGround", 1.0)).await;
    hub.broadcast(delta(SELF, "navigation.speedOverGround", 2.0)).await;

    let frame = recv_json(&mut ws).await;
    assert_eq!(frame["context"], SELF);
    assert_eq!(frame["updates"][0]["values"][0]["value"], 2.0);
}

#[tokio::test]
async fn test_subscribe_all_receives_every_context() {
    let server = SignalKServer::start(config(), None).await;
    let addr = start_test_server(&server).await;
    let mut ws = connect_client(addr, "?subscribe=all").await;
    recv_json(&mut ws).await;

    let hub = server.hub();
    hub.broadcast(delta(OTHER, "navigation.speedOverGround", 1.0)).await;
    hub.broadcast(delta(SELF, "navigation.speedOverGround", 2.0)).await;

    assert_eq!(recv_json(&mut ws).await["context"], OTHER);
    assert_eq!(recv_json(&mut ws).await["context"], SELF);
}

#[tokio::test]
async fn test_subscribe_none_then_environment() {
    let server = SignalKServer::start(config(), None).await;
    let addr = start_test_server(&server).await;
    let mut ws = connect_client(addr, "?subscribe=none").await;
    recv_json(&mut ws).await;

    ws.send(Message::Text(
        r#"{"context":"vessels.self","subscribe":[{"path":"environment.*"}]}"#.to_string(),
    ))
    .await
    .unwrap();
    // the request travels through the session before the hub sees it
    tokio::time::sleep(Duration::from_millis(100)).await;

    let hub = server.hub();
    hub.broadcast(delta(SELF, "navigation.headingTrue", 1.0)).await;
    hub.broadcast(delta(SELF, "environment.water.temperature", 290.0)).await;

    let frame = recv_json(&mut ws).await;
    assert_eq!(
        frame["updates"][0]["values"][0]["path"],
        "environment.water.temperature"
    );
}

#[tokio::test]
async fn test_unsubscribe_stops_delivery() {
    let server = SignalKServer::start(config(), None).await;
    let addr = start_test_server(&server).await;
    let mut ws = connect_client(addr, "?subscribe=none").await;
    recv_json(&mut ws).await;

    ws.send(Message::Text(
        r#"{"context":"vessels.self","subscribe":[{"path":"navigation.*"},{"path":"environment.*"}]}"#
            .to_string(),
    ))
    .await
    .unwrap();
    ws.send(Message::Text(
        r#"{"context":"vessels.self","unsubscribe":[{"path":"navigation.*"}]}"#.to_string(),
    ))
    .await
    .unwrap();
    tokio::time::sleep(Duration::from_millis(100)).await;

    let hub = server.hub();
    hub.broadcast(delta(SELF, "navigation.headingTrue", 1.0)).await;
    hub.broadcast(delta(SELF, "environment.depth.belowKeel", 4.0)).await;

    let frame = recv_json(&mut ws).await;
    assert_eq!(
        frame["updates"][0]["values"][0]["path"],
        "environment.depth.belowKeel"
    );
}

#[tokio::test]
async fn test_cached_values_follow_hello() {
    let server = SignalKServer::start(config(), None).await;
    let addr = start_test_server(&server).await;
    server
        .hub()
        .broadcast(delta(SELF, "navigation.speedOverGround", 3.5))
        .await;
    wait_for_cache(&server, 1).await;

    let mut ws = connect_client(addr, "").await;
    assert_eq!(recv_json(&mut ws).await["self"], SELF);
    let cached = recv_json(&mut ws).await;
    assert_eq!(cached["updates"][0]["values"][0]["value"], 3.5);
}

#[tokio::test]
async fn test_invalid_client_message_keeps_connection() {
    let server = SignalKServer::start(config(), None).await;
    let addr = start_test_server(&server).await;
    let mut ws = connect_client(addr, "?sendCachedValues=false").await;
    recv_json(&mut ws).await;

    ws.send(Message::Text("not json".to_string())).await.unwrap();
    tokio::time::sleep(Duration::from_millis(50)).await;
    server
        .hub()
        .broadcast(delta(SELF, "navigation.headingTrue", 1.0))
        .await;
    assert_eq!(recv_json(&mut ws).await["context"], SELF);
}

#[tokio::test]
async fn test_serve_feeds_from_bus_and_stops_when_input_closes() {
    let bus = Publisher::new(100);
    let input = bus.subscribe();
    let server = SignalKServer::start(config(), None).await;
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let serving = tokio::spawn(server.serve(listener, input));

    let mut ws = connect_client(addr, "?sendCachedValues=false").await;
    recv_json(&mut ws).await;

    bus.publish(
        encode_delta(&delta(SELF, "navigation.speedOverGround", 4.2))
            .unwrap()
            .into(),
    )
    .unwrap();
    let frame = recv_json(&mut ws).await;
    assert_eq!(frame["updates"][0]["values"][0]["value"], 4.2);

    bus.close();
    let stats = timeout(Duration::from_secs(5), serving)
        .await
        .unwrap()
        .unwrap()
        .unwrap();
    assert_eq!(stats.broadcasts, 1);
    assert_eq!(stats.registered, 1);
}

#[tokio::test]
async fn test_discovery_uses_host_header() {
    let server = SignalKServer::start(config(), None).await;
    let response = server
        .router()
        .oneshot(
            Request::builder()
                .uri("/signalk")
                .header("host", "boat.local:3000")
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);

    let body = axum::body::to_bytes(response.into_body(), usize::MAX)
        .await
        .unwrap();
    let json: serde_json::Value = serde_json::from_slice(&body).unwrap();
    assert_eq!(
        json["endpoints"]["v1"]["signalk-ws"],
        "ws://boat.local:3000/signalk/v1/stream"
    );
    assert_eq!(json["server"]["id"], "test-server");
}

async fn get_tree(server: &SignalKServer) -> (StatusCode, Vec<u8>) {
    let response = server
        .router()
        .oneshot(
            Request::builder()
                .uri("/signalk/v3/api/")
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();
    let status = response.status();
    let body = axum::body::to_bytes(response.into_body(), usize::MAX)
        .await
        .unwrap();
    (status, body.to_vec())
}

#[tokio::test]
async fn test_full_tree_from_cache() {
    let server = SignalKServer::start(config(), None).await;
    server
        .hub()
        .broadcast(delta(SELF, "navigation.speedOverGround", 3.5))
        .await;
    wait_for_cache(&server, 1).await;

    let (status, body) = get_tree(&server).await;
    assert_eq!(status, StatusCode::OK);
    let tree: serde_json::Value = serde_json::from_slice(&body).unwrap();
    assert_eq!(tree["self"], SELF);
    assert_eq!(tree["version"], "1.7.0");
    let leaf = &tree["vessels"]["urn:mrn:imo:mmsi:230099999"]["navigation"]["speedOverGround"];
    assert_eq!(leaf["value"], 3.5);
    assert_eq!(leaf["source"]["label"], "gps");
    assert_eq!(leaf["source"]["type"], "nmea0183");
}

fn stored(path: &str, value: f64) -> SingleValueMapped {
    SingleValueMapped {
        context: SELF.to_string(),
        path: path.to_string(),
        value: serde_json::json!(value),
        timestamp: Utc::now(),
        source: Source::new("depth", "nmea0183"),
    }
}

#[tokio::test]
async fn test_full_tree_from_store() {
    let store = Arc::new(MemoryStore::new());
    store
        .write_mapped(&[stored("environment.depth.belowKeel", 12.5)])
        .unwrap();
    let server = SignalKServer::start(config(), Some(store)).await;

    let (status, body) = get_tree(&server).await;
    assert_eq!(status, StatusCode::OK);
    let tree: serde_json::Value = serde_json::from_slice(&body).unwrap();
    assert_eq!(
        tree["vessels"]["urn:mrn:imo:mmsi:230099999"]["environment"]["depth"]["belowKeel"]["value"],
        12.5
    );
}

#[tokio::test]
async fn test_cache_warm_from_store() {
    let store = Arc::new(MemoryStore::new());
    store
        .write_mapped(&[stored("environment.depth.belowKeel", 12.5)])
        .unwrap();
    let config = ServerConfig {
        cache: CacheConfig {
            ttl_seconds: None,
            warm: true,
        },
        ..config()
    };
    let server = SignalKServer::start(config, Some(store)).await;
    assert_eq!(server.cache().read().len(), 1);

    let addr = start_test_server(&server).await;
    let mut ws = connect_client(addr, "").await;
    recv_json(&mut ws).await;
    let cached = recv_json(&mut ws).await;
    assert_eq!(cached["updates"][0]["values"][0]["value"], 12.5);
}

struct BrokenStore;

impl TimeSeriesStore for BrokenStore {
    fn write_raw(&self, _: &[signalk_protocol::RawMessage]) -> Result<(), StoreError> {
        Err(StoreError::Corrupt("offline".to_string()))
    }

    fn write_mapped(&self, _: &[SingleValueMapped]) -> Result<(), StoreError> {
        Err(StoreError::Corrupt("offline".to_string()))
    }

    fn read_raw(&self, _: TimeRange) -> Result<Vec<signalk_protocol::RawMessage>, StoreError> {
        Err(StoreError::Corrupt("offline".to_string()))
    }

    fn read_mapped(&self, _: TimeRange) -> Result<Vec<SingleValueMapped>, StoreError> {
        Err(StoreError::Corrupt("offline".to_string()))
    }

    fn latest_mapped(&self) -> Result<Vec<SingleValueMapped>, StoreError> {
        Err(StoreError::Corrupt("offline".to_string()))
    }

    fn delete(&self, _: TimeRange) -> Result<usize, StoreError> {
        Err(StoreError::Corrupt("offline".to_string()))
    }
}

#[tokio::test]
async fn test_snapshot_failure_is_bad_request() {
    let server = SignalKServer::start(config(), Some(Arc::new(BrokenStore))).await;
    let (status, body) = get_tree(&server).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(body, b"snapshot unavailable".to_vec());
}
