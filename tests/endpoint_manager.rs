//! Black-box coverage of the Endpoint Connection's JSON-RPC engine (§4.D)
//! over a real socket: this crate connects out to a URL as a WebSocket
//! *client*, but plays JSON-RPC *server* once connected, so these tests run
//! a bare `tokio_tungstenite` server that plays the endpoint's role, sending
//! requests and reading back responses.

use std::sync::Arc;
use std::time::Duration;

use futures::{SinkExt, StreamExt};
use serde_json::{json, Value};
use tokio::net::TcpListener;
use tokio_tungstenite::tungstenite::Message;

use xiaozhi_proxy_core::endpoint::{ConnectionState, EndpointConnection};
use xiaozhi_proxy_core::{EventBus, McpServiceManager};

async fn spawn_fake_endpoint() -> (String, tokio::sync::mpsc::UnboundedSender<Message>, tokio::sync::mpsc::UnboundedReceiver<Message>) {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let url = format!("ws://{}", addr);

    let (to_client_tx, mut to_client_rx) = tokio::sync::mpsc::unbounded_channel::<Message>();
    let (from_client_tx, from_client_rx) = tokio::sync::mpsc::unbounded_channel::<Message>();

    tokio::spawn(async move {
        let (stream, _) = listener.accept().await.unwrap();
        let ws = tokio_tungstenite::accept_async(stream).await.unwrap();
        let (mut sink, mut source) = ws.split();
        loop {
            tokio::select! {
                outgoing = to_client_rx.recv() => {
                    match outgoing {
                        Some(msg) => { if sink.send(msg).await.is_err() { break; } }
                        None => break,
                    }
                }
                incoming = source.next() => {
                    match incoming {
                        Some(Ok(msg)) => { let _ = from_client_tx.send(msg); }
                        _ => break,
                    }
                }
            }
        }
    });

    (url, to_client_tx, from_client_rx)
}

async fn recv_json(rx: &mut tokio::sync::mpsc::UnboundedReceiver<Message>) -> Value {
    let msg = tokio::time::timeout(Duration::from_secs(2), rx.recv())
        .await
        .expect("response within timeout")
        .expect("channel open");
    match msg {
        Message::Text(text) => serde_json::from_str(&text).unwrap(),
        other => panic!("expected text frame, got {:?}", other),
    }
}

async fn expect_silence(rx: &mut tokio::sync::mpsc::UnboundedReceiver<Message>) {
    let result = tokio::time::timeout(Duration::from_millis(200), rx.recv()).await;
    assert!(result.is_err(), "expected no response, got one");
}

#[tokio::test]
async fn connect_reaches_connected_state_against_a_real_peer() {
    let (url, _to_client, _from_client) = spawn_fake_endpoint().await;
    let events = Arc::new(EventBus::default());
    let services = Arc::new(McpServiceManager::new(events.clone()));
    let conn = Arc::new(EndpointConnection::new(url, services, events));

    conn.connect().await.expect("connects to fake endpoint");
    assert_eq!(conn.state().await, ConnectionState::Connected);
}

#[tokio::test]
async fn initialize_request_round_trips_with_its_numeric_id_preserved() {
    let (url, to_client, mut from_client) = spawn_fake_endpoint().await;
    let events = Arc::new(EventBus::default());
    let services = Arc::new(McpServiceManager::new(events.clone()));
    let conn = Arc::new(EndpointConnection::new(url, services, events));
    conn.connect().await.unwrap();

    to_client
        .send(Message::Text(
            json!({"jsonrpc": "2.0", "id": 0, "method": "initialize"}).to_string(),
        ))
        .unwrap();

    let response = recv_json(&mut from_client).await;
    assert_eq!(response["id"], json!(0));
    assert_eq!(
        response["result"]["protocolVersion"],
        json!(xiaozhi_proxy_core::jsonrpc::MCP_PROTOCOL_VERSION)
    );
}

#[tokio::test]
async fn notification_with_null_id_produces_no_response_frame() {
    let (url, to_client, mut from_client) = spawn_fake_endpoint().await;
    let events = Arc::new(EventBus::default());
    let services = Arc::new(McpServiceManager::new(events.clone()));
    let conn = Arc::new(EndpointConnection::new(url, services, events));
    conn.connect().await.unwrap();

    to_client
        .send(Message::Text(
            json!({"jsonrpc": "2.0", "id": null, "method": "tools/list"}).to_string(),
        ))
        .unwrap();

    expect_silence(&mut from_client).await;
}

#[tokio::test]
async fn unknown_method_comes_back_as_method_not_found() {
    let (url, to_client, mut from_client) = spawn_fake_endpoint().await;
    let events = Arc::new(EventBus::default());
    let services = Arc::new(McpServiceManager::new(events.clone()));
    let conn = Arc::new(EndpointConnection::new(url, services, events));
    conn.connect().await.unwrap();

    to_client
        .send(Message::Text(
            json!({"jsonrpc": "2.0", "id": 5, "method": "resources/list"}).to_string(),
        ))
        .unwrap();

    let response = recv_json(&mut from_client).await;
    assert_eq!(response["error"]["code"], json!(-32601));
    assert_eq!(response["id"], json!(5));
}

#[tokio::test]
async fn malformed_frame_produces_no_response_at_all() {
    let (url, to_client, mut from_client) = spawn_fake_endpoint().await;
    let events = Arc::new(EventBus::default());
    let services = Arc::new(McpServiceManager::new(events.clone()));
    let conn = Arc::new(EndpointConnection::new(url, services, events));
    conn.connect().await.unwrap();

    to_client.send(Message::Text("{ this is not json".to_string())).unwrap();
    expect_silence(&mut from_client).await;
}

#[tokio::test]
async fn tools_call_on_an_empty_catalog_fails_with_a_preserved_id() {
    let (url, to_client, mut from_client) = spawn_fake_endpoint().await;
    let events = Arc::new(EventBus::default());
    let services = Arc::new(McpServiceManager::new(events.clone()));
    let conn = Arc::new(EndpointConnection::new(url, services, events));
    conn.connect().await.unwrap();

    to_client
        .send(Message::Text(
            json!({
                "jsonrpc": "2.0",
                "id": "call-1",
                "method": "tools/call",
                "params": {"name": "weather__forecast", "arguments": {}}
            })
            .to_string(),
        ))
        .unwrap();

    let response = recv_json(&mut from_client).await;
    assert_eq!(response["id"], json!("call-1"));
    assert!(response.get("error").is_some());
}

#[tokio::test]
async fn disconnect_tears_down_the_socket_without_panicking() {
    let (url, _to_client, _from_client) = spawn_fake_endpoint().await;
    let events = Arc::new(EventBus::default());
    let services = Arc::new(McpServiceManager::new(events.clone()));
    let conn = Arc::new(EndpointConnection::new(url, services, events));
    conn.connect().await.unwrap();
    conn.disconnect().await;
    assert_eq!(conn.state().await, ConnectionState::Disconnected);
}
