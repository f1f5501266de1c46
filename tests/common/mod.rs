//! Shared helpers for the end-to-end tests

#![allow(dead_code)]

use coach_broker::protocol::{ClientRole, Envelope};
use coach_broker::{start_server_on, BrokerServer, Config};
use futures::{SinkExt, StreamExt};
use std::net::SocketAddr;
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio_tungstenite::{connect_async, tungstenite::Message, MaybeTlsStream, WebSocketStream};

pub type Ws = WebSocketStream<MaybeTlsStream<TcpStream>>;

const RECV_TIMEOUT: Duration = Duration::from_secs(5);

/// Start a hub on an ephemeral localhost port
pub async fn start_hub() -> BrokerServer {
    start_hub_with(Config::default()).await
}

pub async fn start_hub_with(config: Config) -> BrokerServer {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    start_server_on(listener, &config).await.unwrap()
}

/// Start a hub on a specific address (used to "restart" a hub)
pub async fn start_hub_at(addr: SocketAddr) -> BrokerServer {
    let listener = TcpListener::bind(addr).await.unwrap();
    start_server_on(listener, &Config::default()).await.unwrap()
}

/// An address nothing is listening on (yet)
pub async fn free_addr() -> SocketAddr {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    listener.local_addr().unwrap()
}

pub async fn connect(server: &BrokerServer) -> Ws {
    let (ws, _) = connect_async(server.ws_url()).await.unwrap();
    ws
}

pub async fn send(ws: &mut Ws, envelope: Envelope) {
    send_raw(ws, &envelope.to_json().unwrap()).await;
}

pub async fn send_raw(ws: &mut Ws, text: &str) {
    ws.send(Message::Text(text.to_string().into())).await.unwrap();
}

/// Next envelope from the hub, failing the test after a few seconds
pub async fn recv(ws: &mut Ws) -> Envelope {
    loop {
        let msg = tokio::time::timeout(RECV_TIMEOUT, ws.next())
            .await
            .expect("timed out waiting for an envelope")
            .expect("connection closed")
            .expect("websocket error");
        if let Message::Text(text) = msg {
            return Envelope::from_json(text.as_str()).unwrap();
        }
    }
}

/// Skip envelopes until one of `kind` arrives
pub async fn recv_kind(ws: &mut Ws, kind: &str) -> Envelope {
    loop {
        let envelope = recv(ws).await;
        if envelope.kind() == kind {
            return envelope;
        }
    }
}

/// Connect and register; returns once `registered` has been read
pub async fn connect_as(server: &BrokerServer, role: ClientRole) -> Ws {
    let mut ws = connect(server).await;
    assert_eq!(recv(&mut ws).await.kind(), "status");
    send(&mut ws, Envelope::register(role)).await;
    assert_eq!(recv(&mut ws).await.kind(), "registered");
    if role == ClientRole::Ui {
        // presence notice
        assert_eq!(recv(&mut ws).await.kind(), "status");
    }
    ws
}

/// Minimal HTTP/1.1 GET returning the response body as JSON
pub async fn get_json(addr: SocketAddr, path: &str) -> serde_json::Value {
    let mut stream = TcpStream::connect(addr).await.unwrap();
    let request = format!("GET {path} HTTP/1.1\r\nHost: {addr}\r\nConnection: close\r\n\r\n");
    stream.write_all(request.as_bytes()).await.unwrap();

    let mut raw = String::new();
    stream.read_to_string(&mut raw).await.unwrap();
    let (head, body) = raw.split_once("\r\n\r\n").unwrap();
    assert!(head.starts_with("HTTP/1.1 200"), "unexpected response: {head}");
    serde_json::from_str(body.trim()).unwrap()
}

/// Poll `/health` until `check` passes
pub async fn wait_for_health<F>(addr: SocketAddr, check: F) -> serde_json::Value
where
    F: Fn(&serde_json::Value) -> bool,
{
    for _ in 0..100 {
        let health = get_json(addr, "/health").await;
        if check(&health) {
            return health;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    panic!("health never reached the expected state");
}
