//! End-to-end hub tests over real WebSockets

mod common;

use coach_broker::client::{BackoffPolicy, CorrelatorError, EchoResponder, UiClient, WorkerClient};
use coach_broker::protocol::{ClientRole, Envelope, ErrorCode, Message};
use common::*;
use std::time::Duration;

#[tokio::test]
async fn test_health_reports_connections_and_queue() {
    let server = start_hub().await;
    let health = get_json(server.addr, "/health").await;
    assert_eq!(health["status"], "ok");
    assert!(health["version"].is_string());
    assert_eq!(health["connections"]["ui"], 0);
    assert_eq!(health["queueDepth"], 0);

    let _ui = connect_as(&server, ClientRole::Ui).await;
    let health = wait_for_health(server.addr, |h| h["connections"]["ui"] == 1).await;
    assert_eq!(health["connections"]["worker"], 0);

    server.shutdown().await.unwrap();
}

#[tokio::test]
async fn test_chat_queued_until_worker_registers() {
    let server = start_hub().await;
    let mut ui = connect_as(&server, ClientRole::Ui).await;

    send(&mut ui, Envelope::chat("coach", "hi", "r1")).await;
    wait_for_health(server.addr, |h| h["queueDepth"] == 1).await;

    let mut worker = connect_as(&server, ClientRole::Worker).await;
    let chat = recv(&mut worker).await;
    assert_eq!(chat.message, Message::Chat {
        agent_id: "coach".into(),
        content: "hi".into(),
        request_id: "r1".into(),
    });

    // UI learns the worker is online
    let status = recv_kind(&mut ui, "status").await;
    assert!(matches!(status.message, Message::Status { worker_online: Some(true), .. }));
    wait_for_health(server.addr, |h| h["queueDepth"] == 0).await;

    server.shutdown().await.unwrap();
}

#[tokio::test]
async fn test_queue_flushes_in_fifo_order() {
    let server = start_hub().await;
    let mut ui = connect_as(&server, ClientRole::Ui).await;
    for id in ["m1", "m2", "m3"] {
        send(&mut ui, Envelope::chat("coach", id, id)).await;
    }
    wait_for_health(server.addr, |h| h["queueDepth"] == 3).await;

    let mut worker = connect_as(&server, ClientRole::Worker).await;
    let mut ids = Vec::new();
    for _ in 0..3 {
        ids.push(recv_kind(&mut worker, "chat").await.request_id().unwrap().to_string());
    }
    assert_eq!(ids, vec!["m1", "m2", "m3"]);

    server.shutdown().await.unwrap();
}

#[tokio::test]
async fn test_response_stream_fans_out_to_every_ui() {
    let server = start_hub().await;
    let mut ui1 = connect_as(&server, ClientRole::Ui).await;
    let mut ui2 = connect_as(&server, ClientRole::Ui).await;
    let mut worker = connect_as(&server, ClientRole::Worker).await;
    recv_kind(&mut ui1, "status").await;
    recv_kind(&mut ui2, "status").await;

    send(&mut worker, Envelope::response_start("coach", "r1")).await;
    send(&mut worker, Envelope::response_chunk("coach", "r1", "Hello")).await;
    send(&mut worker, Envelope::response_end("coach", "r1", "Hello")).await;

    for ui in [&mut ui1, &mut ui2] {
        let kinds = vec![
            recv(ui).await.kind(),
            recv(ui).await.kind(),
            recv(ui).await.kind(),
        ];
        assert_eq!(kinds, vec!["response_start", "response_chunk", "response_end"]);
    }

    server.shutdown().await.unwrap();
}

#[tokio::test]
async fn test_invalid_role_keeps_connection_open() {
    let server = start_hub().await;
    let mut ws = connect(&server).await;
    assert_eq!(recv(&mut ws).await.kind(), "status");

    send_raw(&mut ws, r#"{"type":"register","clientType":"admin"}"#).await;
    let error = recv(&mut ws).await;
    assert!(matches!(error.message, Message::Error { code: Some(ErrorCode::InvalidRole), .. }));

    send(&mut ws, Envelope::register(ClientRole::Ui)).await;
    assert_eq!(recv(&mut ws).await.kind(), "registered");

    server.shutdown().await.unwrap();
}

#[tokio::test]
async fn test_malformed_frame_gets_error_and_ping_gets_pong() {
    let server = start_hub().await;
    let mut ui = connect_as(&server, ClientRole::Ui).await;

    send_raw(&mut ui, "{not json").await;
    let error = recv(&mut ui).await;
    assert!(matches!(error.message, Message::Error { code: Some(ErrorCode::MalformedEnvelope), .. }));

    send(&mut ui, Envelope::ping()).await;
    assert_eq!(recv(&mut ui).await.kind(), "pong");

    server.shutdown().await.unwrap();
}

#[tokio::test]
async fn test_worker_disconnect_notifies_ui() {
    let server = start_hub().await;
    let mut ui = connect_as(&server, ClientRole::Ui).await;
    let worker = connect_as(&server, ClientRole::Worker).await;
    recv_kind(&mut ui, "status").await;

    drop(worker);
    let status = recv_kind(&mut ui, "status").await;
    assert!(matches!(status.message, Message::Status { worker_online: Some(false), .. }));

    send(&mut ui, Envelope::chat("coach", "anyone?", "r9")).await;
    wait_for_health(server.addr, |h| h["queueDepth"] == 1).await;

    server.shutdown().await.unwrap();
}

#[tokio::test]
async fn test_worker_leaving_mid_stream_fails_the_request() {
    let server = start_hub().await;
    let mut worker = connect_as(&server, ClientRole::Worker).await;
    let ui = UiClient::connect(server.ws_url(), BackoffPolicy::default(), Duration::from_secs(120));
    ui.wait_registered().await.unwrap();

    let pending = ui.send_chat("coach", "hello").await.unwrap();
    let chat = recv_kind(&mut worker, "chat").await;
    let request_id = chat.request_id().unwrap().to_string();
    send(&mut worker, Envelope::response_start("coach", request_id.as_str())).await;
    send(&mut worker, Envelope::response_chunk("coach", request_id.as_str(), "Hel")).await;

    drop(worker);
    let err = tokio::time::timeout(Duration::from_secs(5), pending.wait())
        .await
        .expect("request should settle without waiting for the timeout")
        .unwrap_err();
    assert!(matches!(err, CorrelatorError::Remote { request_id: ref id, .. } if *id == request_id));
    assert_eq!(ui.correlator().pending_count().await, 0);

    ui.shutdown();
    server.shutdown().await.unwrap();
}

#[tokio::test]
async fn test_stopping_hub_closes_sockets() {
    let server = start_hub().await;
    let mut ui = connect_as(&server, ClientRole::Ui).await;
    server.shutdown().await.unwrap();

    use futures::StreamExt;
    let next = tokio::time::timeout(Duration::from_secs(5), ui.next()).await.unwrap();
    assert!(matches!(
        next,
        None | Some(Ok(tokio_tungstenite::tungstenite::Message::Close(_))) | Some(Err(_))
    ));
}

#[tokio::test]
async fn test_ui_and_worker_clients_round_trip() {
    let server = start_hub().await;
    let policy = BackoffPolicy {
        base_delay: Duration::from_millis(50),
        ..BackoffPolicy::default()
    };

    let worker = WorkerClient::connect(server.ws_url(), policy);
    let worker_handle = worker.handle();
    let worker_task = tokio::spawn(worker.run(EchoResponder { chunk_size: 4 }));

    let ui = UiClient::connect(server.ws_url(), policy, Duration::from_secs(10));
    ui.wait_registered().await.unwrap();
    let mut stream = ui.subscribe();

    let reply = ui.chat("coach", "How was my week?").await.unwrap();
    assert_eq!(reply, "How was my week?");

    // The chunks were visible to subscribers as they streamed
    let mut chunks = String::new();
    while let Ok(envelope) = stream.try_recv() {
        if let Message::ResponseChunk { content, .. } = envelope.message {
            chunks.push_str(&content);
        }
    }
    assert_eq!(chunks, "How was my week?");

    // Overlapping requests resolve independently
    let a = ui.send_chat("coach", "first").await.unwrap();
    let b = ui.send_chat("coach", "second").await.unwrap();
    assert_eq!(b.wait().await.unwrap(), "second");
    assert_eq!(a.wait().await.unwrap(), "first");

    worker_handle.shutdown();
    assert!(worker_task.await.unwrap().is_ok());
    ui.shutdown();
    server.shutdown().await.unwrap();
}
