//! End-to-end tests against a stub broker served over a real WebSocket.

use std::{
    sync::{Arc, Mutex},
    time::Duration,
};

use axum::{
    Router,
    extract::{
        WebSocketUpgrade,
        ws::{Message as WsMessage, WebSocket},
    },
    response::IntoResponse,
    routing::get,
};
use futures::{SinkExt, StreamExt};
use interactive_compute_core::{Kind, LineCollector, Message, WorkerSpec};
use interactive_compute_session::{
    ClientConfig, Commands, InteractiveSession, QueuedSession, SessionError, SessionOptions,
};
use interactive_compute_transport::{
    WebSocketConnector,
    protocol::{handshake_ack, handshake_rejection, parse_handshake},
};
use serde_json::json;
use tokio::time::timeout;

const WAIT: Duration = Duration::from_secs(5);

async fn ws_handler(ws: WebSocketUpgrade) -> impl IntoResponse {
    ws.on_upgrade(broker)
}

/// Accepts the `local` worker and answers `RUN` like a tiny `echo`.
async fn broker(socket: WebSocket) {
    let (mut sender, mut receiver) = socket.split();
    let mut session_id = None;

    while let Some(Ok(frame)) = receiver.next().await {
        let WsMessage::Text(text) = frame else {
            continue;
        };

        let Some(id) = &session_id else {
            let worker = parse_handshake(text.as_str()).unwrap();
            let reply = if worker.compute_id == "local" {
                session_id = Some(String::new());
                handshake_ack()
            } else {
                handshake_rejection(format!("Unknown compute: {}", worker.compute_id))
            };
            let _ = sender
                .send(WsMessage::Text(reply.encode().unwrap().into()))
                .await;
            continue;
        };

        let msg = Message::decode(text.as_str()).unwrap();
        let id = if id.is_empty() { msg.session_id.clone() } else { id.clone() };
        session_id = Some(id.clone());

        let mut replies = Vec::new();
        let code = match msg.kind {
            Kind::Run => {
                let command = msg.data_text();
                match command.split_once(' ') {
                    Some(("echo", rest)) => {
                        let (head, tail) = rest.split_at(rest.len() / 2);
                        replies.push(Message::new(&id, Kind::Stdout, json!(head)));
                        replies.push(Message::new(&id, Kind::Stdout, json!(format!("{tail}\n"))));
                        0
                    }
                    _ => {
                        replies.push(Message::new(&id, Kind::Stderr, json!("command not found")));
                        127
                    }
                }
            }
            _ => 0,
        };
        replies.push(Message::new(&id, Kind::Complete, json!(code)));

        for reply in replies {
            if sender
                .send(WsMessage::Text(reply.encode().unwrap().into()))
                .await
                .is_err()
            {
                return;
            }
        }
    }
}

async fn start_broker() -> String {
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let app = Router::new().route("/", get(ws_handler));
    tokio::spawn(async move {
        axum::serve(listener, app).await.unwrap();
    });
    format!("ws://{addr}")
}

async fn connect(address: &str, compute_id: &str) -> Result<InteractiveSession, SessionError> {
    let connector = WebSocketConnector::new(address);
    InteractiveSession::new(&connector, WorkerSpec::new(compute_id), SessionOptions::default())
        .await
}

#[tokio::test]
async fn test_exec_over_websocket() {
    let address = start_broker().await;
    let session = timeout(WAIT, connect(&address, "local"))
        .await
        .unwrap()
        .unwrap();

    let output = timeout(WAIT, session.exec("echo hello world"))
        .await
        .unwrap()
        .unwrap();
    assert_eq!(output.stdout, "hello world\n");
    assert_eq!(output.exit_code, 0);
    assert!(session.is_idle());

    let err = timeout(WAIT, session.exec("nope now"))
        .await
        .unwrap()
        .unwrap_err();
    assert_eq!(
        err.to_string(),
        "Command \"nope now\" failed with exit code 127:\ncommand not found"
    );
    session.close();
}

#[tokio::test]
async fn test_rejected_worker() {
    let address = start_broker().await;
    let err = timeout(WAIT, connect(&address, "gpu"))
        .await
        .unwrap()
        .unwrap_err();
    assert_eq!(
        err,
        SessionError::HandshakeRejected(json!("Unknown compute: gpu"))
    );
}

#[tokio::test]
async fn test_connect_from_config() {
    let address = start_broker().await;
    let config = ClientConfig {
        host: Some(address),
        ..ClientConfig::default()
    };
    let session = timeout(WAIT, InteractiveSession::connect(&config, WorkerSpec::new("local")))
        .await
        .unwrap()
        .unwrap();
    session
        .set_env_var("EPOCHS", "3")
        .await
        .unwrap();
}

#[tokio::test]
async fn test_queued_execs_over_websocket() {
    let address = start_broker().await;
    let session = timeout(WAIT, connect(&address, "local"))
        .await
        .unwrap()
        .unwrap();
    let queue = QueuedSession::new(session);

    let tickets: Vec<_> = ["one", "two", "three"]
        .iter()
        .map(|word| queue.spawn(format!("echo {word} {word}")).unwrap())
        .collect();

    for (spawned, word) in tickets.into_iter().zip(["one", "two", "three"]) {
        let lines = Arc::new(Mutex::new(Vec::new()));
        let mut collector = LineCollector::new();
        let sink = Arc::clone(&lines);
        collector.on(move |line| sink.lock().unwrap().push(line));

        let mut events = spawned.events;
        let settled = timeout(WAIT, spawned.ticket).await.unwrap();
        assert_eq!(settled.into_result(), Ok(json!(0)));

        while let Some(msg) = events.recv().await {
            if msg.kind == Kind::Stdout {
                collector.receive(msg.data_text());
            }
        }
        collector.flush();
        assert_eq!(*lines.lock().unwrap(), vec![format!("{word} {word}")]);
    }
    assert!(queue.is_empty());
}
