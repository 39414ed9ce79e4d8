#![allow(dead_code)]

use dsync_client::{Client, ClientConfig};
use dsync_server::config::ServerConfig;
use dsync_server::server::ServerState;
use futures_util::{SinkExt, StreamExt};
use serde_json::{json, Value};
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpListener;
use tokio_tungstenite::tungstenite::Message;

pub const QUIET: Duration = Duration::from_millis(200);

/// Start a broker on an ephemeral port.
pub async fn start_server() -> SocketAddr {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let state = Arc::new(ServerState::new(ServerConfig {
        listen: addr,
        metrics_addr: None,
        max_conns: 1000,
        ping_interval: 30,
        max_message_size: 1 << 20,
    }));

    tokio::spawn(async move {
        if let Err(e) = dsync_server::run(listener, state).await {
            eprintln!("server error in test: {e}");
        }
    });

    tokio::time::sleep(Duration::from_millis(50)).await;
    addr
}

pub fn client_config(addr: &SocketAddr, session_id: &str) -> ClientConfig {
    ClientConfig {
        server: format!("ws://{addr}"),
        session_id: session_id.to_string(),
        debug_synchronization_ms: 0,
    }
}

/// A client logged into `session_id`.
pub async fn connected_client(addr: &SocketAddr, session_id: &str) -> Arc<Client> {
    let client = Client::new(client_config(addr, session_id));
    client.connect().await.unwrap();
    Arc::new(client)
}

/// Poll until `check` holds or a second passes.
pub async fn eventually(mut check: impl FnMut() -> bool) -> bool {
    for _ in 0..100 {
        if check() {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    check()
}

/// Scripted stand-in for the app under test, speaking raw frames.
pub struct FakeApp {
    pub ws_tx: futures_util::stream::SplitSink<
        tokio_tungstenite::WebSocketStream<
            tokio_tungstenite::MaybeTlsStream<tokio::net::TcpStream>,
        >,
        Message,
    >,
    pub ws_rx: futures_util::stream::SplitStream<
        tokio_tungstenite::WebSocketStream<
            tokio_tungstenite::MaybeTlsStream<tokio::net::TcpStream>,
        >,
    >,
}

impl FakeApp {
    pub async fn join(addr: &SocketAddr, session_id: &str) -> Self {
        let (ws, _) = tokio_tungstenite::connect_async(format!("ws://{addr}"))
            .await
            .unwrap();
        let (ws_tx, ws_rx) = ws.split();
        let mut app = Self { ws_tx, ws_rx };
        app.send(json!({
            "type": "login",
            "messageId": 0,
            "params": {"role": "app", "sessionId": session_id},
        }))
        .await;
        assert_eq!(app.recv().await["type"], "loginSuccess");
        app
    }

    pub async fn send(&mut self, value: Value) {
        self.ws_tx
            .send(Message::Text(value.to_string()))
            .await
            .unwrap();
    }

    pub async fn recv(&mut self) -> Value {
        loop {
            let msg = tokio::time::timeout(Duration::from_secs(5), self.ws_rx.next())
                .await
                .expect("timeout waiting for frame")
                .unwrap()
                .unwrap();
            match msg {
                Message::Text(text) => return serde_json::from_str(&text).unwrap(),
                Message::Ping(_) | Message::Pong(_) => {}
                other => panic!("expected text frame, got {other:?}"),
            }
        }
    }

    pub async fn recv_timeout(&mut self, timeout: Duration) -> Option<Value> {
        tokio::time::timeout(timeout, self.recv()).await.ok()
    }

    /// Receive the next request of type `kind`, skipping others.
    pub async fn expect(&mut self, kind: &str) -> Value {
        loop {
            let msg = self.recv().await;
            if msg["type"] == kind {
                return msg;
            }
        }
    }

    /// Answer `request` with a reply of type `kind`.
    pub async fn reply(&mut self, request: &Value, kind: &str, params: Value) {
        self.send(json!({
            "type": kind,
            "messageId": request["messageId"],
            "params": params,
        }))
        .await;
    }

    pub async fn close(mut self) {
        let _ = self.ws_tx.send(Message::Close(None)).await;
        let _ = self.ws_tx.close().await;
    }
}
