#![allow(dead_code)]

use dsync_server::config::ServerConfig;
use dsync_server::server::ServerState;
use futures_util::{SinkExt, StreamExt};
use serde_json::{json, Value};
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpListener;
use tokio_tungstenite::tungstenite::Message;

pub fn test_config(listen: SocketAddr) -> ServerConfig {
    ServerConfig {
        listen,
        metrics_addr: None,
        max_conns: 1000,
        ping_interval: 30,
        max_message_size: 1 << 20,
    }
}

pub struct TestClient {
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

impl TestClient {
    pub async fn connect(addr: &SocketAddr) -> Self {
        let url = format!("ws://{addr}");
        let (ws, _) = tokio_tungstenite::connect_async(url).await.unwrap();
        let (ws_tx, ws_rx) = ws.split();
        Self { ws_tx, ws_rx }
    }

    /// Connect and log in, consuming the `loginSuccess` reply.
    pub async fn login(addr: &SocketAddr, role: &str, session_id: &str) -> Self {
        let mut client = Self::connect(addr).await;
        client
            .send_json(json!({
                "type": "login",
                "messageId": 0,
                "params": {"role": role, "sessionId": session_id},
            }))
            .await;
        let reply = client.recv_json().await;
        assert_eq!(reply["type"], "loginSuccess", "login failed: {reply}");
        client
    }

    pub async fn send_text(&mut self, text: &str) {
        self.ws_tx
            .send(Message::Text(text.to_string()))
            .await
            .unwrap();
    }

    pub async fn send_json(&mut self, value: Value) {
        self.send_text(&value.to_string()).await;
    }

    pub async fn recv_text(&mut self) -> String {
        loop {
            let msg = tokio::time::timeout(Duration::from_secs(5), self.ws_rx.next())
                .await
                .expect("timeout waiting for frame")
                .unwrap()
                .unwrap();
            match msg {
                Message::Text(text) => return text,
                Message::Ping(_) | Message::Pong(_) => {}
                other => panic!("expected text frame, got {other:?}"),
            }
        }
    }

    pub async fn recv_json(&mut self) -> Value {
        serde_json::from_str(&self.recv_text().await).unwrap()
    }

    pub async fn recv_json_timeout(&mut self, timeout: Duration) -> Option<Value> {
        tokio::time::timeout(timeout, self.recv_json()).await.ok()
    }

    pub async fn close(mut self) {
        let _ = self.ws_tx.send(Message::Close(None)).await;
        let _ = self.ws_tx.close().await;
    }
}

pub async fn start_server() -> (SocketAddr, Arc<ServerState>) {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let state = Arc::new(ServerState::new(test_config(addr)));

    let state_clone = state.clone();
    tokio::spawn(async move {
        if let Err(e) = dsync_server::run(listener, state_clone).await {
            eprintln!("server error in test: {e}");
        }
    });

    tokio::time::sleep(Duration::from_millis(50)).await;

    (addr, state)
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
