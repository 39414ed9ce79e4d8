use crate::error::{ProtocolError, ServerError};
use crate::metrics::{counters, gauges};
use crate::registry::{lock, ConnId, LoginParams, PeerHandle, SessionRef, SessionRegistry};
use crate::server::ServerState;
use dsync_proto::types::message_type;
use dsync_proto::{Envelope, MessageId, Role};
use futures_util::stream::{SplitSink, SplitStream};
use futures_util::{SinkExt, StreamExt};
use serde_json::Value;
use std::fmt::Display;
use std::net::SocketAddr;
use std::sync::atomic::Ordering;
use std::sync::Arc;
use tokio::net::TcpStream;
use tokio::sync::{mpsc, watch};
use tokio::time::{interval, Duration, MissedTickBehavior};
use tokio_tungstenite::tungstenite::protocol::WebSocketConfig;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::WebSocketStream;
use tracing::{debug, info, trace, warn};

type WsSink = SplitSink<WebSocketStream<TcpStream>, Message>;
type WsRecv = SplitStream<WebSocketStream<TcpStream>>;

/// Role-agnostic wrapper around one accepted connection.
///
/// Membership in a session is owned by the registry. The connection only
/// memoizes the lookup for the duration of one inbound event and drops the
/// memo whenever new traffic arrives.
pub struct PeerConnection {
    handle: PeerHandle,
    registry: Arc<SessionRegistry>,
    session_memo: Option<SessionRef>,
}

impl PeerConnection {
    /// Wrap a connection whose outbound queue is fed through `handle`.
    #[must_use]
    pub const fn new(handle: PeerHandle, registry: Arc<SessionRegistry>) -> Self {
        Self {
            handle,
            registry,
            session_memo: None,
        }
    }

    /// The connection id.
    #[must_use]
    pub const fn id(&self) -> ConnId {
        self.handle.id()
    }

    /// Queue an envelope on this connection's own outbound queue.
    pub fn send(&self, envelope: &Envelope) {
        if !self.handle.send_envelope(envelope) {
            debug!(conn_id = self.id(), "outbound queue closed, dropping frame");
        }
    }

    fn session(&mut self) -> Option<SessionRef> {
        if self.session_memo.is_none() {
            self.session_memo = self.registry.get_session(self.id());
        }
        self.session_memo.clone()
    }

    fn role_and_session_id(&mut self) -> (Option<Role>, Option<String>) {
        let id = self.id();
        match self.session() {
            Some(session) => {
                let guard = lock(&session);
                (guard.role_of(id), Some(guard.id().to_string()))
            }
            None => (None, None),
        }
    }

    /// Handle one inbound text frame.
    ///
    /// Failures never propagate to the transport; they are reported to the
    /// session's tester, or logged when there is nobody to tell.
    pub fn on_message(&mut self, frame: &str) {
        self.session_memo = None;
        trace!(conn_id = self.id(), event = "GET_FROM", "{}", frame);

        let envelope = match Envelope::parse(frame) {
            Ok(envelope) => envelope,
            Err(e) => {
                let message_id = e.message_id();
                return self.report_error(&ProtocolError::from(e), message_id);
            }
        };

        if let Err(e) = self.handle_action(frame, &envelope) {
            self.report_error(&e, envelope.message_id);
        }
    }

    /// Transport error: log only. The close path does the cleanup.
    pub fn on_error(&mut self, error: &dyn Display) {
        self.session_memo = None;
        let (role, session_id) = self.role_and_session_id();
        warn!(
            conn_id = self.id(),
            event = "WEBSOCKET_ERROR",
            role = role.map(Role::as_str),
            session_id = session_id.as_deref(),
            "{error}"
        );
    }

    /// Transport closed: leave whatever session this connection was in.
    pub fn on_close(&mut self) {
        self.session_memo = None;
        if let Some((session_id, role)) = self.registry.unregister_connection(self.id()) {
            info!(conn_id = self.id(), %session_id, %role, "peer left session");
        }
    }

    fn handle_action(&mut self, frame: &str, envelope: &Envelope) -> Result<(), ProtocolError> {
        if envelope.is(message_type::LOGIN) {
            return self.handle_login(envelope);
        }

        let session = self
            .session()
            .ok_or_else(|| ProtocolError::NoSession(envelope.kind.clone()))?;
        let guard = lock(&session);
        guard.carry(self.id(), frame)
    }

    fn handle_login(&mut self, envelope: &Envelope) -> Result<(), ProtocolError> {
        let login = parse_login(envelope)?;
        self.registry.register_session(&self.handle, &login)?;
        self.session_memo = None;
        counters::logins_total(login.role.as_str());
        info!(
            conn_id = self.id(),
            role = %login.role,
            session_id = %login.session_id,
            "login"
        );

        let mut reply = envelope.clone();
        reply.kind = message_type::LOGIN_SUCCESS.to_string();
        self.send(&reply);
        Ok(())
    }

    fn report_error(&mut self, error: &ProtocolError, message_id: Option<MessageId>) {
        counters::protocol_errors_total(error.reason());

        let tester = self.session().and_then(|session| {
            let guard = lock(&session);
            guard.tester().cloned()
        });
        match tester {
            Some(tester) => {
                debug!(conn_id = self.id(), ?message_id, "reporting error to tester: {error}");
                tester.send_envelope(&Envelope::error(&error.to_string(), message_id));
            }
            None => {
                warn!(
                    conn_id = self.id(),
                    event = "MESSAGE_ERROR",
                    ?message_id,
                    "{error}"
                );
            }
        }
    }
}

/// Validate the `params` of a login envelope.
///
/// # Errors
///
/// Returns a login [`ProtocolError`] naming the first problem found.
pub fn parse_login(envelope: &Envelope) -> Result<LoginParams, ProtocolError> {
    let params = envelope
        .params
        .as_ref()
        .filter(|p| p.is_object())
        .ok_or(ProtocolError::LoginMissingParams)?;

    let role = params
        .get("role")
        .and_then(Value::as_str)
        .and_then(Role::from_wire)
        .ok_or(ProtocolError::LoginInvalidRole)?;

    let session_id = match params.get("sessionId") {
        None | Some(Value::Null) => return Err(ProtocolError::LoginMissingSessionId),
        Some(Value::String(s)) if s.is_empty() => {
            return Err(ProtocolError::LoginMissingSessionId)
        }
        Some(Value::String(s)) => s.clone(),
        Some(_) => return Err(ProtocolError::LoginNonStringSessionId),
    };

    Ok(LoginParams { role, session_id })
}

/// Keeps the active connection count honest however the task ends.
struct ConnectionGuard {
    state: Arc<ServerState>,
}

impl ConnectionGuard {
    fn new(state: Arc<ServerState>) -> Self {
        state.active_connections.fetch_add(1, Ordering::Relaxed);
        gauges::inc_connections_active();
        Self { state }
    }
}

impl Drop for ConnectionGuard {
    fn drop(&mut self) {
        self.state.active_connections.fetch_sub(1, Ordering::Relaxed);
        gauges::dec_connections_active();
    }
}

/// Drive the select loop for one connection: inbound frames, the outbound
/// queue, keepalive pings and shutdown.
async fn run_message_loop(
    ws_tx: &mut WsSink,
    ws_rx: &mut WsRecv,
    outbound_rx: &mut mpsc::UnboundedReceiver<String>,
    conn: &mut PeerConnection,
    ping_every: Duration,
    shutdown_rx: &mut watch::Receiver<()>,
) -> Result<(), ServerError> {
    let mut ping_interval = interval(ping_every);
    ping_interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
    ping_interval.tick().await;

    loop {
        tokio::select! {
            msg = ws_rx.next() => {
                match msg {
                    Some(Ok(Message::Text(text))) => conn.on_message(&text),
                    Some(Ok(Message::Binary(data))) => conn.on_message(&String::from_utf8_lossy(&data)),
                    Some(Ok(Message::Ping(data))) => {
                        if let Err(e) = ws_tx.send(Message::Pong(data)).await {
                            debug!("failed to send pong: {}", e);
                        }
                    }
                    Some(Ok(Message::Close(_))) | None => return Ok(()),
                    Some(Err(e)) => {
                        conn.on_error(&e);
                        return Err(ServerError::WebSocket(e));
                    }
                    _ => {}
                }
            }
            Some(frame) = outbound_rx.recv() => {
                trace!(conn_id = conn.id(), event = "SEND_TO", "{}", frame);
                ws_tx.send(Message::Text(frame)).await.map_err(ServerError::WebSocket)?;
            }
            _ = ping_interval.tick() => {
                if let Err(e) = ws_tx.send(Message::Ping(vec![])).await {
                    debug!("failed to send ping: {}", e);
                }
            }
            _ = shutdown_rx.changed() => {
                debug!(conn_id = conn.id(), "server shutting down, closing connection");
                return Ok(());
            }
        }
    }
}

/// Serve one accepted TCP connection until it closes.
///
/// # Errors
///
/// Returns an error if the WebSocket handshake fails or the transport breaks.
pub async fn handle_connection(
    stream: TcpStream,
    peer_addr: SocketAddr,
    state: Arc<ServerState>,
    mut shutdown_rx: watch::Receiver<()>,
) -> Result<(), ServerError> {
    let ws_config = WebSocketConfig {
        max_message_size: Some(state.config.max_message_size),
        max_frame_size: Some(state.config.max_message_size),
        ..WebSocketConfig::default()
    };
    let ws_stream = tokio_tungstenite::accept_async_with_config(stream, Some(ws_config))
        .await
        .map_err(ServerError::WebSocket)?;

    let _guard = ConnectionGuard::new(Arc::clone(&state));
    let conn_id = state.next_conn_id.fetch_add(1, Ordering::Relaxed);
    debug!(conn_id, peer = %peer_addr, "connection accepted");

    let (mut ws_tx, mut ws_rx) = ws_stream.split();
    let (outbound_tx, mut outbound_rx) = mpsc::unbounded_channel::<String>();
    let mut conn = PeerConnection::new(
        PeerHandle::new(conn_id, outbound_tx),
        Arc::clone(&state.registry),
    );

    let result = run_message_loop(
        &mut ws_tx,
        &mut ws_rx,
        &mut outbound_rx,
        &mut conn,
        Duration::from_secs(state.config.ping_interval),
        &mut shutdown_rx,
    )
    .await;

    conn.on_close();
    let _ = ws_tx.close().await;
    debug!(conn_id, peer = %peer_addr, "connection closed");

    result
}
