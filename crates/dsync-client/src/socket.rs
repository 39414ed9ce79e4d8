use dsync_proto::{Envelope, MessageId};
use futures_util::stream::{SplitSink, SplitStream};
use futures_util::{SinkExt, StreamExt};
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicI64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use thiserror::Error;
use tokio::net::TcpStream;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream};
use tracing::{debug, error, trace, warn};

type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;

/// How long `close()` waits for the peer to finish the close handshake.
const CLOSE_TIMEOUT: Duration = Duration::from_secs(5);

/// Failures of the correlated socket.
///
/// `Clone` so that one cause can reject every pending call at once.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum SocketError {
    /// Sending or closing before `open()`, or after `close()`.
    #[error("the websocket is closed, open it by calling open()")]
    NotOpen,
    /// `open()` on a socket that is already open.
    #[error("the websocket is already open")]
    AlreadyOpen,
    /// The transport could not be established.
    #[error("failed to open {url}: {reason}")]
    Open {
        /// Server URL.
        url: String,
        /// Transport error text.
        reason: String,
    },
    /// The transport failed while calls were outstanding.
    #[error("websocket error: {0}")]
    Transport(String),
    /// The transport closed while calls were outstanding.
    #[error("the websocket connection was closed")]
    ConnectionClosed,
    /// The app left the session.
    #[error("The app has unexpectedly disconnected")]
    AppDisconnected,
    /// The app reported a fatal error before terminating.
    #[error("The app has crashed: {0}")]
    AppCrashed(String),
}

/// Subscriber for unsolicited messages of one type.
pub type EventCallback = Arc<dyn Fn(&Envelope) + Send + Sync>;

type Reply = Result<Envelope, SocketError>;
type Callbacks = Mutex<HashMap<String, Vec<EventCallback>>>;

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

struct PendingCall {
    token: u64,
    message: Envelope,
    tx: oneshot::Sender<Reply>,
}

#[derive(Default)]
struct PendingCalls {
    in_flight: HashMap<MessageId, Vec<PendingCall>>,
    detached: HashMap<MessageId, Vec<PendingCall>>,
    next_token: u64,
}

/// Calls awaiting a reply, keyed by message id.
///
/// Several calls may wait on the same id (control actions share a fixed
/// sentinel id); a reply with that id settles all of them. Detached calls are
/// hidden from [`PendingTable::snapshot`] but still settle on a matching reply
/// or on a batch rejection.
#[derive(Default)]
pub struct PendingTable {
    calls: Mutex<PendingCalls>,
}

impl PendingTable {
    fn register(&self, message: Envelope) -> (u64, oneshot::Receiver<Reply>) {
        let id = message.message_id.unwrap_or_default();
        let (tx, rx) = oneshot::channel();
        let mut calls = lock(&self.calls);
        let token = calls.next_token;
        calls.next_token += 1;
        calls
            .in_flight
            .entry(id)
            .or_default()
            .push(PendingCall { token, message, tx });
        (token, rx)
    }

    fn cancel(&self, id: MessageId, token: u64) {
        let mut calls = lock(&self.calls);
        let PendingCalls {
            in_flight,
            detached,
            ..
        } = &mut *calls;
        for table in [in_flight, detached] {
            if let Some(waiters) = table.get_mut(&id) {
                waiters.retain(|call| call.token != token);
                if waiters.is_empty() {
                    table.remove(&id);
                }
            }
        }
    }

    /// Resolve every call waiting on the envelope's id.
    ///
    /// Hands the envelope back when nobody is waiting for it.
    fn settle(&self, envelope: Envelope) -> Result<usize, Envelope> {
        let Some(id) = envelope.message_id else {
            return Err(envelope);
        };
        let waiters = {
            let mut calls = lock(&self.calls);
            let mut waiters = calls.in_flight.remove(&id).unwrap_or_default();
            waiters.extend(calls.detached.remove(&id).unwrap_or_default());
            waiters
        };
        if waiters.is_empty() {
            return Err(envelope);
        }

        let count = waiters.len();
        for call in waiters {
            let _ = call.tx.send(Ok(envelope.clone()));
        }
        Ok(count)
    }

    /// Reject every pending call, detached ones included, with `error`.
    /// Returns how many calls were rejected.
    pub fn reject_all(&self, error: &SocketError) -> usize {
        let waiters: Vec<PendingCall> = {
            let mut calls = lock(&self.calls);
            let in_flight = std::mem::take(&mut calls.in_flight);
            let detached = std::mem::take(&mut calls.detached);
            in_flight
                .into_values()
                .chain(detached.into_values())
                .flatten()
                .collect()
        };

        let count = waiters.len();
        for call in waiters {
            let _ = call.tx.send(Err(error.clone()));
        }
        count
    }

    /// The outbound messages of all calls still awaiting a reply, by id.
    #[must_use]
    pub fn snapshot(&self) -> Vec<Envelope> {
        let calls = lock(&self.calls);
        let mut messages: Vec<Envelope> = calls
            .in_flight
            .values()
            .flatten()
            .map(|call| call.message.clone())
            .collect();
        messages.sort_by_key(|message| message.message_id);
        messages
    }

    /// Stop tracking the current calls without settling them.
    pub fn detach_all(&self) -> usize {
        let mut calls = lock(&self.calls);
        let in_flight = std::mem::take(&mut calls.in_flight);
        let count = in_flight.values().map(Vec::len).sum();
        for (id, waiters) in in_flight {
            calls.detached.entry(id).or_default().extend(waiters);
        }
        count
    }

    /// Number of tracked calls.
    #[must_use]
    pub fn len(&self) -> usize {
        lock(&self.calls).in_flight.values().map(Vec::len).sum()
    }

    /// Returns `true` if no call is tracked.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Untracks one call when its `send` future finishes or is dropped.
struct CallGuard<'a> {
    table: &'a PendingTable,
    id: MessageId,
    token: u64,
}

impl Drop for CallGuard<'_> {
    fn drop(&mut self) {
        self.table.cancel(self.id, self.token);
    }
}

struct Connection {
    writer: mpsc::UnboundedSender<Message>,
    reader: JoinHandle<()>,
    write_task: JoinHandle<()>,
}

struct SocketShared {
    url: String,
    pending: Arc<PendingTable>,
    callbacks: Arc<Callbacks>,
    next_id: AtomicI64,
    open: Arc<AtomicBool>,
    connection: Mutex<Option<Connection>>,
}

/// One duplex WebSocket turned into a call/response API.
///
/// Every outbound message gets a `messageId`; the reply carrying the same id
/// settles the call. Inbound messages that answer no call are dispatched to
/// the subscribers registered for their `type`. Cloning yields another handle
/// to the same socket.
#[derive(Clone)]
pub struct CorrelatedSocket {
    shared: Arc<SocketShared>,
}

impl CorrelatedSocket {
    /// A closed socket that will connect to `url`.
    #[must_use]
    pub fn new(url: impl Into<String>) -> Self {
        Self {
            shared: Arc::new(SocketShared {
                url: url.into(),
                pending: Arc::new(PendingTable::default()),
                callbacks: Arc::new(Mutex::new(HashMap::new())),
                next_id: AtomicI64::new(0),
                open: Arc::new(AtomicBool::new(false)),
                connection: Mutex::new(None),
            }),
        }
    }

    /// The server URL.
    #[must_use]
    pub fn url(&self) -> &str {
        &self.shared.url
    }

    /// Establish the transport.
    ///
    /// # Errors
    ///
    /// Returns [`SocketError::Open`] if the connection cannot be made and
    /// [`SocketError::AlreadyOpen`] if it already is.
    pub async fn open(&self) -> Result<(), SocketError> {
        if self.is_open() {
            return Err(SocketError::AlreadyOpen);
        }

        let url = self.shared.url.as_str();
        let (ws, _) = tokio_tungstenite::connect_async(url).await.map_err(|e| {
            error!(event = "WEBSOCKET_ERROR", url, "caught error: {e}");
            SocketError::Open {
                url: url.to_string(),
                reason: e.to_string(),
            }
        })?;
        trace!(event = "WEBSOCKET_OPEN", "opened web socket to: {url}");

        let (ws_tx, ws_rx) = ws.split();
        let (writer, writer_rx) = mpsc::unbounded_channel();
        self.shared.open.store(true, Ordering::SeqCst);

        let write_task = tokio::spawn(write_loop(ws_tx, writer_rx));
        let reader = tokio::spawn(read_loop(
            ws_rx,
            writer.clone(),
            Arc::clone(&self.shared.pending),
            Arc::clone(&self.shared.callbacks),
            Arc::clone(&self.shared.open),
        ));

        let stale = lock(&self.shared.connection).replace(Connection {
            writer,
            reader,
            write_task,
        });
        if let Some(stale) = stale {
            stale.reader.abort();
            stale.write_task.abort();
        }
        Ok(())
    }

    /// Send `message` and wait for the reply carrying the same id.
    ///
    /// `id` overrides the internal counter; it is meant for control actions
    /// using a reserved sentinel id.
    ///
    /// # Errors
    ///
    /// Returns [`SocketError::NotOpen`] before `open()` or after `close()`,
    /// and the batch error if the call is rejected while outstanding.
    pub async fn send(
        &self,
        mut message: Envelope,
        id: Option<MessageId>,
    ) -> Result<Envelope, SocketError> {
        let writer = lock(&self.shared.connection)
            .as_ref()
            .map(|connection| connection.writer.clone())
            .ok_or(SocketError::NotOpen)?;

        let id = id.unwrap_or_else(|| self.shared.next_id.fetch_add(1, Ordering::SeqCst));
        message.message_id = Some(id);
        let frame = message.to_json();
        let (token, reply) = self.shared.pending.register(message);
        let _call = CallGuard {
            table: &self.shared.pending,
            id,
            token,
        };

        trace!(event = "WEBSOCKET_SEND", "{frame}");
        if !self.shared.open.load(Ordering::SeqCst) || writer.send(Message::Text(frame)).is_err()
        {
            return Err(SocketError::ConnectionClosed);
        }

        reply.await.unwrap_or(Err(SocketError::ConnectionClosed))
    }

    /// Subscribe to unsolicited messages of type `kind`. Subscribers run in
    /// registration order.
    pub fn set_event_callback<F>(&self, kind: impl Into<String>, callback: F)
    where
        F: Fn(&Envelope) + Send + Sync + 'static,
    {
        lock(&self.shared.callbacks)
            .entry(kind.into())
            .or_default()
            .push(Arc::new(callback));
    }

    /// Close the transport and wait for the reader to finish.
    ///
    /// # Errors
    ///
    /// Returns [`SocketError::NotOpen`] if the socket was never opened or has
    /// already been closed.
    pub async fn close(&self) -> Result<(), SocketError> {
        let mut connection = lock(&self.shared.connection)
            .take()
            .ok_or(SocketError::NotOpen)?;

        let _ = connection.writer.send(Message::Close(None));
        drop(connection.writer);

        if tokio::time::timeout(CLOSE_TIMEOUT, &mut connection.reader)
            .await
            .is_err()
        {
            warn!(url = %self.shared.url, "close handshake timed out");
            connection.reader.abort();
            self.shared.open.store(false, Ordering::SeqCst);
            self.shared.pending.reject_all(&SocketError::ConnectionClosed);
        }
        connection.write_task.abort();
        Ok(())
    }

    /// Whether the transport is ready to send.
    #[must_use]
    pub fn is_open(&self) -> bool {
        self.shared.open.load(Ordering::SeqCst) && lock(&self.shared.connection).is_some()
    }

    /// Reject every outstanding call with `error`.
    pub fn reject_all(&self, error: &SocketError) -> usize {
        self.shared.pending.reject_all(error)
    }

    /// Shared handle to the pending-call table.
    #[must_use]
    pub fn pending(&self) -> Arc<PendingTable> {
        Arc::clone(&self.shared.pending)
    }
}

async fn write_loop(
    mut ws_tx: SplitSink<WsStream, Message>,
    mut writer_rx: mpsc::UnboundedReceiver<Message>,
) {
    while let Some(msg) = writer_rx.recv().await {
        let closing = matches!(msg, Message::Close(_));
        if let Err(e) = ws_tx.send(msg).await {
            debug!("websocket write failed: {e}");
            break;
        }
        if closing {
            break;
        }
    }
}

async fn read_loop(
    mut ws_rx: SplitStream<WsStream>,
    writer: mpsc::UnboundedSender<Message>,
    pending: Arc<PendingTable>,
    callbacks: Arc<Callbacks>,
    open: Arc<AtomicBool>,
) {
    let outcome = loop {
        match ws_rx.next().await {
            Some(Ok(Message::Text(text))) => dispatch(&text, &pending, &callbacks),
            Some(Ok(Message::Binary(data))) => {
                dispatch(&String::from_utf8_lossy(&data), &pending, &callbacks);
            }
            Some(Ok(Message::Ping(data))) => {
                let _ = writer.send(Message::Pong(data));
            }
            Some(Ok(Message::Close(_))) | None => break SocketError::ConnectionClosed,
            Some(Err(e)) => {
                error!(event = "WEBSOCKET_ERROR", "caught error: {e}");
                break SocketError::Transport(e.to_string());
            }
            Some(Ok(_)) => {}
        }
    };

    open.store(false, Ordering::SeqCst);
    let rejected = pending.reject_all(&outcome);
    if rejected > 0 {
        debug!(rejected, "rejected pending calls: {outcome}");
    }
}

fn dispatch(frame: &str, pending: &PendingTable, callbacks: &Callbacks) {
    trace!(event = "WEBSOCKET_MESSAGE", "{frame}");
    let envelope = match Envelope::parse(frame) {
        Ok(envelope) => envelope,
        Err(e) => {
            warn!(event = "WEBSOCKET_MESSAGE", "dropping unreadable frame: {e}");
            return;
        }
    };

    if let Err(envelope) = pending.settle(envelope) {
        let subscribers = lock(callbacks)
            .get(&envelope.kind)
            .cloned()
            .unwrap_or_default();
        for callback in subscribers {
            callback(&envelope);
        }
    }
}
