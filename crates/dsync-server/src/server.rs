use crate::config::ServerConfig;
use crate::connection::handle_connection;
use crate::error::ServerError;
use crate::registry::SessionRegistry;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use tokio::net::TcpListener;
use tracing::{debug, error, info, warn};

/// Shared state for the session broker.
pub struct ServerState {
    /// Live sessions keyed by session id.
    pub registry: Arc<SessionRegistry>,
    /// Runtime server configuration.
    pub config: ServerConfig,
    /// Number of connections currently being served.
    pub active_connections: AtomicUsize,
    /// Source of process-unique connection ids.
    pub next_conn_id: AtomicU64,
    accepting: AtomicBool,
}

impl ServerState {
    /// Fresh state with an empty registry.
    #[must_use]
    pub fn new(config: ServerConfig) -> Self {
        Self {
            registry: Arc::new(SessionRegistry::new()),
            config,
            active_connections: AtomicUsize::new(0),
            next_conn_id: AtomicU64::new(1),
            accepting: AtomicBool::new(false),
        }
    }

    /// Whether the accept loop is taking new connections.
    #[must_use]
    pub fn is_accepting(&self) -> bool {
        self.accepting.load(Ordering::Relaxed)
    }

    /// Flip the flag reported by `/ready`.
    pub fn set_accepting(&self, accepting: bool) {
        self.accepting.store(accepting, Ordering::Relaxed);
    }
}

/// # Errors
///
/// Returns an error if the accept loop encounters an I/O failure.
pub async fn run(listener: TcpListener, state: Arc<ServerState>) -> Result<(), ServerError> {
    let (_shutdown_tx, shutdown_rx) = tokio::sync::watch::channel(());
    run_with_shutdown(listener, state, shutdown_rx).await
}

/// Run the accept loop with an externally-controlled shutdown signal.
///
/// A send on the paired sender, or dropping it, stops the accept loop. Open
/// connections watch the same channel, close, and are given a bounded time
/// to drain.
///
/// # Errors
///
/// Returns an error if the listener's local address cannot be read.
pub async fn run_with_shutdown(
    listener: TcpListener,
    state: Arc<ServerState>,
    mut shutdown_rx: tokio::sync::watch::Receiver<()>,
) -> Result<(), ServerError> {
    let local_addr = listener.local_addr().map_err(ServerError::Io)?;
    info!("server listening on {}", local_addr);
    state.set_accepting(true);
    let task_tracker = Arc::new(tokio::sync::Notify::new());

    loop {
        tokio::select! {
            result = listener.accept() => {
                match result {
                    Ok((stream, addr)) => {
                        if state.active_connections.load(Ordering::Relaxed) >= state.config.max_conns {
                            warn!("max connections reached, rejecting {}", addr);
                            drop(stream);
                            continue;
                        }
                        let state = Arc::clone(&state);
                        let tracker = Arc::clone(&task_tracker);
                        let conn_shutdown = shutdown_rx.clone();
                        tokio::spawn(async move {
                            if let Err(e) = handle_connection(stream, addr, state, conn_shutdown).await {
                                debug!("connection from {} closed: {}", addr, e);
                            }
                            tracker.notify_one();
                        });
                    }
                    Err(e) => {
                        error!("failed to accept connection: {}", e);
                    }
                }
            }
            _ = shutdown_rx.changed() => {
                state.set_accepting(false);
                info!(
                    "shutdown signal received, draining {} connections",
                    state.active_connections.load(Ordering::Relaxed)
                );
                break;
            }
        }
    }

    let drain_timeout = std::time::Duration::from_secs(30);
    let deadline = tokio::time::Instant::now() + drain_timeout;
    // Notify permits coalesce, so re-read the live count after every wakeup.
    while state.active_connections.load(Ordering::Relaxed) > 0 {
        if tokio::time::timeout_at(deadline, task_tracker.notified())
            .await
            .is_err()
        {
            warn!(
                "drain timeout reached with {} connections still active",
                state.active_connections.load(Ordering::Relaxed)
            );
            break;
        }
    }

    info!("server shut down gracefully");
    Ok(())
}
