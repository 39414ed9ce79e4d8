use crate::server::ServerState;
use axum::extract::State;
use axum::{http::StatusCode, response::Json, routing::get, Router};
use metrics_exporter_prometheus::{PrometheusBuilder, PrometheusHandle};
use serde::Serialize;
use std::net::SocketAddr;
use std::sync::atomic::Ordering;
use std::sync::Arc;

/// Live broker figures served by `/health` and `/ready`.
#[derive(Serialize, Debug, PartialEq, Eq)]
struct BrokerStatus {
    status: &'static str,
    accepting: bool,
    sessions: usize,
    connections: usize,
}

impl BrokerStatus {
    fn of(state: &ServerState) -> Self {
        let accepting = state.is_accepting();
        Self {
            status: if accepting { "ready" } else { "not ready" },
            accepting,
            sessions: state.registry.len(),
            connections: state.active_connections.load(Ordering::Relaxed),
        }
    }
}

fn router(state: Arc<ServerState>, handle: PrometheusHandle) -> Router {
    Router::new()
        .route(
            "/metrics",
            get(move || {
                let h = handle.clone();
                async move { h.render() }
            }),
        )
        .route("/health", get(health_handler))
        .route("/ready", get(ready_handler))
        .with_state(state)
}

/// Serve `/metrics`, `/health` and `/ready` for the broker behind `state`.
///
/// # Errors
///
/// Returns an error if installing the recorder or binding the HTTP listener fails.
pub async fn start_metrics_server(addr: SocketAddr, state: Arc<ServerState>) -> anyhow::Result<()> {
    let handle = PrometheusBuilder::new().install_recorder()?;
    let listener = tokio::net::TcpListener::bind(addr).await?;
    tracing::info!("metrics server listening on {}", addr);
    axum::serve(listener, router(state, handle)).await?;
    Ok(())
}

/// Always 200 while the process is up, with session and connection counts.
async fn health_handler(State(state): State<Arc<ServerState>>) -> Json<BrokerStatus> {
    Json(BrokerStatus {
        status: "healthy",
        ..BrokerStatus::of(&state)
    })
}

/// 200 while the accept loop runs, 503 before it starts and while draining.
async fn ready_handler(
    State(state): State<Arc<ServerState>>,
) -> (StatusCode, Json<BrokerStatus>) {
    let status = BrokerStatus::of(&state);
    let code = if status.accepting {
        StatusCode::OK
    } else {
        StatusCode::SERVICE_UNAVAILABLE
    };
    (code, Json(status))
}

/// Connection and session gauges.
pub mod gauges {
    /// Increment the active connections gauge.
    pub fn inc_connections_active() {
        metrics::gauge!("dsync_connections_active").increment(1.0);
    }

    /// Decrement the active connections gauge.
    pub fn dec_connections_active() {
        metrics::gauge!("dsync_connections_active").decrement(1.0);
    }

    /// Increment the live sessions gauge.
    pub fn inc_sessions_active() {
        metrics::gauge!("dsync_sessions_active").increment(1.0);
    }

    /// Decrement the live sessions gauge.
    pub fn dec_sessions_active() {
        metrics::gauge!("dsync_sessions_active").decrement(1.0);
    }
}

/// Event counters.
pub mod counters {
    /// Record a successful login for the given role.
    pub fn logins_total(role: &'static str) {
        metrics::counter!("dsync_logins_total", "role" => role).increment(1);
    }

    /// Record an action forwarded from the given role to its counterpart.
    pub fn actions_relayed_total(from_role: &'static str) {
        metrics::counter!("dsync_actions_relayed_total", "from" => from_role).increment(1);
    }

    /// Record a message that could not be processed.
    pub fn protocol_errors_total(reason: &'static str) {
        metrics::counter!("dsync_protocol_errors_total", "reason" => reason).increment(1);
    }
}
