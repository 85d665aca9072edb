use crate::server::ServerState;
use axum::extract::State;
use axum::{http::StatusCode, response::Json, routing::get, Router};
use metrics_exporter_prometheus::{PrometheusBuilder, PrometheusHandle};
use serde::Serialize;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

/// Body of `/health` and `/ready`.
#[derive(Debug, Serialize)]
struct RelayStatus {
    status: &'static str,
    accepting: bool,
    peers: usize,
    free_slots: usize,
}

impl RelayStatus {
    fn of(state: &ServerState) -> Self {
        let accepting = state.health.is_ready();
        Self {
            status: if accepting { "relaying" } else { "draining" },
            accepting,
            peers: state.registry.len(),
            free_slots: state.conn_slots.available_permits(),
        }
    }
}

/// Whether the relay still accepts new peers. Cleared when shutdown begins.
#[derive(Clone, Debug)]
pub struct HealthState {
    accepting: Arc<AtomicBool>,
}

impl HealthState {
    /// A relay that is accepting.
    #[must_use]
    pub fn new() -> Self {
        Self {
            accepting: Arc::new(AtomicBool::new(true)),
        }
    }

    /// Set whether new peers are accepted.
    pub fn set_ready(&self, ready: bool) {
        self.accepting.store(ready, Ordering::Relaxed);
    }

    /// Whether new peers are accepted.
    #[must_use]
    pub fn is_ready(&self) -> bool {
        self.accepting.load(Ordering::Relaxed)
    }
}

impl Default for HealthState {
    fn default() -> Self {
        Self::new()
    }
}

/// Install the Prometheus recorder and serve `/metrics`, `/health` and
/// `/ready` for `state` on `addr`.
///
/// # Errors
///
/// Returns an error if the recorder cannot be installed or binding fails.
pub async fn start_metrics_server(
    addr: SocketAddr,
    state: Arc<ServerState>,
) -> anyhow::Result<()> {
    let handle = PrometheusBuilder::new().install_recorder()?;
    let listener = tokio::net::TcpListener::bind(addr).await?;
    tracing::info!("metrics server listening on {}", addr);
    axum::serve(listener, status_routes(state, handle)).await?;
    Ok(())
}

fn status_routes(state: Arc<ServerState>, handle: PrometheusHandle) -> Router {
    Router::new()
        .route(
            "/metrics",
            get(move || {
                let handle = handle.clone();
                async move { handle.render() }
            }),
        )
        .route("/health", get(health_handler))
        .route("/ready", get(ready_handler))
        .with_state(state)
}

/// Liveness: 200 for as long as the process serves HTTP.
async fn health_handler(State(state): State<Arc<ServerState>>) -> Json<RelayStatus> {
    Json(RelayStatus::of(&state))
}

/// 503 once the relay is draining.
async fn ready_handler(
    State(state): State<Arc<ServerState>>,
) -> (StatusCode, Json<RelayStatus>) {
    let status = RelayStatus::of(&state);
    let code = if status.accepting {
        StatusCode::OK
    } else {
        StatusCode::SERVICE_UNAVAILABLE
    };
    (code, Json(status))
}

/// Connection gauges.
pub mod gauges {
    /// Increment the active connections gauge.
    pub fn inc_connections_active() {
        metrics::gauge!("sigrelay_connections_active").increment(1.0);
    }

    /// Decrement the active connections gauge.
    pub fn dec_connections_active() {
        metrics::gauge!("sigrelay_connections_active").decrement(1.0);
    }
}

/// Event counters.
pub mod counters {
    /// Record an accepted or refused connection.
    pub fn connections_total(outcome: &'static str) {
        metrics::counter!("sigrelay_connections_total", "outcome" => outcome).increment(1);
    }

    /// Increment the inbound message counter.
    pub fn messages_received_total() {
        metrics::counter!("sigrelay_messages_received_total").increment(1);
    }

    /// Add to the count of per-recipient deliveries.
    pub fn messages_relayed_total(count: u64) {
        metrics::counter!("sigrelay_messages_relayed_total").increment(count);
    }

    /// Record a recipient dropped during broadcast.
    pub fn evictions_total(reason: &'static str) {
        metrics::counter!("sigrelay_evictions_total", "reason" => reason).increment(1);
    }

    /// Record bytes moved in the given direction.
    pub fn payload_bytes_total(direction: &'static str, bytes: u64) {
        metrics::counter!("sigrelay_payload_bytes_total", "direction" => direction)
            .increment(bytes);
    }
}

/// Distribution histograms.
pub mod histograms {
    /// Record how many recipients one broadcast reached.
    pub fn fanout_size(value: f64) {
        metrics::histogram!("sigrelay_fanout_size").record(value);
    }
}
