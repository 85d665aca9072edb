use crate::config::ServerConfig;
use crate::connection::handle_connection;
use crate::error::RelayError;
use crate::metrics::{counters, HealthState};
use crate::registry::Registry;
use dashmap::DashMap;
use std::net::IpAddr;
use std::sync::Arc;
use tokio::net::TcpListener;
use tokio::sync::{watch, Semaphore};
use tokio::task::JoinSet;
use tracing::{error, info, warn};

/// Shared state for the relay server.
pub struct ServerState {
    /// Connections currently open.
    pub registry: Registry,
    /// Runtime server configuration.
    pub config: ServerConfig,
    /// Per-IP connection counter for enforcing connection limits.
    pub ip_connections: DashMap<IpAddr, usize>,
    /// One permit per accepted socket, held from accept until its task
    /// ends. Bounds pending handshakes and registered peers together.
    pub conn_slots: Arc<Semaphore>,
    /// Readiness reported on the health endpoint.
    pub health: HealthState,
}

impl ServerState {
    /// Fresh state with an empty registry.
    #[must_use]
    pub fn new(config: ServerConfig, health: HealthState) -> Self {
        Self {
            registry: Registry::new(),
            conn_slots: Arc::new(Semaphore::new(config.max_conns)),
            config,
            ip_connections: DashMap::new(),
            health,
        }
    }
}

/// Run the accept loop until the process exits.
///
/// # Errors
///
/// Returns an error if the listener's local address cannot be read.
pub async fn run(listener: TcpListener, state: Arc<ServerState>) -> Result<(), RelayError> {
    let (_shutdown_tx, shutdown_rx) = watch::channel(false);
    run_with_shutdown(listener, state, shutdown_rx).await
}

/// Run the accept loop with an externally-controlled shutdown signal.
///
/// Shutdown starts when `shutdown` is set to `true` or its sender is
/// dropped. The loop then stops accepting, shuts the registry down so every
/// connection closes, and waits up to the configured drain timeout for
/// connection tasks to finish.
///
/// # Errors
///
/// Returns an error if the listener's local address cannot be read.
pub async fn run_with_shutdown(
    listener: TcpListener,
    state: Arc<ServerState>,
    mut shutdown: watch::Receiver<bool>,
) -> Result<(), RelayError> {
    let local_addr = listener.local_addr().map_err(RelayError::Io)?;
    info!("relay listening on {}", local_addr);
    let mut tasks = JoinSet::new();

    loop {
        tokio::select! {
            result = listener.accept() => {
                match result {
                    Ok((stream, addr)) => {
                        let Ok(slot) = Arc::clone(&state.conn_slots).try_acquire_owned() else {
                            warn!("max connections reached, rejecting {}", addr);
                            counters::connections_total("max_conns");
                            drop(stream);
                            continue;
                        };
                        let state = Arc::clone(&state);
                        tasks.spawn(async move {
                            let _slot = slot;
                            if let Err(e) = handle_connection(stream, addr, state).await {
                                tracing::debug!("connection from {} closed: {}", addr, e);
                            }
                        });
                    }
                    Err(e) => {
                        error!("failed to accept connection: {}", e);
                    }
                }
            }
            Some(joined) = tasks.join_next(), if !tasks.is_empty() => {
                if let Err(e) = joined {
                    warn!("connection task failed: {}", e);
                }
            }
            changed = shutdown.changed() => {
                if changed.is_err() || *shutdown.borrow() {
                    break;
                }
            }
        }
    }

    drop(listener);
    state.health.set_ready(false);
    let closed = state.registry.shutdown();
    info!(
        "shutdown signal received, closing {} connections ({} tasks)",
        closed,
        tasks.len()
    );

    let drain = async {
        while let Some(joined) = tasks.join_next().await {
            if let Err(e) = joined {
                warn!("connection task failed: {}", e);
            }
        }
    };
    if tokio::time::timeout(state.config.drain_timeout(), drain)
        .await
        .is_err()
    {
        warn!(
            "drain timeout reached with {} connections still active",
            tasks.len()
        );
        tasks.abort_all();
    }

    info!("relay shut down gracefully");
    Ok(())
}
