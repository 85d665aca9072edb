use crate::broadcast::broadcast;
use crate::error::RelayError;
use crate::metrics::{counters, gauges, histograms};
use crate::payload::Payload;
use crate::registry::ConnId;
use crate::server::ServerState;
use futures_util::{Sink, SinkExt, StreamExt};
use std::borrow::Cow;
use std::net::{IpAddr, SocketAddr};
use std::sync::Arc;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio::time::{interval_at, timeout, Duration, Instant, MissedTickBehavior};
use tokio_tungstenite::tungstenite::protocol::frame::coding::CloseCode;
use tokio_tungstenite::tungstenite::protocol::{CloseFrame, WebSocketConfig};
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::WebSocketStream;
use tokio_util::sync::CancellationToken;

/// Lifecycle of a relayed connection. Only ever moves forward.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) enum ConnState {
    /// Registered and relaying.
    Open,
    /// A close reason is known; nothing more is read.
    Closing,
    /// Unregistered and the socket is closed.
    Closed,
}

impl ConnState {
    fn advance(self) -> Self {
        match self {
            Self::Open => Self::Closing,
            Self::Closing | Self::Closed => Self::Closed,
        }
    }
}

/// Why a connection left [`ConnState::Open`].
#[derive(Debug)]
enum CloseReason {
    /// The peer sent a close frame or the stream ended.
    PeerClosed,
    /// The registry removed us (shutdown, or too slow to drain).
    Dropped,
    /// Reading or writing failed.
    Failed(RelayError),
}

struct IpGuard {
    state: Arc<ServerState>,
    ip: IpAddr,
}

impl IpGuard {
    /// Count one more connection from `ip`, or `None` if it is at its cap.
    fn acquire(state: &Arc<ServerState>, ip: IpAddr) -> Option<Self> {
        match state.ip_connections.entry(ip) {
            dashmap::mapref::entry::Entry::Occupied(mut entry) => {
                if *entry.get() >= state.config.max_conns_ip {
                    return None;
                }
                *entry.get_mut() += 1;
            }
            dashmap::mapref::entry::Entry::Vacant(entry) => {
                entry.insert(1);
            }
        }
        Some(Self {
            state: Arc::clone(state),
            ip,
        })
    }
}

impl Drop for IpGuard {
    fn drop(&mut self) {
        let mut remove = false;
        if let Some(mut entry) = self.state.ip_connections.get_mut(&self.ip) {
            *entry = entry.saturating_sub(1);
            if *entry == 0 {
                remove = true;
            }
        }
        if remove {
            self.state
                .ip_connections
                .remove_if(&self.ip, |_, v| *v == 0);
        }
    }
}

/// Upgrade an accepted socket and relay for it until it closes.
pub async fn handle_connection(
    stream: TcpStream,
    peer_addr: SocketAddr,
    state: Arc<ServerState>,
) -> Result<(), RelayError> {
    let ws_config = WebSocketConfig {
        max_message_size: Some(state.config.max_payload),
        max_frame_size: Some(state.config.max_payload),
        ..WebSocketConfig::default()
    };

    let ws_stream = timeout(
        state.config.handshake_timeout(),
        tokio_tungstenite::accept_async_with_config(stream, Some(ws_config)),
    )
    .await
    .map_err(|_| RelayError::HandshakeTimeout)?
    .map_err(RelayError::WebSocket)?;

    let Some(_ip_guard) = IpGuard::acquire(&state, peer_addr.ip()) else {
        tracing::debug!(
            peer = %peer_addr,
            limit = state.config.max_conns_ip,
            "per-IP connection limit exceeded"
        );
        counters::connections_total("ip_limit");
        let mut ws_stream = ws_stream;
        let _ = timeout(
            state.config.write_timeout(),
            ws_stream.close(Some(close_frame(CloseCode::Policy, "too many connections"))),
        )
        .await;
        return Err(RelayError::ConnectionClosed);
    };

    serve_peer(ws_stream, peer_addr, &state).await
}

/// Register an upgraded connection, relay until it closes, then unregister.
pub(crate) async fn serve_peer<S>(
    ws_stream: WebSocketStream<S>,
    peer_addr: SocketAddr,
    state: &ServerState,
) -> Result<(), RelayError>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let (mut ws_tx, mut ws_rx) = ws_stream.split();
    let (deliver_tx, mut deliver_rx) = mpsc::channel::<Payload>(state.config.peer_queue);
    let evicted = CancellationToken::new();

    let id = match state
        .registry
        .register(deliver_tx, peer_addr, evicted.clone())
    {
        Ok(id) => id,
        Err(e) => {
            counters::connections_total("shutting_down");
            let _ = write(
                &mut ws_tx,
                Message::Close(Some(close_frame(CloseCode::Away, "server shutting down"))),
                state.config.write_timeout(),
            )
            .await;
            return Err(e);
        }
    };
    let mut conn_state = ConnState::Open;

    counters::connections_total("accepted");
    gauges::inc_connections_active();
    tracing::info!(
        conn = %id,
        peer = %peer_addr,
        active = state.registry.len(),
        "peer connected"
    );

    let reason = run_message_loop(
        &mut ws_tx,
        &mut ws_rx,
        &mut deliver_rx,
        &evicted,
        state,
        id,
    )
    .await;
    conn_state = conn_state.advance();
    tracing::trace!(conn = %id, state = ?conn_state, reason = ?reason, "leaving relay loop");

    state.registry.unregister(id);
    gauges::dec_connections_active();

    let write_timeout = state.config.write_timeout();
    let result = match reason {
        CloseReason::PeerClosed => {
            // Flushes tungstenite's reply to the peer's close frame.
            let _ = timeout(write_timeout, ws_tx.close()).await;
            Ok(())
        }
        CloseReason::Dropped => {
            let frame = if state.registry.is_shut_down() {
                close_frame(CloseCode::Away, "server shutting down")
            } else {
                close_frame(CloseCode::Again, "too slow")
            };
            let _ = write(&mut ws_tx, Message::Close(Some(frame)), write_timeout).await;
            Ok(())
        }
        CloseReason::Failed(e) => Err(e),
    };
    conn_state = conn_state.advance();

    tracing::info!(
        conn = %id,
        peer = %peer_addr,
        state = ?conn_state,
        active = state.registry.len(),
        "peer disconnected"
    );

    result
}

/// Drive the read/deliver/keepalive select loop for a registered connection.
///
/// Returns as soon as `evicted` fires. A frame read after eviction is
/// discarded, so a connection outside the registry never relays.
async fn run_message_loop<T, R>(
    ws_tx: &mut T,
    ws_rx: &mut R,
    deliver_rx: &mut mpsc::Receiver<Payload>,
    evicted: &CancellationToken,
    state: &ServerState,
    id: ConnId,
) -> CloseReason
where
    T: Sink<Message, Error = tungstenite::Error> + Unpin,
    R: futures_util::Stream<Item = Result<Message, tungstenite::Error>> + Unpin,
{
    let write_timeout = state.config.write_timeout();
    let period = state.config.ping_interval();
    let mut ping_interval = interval_at(Instant::now() + period, period);
    ping_interval.set_missed_tick_behavior(MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            () = evicted.cancelled() => return CloseReason::Dropped,
            msg = ws_rx.next() => {
                if evicted.is_cancelled() {
                    return CloseReason::Dropped;
                }
                match msg {
                    Some(Ok(Message::Close(_))) | None => return CloseReason::PeerClosed,
                    Some(Ok(Message::Ping(_))) => {
                        // tungstenite queues the pong itself; push it out.
                        if let Err(e) = flush(ws_tx, write_timeout).await {
                            return CloseReason::Failed(e);
                        }
                    }
                    Some(Ok(msg)) => {
                        if let Some(payload) = Payload::from_message(msg) {
                            relay(state, id, &payload);
                        }
                    }
                    Some(Err(e)) => return CloseReason::Failed(RelayError::ReceiveFailed(e)),
                }
            }
            queued = deliver_rx.recv() => {
                let Some(payload) = queued else {
                    return CloseReason::Dropped;
                };
                let bytes = payload.len() as u64;
                if let Err(e) = write(ws_tx, payload.into(), write_timeout).await {
                    return CloseReason::Failed(e);
                }
                counters::payload_bytes_total("out", bytes);
            }
            _ = ping_interval.tick() => {
                if let Err(e) = write(ws_tx, Message::Ping(Vec::new()), write_timeout).await {
                    return CloseReason::Failed(e);
                }
            }
        }
    }
}

fn relay(state: &ServerState, id: ConnId, payload: &Payload) {
    counters::messages_received_total();
    counters::payload_bytes_total("in", payload.len() as u64);

    let fanout = broadcast(&state.registry, id, payload);

    counters::messages_relayed_total(fanout.delivered as u64);
    histograms::fanout_size(fanout.delivered as f64);
    for (_, reason) in &fanout.evicted {
        counters::evictions_total(reason.as_str());
    }
    tracing::trace!(
        conn = %id,
        bytes = payload.len(),
        delivered = fanout.delivered,
        evicted = fanout.evicted.len(),
        "relayed message"
    );
}

async fn write<T>(ws_tx: &mut T, msg: Message, limit: Duration) -> Result<(), RelayError>
where
    T: Sink<Message, Error = tungstenite::Error> + Unpin,
{
    match timeout(limit, ws_tx.send(msg)).await {
        Ok(Ok(())) => Ok(()),
        Ok(Err(e)) => Err(RelayError::SendFailed(e)),
        Err(_) => Err(RelayError::WriteTimeout),
    }
}

async fn flush<T>(ws_tx: &mut T, limit: Duration) -> Result<(), RelayError>
where
    T: Sink<Message, Error = tungstenite::Error> + Unpin,
{
    match timeout(limit, ws_tx.flush()).await {
        Ok(Ok(())) => Ok(()),
        Ok(Err(e)) => Err(RelayError::SendFailed(e)),
        Err(_) => Err(RelayError::WriteTimeout),
    }
}

fn close_frame(code: CloseCode, reason: &'static str) -> CloseFrame<'static> {
    CloseFrame {
        code,
        reason: Cow::Borrowed(reason),
    }
}
