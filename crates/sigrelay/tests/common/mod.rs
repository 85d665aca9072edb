#![allow(dead_code)]

use futures_util::{SinkExt, StreamExt};
use sigrelay::config::ServerConfig;
use sigrelay::metrics::HealthState;
use sigrelay::server::ServerState;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpListener;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio_tungstenite::tungstenite::Message;

type ClientStream =
    tokio_tungstenite::WebSocketStream<tokio_tungstenite::MaybeTlsStream<tokio::net::TcpStream>>;

pub fn test_config(listen: SocketAddr) -> ServerConfig {
    ServerConfig {
        port: listen.port(),
        bind: listen.ip(),
        metrics_addr: "127.0.0.1:0".parse().unwrap(),
        max_conns: 1000,
        max_conns_ip: 100,
        max_payload: 65_536,
        peer_queue: 256,
        handshake_timeout: 5,
        write_timeout: 5,
        ping_interval: 30,
        drain_timeout: 5,
    }
}

pub struct TestServer {
    pub addr: SocketAddr,
    pub state: Arc<ServerState>,
    pub shutdown: watch::Sender<bool>,
    pub task: JoinHandle<()>,
}

impl TestServer {
    pub async fn start() -> Self {
        Self::start_with(|_| {}).await
    }

    pub async fn start_with(tweak: impl FnOnce(&mut ServerConfig)) -> Self {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let mut config = test_config(addr);
        tweak(&mut config);
        let state = Arc::new(ServerState::new(config, HealthState::new()));
        let (shutdown, shutdown_rx) = watch::channel(false);

        let state_clone = state.clone();
        let task = tokio::spawn(async move {
            if let Err(e) = sigrelay::run_with_shutdown(listener, state_clone, shutdown_rx).await {
                eprintln!("server error in test: {e}");
            }
        });

        Self {
            addr,
            state,
            shutdown,
            task,
        }
    }

    /// Wait until exactly `n` peers are registered.
    pub async fn wait_for_peers(&self, n: usize) {
        tokio::time::timeout(Duration::from_secs(5), async {
            while self.state.registry.len() != n {
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
        })
        .await
        .unwrap_or_else(|_| {
            panic!(
                "expected {n} registered peers, have {}",
                self.state.registry.len()
            )
        });
    }

    /// Connect `n` clients one after another, each registered before the next.
    pub async fn connect_many(&self, n: usize) -> Vec<TestClient> {
        let mut clients = Vec::with_capacity(n);
        for _ in 0..n {
            let base = self.state.registry.len();
            clients.push(TestClient::connect(&self.addr).await);
            self.wait_for_peers(base + 1).await;
        }
        clients
    }
}

pub struct TestClient {
    pub ws: ClientStream,
}

impl TestClient {
    pub async fn connect(addr: &SocketAddr) -> Self {
        let url = format!("ws://{addr}");
        let (ws, _) = tokio_tungstenite::connect_async(url).await.unwrap();
        Self { ws }
    }

    pub async fn send_text(&mut self, text: &str) {
        self.ws.send(Message::Text(text.to_string())).await.unwrap();
    }

    pub async fn send_binary(&mut self, data: &[u8]) {
        self.ws.send(Message::Binary(data.to_vec())).await.unwrap();
    }

    /// Next data or close frame, skipping pings and pongs.
    pub async fn recv(&mut self) -> Message {
        loop {
            let msg = tokio::time::timeout(Duration::from_secs(5), self.ws.next())
                .await
                .expect("timeout waiting for message")
                .expect("stream ended")
                .expect("read error");
            match msg {
                Message::Ping(_) | Message::Pong(_) => {}
                other => return other,
            }
        }
    }

    pub async fn recv_text(&mut self) -> String {
        match self.recv().await {
            Message::Text(text) => text,
            other => panic!("expected text frame, got {other:?}"),
        }
    }

    /// Returns the first data frame seen within `wait`, if any.
    pub async fn recv_timeout(&mut self, wait: Duration) -> Option<Message> {
        tokio::time::timeout(wait, async {
            loop {
                match self.ws.next().await {
                    Some(Ok(Message::Text(t))) => return Some(Message::Text(t)),
                    Some(Ok(Message::Binary(b))) => return Some(Message::Binary(b)),
                    Some(Ok(Message::Ping(_) | Message::Pong(_))) => {}
                    Some(Ok(_)) | Some(Err(_)) | None => return None,
                }
            }
        })
        .await
        .ok()
        .flatten()
    }

    /// Assert nothing arrives for a short while.
    pub async fn expect_silence(&mut self) {
        if let Some(msg) = self.recv_timeout(Duration::from_millis(300)).await {
            panic!("expected no message, got {msg:?}");
        }
    }

    /// Wait for the server to close the connection.
    pub async fn expect_closed(&mut self) -> bool {
        tokio::time::timeout(Duration::from_secs(5), async {
            loop {
                match self.ws.next().await {
                    Some(Ok(Message::Close(_))) | Some(Err(_)) | None => return true,
                    Some(Ok(_)) => {}
                }
            }
        })
        .await
        .unwrap_or(false)
    }

    pub async fn close(mut self) {
        let _ = self.ws.close(None).await;
        // Drain until the server acknowledges.
        while let Ok(Some(Ok(_))) =
            tokio::time::timeout(Duration::from_secs(2), self.ws.next()).await
        {}
    }
}
