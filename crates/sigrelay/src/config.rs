use clap::Parser;
use std::net::{IpAddr, SocketAddr};
use std::time::Duration;

/// CLI arguments for the relay server.
#[derive(Parser, Debug, Clone)]
#[command(name = "sigrelay")]
#[command(about = "Broadcast relay for WebRTC signaling messages")]
#[command(version)]
pub struct Args {
    /// Port to listen on.
    #[arg(long, short, default_value = "8081", env = "SIGRELAY_PORT")]
    pub port: u16,
    /// Address to bind the listener to.
    #[arg(long, default_value = "0.0.0.0", env = "SIGRELAY_BIND")]
    pub bind: IpAddr,
    /// Socket address for the metrics and health endpoint.
    #[arg(long, default_value = "127.0.0.1:9091", env = "SIGRELAY_METRICS")]
    pub metrics_addr: SocketAddr,
    /// Maximum total concurrent connections.
    #[arg(long, default_value = "1024", env = "SIGRELAY_MAX_CONNS")]
    pub max_conns: usize,
    /// Maximum concurrent connections per IP address.
    #[arg(long, default_value = "64", env = "SIGRELAY_MAX_CONNS_IP")]
    pub max_conns_ip: usize,
    /// Maximum size of a single message in bytes.
    #[arg(long, default_value = "65536", env = "SIGRELAY_MAX_PAYLOAD")]
    pub max_payload: usize,
    /// Messages a peer may have queued before it is dropped as too slow.
    #[arg(long, default_value = "256", env = "SIGRELAY_PEER_QUEUE")]
    pub peer_queue: usize,
    /// WebSocket handshake timeout in seconds.
    #[arg(long, default_value = "5", env = "SIGRELAY_HANDSHAKE_TIMEOUT")]
    pub handshake_timeout: u64,
    /// Timeout for a single socket write in seconds.
    #[arg(long, default_value = "10", env = "SIGRELAY_WRITE_TIMEOUT")]
    pub write_timeout: u64,
    /// Interval between keepalive pings in seconds.
    #[arg(long, default_value = "30", env = "SIGRELAY_PING_INTERVAL")]
    pub ping_interval: u64,
    /// How long shutdown waits for connections to close, in seconds.
    #[arg(long, default_value = "30", env = "SIGRELAY_DRAIN_TIMEOUT")]
    pub drain_timeout: u64,
    /// Increase log verbosity (-v debug, -vv trace). Ignored if RUST_LOG is set.
    #[arg(short, long, action = clap::ArgAction::Count)]
    pub verbose: u8,
}

/// Runtime configuration derived from [`Args`].
#[derive(Debug, Clone)]
pub struct ServerConfig {
    /// Port to listen on.
    pub port: u16,
    /// Address to bind the listener to.
    pub bind: IpAddr,
    /// Socket address for the metrics and health endpoint.
    pub metrics_addr: SocketAddr,
    /// Maximum total concurrent connections.
    pub max_conns: usize,
    /// Maximum concurrent connections per IP address.
    pub max_conns_ip: usize,
    /// Maximum size of a single message in bytes.
    pub max_payload: usize,
    /// Per-peer outbound queue capacity.
    pub peer_queue: usize,
    /// WebSocket handshake timeout in seconds.
    pub handshake_timeout: u64,
    /// Timeout for a single socket write in seconds.
    pub write_timeout: u64,
    /// Interval between keepalive pings in seconds.
    pub ping_interval: u64,
    /// Shutdown drain timeout in seconds.
    pub drain_timeout: u64,
}

impl ServerConfig {
    /// Address the relay listens on.
    #[must_use]
    pub fn listen_addr(&self) -> SocketAddr {
        SocketAddr::new(self.bind, self.port)
    }

    /// Handshake timeout as a [`Duration`].
    #[must_use]
    pub fn handshake_timeout(&self) -> Duration {
        Duration::from_secs(self.handshake_timeout)
    }

    /// Write timeout as a [`Duration`].
    #[must_use]
    pub fn write_timeout(&self) -> Duration {
        Duration::from_secs(self.write_timeout)
    }

    /// Ping interval as a [`Duration`].
    #[must_use]
    pub fn ping_interval(&self) -> Duration {
        Duration::from_secs(self.ping_interval)
    }

    /// Drain timeout as a [`Duration`].
    #[must_use]
    pub fn drain_timeout(&self) -> Duration {
        Duration::from_secs(self.drain_timeout)
    }

    /// Validates the configuration values are within acceptable bounds.
    /// Returns Ok(()) if valid, Err with description otherwise.
    pub fn validate(&self) -> Result<(), String> {
        if self.max_conns == 0 {
            return Err("max_conns must be greater than 0".to_string());
        }
        if self.max_conns > 1_000_000 {
            return Err("max_conns exceeds reasonable limit (1,000,000)".to_string());
        }

        if self.max_conns_ip == 0 {
            return Err("max_conns_ip must be greater than 0".to_string());
        }
        if self.max_conns_ip > self.max_conns {
            return Err("max_conns_ip cannot exceed max_conns".to_string());
        }

        const MAX_ALLOWED_PAYLOAD: usize = 16 * 1024 * 1024;
        if self.max_payload == 0 {
            return Err("max_payload must be greater than 0".to_string());
        }
        if self.max_payload > MAX_ALLOWED_PAYLOAD {
            return Err(format!(
                "max_payload exceeds maximum allowed ({MAX_ALLOWED_PAYLOAD} bytes)"
            ));
        }

        if self.peer_queue == 0 {
            return Err("peer_queue must be greater than 0".to_string());
        }
        if self.peer_queue > 65_536 {
            return Err("peer_queue exceeds reasonable limit (65536)".to_string());
        }

        if self.handshake_timeout == 0 {
            return Err("handshake_timeout must be greater than 0".to_string());
        }
        if self.handshake_timeout > 300 {
            return Err("handshake_timeout exceeds reasonable limit (300 seconds)".to_string());
        }

        if self.write_timeout == 0 {
            return Err("write_timeout must be greater than 0".to_string());
        }
        if self.write_timeout > 300 {
            return Err("write_timeout exceeds reasonable limit (300 seconds)".to_string());
        }

        if self.ping_interval == 0 {
            return Err("ping_interval must be greater than 0".to_string());
        }
        if self.ping_interval > 3600 {
            return Err("ping_interval exceeds reasonable limit (3600 seconds)".to_string());
        }

        if self.drain_timeout == 0 {
            return Err("drain_timeout must be greater than 0".to_string());
        }
        if self.drain_timeout > 600 {
            return Err("drain_timeout exceeds reasonable limit (600 seconds)".to_string());
        }
        Ok(())
    }
}

impl From<Args> for ServerConfig {
    fn from(args: Args) -> Self {
        Self {
            port: args.port,
            bind: args.bind,
            metrics_addr: args.metrics_addr,
            max_conns: args.max_conns,
            max_conns_ip: args.max_conns_ip,
            max_payload: args.max_payload,
            peer_queue: args.peer_queue,
            handshake_timeout: args.handshake_timeout,
            write_timeout: args.write_timeout,
            ping_interval: args.ping_interval,
            drain_timeout: args.drain_timeout,
        }
    }
}
