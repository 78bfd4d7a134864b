use serde::{Deserialize, Serialize};
use std::net::{IpAddr, Ipv4Addr};
use std::time::Duration;

use crate::errors::ConfigError;
use crate::transport::SocketKind;

pub const DEFAULT_SEND_CHUNK_SIZE: usize = 512;
pub const DEFAULT_MAX_TRANSFER_BYTES: u64 = 15 * 1024;
pub const DEFAULT_SENTINEL_SIZE: usize = 13;
pub const DEFAULT_PORT: u16 = 9;

/// Behaviour shared by client and server sessions.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionConfig {
    send_chunk_size: usize,
    max_transfer_bytes: u64,
    sentinel_size: usize,
    upload_bytes: u64,
    echo: bool,
    socket_kind: SocketKind,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            send_chunk_size: DEFAULT_SEND_CHUNK_SIZE,
            max_transfer_bytes: DEFAULT_MAX_TRANSFER_BYTES,
            sentinel_size: DEFAULT_SENTINEL_SIZE,
            upload_bytes: 0,
            echo: true,
            socket_kind: SocketKind::Stream,
        }
    }
}

impl SessionConfig {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_send_chunk_size(mut self, size: usize) -> Self {
        self.send_chunk_size = size;
        self
    }

    pub fn with_max_transfer_bytes(mut self, bytes: u64) -> Self {
        self.max_transfer_bytes = bytes;
        self
    }

    pub fn with_sentinel_size(mut self, size: usize) -> Self {
        self.sentinel_size = size;
        self
    }

    pub fn with_upload_bytes(mut self, bytes: u64) -> Self {
        self.upload_bytes = bytes;
        self
    }

    pub fn with_echo(mut self, echo: bool) -> Self {
        self.echo = echo;
        self
    }

    pub fn with_socket_kind(mut self, kind: SocketKind) -> Self {
        self.socket_kind = kind;
        self
    }

    pub fn send_chunk_size(&self) -> usize {
        self.send_chunk_size
    }

    /// Client: bytes it expects back per connection. Server: bulk reply budget.
    pub fn max_transfer_bytes(&self) -> u64 {
        self.max_transfer_bytes
    }

    pub fn sentinel_size(&self) -> usize {
        self.sentinel_size
    }

    /// Bytes a client streams on each connection before the sentinel.
    pub fn upload_bytes(&self) -> u64 {
        self.upload_bytes
    }

    pub fn echo(&self) -> bool {
        self.echo
    }

    pub fn socket_kind(&self) -> SocketKind {
        self.socket_kind
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.send_chunk_size == 0 {
            return Err(ConfigError::Zero {
                field: "send_chunk_size",
            });
        }
        if self.sentinel_size == 0 {
            return Err(ConfigError::Zero {
                field: "sentinel_size",
            });
        }
        if self.send_chunk_size == self.sentinel_size {
            return Err(ConfigError::ChunkIsSentinel {
                chunk: self.send_chunk_size,
            });
        }
        let tail = (self.upload_bytes % self.send_chunk_size as u64) as usize;
        if tail == self.sentinel_size {
            return Err(ConfigError::UploadTailIsSentinel {
                upload: self.upload_bytes,
                tail,
            });
        }
        Ok(())
    }
}

/// Half-open interval `[start, end)` during which a forward migration may fire.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct MigrationWindow {
    pub start: Duration,
    pub end: Duration,
}

impl MigrationWindow {
    pub fn new(start: Duration, end: Duration) -> Self {
        Self { start, end }
    }

    pub fn contains(&self, at: Duration) -> bool {
        self.start <= at && at < self.end
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MigrationConfig {
    poll_interval: Duration,
    window: MigrationWindow,
    revert_at: Option<Duration>,
}

impl Default for MigrationConfig {
    fn default() -> Self {
        Self {
            poll_interval: Duration::from_millis(100),
            window: MigrationWindow::new(Duration::from_millis(300), Duration::from_millis(500)),
            revert_at: Some(Duration::from_secs(5)),
        }
    }
}

impl MigrationConfig {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_poll_interval(mut self, interval: Duration) -> Self {
        self.poll_interval = interval;
        self
    }

    pub fn with_window(mut self, start: Duration, end: Duration) -> Self {
        self.window = MigrationWindow::new(start, end);
        self
    }

    /// Moves the window to start at `start`, keeping its length.
    pub fn with_first_change_at(mut self, start: Duration) -> Self {
        let len = self.window.end.saturating_sub(self.window.start);
        self.window = MigrationWindow::new(start, start + len);
        self
    }

    pub fn with_revert_at(mut self, revert_at: Option<Duration>) -> Self {
        self.revert_at = revert_at;
        self
    }

    pub fn poll_interval(&self) -> Duration {
        self.poll_interval
    }

    pub fn window(&self) -> MigrationWindow {
        self.window
    }

    pub fn revert_at(&self) -> Option<Duration> {
        self.revert_at
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.poll_interval.is_zero() {
            return Err(ConfigError::Zero {
                field: "poll_interval",
            });
        }
        if self.window.start >= self.window.end {
            return Err(ConfigError::EmptyWindow {
                start: self.window.start,
                end: self.window.end,
            });
        }
        if let Some(revert_at) = self.revert_at {
            if revert_at < self.window.end {
                return Err(ConfigError::RevertInsideWindow {
                    revert_at,
                    end: self.window.end,
                });
            }
        }
        Ok(())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NetworkConfig {
    pub latency: Duration,
    /// Unacknowledged bytes an endpoint may have in flight.
    pub send_buffer: usize,
}

impl Default for NetworkConfig {
    fn default() -> Self {
        Self {
            latency: Duration::from_millis(5),
            send_buffer: 4096,
        }
    }
}

impl NetworkConfig {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_latency(mut self, latency: Duration) -> Self {
        self.latency = latency;
        self
    }

    pub fn with_send_buffer(mut self, bytes: usize) -> Self {
        self.send_buffer = bytes;
        self
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SimulationConfig {
    pub server: SessionConfig,
    pub network: NetworkConfig,
    pub listen_address: IpAddr,
    pub server_address: IpAddr,
    pub port: u16,
    pub stop_at: Duration,
}

impl Default for SimulationConfig {
    fn default() -> Self {
        Self {
            server: SessionConfig::default(),
            network: NetworkConfig::default(),
            listen_address: IpAddr::V4(Ipv4Addr::UNSPECIFIED),
            server_address: IpAddr::V4(Ipv4Addr::new(10, 1, 3, 1)),
            port: DEFAULT_PORT,
            stop_at: Duration::from_secs(10),
        }
    }
}

impl SimulationConfig {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_server(mut self, server: SessionConfig) -> Self {
        self.server = server;
        self
    }

    pub fn with_network(mut self, network: NetworkConfig) -> Self {
        self.network = network;
        self
    }

    pub fn with_server_address(mut self, address: IpAddr) -> Self {
        self.server_address = address;
        self
    }

    pub fn with_port(mut self, port: u16) -> Self {
        self.port = port;
        self
    }

    pub fn with_stop_at(mut self, stop_at: Duration) -> Self {
        self.stop_at = stop_at;
        self
    }
}

pub mod env {
    //! Environment overrides for the binary.
    use std::env;
    use std::str::FromStr;
    use std::time::Duration;

    pub const MAX_BYTES_ENV: &str = "MIGSIM_MAX_BYTES";
    pub const CHUNK_SIZE_ENV: &str = "MIGSIM_CHUNK_SIZE";
    pub const FIRST_IP_CHANGE_ENV: &str = "MIGSIM_FIRST_IP_CHANGE";
    pub const STOP_AT_ENV: &str = "MIGSIM_STOP_AT";
    pub const REPORT_ENV: &str = "MIGSIM_REPORT";

    /// Reads `key` and parses it, warning about values that do not parse.
    pub fn parsed<T: FromStr>(key: &str) -> Option<T> {
        let raw = env::var(key).ok()?;
        let value = parse_value(&raw);
        if value.is_none() {
            tracing::warn!(key, raw = %raw, "ignoring unparseable environment override");
        }
        value
    }

    /// Reads `key` as a positive number of seconds.
    pub fn seconds(key: &str) -> Option<Duration> {
        let secs: f64 = parsed(key)?;
        parse_seconds(secs)
    }

    fn parse_value<T: FromStr>(raw: &str) -> Option<T> {
        raw.trim().parse::<T>().ok()
    }

    fn parse_seconds(secs: f64) -> Option<Duration> {
        (secs.is_finite() && secs >= 0.0).then(|| Duration::from_secs_f64(secs))
    }

}
