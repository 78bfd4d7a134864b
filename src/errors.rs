use std::net::{IpAddr, SocketAddr};
use thiserror::Error;

use crate::session::ClientId;
use crate::transport::{EndpointId, SocketKind};

// Transport-level failures reported back to the sessions
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum TransportError {
    #[error("Unknown endpoint: {0}")]
    UnknownEndpoint(EndpointId),

    #[error("Endpoint {0} is not connected")]
    NotConnected(EndpointId),

    #[error("Endpoint {endpoint} cannot {operation} in state {state}")]
    InvalidState {
        endpoint: EndpointId,
        operation: &'static str,
        state: &'static str,
    },

    #[error("Address already in use: {0}")]
    AddrInUse(SocketAddr),
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ConfigError {
    #[error("{field} must be greater than zero")]
    Zero { field: &'static str },

    #[error("send chunk size {chunk} collides with sentinel size")]
    ChunkIsSentinel { chunk: usize },

    #[error("upload of {upload} bytes ends with a {tail}-byte chunk that looks like the sentinel")]
    UploadTailIsSentinel { upload: u64, tail: usize },

    #[error("migration window is empty: start {start:?} >= end {end:?}")]
    EmptyWindow {
        start: std::time::Duration,
        end: std::time::Duration,
    },

    #[error("reversion point {revert_at:?} falls before the window end {end:?}")]
    RevertInsideWindow {
        revert_at: std::time::Duration,
        end: std::time::Duration,
    },
}

#[derive(Debug, Error)]
pub enum SessionError {
    #[error("Stream transport required, got {kind:?}")]
    NotStreamOriented { kind: SocketKind },

    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    #[error("Transport error: {0}")]
    Transport(#[from] TransportError),

    #[error("Unknown client: {0}")]
    UnknownClient(ClientId),

    #[error("Client {client} has no address binding")]
    Unbound { client: ClientId },

    #[error("Client {client} is bound to {actual}, expected {expected}")]
    AddressMismatch {
        client: ClientId,
        expected: IpAddr,
        actual: IpAddr,
    },
}
