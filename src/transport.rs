//! Abstract reliable byte-stream endpoint consumed by the sessions.
//!
//! The sessions never see sockets, packets or routes. They hold an
//! [`EndpointId`] handle and drive it through the [`Transport`] trait, while
//! the transport reports progress back as [`TransportEvent`] values that the
//! driver hands to whichever session currently owns the endpoint.

use bytes::Bytes;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::net::SocketAddr;

use crate::errors::TransportError;

/// Opaque handle to one transport endpoint.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct EndpointId(pub u64);

impl fmt::Display for EndpointId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "ep#{}", self.0)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum SocketKind {
    Stream,
    SeqPacket,
    Datagram,
}

impl SocketKind {
    /// Whether the kind gives ordered, reliable, connection-oriented delivery.
    pub fn is_stream_oriented(self) -> bool {
        matches!(self, SocketKind::Stream | SocketKind::SeqPacket)
    }
}

/// Outcome of a single non-blocking read.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Recv {
    Data { bytes: Bytes, from: SocketAddr },
    /// The peer closed its side and every buffered byte has been read.
    Eof,
    WouldBlock,
}

/// Callbacks raised by the transport, addressed by endpoint.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TransportEvent {
    Connected(EndpointId),
    ConnectFailed(EndpointId),
    Accepted {
        listener: EndpointId,
        endpoint: EndpointId,
        peer: SocketAddr,
    },
    Readable(EndpointId),
    SendCapacity {
        endpoint: EndpointId,
        available: usize,
    },
    PeerClosed(EndpointId),
    PeerError(EndpointId),
}

impl TransportEvent {
    /// The endpoint whose owner should handle this event.
    ///
    /// Accepted connections are routed by their listener: the new endpoint has
    /// no owner until the listening session adopts it.
    pub fn endpoint(&self) -> EndpointId {
        match self {
            TransportEvent::Connected(ep)
            | TransportEvent::ConnectFailed(ep)
            | TransportEvent::Readable(ep)
            | TransportEvent::PeerClosed(ep)
            | TransportEvent::PeerError(ep) => *ep,
            TransportEvent::Accepted { listener, .. } => *listener,
            TransportEvent::SendCapacity { endpoint, .. } => *endpoint,
        }
    }
}

/// Capability set of an ordered, reliable, connection-oriented transport.
///
/// Every call returns immediately. Work that needs the network (handshakes,
/// delivery, buffer draining) completes later and is announced through a
/// [`TransportEvent`].
pub trait Transport {
    fn open(&mut self, kind: SocketKind) -> EndpointId;

    fn socket_kind(&self, endpoint: EndpointId) -> Result<SocketKind, TransportError>;

    /// Binds the endpoint. Port 0 asks for an ephemeral port.
    fn bind(&mut self, endpoint: EndpointId, local: SocketAddr) -> Result<(), TransportError>;

    fn listen(&mut self, endpoint: EndpointId) -> Result<(), TransportError>;

    fn connect(&mut self, endpoint: EndpointId, remote: SocketAddr) -> Result<(), TransportError>;

    /// Queues up to `data.len()` bytes and returns how many were accepted.
    fn send(&mut self, endpoint: EndpointId, data: &[u8]) -> Result<usize, TransportError>;

    /// Stream endpoints ignore `dest` and write to their connected peer.
    fn send_to(
        &mut self,
        endpoint: EndpointId,
        data: &[u8],
        dest: SocketAddr,
    ) -> Result<usize, TransportError>;

    /// Free space in the endpoint's send buffer.
    fn tx_available(&self, endpoint: EndpointId) -> usize;

    fn recv(&mut self, endpoint: EndpointId) -> Result<Recv, TransportError>;

    /// Closes the endpoint. Closing an unknown or already closed endpoint is a no-op.
    fn close(&mut self, endpoint: EndpointId);

    fn local_addr(&self, endpoint: EndpointId) -> Option<SocketAddr>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_stream_kinds() {
        assert!(SocketKind::Stream.is_stream_oriented());
        assert!(SocketKind::SeqPacket.is_stream_oriented());
        assert!(!SocketKind::Datagram.is_stream_oriented());
    }

    #[test]
    fn test_accepted_routes_by_listener() {
        let event = TransportEvent::Accepted {
            listener: EndpointId(1),
            endpoint: EndpointId(9),
            peer: "10.1.1.1:49152".parse().unwrap(),
        };
        assert_eq!(event.endpoint(), EndpointId(1));
    }
}
