use bytes::Bytes;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, VecDeque};
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::time::Duration;
use tracing::{debug, trace};

use super::scheduler::EventQueue;
use crate::config::NetworkConfig;
use crate::errors::TransportError;
use crate::transport::{EndpointId, Recv, SocketKind, Transport, TransportEvent};

const EPHEMERAL_PORT_START: u16 = 49152;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum EndpointState {
    Open,
    Bound,
    Listening,
    Connecting,
    Connected,
    Closed,
}

impl EndpointState {
    fn name(self) -> &'static str {
        match self {
            EndpointState::Open => "open",
            EndpointState::Bound => "bound",
            EndpointState::Listening => "listening",
            EndpointState::Connecting => "connecting",
            EndpointState::Connected => "connected",
            EndpointState::Closed => "closed",
        }
    }
}

#[derive(Debug)]
struct SimEndpoint {
    kind: SocketKind,
    state: EndpointState,
    local: Option<SocketAddr>,
    peer: Option<EndpointId>,
    peer_addr: Option<SocketAddr>,
    rx: VecDeque<Bytes>,
    fin_received: bool,
    in_flight: usize,
    /// The owner closed its handle; the entry goes once `in_flight` drains.
    released: bool,
}

impl SimEndpoint {
    fn new(kind: SocketKind) -> Self {
        Self {
            kind,
            state: EndpointState::Open,
            local: None,
            peer: None,
            peer_addr: None,
            rx: VecDeque::new(),
            fin_received: false,
            in_flight: 0,
            released: false,
        }
    }

    fn is_closed(&self) -> bool {
        self.state == EndpointState::Closed
    }

    fn accepts(&self, to: SocketAddr) -> bool {
        match (self.state, self.local) {
            (EndpointState::Listening, Some(local)) => {
                local.port() == to.port() && (local.ip() == to.ip() || local.ip().is_unspecified())
            }
            _ => false,
        }
    }
}

/// Something in flight between two endpoints.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Delivery {
    Syn {
        from: EndpointId,
        to: SocketAddr,
    },
    SynAck {
        to: EndpointId,
        accepted: EndpointId,
    },
    Refused {
        to: EndpointId,
    },
    Segment {
        from: EndpointId,
        to: EndpointId,
        data: Bytes,
    },
    Fin {
        to: EndpointId,
    },
    Reset {
        to: EndpointId,
    },
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct NetworkStats {
    pub connections_opened: u64,
    pub connections_refused: u64,
    pub segments_delivered: u64,
    pub bytes_delivered: u64,
    /// Segments that reached an endpoint which was already closed.
    pub segments_dropped: u64,
    pub resets: u64,
}

/// Loss-free in-memory stream network with fixed one-way latency.
///
/// Each endpoint may have `send_buffer` bytes in flight; a segment's bytes
/// are returned to the sender's budget when it is delivered, which raises
/// [`TransportEvent::SendCapacity`]. Closing a connected endpoint sends a FIN
/// behind any data still in flight. Data reaching a closed endpoint resets
/// the sender once.
#[derive(Debug)]
pub struct SimNetwork {
    config: NetworkConfig,
    now: Duration,
    endpoints: BTreeMap<EndpointId, SimEndpoint>,
    next_id: u64,
    next_port: u16,
    queue: EventQueue<Delivery>,
    stats: NetworkStats,
}

impl SimNetwork {
    pub fn new(config: NetworkConfig) -> Self {
        Self {
            config,
            now: Duration::ZERO,
            endpoints: BTreeMap::new(),
            next_id: 1,
            next_port: EPHEMERAL_PORT_START,
            queue: EventQueue::new(),
            stats: NetworkStats::default(),
        }
    }

    pub fn config(&self) -> &NetworkConfig {
        &self.config
    }

    pub fn stats(&self) -> NetworkStats {
        self.stats
    }

    pub fn now(&self) -> Duration {
        self.now
    }

    pub fn advance_to(&mut self, at: Duration) {
        if at > self.now {
            self.now = at;
        }
    }

    pub fn next_time(&self) -> Option<Duration> {
        self.queue.peek_time()
    }

    pub fn in_flight(&self) -> usize {
        self.queue.len()
    }

    /// Endpoints still tracked, including closed ones with data in flight.
    pub fn endpoint_count(&self) -> usize {
        self.endpoints.len()
    }

    /// Address of the remote end of a connected endpoint.
    pub fn peer_addr(&self, endpoint: EndpointId) -> Option<SocketAddr> {
        self.endpoints.get(&endpoint).and_then(|ep| ep.peer_addr)
    }

    /// Takes the next delivery off the wire and applies it.
    ///
    /// Advances the network clock to the delivery time and returns the
    /// readiness events it produced, in the order they happened.
    pub fn process_next(&mut self) -> Option<(Duration, Vec<TransportEvent>)> {
        let (at, delivery) = self.queue.pop()?;
        self.advance_to(at);
        Some((at, self.deliver(delivery)))
    }

    fn deliver(&mut self, delivery: Delivery) -> Vec<TransportEvent> {
        trace!(?delivery, "delivering");
        match delivery {
            Delivery::Syn { from, to } => self.on_syn(from, to),
            Delivery::SynAck { to, accepted } => self.on_syn_ack(to, accepted),
            Delivery::Refused { to } => self.on_refused(to),
            Delivery::Segment { from, to, data } => self.on_segment(from, to, data),
            Delivery::Fin { to } => self.on_fin(to),
            Delivery::Reset { to } => self.on_reset(to),
        }
    }

    fn on_syn(&mut self, from: EndpointId, to: SocketAddr) -> Vec<TransportEvent> {
        let client_addr = match self.endpoints.get(&from) {
            Some(ep) if ep.state == EndpointState::Connecting => ep.local,
            _ => {
                trace!(endpoint = %from, "connect abandoned before it arrived");
                return Vec::new();
            }
        };

        let listener = self
            .endpoints
            .iter()
            .find(|(_, ep)| ep.accepts(to))
            .map(|(id, _)| *id);

        let Some(listener) = listener else {
            debug!(endpoint = %from, %to, "connection refused");
            self.stats.connections_refused += 1;
            self.schedule(Delivery::Refused { to: from });
            return Vec::new();
        };

        let accepted = self.allocate_id();
        let mut endpoint = SimEndpoint::new(SocketKind::Stream);
        endpoint.state = EndpointState::Connected;
        endpoint.local = Some(to);
        endpoint.peer = Some(from);
        endpoint.peer_addr = client_addr;
        self.endpoints.insert(accepted, endpoint);

        if let Some(client) = self.endpoints.get_mut(&from) {
            client.peer = Some(accepted);
            client.peer_addr = Some(to);
        }
        self.stats.connections_opened += 1;
        self.schedule(Delivery::SynAck { to: from, accepted });

        let peer = client_addr.unwrap_or_else(|| SocketAddr::new(IpAddr::V4(Ipv4Addr::UNSPECIFIED), 0));
        vec![TransportEvent::Accepted {
            listener,
            endpoint: accepted,
            peer,
        }]
    }

    fn on_syn_ack(&mut self, to: EndpointId, accepted: EndpointId) -> Vec<TransportEvent> {
        match self.endpoints.get_mut(&to) {
            Some(ep) if ep.state == EndpointState::Connecting => {
                ep.state = EndpointState::Connected;
                vec![TransportEvent::Connected(to)]
            }
            _ => {
                // Initiator went away during the handshake.
                self.schedule(Delivery::Reset { to: accepted });
                Vec::new()
            }
        }
    }

    fn on_refused(&mut self, to: EndpointId) -> Vec<TransportEvent> {
        match self.endpoints.get_mut(&to) {
            Some(ep) if ep.state == EndpointState::Connecting => {
                ep.state = EndpointState::Closed;
                vec![TransportEvent::ConnectFailed(to)]
            }
            _ => Vec::new(),
        }
    }

    fn on_segment(&mut self, from: EndpointId, to: EndpointId, data: Bytes) -> Vec<TransportEvent> {
        let len = data.len();
        let mut events = Vec::new();

        let delivered = match self.endpoints.get_mut(&to) {
            Some(ep) if !ep.is_closed() && !ep.fin_received => {
                ep.rx.push_back(data);
                true
            }
            _ => false,
        };

        if delivered {
            self.stats.segments_delivered += 1;
            self.stats.bytes_delivered += len as u64;
            events.push(TransportEvent::Readable(to));
        } else {
            self.stats.segments_dropped += 1;
        }

        let send_buffer = self.config.send_buffer;
        let mut reset_sender = false;
        let mut reap_sender = false;
        if let Some(sender) = self.endpoints.get_mut(&from) {
            sender.in_flight = sender.in_flight.saturating_sub(len);
            if !delivered && sender.peer == Some(to) {
                sender.peer = None;
                reset_sender = true;
            }
            if delivered && sender.state == EndpointState::Connected {
                events.push(TransportEvent::SendCapacity {
                    endpoint: from,
                    available: send_buffer.saturating_sub(sender.in_flight),
                });
            }
            reap_sender = sender.released;
        }
        if reap_sender {
            self.reap(from);
        }
        if reset_sender {
            debug!(endpoint = %from, peer = %to, "data reached a closed endpoint, resetting sender");
            self.schedule(Delivery::Reset { to: from });
        }
        events
    }

    fn on_fin(&mut self, to: EndpointId) -> Vec<TransportEvent> {
        match self.endpoints.get_mut(&to) {
            Some(ep) if !ep.is_closed() => {
                ep.fin_received = true;
                vec![TransportEvent::Readable(to), TransportEvent::PeerClosed(to)]
            }
            _ => Vec::new(),
        }
    }

    fn on_reset(&mut self, to: EndpointId) -> Vec<TransportEvent> {
        match self.endpoints.get_mut(&to) {
            Some(ep) if !ep.is_closed() => {
                ep.state = EndpointState::Closed;
                ep.peer = None;
                ep.rx.clear();
                self.stats.resets += 1;
                vec![TransportEvent::PeerError(to)]
            }
            _ => Vec::new(),
        }
    }

    fn schedule(&mut self, delivery: Delivery) {
        self.queue.push(self.now + self.config.latency, delivery);
    }

    /// Forgets a released endpoint once nothing it sent is still on the wire.
    fn reap(&mut self, endpoint: EndpointId) {
        if matches!(self.endpoints.get(&endpoint), Some(ep) if ep.released && ep.in_flight == 0) {
            self.endpoints.remove(&endpoint);
            trace!(endpoint = %endpoint, "endpoint reaped");
        }
    }

    fn allocate_id(&mut self) -> EndpointId {
        let id = EndpointId(self.next_id);
        self.next_id += 1;
        id
    }

    fn allocate_port(&mut self) -> u16 {
        let port = self.next_port;
        self.next_port = self.next_port.checked_add(1).unwrap_or(EPHEMERAL_PORT_START);
        port
    }

    fn endpoint(&self, endpoint: EndpointId) -> Result<&SimEndpoint, TransportError> {
        self.endpoints
            .get(&endpoint)
            .ok_or(TransportError::UnknownEndpoint(endpoint))
    }

    fn endpoint_mut(&mut self, endpoint: EndpointId) -> Result<&mut SimEndpoint, TransportError> {
        self.endpoints
            .get_mut(&endpoint)
            .ok_or(TransportError::UnknownEndpoint(endpoint))
    }
}

fn invalid_state(endpoint: EndpointId, operation: &'static str, state: EndpointState) -> TransportError {
    TransportError::InvalidState {
        endpoint,
        operation,
        state: state.name(),
    }
}

impl Transport for SimNetwork {
    fn open(&mut self, kind: SocketKind) -> EndpointId {
        let id = self.allocate_id();
        self.endpoints.insert(id, SimEndpoint::new(kind));
        id
    }

    fn socket_kind(&self, endpoint: EndpointId) -> Result<SocketKind, TransportError> {
        self.endpoint(endpoint).map(|ep| ep.kind)
    }

    fn bind(&mut self, endpoint: EndpointId, local: SocketAddr) -> Result<(), TransportError> {
        let state = self.endpoint(endpoint)?.state;
        if state != EndpointState::Open {
            return Err(invalid_state(endpoint, "bind", state));
        }

        let local = if local.port() == 0 {
            SocketAddr::new(local.ip(), self.allocate_port())
        } else {
            let taken = self.endpoints.values().any(|ep| {
                !ep.is_closed() && ep.state != EndpointState::Connected && ep.local == Some(local)
            });
            if taken {
                return Err(TransportError::AddrInUse(local));
            }
            local
        };

        let ep = self.endpoint_mut(endpoint)?;
        ep.local = Some(local);
        ep.state = EndpointState::Bound;
        Ok(())
    }

    fn listen(&mut self, endpoint: EndpointId) -> Result<(), TransportError> {
        let ep = self.endpoint_mut(endpoint)?;
        if ep.state != EndpointState::Bound {
            return Err(invalid_state(endpoint, "listen", ep.state));
        }
        ep.state = EndpointState::Listening;
        Ok(())
    }

    fn connect(&mut self, endpoint: EndpointId, remote: SocketAddr) -> Result<(), TransportError> {
        let state = self.endpoint(endpoint)?.state;
        match state {
            EndpointState::Open => {
                let any = SocketAddr::new(IpAddr::V4(Ipv4Addr::UNSPECIFIED), 0);
                self.bind(endpoint, any)?;
            }
            EndpointState::Bound => {}
            other => return Err(invalid_state(endpoint, "connect", other)),
        }

        self.endpoint_mut(endpoint)?.state = EndpointState::Connecting;
        self.schedule(Delivery::Syn {
            from: endpoint,
            to: remote,
        });
        Ok(())
    }

    fn send(&mut self, endpoint: EndpointId, data: &[u8]) -> Result<usize, TransportError> {
        let send_buffer = self.config.send_buffer;
        let ep = self.endpoint_mut(endpoint)?;
        let peer = match (ep.state, ep.peer) {
            (EndpointState::Connected, Some(peer)) => peer,
            _ => return Err(TransportError::NotConnected(endpoint)),
        };

        let accepted = data.len().min(send_buffer.saturating_sub(ep.in_flight));
        if accepted == 0 {
            return Ok(0);
        }
        ep.in_flight += accepted;
        self.schedule(Delivery::Segment {
            from: endpoint,
            to: peer,
            data: Bytes::copy_from_slice(&data[..accepted]),
        });
        Ok(accepted)
    }

    fn send_to(
        &mut self,
        endpoint: EndpointId,
        data: &[u8],
        _dest: SocketAddr,
    ) -> Result<usize, TransportError> {
        self.send(endpoint, data)
    }

    fn tx_available(&self, endpoint: EndpointId) -> usize {
        match self.endpoints.get(&endpoint) {
            Some(ep) if ep.state == EndpointState::Connected && ep.peer.is_some() => {
                self.config.send_buffer.saturating_sub(ep.in_flight)
            }
            _ => 0,
        }
    }

    fn recv(&mut self, endpoint: EndpointId) -> Result<Recv, TransportError> {
        let ep = self.endpoint_mut(endpoint)?;
        if let Some(bytes) = ep.rx.pop_front() {
            let from = ep
                .peer_addr
                .unwrap_or_else(|| SocketAddr::new(IpAddr::V4(Ipv4Addr::UNSPECIFIED), 0));
            return Ok(Recv::Data { bytes, from });
        }
        if ep.fin_received || ep.is_closed() {
            return Ok(Recv::Eof);
        }
        Ok(Recv::WouldBlock)
    }

    fn close(&mut self, endpoint: EndpointId) {
        let Some(ep) = self.endpoints.get_mut(&endpoint) else {
            return;
        };
        ep.released = true;

        if !ep.is_closed() {
            let was_connected = ep.state == EndpointState::Connected;
            let peer = ep.peer.take();
            ep.state = EndpointState::Closed;
            ep.rx.clear();

            if let (true, Some(peer)) = (was_connected, peer) {
                self.schedule(Delivery::Fin { to: peer });
            }
            trace!(endpoint = %endpoint, "endpoint closed");
        }
        self.reap(endpoint);
    }

    fn local_addr(&self, endpoint: EndpointId) -> Option<SocketAddr> {
        self.endpoints.get(&endpoint).and_then(|ep| ep.local)
    }
}
