use bytes::Bytes;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::net::SocketAddr;
use tracing::{debug, info, trace, warn};

use super::outbound::OutboundQueue;
use super::{payload, Application, SessionContext, SessionState, SessionStateMachine};
use crate::config::SessionConfig;
use crate::counter::{ByteCounter, ConnectionCounter};
use crate::errors::SessionError;
use crate::events::{SessionEvent, SessionEventBroadcaster};
use crate::transport::{EndpointId, Recv, Transport, TransportEvent};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ConnectionPhase {
    Receiving,
    /// Replying with a budgeted stream after the sentinel; `remaining` bytes left.
    Bulk { remaining: u64 },
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ServerStats {
    pub accepted: u64,
    pub bulk_replies_started: u64,
    pub bulk_replies_completed: u64,
    pub bulk_bytes_completed: u64,
    /// Bytes queued for echo, written or still waiting for capacity.
    pub echoed_bytes: u64,
    pub peer_closes: u64,
    pub peer_errors: u64,
}

#[derive(Debug, Clone)]
struct AcceptedConnection {
    peer: SocketAddr,
    phase: ConnectionPhase,
    counter: ConnectionCounter,
    unsent: OutboundQueue,
}

/// Listening side: accepts any number of clients and answers each one.
///
/// Ordinary payloads are echoed. A payload of exactly the sentinel size
/// switches that connection to the bulk phase, which streams
/// `max_transfer_bytes` back and then closes the connection.
#[derive(Debug)]
pub struct ServerSession {
    config: SessionConfig,
    local: SocketAddr,
    listener: Option<EndpointId>,
    state: SessionStateMachine,
    counters: ByteCounter,
    connections: BTreeMap<EndpointId, AcceptedConnection>,
    has_active_client: bool,
    stats: ServerStats,
    events: SessionEventBroadcaster,
}

impl ServerSession {
    pub fn new(config: SessionConfig, local: SocketAddr) -> Self {
        Self {
            config,
            local,
            listener: None,
            state: SessionStateMachine::new(),
            counters: ByteCounter::new(),
            connections: BTreeMap::new(),
            has_active_client: false,
            stats: ServerStats::default(),
            events: SessionEventBroadcaster::default(),
        }
    }

    pub fn with_events(mut self, events: SessionEventBroadcaster) -> Self {
        self.events = events;
        self
    }

    pub fn config(&self) -> &SessionConfig {
        &self.config
    }

    pub fn listener(&self) -> Option<EndpointId> {
        self.listener
    }

    pub fn has_active_client(&self) -> bool {
        self.has_active_client
    }

    pub fn stats(&self) -> ServerStats {
        self.stats
    }

    /// Accepted endpoints that are still open.
    pub fn active_connections(&self) -> Vec<EndpointId> {
        self.connections.keys().copied().collect()
    }

    pub fn phase(&self, endpoint: EndpointId) -> Option<ConnectionPhase> {
        self.connections.get(&endpoint).map(|c| c.phase)
    }

    pub fn bytes_sent_on(&self, endpoint: EndpointId) -> Option<u64> {
        self.connections.get(&endpoint).map(|c| c.counter.sent)
    }

    /// Binds the listening endpoint on `local` and starts accepting.
    pub fn listen(
        &mut self,
        transport: &mut dyn Transport,
        local: SocketAddr,
    ) -> Result<(), SessionError> {
        if self.listener.is_some() {
            return Ok(());
        }

        let endpoint = transport.open(self.config.socket_kind());
        let kind = transport.socket_kind(endpoint)?;
        if !kind.is_stream_oriented() {
            transport.close(endpoint);
            return Err(SessionError::NotStreamOriented { kind });
        }
        if let Err(e) = transport.bind(endpoint, local).and_then(|()| transport.listen(endpoint)) {
            transport.close(endpoint);
            return Err(e.into());
        }

        self.local = local;
        self.listener = Some(endpoint);
        self.set_state(SessionState::Connected, "listening");
        info!(endpoint = %endpoint, %local, "server listening");
        Ok(())
    }

    fn on_accept(&mut self, endpoint: EndpointId, peer: SocketAddr) {
        self.connections.insert(
            endpoint,
            AcceptedConnection {
                peer,
                phase: ConnectionPhase::Receiving,
                counter: ConnectionCounter::default(),
                unsent: OutboundQueue::default(),
            },
        );
        self.has_active_client = true;
        self.stats.accepted += 1;
        info!(endpoint = %endpoint, %peer, active = self.connections.len(), "accepted connection");
        self.events.send(SessionEvent::ServerAccepted { endpoint });
    }

    fn on_readable(&mut self, transport: &mut dyn Transport, endpoint: EndpointId) {
        while self.connections.contains_key(&endpoint) {
            match transport.recv(endpoint) {
                Ok(Recv::Data { bytes, .. }) if bytes.is_empty() => {
                    self.drop_connection(transport, endpoint, "peer closed");
                }
                Ok(Recv::Data { bytes, from }) => {
                    self.on_data_received(transport, endpoint, bytes, from);
                }
                Ok(Recv::Eof) => self.drop_connection(transport, endpoint, "peer closed"),
                Ok(Recv::WouldBlock) => break,
                Err(e) => {
                    warn!(endpoint = %endpoint, error = %e, "receive failed");
                    break;
                }
            }
        }
    }

    fn on_data_received(
        &mut self,
        transport: &mut dyn Transport,
        endpoint: EndpointId,
        bytes: Bytes,
        from: SocketAddr,
    ) {
        let len = bytes.len();
        self.counters.record_received(len);
        let Some(conn) = self.connections.get_mut(&endpoint) else {
            return;
        };
        conn.counter.record_received(len);
        debug!(
            endpoint = %endpoint,
            bytes = len,
            %from,
            total_rx = self.counters.total_received(),
            "server received"
        );

        if conn.phase != ConnectionPhase::Receiving {
            return;
        }

        if len == self.config.sentinel_size() {
            let budget = self.config.max_transfer_bytes();
            let owed = conn.counter.sent + conn.unsent.pending_bytes() as u64;
            let remaining = budget.saturating_sub(owed);
            let idle = conn.unsent.is_empty();
            conn.phase = ConnectionPhase::Bulk { remaining };
            self.stats.bulk_replies_started += 1;
            info!(endpoint = %endpoint, peer = %conn.peer, budget, "sentinel received, starting bulk reply");
            self.events
                .send(SessionEvent::BulkPhaseStarted { endpoint, budget });
            // Held echoes go first; capacity resumes them and then the reply.
            if idle {
                self.send_bulk(transport, endpoint);
            }
        } else if self.config.echo() {
            self.stats.echoed_bytes += len as u64;
            let idle = conn.unsent.is_empty();
            conn.unsent.push_echo(bytes, from);
            if idle {
                self.flush_unsent(transport, endpoint);
            }
        }
    }

    /// Finishes held echoes, then carries on with the bulk reply if one is due.
    fn resume_sending(&mut self, transport: &mut dyn Transport, endpoint: EndpointId) {
        if self.flush_unsent(transport, endpoint) {
            self.send_bulk(transport, endpoint);
        }
    }

    /// Returns true once nothing is left waiting for capacity.
    fn flush_unsent(&mut self, transport: &mut dyn Transport, endpoint: EndpointId) -> bool {
        let Some(conn) = self.connections.get_mut(&endpoint) else {
            return false;
        };
        let flushed = conn.unsent.flush(transport, endpoint);
        self.counters.record_sent(flushed.written);
        conn.counter.record_sent(flushed.written);
        if !flushed.drained {
            trace!(
                endpoint = %endpoint,
                unsent = conn.unsent.pending_bytes(),
                "echo held until capacity"
            );
        }
        flushed.drained
    }

    /// Writes bulk chunks until the budget is met or the transport pushes back.
    fn send_bulk(&mut self, transport: &mut dyn Transport, endpoint: EndpointId) {
        let chunk_size = self.config.send_chunk_size() as u64;
        let Some(conn) = self.connections.get_mut(&endpoint) else {
            return;
        };
        let ConnectionPhase::Bulk { mut remaining } = conn.phase else {
            return;
        };

        while remaining > 0 {
            let to_send = remaining.min(chunk_size) as usize;
            let written = match transport.send(endpoint, &payload(to_send)) {
                Ok(written) => written,
                Err(e) => {
                    warn!(endpoint = %endpoint, error = %e, "bulk send failed");
                    break;
                }
            };
            self.counters.record_sent(written);
            conn.counter.record_sent(written);
            remaining -= written as u64;
            if written < to_send {
                trace!(endpoint = %endpoint, written, remaining, "bulk write short, waiting for capacity");
                break;
            }
        }
        conn.phase = ConnectionPhase::Bulk { remaining };

        if remaining == 0 {
            let sent = conn.counter.sent;
            conn.counter.reset();
            self.stats.bulk_replies_completed += 1;
            self.stats.bulk_bytes_completed += sent;
            info!(endpoint = %endpoint, bytes = sent, "bulk reply complete, closing");
            self.events
                .send(SessionEvent::BulkPhaseFinished { endpoint, bytes: sent });
            self.drop_connection(transport, endpoint, "bulk reply complete");
        }
    }

    fn drop_connection(
        &mut self,
        transport: &mut dyn Transport,
        endpoint: EndpointId,
        reason: &'static str,
    ) {
        if let Some(conn) = self.connections.remove(&endpoint) {
            transport.close(endpoint);
            debug!(
                endpoint = %endpoint,
                peer = %conn.peer,
                reason,
                received = conn.counter.received,
                "connection removed"
            );
        }
        if self.connections.is_empty() {
            self.has_active_client = false;
        }
    }

    fn set_state(&mut self, to: SessionState, reason: &'static str) {
        if let Err(e) = self.state.transition_to(to, reason) {
            warn!(error = %e, reason, "unexpected server state change");
        }
    }
}

impl Application for ServerSession {
    fn start(&mut self, ctx: &mut SessionContext<'_>) -> Result<(), SessionError> {
        let local = self.local;
        self.listen(ctx.transport, local)
    }

    fn stop(&mut self, ctx: &mut SessionContext<'_>) {
        let accepted: Vec<EndpointId> = self.connections.keys().copied().collect();
        for endpoint in accepted {
            self.drop_connection(ctx.transport, endpoint, "server stopped");
        }
        if let Some(listener) = self.listener.take() {
            ctx.transport.close(listener);
        }
        if !self.state.is_terminal_state() {
            self.set_state(SessionState::Disconnected, "stopped");
        }
        info!(total_rx = self.counters.total_received(), "server stopped");
    }

    fn handle_event(&mut self, ctx: &mut SessionContext<'_>, event: &TransportEvent) {
        match *event {
            TransportEvent::Accepted {
                listener,
                endpoint,
                peer,
            } if Some(listener) == self.listener => self.on_accept(endpoint, peer),
            TransportEvent::Readable(endpoint) => self.on_readable(ctx.transport, endpoint),
            TransportEvent::SendCapacity { endpoint, .. } => {
                self.resume_sending(ctx.transport, endpoint)
            }
            TransportEvent::PeerClosed(endpoint) => {
                if self.connections.contains_key(&endpoint) {
                    self.stats.peer_closes += 1;
                }
                self.on_readable(ctx.transport, endpoint);
                self.drop_connection(ctx.transport, endpoint, "peer closed");
            }
            TransportEvent::PeerError(endpoint) => {
                if self.connections.contains_key(&endpoint) {
                    self.stats.peer_errors += 1;
                }
                self.drop_connection(ctx.transport, endpoint, "peer error");
            }
            _ => trace!(?event, "server ignoring event"),
        }
    }

    fn owns(&self, endpoint: EndpointId) -> bool {
        self.listener == Some(endpoint) || self.connections.contains_key(&endpoint)
    }

    fn state(&self) -> SessionState {
        self.state.state()
    }

    fn counters(&self) -> &ByteCounter {
        &self.counters
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::address::AddressTable;
    use crate::session::mock::MockTransport;
    use crate::transport::SocketKind;

    fn any() -> SocketAddr {
        "0.0.0.0:9".parse().unwrap()
    }

    fn peer() -> SocketAddr {
        "10.1.1.1:49152".parse().unwrap()
    }

    fn listening(config: SessionConfig, transport: &mut MockTransport) -> (ServerSession, EndpointId) {
        let addresses = AddressTable::new();
        let mut server = ServerSession::new(config, any());
        server
            .start(&mut SessionContext::new(transport, &addresses))
            .unwrap();
        let listener = server.listener().unwrap();
        (server, listener)
    }

    fn accept(
        server: &mut ServerSession,
        transport: &mut MockTransport,
        listener: EndpointId,
        endpoint: EndpointId,
    ) {
        let addresses = AddressTable::new();
        server.handle_event(
            &mut SessionContext::new(transport, &addresses),
            &TransportEvent::Accepted {
                listener,
                endpoint,
                peer: peer(),
            },
        );
    }

    fn deliver(server: &mut ServerSession, transport: &mut MockTransport, event: TransportEvent) {
        let addresses = AddressTable::new();
        server.handle_event(&mut SessionContext::new(transport, &addresses), &event);
    }

    #[test]
    fn test_listen_binds_and_accepts() {
        let mut transport = MockTransport::new();
        let (mut server, listener) = listening(SessionConfig::default(), &mut transport);

        assert_eq!(server.state(), SessionState::Connected);
        assert_eq!(transport.bound[&listener], any());
        assert_eq!(transport.listening, vec![listener]);
        assert!(!server.has_active_client());

        accept(&mut server, &mut transport, listener, EndpointId(50));
        accept(&mut server, &mut transport, listener, EndpointId(51));

        assert!(server.has_active_client());
        assert_eq!(server.active_connections(), vec![EndpointId(50), EndpointId(51)]);
        assert!(server.owns(EndpointId(51)));
    }

    #[test]
    fn test_listen_requires_stream_transport() {
        let mut transport = MockTransport::new();
        transport.force_kind = Some(SocketKind::Datagram);
        let mut server = ServerSession::new(SessionConfig::default(), any());

        let err = server.listen(&mut transport, any()).unwrap_err();
        assert!(matches!(err, SessionError::NotStreamOriented { .. }));
        assert_eq!(server.listener(), None);
    }

    #[test]
    fn test_sentinel_starts_bulk_reply_to_budget() {
        let mut transport = MockTransport::new();
        let (mut server, listener) = listening(SessionConfig::default(), &mut transport);
        let conn = EndpointId(50);
        accept(&mut server, &mut transport, listener, conn);

        transport.push_data(conn, 13, peer());
        deliver(&mut server, &mut transport, TransportEvent::Readable(conn));

        assert_eq!(server.total_bytes_received(), 13);
        assert_eq!(transport.accepted_bytes(conn), 15360);
        assert!(transport.writes.iter().all(|(_, requested, _)| *requested == 512));
        assert_eq!(server.total_bytes_sent(), 15360);
        assert_eq!(server.stats().bulk_replies_completed, 1);
        assert!(transport.closed.contains(&conn));
        assert!(!server.has_active_client());
        assert_eq!(server.stats().accepted, 1);
    }

    #[test]
    fn test_bulk_short_write_resumes_on_capacity() {
        let mut transport = MockTransport::new();
        let config = SessionConfig::new().with_max_transfer_bytes(2048);
        let (mut server, listener) = listening(config, &mut transport);
        let conn = EndpointId(50);
        accept(&mut server, &mut transport, listener, conn);

        transport.tx_space = 700;
        transport.push_data(conn, 13, peer());
        deliver(&mut server, &mut transport, TransportEvent::Readable(conn));

        assert_eq!(transport.accepted_bytes(conn), 700);
        assert_eq!(server.phase(conn), Some(ConnectionPhase::Bulk { remaining: 1348 }));
        assert_eq!(server.bytes_sent_on(conn), Some(700));
        assert!(!transport.closed.contains(&conn));

        transport.tx_space = usize::MAX;
        deliver(
            &mut server,
            &mut transport,
            TransportEvent::SendCapacity {
                endpoint: conn,
                available: 4096,
            },
        );

        assert_eq!(transport.accepted_bytes(conn), 2048);
        assert_eq!(server.phase(conn), None);
        assert!(transport.closed.contains(&conn));
        assert_eq!(server.stats().bulk_bytes_completed, 2048);
    }

    #[test]
    fn test_ordinary_payload_is_echoed() {
        let mut transport = MockTransport::new();
        let (mut server, listener) = listening(SessionConfig::default(), &mut transport);
        let conn = EndpointId(50);
        accept(&mut server, &mut transport, listener, conn);

        transport.push_data(conn, 512, peer());
        deliver(&mut server, &mut transport, TransportEvent::Readable(conn));

        assert_eq!(server.phase(conn), Some(ConnectionPhase::Receiving));
        assert_eq!(transport.writes, vec![(conn, 512, 512)]);
        assert_eq!(server.total_bytes_received(), 512);
    }

    #[test]
    fn test_short_echo_is_finished_before_bulk() {
        let mut transport = MockTransport::new();
        let (mut server, listener) = listening(SessionConfig::default(), &mut transport);
        let conn = EndpointId(50);
        accept(&mut server, &mut transport, listener, conn);

        transport.write_cap = Some(200);
        transport.push_data(conn, 512, peer());
        deliver(&mut server, &mut transport, TransportEvent::Readable(conn));
        assert_eq!(transport.writes, vec![(conn, 512, 200)]);

        transport.push_data(conn, 13, peer());
        deliver(&mut server, &mut transport, TransportEvent::Readable(conn));
        assert_eq!(
            server.phase(conn),
            Some(ConnectionPhase::Bulk {
                remaining: 15360 - 512
            })
        );
        assert_eq!(transport.writes.len(), 1);

        transport.write_cap = None;
        deliver(
            &mut server,
            &mut transport,
            TransportEvent::SendCapacity {
                endpoint: conn,
                available: 4096,
            },
        );

        assert_eq!(transport.writes[1], (conn, 312, 312));
        assert!(transport.writes[2..].iter().all(|(_, requested, _)| *requested == 512));
        assert_eq!(transport.accepted_bytes(conn), 15360);
        assert_eq!(server.stats().echoed_bytes, 512);
        assert_eq!(server.stats().bulk_bytes_completed, 15360);
        assert!(transport.closed.contains(&conn));
    }

    #[test]
    fn test_peer_close_and_error_only_remove() {
        let mut transport = MockTransport::new();
        let (mut server, listener) = listening(SessionConfig::default(), &mut transport);
        accept(&mut server, &mut transport, listener, EndpointId(50));
        accept(&mut server, &mut transport, listener, EndpointId(51));

        transport.push_eof(EndpointId(50));
        deliver(&mut server, &mut transport, TransportEvent::PeerClosed(EndpointId(50)));
        deliver(&mut server, &mut transport, TransportEvent::PeerError(EndpointId(51)));

        assert!(server.active_connections().is_empty());
        assert_eq!(server.stats().peer_closes, 1);
        assert_eq!(server.stats().peer_errors, 1);
        assert!(transport.connects.is_empty());
        assert_eq!(server.state(), SessionState::Connected);
    }

    #[test]
    fn test_aggregate_totals_span_connections() {
        let mut transport = MockTransport::new();
        let config = SessionConfig::new().with_echo(false);
        let (mut server, listener) = listening(config, &mut transport);
        accept(&mut server, &mut transport, listener, EndpointId(50));
        accept(&mut server, &mut transport, listener, EndpointId(51));

        transport.push_data(EndpointId(50), 300, peer());
        transport.push_data(EndpointId(51), 200, peer());
        deliver(&mut server, &mut transport, TransportEvent::Readable(EndpointId(50)));
        deliver(&mut server, &mut transport, TransportEvent::Readable(EndpointId(51)));

        assert_eq!(server.total_bytes_received(), 500);
        assert!(transport.writes.is_empty());
    }

    #[test]
    fn test_stop_closes_everything() {
        let mut transport = MockTransport::new();
        let (mut server, listener) = listening(SessionConfig::default(), &mut transport);
        accept(&mut server, &mut transport, listener, EndpointId(50));

        let addresses = AddressTable::new();
        server.stop(&mut SessionContext::new(&mut transport, &addresses));

        assert_eq!(server.state(), SessionState::Disconnected);
        assert!(transport.closed.contains(&EndpointId(50)));
        assert!(transport.closed.contains(&listener));
        assert!(!server.owns(listener));
    }
}
