use bytes::Bytes;
use serde::{Deserialize, Serialize};
use std::net::SocketAddr;
use tracing::{debug, info, trace, warn};

use super::outbound::OutboundQueue;
use super::{
    payload, Application, ClientId, SessionContext, SessionState, SessionStateMachine,
    StateTransition,
};
use crate::config::SessionConfig;
use crate::counter::{ByteCounter, ConnectionCounter};
use crate::errors::{SessionError, TransportError};
use crate::events::{SessionEvent, SessionEventBroadcaster};
use crate::transport::{EndpointId, Recv, Transport, TransportEvent};

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ClientStats {
    pub connect_attempts: u64,
    pub connect_failures: u64,
    pub migrations: u64,
    /// Sends requested while no connection was usable.
    pub dropped_sends: u64,
}

/// Messages still owed on the current connection: upload chunks, then the sentinel.
#[derive(Debug, Clone, Copy)]
struct OutboundPlan {
    upload_remaining: u64,
    sentinel_pending: bool,
}

impl OutboundPlan {
    fn new(config: &SessionConfig) -> Self {
        Self {
            upload_remaining: config.upload_bytes(),
            sentinel_pending: true,
        }
    }

    fn next_len(&self, config: &SessionConfig) -> Option<usize> {
        if self.upload_remaining > 0 {
            Some(self.upload_remaining.min(config.send_chunk_size() as u64) as usize)
        } else if self.sentinel_pending {
            Some(config.sentinel_size())
        } else {
            None
        }
    }

    fn sentinel_next(&self) -> bool {
        self.upload_remaining == 0 && self.sentinel_pending
    }

    fn consume(&mut self, len: usize) {
        if self.upload_remaining > 0 {
            self.upload_remaining -= len as u64;
        } else {
            self.sentinel_pending = false;
        }
    }
}

/// Client side of a migrating stream session.
///
/// Cumulative counters live for the whole session. Every connection attempt,
/// including the ones forced by an address change, starts a fresh
/// [`ConnectionCounter`] and outbound plan on a fresh endpoint.
#[derive(Debug)]
pub struct ClientSession {
    id: ClientId,
    config: SessionConfig,
    remote: SocketAddr,
    endpoint: Option<EndpointId>,
    local: Option<SocketAddr>,
    state: SessionStateMachine,
    counters: ByteCounter,
    connection: ConnectionCounter,
    outbound: OutboundPlan,
    /// Plan messages and echoes the transport has not taken yet.
    unsent: OutboundQueue,
    stats: ClientStats,
    events: SessionEventBroadcaster,
}

impl ClientSession {
    pub fn new(id: ClientId, config: SessionConfig, remote: SocketAddr) -> Self {
        let outbound = OutboundPlan::new(&config);
        let unsent = OutboundQueue::reserving(config.sentinel_size());
        Self {
            id,
            config,
            remote,
            endpoint: None,
            local: None,
            state: SessionStateMachine::new(),
            counters: ByteCounter::new(),
            connection: ConnectionCounter::default(),
            outbound,
            unsent,
            stats: ClientStats::default(),
            events: SessionEventBroadcaster::default(),
        }
    }

    pub fn with_events(mut self, events: SessionEventBroadcaster) -> Self {
        self.events = events;
        self
    }

    pub fn id(&self) -> ClientId {
        self.id
    }

    pub fn config(&self) -> &SessionConfig {
        &self.config
    }

    pub fn remote(&self) -> SocketAddr {
        self.remote
    }

    pub fn endpoint(&self) -> Option<EndpointId> {
        self.endpoint
    }

    /// Address the current endpoint is bound to.
    pub fn local_addr(&self) -> Option<SocketAddr> {
        self.local
    }

    pub fn stats(&self) -> ClientStats {
        self.stats
    }

    pub fn connection(&self) -> ConnectionCounter {
        self.connection
    }

    /// Bytes queued on the current connection that the transport has not accepted.
    pub fn unsent_bytes(&self) -> usize {
        self.unsent.pending_bytes()
    }

    pub fn history(&self) -> &[StateTransition] {
        self.state.history()
    }

    /// Points the session at `remote` and issues the first connect.
    pub fn start_to(
        &mut self,
        ctx: &mut SessionContext<'_>,
        remote: SocketAddr,
    ) -> Result<(), SessionError> {
        self.remote = remote;
        self.start_connection(ctx)
    }

    /// Opens a fresh endpoint on the current address binding and connects it.
    ///
    /// A no-op while a connection exists or is being established, and after
    /// the session was stopped. Cumulative counters are left untouched.
    pub fn start_connection(&mut self, ctx: &mut SessionContext<'_>) -> Result<(), SessionError> {
        match self.state.state() {
            SessionState::Connected | SessionState::Connecting => {
                debug!(client = %self.id, state = %self.state.state(), "connection already in place");
                return Ok(());
            }
            SessionState::Disconnected => {
                debug!(client = %self.id, "session stopped, not reconnecting");
                return Ok(());
            }
            SessionState::Idle | SessionState::Closing => {}
        }

        let local_ip = ctx
            .addresses
            .address_of(self.id)
            .ok_or(SessionError::Unbound { client: self.id })?;

        let endpoint = ctx.transport.open(self.config.socket_kind());
        let kind = match ctx.transport.socket_kind(endpoint) {
            Ok(kind) => kind,
            Err(e) => {
                ctx.transport.close(endpoint);
                return Err(e.into());
            }
        };
        if !kind.is_stream_oriented() {
            ctx.transport.close(endpoint);
            return Err(SessionError::NotStreamOriented { kind });
        }

        let local = SocketAddr::new(local_ip, 0);
        if let Err(e) = bind_and_connect(ctx.transport, endpoint, local, self.remote) {
            ctx.transport.close(endpoint);
            return Err(e.into());
        }

        self.endpoint = Some(endpoint);
        self.local = ctx.transport.local_addr(endpoint);
        self.connection.reset();
        self.outbound = OutboundPlan::new(&self.config);
        self.unsent.clear();
        self.stats.connect_attempts += 1;
        self.set_state(SessionState::Connecting, "connect issued");

        info!(
            client = %self.id,
            endpoint = %endpoint,
            local = ?self.local,
            remote = %self.remote,
            attempt = self.stats.connect_attempts,
            "connecting"
        );
        Ok(())
    }

    /// Drops the current endpoint ahead of an address change.
    ///
    /// Returns false if the session was stopped and must not reconnect.
    pub fn detach(&mut self, transport: &mut dyn Transport) -> bool {
        if self.state.is_terminal_state() {
            return false;
        }

        self.stats.migrations += 1;
        if let Some(endpoint) = self.release_endpoint(transport) {
            debug!(
                client = %self.id,
                endpoint = %endpoint,
                received_this_connection = self.connection.received,
                "closing endpoint for migration"
            );
        }
        if matches!(
            self.state.state(),
            SessionState::Connected | SessionState::Connecting
        ) {
            self.set_state(SessionState::Closing, "address migration");
        }
        true
    }

    /// Emits the next outbound message, at most one per call.
    ///
    /// Bytes left over from an earlier short write go first and take the
    /// whole call. Outside of `Connected` the attempt is dropped, never queued.
    pub fn send_data(&mut self, transport: &mut dyn Transport) {
        let endpoint = match self.endpoint {
            Some(endpoint) if self.state.is_connected() => endpoint,
            _ => {
                self.stats.dropped_sends += 1;
                trace!(client = %self.id, state = %self.state.state(), "send dropped, no usable connection");
                return;
            }
        };

        if !self.unsent.is_empty() {
            self.flush_unsent(transport, endpoint);
            return;
        }

        let Some(len) = self.outbound.next_len(&self.config) else {
            return;
        };
        if transport.tx_available(endpoint) < len {
            trace!(client = %self.id, len, "waiting for send capacity");
            return;
        }
        if self.outbound.sentinel_next() {
            self.unsent.push_sentinel(payload(len));
        } else {
            self.unsent.push(payload(len));
        }
        self.outbound.consume(len);
        self.flush_unsent(transport, endpoint);
    }

    fn flush_unsent(&mut self, transport: &mut dyn Transport, endpoint: EndpointId) {
        let flushed = self.unsent.flush(transport, endpoint);
        self.record_sent(flushed.written);
        if !flushed.drained {
            debug!(
                client = %self.id,
                written = flushed.written,
                unsent = self.unsent.pending_bytes(),
                "partial write, holding the rest"
            );
        }
    }

    fn record_sent(&mut self, bytes: usize) {
        self.counters.record_sent(bytes);
        self.connection.record_sent(bytes);
    }

    fn on_connected(&mut self, transport: &mut dyn Transport, endpoint: EndpointId) {
        if self.state.state() != SessionState::Connecting {
            return;
        }
        self.set_state(SessionState::Connected, "handshake complete");
        info!(client = %self.id, endpoint = %endpoint, "connection succeeded");
        self.events.send(SessionEvent::ClientConnected {
            client: self.id,
            endpoint,
        });
        self.send_data(transport);
    }

    fn on_connect_failed(&mut self, transport: &mut dyn Transport) {
        self.stats.connect_failures += 1;
        self.release_endpoint(transport);
        self.set_state(SessionState::Idle, "connect failed");
        warn!(client = %self.id, remote = %self.remote, "connection failed");
        self.events
            .send(SessionEvent::ClientConnectFailed { client: self.id });
    }

    fn on_readable(&mut self, transport: &mut dyn Transport, endpoint: EndpointId) {
        while self.endpoint == Some(endpoint) {
            match transport.recv(endpoint) {
                Ok(Recv::Data { bytes, .. }) if bytes.is_empty() => {
                    self.close_connection(transport, "peer closed", true);
                }
                Ok(Recv::Data { bytes, from }) => {
                    self.on_data_received(transport, endpoint, bytes, from);
                }
                Ok(Recv::Eof) => self.close_connection(transport, "peer closed", true),
                Ok(Recv::WouldBlock) => break,
                Err(e) => {
                    warn!(client = %self.id, endpoint = %endpoint, error = %e, "receive failed");
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
        self.connection.record_received(len);
        debug!(
            client = %self.id,
            bytes = len,
            %from,
            total_rx = self.counters.total_received(),
            "received"
        );

        if self.config.echo() {
            // Behind a short write the echo waits for capacity with the rest.
            let idle = self.unsent.is_empty();
            self.unsent.push_echo(bytes, from);
            if idle {
                self.flush_unsent(transport, endpoint);
            }
        }
    }

    /// Tears the connection down. A graceful close credits the connection's
    /// bytes as a completed transfer once the configured amount arrived.
    fn close_connection(
        &mut self,
        transport: &mut dyn Transport,
        reason: &'static str,
        graceful: bool,
    ) {
        let received = self.connection.received;
        if matches!(
            self.state.state(),
            SessionState::Connected | SessionState::Connecting
        ) {
            self.set_state(SessionState::Closing, reason);
        }
        self.release_endpoint(transport);

        let budget = self.config.max_transfer_bytes();
        if graceful && budget > 0 && received >= budget {
            let credited = self.counters.complete_transfer(received);
            info!(
                client = %self.id,
                bytes = credited,
                completed = self.counters.completed(),
                "transfer complete"
            );
            self.events.send(SessionEvent::TransferCompleted {
                client: self.id,
                bytes: credited,
            });
        }

        if self.state.state() == SessionState::Closing {
            self.set_state(SessionState::Idle, "endpoint closed");
        }
        info!(client = %self.id, reason, received_this_connection = received, "connection closed");
        self.events.send(SessionEvent::ClientClosed {
            client: self.id,
            received_this_connection: received,
        });
    }

    fn release_endpoint(&mut self, transport: &mut dyn Transport) -> Option<EndpointId> {
        let endpoint = self.endpoint.take()?;
        transport.close(endpoint);
        self.local = None;
        self.unsent.clear();
        Some(endpoint)
    }

    fn set_state(&mut self, to: SessionState, reason: &'static str) {
        if let Err(e) = self.state.transition_to(to, reason) {
            warn!(client = %self.id, error = %e, reason, "unexpected state change");
        }
    }
}

fn bind_and_connect(
    transport: &mut dyn Transport,
    endpoint: EndpointId,
    local: SocketAddr,
    remote: SocketAddr,
) -> Result<(), TransportError> {
    transport.bind(endpoint, local)?;
    transport.connect(endpoint, remote)
}

impl Application for ClientSession {
    fn start(&mut self, ctx: &mut SessionContext<'_>) -> Result<(), SessionError> {
        self.start_connection(ctx)
    }

    fn stop(&mut self, ctx: &mut SessionContext<'_>) {
        if self.release_endpoint(ctx.transport).is_none() && self.state.is_terminal_state() {
            return;
        }
        self.set_state(SessionState::Disconnected, "stopped");
        info!(
            client = %self.id,
            total_rx = self.counters.total_received(),
            total_tx = self.counters.total_sent(),
            "client stopped"
        );
    }

    fn handle_event(&mut self, ctx: &mut SessionContext<'_>, event: &TransportEvent) {
        if !self.owns(event.endpoint()) {
            trace!(client = %self.id, ?event, "event for a released endpoint");
            return;
        }

        match *event {
            TransportEvent::Connected(endpoint) => self.on_connected(ctx.transport, endpoint),
            TransportEvent::ConnectFailed(_) => self.on_connect_failed(ctx.transport),
            TransportEvent::Readable(endpoint) => self.on_readable(ctx.transport, endpoint),
            TransportEvent::SendCapacity { .. } => {
                if self.state.is_connected() {
                    self.send_data(ctx.transport);
                }
            }
            TransportEvent::PeerClosed(endpoint) => {
                self.on_readable(ctx.transport, endpoint);
                if self.endpoint == Some(endpoint) {
                    self.close_connection(ctx.transport, "peer closed", true);
                }
            }
            TransportEvent::PeerError(_) => {
                self.close_connection(ctx.transport, "peer error", false);
            }
            TransportEvent::Accepted { .. } => {}
        }
    }

    fn owns(&self, endpoint: EndpointId) -> bool {
        self.endpoint == Some(endpoint)
    }

    fn state(&self) -> SessionState {
        self.state.state()
    }

    fn counters(&self) -> &ByteCounter {
        &self.counters
    }
}
