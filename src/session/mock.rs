use bytes::Bytes;
use std::collections::{HashMap, VecDeque};
use std::net::SocketAddr;

use crate::errors::TransportError;
use crate::transport::{EndpointId, Recv, SocketKind, Transport};

/// Scripted transport that records every call.
pub(crate) struct MockTransport {
    next_id: u64,
    /// Kind handed out by `open` regardless of what was asked for.
    pub force_kind: Option<SocketKind>,
    pub kinds: HashMap<EndpointId, SocketKind>,
    pub bound: HashMap<EndpointId, SocketAddr>,
    pub connects: Vec<(EndpointId, SocketAddr)>,
    pub listening: Vec<EndpointId>,
    /// (endpoint, requested, accepted) for every write.
    pub writes: Vec<(EndpointId, usize, usize)>,
    /// Send buffer space shared by all endpoints.
    pub tx_space: usize,
    /// Caps every single write below what `tx_available` reports.
    pub write_cap: Option<usize>,
    pub inbox: HashMap<EndpointId, VecDeque<Recv>>,
    pub closed: Vec<EndpointId>,
}

impl MockTransport {
    pub fn new() -> Self {
        Self {
            next_id: 1,
            force_kind: None,
            kinds: HashMap::new(),
            bound: HashMap::new(),
            connects: Vec::new(),
            listening: Vec::new(),
            writes: Vec::new(),
            tx_space: usize::MAX,
            write_cap: None,
            inbox: HashMap::new(),
            closed: Vec::new(),
        }
    }

    pub fn push_data(&mut self, endpoint: EndpointId, len: usize, from: SocketAddr) {
        self.inbox.entry(endpoint).or_default().push_back(Recv::Data {
            bytes: Bytes::from(vec![7u8; len]),
            from,
        });
    }

    pub fn push_eof(&mut self, endpoint: EndpointId) {
        self.inbox.entry(endpoint).or_default().push_back(Recv::Eof);
    }

    pub fn accepted_bytes(&self, endpoint: EndpointId) -> usize {
        self.writes
            .iter()
            .filter(|(ep, _, _)| *ep == endpoint)
            .map(|(_, _, n)| n)
            .sum()
    }

    pub fn last_opened(&self) -> EndpointId {
        EndpointId(self.next_id - 1)
    }
}

impl Transport for MockTransport {
    fn open(&mut self, kind: SocketKind) -> EndpointId {
        let id = EndpointId(self.next_id);
        self.next_id += 1;
        self.kinds.insert(id, self.force_kind.unwrap_or(kind));
        id
    }

    fn socket_kind(&self, endpoint: EndpointId) -> Result<SocketKind, TransportError> {
        self.kinds
            .get(&endpoint)
            .copied()
            .ok_or(TransportError::UnknownEndpoint(endpoint))
    }

    fn bind(&mut self, endpoint: EndpointId, local: SocketAddr) -> Result<(), TransportError> {
        self.bound.insert(endpoint, local);
        Ok(())
    }

    fn listen(&mut self, endpoint: EndpointId) -> Result<(), TransportError> {
        self.listening.push(endpoint);
        Ok(())
    }

    fn connect(&mut self, endpoint: EndpointId, remote: SocketAddr) -> Result<(), TransportError> {
        self.connects.push((endpoint, remote));
        Ok(())
    }

    fn send(&mut self, endpoint: EndpointId, data: &[u8]) -> Result<usize, TransportError> {
        if self.closed.contains(&endpoint) {
            return Err(TransportError::NotConnected(endpoint));
        }
        let accepted = data
            .len()
            .min(self.tx_space)
            .min(self.write_cap.unwrap_or(usize::MAX));
        self.tx_space -= accepted;
        self.writes.push((endpoint, data.len(), accepted));
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

    fn tx_available(&self, _endpoint: EndpointId) -> usize {
        self.tx_space
    }

    fn recv(&mut self, endpoint: EndpointId) -> Result<Recv, TransportError> {
        Ok(self
            .inbox
            .get_mut(&endpoint)
            .and_then(|queue| queue.pop_front())
            .unwrap_or(Recv::WouldBlock))
    }

    fn close(&mut self, endpoint: EndpointId) {
        if !self.closed.contains(&endpoint) {
            self.closed.push(endpoint);
        }
    }

    fn local_addr(&self, endpoint: EndpointId) -> Option<SocketAddr> {
        self.bound.get(&endpoint).copied()
    }
}
