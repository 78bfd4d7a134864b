use bytes::Bytes;
use std::collections::VecDeque;
use std::net::SocketAddr;
use tracing::{trace, warn};

use crate::errors::TransportError;
use crate::transport::{EndpointId, Transport};

/// Bytes owed to the peer, kept in stream order.
#[derive(Debug, Clone)]
struct Outbound {
    bytes: Bytes,
    /// Echoes go back with `send_to` the address they came from.
    dest: Option<SocketAddr>,
    /// The sentinel is the one message allowed to hit the reserved length.
    sentinel: bool,
}

impl Outbound {
    /// Length to hand the transport now, never more than it has room for.
    ///
    /// A fragment that would land on exactly `reserved` bytes is shortened by
    /// one so the peer cannot mistake it for the sentinel.
    fn offer_len(&self, available: usize, reserved: Option<usize>) -> usize {
        let offer = self.bytes.len().min(available);
        match reserved {
            Some(reserved) if !self.sentinel && offer == reserved && offer > 1 => offer - 1,
            _ => offer,
        }
    }

    fn write(
        &self,
        transport: &mut dyn Transport,
        endpoint: EndpointId,
        len: usize,
    ) -> Result<usize, TransportError> {
        let chunk = &self.bytes[..len];
        match self.dest {
            Some(dest) => transport.send_to(endpoint, chunk, dest),
            None => transport.send(endpoint, chunk),
        }
    }
}

/// Result of one [`OutboundQueue::flush`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub(crate) struct Flushed {
    pub written: usize,
    pub drained: bool,
}

/// Write-behind queue for a single connection.
///
/// Whatever the transport does not accept stays at the front and goes out
/// first on the next flush, so a short write never loses or reorders bytes.
#[derive(Debug, Clone, Default)]
pub(crate) struct OutboundQueue {
    queue: VecDeque<Outbound>,
    reserved_len: Option<usize>,
}

impl OutboundQueue {
    /// Queue whose fragments never come out at `reserved_len` bytes.
    pub fn reserving(reserved_len: usize) -> Self {
        Self {
            queue: VecDeque::new(),
            reserved_len: Some(reserved_len),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.queue.is_empty()
    }

    /// Bytes accepted into the queue but not yet written.
    pub fn pending_bytes(&self) -> usize {
        self.queue.iter().map(|m| m.bytes.len()).sum()
    }

    pub fn push(&mut self, bytes: Bytes) {
        self.push_back(bytes, None, false);
    }

    pub fn push_sentinel(&mut self, bytes: Bytes) {
        self.push_back(bytes, None, true);
    }

    pub fn push_echo(&mut self, bytes: Bytes, dest: SocketAddr) {
        self.push_back(bytes, Some(dest), false);
    }

    fn push_back(&mut self, bytes: Bytes, dest: Option<SocketAddr>, sentinel: bool) {
        if !bytes.is_empty() {
            self.queue.push_back(Outbound {
                bytes,
                dest,
                sentinel,
            });
        }
    }

    pub fn clear(&mut self) {
        self.queue.clear();
    }

    /// Writes queued bytes in order until the queue is empty or the
    /// transport takes less than it was offered.
    pub fn flush(&mut self, transport: &mut dyn Transport, endpoint: EndpointId) -> Flushed {
        let mut flushed = Flushed::default();

        while let Some(mut message) = self.queue.pop_front() {
            let offer = message.offer_len(transport.tx_available(endpoint), self.reserved_len);
            if offer == 0 {
                trace!(endpoint = %endpoint, pending = message.bytes.len(), "no send capacity");
                self.queue.push_front(message);
                return flushed;
            }

            let written = match message.write(transport, endpoint, offer) {
                Ok(written) => written,
                Err(e) => {
                    warn!(endpoint = %endpoint, error = %e, "send failed");
                    self.queue.push_front(message);
                    return flushed;
                }
            };
            flushed.written += written;

            if written < message.bytes.len() {
                message.bytes = message.bytes.slice(written..);
                // A tail left over from the sentinel is just bytes now.
                message.sentinel = false;
                self.queue.push_front(message);
                if written < offer {
                    trace!(endpoint = %endpoint, written, offer, "short write");
                    return flushed;
                }
            }
        }

        flushed.drained = true;
        flushed
    }
}
