//! Client and server session state machines.
//!
//! Both variants are driven entirely from outside: the driver calls
//! [`Application::start`] once, then feeds every [`TransportEvent`] for an
//! endpoint the session [`owns`](Application::owns) into
//! [`Application::handle_event`]. Nothing here blocks or spawns.

mod client;
mod outbound;
mod server;
mod state;

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;

use crate::address::AddressTable;
use crate::counter::ByteCounter;
use crate::errors::SessionError;
use crate::transport::{EndpointId, Transport, TransportEvent};

pub use client::{ClientSession, ClientStats};
pub use server::{ConnectionPhase, ServerSession, ServerStats};
pub use state::{InvalidTransition, SessionState, SessionStateMachine, StateTransition};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ClientId(pub usize);

impl fmt::Display for ClientId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Client sessions keyed by identity, iterated in id order.
pub type SessionTable = BTreeMap<ClientId, ClientSession>;

/// What a session may touch while handling one call.
pub struct SessionContext<'a> {
    pub transport: &'a mut dyn Transport,
    pub addresses: &'a AddressTable,
}

impl<'a> SessionContext<'a> {
    pub fn new(transport: &'a mut dyn Transport, addresses: &'a AddressTable) -> Self {
        Self {
            transport,
            addresses,
        }
    }
}

/// Capabilities shared by the two session kinds.
pub trait Application {
    fn start(&mut self, ctx: &mut SessionContext<'_>) -> Result<(), SessionError>;

    fn stop(&mut self, ctx: &mut SessionContext<'_>);

    fn handle_event(&mut self, ctx: &mut SessionContext<'_>, event: &TransportEvent);

    /// Whether events for `endpoint` belong to this session right now.
    fn owns(&self, endpoint: EndpointId) -> bool;

    fn state(&self) -> SessionState;

    fn counters(&self) -> &ByteCounter;

    fn total_bytes_sent(&self) -> u64 {
        self.counters().total_sent()
    }

    fn total_bytes_received(&self) -> u64 {
        self.counters().total_received()
    }

    fn completed_transfer_bytes(&self) -> u64 {
        self.counters().completed()
    }
}

/// Shared zero-filled payload source; message contents carry no meaning.
pub(crate) fn payload(len: usize) -> bytes::Bytes {
    bytes::Bytes::from(vec![0u8; len])
}

#[cfg(test)]
pub(crate) mod mock;
