use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::net::IpAddr;

use crate::errors::SessionError;
use crate::session::ClientId;

/// A client's currently effective local address on one interface.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct AddressBinding {
    pub interface: u32,
    pub address: IpAddr,
    pub prefix_len: u8,
}

impl AddressBinding {
    pub fn new(interface: u32, address: IpAddr) -> Self {
        Self {
            interface,
            address,
            prefix_len: 24,
        }
    }

    pub fn with_prefix_len(mut self, prefix_len: u8) -> Self {
        self.prefix_len = prefix_len;
        self
    }
}

impl fmt::Display for AddressBinding {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{} on if{}", self.address, self.prefix_len, self.interface)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct AddressChange {
    pub client: ClientId,
    pub before: AddressBinding,
    pub after: AddressBinding,
}

/// Bindings of every client, keyed by client identity.
///
/// Only the migration controller replaces entries; sessions read them when
/// they open a new endpoint.
#[derive(Debug, Clone, Default)]
pub struct AddressTable {
    bindings: BTreeMap<ClientId, AddressBinding>,
}

impl AddressTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Creates the binding a session starts with.
    pub fn assign(&mut self, client: ClientId, binding: AddressBinding) {
        self.bindings.insert(client, binding);
    }

    pub fn get(&self, client: ClientId) -> Option<&AddressBinding> {
        self.bindings.get(&client)
    }

    pub fn address_of(&self, client: ClientId) -> Option<IpAddr> {
        self.get(client).map(|b| b.address)
    }

    /// Swaps `expected` for `new` on the same interface in one step.
    ///
    /// Fails without touching the table if the client is unbound or is not
    /// currently on `expected`.
    pub fn replace(
        &mut self,
        client: ClientId,
        expected: IpAddr,
        new: IpAddr,
    ) -> Result<AddressChange, SessionError> {
        let slot = self
            .bindings
            .get_mut(&client)
            .ok_or(SessionError::Unbound { client })?;

        if slot.address != expected {
            return Err(SessionError::AddressMismatch {
                client,
                expected,
                actual: slot.address,
            });
        }

        let before = *slot;
        slot.address = new;
        Ok(AddressChange {
            client,
            before,
            after: *slot,
        })
    }

    pub fn len(&self) -> usize {
        self.bindings.len()
    }

    pub fn is_empty(&self) -> bool {
        self.bindings.is_empty()
    }
}
