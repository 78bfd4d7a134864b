use serde::{Deserialize, Serialize};
use std::fmt;
use std::net::IpAddr;
use std::time::Duration;

use crate::address::AddressChange;
use crate::config::{MigrationConfig, MigrationWindow};
use crate::session::ClientId;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum MigrationDirection {
    /// Primary address to alternate.
    Forward,
    /// Alternate address back to primary.
    Reverse,
}

impl fmt::Display for MigrationDirection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            MigrationDirection::Forward => write!(f, "forward"),
            MigrationDirection::Reverse => write!(f, "reverse"),
        }
    }
}

/// When and where one client's address moves.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MigrationPlan {
    pub client: ClientId,
    pub window: MigrationWindow,
    pub revert_at: Option<Duration>,
    pub primary: IpAddr,
    pub alternate: IpAddr,
    has_fired: bool,
}

impl MigrationPlan {
    pub fn new(client: ClientId, primary: IpAddr, alternate: IpAddr, config: &MigrationConfig) -> Self {
        Self {
            client,
            window: config.window(),
            revert_at: config.revert_at(),
            primary,
            alternate,
            has_fired: false,
        }
    }

    /// True while the client sits on the alternate address.
    pub fn has_fired(&self) -> bool {
        self.has_fired
    }

    /// The move this plan wants to make at `now`, if any.
    ///
    /// A forward move happens at most once per window; the reversal only
    /// after a forward move and once `now` reaches the reversion point.
    pub fn due(&self, now: Duration) -> Option<MigrationDirection> {
        if !self.has_fired && self.window.contains(now) {
            return Some(MigrationDirection::Forward);
        }
        match self.revert_at {
            Some(revert_at) if self.has_fired && now >= revert_at => {
                Some(MigrationDirection::Reverse)
            }
            _ => None,
        }
    }

    /// Address pair `(from, to)` for a move in `direction`.
    pub fn endpoints(&self, direction: MigrationDirection) -> (IpAddr, IpAddr) {
        match direction {
            MigrationDirection::Forward => (self.primary, self.alternate),
            MigrationDirection::Reverse => (self.alternate, self.primary),
        }
    }

    pub(crate) fn mark(&mut self, direction: MigrationDirection) {
        self.has_fired = direction == MigrationDirection::Forward;
    }
}

/// One address change that was carried out.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MigrationRecord {
    pub at: Duration,
    pub client: ClientId,
    pub direction: MigrationDirection,
    pub change: AddressChange,
    /// Client totals at the moment the old endpoint was closed.
    pub client_total_rx: u64,
    pub client_total_tx: u64,
    /// Set when the reconnect on the new address could not be issued.
    pub reconnect_error: Option<String>,
}
