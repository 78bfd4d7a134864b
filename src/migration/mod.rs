//! Timed client address migration.
//!
//! A [`MigrationController`] holds one [`MigrationPlan`] per migrating client
//! and is ticked by a repeating [`Timer::MigrationTick`](crate::clock::Timer).
//! Every tick checks each plan against the clock and, when a move is due,
//! closes the client's endpoint, swaps its binding in the
//! [`AddressTable`](crate::address::AddressTable) and reconnects it from the
//! new address.

mod controller;
mod plan;

pub use crate::config::MigrationWindow;
pub use controller::MigrationController;
pub use plan::{MigrationDirection, MigrationPlan, MigrationRecord};
