//! Stream transfer sessions that survive a client address change.
//!
//! A [`ClientSession`] connects to a [`ServerSession`], optionally uploads a
//! configured amount of data, then sends a short sentinel message that asks
//! the server for a bulk reply. The [`MigrationController`] swaps a client's
//! local address at configured times; the client drops its connection and
//! reconnects from the new address while its cumulative byte counts carry
//! on across connections.
//!
//! Sessions are sans-IO. They talk to an abstract [`Transport`] and are
//! driven by [`TransportEvent`]s and clock ticks. The [`sim`] module
//! provides a deterministic in-memory network and the driver loop that ties
//! everything together.
//!
//! ```no_run
//! use stream_migration::{
//!     AddressBinding, MigrationConfig, SessionConfig, Simulation, SimulationConfig,
//! };
//!
//! let mut sim = Simulation::new(SimulationConfig::default());
//! let client = sim.add_client(
//!     SessionConfig::default(),
//!     AddressBinding::new(1, "10.1.1.1".parse().unwrap()),
//! );
//! sim.add_migration(client, "10.1.1.3".parse().unwrap(), &MigrationConfig::default())
//!     .unwrap();
//! sim.start().unwrap();
//! let report = sim.run();
//! println!("{}", report.render_text());
//! ```

pub mod address;
pub mod clock;
pub mod config;
pub mod counter;
pub mod errors;
pub mod events;
pub mod migration;
pub mod session;
pub mod sim;
pub mod transport;

pub use address::{AddressBinding, AddressChange, AddressTable};
pub use clock::{Clock, Scheduler, StopHandle, Timer, TimerId};
pub use config::{MigrationConfig, NetworkConfig, SessionConfig, SimulationConfig};
pub use counter::{ByteCounter, ConnectionCounter};
pub use errors::{ConfigError, SessionError, TransportError};
pub use events::{SessionEvent, SessionEventBroadcaster, SessionEventReceiver};
pub use migration::{
    MigrationController, MigrationDirection, MigrationPlan, MigrationRecord, MigrationWindow,
};
pub use session::{
    Application, ClientId, ClientSession, ServerSession, SessionContext, SessionState,
};
pub use sim::{Simulation, SimulationReport};
pub use transport::{EndpointId, Recv, SocketKind, Transport, TransportEvent};
