//! Deterministic single-threaded driver.
//!
//! [`Simulation`] owns the virtual clock, the in-memory network, every
//! session and the migration controller. It repeatedly takes the earliest
//! pending item (a network delivery or a timer, deliveries first on ties),
//! advances the clock to it and dispatches the resulting events to whichever
//! session owns the endpoint.

mod network;
mod scheduler;

use serde::{Deserialize, Serialize};
use std::net::{IpAddr, SocketAddr};
use std::time::Duration;
use tracing::{debug, debug_span, info, trace, warn};

use crate::address::{AddressBinding, AddressTable};
use crate::clock::{seconds, Clock, Scheduler, StopHandle, Timer, TimerId};
use crate::config::{MigrationConfig, SessionConfig, SimulationConfig};
use crate::errors::SessionError;
use crate::events::{SessionEvent, SessionEventBroadcaster, SessionEventReceiver};
use crate::migration::{MigrationController, MigrationPlan, MigrationRecord};
use crate::session::{
    Application, ClientId, ClientSession, ClientStats, ServerSession, ServerStats,
    SessionContext, SessionState, SessionTable,
};
use crate::transport::TransportEvent;

pub use network::{Delivery, NetworkStats, SimNetwork};
pub use scheduler::{EventQueue, SimScheduler};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClientReport {
    pub id: ClientId,
    pub address: Option<IpAddr>,
    pub state: SessionState,
    pub total_rx: u64,
    pub total_tx: u64,
    pub completed: u64,
    pub stats: ClientStats,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerReport {
    pub total_rx: u64,
    pub total_tx: u64,
    pub stats: ServerStats,
}

/// End-of-run summary.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SimulationReport {
    pub ended_at: Duration,
    pub server: ServerReport,
    pub clients: Vec<ClientReport>,
    pub migrations: Vec<MigrationRecord>,
    pub network: NetworkStats,
}

impl SimulationReport {
    /// Human-readable summary, one line per item.
    pub fn render_text(&self) -> String {
        let mut out = format!("run ended at {:.3}s\n", seconds(self.ended_at));
        out.push_str(&format!(
            "server: rx {} bytes, tx {} bytes, {} connections accepted, {} bulk replies completed\n",
            self.server.total_rx,
            self.server.total_tx,
            self.server.stats.accepted,
            self.server.stats.bulk_replies_completed,
        ));
        for client in &self.clients {
            let address = client
                .address
                .map(|a| a.to_string())
                .unwrap_or_else(|| "-".to_string());
            out.push_str(&format!(
                "client {} ({}): rx {} bytes, tx {} bytes, completed {} bytes, {} migrations\n",
                client.id, address, client.total_rx, client.total_tx, client.completed,
                client.stats.migrations,
            ));
        }
        for record in &self.migrations {
            out.push_str(&format!(
                "migration at {:.3}s: client {} {} -> {} ({})\n",
                seconds(record.at),
                record.client,
                record.change.before.address,
                record.change.after.address,
                record.direction,
            ));
        }
        out
    }
}

pub struct Simulation {
    config: SimulationConfig,
    scheduler: SimScheduler,
    network: SimNetwork,
    addresses: AddressTable,
    clients: SessionTable,
    server: ServerSession,
    migration: MigrationController,
    events: SessionEventBroadcaster,
    stop: StopHandle,
    stop_timer: Option<TimerId>,
    started: bool,
    stopped: bool,
}

impl Simulation {
    pub fn new(config: SimulationConfig) -> Self {
        let events = SessionEventBroadcaster::default();
        let stop = StopHandle::new();
        let listen = SocketAddr::new(config.listen_address, config.port);
        let server = ServerSession::new(config.server.clone(), listen).with_events(events.clone());
        let migration = MigrationController::new(MigrationConfig::default().poll_interval())
            .with_stop_handle(stop.clone());

        Self {
            scheduler: SimScheduler::new(),
            network: SimNetwork::new(config.network.clone()),
            addresses: AddressTable::new(),
            clients: SessionTable::new(),
            server,
            migration,
            events,
            stop,
            stop_timer: None,
            started: false,
            stopped: false,
            config,
        }
    }

    /// Adds a client that talks to the configured server address.
    pub fn add_client(&mut self, config: SessionConfig, binding: AddressBinding) -> ClientId {
        let remote = SocketAddr::new(self.config.server_address, self.config.port);
        self.add_client_to(config, binding, remote)
    }

    pub fn add_client_to(
        &mut self,
        config: SessionConfig,
        binding: AddressBinding,
        remote: SocketAddr,
    ) -> ClientId {
        let id = ClientId(self.clients.len());
        self.addresses.assign(id, binding);
        let client = ClientSession::new(id, config, remote).with_events(self.events.clone());
        self.clients.insert(id, client);
        debug!(client = %id, %binding, %remote, "client added");
        id
    }

    /// Schedules `client` to move to `alternate` and, optionally, back.
    ///
    /// The controller polls at the interval of the first plan registered.
    pub fn add_migration(
        &mut self,
        client: ClientId,
        alternate: IpAddr,
        config: &MigrationConfig,
    ) -> Result<(), SessionError> {
        config.validate()?;
        let primary = self
            .addresses
            .address_of(client)
            .ok_or(SessionError::UnknownClient(client))?;
        if self.migration.plans().is_empty() {
            self.migration.set_poll_interval(config.poll_interval());
        }
        self.migration
            .register(MigrationPlan::new(client, primary, alternate, config));
        Ok(())
    }

    pub fn subscribe(&self) -> SessionEventReceiver {
        self.events.subscribe()
    }

    pub fn stop_handle(&self) -> StopHandle {
        self.stop.clone()
    }

    pub fn now(&self) -> Duration {
        self.scheduler.now()
    }

    pub fn config(&self) -> &SimulationConfig {
        &self.config
    }

    pub fn client(&self, id: ClientId) -> Option<&ClientSession> {
        self.clients.get(&id)
    }

    pub fn clients(&self) -> impl Iterator<Item = &ClientSession> {
        self.clients.values()
    }

    pub fn server(&self) -> &ServerSession {
        &self.server
    }

    pub fn addresses(&self) -> &AddressTable {
        &self.addresses
    }

    pub fn migrations(&self) -> &[MigrationRecord] {
        self.migration.history()
    }

    pub fn network(&self) -> &SimNetwork {
        &self.network
    }

    pub fn is_stopped(&self) -> bool {
        self.stopped
    }

    /// Validates every configuration, starts the server and all clients,
    /// arms the migration ticks and the stop timer.
    pub fn start(&mut self) -> Result<(), SessionError> {
        if self.started {
            return Ok(());
        }
        self.config.server.validate()?;
        for client in self.clients.values() {
            client.config().validate()?;
        }

        {
            let mut ctx = SessionContext::new(&mut self.network, &self.addresses);
            self.server.start(&mut ctx)?;
            for client in self.clients.values_mut() {
                client.start(&mut ctx)?;
            }
        }

        if !self.migration.plans().is_empty() {
            self.migration.start(&mut self.scheduler);
        }
        self.stop_timer = Some(
            self.scheduler
                .schedule_after(self.config.stop_at, Timer::StopApplications),
        );
        self.started = true;

        info!(
            clients = self.clients.len(),
            migrations = self.migration.plans().len(),
            stop_at = seconds(self.config.stop_at),
            "simulation started"
        );
        Ok(())
    }

    /// Processes the earliest pending item. Returns false once nothing is left.
    pub fn step(&mut self) -> bool {
        if self.stop.is_raised() && !self.stopped {
            info!(at = seconds(self.now()), "stop requested");
            self.stop_applications();
        }

        let next_net = self.network.next_time();
        let next_timer = self.scheduler.next_time();
        let network_first = match (next_net, next_timer) {
            (None, None) => return false,
            (Some(_), None) => true,
            (None, Some(_)) => false,
            (Some(net), Some(timer)) => net <= timer,
        };

        if network_first {
            let Some((at, events)) = self.network.process_next() else {
                return false;
            };
            self.scheduler.advance_to(at);
            let _span = debug_span!("event", t = seconds(at)).entered();
            for event in events {
                self.route(event);
            }
        } else {
            let Some((at, id, timer)) = self.scheduler.pop() else {
                // Only cancelled timers were left.
                return self.network.next_time().is_some();
            };
            self.network.advance_to(at);
            let _span = debug_span!("timer", t = seconds(at), timer = %id).entered();
            self.on_timer(timer);
        }
        true
    }

    /// Processes everything due at or before `until`, then sets the clock to it.
    pub fn run_until(&mut self, until: Duration) {
        loop {
            let next = match (self.network.next_time(), self.scheduler.next_time()) {
                (Some(a), Some(b)) => Some(a.min(b)),
                (a, b) => a.or(b),
            };
            match next {
                Some(at) if at <= until => {
                    if !self.step() {
                        break;
                    }
                }
                _ => break,
            }
        }
        self.scheduler.advance_to(until);
        self.network.advance_to(until);
    }

    /// Runs until nothing is pending and returns the report.
    pub fn run(&mut self) -> SimulationReport {
        while self.step() {}
        if !self.stopped {
            self.stop_applications();
        }
        let report = self.report();
        info!(
            at = seconds(report.ended_at),
            server_rx = report.server.total_rx,
            migrations = report.migrations.len(),
            "simulation finished"
        );
        report
    }

    pub fn report(&self) -> SimulationReport {
        SimulationReport {
            ended_at: self.now(),
            server: ServerReport {
                total_rx: self.server.total_bytes_received(),
                total_tx: self.server.total_bytes_sent(),
                stats: self.server.stats(),
            },
            clients: self
                .clients
                .values()
                .map(|client| ClientReport {
                    id: client.id(),
                    address: self.addresses.address_of(client.id()),
                    state: client.state(),
                    total_rx: client.total_bytes_received(),
                    total_tx: client.total_bytes_sent(),
                    completed: client.completed_transfer_bytes(),
                    stats: client.stats(),
                })
                .collect(),
            migrations: self.migration.history().to_vec(),
            network: self.network.stats(),
        }
    }

    fn route(&mut self, event: TransportEvent) {
        let endpoint = event.endpoint();
        let mut ctx = SessionContext::new(&mut self.network, &self.addresses);

        if self.server.owns(endpoint) {
            self.server.handle_event(&mut ctx, &event);
            return;
        }
        if let Some(client) = self.clients.values_mut().find(|c| c.owns(endpoint)) {
            client.handle_event(&mut ctx, &event);
            return;
        }
        trace!(?event, "no session owns the endpoint, dropping event");
    }

    fn on_timer(&mut self, timer: Timer) {
        match timer {
            Timer::MigrationTick => {
                let records = self.migration.tick(
                    &mut self.scheduler,
                    &mut self.clients,
                    &mut self.addresses,
                    &mut self.network,
                );
                for record in records {
                    info!(
                        at = seconds(record.at),
                        client = %record.client,
                        server_total_rx = self.server.total_bytes_received(),
                        "server totals at migration"
                    );
                    self.events.send(SessionEvent::Migrated {
                        client: record.client,
                        at: record.at,
                        from: record.change.before.address,
                        to: record.change.after.address,
                    });
                }
            }
            Timer::StopApplications => self.stop_applications(),
        }
    }

    fn stop_applications(&mut self) {
        if self.stopped {
            return;
        }
        self.stopped = true;
        self.migration.stop(&mut self.scheduler);
        if let Some(id) = self.stop_timer.take() {
            self.scheduler.cancel(id);
        }

        let mut ctx = SessionContext::new(&mut self.network, &self.addresses);
        for client in self.clients.values_mut() {
            client.stop(&mut ctx);
        }
        self.server.stop(&mut ctx);

        let dropped = self.events.total_drops();
        if dropped > 0 {
            warn!(dropped, "session events were dropped");
        }
        info!(at = seconds(self.scheduler.now()), "applications stopped");
    }
}
