use std::time::Duration;
use tracing::{debug, info, warn};

use super::plan::{MigrationPlan, MigrationRecord};
use crate::address::AddressTable;
use crate::clock::{seconds, Scheduler, StopHandle, Timer, TimerId};
use crate::session::{Application, SessionContext, SessionTable};
use crate::transport::Transport;

/// Polls the clock and moves clients between their address pairs.
///
/// The controller is the only writer of the [`AddressTable`]. Each move runs
/// to completion inside one tick: the old endpoint is closed, the binding is
/// swapped, and the reconnect is issued, so no session ever observes a
/// half-changed address.
#[derive(Debug)]
pub struct MigrationController {
    poll_interval: Duration,
    plans: Vec<MigrationPlan>,
    timer: Option<TimerId>,
    stop: StopHandle,
    history: Vec<MigrationRecord>,
}

impl MigrationController {
    pub fn new(poll_interval: Duration) -> Self {
        Self {
            poll_interval,
            plans: Vec::new(),
            timer: None,
            stop: StopHandle::new(),
            history: Vec::new(),
        }
    }

    pub fn with_stop_handle(mut self, stop: StopHandle) -> Self {
        self.stop = stop;
        self
    }

    pub fn poll_interval(&self) -> Duration {
        self.poll_interval
    }

    /// Takes effect on the next `start`.
    pub fn set_poll_interval(&mut self, interval: Duration) {
        self.poll_interval = interval;
    }

    pub fn register(&mut self, plan: MigrationPlan) {
        debug!(
            client = %plan.client,
            primary = %plan.primary,
            alternate = %plan.alternate,
            "migration plan registered"
        );
        self.plans.push(plan);
    }

    pub fn plans(&self) -> &[MigrationPlan] {
        &self.plans
    }

    pub fn history(&self) -> &[MigrationRecord] {
        &self.history
    }

    pub fn is_running(&self) -> bool {
        self.timer.is_some()
    }

    /// Arms the periodic tick. Calling it again while armed changes nothing.
    pub fn start(&mut self, scheduler: &mut dyn Scheduler) -> TimerId {
        if let Some(id) = self.timer {
            return id;
        }
        let id = scheduler.schedule_repeating(self.poll_interval, Timer::MigrationTick);
        info!(
            poll_interval = ?self.poll_interval,
            plans = self.plans.len(),
            "migration controller started"
        );
        self.timer = Some(id);
        id
    }

    pub fn stop(&mut self, scheduler: &mut dyn Scheduler) {
        if let Some(id) = self.timer.take() {
            scheduler.cancel(id);
            info!(migrations = self.history.len(), "migration controller stopped");
        }
    }

    /// Runs one poll at the scheduler's current time.
    ///
    /// Returns the moves made during this tick. A raised stop handle cancels
    /// the tick timer instead.
    pub fn tick(
        &mut self,
        scheduler: &mut dyn Scheduler,
        clients: &mut SessionTable,
        addresses: &mut AddressTable,
        transport: &mut dyn Transport,
    ) -> Vec<MigrationRecord> {
        if self.stop.is_raised() {
            self.stop(scheduler);
            return Vec::new();
        }

        let now = scheduler.now();
        let mut records = Vec::new();

        for plan in self.plans.iter_mut() {
            let Some(direction) = plan.due(now) else {
                continue;
            };
            let Some(client) = clients.get_mut(&plan.client) else {
                warn!(client = %plan.client, "migration plan names an unknown client");
                continue;
            };

            let (from, to) = plan.endpoints(direction);
            let current = addresses.address_of(plan.client);
            if current != Some(from) {
                warn!(
                    client = %plan.client,
                    expected = %from,
                    current = ?current,
                    "address moved underneath the plan, skipping"
                );
                continue;
            }

            let total_rx = client.total_bytes_received();
            let total_tx = client.total_bytes_sent();
            info!(
                at = seconds(now),
                client = %plan.client,
                total_rx,
                total_tx,
                %direction,
                "changing client address"
            );

            if !client.detach(transport) {
                debug!(client = %plan.client, "session stopped, leaving its address alone");
                continue;
            }

            let change = match addresses.replace(plan.client, from, to) {
                Ok(change) => change,
                Err(e) => {
                    warn!(client = %plan.client, error = %e, "address swap rejected");
                    continue;
                }
            };
            plan.mark(direction);

            let mut ctx = SessionContext::new(transport, addresses);
            let reconnect_error = match client.start_connection(&mut ctx) {
                Ok(()) => None,
                Err(e) => {
                    warn!(client = %plan.client, error = %e, "reconnect after migration failed");
                    Some(e.to_string())
                }
            };

            info!(
                client = %plan.client,
                before = %change.before,
                after = %change.after,
                "client address changed"
            );

            records.push(MigrationRecord {
                at: now,
                client: plan.client,
                direction,
                change,
                client_total_rx: total_rx,
                client_total_tx: total_tx,
                reconnect_error,
            });
        }

        self.history.extend(records.iter().cloned());
        records
    }
}
