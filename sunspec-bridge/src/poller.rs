//! Poll loop: fetch → derive → encode → publish, once per interval.
//!
//! The loop owns the link state machine. While [`LinkState::Connected`] it
//! tolerates up to `failure_threshold - 1` consecutive failed cycles before
//! falling back to [`LinkState::Connecting`], where retries are spaced with a
//! capped exponential backoff. The published image is never cleared on
//! failure: clients keep reading the last good cycle.

use std::fmt;
use std::time::Duration;

use tokio::sync::watch;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::encoder::{EnergyCounters, RegisterEncoder};
use crate::meter::{FetchError, MeterClient};
use crate::model::{derive, DerivationError, ElectricalModel};
use crate::registers::RegisterTable;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LinkState {
    Disconnected,
    Connecting,
    Connected,
}

impl fmt::Display for LinkState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            LinkState::Disconnected => "disconnected",
            LinkState::Connecting => "connecting",
            LinkState::Connected => "connected",
        };
        f.write_str(name)
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct PollerSettings {
    /// Time between two cycles while connected, and the base retry delay.
    pub interval: Duration,
    /// Upper bound of one fetch. An expired fetch counts as unreachable.
    pub fetch_timeout: Duration,
    /// Consecutive failed cycles that drop a connected link.
    pub failure_threshold: u32,
    /// Retry delay cap while connecting.
    pub max_backoff: Duration,
    /// Allowed difference in W between the aggregate and the phase sum.
    pub power_balance_tolerance: f64,
    /// Allowed energy counter decrease in Wh.
    pub energy_rollover_tolerance: f64,
}

impl Default for PollerSettings {
    fn default() -> Self {
        Self {
            interval: Duration::from_secs(1),
            fetch_timeout: Duration::from_secs(5),
            failure_threshold: 3,
            max_backoff: Duration::from_secs(30),
            power_balance_tolerance: 50.0,
            energy_rollover_tolerance: 0.0,
        }
    }
}

/// Why a cycle produced nothing to publish.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum CycleError {
    #[error(transparent)]
    Fetch(#[from] FetchError),
    #[error("cannot derive electrical model: {0}")]
    Derivation(#[from] DerivationError),
}

pub struct Poller<C> {
    client: C,
    encoder: RegisterEncoder,
    table: RegisterTable,
    settings: PollerSettings,
    counters: EnergyCounters,
    state: watch::Sender<LinkState>,
    consecutive_failures: u32,
    reconnect_attempts: u32,
}

impl<C: MeterClient> Poller<C> {
    pub fn new(
        client: C,
        encoder: RegisterEncoder,
        table: RegisterTable,
        settings: PollerSettings,
    ) -> Self {
        let (state, _) = watch::channel(LinkState::Disconnected);
        Self {
            client,
            encoder,
            table,
            counters: EnergyCounters::new(settings.energy_rollover_tolerance),
            settings,
            state,
            consecutive_failures: 0,
            reconnect_attempts: 0,
        }
    }

    pub fn state(&self) -> LinkState {
        *self.state.borrow()
    }

    /// Follow link state changes.
    pub fn subscribe(&self) -> watch::Receiver<LinkState> {
        self.state.subscribe()
    }

    fn transition(&mut self, next: LinkState) {
        let previous = self.state.send_replace(next);
        if previous != next {
            info!(from = %previous, to = %next, "meter link state changed");
        }
    }

    /// Run one cycle and update the link state from its outcome.
    pub async fn poll_once(&mut self) -> Result<ElectricalModel, CycleError> {
        if self.state() == LinkState::Disconnected {
            self.transition(LinkState::Connecting);
        }

        let result = self.cycle().await;
        match &result {
            Ok(model) => {
                if self.state() != LinkState::Connected {
                    info!(
                        attempts = self.reconnect_attempts + 1,
                        "meter reachable, publishing telemetry"
                    );
                    self.transition(LinkState::Connected);
                }
                self.consecutive_failures = 0;
                self.reconnect_attempts = 0;
                log_cycle(model);
            }
            Err(err) => self.on_failure(err),
        }
        result
    }

    fn on_failure(&mut self, err: &CycleError) {
        match self.state() {
            LinkState::Connected => {
                self.consecutive_failures += 1;
                if self.consecutive_failures >= self.settings.failure_threshold {
                    error!(
                        failures = self.consecutive_failures,
                        %err,
                        "meter lost, reconnecting; clients keep the last published values"
                    );
                    self.consecutive_failures = 0;
                    self.reconnect_attempts = 0;
                    self.transition(LinkState::Connecting);
                } else {
                    warn!(
                        failures = self.consecutive_failures,
                        %err,
                        "poll cycle failed, keeping the last published values"
                    );
                }
            }
            LinkState::Connecting | LinkState::Disconnected => {
                self.reconnect_attempts = self.reconnect_attempts.saturating_add(1);
                warn!(attempt = self.reconnect_attempts, %err, "meter not reachable");
            }
        }
    }

    async fn cycle(&mut self) -> Result<ElectricalModel, CycleError> {
        let timeout = self.settings.fetch_timeout;
        let snapshot = tokio::time::timeout(timeout, self.client.fetch())
            .await
            .map_err(|_| FetchError::Unreachable(format!("no answer within {timeout:?}")))??;

        let imbalance = snapshot.power_imbalance();
        if imbalance > self.settings.power_balance_tolerance {
            warn!(
                total_w = snapshot.total_power,
                phase_sum_w = snapshot.phase_power_sum(),
                imbalance_w = imbalance,
                "aggregate power disagrees with the phase sum"
            );
        }

        let model = derive(&snapshot)?;
        for inconsistency in self.counters.check(&model) {
            warn!(%inconsistency, "publishing the new counter value");
        }
        self.table.publish(self.encoder.encode(&model));
        Ok(model)
    }

    /// Delay before the next cycle for the current state.
    pub fn next_delay(&self) -> Duration {
        match self.state() {
            LinkState::Connected => self.settings.interval,
            LinkState::Connecting | LinkState::Disconnected => {
                let factor = 1u32
                    .checked_shl(self.reconnect_attempts)
                    .unwrap_or(u32::MAX);
                let cap = self.settings.max_backoff.max(self.settings.interval);
                self.settings.interval.saturating_mul(factor).min(cap)
            }
        }
    }

    /// Poll until `shutdown` is cancelled. A cancelled fetch is abandoned.
    pub async fn run(mut self, shutdown: CancellationToken) {
        info!(interval = ?self.settings.interval, "poller started");
        if self.state() == LinkState::Disconnected {
            self.transition(LinkState::Connecting);
        }
        loop {
            tokio::select! {
                _ = shutdown.cancelled() => break,
                _ = self.poll_once() => {}
            }
            let delay = self.next_delay();
            debug!(?delay, state = %self.state(), "next poll");
            tokio::select! {
                _ = shutdown.cancelled() => break,
                _ = tokio::time::sleep(delay) => {}
            }
        }
        self.transition(LinkState::Disconnected);
        info!("poller stopped");
    }
}

fn log_cycle(model: &ElectricalModel) {
    info!(
        direction = %model.direction(),
        power_w = model.total.real,
        apparent_va = model.total.apparent,
        reactive_var = model.total.reactive,
        power_factor = model.total.power_factor,
        imported_wh = model.imported_energy,
        exported_wh = model.exported_energy,
        "published"
    );
}
