//! Connection supervisor: periodic health checks, ordered failover, and
//! rollback of network state on every exit path.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::watch;
use tokio::time::MissedTickBehavior;
use tracing::Instrument;
use uuid::Uuid;

use crate::error::SupervisorError;
use crate::relay::selector::ServerSelector;
use crate::relay::{Selection, SelectionPolicy};
use crate::state::{StateHandle, SupervisorState};
use crate::stats::{StatsSnapshot, SupervisorStats};
use crate::tunnel::driver::TunnelDriver;
use crate::tunnel::network::NetworkState;
use crate::tunnel::status::StatusOracle;

/// Requests supervisor shutdown. Dropping it also counts as a request.
#[derive(Debug)]
pub struct ShutdownTrigger {
    tx: watch::Sender<bool>,
}

impl ShutdownTrigger {
    pub fn trigger(&self) {
        self.tx.send_replace(true);
    }
}

/// Observes a [`ShutdownTrigger`].
#[derive(Debug, Clone)]
pub struct ShutdownSignal {
    rx: watch::Receiver<bool>,
}

impl ShutdownSignal {
    /// Resolves once shutdown has been requested.
    pub async fn cancelled(&mut self) {
        // Err means the trigger is gone, which is treated as shutdown.
        let _ = self.rx.wait_for(|stop| *stop).await;
    }

    pub fn is_cancelled(&self) -> bool {
        *self.rx.borrow()
    }
}

pub fn shutdown_channel() -> (ShutdownTrigger, ShutdownSignal) {
    let (tx, rx) = watch::channel(false);
    (ShutdownTrigger { tx }, ShutdownSignal { rx })
}

/// Why the supervisor loop ended.
#[derive(Debug)]
pub enum Termination {
    /// Shutdown was requested.
    Shutdown,
    /// A failover could not complete; supervision stopped without retrying.
    FailStop(SupervisorError),
}

/// Outcome of [`ConnectionSupervisor::run`].
#[derive(Debug)]
pub struct SupervisorReport {
    pub termination: Termination,
    pub stats: StatsSnapshot,
}

/// Owns the active tunnel and the host network changes for its lifetime.
///
/// Only this type calls [`TunnelDriver`] once a session is established, so at
/// most one tunnel is ever up: the previous relay always goes down before the
/// replacement comes up.
pub struct ConnectionSupervisor {
    selector: ServerSelector,
    policy: SelectionPolicy,
    oracle: Arc<dyn StatusOracle>,
    driver: Arc<dyn TunnelDriver>,
    network: Arc<dyn NetworkState>,
    poll_interval: Duration,
    active: Selection,
    state: StateHandle,
    stats: SupervisorStats,
}

impl ConnectionSupervisor {
    /// Select a relay, bring the tunnel up, and apply network changes.
    ///
    /// A selection failure touches nothing. A failed bring-up is followed by a
    /// defensive `down`. A failed network apply brings the tunnel down and
    /// restores the network before returning. Shutdown is honored at every
    /// step with the same cleanup as a failure at that step.
    pub async fn establish(
        selector: ServerSelector,
        policy: SelectionPolicy,
        oracle: Arc<dyn StatusOracle>,
        driver: Arc<dyn TunnelDriver>,
        network: Arc<dyn NetworkState>,
        poll_interval: Duration,
        shutdown: &mut ShutdownSignal,
    ) -> Result<Self, SupervisorError> {
        let selection = tokio::select! {
            biased;
            _ = shutdown.cancelled() => return Err(SupervisorError::Cancelled),
            selection = selector.select(&policy) => selection?,
        };

        tokio::select! {
            biased;
            _ = shutdown.cancelled() => {
                tracing::info!(relay = %selection.describe(), "Shutdown requested during tunnel bring-up");
                force_down(driver.as_ref()).await;
                return Err(SupervisorError::Cancelled);
            }
            result = driver.up(&selection) => {
                if let Err(e) = result {
                    tracing::error!(relay = %selection.describe(), error = %e, "Tunnel bring-up failed");
                    force_down(driver.as_ref()).await;
                    return Err(e.into());
                }
            }
        }

        let applied = tokio::select! {
            biased;
            _ = shutdown.cancelled() => Err(SupervisorError::Cancelled),
            result = network.apply() => result.map_err(SupervisorError::from),
        };
        if let Err(e) = applied {
            tracing::error!(error = %e, "Network configuration not applied");
            force_down(driver.as_ref()).await;
            if let Err(restore_err) = network.restore().await {
                tracing::error!(error = %restore_err, "Network rollback failed");
            }
            return Err(e);
        }

        tracing::info!(relay = %selection.describe(), "Tunnel established");

        Ok(Self {
            selector,
            policy,
            oracle,
            driver,
            network,
            poll_interval,
            active: selection,
            state: StateHandle::new(SupervisorState::Connected),
            stats: SupervisorStats::new(),
        })
    }

    pub fn state_handle(&self) -> StateHandle {
        self.state.clone()
    }

    pub fn active(&self) -> &Selection {
        &self.active
    }

    /// Run health checks until shutdown or fail-stop, then roll back.
    ///
    /// The first check happens one interval after the call. Shutdown is
    /// honored immediately, including in the middle of a failover.
    pub async fn run(mut self, mut shutdown: ShutdownSignal) -> SupervisorReport {
        let mut ticker = tokio::time::interval(self.poll_interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        ticker.tick().await;

        tracing::info!(
            interval_secs = self.poll_interval.as_secs_f64(),
            relay = %self.active.describe(),
            "Supervisor started"
        );

        let termination = loop {
            tokio::select! {
                biased;
                _ = shutdown.cancelled() => break Termination::Shutdown,
                _ = ticker.tick() => {}
            }

            let outcome = tokio::select! {
                biased;
                _ = shutdown.cancelled() => break Termination::Shutdown,
                outcome = self.check_once() => outcome,
            };

            if let Err(e) = outcome {
                break Termination::FailStop(e);
            }
        };

        self.state.set(SupervisorState::Terminated);
        if let Termination::Shutdown = termination {
            tracing::info!("Shutdown requested, bringing tunnel down");
            force_down(self.driver.as_ref()).await;
        }
        self.roll_back().await;

        let stats = self.stats.snapshot();
        tracing::info!(
            stats = %serde_json::to_string(&stats).unwrap_or_default(),
            fail_stop = matches!(termination, Termination::FailStop(_)),
            "Supervisor terminated"
        );

        SupervisorReport { termination, stats }
    }

    /// One loop body: ask the oracle, fail over unless the path is secure.
    async fn check_once(&mut self) -> Result<(), SupervisorError> {
        self.stats.inc_health_checks();

        match self.oracle.check().await {
            Ok(report) if report.secure => {
                tracing::debug!(exit = ?report.exit_hostname, "Path is secure");
                return Ok(());
            }
            Ok(report) => {
                self.stats.inc_insecure_reports();
                tracing::warn!(ip = ?report.ip, country = ?report.country, "Path is not secure");
            }
            Err(e) => {
                self.stats.inc_oracle_errors();
                tracing::warn!(error = %e, "Status check failed, treating path as insecure");
            }
        }

        self.fail_over().await
    }

    async fn fail_over(&mut self) -> Result<(), SupervisorError> {
        let span = guard_tracing::failover_span!(Uuid::new_v4());
        span.record("previous", self.active.describe().as_str());
        self.state.set(SupervisorState::Switching);

        match self.switch().instrument(span.clone()).await {
            Ok(selection) => {
                span.record("replacement", selection.describe().as_str());
                span.record("outcome", "switched");
                self.active = selection;
                self.stats.inc_failovers();
                self.state.set(SupervisorState::Connected);
                Ok(())
            }
            Err(e) => {
                span.record("outcome", "failed");
                self.stats.inc_failed_failovers();
                tracing::error!(parent: &span, error = %e, "Failover failed, stopping supervision");
                force_down(self.driver.as_ref()).await;
                Err(e)
            }
        }
    }

    /// Select, tear down the previous relay, bring up the replacement.
    async fn switch(&self) -> Result<Selection, SupervisorError> {
        let selection = self.selector.select(&self.policy).await?;
        self.driver.down().await?;
        self.driver.up(&selection).await?;
        tracing::info!(
            from = %self.active.describe(),
            to = %selection.describe(),
            "Failed over to new relay"
        );
        Ok(selection)
    }

    async fn roll_back(&self) {
        match self.network.restore().await {
            Ok(()) => tracing::info!("Network configuration restored"),
            Err(e) => tracing::error!(error = %e, "Network rollback incomplete"),
        }
    }
}

async fn force_down(driver: &dyn TunnelDriver) {
    if let Err(e) = driver.down().await {
        tracing::warn!(error = %e, "Tunnel teardown failed");
    }
}
