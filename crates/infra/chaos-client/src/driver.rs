//! Bounded transaction driver.

use std::{fmt, sync::Arc};

use eyre::WrapErr;
use parking_lot::Mutex;
use tokio::time::sleep;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::{
    AdmissionLimiter, AdmissionPermit, ChaosClientConfig, ConnectionState, ExitStatus,
    HealthMonitor, HealthState, LedgerClient, Metrics, Stats, StatsReporter, TransactionRunner,
    Workload, log_figures,
};

/// Keeps up to the admission ceiling of transactions in flight against a ledger until shut
/// down.
pub struct Driver<L> {
    ledger: Arc<L>,
    runner: TransactionRunner<L>,
    workload: Workload,
    config: ChaosClientConfig,
    monitor: Arc<Mutex<HealthMonitor>>,
    metrics: Metrics,
}

impl<L> fmt::Debug for Driver<L> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Driver")
            .field("runner", &self.runner)
            .field("workload", &self.workload)
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}

impl<L: LedgerClient> Driver<L> {
    /// Creates a driver, validating the configuration and narrowing the workload to the
    /// configured transaction type.
    pub fn new(ledger: Arc<L>, workload: Workload, config: ChaosClientConfig) -> eyre::Result<Self> {
        config.validate().wrap_err("invalid chaos client configuration")?;
        let workload = workload
            .select(config.transaction_type)
            .wrap_err("workload has nothing to run for the configured transaction type")?;

        let metrics = Metrics::default();
        let runner = TransactionRunner::new(
            Arc::clone(&ledger),
            AdmissionLimiter::new(config.max_unfinished_transactions),
            config.runner(),
            metrics.clone(),
        );

        Ok(Self {
            ledger,
            runner,
            workload,
            monitor: Arc::new(Mutex::new(HealthMonitor::new(config.stats_mode))),
            config,
            metrics,
        })
    }

    /// Running outcome counters.
    pub fn stats(&self) -> Arc<Stats> {
        Arc::clone(self.runner.stats())
    }

    /// Runner used for every admitted transaction.
    pub const fn runner(&self) -> &TransactionRunner<L> {
        &self.runner
    }

    /// Most recent health classification.
    pub fn health(&self) -> HealthState {
        self.monitor.lock().state()
    }

    /// Drives transactions until `shutdown` is cancelled, then reports the final statistics.
    ///
    /// Transactions still in flight at shutdown are not awaited.
    pub async fn run(self, shutdown: CancellationToken) -> ExitStatus {
        info!(
            max_unfinished_transactions = self.config.max_unfinished_transactions,
            transaction_type = %self.config.transaction_type,
            transactions = self.workload.descriptors().len(),
            stats_mode = %self.config.stats_mode,
            "starting chaos client"
        );

        let reporter_shutdown = shutdown.child_token();
        let reporter = StatsReporter::new(
            self.stats(),
            Arc::clone(&self.monitor),
            self.config.stats_interval,
            self.metrics.clone(),
        )
        .map(|reporter| reporter.spawn(reporter_shutdown.clone()));

        loop {
            let state = tokio::select! {
                _ = shutdown.cancelled() => break,
                state = self.ledger.wait_for_ready(self.config.connect_timeout) => state,
            };

            let backoff = if state == ConnectionState::Ready {
                match self.runner.limiter().try_acquire() {
                    Some(permit) => {
                        self.admit(permit);
                        continue;
                    }
                    None => {
                        self.metrics.admission_backoffs.increment(1);
                        self.config.admission_backoff.sample()
                    }
                }
            } else {
                warn!(?state, "ledger connection not ready, backing off");
                self.metrics.reconnect_backoffs.increment(1);
                self.config.reconnect_backoff.sample()
            };

            tokio::select! {
                _ = shutdown.cancelled() => break,
                _ = sleep(backoff) => {}
            }
        }

        info!(in_flight = self.runner.limiter().in_flight(), "shutdown signal received");
        reporter_shutdown.cancel();
        if let Some(reporter) = reporter {
            if let Err(e) = reporter.await {
                warn!(error = %e, "stats reporter task failed");
            }
        }

        let stats = self.runner.stats().snapshot();
        log_figures("FINAL-STATS", &stats);
        let exit = ExitStatus::from_final(&stats, self.health());
        info!(exit_code = exit.code(), health = %self.health(), "chaos client stopped");
        exit
    }

    fn admit(&self, permit: AdmissionPermit) {
        let runner = self.runner.clone();
        let descriptor = self.workload.pick().clone();
        debug!(kind = %descriptor.kind, transaction = %descriptor, "admitting transaction");

        tokio::spawn(async move {
            // Outcomes are recorded by the runner.
            let _ = runner.run_admitted(permit, &descriptor).await;
        });
    }
}
