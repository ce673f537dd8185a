//! Runs a single transaction through its submit or evaluate lifecycle.

use std::{fmt, future::Future, sync::Arc, time::Duration};

use thiserror::Error;
use tokio::time::{Instant, timeout};
use tracing::{debug, warn};

use crate::{
    AdmissionLimiter, AdmissionPermit, CommitStatus, CorrelatorError, EndorsedTransaction,
    EventCorrelator, LedgerClient, LedgerError, Metrics, Proposal, RunnerConfig, Stage, Stats,
    SubmittedTransaction, TransactionDescriptor, TransactionKind, TxnLog,
};

/// Ledger call a deadline applies to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LedgerCall {
    /// Endorsement.
    Endorse,
    /// Handing to ordering.
    Submit,
    /// Commit status wait.
    CommitStatus,
    /// Evaluation.
    Evaluate,
}

impl fmt::Display for LedgerCall {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Endorse => f.write_str("endorse"),
            Self::Submit => f.write_str("submit"),
            Self::CommitStatus => f.write_str("commit status"),
            Self::Evaluate => f.write_str("evaluate"),
        }
    }
}

/// Why a transaction failed.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum TransactionError {
    /// A ledger call returned an error.
    #[error(transparent)]
    Ledger(#[from] LedgerError),
    /// The completion event waiter could not be registered.
    #[error(transparent)]
    Correlator(#[from] CorrelatorError),
    /// A ledger call did not finish before its deadline.
    #[error("{call} timed out after {timeout:?}")]
    CallTimeout {
        /// The call that timed out.
        call: LedgerCall,
        /// The deadline that was exceeded.
        timeout: Duration,
    },
    /// The transaction committed with a non-zero validation code.
    #[error("unexpected validation code {0}")]
    Validation(CommitStatus),
    /// The completion event did not arrive in time.
    #[error("timed out waiting for chaincode event after {0:?}")]
    EventTimeout(Duration),
    /// The waiter was dropped without an event.
    #[error("event listener closed before the chaincode event arrived")]
    ListenerClosed,
}

/// Records the outcome of one transaction when dropped.
///
/// Every exit path, including cancellation, counts exactly once, removes any waiter and
/// releases the in-flight slot.
struct OutcomeGuard<'a> {
    correlator: &'a EventCorrelator,
    stats: &'a Stats,
    metrics: &'a Metrics,
    kind: TransactionKind,
    txn_id: Option<String>,
    succeeded: bool,
    started: Instant,
    _permit: AdmissionPermit,
}

impl<'a> OutcomeGuard<'a> {
    fn new<L: LedgerClient>(
        runner: &'a TransactionRunner<L>,
        kind: TransactionKind,
        permit: AdmissionPermit,
    ) -> Self {
        runner.metrics.in_flight.increment(1.0);
        Self {
            correlator: &runner.correlator,
            stats: &runner.stats,
            metrics: &runner.metrics,
            kind,
            txn_id: None,
            succeeded: false,
            started: Instant::now(),
            _permit: permit,
        }
    }

    fn track(&mut self, txn_id: &str) {
        self.txn_id = Some(txn_id.to_owned());
    }
}

impl Drop for OutcomeGuard<'_> {
    fn drop(&mut self) {
        if let Some(txn_id) = self.txn_id.take() {
            self.correlator.unregister(&txn_id);
        }

        self.stats.record(self.kind, self.succeeded);
        let counter = match (self.kind, self.succeeded) {
            (TransactionKind::Submit, true) => &self.metrics.successful_submits,
            (TransactionKind::Submit, false) => &self.metrics.unsuccessful_submits,
            (TransactionKind::Evaluate, true) => &self.metrics.successful_evaluates,
            (TransactionKind::Evaluate, false) => &self.metrics.unsuccessful_evaluates,
        };
        counter.increment(1);
        self.metrics.transaction_duration.record(self.started.elapsed().as_secs_f64());
        self.metrics.in_flight.decrement(1.0);
    }
}

/// Runs transactions against a ledger, correlating submits with their completion events.
pub struct TransactionRunner<L> {
    ledger: Arc<L>,
    correlator: Arc<EventCorrelator>,
    stats: Arc<Stats>,
    limiter: AdmissionLimiter,
    config: RunnerConfig,
    metrics: Metrics,
}

impl<L> Clone for TransactionRunner<L> {
    fn clone(&self) -> Self {
        Self {
            ledger: Arc::clone(&self.ledger),
            correlator: Arc::clone(&self.correlator),
            stats: Arc::clone(&self.stats),
            limiter: self.limiter.clone(),
            config: self.config,
            metrics: self.metrics.clone(),
        }
    }
}

impl<L> fmt::Debug for TransactionRunner<L> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TransactionRunner")
            .field("correlator", &self.correlator)
            .field("stats", &self.stats)
            .field("limiter", &self.limiter)
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}

impl<L: LedgerClient> TransactionRunner<L> {
    /// Creates a runner with a fresh correlator and zeroed statistics.
    pub fn new(
        ledger: Arc<L>,
        limiter: AdmissionLimiter,
        config: RunnerConfig,
        metrics: Metrics,
    ) -> Self {
        Self {
            ledger,
            correlator: Arc::new(EventCorrelator::new(metrics.clone())),
            stats: Arc::new(Stats::new()),
            limiter,
            config,
            metrics,
        }
    }

    /// Runs `descriptor` outside the driver's admission control. The transaction still
    /// counts towards the in-flight total while it runs.
    pub async fn run_transaction(
        &self,
        descriptor: &TransactionDescriptor,
    ) -> Result<(), TransactionError> {
        self.run_admitted(self.limiter.acquire(), descriptor).await
    }

    /// Runs `descriptor` holding an already acquired in-flight slot.
    pub async fn run_admitted(
        &self,
        permit: AdmissionPermit,
        descriptor: &TransactionDescriptor,
    ) -> Result<(), TransactionError> {
        let mut guard = OutcomeGuard::new(self, descriptor.kind, permit);
        let mut log = TxnLog::new(self.config.txn_log_level);

        let result = match descriptor.kind {
            TransactionKind::Submit => self.submit(descriptor, &mut log, &mut guard).await,
            TransactionKind::Evaluate => self.evaluate(descriptor, &mut log).await,
        };

        match &result {
            Ok(()) => guard.succeeded = true,
            Err(e) => {
                debug!(txn_id = log.txn_id(), kind = %descriptor.kind, error = %e, "transaction failed");
                log.point(Stage::Failed, e.to_string());
            }
        }
        result
    }

    async fn submit(
        &self,
        descriptor: &TransactionDescriptor,
        log: &mut TxnLog,
        guard: &mut OutcomeGuard<'_>,
    ) -> Result<(), TransactionError> {
        let proposal = self.ledger.new_proposal(&descriptor.name, &descriptor.args)?;
        let txn_id = proposal.transaction_id().to_owned();
        log.assign(&txn_id);

        // Registered before anything is sent so the event cannot beat the waiter.
        let receiver = self.correlator.register(&txn_id)?;
        guard.track(&txn_id);

        log.point(Stage::Endorsing, descriptor.to_string());
        let endorsed =
            with_deadline(LedgerCall::Endorse, self.config.timeouts.endorse, proposal.endorse())
                .await?;

        self.correlator.ensure_listening(self.ledger.as_ref()).await?;

        log.point(Stage::Submitting, "");
        let submitted =
            with_deadline(LedgerCall::Submit, self.config.timeouts.submit, endorsed.submit())
                .await?;
        log.point(Stage::Submitted, "");

        let status = with_deadline(
            LedgerCall::CommitStatus,
            self.config.timeouts.commit_status,
            submitted.status(),
        )
        .await?;

        if !status.is_valid() {
            self.metrics.validation_failures.increment(1);
            self.metrics.validation_code(status.code);
            if status.is_read_conflict() {
                warn!(txn_id = %txn_id, status = %status, "read conflict reported for chaos transaction");
            }
            return Err(TransactionError::Validation(status));
        }
        log.point(Stage::Committed, format!("status code: {}", status.code));

        let event = match timeout(self.config.event_timeout, receiver).await {
            Ok(Ok(event)) => event,
            Ok(Err(_)) => return Err(TransactionError::ListenerClosed),
            Err(_) => {
                self.correlator.unregister(&txn_id);
                self.metrics.event_timeouts.increment(1);
                return Err(TransactionError::EventTimeout(self.config.event_timeout));
            }
        };

        log.point(
            Stage::EventReceived,
            format!("EventName:{},Payload:{}", event.event_name, event.payload_lossy()),
        );
        Ok(())
    }

    async fn evaluate(
        &self,
        descriptor: &TransactionDescriptor,
        log: &mut TxnLog,
    ) -> Result<(), TransactionError> {
        let proposal = self.ledger.new_proposal(&descriptor.name, &descriptor.args)?;
        log.assign(proposal.transaction_id());

        log.point(Stage::Evaluating, descriptor.to_string());
        with_deadline(LedgerCall::Evaluate, self.config.timeouts.evaluate, proposal.evaluate())
            .await?;
        log.point(Stage::Evaluated, descriptor.to_string());
        Ok(())
    }

    /// Admission limiter shared with the driver.
    pub const fn limiter(&self) -> &AdmissionLimiter {
        &self.limiter
    }

    /// Event correlator used by submits.
    pub const fn correlator(&self) -> &Arc<EventCorrelator> {
        &self.correlator
    }

    /// Running outcome counters.
    pub const fn stats(&self) -> &Arc<Stats> {
        &self.stats
    }
}

/// Awaits `call`, failing with [`TransactionError::CallTimeout`] after `limit`. A zero limit
/// waits indefinitely.
async fn with_deadline<T, F>(
    call: LedgerCall,
    limit: Duration,
    fut: F,
) -> Result<T, TransactionError>
where
    F: Future<Output = Result<T, LedgerError>>,
{
    if limit.is_zero() {
        return Ok(fut.await?);
    }
    match timeout(limit, fut).await {
        Ok(result) => Ok(result?),
        Err(_) => Err(TransactionError::CallTimeout { call, timeout: limit }),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        CallTimeouts, SimulatedLedger, SimulationConfig, TransactionStats, TxnLogLevel,
    };

    fn runner(sim: SimulationConfig, config: RunnerConfig) -> TransactionRunner<SimulatedLedger> {
        TransactionRunner::new(
            Arc::new(SimulatedLedger::new(sim)),
            AdmissionLimiter::new(30),
            config,
            Metrics::default(),
        )
    }

    fn fast_sim() -> SimulationConfig {
        SimulationConfig::default()
            .with_latency(Duration::from_millis(10))
            .with_commit_latency(Duration::from_millis(50))
    }

    fn submit() -> TransactionDescriptor {
        TransactionDescriptor::submit("createUpdateChaosAsset", &["cd1", "99"])
    }

    fn evaluate() -> TransactionDescriptor {
        TransactionDescriptor::evaluate("readChaosAsset", &["cd1"])
    }

    #[tokio::test(start_paused = true)]
    async fn submit_succeeds_when_event_arrives() {
        let runner = runner(fast_sim(), RunnerConfig::default());

        runner.run_transaction(&submit()).await.unwrap();

        assert_eq!(runner.stats().snapshot(), TransactionStats::new(1, 0, 0, 0));
        assert_eq!(runner.correlator().pending_waiters(), 0);
        assert_eq!(runner.limiter().in_flight(), 0);
        assert!(runner.correlator().is_listening());
    }

    #[tokio::test(start_paused = true)]
    async fn evaluate_succeeds() {
        let runner = runner(fast_sim(), RunnerConfig::default());

        runner.run_transaction(&evaluate()).await.unwrap();

        assert_eq!(runner.stats().snapshot(), TransactionStats::new(0, 0, 1, 0));
        assert!(!runner.correlator().is_listening());
    }

    #[tokio::test(start_paused = true)]
    async fn proposal_failure_counts_once_and_releases_slot() {
        let runner = runner(fast_sim().with_proposal_failure_rate(1.0), RunnerConfig::default());

        let err = runner.run_transaction(&submit()).await.unwrap_err();
        assert!(matches!(err, TransactionError::Ledger(LedgerError::Proposal(_))));
        runner.run_transaction(&evaluate()).await.unwrap_err();

        assert_eq!(runner.stats().snapshot(), TransactionStats::new(0, 1, 0, 1));
        assert_eq!(runner.limiter().in_flight(), 0);
        assert_eq!(runner.correlator().pending_waiters(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn missing_event_times_out_and_removes_waiter() {
        let config = RunnerConfig { event_timeout: Duration::from_millis(500), ..Default::default() };
        let runner = runner(fast_sim().with_event_drop_rate(1.0), config);

        let err = runner.run_transaction(&submit()).await.unwrap_err();

        assert_eq!(err, TransactionError::EventTimeout(Duration::from_millis(500)));
        assert_eq!(runner.correlator().pending_waiters(), 0);
        assert_eq!(runner.stats().snapshot(), TransactionStats::new(0, 1, 0, 0));
    }

    #[tokio::test(start_paused = true)]
    async fn invalid_commit_status_fails_submit() {
        let sim = fast_sim()
            .with_validation_failure_rate(1.0)
            .with_validation_failure_code(CommitStatus::MVCC_READ_CONFLICT);
        let runner = runner(sim, RunnerConfig::default());

        let err = runner.run_transaction(&submit()).await.unwrap_err();

        assert_eq!(err, TransactionError::Validation(CommitStatus::new(11)));
        assert_eq!(err.to_string(), "unexpected validation code 11 (MVCC_READ_CONFLICT)");
        assert_eq!(runner.correlator().pending_waiters(), 0);
        assert_eq!(runner.stats().snapshot().unsuccessful_submits, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn slow_endorsement_hits_call_deadline() {
        let config = RunnerConfig {
            timeouts: CallTimeouts { endorse: Duration::from_millis(100), ..Default::default() },
            ..Default::default()
        };
        let runner = runner(fast_sim().with_latency(Duration::from_secs(1)), config);

        let err = runner.run_transaction(&submit()).await.unwrap_err();

        assert_eq!(
            err,
            TransactionError::CallTimeout {
                call: LedgerCall::Endorse,
                timeout: Duration::from_millis(100)
            }
        );
        assert_eq!(runner.correlator().pending_waiters(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn zero_deadline_waits_for_slow_call() {
        let config = RunnerConfig {
            timeouts: CallTimeouts { evaluate: Duration::ZERO, ..Default::default() },
            txn_log_level: TxnLogLevel::All,
            ..Default::default()
        };
        let runner = runner(fast_sim().with_latency(Duration::from_secs(120)), config);

        runner.run_transaction(&evaluate()).await.unwrap();
        assert_eq!(runner.stats().snapshot().successful_evals, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn failed_endorsement_carries_details() {
        let runner = runner(fast_sim().with_endorse_failure_rate(1.0), RunnerConfig::default());

        let err = runner.run_transaction(&submit()).await.unwrap_err();

        assert!(err.to_string().starts_with("endorse failed:"));
        assert!(err.to_string().contains("Details:"));
    }

    #[tokio::test(start_paused = true)]
    async fn cancelled_transaction_is_still_counted() {
        let runner = runner(fast_sim().with_latency(Duration::from_secs(10)), RunnerConfig::default());

        let outcome =
            tokio::time::timeout(Duration::from_millis(100), runner.run_transaction(&submit()))
                .await;

        assert!(outcome.is_err());
        assert_eq!(runner.stats().snapshot(), TransactionStats::new(0, 1, 0, 0));
        assert_eq!(runner.correlator().pending_waiters(), 0);
        assert_eq!(runner.limiter().in_flight(), 0);
    }
}
