//! Chaos client configuration.

use std::time::Duration;

use rand::Rng;
use thiserror::Error;

use crate::{StatsMode, TransactionType, TxnLogLevel};

/// Configuration validation errors.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ConfigError {
    /// The admission ceiling must allow at least one transaction.
    #[error("max unfinished transactions must be at least 1")]
    ZeroCeiling,
    /// A backoff range has its bounds reversed.
    #[error("{name} backoff minimum {min:?} exceeds maximum {max:?}")]
    InvertedBackoff {
        /// Which backoff range is invalid.
        name: &'static str,
        /// Lower bound.
        min: Duration,
        /// Upper bound.
        max: Duration,
    },
    /// Submitted transactions would fail immediately.
    #[error("event timeout must be greater than zero")]
    ZeroEventTimeout,
}

/// Inclusive range a random backoff is drawn from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BackoffRange {
    /// Shortest backoff.
    pub min: Duration,
    /// Longest backoff.
    pub max: Duration,
}

impl BackoffRange {
    /// Creates a range from millisecond bounds.
    pub const fn from_millis(min: u64, max: u64) -> Self {
        Self { min: Duration::from_millis(min), max: Duration::from_millis(max) }
    }

    /// Draws a backoff uniformly at millisecond granularity.
    pub fn sample(&self) -> Duration {
        let min = self.min.as_millis() as u64;
        let max = self.max.as_millis() as u64;
        if max <= min {
            return self.min;
        }
        Duration::from_millis(rand::rng().random_range(min..=max))
    }

    fn validate(&self, name: &'static str) -> Result<(), ConfigError> {
        if self.min > self.max {
            return Err(ConfigError::InvertedBackoff { name, min: self.min, max: self.max });
        }
        Ok(())
    }
}

/// Deadlines for individual ledger calls. [`Duration::ZERO`] disables a deadline.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CallTimeouts {
    /// Endorsement.
    pub endorse: Duration,
    /// Handing the endorsed transaction to ordering.
    pub submit: Duration,
    /// Waiting for the commit status.
    pub commit_status: Duration,
    /// Evaluation.
    pub evaluate: Duration,
}

impl Default for CallTimeouts {
    fn default() -> Self {
        Self {
            endorse: Duration::from_secs(30),
            submit: Duration::from_secs(10),
            commit_status: Duration::from_secs(60),
            evaluate: Duration::from_secs(30),
        }
    }
}

/// Settings each transaction runner needs.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RunnerConfig {
    /// Per-call deadlines.
    pub timeouts: CallTimeouts,
    /// How long a committed submit waits for its completion event.
    pub event_timeout: Duration,
    /// Transaction log verbosity.
    pub txn_log_level: TxnLogLevel,
}

impl Default for RunnerConfig {
    fn default() -> Self {
        Self {
            timeouts: CallTimeouts::default(),
            event_timeout: Duration::from_secs(5),
            txn_log_level: TxnLogLevel::default(),
        }
    }
}

/// Top level chaos client configuration.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChaosClientConfig {
    /// Admission ceiling on in-flight transactions.
    pub max_unfinished_transactions: usize,
    /// Backoff when the admission ceiling is reached.
    pub admission_backoff: BackoffRange,
    /// Backoff when the ledger connection is not ready.
    pub reconnect_backoff: BackoffRange,
    /// Readiness probe deadline.
    pub connect_timeout: Duration,
    /// Per-call deadlines.
    pub timeouts: CallTimeouts,
    /// How long a committed submit waits for its completion event.
    pub event_timeout: Duration,
    /// Health report interval, [`Duration::ZERO`] disables reporting.
    pub stats_interval: Duration,
    /// Which health reports are logged.
    pub stats_mode: StatsMode,
    /// Transaction log verbosity.
    pub txn_log_level: TxnLogLevel,
    /// Which transactions are picked from the workload.
    pub transaction_type: TransactionType,
}

impl Default for ChaosClientConfig {
    fn default() -> Self {
        let runner = RunnerConfig::default();
        Self {
            max_unfinished_transactions: 30,
            admission_backoff: BackoffRange::from_millis(500, 1_000),
            reconnect_backoff: BackoffRange::from_millis(500, 1_000),
            connect_timeout: Duration::from_secs(20),
            timeouts: runner.timeouts,
            event_timeout: runner.event_timeout,
            stats_interval: Duration::from_secs(5),
            stats_mode: StatsMode::default(),
            txn_log_level: runner.txn_log_level,
            transaction_type: TransactionType::default(),
        }
    }
}

impl ChaosClientConfig {
    /// Sets the admission ceiling.
    pub const fn with_max_unfinished_transactions(mut self, ceiling: usize) -> Self {
        self.max_unfinished_transactions = ceiling;
        self
    }

    /// Sets the admission backoff range.
    pub const fn with_admission_backoff(mut self, backoff: BackoffRange) -> Self {
        self.admission_backoff = backoff;
        self
    }

    /// Sets the reconnect backoff range.
    pub const fn with_reconnect_backoff(mut self, backoff: BackoffRange) -> Self {
        self.reconnect_backoff = backoff;
        self
    }

    /// Sets the readiness probe deadline.
    pub const fn with_connect_timeout(mut self, timeout: Duration) -> Self {
        self.connect_timeout = timeout;
        self
    }

    /// Sets the per-call deadlines.
    pub const fn with_timeouts(mut self, timeouts: CallTimeouts) -> Self {
        self.timeouts = timeouts;
        self
    }

    /// Sets the completion event timeout.
    pub const fn with_event_timeout(mut self, timeout: Duration) -> Self {
        self.event_timeout = timeout;
        self
    }

    /// Sets the health report interval.
    pub const fn with_stats_interval(mut self, interval: Duration) -> Self {
        self.stats_interval = interval;
        self
    }

    /// Sets the stats mode.
    pub const fn with_stats_mode(mut self, mode: StatsMode) -> Self {
        self.stats_mode = mode;
        self
    }

    /// Sets the transaction log verbosity.
    pub const fn with_txn_log_level(mut self, level: TxnLogLevel) -> Self {
        self.txn_log_level = level;
        self
    }

    /// Sets which transactions are picked.
    pub const fn with_transaction_type(mut self, ty: TransactionType) -> Self {
        self.transaction_type = ty;
        self
    }

    /// Checks the configuration is usable.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.max_unfinished_transactions == 0 {
            return Err(ConfigError::ZeroCeiling);
        }
        self.admission_backoff.validate("admission")?;
        self.reconnect_backoff.validate("reconnect")?;
        if self.event_timeout.is_zero() {
            return Err(ConfigError::ZeroEventTimeout);
        }
        Ok(())
    }

    /// Settings handed to each transaction runner.
    pub const fn runner(&self) -> RunnerConfig {
        RunnerConfig {
            timeouts: self.timeouts,
            event_timeout: self.event_timeout,
            txn_log_level: self.txn_log_level,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_are_valid() {
        let config = ChaosClientConfig::default();
        assert_eq!(config.max_unfinished_transactions, 30);
        assert_eq!(config.event_timeout, Duration::from_secs(5));
        assert_eq!(config.timeouts.commit_status, Duration::from_secs(60));
        assert!(config.validate().is_ok());
    }

    #[test]
    fn validation_rejects_bad_settings() {
        let zero = ChaosClientConfig::default().with_max_unfinished_transactions(0);
        assert_eq!(zero.validate(), Err(ConfigError::ZeroCeiling));

        let inverted =
            ChaosClientConfig::default().with_admission_backoff(BackoffRange::from_millis(900, 100));
        assert!(matches!(
            inverted.validate(),
            Err(ConfigError::InvertedBackoff { name: "admission", .. })
        ));

        let no_event = ChaosClientConfig::default().with_event_timeout(Duration::ZERO);
        assert_eq!(no_event.validate(), Err(ConfigError::ZeroEventTimeout));
    }

    #[test]
    fn backoff_sample_stays_in_range() {
        let range = BackoffRange::from_millis(500, 1_000);
        for _ in 0..100 {
            let sample = range.sample();
            assert!(sample >= range.min && sample <= range.max);
        }
        assert_eq!(BackoffRange::from_millis(250, 250).sample(), Duration::from_millis(250));
    }

    #[test]
    fn runner_config_follows_builder() {
        let config = ChaosClientConfig::default()
            .with_event_timeout(Duration::from_millis(750))
            .with_txn_log_level(TxnLogLevel::All);
        let runner = config.runner();
        assert_eq!(runner.event_timeout, Duration::from_millis(750));
        assert_eq!(runner.txn_log_level, TxnLogLevel::All);
    }
}
