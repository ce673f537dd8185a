//! Per-transaction stage log.
//!
//! In the failure modes entries are buffered and only written once the transaction fails (or,
//! with [`TxnLogLevel::FailureAndSuccess`], when it succeeds), so a healthy run stays quiet
//! while a failing transaction still shows its full history.

use std::{fmt, str::FromStr};

use chrono::{DateTime, SecondsFormat, Utc};
use thiserror::Error;
use tracing::{info, warn};

/// Id used before the ledger has assigned one.
const UNASSIGNED: &str = "unassigned";

/// Transaction log verbosity.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum TxnLogLevel {
    /// Only the history of failed transactions.
    #[default]
    Failure,
    /// Failed histories plus the final entry of each success.
    FailureAndSuccess,
    /// Every stage as it happens.
    All,
}

impl fmt::Display for TxnLogLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Failure => f.write_str("Failure"),
            Self::FailureAndSuccess => f.write_str("Failure&Success"),
            Self::All => f.write_str("All"),
        }
    }
}

/// Unrecognised transaction log level.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("unknown log level {0:?}, expected Failure, Failure&Success or All")]
pub struct ParseTxnLogLevelError(String);

impl FromStr for TxnLogLevel {
    type Err = ParseTxnLogLevelError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "failure" => Ok(Self::Failure),
            "failure&success" | "failure-and-success" => Ok(Self::FailureAndSuccess),
            "all" => Ok(Self::All),
            _ => Err(ParseTxnLogLevelError(s.to_owned())),
        }
    }
}

/// Lifecycle stage of a transaction.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Stage {
    /// Endorsement requested.
    Endorsing,
    /// Handing to ordering.
    Submitting,
    /// Accepted for ordering.
    Submitted,
    /// Committed with a valid status.
    Committed,
    /// Transaction failed.
    Failed,
    /// Evaluation requested.
    Evaluating,
    /// Evaluation returned.
    Evaluated,
    /// Completion event delivered.
    EventReceived,
}

impl Stage {
    const fn is_success(self) -> bool {
        matches!(self, Self::EventReceived | Self::Evaluated)
    }
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Endorsing => "Endorsing",
            Self::Submitting => "Submitting",
            Self::Submitted => "Submitted",
            Self::Committed => "Committed",
            Self::Failed => "Failed",
            Self::Evaluating => "Evaluating",
            Self::Evaluated => "Evaluated",
            Self::EventReceived => "EventReceived",
        };
        f.write_str(name)
    }
}

#[derive(Debug, Clone)]
struct Entry {
    timestamp: DateTime<Utc>,
    stage: Stage,
    message: String,
}

/// Stage log for a single transaction.
#[derive(Debug)]
pub struct TxnLog {
    txn_id: String,
    level: TxnLogLevel,
    entries: Vec<Entry>,
}

impl TxnLog {
    /// Creates an empty log with no transaction id yet.
    pub fn new(level: TxnLogLevel) -> Self {
        Self { txn_id: UNASSIGNED.to_owned(), level, entries: Vec::new() }
    }

    /// Sets the transaction id written with every entry.
    pub fn assign(&mut self, txn_id: &str) {
        txn_id.clone_into(&mut self.txn_id);
    }

    /// Transaction id written with every entry.
    pub fn txn_id(&self) -> &str {
        &self.txn_id
    }

    /// Records a stage transition.
    pub fn point(&mut self, stage: Stage, message: impl Into<String>) {
        let entry = Entry { timestamp: Utc::now(), stage, message: message.into() };

        match self.level {
            TxnLogLevel::Failure => {
                self.entries.push(entry);
                self.flush_on_failure(stage);
            }
            TxnLogLevel::FailureAndSuccess => {
                self.entries.push(entry.clone());
                self.flush_on_failure(stage);
                if stage.is_success() {
                    self.emit(&entry, false);
                    self.entries.clear();
                }
            }
            TxnLogLevel::All => self.emit(&entry, stage == Stage::Failed),
        }
    }

    /// Number of entries held back waiting for an outcome.
    pub fn buffered(&self) -> usize {
        self.entries.len()
    }

    fn flush_on_failure(&mut self, stage: Stage) {
        if stage != Stage::Failed {
            return;
        }
        for entry in std::mem::take(&mut self.entries) {
            self.emit(&entry, true);
        }
    }

    fn emit(&self, entry: &Entry, failed: bool) {
        let timestamp = entry.timestamp.to_rfc3339_opts(SecondsFormat::Millis, true);
        if failed {
            warn!(
                target: "chaos_client::txn",
                component = "CLIENT",
                timestamp = %timestamp,
                txn_id = %self.txn_id,
                stage = %entry.stage,
                "{}",
                entry.message
            );
        } else {
            info!(
                target: "chaos_client::txn",
                component = "CLIENT",
                timestamp = %timestamp,
                txn_id = %self.txn_id,
                stage = %entry.stage,
                "{}",
                entry.message
            );
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn failure_level_buffers_until_failed() {
        let mut log = TxnLog::new(TxnLogLevel::Failure);
        log.assign("tx1");
        log.point(Stage::Endorsing, "createUpdateChaosAsset([\"cd1\", \"99\"])");
        log.point(Stage::Submitting, "");
        log.point(Stage::Submitted, "");
        assert_eq!(log.buffered(), 3);

        log.point(Stage::Failed, "unexpected validation code 11 (MVCC_READ_CONFLICT)");
        assert_eq!(log.buffered(), 0);
    }

    #[test]
    fn failure_level_keeps_successful_history_buffered() {
        let mut log = TxnLog::new(TxnLogLevel::Failure);
        log.point(Stage::Evaluating, "readChaosAsset([\"cd1\"])");
        log.point(Stage::Evaluated, "readChaosAsset([\"cd1\"])");
        assert_eq!(log.buffered(), 2);
    }

    #[test]
    fn failure_and_success_flushes_on_either_outcome() {
        let mut log = TxnLog::new(TxnLogLevel::FailureAndSuccess);
        log.point(Stage::Endorsing, "");
        log.point(Stage::Committed, "status code: 0");
        assert_eq!(log.buffered(), 2);
        log.point(Stage::EventReceived, "EventName:CreateAsset,Payload:cd1");
        assert_eq!(log.buffered(), 0);

        log.point(Stage::Evaluating, "");
        log.point(Stage::Failed, "evaluate failed");
        assert_eq!(log.buffered(), 0);
    }

    #[test]
    fn all_level_never_buffers() {
        let mut log = TxnLog::new(TxnLogLevel::All);
        log.point(Stage::Endorsing, "");
        log.point(Stage::Submitting, "");
        assert_eq!(log.buffered(), 0);
    }

    #[test]
    fn id_defaults_until_assigned() {
        let mut log = TxnLog::new(TxnLogLevel::All);
        assert_eq!(log.txn_id(), "unassigned");
        log.assign("abc123");
        assert_eq!(log.txn_id(), "abc123");
    }

    #[test]
    fn log_level_parses_config_names() {
        assert_eq!("Failure".parse::<TxnLogLevel>().unwrap(), TxnLogLevel::Failure);
        assert_eq!(
            "Failure&Success".parse::<TxnLogLevel>().unwrap(),
            TxnLogLevel::FailureAndSuccess
        );
        assert_eq!("all".parse::<TxnLogLevel>().unwrap(), TxnLogLevel::All);
        assert!("debug".parse::<TxnLogLevel>().is_err());
    }
}
