//! The ledger client capability the chaos client drives.
//!
//! Connection setup, identities and signing live behind these traits. The core only needs to
//! build proposals, endorse/submit/evaluate them, watch commit status and subscribe to the
//! completion event stream.

use std::{borrow::Cow, fmt, pin::Pin, time::Duration};

use async_trait::async_trait;
use futures::Stream;
use thiserror::Error;

/// Stream of completion events. Dropping the stream closes the subscription.
pub type EventStream = Pin<Box<dyn Stream<Item = Result<CompletionEvent, LedgerError>> + Send>>;

/// A chaincode event emitted when a submitted transaction commits.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CompletionEvent {
    /// Transaction that emitted the event.
    pub transaction_id: String,
    /// Block the transaction was committed in.
    pub block_number: u64,
    /// Name the chaincode gave the event.
    pub event_name: String,
    /// Raw event payload.
    pub payload: Vec<u8>,
}

impl CompletionEvent {
    /// Returns the payload decoded as UTF-8, replacing invalid sequences.
    pub fn payload_lossy(&self) -> Cow<'_, str> {
        String::from_utf8_lossy(&self.payload)
    }
}

/// Result of a connectivity probe.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    /// The connection is usable.
    Ready,
    /// The connection did not become ready before the probe deadline.
    NotConnected,
    /// No connection has been created yet.
    NotStarted,
}

/// Validation code reported for a committed transaction.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct CommitStatus {
    /// Raw validation code, `0` when the transaction is valid.
    pub code: i32,
}

impl CommitStatus {
    /// Transaction committed and is valid.
    pub const VALID: i32 = 0;
    /// Endorsements did not satisfy the endorsement policy.
    pub const ENDORSEMENT_POLICY_FAILURE: i32 = 10;
    /// A key read during simulation changed before commit.
    pub const MVCC_READ_CONFLICT: i32 = 11;
    /// A range query result changed before commit.
    pub const PHANTOM_READ_CONFLICT: i32 = 12;

    /// Creates a status from a raw validation code.
    pub const fn new(code: i32) -> Self {
        Self { code }
    }

    /// Returns true when the transaction committed as valid.
    pub const fn is_valid(&self) -> bool {
        self.code == Self::VALID
    }

    /// Returns true for read/write conflicts. The chaos chaincode workload never produces
    /// conflicting keys, so these point at a problem in the chaincode or the peer.
    pub const fn is_read_conflict(&self) -> bool {
        matches!(self.code, Self::MVCC_READ_CONFLICT | Self::PHANTOM_READ_CONFLICT)
    }

    /// Returns the well-known name of the code, if any.
    pub const fn name(&self) -> Option<&'static str> {
        match self.code {
            Self::VALID => Some("VALID"),
            Self::ENDORSEMENT_POLICY_FAILURE => Some("ENDORSEMENT_POLICY_FAILURE"),
            Self::MVCC_READ_CONFLICT => Some("MVCC_READ_CONFLICT"),
            Self::PHANTOM_READ_CONFLICT => Some("PHANTOM_READ_CONFLICT"),
            _ => None,
        }
    }
}

impl fmt::Display for CommitStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.name() {
            Some(name) => write!(f, "{} ({name})", self.code),
            None => write!(f, "{}", self.code),
        }
    }
}

/// Message and detail lines returned by a failed ledger call.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CallFailure {
    /// Top level error message.
    pub message: String,
    /// Per-peer details, when the ledger supplies them.
    pub details: Vec<String>,
}

impl CallFailure {
    /// Creates a failure without details.
    pub fn new(message: impl Into<String>) -> Self {
        Self { message: message.into(), details: Vec::new() }
    }

    /// Attaches detail lines to the failure.
    pub fn with_details(mut self, details: Vec<String>) -> Self {
        self.details = details;
        self
    }
}

impl fmt::Display for CallFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.message)?;
        if !self.details.is_empty() {
            let details = serde_json::to_string(&self.details).map_err(|_| fmt::Error)?;
            write!(f, ", Details: {details}")?;
        }
        Ok(())
    }
}

/// Errors surfaced by the ledger client.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum LedgerError {
    /// The proposal could not be built.
    #[error("failed to build proposal: {0}")]
    Proposal(CallFailure),
    /// Endorsement was rejected or failed.
    #[error("endorse failed: {0}")]
    Endorse(CallFailure),
    /// The endorsed transaction could not be sent to ordering.
    #[error("submit failed: {0}")]
    Submit(CallFailure),
    /// The commit status could not be obtained.
    #[error("commit status unavailable: {0}")]
    CommitStatus(CallFailure),
    /// Evaluation failed.
    #[error("evaluate failed: {0}")]
    Evaluate(CallFailure),
    /// The completion event subscription failed.
    #[error("event stream failed: {0}")]
    Events(CallFailure),
}

/// Connection to a ledger network.
#[async_trait]
pub trait LedgerClient: Send + Sync + 'static {
    /// Proposal type produced by this client.
    type Proposal: Proposal;

    /// Builds a proposal for `function` with `args`, assigning it a transaction id.
    fn new_proposal(&self, function: &str, args: &[String]) -> Result<Self::Proposal, LedgerError>;

    /// Subscribes to completion events, replaying from `start_block` when given.
    async fn chaincode_events(&self, start_block: Option<u64>) -> Result<EventStream, LedgerError>;

    /// Waits up to `timeout` for the connection to become ready.
    async fn wait_for_ready(&self, timeout: Duration) -> ConnectionState;
}

/// A built but not yet endorsed or evaluated proposal.
#[async_trait]
pub trait Proposal: Send + 'static {
    /// Endorsed transaction produced by [`Proposal::endorse`].
    type Endorsed: EndorsedTransaction;

    /// Transaction id assigned when the proposal was built.
    fn transaction_id(&self) -> &str;

    /// Collects endorsements for the proposal.
    async fn endorse(self) -> Result<Self::Endorsed, LedgerError>;

    /// Evaluates the proposal without ordering it, returning the result payload.
    async fn evaluate(self) -> Result<Vec<u8>, LedgerError>;
}

/// An endorsed transaction ready to be ordered.
#[async_trait]
pub trait EndorsedTransaction: Send + 'static {
    /// Handle returned once the transaction has been accepted for ordering.
    type Submitted: SubmittedTransaction;

    /// Sends the transaction for ordering.
    async fn submit(self) -> Result<Self::Submitted, LedgerError>;
}

/// A transaction that has been accepted for ordering.
#[async_trait]
pub trait SubmittedTransaction: Send + 'static {
    /// Waits for the transaction to commit and returns its validation code.
    async fn status(self) -> Result<CommitStatus, LedgerError>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn commit_status_names_known_codes() {
        assert_eq!(CommitStatus::new(0).to_string(), "0 (VALID)");
        assert_eq!(CommitStatus::new(11).to_string(), "11 (MVCC_READ_CONFLICT)");
        assert_eq!(CommitStatus::new(42).to_string(), "42");
    }

    #[test]
    fn read_conflicts_are_flagged() {
        assert!(CommitStatus::new(CommitStatus::MVCC_READ_CONFLICT).is_read_conflict());
        assert!(CommitStatus::new(CommitStatus::PHANTOM_READ_CONFLICT).is_read_conflict());
        assert!(!CommitStatus::new(CommitStatus::ENDORSEMENT_POLICY_FAILURE).is_read_conflict());
        assert!(!CommitStatus::new(CommitStatus::VALID).is_read_conflict());
    }

    #[test]
    fn call_failure_renders_details() {
        let bare = CallFailure::new("10 ABORTED: failed to endorse");
        assert_eq!(bare.to_string(), "10 ABORTED: failed to endorse");

        let detailed = bare.with_details(vec!["peer0: chaincode error".into()]);
        assert_eq!(
            detailed.to_string(),
            r#"10 ABORTED: failed to endorse, Details: ["peer0: chaincode error"]"#
        );
    }
}
