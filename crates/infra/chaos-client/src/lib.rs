#![doc = include_str!("../README.md")]
#![doc(issue_tracker_base_url = "https://github.com/base/node-reth/issues/")]
#![cfg_attr(docsrs, feature(doc_cfg, doc_auto_cfg))]
#![cfg_attr(not(test), warn(unused_crate_dependencies))]

mod admission;
pub use admission::{AdmissionLimiter, AdmissionPermit};

mod config;
pub use config::{BackoffRange, CallTimeouts, ChaosClientConfig, ConfigError, RunnerConfig};

mod correlator;
pub use correlator::{CorrelatorError, EventCorrelator, EventDisposition};

mod driver;
pub use driver::Driver;

mod health;
pub use health::{
    ExitStatus, HealthMonitor, HealthState, ParseStatsModeError, StatsMode, StatsReporter,
    log_figures,
};

mod ledger;
pub use ledger::{
    CallFailure, CommitStatus, CompletionEvent, ConnectionState, EndorsedTransaction,
    EventStream, LedgerClient, LedgerError, Proposal, SubmittedTransaction,
};

mod metrics;
pub use metrics::Metrics;

mod runner;
pub use runner::{LedgerCall, TransactionError, TransactionRunner};

pub mod sim;
pub use sim::{SimulatedLedger, SimulationConfig};

mod stats;
pub use stats::{Stats, TransactionStats};

mod txn_log;
pub use txn_log::{ParseTxnLogLevelError, Stage, TxnLog, TxnLogLevel};

mod workload;
pub use workload::{
    TransactionDescriptor, TransactionKind, TransactionType, Workload, WorkloadError,
};
