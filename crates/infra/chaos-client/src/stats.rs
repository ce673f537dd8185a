//! Running transaction outcome counters.

use std::fmt;

use parking_lot::Mutex;
use serde::Serialize;

use crate::TransactionKind;

/// Point-in-time copy of the four outcome counters.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct TransactionStats {
    /// Submits that committed and delivered their event.
    pub successful_submits: u64,
    /// Submits that failed at any stage.
    pub unsuccessful_submits: u64,
    /// Evaluations that returned a result.
    pub successful_evals: u64,
    /// Evaluations that failed.
    pub unsuccessful_evals: u64,
}

impl TransactionStats {
    /// Creates a snapshot from raw counter values.
    pub const fn new(
        successful_submits: u64,
        unsuccessful_submits: u64,
        successful_evals: u64,
        unsuccessful_evals: u64,
    ) -> Self {
        Self { successful_submits, unsuccessful_submits, successful_evals, unsuccessful_evals }
    }

    /// Total transactions counted.
    pub const fn total(&self) -> u64 {
        self.successful_submits
            + self.unsuccessful_submits
            + self.successful_evals
            + self.unsuccessful_evals
    }

    /// Returns true if any transaction has failed.
    pub const fn has_failures(&self) -> bool {
        self.unsuccessful_submits != 0 || self.unsuccessful_evals != 0
    }
}

impl fmt::Display for TransactionStats {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "Submit: good={}, bad={}. Evals: good={}, bad={}",
            self.successful_submits,
            self.unsuccessful_submits,
            self.successful_evals,
            self.unsuccessful_evals
        )
    }
}

/// Shared outcome counters, written by runners and read by the health reporter.
///
/// Counters only ever grow. A single lock keeps snapshots consistent across all four.
#[derive(Debug, Default)]
pub struct Stats {
    counters: Mutex<TransactionStats>,
}

impl Stats {
    /// Creates a new stats collector.
    pub fn new() -> Self {
        Self::default()
    }

    /// Records the outcome of one transaction.
    pub fn record(&self, kind: TransactionKind, succeeded: bool) {
        let mut counters = self.counters.lock();
        let counter = match (kind, succeeded) {
            (TransactionKind::Submit, true) => &mut counters.successful_submits,
            (TransactionKind::Submit, false) => &mut counters.unsuccessful_submits,
            (TransactionKind::Evaluate, true) => &mut counters.successful_evals,
            (TransactionKind::Evaluate, false) => &mut counters.unsuccessful_evals,
        };
        *counter += 1;
    }

    /// Returns a copy of the current counters.
    pub fn snapshot(&self) -> TransactionStats {
        *self.counters.lock()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn record_increments_exactly_one_counter() {
        let stats = Stats::new();
        stats.record(TransactionKind::Submit, true);
        stats.record(TransactionKind::Submit, false);
        stats.record(TransactionKind::Submit, false);
        stats.record(TransactionKind::Evaluate, true);

        assert_eq!(stats.snapshot(), TransactionStats::new(1, 2, 1, 0));
        assert_eq!(stats.snapshot().total(), 4);
    }

    #[test]
    fn has_failures_tracks_either_failure_counter() {
        assert!(!TransactionStats::new(3, 0, 4, 0).has_failures());
        assert!(TransactionStats::new(3, 1, 4, 0).has_failures());
        assert!(TransactionStats::new(3, 0, 4, 1).has_failures());
    }

    #[test]
    fn display_matches_stats_line() {
        assert_eq!(
            TransactionStats::new(10, 2, 5, 1).to_string(),
            "Submit: good=10, bad=2. Evals: good=5, bad=1"
        );
    }
}
