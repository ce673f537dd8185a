//! Health classification from consecutive statistics snapshots.

use std::{fmt, str::FromStr, sync::Arc, time::Duration};

use parking_lot::Mutex;
use thiserror::Error;
use tokio::{
    task::JoinHandle,
    time::{Instant, interval_at},
};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::{Metrics, Stats, TransactionStats};

/// Health of the client and network over the last reporting interval.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum HealthState {
    /// Transactions are completing.
    #[default]
    Working,
    /// Nothing completed, successfully or not.
    Stalled,
    /// Everything that completed failed.
    AllFailures,
}

impl HealthState {
    /// Classifies `current` against the `previous` snapshot.
    pub fn classify(previous: Option<&TransactionStats>, current: &TransactionStats) -> Self {
        let Some(previous) = previous else {
            return Self::Working;
        };

        let successes_unchanged = current.successful_submits == previous.successful_submits
            && current.successful_evals == previous.successful_evals;
        let failures_changed = current.unsuccessful_submits != previous.unsuccessful_submits
            || current.unsuccessful_evals != previous.unsuccessful_evals;

        if successes_unchanged && failures_changed {
            Self::AllFailures
        } else if current != previous {
            Self::Working
        } else {
            Self::Stalled
        }
    }

    const fn code(self) -> u8 {
        match self {
            Self::Working => 0,
            Self::Stalled => 1,
            Self::AllFailures => 2,
        }
    }
}

impl fmt::Display for HealthState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Working => f.write_str("working"),
            Self::Stalled => f.write_str("stalled"),
            Self::AllFailures => f.write_str("allfailures"),
        }
    }
}

/// Which health reports are logged each interval.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum StatsMode {
    /// Only stall warnings.
    Stalled,
    /// Only all-failures warnings.
    Stopped,
    /// Both warnings, no figures.
    StalledAndStopped,
    /// Both warnings, and the figures every interval otherwise.
    #[default]
    All,
}

impl StatsMode {
    const fn warns_on_stall(self) -> bool {
        !matches!(self, Self::Stopped)
    }

    const fn warns_on_all_failures(self) -> bool {
        !matches!(self, Self::Stalled)
    }

    const fn reports_figures(self) -> bool {
        matches!(self, Self::All)
    }
}

impl fmt::Display for StatsMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Stalled => f.write_str("Stalled"),
            Self::Stopped => f.write_str("Stopped"),
            Self::StalledAndStopped => f.write_str("Stalled&Stopped"),
            Self::All => f.write_str("All"),
        }
    }
}

/// Unrecognised stats mode name.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("unknown stats mode {0:?}, expected Stalled, Stopped, Stalled&Stopped or All")]
pub struct ParseStatsModeError(String);

impl FromStr for StatsMode {
    type Err = ParseStatsModeError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "stalled" => Ok(Self::Stalled),
            "stopped" => Ok(Self::Stopped),
            "stalled&stopped" | "stalled-and-stopped" => Ok(Self::StalledAndStopped),
            "all" => Ok(Self::All),
            _ => Err(ParseStatsModeError(s.to_owned())),
        }
    }
}

/// Process exit status derived from the final statistics.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExitStatus {
    /// No transaction ever failed.
    Success,
    /// Some transactions failed but the client is not currently collapsed.
    Failures,
    /// The last classification was [`HealthState::AllFailures`].
    AllFailures,
}

impl ExitStatus {
    /// Derives the exit status from the final counters and the last health state.
    pub const fn from_final(stats: &TransactionStats, state: HealthState) -> Self {
        if !stats.has_failures() {
            Self::Success
        } else if matches!(state, HealthState::AllFailures) {
            Self::AllFailures
        } else {
            Self::Failures
        }
    }

    /// Process exit code.
    pub const fn code(self) -> i32 {
        match self {
            Self::Success => 0,
            Self::Failures => 1,
            Self::AllFailures => 2,
        }
    }
}

/// Holds the previous snapshot and the last classification.
#[derive(Debug, Default)]
pub struct HealthMonitor {
    previous: Option<TransactionStats>,
    state: HealthState,
    mode: StatsMode,
}

impl HealthMonitor {
    /// Creates a monitor that has not seen any snapshot yet.
    pub fn new(mode: StatsMode) -> Self {
        Self { previous: None, state: HealthState::Working, mode }
    }

    /// Classifies `current` against the previous snapshot and remembers both.
    pub fn observe(&mut self, current: TransactionStats) -> HealthState {
        let state = HealthState::classify(self.previous.as_ref(), &current);
        self.previous = Some(current);
        self.state = state;
        state
    }

    /// Observes `current` and logs the outcome according to the stats mode.
    pub fn report(&mut self, current: TransactionStats) -> HealthState {
        let state = self.observe(current);
        match state {
            HealthState::Stalled if self.mode.warns_on_stall() => {
                warn!(
                    component = "CLIENT",
                    stage = "STATS",
                    "client/network may have stalled, no new transactions are being evaluated or endorsed"
                );
            }
            HealthState::AllFailures if self.mode.warns_on_all_failures() => {
                warn!(
                    component = "CLIENT",
                    stage = "STATS",
                    "client/network may have stopped, all transactions are failing"
                );
            }
            _ if self.mode.reports_figures() => log_figures("STATS", &current),
            _ => debug!(state = %state, "health check"),
        }
        state
    }

    /// Last classification.
    pub const fn state(&self) -> HealthState {
        self.state
    }
}

/// Logs the four counters with the given stage label.
pub fn log_figures(stage: &'static str, stats: &TransactionStats) {
    info!(
        component = "CLIENT",
        stage,
        successful_submits = stats.successful_submits,
        unsuccessful_submits = stats.unsuccessful_submits,
        successful_evals = stats.successful_evals,
        unsuccessful_evals = stats.unsuccessful_evals,
        "{stats}"
    );
}

/// Periodically snapshots the counters and feeds them to a shared [`HealthMonitor`].
pub struct StatsReporter {
    stats: Arc<Stats>,
    monitor: Arc<Mutex<HealthMonitor>>,
    period: Duration,
    metrics: Metrics,
}

impl fmt::Debug for StatsReporter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("StatsReporter").field("period", &self.period).finish_non_exhaustive()
    }
}

impl StatsReporter {
    /// Creates a reporter ticking every `period`.
    ///
    /// Returns `None` for a zero period, which disables reporting.
    pub fn new(
        stats: Arc<Stats>,
        monitor: Arc<Mutex<HealthMonitor>>,
        period: Duration,
        metrics: Metrics,
    ) -> Option<Self> {
        (!period.is_zero()).then_some(Self { stats, monitor, period, metrics })
    }

    /// Runs one reporting tick.
    pub fn tick(&self) -> HealthState {
        let state = self.monitor.lock().report(self.stats.snapshot());
        self.metrics.health_state.set(f64::from(state.code()));
        state
    }

    /// Spawns the reporting loop. The first report is one period after spawning.
    pub fn spawn(self, shutdown: CancellationToken) -> JoinHandle<()> {
        tokio::spawn(async move {
            let mut ticker = interval_at(Instant::now() + self.period, self.period);
            loop {
                tokio::select! {
                    _ = shutdown.cancelled() => {
                        debug!("stats reporter shutting down");
                        return;
                    }
                    _ = ticker.tick() => {
                        self.tick();
                    }
                }
            }
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::TransactionKind;

    #[test]
    fn first_snapshot_is_working() {
        assert_eq!(
            HealthState::classify(None, &TransactionStats::default()),
            HealthState::Working
        );
    }

    #[test]
    fn only_failures_rising_is_all_failures() {
        let a = TransactionStats::new(10, 2, 5, 1);
        let b = TransactionStats::new(10, 2, 5, 3);
        assert_eq!(HealthState::classify(Some(&a), &b), HealthState::AllFailures);

        let c = TransactionStats::new(10, 4, 5, 1);
        assert_eq!(HealthState::classify(Some(&a), &c), HealthState::AllFailures);
    }

    #[test]
    fn any_success_is_working() {
        let a = TransactionStats::new(10, 2, 5, 1);
        let b = TransactionStats::new(12, 2, 6, 1);
        assert_eq!(HealthState::classify(Some(&a), &b), HealthState::Working);

        let mixed = TransactionStats::new(10, 3, 6, 2);
        assert_eq!(HealthState::classify(Some(&a), &mixed), HealthState::Working);
    }

    #[test]
    fn no_change_is_stalled() {
        let a = TransactionStats::new(10, 2, 5, 1);
        assert_eq!(HealthState::classify(Some(&a), &a), HealthState::Stalled);
    }

    #[test]
    fn monitor_tracks_previous_snapshot() {
        let mut monitor = HealthMonitor::new(StatsMode::All);
        assert_eq!(monitor.observe(TransactionStats::new(1, 0, 0, 0)), HealthState::Working);
        assert_eq!(monitor.observe(TransactionStats::new(1, 1, 0, 0)), HealthState::AllFailures);
        assert_eq!(monitor.state(), HealthState::AllFailures);
        assert_eq!(monitor.observe(TransactionStats::new(1, 1, 0, 0)), HealthState::Stalled);
        assert_eq!(monitor.observe(TransactionStats::new(1, 1, 1, 0)), HealthState::Working);
    }

    #[test]
    fn exit_status_follows_failures_and_state() {
        let clean = TransactionStats::new(4, 0, 7, 0);
        let dirty = TransactionStats::new(4, 1, 7, 0);

        assert_eq!(ExitStatus::from_final(&clean, HealthState::Stalled).code(), 0);
        assert_eq!(ExitStatus::from_final(&dirty, HealthState::Working).code(), 1);
        assert_eq!(ExitStatus::from_final(&dirty, HealthState::Stalled).code(), 1);
        assert_eq!(ExitStatus::from_final(&dirty, HealthState::AllFailures).code(), 2);
    }

    #[test]
    fn stats_mode_parses_config_names() {
        assert_eq!("Stalled".parse::<StatsMode>().unwrap(), StatsMode::Stalled);
        assert_eq!("stopped".parse::<StatsMode>().unwrap(), StatsMode::Stopped);
        assert_eq!("Stalled&Stopped".parse::<StatsMode>().unwrap(), StatsMode::StalledAndStopped);
        assert_eq!("All".parse::<StatsMode>().unwrap(), StatsMode::All);
        assert!("verbose".parse::<StatsMode>().is_err());
    }

    #[test]
    fn stats_mode_selects_warnings() {
        assert!(StatsMode::Stalled.warns_on_stall());
        assert!(!StatsMode::Stalled.warns_on_all_failures());
        assert!(!StatsMode::Stopped.warns_on_stall());
        assert!(StatsMode::Stopped.warns_on_all_failures());
        assert!(StatsMode::StalledAndStopped.warns_on_stall());
        assert!(StatsMode::StalledAndStopped.warns_on_all_failures());
        assert!(!StatsMode::StalledAndStopped.reports_figures());
        assert!(StatsMode::All.reports_figures());
    }

    #[tokio::test(start_paused = true)]
    async fn reporter_classifies_each_interval() {
        let stats = Arc::new(Stats::new());
        let monitor = Arc::new(Mutex::new(HealthMonitor::new(StatsMode::All)));
        let reporter = StatsReporter::new(
            Arc::clone(&stats),
            Arc::clone(&monitor),
            Duration::from_secs(5),
            Metrics::default(),
        )
        .unwrap();
        let shutdown = CancellationToken::new();
        let handle = reporter.spawn(shutdown.clone());

        stats.record(TransactionKind::Evaluate, true);
        tokio::time::sleep(Duration::from_millis(5_500)).await;
        assert_eq!(monitor.lock().state(), HealthState::Working);

        stats.record(TransactionKind::Evaluate, false);
        tokio::time::sleep(Duration::from_secs(5)).await;
        assert_eq!(monitor.lock().state(), HealthState::AllFailures);

        tokio::time::sleep(Duration::from_secs(5)).await;
        assert_eq!(monitor.lock().state(), HealthState::Stalled);

        shutdown.cancel();
        handle.await.unwrap();
    }

    #[test]
    fn zero_period_disables_reporter() {
        let reporter = StatsReporter::new(
            Arc::new(Stats::new()),
            Arc::new(Mutex::new(HealthMonitor::new(StatsMode::All))),
            Duration::ZERO,
            Metrics::default(),
        );
        assert!(reporter.is_none());
    }
}
