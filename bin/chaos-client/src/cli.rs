use std::{net::IpAddr, path::PathBuf, time::Duration};

use chaos_client::{
    BackoffRange, CallTimeouts, ChaosClientConfig, SimulationConfig, StatsMode, TransactionType,
    TxnLogLevel, Workload,
};
use clap::{ArgAction, Args as ClapArgs, Parser, ValueEnum};
use eyre::WrapErr;
use tracing::level_filters::LevelFilter;
use tracing_subscriber::{EnvFilter, fmt, layer::SubscriberExt, util::SubscriberInitExt};

/// CLI entry point for the chaos client.
#[derive(Parser, Debug)]
#[command(author, version, about)]
pub(crate) struct Args {
    /// Maximum number of transactions in flight at once
    #[arg(long, env = "MAX_TRANSACTION_COUNT", default_value = "30")]
    max_transaction_count: usize,

    /// Minimum backoff in milliseconds when the in-flight ceiling is reached
    #[arg(long, env = "MINLIMIT", default_value = "500")]
    min_limit: u64,

    /// Maximum backoff in milliseconds when the in-flight ceiling is reached
    #[arg(long, env = "MAXLIMIT", default_value = "1000")]
    max_limit: u64,

    /// Minimum backoff in milliseconds when the ledger connection is not ready
    #[arg(long, env = "GRPCSLEEPMIN", default_value = "500")]
    grpc_sleep_min: u64,

    /// Maximum backoff in milliseconds when the ledger connection is not ready
    #[arg(long, env = "GRPCSLEEPMAX", default_value = "1000")]
    grpc_sleep_max: u64,

    /// Milliseconds to wait for the ledger connection to become ready
    #[arg(long, env = "GRPC_TIMEOUT", default_value = "20000")]
    grpc_timeout: u64,

    /// Endorsement deadline in milliseconds, 0 disables
    #[arg(long, env = "ENDORSE_TIMEOUT", default_value = "30000")]
    endorse_timeout: u64,

    /// Submit deadline in milliseconds, 0 disables
    #[arg(long, env = "SUBMIT_TIMEOUT", default_value = "10000")]
    submit_timeout: u64,

    /// Commit status deadline in milliseconds, 0 disables
    #[arg(long, env = "STATUS_TIMEOUT", default_value = "60000")]
    status_timeout: u64,

    /// Evaluation deadline in milliseconds, 0 disables
    #[arg(long, env = "EVALUATE_TIMEOUT", default_value = "30000")]
    evaluate_timeout: u64,

    /// Milliseconds a committed submit waits for its chaincode event
    #[arg(long, env = "EVENT_TIMEOUT", default_value = "5000")]
    event_timeout: u64,

    /// Milliseconds between statistics reports, 0 disables
    #[arg(long, env = "TXSTATS_TIMER", default_value = "5000")]
    txstats_timer: u64,

    /// Which statistics reports to log: Stalled, Stopped, Stalled&Stopped or All
    #[arg(long, env = "TXSTATS_MODE", default_value = "All")]
    txstats_mode: StatsMode,

    /// Transaction log verbosity: Failure, Failure&Success or All
    #[arg(long = "log-level", env = "LOG_LEVEL", default_value = "Failure")]
    txn_log_level: TxnLogLevel,

    /// Which transactions to run: random, submit or eval
    #[arg(long, env = "TRANSACTION_TYPE", default_value = "random")]
    transaction_type: TransactionType,

    /// JSON file of transaction descriptors replacing the built-in mix
    #[arg(long, env = "WORKLOAD_FILE")]
    workload_file: Option<PathBuf>,

    #[command(flatten)]
    pub log: LogArgs,

    #[command(flatten)]
    pub metrics: MetricsArgs,

    #[command(flatten)]
    sim: SimArgs,
}

impl Args {
    /// Loads the workload file, or the built-in mix when none is given.
    pub(crate) fn workload(&self) -> eyre::Result<Workload> {
        match &self.workload_file {
            Some(path) => Workload::from_file(path),
            None => Ok(Workload::chaos_default()),
        }
    }

    /// Simulated ledger settings.
    pub(crate) fn simulation(&self) -> SimulationConfig {
        SimulationConfig::from(&self.sim)
    }
}

impl TryFrom<&Args> for ChaosClientConfig {
    type Error = eyre::Report;

    fn try_from(args: &Args) -> eyre::Result<Self> {
        let config = Self::default()
            .with_max_unfinished_transactions(args.max_transaction_count)
            .with_admission_backoff(BackoffRange::from_millis(args.min_limit, args.max_limit))
            .with_reconnect_backoff(BackoffRange::from_millis(
                args.grpc_sleep_min,
                args.grpc_sleep_max,
            ))
            .with_connect_timeout(Duration::from_millis(args.grpc_timeout))
            .with_timeouts(CallTimeouts {
                endorse: Duration::from_millis(args.endorse_timeout),
                submit: Duration::from_millis(args.submit_timeout),
                commit_status: Duration::from_millis(args.status_timeout),
                evaluate: Duration::from_millis(args.evaluate_timeout),
            })
            .with_event_timeout(Duration::from_millis(args.event_timeout))
            .with_stats_interval(Duration::from_millis(args.txstats_timer))
            .with_stats_mode(args.txstats_mode)
            .with_txn_log_level(args.txn_log_level)
            .with_transaction_type(args.transaction_type);

        config.validate().wrap_err("invalid configuration")?;
        Ok(config)
    }
}

/// Log line format.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, ValueEnum)]
pub(crate) enum LogFormat {
    /// Human readable text.
    #[default]
    Text,
    /// One JSON object per line.
    Json,
}

/// Process logging flags.
#[derive(ClapArgs, Debug, Clone)]
pub(crate) struct LogArgs {
    /// Default tracing filter, overridden by `RUST_LOG`
    #[arg(long = "tracing-level", env = "TRACING_LEVEL", default_value = "info")]
    level: LevelFilter,

    /// Log line format
    #[arg(long = "log-format", env = "LOG_FORMAT", value_enum, default_value_t = LogFormat::Text)]
    format: LogFormat,

    /// Colour log output
    #[arg(
        long = "colour-logs",
        env = "COLOUR_LOGS",
        default_value_t = true,
        action = ArgAction::Set
    )]
    colour: bool,
}

impl LogArgs {
    /// Installs the global tracing subscriber.
    pub(crate) fn init_tracing(&self) -> eyre::Result<()> {
        let filter =
            EnvFilter::builder().with_default_directive(self.level.into()).from_env_lossy();
        let layer = fmt::layer().with_ansi(self.colour);

        let registry = tracing_subscriber::registry().with(filter);
        let result = match self.format {
            LogFormat::Text => registry.with(layer).try_init(),
            LogFormat::Json => registry.with(layer.json()).try_init(),
        };
        result.map_err(|e| eyre::eyre!("failed to initialize tracing subscriber: {e}"))
    }
}

/// Prometheus exporter flags.
#[derive(ClapArgs, Debug, Clone)]
pub(crate) struct MetricsArgs {
    /// Serve Prometheus metrics
    #[arg(long = "metrics.enabled", env = "METRICS_ENABLED", default_value = "false")]
    pub enabled: bool,

    /// Address the metrics server binds to
    #[arg(long = "metrics.addr", env = "METRICS_ADDR", default_value = "0.0.0.0")]
    pub addr: IpAddr,

    /// Port the metrics server binds to
    #[arg(long = "metrics.port", env = "METRICS_PORT", default_value = "9090")]
    pub port: u16,
}

/// Simulated ledger flags.
#[derive(ClapArgs, Debug, Clone)]
struct SimArgs {
    /// Milliseconds added to every endorse, submit and evaluate call
    #[arg(long = "sim.latency", env = "SIM_LATENCY", default_value = "20")]
    latency: u64,

    /// Milliseconds between submit and commit
    #[arg(long = "sim.commit-latency", env = "SIM_COMMIT_LATENCY", default_value = "200")]
    commit_latency: u64,

    /// Transactions per block
    #[arg(long = "sim.block-size", env = "SIM_BLOCK_SIZE", default_value = "10")]
    block_size: usize,

    /// Probability a proposal cannot be built
    #[arg(long = "sim.proposal-failure-rate", env = "SIM_PROPOSAL_FAILURE_RATE", default_value = "0")]
    proposal_failure_rate: f64,

    /// Probability an endorsement fails
    #[arg(long = "sim.endorse-failure-rate", env = "SIM_ENDORSE_FAILURE_RATE", default_value = "0")]
    endorse_failure_rate: f64,

    /// Probability an evaluation fails
    #[arg(long = "sim.evaluate-failure-rate", env = "SIM_EVALUATE_FAILURE_RATE", default_value = "0")]
    evaluate_failure_rate: f64,

    /// Probability a commit is invalid
    #[arg(
        long = "sim.validation-failure-rate",
        env = "SIM_VALIDATION_FAILURE_RATE",
        default_value = "0"
    )]
    validation_failure_rate: f64,

    /// Validation code reported for invalid commits
    #[arg(
        long = "sim.validation-failure-code",
        env = "SIM_VALIDATION_FAILURE_CODE",
        default_value = "10"
    )]
    validation_failure_code: i32,

    /// Probability a valid commit never publishes its event
    #[arg(long = "sim.event-drop-rate", env = "SIM_EVENT_DROP_RATE", default_value = "0")]
    event_drop_rate: f64,
}

impl From<&SimArgs> for SimulationConfig {
    fn from(args: &SimArgs) -> Self {
        Self::default()
            .with_latency(Duration::from_millis(args.latency))
            .with_commit_latency(Duration::from_millis(args.commit_latency))
            .with_block_size(args.block_size)
            .with_proposal_failure_rate(args.proposal_failure_rate)
            .with_endorse_failure_rate(args.endorse_failure_rate)
            .with_evaluate_failure_rate(args.evaluate_failure_rate)
            .with_validation_failure_rate(args.validation_failure_rate)
            .with_validation_failure_code(args.validation_failure_code)
            .with_event_drop_rate(args.event_drop_rate)
    }
}
