//! Chaos client binary entry point.

mod cli;

use std::{net::SocketAddr, sync::Arc};

use chaos_client::{ChaosClientConfig, Driver, SimulatedLedger};
use clap::Parser;
use cli::Args;
use dotenvy::dotenv;
use eyre::WrapErr;
use metrics_exporter_prometheus::PrometheusBuilder;
use tokio::signal::unix::{SignalKind, signal};
use tokio_util::sync::CancellationToken;
use tracing::info;

#[tokio::main]
async fn main() -> eyre::Result<()> {
    dotenv().ok();
    let args = Args::parse();

    args.log.init_tracing()?;

    if args.metrics.enabled {
        let addr = SocketAddr::from((args.metrics.addr, args.metrics.port));
        PrometheusBuilder::new()
            .with_http_listener(addr)
            .install()
            .wrap_err("failed to start prometheus exporter")?;
        info!(target: "prometheus", "Serving metrics at: http://{addr}");
    }

    let config = ChaosClientConfig::try_from(&args)?;
    let workload = args.workload()?;
    let ledger = Arc::new(SimulatedLedger::new(args.simulation()));
    let driver = Driver::new(ledger, workload, config)?;

    let shutdown = CancellationToken::new();
    let mut interrupt = signal(SignalKind::interrupt()).wrap_err("failed to listen for SIGINT")?;
    let mut terminate = signal(SignalKind::terminate()).wrap_err("failed to listen for SIGTERM")?;
    tokio::spawn({
        let shutdown = shutdown.clone();
        async move {
            tokio::select! {
                _ = interrupt.recv() => info!("process interrupted, shutting down"),
                _ = terminate.recv() => info!("process terminated, shutting down"),
            }
            shutdown.cancel();
        }
    });

    let exit = driver.run(shutdown).await;
    std::process::exit(exit.code());
}
