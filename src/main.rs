use std::{path::PathBuf, process::ExitCode, time::Duration};

use clap::Parser;
use metric_relay::{config::Config, health, logging, pipeline::Pipeline, shutdown::Shutdown};

/// Polls data sources and relays their metrics to the configured sinks.
#[derive(Parser, Debug)]
#[command(name = "metric-relay", version, about)]
struct Args {
    /// Path to the TOML configuration file
    #[arg(
        short,
        long,
        env = "METRIC_RELAY_CONFIG",
        default_value = "metric-relay.toml"
    )]
    config: PathBuf,

    /// Validate the configuration and exit
    #[arg(long)]
    check: bool,
}

#[tokio::main]
async fn main() -> ExitCode {
    let args = Args::parse();
    let config = match Config::load(&args.config) {
        Ok(config) => config,
        Err(e) => {
            eprintln!("metric-relay: {}: {e}", args.config.display());
            return ExitCode::FAILURE;
        }
    };
    if args.check {
        println!("{}: ok", args.config.display());
        return ExitCode::SUCCESS;
    }
    if let Err(e) = logging::init(&config.log.level, config.log.format) {
        eprintln!("metric-relay: failed to set up logging: {e}");
        return ExitCode::FAILURE;
    }
    match run(config).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            tracing::error!(error = ?e, "metric-relay failed");
            ExitCode::FAILURE
        }
    }
}

async fn run(config: Config) -> anyhow::Result<()> {
    let shutdown = Shutdown::new();
    shutdown.install_signal_handlers();

    let pipeline = Pipeline::from_config(&config)?.spawn();
    tracing::info!(
        sources = config.sources.len(),
        sinks = config.sinks.len(),
        "metric-relay started"
    );

    if config.health.enabled {
        let listen = config.health.listen;
        let health = pipeline.health();
        let stop = shutdown.wait();
        let on_failure = shutdown.clone();
        let server = tokio::spawn(async move {
            if let Err(e) = health::serve(listen, health, stop).await {
                tracing::error!(error = %e, %listen, "health endpoint failed");
                on_failure.trigger();
            }
        });
        shutdown.register(server).await;
    }

    shutdown.wait().await;
    tracing::info!("shutting down");
    pipeline.shutdown().await;
    shutdown.shutdown(Duration::from_secs(2)).await;
    Ok(())
}
