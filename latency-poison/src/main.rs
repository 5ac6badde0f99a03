mod config;

use clap::{Args, Parser, Subcommand};
use config::{Config, ConfigError, LoggingConfig, MetricsConfig};
use metrics_exporter_statsd::StatsdBuilder;
use std::path::PathBuf;
use std::process;
use tracing_subscriber::EnvFilter;
use tracing_subscriber::prelude::*;

#[derive(Parser)]
#[command(name = "latency-poison", about = "Reverse proxy that injects latency and failures")]
struct Cli {
    #[command(subcommand)]
    command: CliCommand,
}

#[derive(Subcommand)]
enum CliCommand {
    /// Serve the proxy and admin listeners
    Proxy(ConfigArgs),
    /// Load and validate a config file, then exit
    Validate(ConfigArgs),
}

#[derive(Args)]
struct ConfigArgs {
    #[arg(long)]
    config_file: PathBuf,
}

#[derive(thiserror::Error, Debug)]
enum CliError {
    #[error(transparent)]
    Config(#[from] ConfigError),
    #[error("proxy error: {0}")]
    Proxy(#[from] chaos_proxy::errors::ProxyError),
    #[error("could not start runtime: {0}")]
    Runtime(#[from] std::io::Error),
    #[error("could not initialize metrics: {0}")]
    Metrics(String),
}

fn main() {
    let cli = Cli::parse();

    if let Err(e) = run(cli) {
        eprintln!("latency-poison: {e}");
        process::exit(1);
    }
}

fn run(cli: Cli) -> Result<(), CliError> {
    match cli.command {
        CliCommand::Proxy(args) => {
            let config = Config::from_file(&args.config_file)?;
            config.validate()?;

            let _sentry = init_logging(&config.logging);
            if let Some(metrics) = &config.metrics {
                init_metrics(metrics)?;
            }

            let runtime = tokio::runtime::Builder::new_multi_thread()
                .enable_all()
                .build()?;

            runtime.block_on(async move {
                let store = chaos_proxy::build_store(&config.proxy)?;
                tracing::info!(
                    keys = config.proxy.keys.len(),
                    seeded = config.proxy.chaos_seed.is_some(),
                    sandbox = config.proxy.sandbox.enabled,
                    "starting proxy"
                );
                chaos_proxy::run(config.proxy, store).await
            })?;
        }
        CliCommand::Validate(args) => {
            let config = Config::from_file(&args.config_file)?;
            config.validate()?;
            println!("{}: ok", args.config_file.display());
        }
    }

    Ok(())
}

/// Installs the fmt subscriber, plus the Sentry layer when a DSN is configured.
/// The returned guard flushes Sentry events on drop.
fn init_logging(config: &LoggingConfig) -> Option<sentry::ClientInitGuard> {
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&config.level));

    let guard = config.sentry_dsn.as_deref().map(|dsn| {
        sentry::init((
            dsn,
            sentry::ClientOptions {
                release: sentry::release_name!(),
                send_default_pii: false,
                ..Default::default()
            },
        ))
    });
    let sentry_layer = guard
        .as_ref()
        .map(|_| sentry::integrations::tracing::layer());

    tracing_subscriber::registry()
        .with(filter)
        .with(tracing_subscriber::fmt::layer())
        .with(sentry_layer)
        .init();

    guard
}

fn init_metrics(config: &MetricsConfig) -> Result<(), CliError> {
    let recorder = StatsdBuilder::from(config.statsd_host.as_str(), config.statsd_port)
        .build(Some(config.prefix.as_str()))
        .map_err(|e| CliError::Metrics(e.to_string()))?;
    metrics::set_global_recorder(recorder).map_err(|e| CliError::Metrics(e.to_string()))?;

    shared::metrics_defs::describe_all(chaos_proxy::metrics_defs::ALL_METRICS);
    Ok(())
}
