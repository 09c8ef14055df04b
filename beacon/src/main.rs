mod config;

use clap::{Parser, Subcommand};
use config::{Config, ConfigError, LoggingConfig, MetricsConfig};
use metrics_exporter_statsd::StatsdBuilder;
use shared::metrics_defs::describe_all;
use site_cache::SourceError;
use std::io::{self, Read, Write};
use std::path::PathBuf;
use std::process;
use tracing_subscriber::{EnvFilter, fmt, prelude::*};
use tracker::archive::{ArchivePeriod, ArchiveScheduler};
use tracker::config::Config as TrackerConfig;
use tracker::model::unix_now;
use tracker::request_set::parse_query;
use tracker::service::ServiceError;
use tracker::store::StoreError;
use tracker::{ClientInfo, RequestBatch, Tracker, TrackerEnv, TrackerError};

#[derive(Parser)]
#[command(name = "beacon", about = "Web analytics tracking service")]
struct Cli {
    /// Path to the YAML configuration file
    #[arg(long, short, default_value = "beacon.yaml")]
    config: PathBuf,

    #[command(subcommand)]
    command: CliCommand,
}

#[derive(Subcommand)]
enum CliCommand {
    /// Serve tracking hits and the admin probes
    Serve,
    /// Track one query string, or a bulk payload read from stdin with --bulk
    Track {
        query: Option<String>,
        #[arg(long)]
        bulk: bool,
    },
    /// Print the sites whose archives are due
    ArchiveDue {
        #[arg(long, default_value = "day")]
        period: ArchivePeriod,
        /// Record the run for every printed site
        #[arg(long)]
        mark: bool,
    },
}

#[derive(thiserror::Error, Debug)]
enum CliError {
    #[error(transparent)]
    Config(#[from] ConfigError),
    #[error(transparent)]
    Tracker(#[from] TrackerError),
    #[error(transparent)]
    Service(#[from] ServiceError),
    #[error(transparent)]
    Store(#[from] StoreError),
    #[error("could not load sites: {0}")]
    Sites(#[from] SourceError),
    #[error("could not set up metrics: {0}")]
    Metrics(String),
    #[error(transparent)]
    Io(#[from] io::Error),
}

fn main() {
    let cli = Cli::parse();

    if let Err(err) = run(cli) {
        tracing::error!(error = %err, "beacon failed");
        eprintln!("Error: {err}");
        process::exit(1);
    }
}

fn run(cli: Cli) -> Result<(), CliError> {
    let config = Config::from_file(&cli.config)?;

    init_tracing(config.tracker.settings.debug);
    let _sentry = config.common.logging.as_ref().map(init_sentry);
    if let Some(metrics) = &config.common.metrics {
        init_metrics(metrics)?;
    }

    let runtime = tokio::runtime::Runtime::new()?;
    runtime.block_on(execute(cli.command, config.tracker))
}

async fn execute(command: CliCommand, config: TrackerConfig) -> Result<(), CliError> {
    match command {
        CliCommand::Serve => {
            tracing::info!("starting tracker");
            tracker::run(config).await?;
            Ok(())
        }
        CliCommand::Track { query, bulk } => track(&config, query, bulk).await,
        CliCommand::ArchiveDue { period, mark } => archive_due(&config, period, mark).await,
    }
}

fn init_tracing(debug: bool) {
    let default_level = if debug { "debug" } else { "info" };
    let env_filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level));

    // Logs go to stderr; stdout carries response bodies of `track`.
    tracing_subscriber::registry()
        .with(env_filter)
        .with(fmt::layer().with_writer(io::stderr))
        .with(sentry::integrations::tracing::layer())
        .init();
}

fn init_sentry(config: &LoggingConfig) -> sentry::ClientInitGuard {
    sentry::init((
        config.sentry_dsn.as_str(),
        sentry::ClientOptions {
            release: sentry::release_name!(),
            ..Default::default()
        },
    ))
}

fn init_metrics(config: &MetricsConfig) -> Result<(), CliError> {
    let recorder = StatsdBuilder::from(config.statsd_host.as_str(), config.statsd_port)
        .build(Some("beacon"))
        .map_err(|err| CliError::Metrics(err.to_string()))?;
    metrics::set_global_recorder(recorder)
        .map_err(|_| CliError::Metrics("a metrics recorder is already installed".to_string()))?;

    describe_all(tracker::metrics_defs::ALL_METRICS);
    describe_all(site_cache::metrics_defs::ALL_METRICS);
    Ok(())
}

async fn track(config: &TrackerConfig, query: Option<String>, bulk: bool) -> Result<(), CliError> {
    let env = TrackerEnv::from_config(config);

    let batch = if bulk {
        let mut body = Vec::new();
        io::stdin().read_to_end(&mut body)?;
        RequestBatch::from_bulk(&body, ClientInfo::default(), &config.settings.bulk)?
    } else {
        let params = query.as_deref().map(parse_query).unwrap_or_default();
        RequestBatch::from_params(params, ClientInfo::default())
    };

    let mut tracker = Tracker::new(&env);
    let response = tracker.main(batch).await?;
    let outcome = tracker.outcome();
    tracing::info!(
        received = outcome.received,
        logged = outcome.logged,
        skipped = outcome.skipped,
        timed_out = outcome.timed_out,
        "batch tracked"
    );

    let mut stdout = io::stdout().lock();
    stdout.write_all(&response.body())?;
    stdout.flush()?;
    Ok(())
}

async fn archive_due(
    config: &TrackerConfig,
    period: ArchivePeriod,
    mark: bool,
) -> Result<(), CliError> {
    let sites: Vec<_> = config
        .sites
        .build()
        .load_all()?
        .into_iter()
        .filter(|site| site.enabled)
        .map(|site| site.id)
        .collect();

    let store = config.storage.connector().connect().await?;
    let scheduler = ArchiveScheduler::from_config(&config.archiving);
    let now = unix_now();

    let due = scheduler
        .due_sites(store.as_ref(), period, &sites, now)
        .await?;
    for site_id in due {
        println!("{site_id}");
        if mark {
            scheduler
                .mark_run(store.as_ref(), period, site_id, now)
                .await?;
        }
    }
    Ok(())
}
