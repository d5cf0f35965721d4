mod config_commands;
mod db_commands;
mod queue_commands;

use std::{
    net::SocketAddr,
    path::{Path, PathBuf},
    sync::Arc,
};

use {
    anyhow::{Context, bail},
    clap::{Parser, Subcommand},
    serde_json::json,
    tracing::{info, warn},
    tracing_subscriber::{EnvFilter, fmt, layer::SubscriberExt, util::SubscriberInitExt},
};

use {
    deckhand_config::DeckhandConfig,
    deckhand_cron::{
        executor::{CliRunner, Executor},
        service::CronMirrorService,
        settings::ServiceConfig,
        store_sqlite::SqliteStore,
        types::QueueKind,
    },
    deckhand_metrics::MetricsRecorderConfig,
};

#[derive(Parser)]
#[command(
    name = "deckhand",
    version,
    about = "Deckhand: mirrors the cron daemon's jobs and drains its command queues"
)]
struct Cli {
    #[command(subcommand)]
    command: Option<Commands>,

    /// Log level (trace, debug, info, warn, error).
    #[arg(long, global = true, default_value = "info")]
    log_level: String,

    /// Output logs as JSON instead of human-readable.
    #[arg(long, global = true, default_value_t = false)]
    json_logs: bool,

    /// Config file to load instead of searching the standard locations.
    #[arg(long, global = true, env = "DECKHAND_CONFIG")]
    config: Option<PathBuf>,
}

#[derive(Subcommand)]
enum Commands {
    /// Run all loops until interrupted (default when no subcommand is provided).
    Serve,
    /// Run one cycle of every loop and print a summary.
    Once {
        /// Also print the metrics recorded during the run (Prometheus text).
        #[arg(long)]
        metrics: bool,
    },
    /// Print the mirrored jobs and the stored fingerprint.
    Status,
    /// Queue a run or delete request for a job.
    Enqueue {
        #[command(subcommand)]
        action: queue_commands::EnqueueAction,
    },
    /// Configuration management.
    Config {
        #[command(subcommand)]
        action: config_commands::ConfigAction,
    },
    /// Database management.
    Db {
        #[command(subcommand)]
        action: db_commands::DbAction,
    },
}

fn init_telemetry(cli: &Cli) {
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&cli.log_level));

    let registry = tracing_subscriber::registry().with(filter);

    if cli.json_logs {
        registry
            .with(fmt::layer().json().with_target(true).with_thread_ids(false))
            .init();
    } else {
        registry
            .with(
                fmt::layer()
                    .with_target(false)
                    .with_thread_ids(false)
                    .with_ansi(true),
            )
            .init();
    }
}

/// Load the explicit config file, or discover one, then overlay the
/// environment.
pub(crate) fn load_config(path: Option<&Path>) -> anyhow::Result<DeckhandConfig> {
    let Some(path) = path else {
        return Ok(deckhand_config::discover_and_load()?);
    };
    let mut config = deckhand_config::load_config(path)
        .with_context(|| format!("failed to load {}", path.display()))?;
    deckhand_config::apply_env_overrides(&mut config, |name| std::env::var(name).ok());
    Ok(config)
}

/// Refuse to start when required settings are missing or invalid.
fn ensure_runnable(config: &DeckhandConfig) -> anyhow::Result<()> {
    let result = deckhand_config::validate::validate_config(config);
    if result.has_errors() {
        config_commands::print_diagnostics(&result, false);
        bail!("configuration is incomplete; run `deckhand config check` for details");
    }
    Ok(())
}

pub(crate) async fn open_store(config: &DeckhandConfig) -> anyhow::Result<Arc<SqliteStore>> {
    let url = config.store.require_database_url()?;
    let store = SqliteStore::connect(url, config.store.max_connections)
        .await
        .context("failed to open the mirror database")?;
    Ok(Arc::new(store))
}

async fn build_service(config: &DeckhandConfig) -> anyhow::Result<Arc<CronMirrorService>> {
    let settings = ServiceConfig::from_config(config)?;
    let store = open_store(config).await?;
    let runner = Arc::new(CliRunner::from_config(&config.executor));
    let executor = Executor::new(runner, settings.timeouts);
    Ok(CronMirrorService::new(store, executor, settings))
}

fn metrics_config(config: &DeckhandConfig) -> anyhow::Result<MetricsRecorderConfig> {
    let listen = config
        .metrics
        .listen
        .as_deref()
        .map(str::parse::<SocketAddr>)
        .transpose()
        .context("invalid metrics.listen address")?;
    Ok(MetricsRecorderConfig {
        enabled: config.metrics.enabled,
        listen,
        global_labels: config
            .store
            .project_id
            .iter()
            .map(|p| ("project".to_string(), p.clone()))
            .collect(),
    })
}

async fn serve(config: &DeckhandConfig) -> anyhow::Result<()> {
    ensure_runnable(config)?;
    let _metrics = deckhand_metrics::init_metrics(metrics_config(config)?)?;
    let service = build_service(config).await?;

    service.start().await;
    tokio::signal::ctrl_c()
        .await
        .context("failed to listen for shutdown signal")?;
    info!("shutdown requested");
    service.stop().await;
    Ok(())
}

async fn once(config: &DeckhandConfig, print_metrics: bool) -> anyhow::Result<()> {
    ensure_runnable(config)?;
    let metrics = if print_metrics {
        Some(deckhand_metrics::init_metrics(MetricsRecorderConfig {
            enabled: true,
            listen: None,
            ..metrics_config(config)?
        })?)
    } else {
        None
    };
    let service = build_service(config).await?;

    let mut failures = 0;
    let mut report = |name: &str, result: anyhow::Result<serde_json::Value>| match result {
        Ok(value) => value,
        Err(e) => {
            warn!(loop_name = name, error = %e, "cycle failed");
            failures += 1;
            json!({ "error": e.to_string() })
        },
    };

    let mirror = report("mirror", summarize(service.run_mirror_once().await));
    let run = report("run_drain", summarize(service.run_drain_once(QueueKind::Run).await));
    let delete = report(
        "delete_drain",
        summarize(service.run_drain_once(QueueKind::Delete).await),
    );
    let watchdog = report("watchdog", summarize(service.run_watchdog_once().await));

    let summary = json!({
        "mirror": mirror,
        "runDrain": run,
        "deleteDrain": delete,
        "watchdog": watchdog,
        "status": service.status(),
    });
    println!("{}", serde_json::to_string_pretty(&summary)?);
    if let Some(metrics) = metrics {
        print!("{}", metrics.render());
    }

    if failures > 0 {
        bail!("{failures} loop(s) failed");
    }
    Ok(())
}

fn summarize<T: serde::Serialize>(
    result: deckhand_cron::Result<deckhand_cron::service::CycleOutcome<T>>,
) -> anyhow::Result<serde_json::Value> {
    match result? {
        deckhand_cron::service::CycleOutcome::Completed(value) => Ok(serde_json::to_value(value)?),
        deckhand_cron::service::CycleOutcome::Skipped => Ok(json!({ "skipped": true })),
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenvy::dotenv().ok();
    let cli = Cli::parse();

    init_telemetry(&cli);

    info!(version = env!("CARGO_PKG_VERSION"), "deckhand starting");

    let config_path = cli.config.as_deref();
    match cli.command {
        None | Some(Commands::Serve) => serve(&load_config(config_path)?).await,
        Some(Commands::Once { metrics }) => once(&load_config(config_path)?, metrics).await,
        Some(Commands::Status) => queue_commands::status(&load_config(config_path)?).await,
        Some(Commands::Enqueue { action }) => {
            queue_commands::handle_enqueue(&load_config(config_path)?, action).await
        },
        Some(Commands::Config { action }) => config_commands::handle_config(action, config_path),
        Some(Commands::Db { action }) => {
            db_commands::handle_db(&load_config(config_path)?, action).await
        },
    }
}
