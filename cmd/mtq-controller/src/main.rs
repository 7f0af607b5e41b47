use clap::Parser;
use pkg_constants::controller::{
    DEFAULT_MAX_CONFLICT_RETRIES, DEFAULT_RESYNC_INTERVAL_SECS, DEFAULT_WORKERS,
};
use pkg_constants::paths::{DEFAULT_CONTROLLER_CONFIG, DEFAULT_DATA_DIR, DEFAULT_METRICS_PORT};
use pkg_controllers::{ControllerConfig, MigrationQuotaController};
use pkg_metrics::MetricsRegistry;
use pkg_state::client::StateStore;
use pkg_state::registry::Registry;
use pkg_types::config::{ControllerConfigFile, load_config_file};
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tracing::info;
use tracing_subscriber::EnvFilter;

mod server;

#[derive(Parser, Debug)]
#[command(name = "mtq-controller", about = "Migration tenant-quota controller")]
struct Cli {
    /// Path to YAML config file
    #[arg(long, short, default_value = DEFAULT_CONTROLLER_CONFIG)]
    config: String,

    /// Directory for SlateDB state storage
    #[arg(long)]
    data_dir: Option<String>,

    /// Number of reconcile workers
    #[arg(long)]
    workers: Option<usize>,

    /// Seconds between full resyncs
    #[arg(long)]
    resync_interval_secs: Option<u64>,

    /// Compare-and-swap retries before a key is requeued
    #[arg(long)]
    max_conflict_retries: Option<u32>,

    /// Port serving /healthz and /metrics
    #[arg(long)]
    metrics_port: Option<u16>,

    /// Log output format: text or json
    #[arg(long)]
    log_format: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum LogFormat {
    Text,
    Json,
}

impl std::str::FromStr for LogFormat {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "text" | "plain" => Ok(LogFormat::Text),
            "json" => Ok(LogFormat::Json),
            other => anyhow::bail!("unknown log format {:?} (expected text or json)", other),
        }
    }
}

/// Effective settings after merging CLI args > config file > defaults.
#[derive(Debug, PartialEq)]
struct Settings {
    data_dir: String,
    workers: usize,
    resync_interval_secs: u64,
    max_conflict_retries: u32,
    metrics_port: u16,
    log_format: LogFormat,
}

impl Settings {
    fn merge(cli: Cli, file: ControllerConfigFile) -> anyhow::Result<Self> {
        let log_format = match cli.log_format.or(file.log_format) {
            Some(raw) => raw.parse()?,
            None => LogFormat::Text,
        };
        Ok(Self {
            data_dir: cli
                .data_dir
                .or(file.data_dir)
                .unwrap_or_else(|| DEFAULT_DATA_DIR.to_string()),
            workers: cli.workers.or(file.workers).unwrap_or(DEFAULT_WORKERS),
            resync_interval_secs: cli
                .resync_interval_secs
                .or(file.resync_interval_secs)
                .unwrap_or(DEFAULT_RESYNC_INTERVAL_SECS),
            max_conflict_retries: cli
                .max_conflict_retries
                .or(file.max_conflict_retries)
                .unwrap_or(DEFAULT_MAX_CONFLICT_RETRIES),
            metrics_port: cli
                .metrics_port
                .or(file.metrics_port)
                .unwrap_or(DEFAULT_METRICS_PORT),
            log_format,
        })
    }

    fn controller_config(&self) -> ControllerConfig {
        ControllerConfig {
            workers: self.workers.max(1),
            resync_interval: Duration::from_secs(self.resync_interval_secs.max(1)),
            max_conflict_retries: self.max_conflict_retries,
            ..Default::default()
        }
    }
}

fn init_tracing(format: LogFormat) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let builder = tracing_subscriber::fmt().with_env_filter(filter);
    match format {
        LogFormat::Json => builder.json().init(),
        LogFormat::Text => builder.init(),
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    let config_path = cli.config.clone();

    // Load config file (returns defaults if file not found)
    let file_cfg: ControllerConfigFile = load_config_file(&config_path)?;
    let settings = Settings::merge(cli, file_cfg)?;
    init_tracing(settings.log_format);

    info!("Starting mtq-controller");
    info!("  Config file:   {}", config_path);
    info!("  Data dir:      {}", settings.data_dir);
    info!("  Workers:       {}", settings.workers);
    info!("  Resync:        {}s", settings.resync_interval_secs);
    info!("  Metrics port:  {}", settings.metrics_port);

    let store = StateStore::new(&settings.data_dir).await?;
    let registry = Registry::new(store.clone());
    let metrics = Arc::new(MetricsRegistry::new());

    let controller =
        MigrationQuotaController::new(registry, settings.controller_config(), &metrics);
    let running = controller.start().await?;

    let addr = SocketAddr::from(([0, 0, 0, 0], settings.metrics_port));
    server::serve(addr, metrics, async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            tracing::warn!("Failed to listen for shutdown signal: {}", e);
        }
        info!("Shutdown signal received");
    })
    .await?;

    running.shutdown().await;
    store.close().await?;
    Ok(())
}
