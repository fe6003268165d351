//! CLI entry point for the subway position relay.
//!
//! Provides subcommands for a single ingestion run, an in-process polling
//! cadence, and replaying either sink from a hand-off artifact.

use anyhow::{Context, Result};
use clap::{Args, Parser, Subcommand};
use std::ffi::OsStr;
use std::path::{Path, PathBuf};
use std::time::Duration;
use subway_relay::config::{DEFAULT_BASE_URL, FeedConfig, MqttConfig, PipelineConfig, PublishConfig};
use subway_relay::consume::{consume, log_records};
use subway_relay::fetch::BasicClient;
use subway_relay::handoff::HandoffStore;
use subway_relay::publish::{DeliveryPolicy, MqttBus, log_delivery, publish};
use subway_relay::store::{SqliteTrainStore, persist};
use subway_relay::{Pipeline, RunSummary};
use tokio::sync::watch;
use tracing::info;
use tracing_subscriber::{
    EnvFilter, Layer,
    fmt::{self, format::FmtSpan},
    layer::SubscriberExt,
    util::SubscriberInitExt,
};

#[derive(Parser)]
#[command(name = "subway_relay")]
#[command(about = "Relays realtime subway positions into SQLite and MQTT", long_about = None)]
struct Cli {
    #[command(flatten)]
    settings: Settings,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Args)]
struct Settings {
    /// Realtime feed API key
    #[arg(long, env = "SEOUL_API_KEY", hide_env_values = true, default_value = "", global = true)]
    api_key: String,

    /// Feed base URL
    #[arg(long, default_value = DEFAULT_BASE_URL, global = true)]
    base_url: String,

    /// Line name (e.g. "3호선") or subway id (e.g. "1003")
    #[arg(long, default_value = "3호선", global = true)]
    line: String,

    /// First row of the feed page window
    #[arg(long, default_value_t = 0, global = true)]
    page_start: u32,

    /// Last row of the feed page window
    #[arg(long, default_value_t = 1000, global = true)]
    page_end: u32,

    /// Directory for hand-off artifacts
    #[arg(long, default_value = "handoff", global = true)]
    handoff_dir: PathBuf,

    /// Number of newest artifacts to keep
    #[arg(long, default_value_t = 1, global = true)]
    handoff_retain: usize,

    /// SQLite database file
    #[arg(long, env = "DATABASE_PATH", default_value = "subway.db", global = true)]
    database: PathBuf,

    /// MQTT broker host
    #[arg(long, default_value = "localhost", global = true)]
    mqtt_host: String,

    /// MQTT broker port
    #[arg(long, default_value_t = 1883, global = true)]
    mqtt_port: u16,

    /// MQTT client id prefix
    #[arg(long, default_value = "subway-relay", global = true)]
    mqtt_client_id: String,

    #[arg(long, env = "MQTT_USERNAME", global = true)]
    mqtt_username: Option<String>,

    #[arg(long, env = "MQTT_PASSWORD", hide_env_values = true, global = true)]
    mqtt_password: Option<String>,

    /// MQTT QoS: 0 fire-and-forget, 1 acknowledged
    #[arg(long, default_value_t = 1, value_parser = clap::value_parser!(u8).range(0..=1), global = true)]
    qos: u8,

    /// Topic the batch is published to
    #[arg(long, default_value = "subway", global = true)]
    topic: String,

    /// best-effort: log failed deliveries; at-least-once: fail the run on them
    #[arg(long, default_value = "best-effort", global = true)]
    delivery_policy: DeliveryPolicy,

    /// Seconds to wait for broker acknowledgements
    #[arg(long, default_value_t = 10, global = true)]
    flush_timeout_secs: u64,
}

impl Settings {
    fn pipeline_config(&self) -> PipelineConfig {
        PipelineConfig {
            feed: FeedConfig {
                base_url: self.base_url.clone(),
                api_key: self.api_key.clone(),
                line: self.line.clone(),
                page_start: self.page_start,
                page_end: self.page_end,
            },
            handoff_dir: self.handoff_dir.clone(),
            handoff_retain: self.handoff_retain,
            publish: PublishConfig {
                topic: self.topic.clone(),
                policy: self.delivery_policy,
                flush_timeout: Duration::from_secs(self.flush_timeout_secs),
            },
            mqtt: MqttConfig {
                host: self.mqtt_host.clone(),
                port: self.mqtt_port,
                client_id: self.mqtt_client_id.clone(),
                username: self.mqtt_username.clone(),
                password: self.mqtt_password.clone(),
                qos: self.qos,
                ..MqttConfig::default()
            },
        }
    }
}

#[derive(Subcommand)]
enum Commands {
    /// Fetch, normalize, persist and publish once
    Run,
    /// Run repeatedly on a fixed cadence; runs never overlap
    Poll {
        /// Seconds between run starts
        #[arg(short, long, default_value_t = 300)]
        interval_secs: u64,

        /// Number of runs (0 = infinite)
        #[arg(short = 'n', long, default_value_t = 0)]
        runs: usize,
    },
    /// Insert the rows of a hand-off artifact into the database
    Persist {
        /// Artifact to read (defaults to the newest in --handoff-dir)
        #[arg(long)]
        artifact: Option<PathBuf>,
    },
    /// Publish a hand-off artifact to the topic
    Publish {
        /// Artifact to read (defaults to the newest in --handoff-dir)
        #[arg(long)]
        artifact: Option<PathBuf>,
    },
    /// Subscribe to the topic and log every record received
    Consume {
        /// Number of messages to read (0 = until Ctrl+C)
        #[arg(short = 'n', long, default_value_t = 0)]
        messages: usize,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    dotenvy::dotenv().ok(); // Load .env file

    // Logging setup: colored stderr + JSON rolling log file
    let log_file_path =
        std::env::var("LOG_FILE_PATH").unwrap_or_else(|_| "logs/subway_relay.log".to_string());
    let log_dir = Path::new(&log_file_path)
        .parent()
        .unwrap_or(Path::new("logs"));
    let log_file_name = Path::new(&log_file_path)
        .file_name()
        .unwrap_or(OsStr::new("subway_relay.log"));

    let file_appender = tracing_appender::rolling::daily(log_dir, log_file_name);
    let (non_blocking_file, _file_guard) = tracing_appender::non_blocking(file_appender);

    let stderr_layer = fmt::layer()
        .with_target(true)
        .with_span_events(FmtSpan::CLOSE)
        .with_ansi(true)
        .with_writer(std::io::stderr)
        .with_filter(EnvFilter::from_env("RUST_LOG").add_directive("info".parse()?));

    let json_layer = fmt::layer()
        .json()
        .with_current_span(true)
        .with_span_list(true)
        .with_writer(non_blocking_file)
        .with_filter(EnvFilter::from_env("RUST_LOG_JSON").add_directive("debug".parse()?));

    tracing_subscriber::registry()
        .with(stderr_layer)
        .with(json_layer)
        .init();

    let cli = Cli::parse();
    let config = cli.settings.pipeline_config();

    match cli.command {
        Commands::Run => {
            config.validate()?;
            let pipeline = Pipeline::new(BasicClient::new()?, config);
            let mut store = SqliteTrainStore::open(&cli.settings.database)?;
            let mut bus = MqttBus::new(&pipeline.config().mqtt)?;

            let summary = pipeline.run_once(&mut store, &mut bus).await?;
            log_summary(&summary);
        }
        Commands::Poll {
            interval_secs,
            runs,
        } => {
            config.validate()?;
            let pipeline = Pipeline::new(BasicClient::new()?, config);
            let mut store = SqliteTrainStore::open(&cli.settings.database)?;

            let summary = pipeline
                .poll(
                    &mut store,
                    || MqttBus::new(&pipeline.config().mqtt),
                    Duration::from_secs(interval_secs),
                    runs,
                    shutdown_signal(),
                )
                .await?;
            info!(runs = summary.runs, failures = summary.failures, "Poll summary");
        }
        Commands::Persist { artifact } => {
            let path = resolve_artifact(&config, artifact)?;
            let batch = HandoffStore::read(&path)?;
            let mut store = SqliteTrainStore::open(&cli.settings.database)?;

            let rows = persist(&batch, &mut store)?;
            info!(artifact = %path.display(), rows, "Artifact persisted");
        }
        Commands::Publish { artifact } => {
            let path = resolve_artifact(&config, artifact)?;
            let batch = HandoffStore::read(&path)?;
            let mut bus = MqttBus::new(&config.mqtt)?;

            let outcome = publish(
                &mut bus,
                &config.publish.topic,
                &batch,
                config.publish.policy,
                config.publish.flush_timeout,
                log_delivery,
            )
            .await?;
            info!(
                artifact = %path.display(),
                delivered = outcome.delivered,
                failed = outcome.failed,
                "Artifact published"
            );
        }
        Commands::Consume { messages } => {
            consume(
                &config.mqtt,
                &config.publish.topic,
                messages,
                shutdown_signal(),
                |topic, records| log_records(topic, &records),
            )
            .await?;
        }
    }

    Ok(())
}

/// Flips to true on the first Ctrl+C. The handler is installed up front so a
/// signal arriving mid-run is still seen once the run finishes.
fn shutdown_signal() -> watch::Receiver<bool> {
    let (tx, rx) = watch::channel(false);
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            info!("Interrupted, stopping after the current step");
            let _ = tx.send(true);
        }
    });
    rx
}

fn resolve_artifact(config: &PipelineConfig, artifact: Option<PathBuf>) -> Result<PathBuf> {
    let Some(path) = artifact else {
        let handoff = HandoffStore::new(config.handoff_dir.clone(), config.handoff_retain);
        return handoff
            .latest()?
            .with_context(|| format!("no hand-off artifact in {}", handoff.dir().display()));
    };
    Ok(path)
}

fn log_summary(summary: &RunSummary) {
    info!(
        run_id = %summary.run_id,
        started_at = %summary.started_at,
        artifact = %summary.artifact.display(),
        records = summary.records,
        unmapped_status = summary.unmapped_status,
        unmapped_direction = summary.unmapped_direction,
        rows = summary.rows_inserted,
        delivered = summary.delivered,
        failed_deliveries = summary.failed_deliveries,
        "Run summary"
    );
}
