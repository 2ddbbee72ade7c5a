use std::process::ExitCode;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::Parser;
use tokio_util::sync::CancellationToken;
use tracing_subscriber::EnvFilter;
use tracing_subscriber::filter::{Directive, LevelFilter};

use jobfeed_client::{AdzunaConfig, AdzunaSource};
use jobfeed_core::dedup::DedupConfig;
use jobfeed_core::publisher::PublishConfig;
use jobfeed_core::retry::RetryConfig;
use jobfeed_core::throttle::{ThrottleConfig, ThrottledSource};
use jobfeed_core::{AppError, ProducerConfig, Supervisor, TracingReporter};
use jobfeed_kafka::{KafkaBus, KafkaConfig};

#[derive(Parser, Debug)]
#[command(
    name = "jobfeed",
    version,
    about = "Poll the Adzuna job-search API and publish each result to Kafka"
)]
struct Cli {
    /// Adzuna API base URL
    #[arg(
        long,
        env = "ADZUNA_API_URL",
        default_value = jobfeed_client::adzuna::DEFAULT_BASE_URL
    )]
    api_url: String,

    #[arg(long, env = "ADZUNA_APP_ID")]
    app_id: String,

    #[arg(long, env = "ADZUNA_APP_KEY", hide_env_values = true)]
    app_key: String,

    /// Country code used in the search path
    #[arg(long, env = "ADZUNA_COUNTRY", default_value = "gb")]
    country: String,

    /// Search terms sent as `what`
    #[arg(short, long, env = "JOBFEED_QUERY", default_value = "data engineer")]
    query: String,

    #[arg(long, env = "JOBFEED_RESULTS_PER_PAGE", default_value_t = 20)]
    results_per_page: u32,

    /// Delay between healthy poll cycles
    #[arg(long, env = "JOBFEED_POLL_INTERVAL_SECS", default_value_t = 60)]
    poll_interval_secs: u64,

    /// Upper bound for the poll cooldown under rate limiting or outages
    #[arg(long, env = "JOBFEED_MAX_BACKOFF_SECS", default_value_t = 900)]
    max_backoff_secs: u64,

    /// Minimum spacing between outgoing API requests
    #[arg(long, env = "JOBFEED_MIN_REQUEST_INTERVAL_MS", default_value_t = 1000)]
    min_request_interval_ms: u64,

    /// Random extra delay, up to this much, added to each request spacing
    #[arg(long, env = "JOBFEED_REQUEST_JITTER_MS", default_value_t = 0)]
    request_jitter_ms: u64,

    #[arg(long, env = "KAFKA_BROKER", default_value = "kafka:9092")]
    kafka_broker: String,

    #[arg(short, long, env = "KAFKA_TOPIC", default_value = "jobs_data")]
    topic: String,

    /// How long a published id suppresses repeats
    #[arg(long, env = "JOBFEED_DEDUP_RETENTION_SECS", default_value_t = 86_400)]
    dedup_retention_secs: u64,

    #[arg(long, env = "JOBFEED_DEDUP_CAPACITY", default_value_t = 100_000)]
    dedup_capacity: usize,

    #[arg(long, env = "JOBFEED_MAX_PUBLISH_ATTEMPTS", default_value_t = 5)]
    max_publish_attempts: u32,

    #[arg(long, env = "JOBFEED_PUBLISH_CONCURRENCY", default_value_t = 8)]
    publish_concurrency: usize,

    /// Abort after the bus has been failing for this long
    #[arg(long, env = "JOBFEED_BUS_FAILURE_LIMIT_SECS", default_value_t = 300)]
    bus_failure_limit_secs: u64,

    /// Grace period for in-flight publishes at shutdown
    #[arg(long, env = "JOBFEED_SHUTDOWN_TIMEOUT_SECS", default_value_t = 30)]
    shutdown_timeout_secs: u64,
}

impl Cli {
    fn producer_config(&self) -> ProducerConfig {
        let publish = PublishConfig {
            retry: RetryConfig {
                max_attempts: self.max_publish_attempts,
                ..RetryConfig::default()
            },
            concurrency: self.publish_concurrency,
            bus_failure_limit: Duration::from_secs(self.bus_failure_limit_secs),
            ..PublishConfig::default()
        };

        ProducerConfig {
            throttle: ThrottleConfig::new(Duration::from_millis(self.min_request_interval_ms))
                .with_jitter(Duration::from_millis(self.request_jitter_ms)),
            ..ProducerConfig::default()
        }
        .with_query(self.query.clone())
        .with_poll_interval(Duration::from_secs(self.poll_interval_secs))
        .with_max_backoff(Duration::from_secs(self.max_backoff_secs))
        .with_dedup(DedupConfig {
            retention: Duration::from_secs(self.dedup_retention_secs),
            capacity: self.dedup_capacity,
        })
        .with_publish(publish)
        .with_shutdown_timeout(Duration::from_secs(self.shutdown_timeout_secs))
    }

    fn adzuna_config(&self) -> AdzunaConfig {
        AdzunaConfig::new(self.app_id.clone(), self.app_key.clone())
            .with_base_url(self.api_url.clone())
            .with_country(self.country.clone())
            .with_results_per_page(self.results_per_page)
    }

    fn kafka_config(&self) -> KafkaConfig {
        KafkaConfig::new(self.kafka_broker.clone(), self.topic.clone())
    }
}

#[tokio::main]
async fn main() -> ExitCode {
    // Load .env if present
    let _ = dotenvy::dotenv();

    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::from_default_env().add_directive(
                "jobfeed=info"
                    .parse::<Directive>()
                    .unwrap_or_else(|_| LevelFilter::INFO.into()),
            ),
        )
        .with_target(false)
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();

    match run(cli).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            let code = exit_code_for(&e);
            tracing::error!(error = ?e, exit_code = code, "jobfeed terminated");
            ExitCode::from(code)
        }
    }
}

async fn run(cli: Cli) -> Result<()> {
    let producer_config = cli.producer_config();
    producer_config
        .validate()
        .context("Invalid producer configuration")?;

    let source = AdzunaSource::new(cli.adzuna_config()).context("Invalid Adzuna configuration")?;
    let source = ThrottledSource::new(source, producer_config.throttle.clone());
    let bus = KafkaBus::new(&cli.kafka_config()).context("Invalid Kafka configuration")?;

    tracing::info!(
        api_url = %cli.api_url,
        country = %cli.country,
        query = %cli.query,
        brokers = %cli.kafka_broker,
        topic = %cli.topic,
        "Starting jobfeed"
    );

    if let Err(e) = bus.probe(Duration::from_secs(10)).await {
        tracing::warn!(error = %e, "Kafka is not reachable yet; publishes will retry");
    }

    let cancel = CancellationToken::new();
    let trigger = cancel.clone();
    tokio::spawn(async move {
        shutdown_signal().await;
        trigger.cancel();
    });

    let summary = Supervisor::new(source, bus, producer_config)
        .run(cancel, &TracingReporter)
        .await
        .context("Producer stopped on a fatal error")?;

    tracing::info!(
        delivered = summary.delivered,
        suppressed = summary.suppressed,
        "Shutdown complete"
    );
    Ok(())
}

/// Map an error chain to the process exit code, defaulting to 1.
fn exit_code_for(error: &anyhow::Error) -> u8 {
    error
        .downcast_ref::<AppError>()
        .map(AppError::exit_code)
        .unwrap_or(1)
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            tracing::warn!(error = %e, "Failed to install Ctrl+C handler");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        use tokio::signal::unix::{SignalKind, signal};
        match signal(SignalKind::terminate()) {
            Ok(mut stream) => {
                stream.recv().await;
            }
            Err(e) => {
                tracing::warn!(error = %e, "Failed to install SIGTERM handler");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        () = ctrl_c => {}
        () = terminate => {}
    }
    tracing::info!("Shutdown signal received");
}
