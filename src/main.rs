use anyhow::{Context, Result};
use async_trait::async_trait;
use clap::Parser;
use std::path::PathBuf;
use topic_worker::consumer::kafka::KafkaBrokerFactory;
use topic_worker::consumer::{ConsumerConfig, ConsumerSupervisor, Dispatcher, HandlerError, Record, RecordHandler};
use topic_worker::telemetry::{init_logging, LogFormat};
use tracing::info;

#[derive(Parser)]
#[command(name = "topic-worker")]
#[command(about = "Multi-topic Kafka consumer runtime", long_about = None)]
struct Cli {
    /// Path to a YAML configuration file
    #[arg(short, long, env = "TOPIC_WORKER_CONFIG")]
    config: Option<PathBuf>,

    /// Kafka bootstrap servers, overrides the config file
    #[arg(short, long, env = "KAFKA_BROKERS")]
    brokers: Option<String>,

    /// Topics to consume, overrides the config file
    #[arg(short, long, value_delimiter = ',', env = "TOPIC_WORKER_TOPICS")]
    topics: Vec<String>,

    /// Log filter used when RUST_LOG is unset
    #[arg(long, env = "TOPIC_WORKER_LOG_LEVEL")]
    log_level: Option<String>,

    /// Log output format (text or json)
    #[arg(long, env = "TOPIC_WORKER_LOG_FORMAT")]
    log_format: Option<LogFormat>,
}

/// Logs every record and accepts it
struct LogRecord;

#[async_trait]
impl RecordHandler for LogRecord {
    async fn handle(&self, record: &Record) -> Result<(), HandlerError> {
        info!(
            topic = %record.topic,
            partition = record.partition,
            offset = record.offset,
            bytes = record.value.as_ref().map_or(0, Vec::len),
            "Record received"
        );
        Ok(())
    }

    fn name(&self) -> &str {
        "LogRecord"
    }
}

fn load_config(cli: &Cli) -> Result<ConsumerConfig> {
    let mut config = match &cli.config {
        Some(path) => ConsumerConfig::from_yaml_file(path)
            .with_context(|| format!("loading {}", path.display()))?,
        None => ConsumerConfig::default(),
    };

    if let Some(brokers) = &cli.brokers {
        config.brokers = brokers.clone();
    }
    if !cli.topics.is_empty() {
        config.topics = cli.topics.clone();
    }
    if let Some(level) = &cli.log_level {
        config.logging.level = level.clone();
    }
    if let Some(format) = cli.log_format {
        config.logging.format = format;
    }

    config
        .validate()
        .map_err(anyhow::Error::msg)
        .context("invalid configuration")?;
    Ok(config)
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    let config = load_config(&cli)?;
    init_logging(&config.logging)?;

    if config.topics.is_empty() {
        anyhow::bail!("no topics configured");
    }

    let mut dispatcher = Dispatcher::new();
    for topic in &config.topics {
        dispatcher.register(topic.clone(), LogRecord);
    }

    let supervisor = ConsumerSupervisor::new(
        config.clone(),
        KafkaBrokerFactory::new(config.clone()),
        dispatcher,
    )?;
    supervisor.start_configured().await?;
    info!(topics = ?supervisor.topics(), "Consumers running, press Ctrl-C to stop");

    tokio::signal::ctrl_c().await?;
    info!("Stopping consumers");
    supervisor.stop_all().await?;

    Ok(())
}
