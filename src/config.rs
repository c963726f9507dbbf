use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::time::Duration;

use clap::Parser;
use folio_bus::Topic;
use serde::Deserialize;
use sqlx::SqlitePool;
use sqlx::sqlite::SqliteConnectOptions;
use tracing::Level;

use crate::consumer::ConsumerConfig;
use crate::error::ConfigError;
use crate::outbox::publisher::OutboxPublisherConfig;
use crate::reconciliation::ReconciliationConfig;

const DEFAULT_TRANSACTIONS_TOPIC: &str = "portfolio.transactions";
const DEFAULT_CONSUMER_GROUP: &str = "analytics-rating-aggregator";

#[derive(Parser, Debug)]
pub struct Env {
    /// Path to TOML configuration file
    #[clap(long, env)]
    pub config_file: PathBuf,
}

/// Settings deserialized from the config TOML. Interval fields are in
/// seconds; everything optional falls back to a default at assembly time.
#[derive(Debug, Deserialize)]
struct Config {
    database_url: String,
    log_level: Option<LogLevel>,
    transactions_topic: Option<String>,
    consumer_group: Option<String>,
    publish_interval: Option<u64>,
    publish_max_jitter: Option<u64>,
    publish_batch_size: Option<i64>,
    claim_lease: Option<u64>,
    reconciliation_interval: Option<u64>,
    reconciliation_max_jitter: Option<u64>,
}

/// Runtime context for the service, assembled from the config TOML.
#[derive(Debug, Clone)]
pub struct Ctx {
    pub(crate) database_url: String,
    pub log_level: LogLevel,
    pub(crate) transactions_topic: Topic,
    pub(crate) consumer_group: String,
    pub(crate) publish_interval: u64,
    pub(crate) publish_max_jitter: u64,
    pub(crate) publish_batch_size: i64,
    pub(crate) claim_lease: u64,
    pub(crate) reconciliation_interval: u64,
    pub(crate) reconciliation_max_jitter: u64,
}

impl Ctx {
    pub fn load_file(config: &Path) -> Result<Self, ConfigError> {
        let config_str = std::fs::read_to_string(config)?;
        Self::from_toml(&config_str)
    }

    pub fn from_toml(config_toml: &str) -> Result<Self, ConfigError> {
        let config: Config = toml::from_str(config_toml)?;

        let transactions_topic = Topic::new(
            config
                .transactions_topic
                .unwrap_or_else(|| DEFAULT_TRANSACTIONS_TOPIC.to_string()),
        )?;

        Ok(Self {
            database_url: config.database_url,
            log_level: config.log_level.unwrap_or(LogLevel::Debug),
            transactions_topic,
            consumer_group: config
                .consumer_group
                .unwrap_or_else(|| DEFAULT_CONSUMER_GROUP.to_string()),
            publish_interval: config.publish_interval.unwrap_or(30),
            publish_max_jitter: config.publish_max_jitter.unwrap_or(5),
            publish_batch_size: config.publish_batch_size.unwrap_or(100),
            claim_lease: config.claim_lease.unwrap_or(300),
            reconciliation_interval: config.reconciliation_interval.unwrap_or(900),
            reconciliation_max_jitter: config.reconciliation_max_jitter.unwrap_or(60),
        })
    }

    pub async fn get_sqlite_pool(&self) -> Result<SqlitePool, sqlx::Error> {
        configure_sqlite_pool(&self.database_url).await
    }

    pub fn get_publisher_config(&self) -> OutboxPublisherConfig {
        OutboxPublisherConfig {
            poll_interval: Duration::from_secs(self.publish_interval),
            max_jitter: Duration::from_secs(self.publish_max_jitter),
            batch_size: self.publish_batch_size,
            claim_lease: Duration::from_secs(self.claim_lease),
            ..OutboxPublisherConfig::default()
        }
    }

    pub fn get_reconciliation_config(&self) -> ReconciliationConfig {
        ReconciliationConfig {
            run_interval: Duration::from_secs(self.reconciliation_interval),
            max_jitter: Duration::from_secs(self.reconciliation_max_jitter),
        }
    }

    pub fn get_consumer_config(&self) -> ConsumerConfig {
        ConsumerConfig {
            topic: self.transactions_topic.clone(),
            group: self.consumer_group.clone(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogLevel {
    Trace,
    Debug,
    Info,
    Warn,
    Error,
}

impl From<LogLevel> for Level {
    fn from(log_level: LogLevel) -> Self {
        match log_level {
            LogLevel::Trace => Self::TRACE,
            LogLevel::Debug => Self::DEBUG,
            LogLevel::Info => Self::INFO,
            LogLevel::Warn => Self::WARN,
            LogLevel::Error => Self::ERROR,
        }
    }
}

impl From<&LogLevel> for Level {
    fn from(log_level: &LogLevel) -> Self {
        match log_level {
            LogLevel::Trace => Self::TRACE,
            LogLevel::Debug => Self::DEBUG,
            LogLevel::Info => Self::INFO,
            LogLevel::Warn => Self::WARN,
            LogLevel::Error => Self::ERROR,
        }
    }
}

pub(crate) async fn configure_sqlite_pool(database_url: &str) -> Result<SqlitePool, sqlx::Error> {
    let options = SqliteConnectOptions::from_str(database_url)?.create_if_missing(true);
    let pool = SqlitePool::connect_with(options).await?;

    // WAL allows concurrent readers alongside the single writer. The
    // publisher, consumer and reconciliation job all write to the same
    // file, so a blocked writer waits out the busy timeout instead of
    // failing immediately with "database is locked".
    sqlx::query("PRAGMA journal_mode = WAL")
        .execute(&pool)
        .await?;
    sqlx::query("PRAGMA busy_timeout = 10000")
        .execute(&pool)
        .await?;

    Ok(pool)
}

pub fn setup_tracing(log_level: &LogLevel) {
    let level: Level = log_level.into();
    let default_filter = format!("folio_analytics={level},folio_bus={level}");

    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| default_filter.into()),
        )
        .init();
}
