use config::{Config, ConfigError, Environment, File};
use serde::{Deserialize, Serialize};
use std::path::Path;
use thiserror::Error;
use tracing::{debug, info};

#[derive(Error, Debug)]
pub enum ConfigurationError {
    #[error("Configuration loading error: {0}")]
    ConfigLoad(#[from] ConfigError),
    #[error("Invalid configuration value: {0}")]
    InvalidValue(String),
}

pub type Result<T> = std::result::Result<T, ConfigurationError>;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SystemConfig {
    /// General system settings
    pub system: SystemSettings,

    /// Redis configuration (locks, event channel, job queues)
    pub redis: RedisConfig,

    /// Default Bounded Batch Processor settings
    pub batch: BatchSettings,

    /// Similarity pipeline settings
    pub pipeline: PipelineSettings,

    /// Progress gateway settings
    pub gateway: GatewaySettings,

    /// API server configuration
    pub api: ApiConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SystemSettings {
    /// Log everything at debug level unless `RUST_LOG` says otherwise
    pub debug_mode: bool,

    /// Emit logs as JSON lines instead of the human-readable format
    pub json_logs: bool,

    /// Worker identifier used in lock owner tokens (defaults to host pid when unset)
    pub worker_id: Option<String>,

    /// Maximum pipelines a single worker process runs at once
    pub worker_concurrency: usize,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RedisConfig {
    /// Redis connection URL
    pub url: String,

    /// Prefix applied to every key and channel this system creates
    pub key_prefix: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BatchSettings {
    /// Cap on simultaneously running batch items
    pub max_concurrency: usize,

    /// Fraction of failed items (0.0..=1.0) beyond which a batch aborts early
    pub failure_threshold: f64,

    /// Wall-clock budget for a whole batch in milliseconds
    pub timeout_ms: u64,

    /// Retries per item after the first attempt
    pub retry_attempts: u32,

    /// Base retry delay; doubled on every further attempt
    pub retry_delay_ms: u64,

    /// Optional per-attempt timeout for a single item
    pub item_timeout_ms: Option<u64>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PipelineSettings {
    /// Cumulative budget for one similarity pipeline run; also the lock TTL
    pub timeout_ms: u64,

    /// Minimum number of valid wallets required to compute similarity
    pub min_valid_wallets: usize,

    /// Concurrent history syncs per pipeline run
    pub sync_concurrency: usize,

    /// Wallets synced longer ago than this are synced again
    pub sync_staleness_hours: u64,

    /// Submit metadata enrichment after balances are fetched
    pub enrichment_enabled: bool,

    /// BRPOP timeout used by workers polling the job queue
    pub queue_pop_timeout_seconds: u64,

    /// Upper bound on wallets accepted in one request
    pub max_wallets_per_request: usize,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GatewaySettings {
    /// Namespace used to build the progress/completed/failed channel names
    pub topic_namespace: String,

    /// Delay before re-subscribing after the event channel drops
    pub reconnect_delay_ms: u64,

    /// Connections without subscriptions receive every event
    pub broadcast_when_unsubscribed: bool,

    /// Outbound message buffer per client connection
    pub client_buffer: usize,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ApiConfig {
    /// API server host
    pub host: String,

    /// API server port
    pub port: u16,

    /// Similarity workers run in other processes; accept jobs even when this
    /// server hosts none
    pub external_workers: bool,
}

impl Default for SystemConfig {
    fn default() -> Self {
        Self {
            system: SystemSettings {
                debug_mode: false,
                json_logs: false,
                worker_id: None,
                worker_concurrency: 2,
            },
            redis: RedisConfig {
                url: "redis://127.0.0.1:6379".to_string(),
                key_prefix: "wallet_similarity".to_string(),
            },
            batch: BatchSettings {
                max_concurrency: 5,
                failure_threshold: 0.5,
                timeout_ms: 300_000,
                retry_attempts: 2,
                retry_delay_ms: 500,
                item_timeout_ms: None,
            },
            pipeline: PipelineSettings {
                timeout_ms: 900_000, // 15 minutes
                min_valid_wallets: 2,
                sync_concurrency: 3,
                sync_staleness_hours: 24,
                enrichment_enabled: true,
                queue_pop_timeout_seconds: 5,
                max_wallets_per_request: 100,
            },
            gateway: GatewaySettings {
                topic_namespace: "similarity".to_string(),
                reconnect_delay_ms: 2_000,
                broadcast_when_unsubscribed: true,
                client_buffer: 256,
            },
            api: ApiConfig {
                host: "0.0.0.0".to_string(),
                port: 8080,
                external_workers: false,
            },
        }
    }
}

impl BatchSettings {
    pub fn validate(&self) -> Result<()> {
        if self.max_concurrency == 0 {
            return Err(ConfigurationError::InvalidValue(
                "batch.max_concurrency must be greater than 0".to_string(),
            ));
        }

        if !(0.0..=1.0).contains(&self.failure_threshold) {
            return Err(ConfigurationError::InvalidValue(format!(
                "batch.failure_threshold must be within [0, 1], got {}",
                self.failure_threshold
            )));
        }

        if self.timeout_ms == 0 {
            return Err(ConfigurationError::InvalidValue(
                "batch.timeout_ms must be greater than 0".to_string(),
            ));
        }

        Ok(())
    }
}

impl PipelineSettings {
    pub fn validate(&self) -> Result<()> {
        if self.timeout_ms == 0 {
            return Err(ConfigurationError::InvalidValue(
                "pipeline.timeout_ms must be greater than 0".to_string(),
            ));
        }

        if self.min_valid_wallets == 0 {
            return Err(ConfigurationError::InvalidValue(
                "pipeline.min_valid_wallets must be at least 1".to_string(),
            ));
        }

        if self.sync_concurrency == 0 {
            return Err(ConfigurationError::InvalidValue(
                "pipeline.sync_concurrency must be greater than 0".to_string(),
            ));
        }

        // BRPOP treats 0 as "block forever"
        if self.queue_pop_timeout_seconds == 0 {
            return Err(ConfigurationError::InvalidValue(
                "pipeline.queue_pop_timeout_seconds must be greater than 0".to_string(),
            ));
        }

        if self.max_wallets_per_request < self.min_valid_wallets {
            return Err(ConfigurationError::InvalidValue(
                "pipeline.max_wallets_per_request cannot be below min_valid_wallets".to_string(),
            ));
        }

        Ok(())
    }
}

impl SystemConfig {
    /// Load configuration from file and environment variables
    pub fn load() -> Result<Self> {
        Self::load_from_path("config.toml")
    }

    /// Load configuration from a specific file path
    pub fn load_from_path<P: AsRef<Path>>(config_path: P) -> Result<Self> {
        let mut config_builder = Config::builder()
            // Start with defaults
            .add_source(Config::try_from(&SystemConfig::default())?);

        if config_path.as_ref().exists() {
            info!(
                "Loading configuration from: {}",
                config_path.as_ref().display()
            );
            config_builder = config_builder.add_source(File::from(config_path.as_ref()));
        } else {
            debug!("Config file not found, using defaults and environment variables");
        }

        config_builder = config_builder.add_source(
            Environment::with_prefix("SIMILARITY")
                .try_parsing(true)
                .separator("__")
                .list_separator(","),
        );

        let config = config_builder.build()?;
        let system_config: SystemConfig = config.try_deserialize()?;

        system_config.validate()?;

        Ok(system_config)
    }

    /// Validate configuration values
    pub fn validate(&self) -> Result<()> {
        self.batch.validate()?;
        self.pipeline.validate()?;

        if self.redis.url.trim().is_empty() {
            return Err(ConfigurationError::InvalidValue(
                "redis.url cannot be empty".to_string(),
            ));
        }

        if self.system.worker_concurrency == 0 {
            return Err(ConfigurationError::InvalidValue(
                "system.worker_concurrency must be greater than 0".to_string(),
            ));
        }

        if self.gateway.client_buffer == 0 {
            return Err(ConfigurationError::InvalidValue(
                "gateway.client_buffer must be greater than 0".to_string(),
            ));
        }

        if self.api.port == 0 {
            return Err(ConfigurationError::InvalidValue(
                "API port cannot be 0".to_string(),
            ));
        }

        Ok(())
    }

    /// Worker identity used as the prefix of lock owner tokens
    pub fn worker_id(&self) -> String {
        self.system
            .worker_id
            .clone()
            .unwrap_or_else(|| format!("worker-{}", std::process::id()))
    }

    /// Fallback tracing filter when `RUST_LOG` is unset
    pub fn log_filter(&self) -> &'static str {
        if self.system.debug_mode {
            "debug"
        } else {
            "info,api_server=debug"
        }
    }
}
