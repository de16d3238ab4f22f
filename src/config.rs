use config::{Config, ConfigError, Environment, File};
use serde::Deserialize;
use std::path::Path;
use std::time::Duration;

/// Main configuration structure
#[derive(Debug, Clone, Deserialize)]
pub struct AppConfig {
    pub database: DatabaseConfig,
    pub redis: RedisConfig,
    pub settlement: SettlementConfig,
    #[serde(default)]
    pub trigger: TriggerConfig,
    #[serde(default)]
    pub engine: EngineConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
}

#[derive(Debug, Clone, Deserialize)]
pub struct DatabaseConfig {
    /// PostgreSQL connection URL
    pub url: String,
    /// Maximum connections in pool
    #[serde(default = "default_max_connections")]
    pub max_connections: u32,
}

fn default_max_connections() -> u32 {
    5
}

#[derive(Debug, Clone, Deserialize)]
pub struct RedisConfig {
    /// Redis URL shared by locks, value caches and the trigger stream
    pub url: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct SettlementConfig {
    /// Base URL of the quote/conversion service
    pub base_url: String,
    /// Maximum attempts per settlement call (first attempt included)
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
    /// Delay before the second attempt; doubles after each failure
    #[serde(default = "default_initial_backoff_ms")]
    pub initial_backoff_ms: u64,
    /// Per-attempt transport timeout
    #[serde(default = "default_request_timeout_ms")]
    pub request_timeout_ms: u64,
    /// Purpose string sent with every conversion
    #[serde(default = "default_purpose")]
    pub purpose: String,
}

fn default_max_retries() -> u32 {
    3
}

fn default_initial_backoff_ms() -> u64 {
    500
}

fn default_request_timeout_ms() -> u64 {
    10_000
}

fn default_purpose() -> String {
    "InterCompanyTransfer".to_string()
}

impl SettlementConfig {
    pub fn request_timeout(&self) -> Duration {
        Duration::from_millis(self.request_timeout_ms)
    }

    /// Upper bound on time spent inside one settlement call, backoff included.
    pub fn worst_case_latency(&self) -> Duration {
        let attempts = self.max_retries.max(1) as u64;
        let backoff: u64 = (0..attempts.saturating_sub(1))
            .map(|i| self.initial_backoff_ms.saturating_mul(1u64 << i.min(32)))
            .sum();
        Duration::from_millis(backoff + attempts * self.request_timeout_ms)
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct TriggerConfig {
    /// Redis stream carrying evaluation triggers
    pub stream: String,
    /// Consumer group shared by every worker
    pub group: String,
    /// Consumer name of this worker inside the group
    pub consumer: String,
    /// Max deliveries fetched per read
    pub batch_size: usize,
    /// How long a read blocks waiting for new entries
    pub block_ms: u64,
    /// Pending entries idle longer than this are redelivered
    pub redelivery_idle_ms: u64,
    /// Max evaluations running at once in this worker
    pub concurrency: usize,
}

impl Default for TriggerConfig {
    fn default() -> Self {
        Self {
            stream: "ratewatch:transfers".to_string(),
            group: "ratewatch-engine".to_string(),
            consumer: format!("worker-{}", std::process::id()),
            batch_size: 16,
            block_ms: 2_000,
            redelivery_idle_ms: 30_000,
            concurrency: 8,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    pub lock_ttl_secs: u64,
    pub quote_ttl_secs: u64,
    pub user_ttl_secs: u64,
    pub settlement_marker_ttl_secs: u64,
    pub idempotency_window_hours: i64,
    pub page_size: u32,
    /// 0 disables the pending sweeper
    pub sweep_interval_secs: u64,
    /// Page size of the sweeper's walk over PENDING orders
    pub sweep_batch_size: u32,
    /// How long a trigger counts as live after its last delivery. The sweeper
    /// leaves orders with a live trigger alone.
    pub trigger_liveness_secs: u64,
    /// Attempts for the terminal status write (first attempt included)
    pub write_max_attempts: u32,
    pub write_initial_backoff_ms: u64,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            lock_ttl_secs: 180,
            quote_ttl_secs: 60,
            user_ttl_secs: 3600,
            settlement_marker_ttl_secs: 86_400,
            idempotency_window_hours: 24,
            page_size: 10,
            sweep_interval_secs: 60,
            sweep_batch_size: 100,
            trigger_liveness_secs: 120,
            write_max_attempts: 3,
            write_initial_backoff_ms: 500,
        }
    }
}

#[derive(Debug, Clone, Deserialize, Default)]
pub struct LoggingConfig {
    /// Log level (trace, debug, info, warn, error)
    #[serde(default = "default_log_level")]
    pub level: String,
    /// Enable JSON formatted logs
    #[serde(default)]
    pub json: bool,
}

fn default_log_level() -> String {
    "info".to_string()
}

impl AppConfig {
    /// Load configuration from files and environment
    pub fn load() -> Result<Self, ConfigError> {
        Self::load_from("config")
    }

    /// Load configuration from a specific directory
    pub fn load_from<P: AsRef<Path>>(config_dir: P) -> Result<Self, ConfigError> {
        let config_dir = config_dir.as_ref();

        let builder = Config::builder()
            .set_default("logging.level", "info")?
            .set_default("logging.json", false)?
            .set_default("database.max_connections", 5)?
            .set_default("settlement.max_retries", 3)?
            .set_default("settlement.initial_backoff_ms", 500)?
            .add_source(File::from(config_dir.join("default.toml")).required(false))
            // Environment-specific overrides (e.g., config/production.toml)
            .add_source(
                File::from(config_dir.join(
                    std::env::var("RATEWATCH_ENV").unwrap_or_else(|_| "development".to_string()),
                ))
                .required(false),
            )
            // RATEWATCH__DATABASE__URL, RATEWATCH__SETTLEMENT__BASE_URL, ...
            .add_source(
                Environment::with_prefix("RATEWATCH")
                    .separator("__")
                    .try_parsing(true),
            );

        builder.build()?.try_deserialize()
    }

    /// Validate configuration values
    pub fn validate(&self) -> Result<(), Vec<String>> {
        let mut errors = Vec::new();

        if self.settlement.max_retries == 0 {
            errors.push("settlement.max_retries must be at least 1".to_string());
        }

        if self.settlement.initial_backoff_ms == 0 {
            errors.push("settlement.initial_backoff_ms must be positive".to_string());
        }

        if self.engine.lock_ttl_secs == 0 {
            errors.push("engine.lock_ttl_secs must be positive".to_string());
        }

        // Quote fetch and conversion both run under one lock.
        let budget = self.settlement.worst_case_latency() * 2;
        if Duration::from_secs(self.engine.lock_ttl_secs) <= budget {
            errors.push(format!(
                "engine.lock_ttl_secs ({}s) must exceed the settlement latency budget ({}s)",
                self.engine.lock_ttl_secs,
                budget.as_secs()
            ));
        }

        if self.engine.idempotency_window_hours <= 0 {
            errors.push("engine.idempotency_window_hours must be positive".to_string());
        }

        if self.engine.page_size == 0 {
            errors.push("engine.page_size must be positive".to_string());
        }

        if self.engine.sweep_batch_size == 0 {
            errors.push("engine.sweep_batch_size must be positive".to_string());
        }

        if self.engine.write_max_attempts == 0 {
            errors.push("engine.write_max_attempts must be at least 1".to_string());
        }

        // A trigger waiting for redelivery must still count as live.
        if self.engine.trigger_liveness_secs.saturating_mul(1000) <= self.trigger.redelivery_idle_ms {
            errors.push(format!(
                "engine.trigger_liveness_secs ({}s) must exceed trigger.redelivery_idle_ms ({}ms)",
                self.engine.trigger_liveness_secs, self.trigger.redelivery_idle_ms
            ));
        }

        if self.trigger.concurrency == 0 || self.trigger.batch_size == 0 {
            errors.push("trigger.concurrency and trigger.batch_size must be positive".to_string());
        }

        if errors.is_empty() {
            Ok(())
        } else {
            Err(errors)
        }
    }
}
