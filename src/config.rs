use anyhow::Context;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fs;
use std::time::Duration;

use crate::money::MAX_CURRENCY_DECIMALS;

#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct AppConfig {
    pub log_level: String,
    pub log_dir: String,
    pub log_file: String,
    pub use_json: bool,
    pub rotation: String,
    pub gateway: GatewayConfig,
    /// PostgreSQL connection URL. When absent every store runs in-process,
    /// which is only correct for a single instance.
    #[serde(default)]
    pub postgres_url: Option<String>,
    /// HS256 secret used to verify caller tokens
    pub jwt_secret: String,
    #[serde(default)]
    pub ledger: LedgerConfig,
    #[serde(default)]
    pub idempotency: IdempotencyConfig,
    #[serde(default)]
    pub transfer: TransferConfig,
    #[serde(default)]
    pub consumer: ConsumerConfig,
    #[serde(default)]
    pub recovery: RecoveryConfig,
    /// Currency code -> minor unit decimals
    #[serde(default = "default_currencies")]
    pub currencies: HashMap<String, u32>,
}

#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct GatewayConfig {
    pub host: String,
    pub port: u16,
}

/// Journal engine optimistic-concurrency settings
#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct LedgerConfig {
    pub max_attempts: u32,
    pub base_backoff_ms: u64,
    pub max_backoff_ms: u64,
    /// Deadline applied to one journal application (all attempts)
    pub apply_timeout_ms: u64,
}

impl Default for LedgerConfig {
    fn default() -> Self {
        Self {
            max_attempts: 8,
            base_backoff_ms: 2,
            max_backoff_ms: 100,
            apply_timeout_ms: 5_000,
        }
    }
}

impl LedgerConfig {
    pub fn base_backoff(&self) -> Duration {
        Duration::from_millis(self.base_backoff_ms)
    }

    pub fn max_backoff(&self) -> Duration {
        Duration::from_millis(self.max_backoff_ms)
    }

    pub fn apply_timeout(&self) -> Duration {
        Duration::from_millis(self.apply_timeout_ms)
    }
}

#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct IdempotencyConfig {
    pub ttl_secs: u64,
    /// How long an in-progress record blocks its key before it can be taken over
    pub lease_secs: u64,
    /// How long a concurrent duplicate waits for the first request to finish
    pub in_flight_wait_ms: u64,
    pub purge_interval_secs: u64,
}

impl Default for IdempotencyConfig {
    fn default() -> Self {
        Self {
            ttl_secs: 24 * 60 * 60,
            lease_secs: 30,
            in_flight_wait_ms: 2_000,
            purge_interval_secs: 600,
        }
    }
}

impl IdempotencyConfig {
    pub fn ttl(&self) -> Duration {
        Duration::from_secs(self.ttl_secs)
    }

    pub fn lease(&self) -> Duration {
        Duration::from_secs(self.lease_secs)
    }

    pub fn in_flight_wait(&self) -> Duration {
        Duration::from_millis(self.in_flight_wait_ms)
    }

    pub fn purge_interval(&self) -> Duration {
        Duration::from_secs(self.purge_interval_secs)
    }
}

#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct TransferConfig {
    pub publish_max_attempts: u32,
    pub publish_backoff_ms: u64,
}

impl Default for TransferConfig {
    fn default() -> Self {
        Self {
            publish_max_attempts: 3,
            publish_backoff_ms: 50,
        }
    }
}

impl TransferConfig {
    pub fn publish_backoff(&self) -> Duration {
        Duration::from_millis(self.publish_backoff_ms)
    }
}

#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct ConsumerConfig {
    pub partitions: usize,
    /// Deliveries of one event before it is dead-lettered
    pub max_deliveries: u32,
    pub redelivery_backoff_ms: u64,
}

impl Default for ConsumerConfig {
    fn default() -> Self {
        Self {
            partitions: 4,
            max_deliveries: 5,
            redelivery_backoff_ms: 200,
        }
    }
}

impl ConsumerConfig {
    pub fn redelivery_backoff(&self) -> Duration {
        Duration::from_millis(self.redelivery_backoff_ms)
    }
}

#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct RecoveryConfig {
    pub scan_interval_secs: u64,
    pub stale_threshold_secs: u64,
    pub batch_size: usize,
    /// A transfer still VALIDATED after this long is rejected
    pub abandon_after_secs: u64,
}

impl Default for RecoveryConfig {
    fn default() -> Self {
        Self {
            scan_interval_secs: 30,
            stale_threshold_secs: 60,
            batch_size: 100,
            abandon_after_secs: 24 * 60 * 60,
        }
    }
}

fn default_currencies() -> HashMap<String, u32> {
    [("USD", 2), ("EUR", 2), ("GBP", 2), ("JPY", 0), ("BTC", 8)]
        .into_iter()
        .map(|(code, decimals)| (code.to_string(), decimals))
        .collect()
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            log_level: "info".to_string(),
            log_dir: "./logs".to_string(),
            log_file: "settlement_ledger.log".to_string(),
            use_json: false,
            rotation: "daily".to_string(),
            gateway: GatewayConfig {
                host: "0.0.0.0".to_string(),
                port: 8080,
            },
            postgres_url: None,
            jwt_secret: "change-me".to_string(),
            ledger: LedgerConfig::default(),
            idempotency: IdempotencyConfig::default(),
            transfer: TransferConfig::default(),
            consumer: ConsumerConfig::default(),
            recovery: RecoveryConfig::default(),
            currencies: default_currencies(),
        }
    }
}

impl AppConfig {
    pub fn load(env: &str) -> anyhow::Result<Self> {
        let config_path = format!("config/{}.yaml", env);
        let content = fs::read_to_string(&config_path)
            .with_context(|| format!("Failed to read config file: {}", config_path))?;
        let config = Self::from_yaml(&content)
            .with_context(|| format!("Failed to parse {}", config_path))?;
        config.validate().with_context(|| format!("Invalid {}", config_path))?;
        Ok(config)
    }

    pub fn validate(&self) -> anyhow::Result<()> {
        for (code, decimals) in &self.currencies {
            if *decimals > MAX_CURRENCY_DECIMALS {
                anyhow::bail!(
                    "currency {} has {} decimals, at most {} supported",
                    code,
                    decimals,
                    MAX_CURRENCY_DECIMALS
                );
            }
        }
        Ok(())
    }

    pub fn from_yaml(content: &str) -> Result<Self, serde_yaml::Error> {
        serde_yaml::from_str(content)
    }
}
