use core::time::Duration;
use std::{
    net::SocketAddr,
    path::PathBuf,
    sync::{Arc, RwLock},
};

use thiserror::Error;
use tracing::warn;
use url::Url;

use crate::spec::parse_retention;

/// The default local writer root.
pub const DEFAULT_LOCAL_PATH: &str = "/backups";

/// The agent configuration, loaded from the process environment.
#[derive(Debug, Clone)]
pub struct Config {
    /// Default retention for garbage collection.
    pub global_retention: Duration,
    /// Log intended GC deletions without deleting.
    pub gc_dry_run: bool,
    /// Root directory for the local writer.
    pub local_backup_path: PathBuf,
    /// Reconciler cadence.
    pub reconcile_interval: Duration,
    /// Global ceiling on in-flight backup jobs.
    pub concurrent_backup_limit: usize,
    /// Per-job deadline.
    pub backup_timeout: Duration,
    /// Remote writer configuration.
    pub s3: S3Config,
    /// Webhook notifier configuration.
    pub webhook: WebhookConfig,
    /// Address for the admin HTTP endpoints.
    pub admin_listen_addr: SocketAddr,
}

/// Configuration for the S3-compatible writer.
#[derive(Debug, Clone, Default)]
pub struct S3Config {
    pub bucket: Option<String>,
    pub region: Option<String>,
    pub endpoint: Option<String>,
    pub access_key_id: Option<String>,
    pub secret_access_key: Option<String>,
    pub force_path_style: bool,
}

/// Configuration for the webhook notifier.
#[derive(Debug, Clone)]
pub struct WebhookConfig {
    /// Global target URL. Per-spec labels override this.
    pub url: Option<String>,
    /// HMAC signing secret.
    pub secret: Option<String>,
    /// Per-attempt HTTP timeout.
    pub timeout: Duration,
    /// Retries per notification.
    pub max_retries: u32,
    /// Circuit breaker recovery timeout.
    pub breaker_recovery: Duration,
}

impl Config {
    /// Load the configuration from the process environment.
    pub fn from_env() -> Result<Self, ConfigError> {
        let global_retention = {
            let value = trimmed_env("GLOBAL_RETENTION_PERIOD");
            if value.is_empty() {
                days(7)
            } else {
                let retention = parse_retention(&value);
                if retention.is_zero() {
                    warn!("Invalid GLOBAL_RETENTION_PERIOD '{value}', using default 7d");
                    days(7)
                } else {
                    retention
                }
            }
        };

        let local_backup_path = {
            let value = trimmed_env("LOCAL_BACKUP_PATH");
            if value.is_empty() {
                PathBuf::from(DEFAULT_LOCAL_PATH)
            } else {
                PathBuf::from(value)
            }
        };

        let s3 = S3Config {
            bucket: non_empty_env("BUCKET_NAME"),
            region: non_empty_env("REGION"),
            endpoint: non_empty_env("ENDPOINT"),
            access_key_id: non_empty_env("ACCESS_KEY_ID"),
            secret_access_key: non_empty_env("SECRET_ACCESS_KEY"),
            force_path_style: bool_env("S3_USE_PATH_STYLE"),
        };

        // Zero retries is a valid choice: a single attempt per notification.
        let max_retries = {
            let value = trimmed_env("WEBHOOK_MAX_RETRIES");
            if value.is_empty() {
                3
            } else {
                match value.parse::<u32>() {
                    Ok(parsed) => parsed,
                    Err(_) => {
                        warn!("Invalid WEBHOOK_MAX_RETRIES value '{value}', using default 3");
                        3
                    }
                }
            }
        };

        let webhook = WebhookConfig {
            url: non_empty_env("WEBHOOK_URL"),
            secret: non_empty_env("WEBHOOK_SECRET"),
            timeout: Duration::from_secs(u64_env("WEBHOOK_TIMEOUT_SECONDS", 10)),
            max_retries,
            breaker_recovery: Duration::from_secs(u64_env("WEBHOOK_BREAKER_RECOVERY_SECONDS", 30)),
        };

        let admin_listen_addr = {
            let value = trimmed_env("ADMIN_LISTEN_ADDR");
            if value.is_empty() {
                "0.0.0.0:8080".parse().unwrap()
            } else {
                value
                    .parse()
                    .map_err(|_| ConfigError::InvalidListenAddr(value))?
            }
        };

        Ok(Self {
            global_retention,
            gc_dry_run: bool_env("GC_DRY_RUN"),
            local_backup_path,
            reconcile_interval: Duration::from_secs(u64_env("RECONCILE_INTERVAL_SECONDS", 10)),
            concurrent_backup_limit: u64_env("CONCURRENT_BACKUP_LIMIT", 20) as usize,
            backup_timeout: Duration::from_secs(60 * u64_env("BACKUP_TIMEOUT_MINUTES", 30)),
            s3,
            webhook,
            admin_listen_addr,
        })
    }

    /// Check for values that have no safe default.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.concurrent_backup_limit == 0 {
            return Err(ConfigError::InvalidConcurrencyLimit);
        }

        if self.backup_timeout.is_zero() {
            return Err(ConfigError::InvalidBackupTimeout);
        }

        if let Some(url) = &self.webhook.url {
            Url::parse(url).map_err(|error| ConfigError::InvalidWebhookUrl {
                url: url.clone(),
                error,
            })?;
        }

        if self.s3.bucket.is_none() {
            warn!("BUCKET_NAME not set. The remote writer will fail if a spec uses dest=remote.");
        }

        Ok(())
    }
}

/// The live configuration, swapped atomically on reload.
pub type SharedConfig = Arc<RwLock<Arc<Config>>>;

/// Snapshot the current configuration.
pub fn current(shared: &SharedConfig) -> Arc<Config> {
    Arc::clone(&shared.read().expect("config lock is never poisoned"))
}

fn trimmed_env(key: &str) -> String {
    std::env::var(key)
        .unwrap_or_default()
        .trim()
        .trim_matches('"')
        .to_owned()
}

fn non_empty_env(key: &str) -> Option<String> {
    let value = trimmed_env(key);
    if value.is_empty() {
        None
    } else {
        Some(value)
    }
}

fn bool_env(key: &str) -> bool {
    matches!(trimmed_env(key).to_lowercase().as_str(), "true" | "1")
}

fn u64_env(key: &str, default: u64) -> u64 {
    let value = trimmed_env(key);
    if value.is_empty() {
        return default;
    }

    match value.parse::<u64>() {
        Ok(parsed) if parsed > 0 => parsed,
        _ => {
            warn!("Invalid {key} value '{value}', using default {default}");
            default
        }
    }
}

fn days(count: u64) -> Duration {
    Duration::from_secs(count * 24 * 60 * 60)
}

#[allow(missing_docs)]
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Invalid CONCURRENT_BACKUP_LIMIT: must be a positive integer")]
    InvalidConcurrencyLimit,

    #[error("Invalid BACKUP_TIMEOUT_MINUTES: must be a positive integer")]
    InvalidBackupTimeout,

    #[error("Invalid ADMIN_LISTEN_ADDR '{0}': must be a socket address")]
    InvalidListenAddr(String),

    #[error("Invalid WEBHOOK_URL '{url}':\n{error}")]
    InvalidWebhookUrl {
        url: String,
        #[source]
        error: url::ParseError,
    },
}
