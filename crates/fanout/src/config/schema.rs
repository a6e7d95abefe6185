use std::path::PathBuf;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::completion::openai::DEFAULT_BASE_URL;
use crate::secrets::SecretSource;
use crate::splitter::DEFAULT_DPI;

pub const CONFIG_VERSION: &str = "1.0";

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EngineConfig {
    pub version: String,
    /// SQLite file. Defaults to `~/.fanout/data/fanout.db`.
    #[serde(default)]
    pub database_path: Option<PathBuf>,
    #[serde(default = "default_worker_count")]
    pub worker_count: usize,
    /// Buffered unit notifications per subscriber.
    #[serde(default = "default_notification_capacity")]
    pub notification_capacity: usize,
    #[serde(default)]
    pub completion: CompletionConfig,
    #[serde(default)]
    pub retry: RetryConfig,
    #[serde(default)]
    pub sweeper: SweeperConfig,
    #[serde(default)]
    pub leases: LeaseConfig,
    #[serde(default)]
    pub cache: CacheConfig,
    #[serde(default)]
    pub splitter: SplitterConfig,
    #[serde(default)]
    pub log_format: LogFormat,
}

fn default_worker_count() -> usize {
    num_cpus::get()
}

fn default_notification_capacity() -> usize {
    256
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            version: CONFIG_VERSION.to_string(),
            database_path: None,
            worker_count: default_worker_count(),
            notification_capacity: default_notification_capacity(),
            completion: CompletionConfig::default(),
            retry: RetryConfig::default(),
            sweeper: SweeperConfig::default(),
            leases: LeaseConfig::default(),
            cache: CacheConfig::default(),
            splitter: SplitterConfig::default(),
            log_format: LogFormat::default(),
        }
    }
}

impl EngineConfig {
    /// The unit lease must outlive the completion call it guards.
    pub fn unit_lease(&self) -> Duration {
        match self.leases.unit_lease_secs {
            Some(secs) => Duration::from_secs(secs),
            None => Duration::from_secs(self.completion.timeout_secs + 30),
        }
    }

    pub fn job_lease(&self) -> Duration {
        Duration::from_secs(self.leases.job_lease_secs)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CompletionConfig {
    #[serde(default = "default_base_url")]
    pub base_url: String,
    #[serde(flatten)]
    pub api_key: SecretSource,
    #[serde(default = "default_model")]
    pub default_model: String,
    #[serde(default = "default_max_tokens")]
    pub max_tokens: u32,
    #[serde(default = "default_timeout_secs")]
    pub timeout_secs: u64,
}

fn default_base_url() -> String {
    DEFAULT_BASE_URL.to_string()
}

fn default_model() -> String {
    "gpt-4o-mini".to_string()
}

fn default_max_tokens() -> u32 {
    500
}

fn default_timeout_secs() -> u64 {
    60
}

impl Default for CompletionConfig {
    fn default() -> Self {
        Self {
            base_url: default_base_url(),
            api_key: SecretSource::default(),
            default_model: default_model(),
            max_tokens: default_max_tokens(),
            timeout_secs: default_timeout_secs(),
        }
    }
}

impl CompletionConfig {
    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct RetryConfig {
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
    #[serde(default = "default_retry_delay_secs")]
    pub retry_delay_secs: u64,
}

fn default_max_retries() -> u32 {
    1
}

fn default_retry_delay_secs() -> u64 {
    10
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_retries: default_max_retries(),
            retry_delay_secs: default_retry_delay_secs(),
        }
    }
}

impl RetryConfig {
    pub fn retry_delay(&self) -> Duration {
        Duration::from_secs(self.retry_delay_secs)
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct SweeperConfig {
    #[serde(default = "default_true")]
    pub enabled: bool,
    #[serde(default = "default_sweep_interval_secs")]
    pub interval_secs: u64,
    /// Lifetime of the cluster-wide sweep flag.
    #[serde(default = "default_lock_ttl_secs")]
    pub lock_ttl_secs: u64,
    /// How long a unit may sit in PENDING before it counts as orphaned.
    #[serde(default = "default_pending_grace_secs")]
    pub pending_grace_secs: u64,
    /// How long an IN_PROGRESS unit or job may go untouched before it counts
    /// as abandoned.
    #[serde(default = "default_stale_after_secs")]
    pub stale_after_secs: u64,
    /// Items re-enqueued per sweep category per tick.
    #[serde(default = "default_batch_limit")]
    pub batch_limit: u64,
}

fn default_true() -> bool {
    true
}

fn default_sweep_interval_secs() -> u64 {
    300
}

fn default_lock_ttl_secs() -> u64 {
    60
}

fn default_pending_grace_secs() -> u64 {
    300
}

fn default_stale_after_secs() -> u64 {
    900
}

fn default_batch_limit() -> u64 {
    100
}

impl Default for SweeperConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            interval_secs: default_sweep_interval_secs(),
            lock_ttl_secs: default_lock_ttl_secs(),
            pending_grace_secs: default_pending_grace_secs(),
            stale_after_secs: default_stale_after_secs(),
            batch_limit: default_batch_limit(),
        }
    }
}

impl SweeperConfig {
    pub fn interval(&self) -> Duration {
        Duration::from_secs(self.interval_secs)
    }

    pub fn lock_ttl(&self) -> Duration {
        Duration::from_secs(self.lock_ttl_secs)
    }

    pub fn pending_grace(&self) -> Duration {
        Duration::from_secs(self.pending_grace_secs)
    }

    pub fn stale_after(&self) -> Duration {
        Duration::from_secs(self.stale_after_secs)
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct LeaseConfig {
    #[serde(default = "default_job_lease_secs")]
    pub job_lease_secs: u64,
    /// Defaults to the completion timeout plus 30 seconds.
    #[serde(default)]
    pub unit_lease_secs: Option<u64>,
}

fn default_job_lease_secs() -> u64 {
    30
}

impl Default for LeaseConfig {
    fn default() -> Self {
        Self {
            job_lease_secs: default_job_lease_secs(),
            unit_lease_secs: None,
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct CacheConfig {
    #[serde(default = "default_job_ttl_secs")]
    pub job_ttl_secs: u64,
}

fn default_job_ttl_secs() -> u64 {
    300
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            job_ttl_secs: default_job_ttl_secs(),
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct SplitterConfig {
    /// Resolution of rendered PDF pages in image mode.
    #[serde(default = "default_dpi")]
    pub pdf_dpi: u32,
}

fn default_dpi() -> u32 {
    DEFAULT_DPI
}

impl Default for SplitterConfig {
    fn default() -> Self {
        Self {
            pdf_dpi: DEFAULT_DPI,
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    #[default]
    Text,
    Json,
}
