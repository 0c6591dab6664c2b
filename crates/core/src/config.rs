use serde::Deserialize;

use crate::error::{OutreachError, OutreachResult};

/// Root application configuration. Loaded from environment variables
/// with the prefix `OUTREACH__` and an optional TOML config file.
#[derive(Debug, Clone, Deserialize)]
pub struct AppConfig {
    #[serde(default = "default_node_id")]
    pub node_id: String,
    #[serde(default)]
    pub scheduler: SchedulerConfig,
    #[serde(default)]
    pub timeouts: TimeoutConfig,
    #[serde(default)]
    pub retention: RetentionConfig,
    #[serde(default)]
    pub engine: EngineConfig,
}

/// Poller and A/B evaluator cadence.
#[derive(Debug, Clone, Deserialize)]
pub struct SchedulerConfig {
    #[serde(default = "default_poll_interval_secs")]
    pub poll_interval_secs: u64,
    #[serde(default = "default_batch_size")]
    pub batch_size: usize,
    #[serde(default = "default_max_concurrency")]
    pub max_concurrency: usize,
    #[serde(default = "default_max_hops_per_tick")]
    pub max_hops_per_tick: u32,
    #[serde(default = "default_ab_evaluation_interval_secs")]
    pub ab_evaluation_interval_secs: u64,
}

/// Independent per-collaborator call budgets.
#[derive(Debug, Clone, Deserialize)]
pub struct TimeoutConfig {
    #[serde(default = "default_mail_ms")]
    pub mail_ms: u64,
    #[serde(default = "default_webhook_ms")]
    pub webhook_ms: u64,
    #[serde(default = "default_task_ms")]
    pub task_ms: u64,
    #[serde(default = "default_notification_ms")]
    pub notification_ms: u64,
    #[serde(default = "default_contact_ms")]
    pub contact_ms: u64,
}

#[derive(Debug, Clone, Deserialize)]
pub struct RetentionConfig {
    #[serde(default = "default_activity_days")]
    pub activity_days: u32,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct EngineConfig {
    /// Seed for the variant selector; unset means OS entropy.
    #[serde(default)]
    pub rng_seed: Option<u64>,
    /// Consecutive handler failures before an enrollment is exited.
    /// Unset keeps retrying on every due tick.
    #[serde(default)]
    pub max_step_failures: Option<u32>,
}

// Default functions
fn default_node_id() -> String {
    "node-01".to_string()
}
fn default_poll_interval_secs() -> u64 {
    60
}
fn default_batch_size() -> usize {
    500
}
fn default_max_concurrency() -> usize {
    16
}
fn default_max_hops_per_tick() -> u32 {
    16
}
fn default_ab_evaluation_interval_secs() -> u64 {
    300
}
fn default_mail_ms() -> u64 {
    10_000
}
fn default_webhook_ms() -> u64 {
    5_000
}
fn default_task_ms() -> u64 {
    5_000
}
fn default_notification_ms() -> u64 {
    5_000
}
fn default_contact_ms() -> u64 {
    3_000
}
fn default_activity_days() -> u32 {
    365
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            poll_interval_secs: default_poll_interval_secs(),
            batch_size: default_batch_size(),
            max_concurrency: default_max_concurrency(),
            max_hops_per_tick: default_max_hops_per_tick(),
            ab_evaluation_interval_secs: default_ab_evaluation_interval_secs(),
        }
    }
}

impl Default for TimeoutConfig {
    fn default() -> Self {
        Self {
            mail_ms: default_mail_ms(),
            webhook_ms: default_webhook_ms(),
            task_ms: default_task_ms(),
            notification_ms: default_notification_ms(),
            contact_ms: default_contact_ms(),
        }
    }
}

impl Default for RetentionConfig {
    fn default() -> Self {
        Self {
            activity_days: default_activity_days(),
        }
    }
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            node_id: default_node_id(),
            scheduler: SchedulerConfig::default(),
            timeouts: TimeoutConfig::default(),
            retention: RetentionConfig::default(),
            engine: EngineConfig::default(),
        }
    }
}

impl AppConfig {
    /// Load configuration from environment variables and optional config file.
    /// Environment values win over the file.
    pub fn load(path: Option<&str>) -> OutreachResult<Self> {
        let mut builder = config::Config::builder();
        if let Some(path) = path {
            builder = builder.add_source(config::File::with_name(path).required(true));
        }
        let builder = builder.add_source(
            config::Environment::with_prefix("OUTREACH")
                .separator("__")
                .try_parsing(true)
                .list_separator(","),
        );

        builder
            .build()
            .and_then(|config| config.try_deserialize())
            .map_err(|e| OutreachError::Config(e.to_string()))
    }
}
