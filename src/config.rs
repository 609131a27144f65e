use config::{Config, ConfigError, Environment, File};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;

#[derive(Debug, Deserialize, Serialize, Clone)]
pub struct Settings {
    pub server: ServerConfig,
    pub logging: LoggingConfig,
    pub upstream: UpstreamConfig,
    pub rate_limit: RateLimitConfig,
    pub session: SessionConfig,
    pub pools: PoolConfig,
    pub jobs: JobConfig,
    pub migration: MigrationConfig,
}

#[derive(Debug, Deserialize, Serialize, Clone)]
pub struct ServerConfig {
    pub http_port: u16,
    pub http_host: String,
    pub allowed_origin: String,
    pub body_limit_bytes: usize,
    pub multipart_limit_bytes: usize,
}

#[derive(Debug, Deserialize, Serialize, Clone)]
pub struct LoggingConfig {
    pub level: String,
}

#[derive(Debug, Deserialize, Serialize, Clone)]
pub struct UpstreamConfig {
    /// Pre-filled base URL offered to the login form; sessions may override.
    pub default_base_url: String,
    pub max_retries: u32,
    pub backoff_base_ms: u64,
    pub backoff_cap_ms: u64,
    pub call_timeout_secs: u64,
    /// Archive downloads and other long transfers through the proxy.
    pub long_call_timeout_secs: u64,
    /// Courtesy pause between successive calls per bulk worker. Supplements
    /// the token bucket, does not replace it.
    pub api_delay_ms: u64,
}

#[derive(Debug, Deserialize, Serialize, Clone)]
pub struct RateLimitConfig {
    pub capacity: f64,
    pub refill_per_sec: f64,
}

#[derive(Debug, Deserialize, Serialize, Clone)]
pub struct SessionConfig {
    pub idle_ttl_secs: u64,
    pub sweep_interval_secs: u64,
    /// Coarse per-session gateway limit: request_limit per request_window_secs.
    pub request_limit: u32,
    pub request_window_secs: u64,
}

#[derive(Debug, Deserialize, Serialize, Clone)]
pub struct PoolConfig {
    pub bulk_workers: usize,
    pub migration_workers: usize,
}

#[derive(Debug, Deserialize, Serialize, Clone)]
pub struct JobConfig {
    pub job_grace_secs: u64,
    pub topic_grace_secs: u64,
    /// Progress bus per-topic ring size.
    pub ring_capacity: usize,
    /// Progress bus per-subscriber live queue size.
    pub subscriber_capacity: usize,
    /// Per-job item result ring size.
    pub result_ring: usize,
    pub max_plan_items: usize,
    pub bulk_deadline_secs: u64,
    pub migration_deadline_secs: u64,
    pub drain_secs: u64,
}

#[derive(Debug, Deserialize, Serialize, Clone)]
pub struct MigrationConfig {
    /// Root under which per-job workspaces are created. Tilde expanded.
    pub workspace_root: String,
    /// Lines of bridge output kept per job for client display.
    pub log_ring: usize,
}

impl Settings {
    pub fn new() -> Result<Self, ConfigError> {
        let config = Config::builder()
            // Start with default values
            .set_default("server.http_port", 7700)?
            .set_default("server.http_host", "127.0.0.1")?
            .set_default("server.allowed_origin", "http://localhost:5173")?
            .set_default("server.body_limit_bytes", 1024 * 1024)?
            .set_default("server.multipart_limit_bytes", 32 * 1024 * 1024)?
            .set_default("logging.level", "info")?
            .set_default("upstream.default_base_url", "https://gitlab.com")?
            .set_default("upstream.max_retries", 3)?
            .set_default("upstream.backoff_base_ms", 200)?
            .set_default("upstream.backoff_cap_ms", 5000)?
            .set_default("upstream.call_timeout_secs", 30)?
            .set_default("upstream.long_call_timeout_secs", 600)?
            .set_default("upstream.api_delay_ms", 200)?
            .set_default("rate_limit.capacity", 10.0)?
            .set_default("rate_limit.refill_per_sec", 5.0)?
            .set_default("session.idle_ttl_secs", 30 * 60)?
            .set_default("session.sweep_interval_secs", 5 * 60)?
            .set_default("session.request_limit", 100)?
            .set_default("session.request_window_secs", 15 * 60)?
            .set_default("pools.bulk_workers", 5)?
            .set_default("pools.migration_workers", 2)?
            .set_default("jobs.job_grace_secs", 60 * 60)?
            .set_default("jobs.topic_grace_secs", 5 * 60)?
            .set_default("jobs.ring_capacity", 128)?
            .set_default("jobs.subscriber_capacity", 64)?
            .set_default("jobs.result_ring", 10_000)?
            .set_default("jobs.max_plan_items", 10_000)?
            .set_default("jobs.bulk_deadline_secs", 30 * 60)?
            .set_default("jobs.migration_deadline_secs", 2 * 60 * 60)?
            .set_default("jobs.drain_secs", 15)?
            .set_default("migration.workspace_root", "")?
            .set_default("migration.log_ring", 200)?
            // Add config file if it exists
            .add_source(File::with_name("config").required(false))
            // Add environment variables with prefix GITFLEET_
            // e.g., GITFLEET_SERVER__HTTP_PORT=8080
            .add_source(Environment::with_prefix("GITFLEET").separator("__"))
            .build()?;

        config.try_deserialize()
    }

    pub fn http_addr(&self) -> String {
        format!("{}:{}", self.server.http_host, self.server.http_port)
    }

    /// Resolved workspace root: the configured path (tilde expanded) or the
    /// OS temp dir when unset.
    pub fn workspace_root(&self) -> PathBuf {
        if self.migration.workspace_root.is_empty() {
            std::env::temp_dir()
        } else {
            PathBuf::from(shellexpand::tilde(&self.migration.workspace_root).into_owned())
        }
    }
}

impl Default for Settings {
    fn default() -> Self {
        Self::new().expect("Failed to load default settings")
    }
}
