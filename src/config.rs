use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{bail, Context, Result};
use serde::Deserialize;

/// Top-level configuration for the insightd agent.
#[derive(Debug, Deserialize)]
pub struct Config {
    /// Logging verbosity (debug, info, warn, error). Default: "info".
    #[serde(default = "default_log_level")]
    pub log_level: String,

    /// SQLite database configuration.
    #[serde(default)]
    pub database: DatabaseConfig,

    /// Queue carrying TEST_PAPER_GENERATED events.
    #[serde(default)]
    pub test_paper_queue: QueueConfig,

    /// Queue carrying QUESTION_ASKED events.
    #[serde(default)]
    pub question_queue: QueueConfig,

    /// Consumer loop behavior, shared by both queues.
    #[serde(default)]
    pub consumer: ConsumerConfig,

    /// Activity heartbeat and counter sync configuration.
    #[serde(default)]
    pub activity: ActivityConfig,

    /// Raw-event retention before compaction.
    #[serde(default)]
    pub rollup: RollupConfig,

    /// HTTP server for heartbeats, health, and metrics.
    #[serde(default)]
    pub server: ServerConfig,

    /// Account-service plan lookups.
    #[serde(default)]
    pub plan: PlanConfig,
}

/// SQLite database configuration.
#[derive(Debug, Deserialize)]
pub struct DatabaseConfig {
    /// Path of the database file. Default: "insightd.db".
    #[serde(default = "default_database_path")]
    pub path: PathBuf,
}

/// One queue endpoint.
#[derive(Debug, Default, Clone, Deserialize)]
pub struct QueueConfig {
    /// Queue service HTTP endpoint (e.g., "http://localhost:4566").
    #[serde(default)]
    pub endpoint: String,

    /// Full queue URL passed to the queue API.
    #[serde(default)]
    pub queue_url: String,

    /// Request timeout. Default: 30s (must exceed the long-poll wait).
    #[serde(default = "default_queue_timeout", with = "humantime_serde")]
    pub timeout: Duration,
}

/// Consumer loop behavior.
#[derive(Debug, Clone, Deserialize)]
pub struct ConsumerConfig {
    /// Maximum messages per receive call. Default: 10.
    #[serde(default = "default_max_messages")]
    pub max_messages: usize,

    /// Long-poll wait per receive call. Default: 20s.
    #[serde(default = "default_wait_time", with = "humantime_serde")]
    pub wait_time: Duration,

    /// Pause after a transport error. Default: 5s.
    #[serde(default = "default_error_backoff", with = "humantime_serde")]
    pub error_backoff: Duration,
}

/// Activity heartbeat and counter sync configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct ActivityConfig {
    /// Seconds credited per heartbeat. Default: 30s.
    #[serde(default = "default_heartbeat_quantum", with = "humantime_serde")]
    pub heartbeat_quantum: Duration,

    /// Counter key TTL. Default: 48h. Must be at least twice the sync
    /// interval or counters can expire between syncs.
    #[serde(default = "default_counter_ttl", with = "humantime_serde")]
    pub counter_ttl: Duration,

    /// How often counters are mirrored into daily_activity. Default: 5m.
    #[serde(default = "default_sync_interval", with = "humantime_serde")]
    pub sync_interval: Duration,

    /// Counter keys per sync page. Default: 500.
    #[serde(default = "default_sync_page_size")]
    pub sync_page_size: usize,

    /// Weekly-rollup rows per upsert batch. Default: 200.
    #[serde(default = "default_weekly_batch_size")]
    pub weekly_batch_size: usize,

    /// Daily rows per retention delete chunk. Default: 500.
    #[serde(default = "default_prune_chunk_size")]
    pub prune_chunk_size: usize,
}

/// Raw-event retention before compaction.
#[derive(Debug, Clone, Deserialize)]
pub struct RollupConfig {
    /// Test-paper rows younger than this survive the monthly rollup.
    /// Default: 30d.
    #[serde(default = "default_test_paper_retention", with = "humantime_serde")]
    pub test_paper_retention: Duration,

    /// Question rows younger than this survive the weekly rollup.
    /// Default: 7d.
    #[serde(default = "default_question_retention", with = "humantime_serde")]
    pub question_retention: Duration,
}

/// HTTP server configuration.
#[derive(Debug, Deserialize)]
pub struct ServerConfig {
    /// Listen address. Default: ":8080".
    #[serde(default = "default_server_addr")]
    pub addr: String,
}

/// Account-service plan lookup configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct PlanConfig {
    /// Account service base URL. Empty disables lookups (all feature
    /// checks fail closed).
    #[serde(default)]
    pub endpoint: String,

    /// Request timeout. Default: 5s.
    #[serde(default = "default_plan_timeout", with = "humantime_serde")]
    pub timeout: Duration,

    /// Plan-details cache TTL. Default: 1h.
    #[serde(default = "default_plan_cache_ttl", with = "humantime_serde")]
    pub cache_ttl: Duration,
}

// --- Default value functions ---

fn default_log_level() -> String {
    "info".to_string()
}

fn default_database_path() -> PathBuf {
    PathBuf::from("insightd.db")
}

fn default_queue_timeout() -> Duration {
    Duration::from_secs(30)
}

fn default_max_messages() -> usize {
    10
}

fn default_wait_time() -> Duration {
    Duration::from_secs(20)
}

fn default_error_backoff() -> Duration {
    Duration::from_secs(5)
}

fn default_heartbeat_quantum() -> Duration {
    Duration::from_secs(30)
}

fn default_counter_ttl() -> Duration {
    Duration::from_secs(48 * 60 * 60)
}

fn default_sync_interval() -> Duration {
    Duration::from_secs(5 * 60)
}

fn default_sync_page_size() -> usize {
    500
}

fn default_weekly_batch_size() -> usize {
    200
}

fn default_prune_chunk_size() -> usize {
    500
}

fn default_test_paper_retention() -> Duration {
    Duration::from_secs(30 * 24 * 60 * 60)
}

fn default_question_retention() -> Duration {
    Duration::from_secs(7 * 24 * 60 * 60)
}

fn default_server_addr() -> String {
    ":8080".to_string()
}

fn default_plan_timeout() -> Duration {
    Duration::from_secs(5)
}

fn default_plan_cache_ttl() -> Duration {
    Duration::from_secs(60 * 60)
}

// --- Default trait impls ---

impl Default for Config {
    fn default() -> Self {
        Self {
            log_level: default_log_level(),
            database: DatabaseConfig::default(),
            test_paper_queue: QueueConfig::default(),
            question_queue: QueueConfig::default(),
            consumer: ConsumerConfig::default(),
            activity: ActivityConfig::default(),
            rollup: RollupConfig::default(),
            server: ServerConfig::default(),
            plan: PlanConfig::default(),
        }
    }
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self {
            path: default_database_path(),
        }
    }
}

impl Default for ConsumerConfig {
    fn default() -> Self {
        Self {
            max_messages: default_max_messages(),
            wait_time: default_wait_time(),
            error_backoff: default_error_backoff(),
        }
    }
}

impl Default for ActivityConfig {
    fn default() -> Self {
        Self {
            heartbeat_quantum: default_heartbeat_quantum(),
            counter_ttl: default_counter_ttl(),
            sync_interval: default_sync_interval(),
            sync_page_size: default_sync_page_size(),
            weekly_batch_size: default_weekly_batch_size(),
            prune_chunk_size: default_prune_chunk_size(),
        }
    }
}

impl Default for RollupConfig {
    fn default() -> Self {
        Self {
            test_paper_retention: default_test_paper_retention(),
            question_retention: default_question_retention(),
        }
    }
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            addr: default_server_addr(),
        }
    }
}

impl Default for PlanConfig {
    fn default() -> Self {
        Self {
            endpoint: String::new(),
            timeout: default_plan_timeout(),
            cache_ttl: default_plan_cache_ttl(),
        }
    }
}

// --- Validation and loading ---

impl Config {
    /// Load configuration from a YAML file.
    pub fn load(path: &Path) -> Result<Self> {
        let data = std::fs::read_to_string(path)
            .with_context(|| format!("reading config file {}", path.display()))?;

        let cfg: Config = serde_yaml::from_str(&data)
            .with_context(|| format!("parsing config file {}", path.display()))?;

        cfg.validate()?;

        Ok(cfg)
    }

    /// Validate the configuration for required fields and consistency.
    pub fn validate(&self) -> Result<()> {
        if self.database.path.as_os_str().is_empty() {
            bail!("database.path is required");
        }

        for (name, queue) in [
            ("test_paper_queue", &self.test_paper_queue),
            ("question_queue", &self.question_queue),
        ] {
            if queue.endpoint.is_empty() {
                bail!("{name}.endpoint is required");
            }
            if queue.queue_url.is_empty() {
                bail!("{name}.queue_url is required");
            }
            if queue.timeout <= self.consumer.wait_time {
                bail!("{name}.timeout must exceed consumer.wait_time");
            }
        }

        if self.consumer.max_messages == 0 {
            bail!("consumer.max_messages must be positive");
        }

        if self.activity.sync_interval.is_zero() {
            bail!("activity.sync_interval must be positive");
        }
        if self.activity.counter_ttl < self.activity.sync_interval * 2 {
            bail!("activity.counter_ttl must be at least twice activity.sync_interval");
        }
        if self.activity.heartbeat_quantum.is_zero() {
            bail!("activity.heartbeat_quantum must be positive");
        }
        if self.activity.sync_page_size == 0 {
            bail!("activity.sync_page_size must be positive");
        }
        if self.activity.weekly_batch_size == 0 {
            bail!("activity.weekly_batch_size must be positive");
        }
        if self.activity.prune_chunk_size == 0 {
            bail!("activity.prune_chunk_size must be positive");
        }

        if self.rollup.test_paper_retention.is_zero() {
            bail!("rollup.test_paper_retention must be positive");
        }
        if self.rollup.question_retention.is_zero() {
            bail!("rollup.question_retention must be positive");
        }

        if self.server.addr.is_empty() {
            bail!("server.addr is required");
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn valid_yaml() -> &'static str {
        r#"
database:
  path: /tmp/insightd-test.db
test_paper_queue:
  endpoint: http://localhost:4566
  queue_url: http://localhost:4566/000000000000/test-papers
question_queue:
  endpoint: http://localhost:4566
  queue_url: http://localhost:4566/000000000000/questions
"#
    }

    #[test]
    fn test_defaults() {
        let cfg = Config::default();
        assert_eq!(cfg.log_level, "info");
        assert_eq!(cfg.consumer.max_messages, 10);
        assert_eq!(cfg.consumer.wait_time, Duration::from_secs(20));
        assert_eq!(cfg.consumer.error_backoff, Duration::from_secs(5));
        assert_eq!(cfg.activity.heartbeat_quantum, Duration::from_secs(30));
        assert_eq!(cfg.activity.counter_ttl, Duration::from_secs(48 * 3600));
        assert_eq!(cfg.activity.sync_interval, Duration::from_secs(300));
        assert_eq!(
            cfg.rollup.test_paper_retention,
            Duration::from_secs(30 * 24 * 3600)
        );
        assert_eq!(
            cfg.rollup.question_retention,
            Duration::from_secs(7 * 24 * 3600)
        );
        assert_eq!(cfg.server.addr, ":8080");
        assert_eq!(cfg.plan.cache_ttl, Duration::from_secs(3600));
    }

    #[test]
    fn test_parse_minimal_yaml() {
        let cfg: Config = serde_yaml::from_str(valid_yaml()).expect("parses");
        cfg.validate().expect("valid");
        assert_eq!(
            cfg.test_paper_queue.queue_url,
            "http://localhost:4566/000000000000/test-papers"
        );
        // Unspecified sections pick up defaults.
        assert_eq!(cfg.activity.sync_page_size, 500);
    }

    #[test]
    fn test_parse_humantime_durations() {
        let yaml = format!(
            "{}consumer:\n  wait_time: 10s\nactivity:\n  counter_ttl: 24h\n  sync_interval: 1m\n",
            valid_yaml()
        );
        let cfg: Config = serde_yaml::from_str(&yaml).expect("parses");
        assert_eq!(cfg.consumer.wait_time, Duration::from_secs(10));
        assert_eq!(cfg.activity.counter_ttl, Duration::from_secs(24 * 3600));
        assert_eq!(cfg.activity.sync_interval, Duration::from_secs(60));
    }

    #[test]
    fn test_validate_requires_queue_endpoints() {
        let cfg = Config::default();
        let err = cfg.validate().expect_err("empty endpoints rejected");
        assert!(err.to_string().contains("endpoint"));
    }

    #[test]
    fn test_validate_ttl_versus_sync_interval() {
        let yaml = format!(
            "{}activity:\n  counter_ttl: 5m\n  sync_interval: 5m\n",
            valid_yaml()
        );
        let cfg: Config = serde_yaml::from_str(&yaml).expect("parses");
        let err = cfg.validate().expect_err("ttl below 2x interval rejected");
        assert!(err.to_string().contains("counter_ttl"));
    }

    #[test]
    fn test_validate_timeout_versus_wait_time() {
        let yaml = format!("{}consumer:\n  wait_time: 40s\n", valid_yaml());
        let cfg: Config = serde_yaml::from_str(&yaml).expect("parses");
        let err = cfg.validate().expect_err("wait beyond timeout rejected");
        assert!(err.to_string().contains("timeout"));
    }
}
