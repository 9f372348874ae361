//! Configuration module
//!
//! The gateway is configured from a single TOML file with four groups:
//! `[gateway]` (server + dispatch), `[strategy]` (scoring), the health-check
//! defaults nested under `[gateway.health_check_default]`, and the upstream
//! node list `[[nodes]]`. Durations accept human-readable strings ("10s",
//! "500ms"). Unset or non-positive values fall back to the defaults applied
//! in [`Config::normalize`].

use crate::{Error, Result};
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;

/// Main configuration structure
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(default)]
pub struct Config {
    pub gateway: GatewayConfig,
    pub strategy: StrategyConfig,
    #[serde(default)]
    pub nodes: Vec<NodeConfig>,
}

/// Gateway / server configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct GatewayConfig {
    /// Listen address for the data plane (and the admin surface)
    pub listen: String,

    /// Number of SWRR buckets; bounds the per-pick critical section
    pub shards: usize,

    /// Retry count used when the retry block does not override it
    pub max_retries: u32,

    /// Request-body buffering cap in bytes; over-limit requests get a 400
    pub max_body_size: u64,

    /// Allow retrying non-idempotent methods
    pub retry_non_idempotent: bool,

    pub admin_api_enabled: bool,
    pub admin_api_token: String,

    #[serde(with = "humantime_serde")]
    pub read_timeout: Duration,
    #[serde(with = "humantime_serde")]
    pub write_timeout: Duration,
    #[serde(with = "humantime_serde")]
    pub idle_timeout: Duration,
    #[serde(with = "humantime_serde")]
    pub response_header_timeout: Duration,
    #[serde(with = "humantime_serde")]
    pub idle_conn_timeout: Duration,
    #[serde(with = "humantime_serde")]
    pub upstream_timeout: Duration,

    pub max_idle_conns: usize,
    pub max_idle_conns_per_host: usize,
    pub max_conns_per_host: usize,

    pub health_check_default: HealthCheckConfig,

    /// Optional trigger script run against completed upstream responses
    pub trigger_script: String,
    #[serde(with = "humantime_serde")]
    pub trigger_timeout: Duration,
    pub trigger_body_limit: usize,

    pub retry: RetryConfig,
}

impl Default for GatewayConfig {
    fn default() -> Self {
        GatewayConfig {
            listen: String::new(),
            shards: 0,
            max_retries: 0,
            max_body_size: 0,
            retry_non_idempotent: false,
            admin_api_enabled: false,
            admin_api_token: String::new(),
            read_timeout: Duration::ZERO,
            write_timeout: Duration::ZERO,
            idle_timeout: Duration::ZERO,
            response_header_timeout: Duration::ZERO,
            idle_conn_timeout: Duration::ZERO,
            upstream_timeout: Duration::ZERO,
            max_idle_conns: 0,
            max_idle_conns_per_host: 0,
            max_conns_per_host: 0,
            health_check_default: HealthCheckConfig::default(),
            trigger_script: String::new(),
            trigger_timeout: Duration::ZERO,
            trigger_body_limit: 0,
            retry: RetryConfig::default(),
        }
    }
}

/// Retry block
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(default)]
pub struct RetryConfig {
    pub enabled: bool,
    pub enable_post: bool,
    pub max_retries: u32,
    pub retry_on_5xx: bool,
    pub retry_on_error: bool,
    pub retry_on_timeout: bool,
}

/// Scoring strategy configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct StrategyConfig {
    /// Floor for effective weight
    pub min_weight: i32,

    /// Accepted for compatibility with existing deployment files; unused
    pub penalty_factor: f64,

    /// Interval of the effective-weight recovery sweep
    #[serde(with = "humantime_serde")]
    pub recovery_interval: Duration,

    /// Cap on negative passive delta applied within one wall-clock second;
    /// zero or negative disables the cap
    pub max_penalty_per_second: i32,

    pub conn_factor_enabled: bool,
    pub conn_factor_smoothing: i32,
    pub conn_factor_slope: f64,
    pub conn_factor_sync_threshold: f64,
    pub conn_factor_ema_alpha: f64,

    /// Shard by FNV-1a hash of the selection key instead of randomly
    pub hash_shard: bool,
}

impl Default for StrategyConfig {
    fn default() -> Self {
        StrategyConfig {
            min_weight: 0,
            penalty_factor: 0.0,
            recovery_interval: Duration::ZERO,
            max_penalty_per_second: 0,
            conn_factor_enabled: false,
            conn_factor_smoothing: 0,
            conn_factor_slope: 0.0,
            conn_factor_sync_threshold: 0.0,
            conn_factor_ema_alpha: 0.0,
            hash_shard: false,
        }
    }
}

/// Active health-check defaults
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct HealthCheckConfig {
    #[serde(with = "humantime_serde")]
    pub interval: Duration,
    #[serde(with = "humantime_serde")]
    pub timeout: Duration,
    pub script: String,
}

impl Default for HealthCheckConfig {
    fn default() -> Self {
        HealthCheckConfig {
            interval: Duration::ZERO,
            timeout: Duration::ZERO,
            script: String::new(),
        }
    }
}

/// One upstream node
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(default)]
pub struct NodeConfig {
    pub id: String,
    pub address: String,
    pub weight: i32,
    pub check_script: String,
}

impl Config {
    /// Load configuration from a TOML file
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self> {
        let content = std::fs::read_to_string(path)?;
        Self::from_toml(&content)
    }

    /// Load configuration from a TOML string
    pub fn from_toml(content: &str) -> Result<Self> {
        let mut config: Config = toml::from_str(content)?;
        config.normalize();
        config.validate()?;
        Ok(config)
    }

    /// Fill in defaults for unset or non-positive values
    fn normalize(&mut self) {
        let gw = &mut self.gateway;
        if gw.shards == 0 {
            gw.shards = 1;
        }
        if gw.max_body_size == 0 {
            gw.max_body_size = 1 << 20;
        }
        if gw.read_timeout.is_zero() {
            gw.read_timeout = Duration::from_secs(15);
        }
        if gw.write_timeout.is_zero() {
            gw.write_timeout = Duration::from_secs(30);
        }
        if gw.idle_timeout.is_zero() {
            gw.idle_timeout = Duration::from_secs(60);
        }
        if gw.response_header_timeout.is_zero() {
            gw.response_header_timeout = Duration::from_secs(10);
        }
        if gw.idle_conn_timeout.is_zero() {
            gw.idle_conn_timeout = Duration::from_secs(90);
        }
        if gw.upstream_timeout.is_zero() {
            gw.upstream_timeout = Duration::from_secs(5);
        }
        if gw.max_idle_conns == 0 {
            gw.max_idle_conns = 256;
        }
        if gw.max_idle_conns_per_host == 0 {
            gw.max_idle_conns_per_host = 64;
        }
        if gw.retry.max_retries == 0 {
            gw.retry.max_retries = if gw.max_retries > 0 { gw.max_retries } else { 2 };
        }
        if gw.trigger_timeout.is_zero() {
            gw.trigger_timeout = Duration::from_secs(2);
        }
        if gw.trigger_body_limit == 0 {
            gw.trigger_body_limit = 4096;
        }
        if gw.health_check_default.interval.is_zero() {
            gw.health_check_default.interval = Duration::from_secs(10);
        }
        if gw.health_check_default.timeout.is_zero() {
            gw.health_check_default.timeout = Duration::from_secs(2);
        }

        let st = &mut self.strategy;
        if st.min_weight <= 0 {
            st.min_weight = 1;
        }
        if st.max_penalty_per_second < 0 {
            st.max_penalty_per_second = 0;
        }
        if st.conn_factor_smoothing < 0 {
            st.conn_factor_smoothing = 0;
        }
        if st.conn_factor_slope <= 0.0 {
            st.conn_factor_slope = 0.4;
        }
        if st.conn_factor_sync_threshold <= 0.0 {
            st.conn_factor_sync_threshold = 0.5;
        }
        if st.conn_factor_ema_alpha <= 0.0 || st.conn_factor_ema_alpha > 1.0 {
            st.conn_factor_ema_alpha = 0.2;
        }
        if st.recovery_interval.is_zero() {
            st.recovery_interval = Duration::from_secs(10);
        }
    }

    /// Validate configuration
    pub fn validate(&self) -> Result<()> {
        for node in &self.nodes {
            if node.id.is_empty() {
                return Err(Error::config("node id cannot be empty"));
            }
            if node.address.is_empty() {
                return Err(Error::config(format!("node {}: address cannot be empty", node.id)));
            }
            if node.weight < 1 {
                return Err(Error::config(format!(
                    "node {}: weight must be >= 1 (got {})",
                    node.id, node.weight
                )));
            }
        }
        Ok(())
    }
}
