//! Script host boundary
//!
//! The scoring core never interprets scripts itself; it hands node, request
//! and response context to an opaque [`ScriptHost`] and consumes the
//! [`HealthResult`] / [`TriggerResult`] contracts. Hosts must honor the
//! given timeout and return within twice of it in the worst case. A host
//! error never mutates scoring state.

mod command;

pub use command::CommandScriptHost;

use crate::config::Config;
use crate::Result;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::Path;
use std::time::Duration;

/// Node identity as seen by scripts.
#[derive(Debug, Clone, Serialize)]
pub struct NodeMeta {
    pub id: String,
    pub address: String,
    pub weight: i32,
}

/// Request context handed to the trigger.
#[derive(Debug, Clone, Serialize)]
pub struct RequestMeta {
    pub method: String,
    pub path: String,
    pub headers: HashMap<String, String>,
}

/// Response context handed to the trigger.
#[derive(Debug, Clone, Serialize)]
pub struct ResponseMeta {
    pub status: u16,
    pub body: String,
}

/// Strategy values exposed to trigger scripts.
#[derive(Debug, Clone, Serialize)]
pub struct ConfigView {
    pub min_weight: i32,
    pub max_penalty_per_second: i32,
    pub trigger_body_limit: usize,
}

impl ConfigView {
    pub fn from_config(cfg: &Config) -> Self {
        ConfigView {
            min_weight: cfg.strategy.min_weight,
            max_penalty_per_second: cfg.strategy.max_penalty_per_second,
            trigger_body_limit: cfg.gateway.trigger_body_limit,
        }
    }
}

/// Outcome of an active health probe.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct HealthResult {
    pub score: i32,
    pub status: String,
    pub message: String,
    pub labels: HashMap<String, String>,
}

impl Default for HealthResult {
    fn default() -> Self {
        HealthResult {
            score: 100,
            status: "healthy".to_string(),
            message: String::new(),
            labels: HashMap::new(),
        }
    }
}

/// Outcome of a trigger invocation. Absent fields mean "no action".
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct TriggerResult {
    pub score: Option<i32>,
    pub penalty: Option<i32>,
    pub reward: Option<i32>,
    pub retry: Option<bool>,
    pub message: Option<String>,
}

/// Boundary to the external scripting collaborator.
#[async_trait]
pub trait ScriptHost: Send + Sync {
    /// Run a health probe script for one node.
    async fn run_health(
        &self,
        script: &Path,
        node: &NodeMeta,
        timeout: Duration,
    ) -> Result<HealthResult>;

    /// Run the trigger against a completed upstream response.
    async fn run_trigger(
        &self,
        script: &Path,
        request: &RequestMeta,
        response: &ResponseMeta,
        node: &NodeMeta,
        timeout: Duration,
        config: &ConfigView,
    ) -> Result<TriggerResult>;
}
