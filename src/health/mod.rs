//! Periodic active health checks
//!
//! One driver task ticks at the configured interval and sweeps every node
//! with a bounded number of concurrent probes. The probe result becomes the
//! node's active score: a node with no script configured is considered
//! fully healthy, a probe timeout scores zero (maximum weight reduction on
//! the next sync), any other probe error leaves the score at full and is
//! logged.

use crate::balance::Balancer;
use crate::script::ScriptHost;
use crate::Error;
use std::path::Path;
use std::sync::Arc;
use tokio::sync::Semaphore;
use tracing::{info, warn};

/// Concurrent probes per sweep
const PROBE_CONCURRENCY: usize = 8;

pub struct HealthChecker {
    balancer: Arc<Balancer>,
    host: Arc<dyn ScriptHost>,
}

impl HealthChecker {
    pub fn new(balancer: Arc<Balancer>, host: Arc<dyn ScriptHost>) -> Self {
        HealthChecker { balancer, host }
    }

    /// Drive periodic sweeps until the task is dropped.
    pub async fn run(self: Arc<Self>) {
        loop {
            let interval = self.balancer.config().gateway.health_check_default.interval;
            tokio::time::sleep(interval).await;
            self.run_once().await;
        }
    }

    /// One full sweep over every node.
    pub async fn run_once(&self) {
        let cfg = self.balancer.config();
        let defaults = cfg.gateway.health_check_default.clone();
        let min_weight = cfg.strategy.min_weight;

        let sem = Arc::new(Semaphore::new(PROBE_CONCURRENCY));
        let mut probes = Vec::new();
        for node in self.balancer.nodes() {
            let permit = match sem.clone().acquire_owned().await {
                Ok(permit) => permit,
                Err(_) => break,
            };
            let host = self.host.clone();
            let defaults = defaults.clone();
            probes.push(tokio::spawn(async move {
                let _permit = permit;
                let script = if node.check_script.is_empty() {
                    defaults.script.clone()
                } else {
                    node.check_script.clone()
                };

                let score = if script.is_empty() {
                    100
                } else {
                    match host.run_health(Path::new(&script), &node.meta(), defaults.timeout).await {
                        Ok(result) => result.score.clamp(0, 100),
                        Err(err @ Error::Timeout(_)) => {
                            warn!(node_id = %node.id, err = %err, "health check timeout");
                            0
                        }
                        Err(err) => {
                            warn!(node_id = %node.id, err = %err, "health check error");
                            100
                        }
                    }
                };

                node.set_active_score(score);
                node.sync_weight(min_weight);
                info!(
                    node_id = %node.id,
                    score,
                    passive = node.passive_score(),
                    active = node.active_score(),
                    "health check complete"
                );
            }));
        }
        for probe in probes {
            let _ = probe.await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Config;
    use crate::script::{
        ConfigView, HealthResult, NodeMeta, RequestMeta, ResponseMeta, TriggerResult,
    };
    use crate::Result;
    use async_trait::async_trait;
    use std::time::Duration;

    struct FixedScoreHost(i32);

    #[async_trait]
    impl ScriptHost for FixedScoreHost {
        async fn run_health(
            &self,
            _script: &Path,
            _node: &NodeMeta,
            _timeout: Duration,
        ) -> Result<HealthResult> {
            Ok(HealthResult { score: self.0, ..HealthResult::default() })
        }

        async fn run_trigger(
            &self,
            _script: &Path,
            _request: &RequestMeta,
            _response: &ResponseMeta,
            _node: &NodeMeta,
            _timeout: Duration,
            _config: &ConfigView,
        ) -> Result<TriggerResult> {
            Ok(TriggerResult::default())
        }
    }

    struct TimeoutHost;

    #[async_trait]
    impl ScriptHost for TimeoutHost {
        async fn run_health(
            &self,
            _script: &Path,
            _node: &NodeMeta,
            _timeout: Duration,
        ) -> Result<HealthResult> {
            Err(Error::timeout("probe deadline"))
        }

        async fn run_trigger(
            &self,
            _script: &Path,
            _request: &RequestMeta,
            _response: &ResponseMeta,
            _node: &NodeMeta,
            _timeout: Duration,
            _config: &ConfigView,
        ) -> Result<TriggerResult> {
            Ok(TriggerResult::default())
        }
    }

    fn balancer_with_script(script: &str) -> Arc<Balancer> {
        let toml = format!(
            r#"
[gateway]
listen = "127.0.0.1:0"

[gateway.health_check_default]
script = "{script}"

[[nodes]]
id = "a"
address = "http://127.0.0.1:9001"
weight = 100
"#
        );
        Arc::new(Balancer::new(Config::from_toml(&toml).unwrap()).unwrap())
    }

    #[tokio::test]
    async fn test_probe_sets_active_score() {
        let balancer = balancer_with_script("check.sh");
        let checker = HealthChecker::new(balancer.clone(), Arc::new(FixedScoreHost(40)));
        checker.run_once().await;
        let node = balancer.node_by_address("http://127.0.0.1:9001").unwrap();
        assert_eq!(node.active_score(), 40);
        // weight snapped down to the active score immediately
        assert_eq!(node.effective_weight(), 40);
    }

    #[tokio::test]
    async fn test_probe_score_clamped() {
        let balancer = balancer_with_script("check.sh");
        let checker = HealthChecker::new(balancer.clone(), Arc::new(FixedScoreHost(900)));
        checker.run_once().await;
        let node = balancer.node_by_address("http://127.0.0.1:9001").unwrap();
        assert_eq!(node.active_score(), 100);
    }

    #[tokio::test]
    async fn test_no_script_means_healthy() {
        let balancer = balancer_with_script("");
        let node = balancer.node_by_address("http://127.0.0.1:9001").unwrap();
        node.set_active_score(10);
        let checker = HealthChecker::new(balancer.clone(), Arc::new(FixedScoreHost(0)));
        checker.run_once().await;
        assert_eq!(node.active_score(), 100);
    }

    #[tokio::test]
    async fn test_timeout_scores_zero() {
        let balancer = balancer_with_script("check.sh");
        let checker = HealthChecker::new(balancer.clone(), Arc::new(TimeoutHost));
        checker.run_once().await;
        let node = balancer.node_by_address("http://127.0.0.1:9001").unwrap();
        assert_eq!(node.active_score(), 0);
        assert_eq!(node.effective_weight(), 1);
    }
}
