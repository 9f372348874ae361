//! Upstream transport construction
//!
//! Each node owns a round-tripper with its own idle-connection pool, built
//! from the transport-tuning snapshot of the configuration. HTTP/2 is
//! attempted via ALPN; redirects are passed through to the client untouched.

use crate::config::GatewayConfig;
use crate::{Error, Result};
use std::time::Duration;

/// Transport-tuning snapshot derived from the gateway configuration.
#[derive(Debug, Clone)]
pub struct TransportTuning {
    pub upstream_timeout: Duration,
    pub response_header_timeout: Duration,
    pub idle_conn_timeout: Duration,
    pub max_idle_conns: usize,
    pub max_idle_conns_per_host: usize,
    pub max_conns_per_host: usize,
}

impl Default for TransportTuning {
    fn default() -> Self {
        TransportTuning {
            upstream_timeout: Duration::from_secs(5),
            response_header_timeout: Duration::from_secs(10),
            idle_conn_timeout: Duration::from_secs(90),
            max_idle_conns: 256,
            max_idle_conns_per_host: 64,
            max_conns_per_host: 0,
        }
    }
}

impl From<&GatewayConfig> for TransportTuning {
    fn from(gw: &GatewayConfig) -> Self {
        TransportTuning {
            upstream_timeout: gw.upstream_timeout,
            response_header_timeout: gw.response_header_timeout,
            idle_conn_timeout: gw.idle_conn_timeout,
            max_idle_conns: gw.max_idle_conns,
            max_idle_conns_per_host: gw.max_idle_conns_per_host,
            max_conns_per_host: gw.max_conns_per_host,
        }
    }
}

/// Build an upstream client from the tuning snapshot.
///
/// `max_idle_conns` and `max_conns_per_host` have no client-level knob in
/// reqwest; the per-host idle cap is the binding limit.
pub fn build_client(tuning: &TransportTuning) -> Result<reqwest::Client> {
    reqwest::Client::builder()
        .connect_timeout(tuning.upstream_timeout)
        .pool_idle_timeout(tuning.idle_conn_timeout)
        .pool_max_idle_per_host(tuning.max_idle_conns_per_host)
        .tcp_keepalive(Duration::from_secs(30))
        .redirect(reqwest::redirect::Policy::none())
        .build()
        .map_err(|e| Error::config(format!("upstream client: {e}")))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Config;

    #[test]
    fn test_tuning_from_config_defaults() {
        let config = Config::from_toml("").unwrap();
        let tuning = TransportTuning::from(&config.gateway);
        assert_eq!(tuning.upstream_timeout, Duration::from_secs(5));
        assert_eq!(tuning.response_header_timeout, Duration::from_secs(10));
        assert_eq!(tuning.idle_conn_timeout, Duration::from_secs(90));
        assert_eq!(tuning.max_idle_conns_per_host, 64);
    }

    #[test]
    fn test_build_client() {
        assert!(build_client(&TransportTuning::default()).is_ok());
    }
}
