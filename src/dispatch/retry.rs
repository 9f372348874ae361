//! Retry classification
//!
//! Errors are classified rather than typed through the stack: the dispatch
//! loop asks two questions per failed attempt — may this error be retried
//! under the current retry block, and how much passive-score penalty does
//! it cost the node.

use crate::config::{GatewayConfig, RetryConfig};
use crate::Error;
use http::Method;

/// Derive the effective retry count for one request.
///
/// `retry.max_retries` overrides the gateway-level count when positive; a
/// disabled retry block forces zero, as does a non-idempotent method unless
/// POST retries or non-idempotent retries are switched on.
pub fn effective_max_retries(method: &Method, gw: &GatewayConfig) -> u32 {
    let mut max_retries = gw.max_retries;
    if gw.retry.max_retries > 0 {
        max_retries = gw.retry.max_retries;
    }
    if !gw.retry.enabled {
        max_retries = 0;
    }
    if !gw.retry.enable_post && !gw.retry_non_idempotent && !is_retryable_method(method) {
        max_retries = 0;
    }
    max_retries
}

pub fn is_retryable_method(method: &Method) -> bool {
    matches!(*method, Method::GET | Method::HEAD | Method::OPTIONS | Method::TRACE)
}

pub fn should_retry(err: &Error, retry: &RetryConfig) -> bool {
    if !retry.enabled {
        return false;
    }
    match err {
        Error::Timeout(_) => retry.retry_on_timeout,
        Error::Connection(_) => retry.retry_on_error,
        Error::UpstreamStatus(_) => retry.retry_on_5xx,
        _ => retry.retry_on_error,
    }
}

pub fn retry_reason(err: &Error) -> &'static str {
    match err {
        Error::Timeout(_) => "timeout",
        Error::Connection(_) => "conn_error",
        Error::UpstreamStatus(_) => "5xx",
        _ => "error",
    }
}

/// Passive-score penalty for a failed attempt.
pub fn error_penalty(err: &Error) -> i32 {
    match err {
        Error::UpstreamStatus(_) => -20,
        Error::Timeout(_) => -30,
        Error::Connection(_) => -50,
        _ => -15,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Config;

    fn gateway(toml: &str) -> GatewayConfig {
        Config::from_toml(toml).unwrap().gateway
    }

    #[test]
    fn test_retry_disabled_forces_zero() {
        let gw = gateway("[gateway]\nmax_retries = 5\n");
        assert_eq!(effective_max_retries(&Method::GET, &gw), 0);
    }

    #[test]
    fn test_retry_block_overrides_gateway_count() {
        let gw = gateway("[gateway]\nmax_retries = 5\n[gateway.retry]\nenabled = true\nmax_retries = 1\n");
        assert_eq!(effective_max_retries(&Method::GET, &gw), 1);
    }

    #[test]
    fn test_gateway_count_seeds_retry_default() {
        // retry.max_retries unset: normalize copies the gateway count in
        let gw = gateway("[gateway]\nmax_retries = 5\n[gateway.retry]\nenabled = true\n");
        assert_eq!(effective_max_retries(&Method::GET, &gw), 5);
    }

    #[test]
    fn test_non_idempotent_method_forces_zero() {
        let gw = gateway("[gateway.retry]\nenabled = true\nmax_retries = 2\n");
        assert_eq!(effective_max_retries(&Method::POST, &gw), 0);
        assert_eq!(effective_max_retries(&Method::PUT, &gw), 0);
        assert_eq!(effective_max_retries(&Method::GET, &gw), 2);
        assert_eq!(effective_max_retries(&Method::HEAD, &gw), 2);
    }

    #[test]
    fn test_enable_post_allows_non_idempotent() {
        let gw = gateway("[gateway.retry]\nenabled = true\nenable_post = true\nmax_retries = 2\n");
        assert_eq!(effective_max_retries(&Method::POST, &gw), 2);
    }

    #[test]
    fn test_retry_non_idempotent_allows_non_idempotent() {
        let gw = gateway(
            "[gateway]\nretry_non_idempotent = true\n[gateway.retry]\nenabled = true\nmax_retries = 2\n",
        );
        assert_eq!(effective_max_retries(&Method::DELETE, &gw), 2);
    }

    #[test]
    fn test_should_retry_matrix() {
        let retry = RetryConfig {
            enabled: true,
            retry_on_timeout: true,
            retry_on_5xx: true,
            retry_on_error: false,
            ..RetryConfig::default()
        };
        assert!(should_retry(&Error::timeout("t"), &retry));
        assert!(should_retry(&Error::UpstreamStatus(502), &retry));
        assert!(!should_retry(&Error::connection("refused"), &retry));
        assert!(!should_retry(&Error::upstream("other"), &retry));

        let disabled = RetryConfig::default();
        assert!(!should_retry(&Error::timeout("t"), &disabled));
    }

    #[test]
    fn test_retry_reason() {
        assert_eq!(retry_reason(&Error::timeout("t")), "timeout");
        assert_eq!(retry_reason(&Error::connection("c")), "conn_error");
        assert_eq!(retry_reason(&Error::UpstreamStatus(500)), "5xx");
        assert_eq!(retry_reason(&Error::upstream("x")), "error");
    }

    #[test]
    fn test_error_penalty() {
        assert_eq!(error_penalty(&Error::UpstreamStatus(500)), -20);
        assert_eq!(error_penalty(&Error::timeout("t")), -30);
        assert_eq!(error_penalty(&Error::connection("c")), -50);
        assert_eq!(error_penalty(&Error::upstream("x")), -15);
    }
}
