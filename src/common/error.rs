//! Error types for the gateway

use std::io;
use thiserror::Error;

/// Gateway error type
#[derive(Error, Debug)]
pub enum Error {
    #[error("IO error: {0}")]
    Io(#[from] io::Error),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Invalid address: {0}")]
    Address(String),

    #[error("Upstream timeout: {0}")]
    Timeout(String),

    #[error("Connection error: {0}")]
    Connection(String),

    #[error("Upstream error: {0}")]
    Upstream(String),

    /// Sentinel surfaced when an upstream status code demands a retry.
    #[error("upstream status {0}")]
    UpstreamStatus(u16),

    #[error("Script error: {0}")]
    Script(String),

    #[error("Internal error: {0}")]
    Internal(String),
}

impl Error {
    pub fn config<S: Into<String>>(msg: S) -> Self {
        Error::Config(msg.into())
    }

    pub fn address<S: Into<String>>(msg: S) -> Self {
        Error::Address(msg.into())
    }

    pub fn timeout<S: Into<String>>(msg: S) -> Self {
        Error::Timeout(msg.into())
    }

    pub fn connection<S: Into<String>>(msg: S) -> Self {
        Error::Connection(msg.into())
    }

    pub fn upstream<S: Into<String>>(msg: S) -> Self {
        Error::Upstream(msg.into())
    }

    pub fn script<S: Into<String>>(msg: S) -> Self {
        Error::Script(msg.into())
    }

    pub fn internal<S: Into<String>>(msg: S) -> Self {
        Error::Internal(msg.into())
    }

    pub fn is_timeout(&self) -> bool {
        matches!(self, Error::Timeout(_))
    }

    pub fn is_connection(&self) -> bool {
        matches!(self, Error::Connection(_))
    }

    pub fn is_upstream_status(&self) -> bool {
        matches!(self, Error::UpstreamStatus(_))
    }
}

impl From<toml::de::Error> for Error {
    fn from(e: toml::de::Error) -> Self {
        Error::Config(e.to_string())
    }
}

impl From<serde_json::Error> for Error {
    fn from(e: serde_json::Error) -> Self {
        Error::Script(e.to_string())
    }
}

impl From<tokio::time::error::Elapsed> for Error {
    fn from(e: tokio::time::error::Elapsed) -> Self {
        Error::Timeout(e.to_string())
    }
}

impl From<url::ParseError> for Error {
    fn from(e: url::ParseError) -> Self {
        Error::Address(e.to_string())
    }
}

impl From<reqwest::Error> for Error {
    fn from(e: reqwest::Error) -> Self {
        if e.is_timeout() {
            Error::Timeout(e.to_string())
        } else if e.is_connect() {
            Error::Connection(e.to_string())
        } else {
            Error::Upstream(e.to_string())
        }
    }
}

/// Result type alias using our Error
pub type Result<T> = std::result::Result<T, Error>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_creation() {
        let e = Error::config("test error");
        assert!(matches!(e, Error::Config(_)));
    }

    #[test]
    fn test_error_display() {
        let e = Error::connection("refused");
        assert_eq!(e.to_string(), "Connection error: refused");
        let e = Error::UpstreamStatus(502);
        assert_eq!(e.to_string(), "upstream status 502");
    }

    #[test]
    fn test_classification_helpers() {
        assert!(Error::timeout("t").is_timeout());
        assert!(Error::connection("c").is_connection());
        assert!(Error::UpstreamStatus(500).is_upstream_status());
        assert!(!Error::upstream("x").is_timeout());
    }
}
