//! Error taxonomy for the crawling engine
//!
//! Every failure a worker can hit maps onto one of these kinds, and the
//! kind alone decides the recovery policy: re-enqueue with backoff,
//! sink-and-drop, drop silently, or tear the process down.

use std::time::Duration;

use thiserror::Error;

/// Crate-wide error type.
#[derive(Debug, Error)]
pub enum CrawlError {
    /// URL failed to parse; the raw string goes to `misc/invalid.txt`.
    #[error("malformed URL {input:?}: {reason}")]
    MalformedUrl { input: String, reason: String },

    /// No transport can carry this scheme; sunk to the family file.
    #[error("no transport for scheme {0:?}")]
    InvalidScheme(String),

    /// Denied by the host/MIME/proxy filter gates.
    #[error("denied by filter gates")]
    Filtered,

    /// robots.txt denies the path and FORCE is off.
    #[error("disallowed by robots.txt")]
    RobotsDenied,

    /// DNS/TCP/TLS/HTTP transport failure; retried with backoff.
    #[error("network error: {0}")]
    Network(String),

    /// Fetch or render exceeded its budget; retried with backoff.
    #[error("timed out after {0:?}")]
    Timeout(Duration),

    /// The renderer produced the empty-page sentinel.
    #[error("renderer returned an empty page")]
    EmptyRender,

    /// Response status in [400, 600); fetch retried with backoff.
    #[error("HTTP status {0}")]
    HttpStatus(u16),

    /// A site hook declared the link a dead end. When `drop` is set the
    /// link is purged from both queues permanently.
    #[error("link dropped by site hook")]
    LinkNoReturn { drop: bool },

    /// Another worker holds the per-link lock.
    #[error("lock busy")]
    LockBusy,

    /// An inter-round hook asked the scheduler to stop.
    #[error("round hook requested termination")]
    WorkerBreak,

    /// Submission endpoint kept failing; payload was saved locally.
    #[error("submission failed after {attempts} attempt(s): {reason}")]
    Submission { attempts: u32, reason: String },

    /// The frontier backend is unreachable. Fatal: exit code 2.
    #[error("frontier store unavailable: {0}")]
    StoreUnavailable(String),

    /// Headless browser failure (launch, navigation, CDP).
    #[error("browser error: {0}")]
    Browser(String),

    #[error(transparent)]
    Io(#[from] std::io::Error),
}

impl CrawlError {
    /// Whether the failure should be retried by re-enqueueing the link
    /// with a `not-before` backoff.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            Self::Network(_)
                | Self::Timeout(_)
                | Self::EmptyRender
                | Self::HttpStatus(_)
                | Self::LockBusy
        )
    }
}

impl From<reqwest::Error> for CrawlError {
    fn from(err: reqwest::Error) -> Self {
        if err.is_timeout() {
            // reqwest does not expose the configured budget on the error
            Self::Timeout(Duration::ZERO)
        } else if err.is_builder() {
            Self::InvalidScheme(
                err.url()
                    .map(|u| u.scheme().to_string())
                    .unwrap_or_else(|| "unknown".to_string()),
            )
        } else {
            Self::Network(err.to_string())
        }
    }
}

impl From<redis::RedisError> for CrawlError {
    fn from(err: redis::RedisError) -> Self {
        Self::StoreUnavailable(err.to_string())
    }
}

impl From<url::ParseError> for CrawlError {
    fn from(err: url::ParseError) -> Self {
        Self::MalformedUrl {
            input: String::new(),
            reason: err.to_string(),
        }
    }
}

/// Result alias used throughout the crate.
pub type Result<T> = std::result::Result<T, CrawlError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn retryable_kinds() {
        assert!(CrawlError::Network("refused".into()).is_retryable());
        assert!(CrawlError::Timeout(Duration::from_secs(30)).is_retryable());
        assert!(CrawlError::HttpStatus(503).is_retryable());
        assert!(CrawlError::EmptyRender.is_retryable());
        assert!(CrawlError::LockBusy.is_retryable());
    }

    #[test]
    fn terminal_kinds() {
        assert!(!CrawlError::Filtered.is_retryable());
        assert!(!CrawlError::RobotsDenied.is_retryable());
        assert!(!CrawlError::LinkNoReturn { drop: true }.is_retryable());
        assert!(!CrawlError::InvalidScheme("ftp".into()).is_retryable());
    }

    #[test]
    fn url_parse_error_maps_to_malformed() {
        let err: CrawlError = url::ParseError::EmptyHost.into();
        assert!(matches!(err, CrawlError::MalformedUrl { .. }));
    }
}
