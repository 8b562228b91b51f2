//! Error taxonomy for the crawl engine (spec §4.C, §7).

use std::fmt;

/// Classified outcome of a fetch attempt, written verbatim into the
/// `error_type` column when a terminal row carries an error.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorType {
    NetworkTimeout,
    NetworkDnsFailure,
    NetworkConnectionRefused,
    NetworkSslError,
    HttpClientError,
    HttpServerError,
    HttpRateLimited,
    ContentTooLarge,
    ContentTypeRejected,
    RobotsDisallowed,
    RedirectLoop,
    SitemapParseError,
    InvalidUrl,
    Unknown,
}

impl ErrorType {
    /// Retryable errors are re-enqueued with Fibonacci backoff (spec §7).
    pub fn is_retryable(self) -> bool {
        matches!(
            self,
            ErrorType::NetworkTimeout
                | ErrorType::NetworkDnsFailure
                | ErrorType::NetworkConnectionRefused
                | ErrorType::NetworkSslError
                | ErrorType::HttpRateLimited
                | ErrorType::HttpServerError
        )
    }

    pub fn as_str(self) -> &'static str {
        match self {
            ErrorType::NetworkTimeout => "network_timeout",
            ErrorType::NetworkDnsFailure => "network_dns_failure",
            ErrorType::NetworkConnectionRefused => "network_connection_refused",
            ErrorType::NetworkSslError => "network_ssl_error",
            ErrorType::HttpClientError => "http_client_error",
            ErrorType::HttpServerError => "http_server_error",
            ErrorType::HttpRateLimited => "http_rate_limited",
            ErrorType::ContentTooLarge => "content_too_large",
            ErrorType::ContentTypeRejected => "content_type_rejected",
            ErrorType::RobotsDisallowed => "robots_disallowed",
            ErrorType::RedirectLoop => "redirect_loop",
            ErrorType::SitemapParseError => "sitemap_parse_error",
            ErrorType::InvalidUrl => "invalid_url",
            ErrorType::Unknown => "unknown",
        }
    }
}

impl fmt::Display for ErrorType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A classified fetch failure, carrying both the machine-readable
/// [`ErrorType`] and a free-form message for the `error` column.
#[derive(Debug, Clone, thiserror::Error)]
#[error("{error_type}: {message}")]
pub struct FetchError {
    pub error_type: ErrorType,
    pub message: String,
}

impl FetchError {
    pub fn new(error_type: ErrorType, message: impl Into<String>) -> Self {
        Self {
            error_type,
            message: message.into(),
        }
    }
}

/// Top-level crate error. Bind-time configuration failures use this type
/// directly; everything downstream of bind is either a classified
/// [`FetchError`] captured in a row, or an `anyhow::Error` bubbled up from a
/// store/I-O failure that aborts the whole run.
#[derive(Debug, thiserror::Error)]
pub enum CrawlError {
    #[error("missing required option `{0}`")]
    MissingOption(&'static str),

    #[error("invalid value for option `{name}`: {reason}")]
    InvalidOption { name: &'static str, reason: String },

    #[error("invalid target table identifier `{0}`")]
    InvalidIdentifier(String),

    #[error("invalid url: {0}")]
    InvalidUrl(String),

    #[error("robots.txt parse error: {0}")]
    RobotsParse(String),

    #[error("sitemap parse error: {0}")]
    SitemapParse(String),

    #[error(transparent)]
    Store(#[from] anyhow::Error),
}

pub type CrawlResult<T> = Result<T, CrawlError>;
