//! Crawl options bound from the SQL-level `WITH (...)` clause (spec §6).

use std::time::Duration;

use crate::error::CrawlError;

/// Comma-separated glob list, e.g. `"text/html,text/*"`.
#[derive(Debug, Clone, Default)]
pub struct MimeGlobList(pub Vec<String>);

impl MimeGlobList {
    pub fn parse(s: &str) -> Self {
        Self(
            s.split(',')
                .map(str::trim)
                .filter(|s| !s.is_empty())
                .map(str::to_ascii_lowercase)
                .collect(),
        )
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// `true` if `content_type` (e.g. `"text/html; charset=utf-8"`) matches
    /// any glob in the list (`text/*` or an exact type).
    pub fn matches(&self, content_type: &str) -> bool {
        let essence = content_type
            .split(';')
            .next()
            .unwrap_or(content_type)
            .trim()
            .to_ascii_lowercase();
        self.0.iter().any(|glob| {
            if let Some(prefix) = glob.strip_suffix("/*") {
                essence
                    .split_once('/')
                    .map(|(p, _)| p == prefix)
                    .unwrap_or(false)
            } else {
                *glob == essence
            }
        })
    }
}

/// The full set of `WITH (...)` options recognized by the crawl verbs.
#[derive(Debug, Clone)]
pub struct CrawlOptions {
    pub user_agent: String,
    pub default_crawl_delay: f64,
    pub min_crawl_delay: f64,
    pub max_crawl_delay: f64,
    pub timeout_seconds: u64,
    pub respect_robots_txt: bool,
    pub log_skipped: bool,
    pub sitemap_cache_hours: u64,
    pub update_stale: bool,
    pub max_retry_backoff_seconds: u64,
    pub max_parallel_per_domain: usize,
    pub max_total_connections: usize,
    pub max_response_bytes: u64,
    pub compress: bool,
    pub accept_content_types: MimeGlobList,
    pub reject_content_types: MimeGlobList,
    pub max_retries: u32,
    pub max_redirects: u8,
}

impl CrawlOptions {
    /// Builds options from a required `user_agent` plus defaults; callers
    /// then apply any `WITH (...)` overrides with the `with_*` setters
    /// before calling [`CrawlOptions::validate`].
    pub fn new(user_agent: impl Into<String>) -> Self {
        Self {
            user_agent: user_agent.into(),
            default_crawl_delay: 1.0,
            min_crawl_delay: 0.0,
            max_crawl_delay: 60.0,
            timeout_seconds: 30,
            respect_robots_txt: true,
            log_skipped: true,
            sitemap_cache_hours: 24,
            update_stale: false,
            max_retry_backoff_seconds: 600,
            max_parallel_per_domain: 8,
            max_total_connections: 32,
            max_response_bytes: 10 * 1024 * 1024,
            compress: true,
            accept_content_types: MimeGlobList::default(),
            reject_content_types: MimeGlobList::default(),
            max_retries: 3,
            max_redirects: 10,
        }
    }

    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_seconds)
    }

    pub fn discovery_timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_seconds.min(15))
    }

    pub fn sitemap_cache_ttl(&self) -> Duration {
        Duration::from_secs(self.sitemap_cache_hours * 3600)
    }

    /// Validates required fields and ranges; a failure here is fatal at
    /// bind time — no tables are created and no workers start (spec §7).
    pub fn validate(&self) -> Result<(), CrawlError> {
        if self.user_agent.trim().is_empty() {
            return Err(CrawlError::MissingOption("user_agent"));
        }
        if self.min_crawl_delay < 0.0 {
            return Err(CrawlError::InvalidOption {
                name: "min_crawl_delay",
                reason: "must be >= 0".into(),
            });
        }
        if self.max_crawl_delay < self.min_crawl_delay {
            return Err(CrawlError::InvalidOption {
                name: "max_crawl_delay",
                reason: "must be >= min_crawl_delay".into(),
            });
        }
        if self.max_parallel_per_domain == 0 {
            return Err(CrawlError::InvalidOption {
                name: "max_parallel_per_domain",
                reason: "must be >= 1".into(),
            });
        }
        if self.max_total_connections == 0 {
            return Err(CrawlError::InvalidOption {
                name: "max_total_connections",
                reason: "must be >= 1".into(),
            });
        }
        if self.max_response_bytes == 0 {
            return Err(CrawlError::InvalidOption {
                name: "max_response_bytes",
                reason: "must be >= 1".into(),
            });
        }
        Ok(())
    }

    /// Clamps a requested delay (e.g. from robots.txt) into
    /// `[min_crawl_delay, max_crawl_delay]`.
    pub fn clamp_delay(&self, seconds: f64) -> f64 {
        seconds.clamp(self.min_crawl_delay, self.max_crawl_delay)
    }
}

/// Validates a target-table identifier: `[A-Za-z_][A-Za-z0-9_]*`, per spec
/// §4.H. Rejection is itself a bind-time error.
pub fn validate_identifier(name: &str) -> Result<(), CrawlError> {
    let mut chars = name.chars();
    let ok_start = chars
        .next()
        .map(|c| c.is_ascii_alphabetic() || c == '_')
        .unwrap_or(false);
    let ok_rest = chars.all(|c| c.is_ascii_alphanumeric() || c == '_');
    if ok_start && ok_rest {
        Ok(())
    } else {
        Err(CrawlError::InvalidIdentifier(name.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rejects_missing_user_agent() {
        let opts = CrawlOptions::new("  ");
        assert!(opts.validate().is_err());
    }

    #[test]
    fn rejects_inverted_delay_range() {
        let mut opts = CrawlOptions::new("bot");
        opts.min_crawl_delay = 10.0;
        opts.max_crawl_delay = 1.0;
        assert!(opts.validate().is_err());
    }

    #[test]
    fn identifier_validation() {
        assert!(validate_identifier("pages").is_ok());
        assert!(validate_identifier("_pages_2").is_ok());
        assert!(validate_identifier("2pages").is_err());
        assert!(validate_identifier("pages; drop table x").is_err());
        assert!(validate_identifier("").is_err());
    }

    #[test]
    fn mime_glob_matching() {
        let list = MimeGlobList::parse("text/html, text/*");
        assert!(list.matches("text/html; charset=utf-8"));
        assert!(list.matches("text/plain"));
        assert!(!list.matches("image/png"));
    }

    #[test]
    fn clamp_delay_respects_bounds() {
        let opts = CrawlOptions::new("bot");
        assert_eq!(opts.clamp_delay(-1.0), 0.0);
        assert_eq!(opts.clamp_delay(1000.0), 60.0);
    }
}
