//! `crawlith` is a polite, resumable web crawler engine embedded in an
//! analytic SQL engine: sitemap discovery, per-host rate limiting, and
//! merge-on-recrawl persistence against a DuckDB-backed target table.
//!
//! Three verbs cover the surface: [`crawl_into`] crawls an explicit list of
//! URLs, [`crawl_sites_into`] discovers URLs from `robots.txt` and sitemaps
//! before crawling them, and [`merge_into`] reconciles a batch of
//! already-fetched rows against a target table (insert/update/tombstone).

mod config;
mod error;
mod host_state;
mod http_client;
mod orchestrator;
mod progress;
mod queue;
mod robots;
mod sitemap;
mod store;
mod url_utils;
mod worker;

pub use config::{validate_identifier, CrawlOptions, MimeGlobList};
pub use error::{CrawlError, CrawlResult, ErrorType, FetchError};
pub use orchestrator::{merge_into, CrawlJob, CrawlSummary};
pub use progress::ShutdownController;
pub use store::{MergePredicate, MergeSummary, ProgressCounters, ResultRow, RunStatus};

/// Installs a `tracing-subscriber` `fmt` layer honoring `RUST_LOG`
/// (`CRAWLITH_LOG` takes precedence). Library code never calls this itself;
/// it's here for a binary entry point that embeds `crawlith` to opt into the
/// same structured logging the worker pool and store already emit through.
pub fn init_tracing() {
    use tracing_subscriber::EnvFilter;
    let filter = EnvFilter::try_from_env("CRAWLITH_LOG")
        .or_else(|_| EnvFilter::try_from_default_env())
        .unwrap_or_else(|_| EnvFilter::new("info"));
    let _ = tracing_subscriber::fmt().with_env_filter(filter).try_init();
}

/// `crawl-into {target} ({urls}) with (...)` (spec §6): binds options,
/// enqueues the given URLs (deduplicated by SURT key) and crawls them to
/// completion or until an interrupt drains/aborts the run.
pub async fn crawl_into(
    target: &str,
    db_path: &str,
    urls: Vec<String>,
    options: CrawlOptions,
) -> CrawlResult<CrawlSummary> {
    let job = CrawlJob::bind(target, db_path, options).await?;
    job.run_urls(urls).await
}

/// `crawl-sites-into {target} ({sites}) [like {pattern}] with (...)` (spec
/// §6): runs sitemap/robots discovery per site, filters the discovered URLs
/// with an optional SQL `LIKE` pattern, then crawls the survivors.
pub async fn crawl_sites_into(
    target: &str,
    db_path: &str,
    sites: Vec<String>,
    like_pattern: Option<String>,
    options: CrawlOptions,
) -> CrawlResult<CrawlSummary> {
    let job = CrawlJob::bind(target, db_path, options).await?;
    job.run_sites(sites, like_pattern).await
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn crawl_into_rejects_invalid_target_identifier() {
        let result = crawl_into(
            "not a valid identifier",
            ":memory:",
            vec!["https://example.com/".to_string()],
            CrawlOptions::new("TestBot/1.0"),
        )
        .await;
        assert!(result.is_err());
    }

    #[tokio::test]
    async fn crawl_into_rejects_missing_user_agent() {
        let result = crawl_into(
            "pages",
            ":memory:",
            vec!["https://example.com/".to_string()],
            CrawlOptions::new(""),
        )
        .await;
        assert!(result.is_err());
    }
}
