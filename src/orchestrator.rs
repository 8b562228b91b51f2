//! Verb entry points: bind options, prime sources, run the worker pool to
//! completion, finalize progress (spec §4.J, §6).

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};

use crate::config::{validate_identifier, CrawlOptions};
use crate::error::{CrawlError, CrawlResult};
use crate::host_state::HostMap;
use crate::http_client::HttpClient;
use crate::progress::{Counters, ShutdownController};
use crate::queue::{QueueEntry, WorkQueue};
use crate::sitemap::{self, DatedUrl, SitemapCache};
use crate::store::{DuckDbStore, MergePredicate, ProgressCounters, ResultRow, RunStatus};
use crate::url_utils;
use crate::worker::WorkerPool;

const QUEUE_HIGH_WATERMARK: usize = 10_000;
const QUEUE_LOW_WATERMARK: usize = 5_000;

pub struct CrawlSummary {
    pub run_id: String,
    pub counters: ProgressCounters,
    pub status: RunStatus,
}

/// A bound, ready-to-run crawl job: options validated, schema created.
pub struct CrawlJob {
    options: Arc<CrawlOptions>,
    store: Arc<DuckDbStore>,
    http: Arc<HttpClient>,
    hosts: Arc<HostMap>,
    queue: Arc<WorkQueue>,
    counters: Arc<Counters>,
    shutdown: Arc<ShutdownController>,
    run_id: String,
    started_at: DateTime<Utc>,
}

impl CrawlJob {
    /// Bind phase (spec §4.J): validate options, check the target
    /// identifier, create tables. A failure here is fatal — no tables are
    /// created and no workers start (spec §7).
    pub async fn bind(target: &str, db_path: &str, options: CrawlOptions) -> CrawlResult<Self> {
        options.validate()?;
        validate_identifier(target)?;

        let store = Arc::new(DuckDbStore::open(db_path, target)?);
        store.ensure_schema().await?;

        let http = Arc::new(
            HttpClient::new(options.user_agent.clone(), options.timeout(), options.compress)
                .map_err(CrawlError::Store)?
                .with_max_redirects(options.max_redirects),
        );
        let hosts = HostMap::new(options.default_crawl_delay);
        let queue = Arc::new(WorkQueue::new(QUEUE_HIGH_WATERMARK, QUEUE_LOW_WATERMARK));
        let counters = Arc::new(Counters::default());
        let shutdown = Arc::new(ShutdownController::new());

        // Resume anything a prior, crashed or aborted run left mirrored in
        // `_crawl_queue_{target}` (spec §4.F, §8 invariant 7).
        match store.load_queue_entries().await {
            Ok(entries) => {
                for entry in entries {
                    queue.push(entry);
                }
                counters.set_queue_depth(queue.size() as u64);
            }
            Err(e) => tracing::error!(error = %e, "failed to load persisted queue"),
        }

        Ok(Self {
            options: Arc::new(options),
            store,
            http,
            hosts,
            queue,
            counters,
            shutdown,
            run_id: format!("run-{}", uuid_like()),
            started_at: Utc::now(),
        })
    }

    /// Installs a real `ctrl_c` handler. Tests that want deterministic
    /// shutdown should call `shutdown_controller()` and
    /// `signal_interrupt()` directly instead.
    pub fn install_signal_handler(&self) -> tokio::task::JoinHandle<()> {
        self.shutdown.clone().install_signal_handler()
    }

    pub fn shutdown_controller(&self) -> Arc<ShutdownController> {
        self.shutdown.clone()
    }

    /// Enqueues an explicit list of URLs, deduping by SURT key, then runs
    /// the worker pool to completion (the `crawl-into` verb with a literal
    /// URL list or a `source_query` already materialized by the caller).
    pub async fn run_urls(self, urls: Vec<String>) -> CrawlResult<CrawlSummary> {
        for raw in urls {
            self.enqueue_url(&raw).await;
        }
        self.drive().await
    }

    /// Runs Discovery (spec §4.D) for each site root, applies the `url
    /// LIKE` filter, then enqueues and drains (the `crawl-sites-into` verb).
    pub async fn run_sites(self, sites: Vec<String>, like_pattern: Option<String>) -> CrawlResult<CrawlSummary> {
        let cache: Arc<dyn SitemapCache> = Arc::new(StoreSitemapCache {
            store: self.store.clone(),
        });
        for site in &sites {
            let (scheme, host) = split_site(site);
            if let Ok(Some(status)) = self.store.load_discovery_status(&host).await {
                tracing::debug!(
                    host = %host,
                    last_success_at = %status.last_success_at,
                    discovered_count = status.discovered_count,
                    "resuming discovery"
                );
            }
            let discovery = sitemap::discover(
                &self.http,
                cache.as_ref(),
                &scheme,
                &host,
                &self.options.user_agent,
                self.options.respect_robots_txt,
                self.options.sitemap_cache_ttl(),
            )
            .await;

            self.hosts.set_robots(&host, discovery.robots, &self.options);
            self.counters.incr_discovered(discovery.urls.len() as u64);
            if let Err(e) = self
                .store
                .save_discovery_status(&host, discovery.urls.len() as u64)
                .await
            {
                tracing::error!(error = %e, "failed to save discovery status");
            }

            let filtered = sitemap::like_filter(&discovery.urls, like_pattern.as_deref());
            for dated in filtered {
                self.maybe_enqueue_sitemap_url(dated).await;
            }

            self.queue.wait_below_watermark().await;
        }
        self.drive().await
    }

    async fn maybe_enqueue_sitemap_url(&self, dated: &DatedUrl) {
        if !self.options.update_stale {
            self.enqueue_url(&dated.url).await;
            return;
        }
        let prior = self.store.find_prior(&dated.url).await.ok().flatten();
        let stale = sitemap::is_stale(dated.last_modified, prior.as_ref().map(|p| p.crawled_at));
        if prior.is_none() || stale {
            self.enqueue_url(&dated.url).await;
        }
    }

    /// Normalizes, dedups and pushes `raw` onto the in-memory queue, mirroring
    /// it into `_crawl_queue_{target}` so it survives a crash before the
    /// worker picks it up (spec §3, §4.F).
    async fn enqueue_url(&self, raw: &str) {
        let Ok(url) = url_utils::normalize(raw, None) else {
            tracing::debug!(raw, "dropping invalid_url");
            return;
        };
        let surt = url_utils::surt_key(&url);
        let host = url_utils::host_key(&url);
        let due = self.hosts.due_at(&host);
        let entry = QueueEntry::new(url.to_string(), surt, host, due);
        if let Err(e) = self.store.upsert_queue_entry(&entry).await {
            tracing::error!(error = %e, "queue mirror upsert failed");
        }
        self.queue.push(entry);
        self.counters.set_queue_depth(self.queue.size() as u64);
    }

    async fn drive(self) -> CrawlResult<CrawlSummary> {
        let worker_count = self.options.max_total_connections;
        let pool = Arc::new(WorkerPool::new(
            self.queue.clone(),
            self.hosts.clone(),
            self.http.clone(),
            self.store.clone(),
            self.counters.clone(),
            self.shutdown.clone(),
            self.options.clone(),
        ));

        let flusher = self.spawn_progress_flusher();
        pool.run(worker_count).await;
        flusher.abort();

        let status = if self.shutdown.is_aborted() {
            RunStatus::Cancelled
        } else if self.shutdown.is_draining() {
            RunStatus::Cancelled
        } else {
            RunStatus::Done
        };

        self.store
            .upsert_progress(&self.run_id, self.started_at, &self.counters.snapshot(), status)
            .await?;

        Ok(CrawlSummary {
            run_id: self.run_id,
            counters: self.counters.snapshot(),
            status,
        })
    }

    fn spawn_progress_flusher(&self) -> tokio::task::JoinHandle<()> {
        let store = self.store.clone();
        let counters = self.counters.clone();
        let run_id = self.run_id.clone();
        let started_at = self.started_at;
        tokio::spawn(async move {
            loop {
                tokio::time::sleep(Duration::from_millis(500)).await;
                let _ = store
                    .upsert_progress(&run_id, started_at, &counters.snapshot(), RunStatus::Running)
                    .await;
            }
        })
    }
}

/// `merge-into {target}` (spec §4.H): upserts matched rows passing
/// `predicate`, inserts new ones, tombstones rows absent from `source_rows`.
pub async fn merge_into(
    target: &str,
    db_path: &str,
    source_rows: Vec<ResultRow>,
    predicate: MergePredicate,
) -> CrawlResult<crate::store::MergeSummary> {
    validate_identifier(target)?;
    let store = DuckDbStore::open(db_path, target)?;
    store.ensure_schema().await?;
    store.merge(source_rows, predicate).await
}

struct StoreSitemapCache {
    store: Arc<DuckDbStore>,
}

#[async_trait::async_trait]
impl SitemapCache for StoreSitemapCache {
    async fn get(&self, sitemap_url: &str, ttl: Duration) -> Option<Vec<DatedUrl>> {
        self.store.load_sitemap_cache(sitemap_url, ttl).await.ok().flatten()
    }

    async fn put(&self, host: &str, sitemap_url: &str, urls: &[DatedUrl]) {
        let _ = self.store.save_sitemap_cache(host, sitemap_url, urls).await;
    }
}

fn split_site(site: &str) -> (String, String) {
    if let Some(rest) = site.strip_prefix("https://") {
        ("https".to_string(), rest.trim_end_matches('/').to_string())
    } else if let Some(rest) = site.strip_prefix("http://") {
        ("http".to_string(), rest.trim_end_matches('/').to_string())
    } else {
        ("https".to_string(), site.trim_end_matches('/').to_string())
    }
}

fn uuid_like() -> String {
    let nanos = std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.as_nanos())
        .unwrap_or(0);
    format!("{nanos:x}")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn bind_rejects_unsafe_identifier() {
        let opts = CrawlOptions::new("TestBot/1.0");
        let result = CrawlJob::bind("bad; name", ":memory:", opts).await;
        assert!(result.is_err());
    }

    #[tokio::test]
    async fn bind_rejects_invalid_options() {
        let opts = CrawlOptions::new("");
        let result = CrawlJob::bind("pages", ":memory:", opts).await;
        assert!(result.is_err());
    }

    #[test]
    fn split_site_defaults_to_https() {
        assert_eq!(split_site("example.com"), ("https".to_string(), "example.com".to_string()));
        assert_eq!(split_site("http://example.com/"), ("http".to_string(), "example.com".to_string()));
    }
}
