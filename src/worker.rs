//! Worker pool: N async tasks draining the queue under the scheduler's
//! pacing (spec §4.G).

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::Utc;
use sha2::{Digest, Sha256};
use tokio::sync::Mutex as AsyncMutex;
use tokio::task::JoinSet;

use crate::config::CrawlOptions;
use crate::error::ErrorType;
use crate::host_state::HostMap;
use crate::http_client::{FetchParams, HttpClient};
use crate::progress::{Counters, ShutdownController};
use crate::queue::{QueueEntry, WorkQueue};
use crate::robots::RobotsRules;
use crate::store::{DuckDbStore, ResultRow};

const BATCH_SIZE: usize = 20;
const BATCH_INTERVAL: Duration = Duration::from_millis(500);
const MIN_SLEEP: Duration = Duration::from_millis(200);
const REQUEUE_NUDGE: Duration = Duration::from_millis(50);

pub struct WorkerPool {
    queue: Arc<WorkQueue>,
    hosts: Arc<HostMap>,
    http: Arc<HttpClient>,
    store: Arc<DuckDbStore>,
    counters: Arc<Counters>,
    shutdown: Arc<ShutdownController>,
    options: Arc<CrawlOptions>,
    batch: Arc<AsyncMutex<Vec<ResultRow>>>,
    last_flush: Arc<AsyncMutex<Instant>>,
    in_flight_total: Arc<AtomicU64>,
}

impl WorkerPool {
    pub fn new(
        queue: Arc<WorkQueue>,
        hosts: Arc<HostMap>,
        http: Arc<HttpClient>,
        store: Arc<DuckDbStore>,
        counters: Arc<Counters>,
        shutdown: Arc<ShutdownController>,
        options: Arc<CrawlOptions>,
    ) -> Self {
        Self {
            queue,
            hosts,
            http,
            store,
            counters,
            shutdown,
            options,
            batch: Arc::new(AsyncMutex::new(Vec::new())),
            last_flush: Arc::new(AsyncMutex::new(Instant::now())),
            in_flight_total: Arc::new(AtomicU64::new(0)),
        }
    }

    /// Spawns `n` workers and awaits until every one exits (queue drained
    /// and shutdown token cancelled, or the abort token fires).
    pub async fn run(self: Arc<Self>, n: usize) {
        let mut set = JoinSet::new();
        for id in 0..n {
            let this = self.clone();
            set.spawn(async move { this.worker_loop(id).await });
        }
        while set.join_next().await.is_some() {}
        self.flush_if_any().await;
    }

    #[tracing::instrument(skip(self), fields(worker = id))]
    async fn worker_loop(&self, id: usize) {
        loop {
            if self.shutdown.is_aborted() {
                return;
            }
            // A single interrupt drains in-flight work but must not hand a
            // worker anything new (spec §4.I "stop accepting new work").
            if self.shutdown.is_draining() {
                return;
            }

            let now = Instant::now();
            let Some(mut entry) = self.queue.pop_due(now) else {
                self.queue.wait_for_push(MIN_SLEEP).await;
                continue;
            };

            let due = self.hosts.due_at(&entry.host);
            if due > now {
                entry.earliest_due_at = due;
                self.queue.push(entry);
                tokio::time::sleep((due - now).min(REQUEUE_NUDGE)).await;
                continue;
            }

            if !self.hosts.try_acquire_slot(&entry.host, self.options.max_parallel_per_domain) {
                entry.earliest_due_at = now + REQUEUE_NUDGE;
                self.queue.push(entry);
                tokio::time::sleep(REQUEUE_NUDGE).await;
                continue;
            }

            self.in_flight_total.fetch_add(1, Ordering::Relaxed);
            self.counters.set_in_flight(self.in_flight_total.load(Ordering::Relaxed));
            // `process` always releases the per-host slot itself, on every
            // exit path, before it returns.
            self.process(entry).await;
            self.in_flight_total.fetch_sub(1, Ordering::Relaxed);
            self.counters.set_in_flight(self.in_flight_total.load(Ordering::Relaxed));
            self.counters.set_queue_depth(self.queue.size() as u64);
        }
    }

    async fn process(&self, mut entry: QueueEntry) {
        let host = entry.host.clone();

        // Robots check (spec §4.E "Disallowed URLs"). `crawl-into` has no
        // discovery pass to seed rules from, so the first URL queued for a
        // host fetches robots.txt itself.
        if self.options.respect_robots_txt {
            if self.hosts.needs_robots_fetch(&host) {
                self.fetch_robots(&host, &entry.url).await;
            }
            let path_and_query = path_with_query(&entry.url);
            if !self.hosts.is_allowed(&host, &path_and_query) {
                self.hosts.release_slot(&host);
                if self.options.log_skipped {
                    self.write_skip_row(&entry, ErrorType::RobotsDisallowed, "disallowed by robots.txt")
                        .await;
                }
                self.counters.incr_processed();
                self.counters.incr_skipped();
                return;
            }
        }

        let prior = self.store.find_prior(&entry.url).await.ok().flatten();
        let params = FetchParams {
            if_none_match: prior.as_ref().and_then(|p| p.etag.as_deref()),
            if_modified_since: prior.as_ref().and_then(|p| p.last_modified.as_deref()),
        };

        let result = self
            .http
            .fetch(
                &entry.url,
                params,
                self.options.max_response_bytes,
                &self.options.accept_content_types,
                &self.options.reject_content_types,
            )
            .await;

        self.hosts.with_host(&host, |s| {
            s.mark_fetch(Instant::now());
            s.record_latency(Duration::from_millis(result.elapsed_ms), &self.options);
        });
        self.hosts.release_slot(&host);

        if let Some(err) = &result.error {
            let retry_after = result
                .headers
                .retry_after
                .as_deref()
                .and_then(crate::http_client::parse_retry_after_seconds);
            let wait = self
                .hosts
                .with_host(&host, |s| s.record_failure(err.error_type, retry_after, &self.options));

            if err.error_type.is_retryable() && entry.attempt_count < self.options.max_retries {
                entry.attempt_count += 1;
                entry.last_error_type = Some(err.error_type);
                entry.earliest_due_at = Instant::now() + wait;
                if let Err(e) = self.store.upsert_queue_entry(&entry).await {
                    tracing::error!(error = %e, "queue mirror upsert failed");
                }
                self.queue.push(entry);
                return;
            }

            self.write_error_row(&entry, &result, err.error_type, &err.message).await;
            self.counters.incr_processed();
            self.counters.incr_failed();
            return;
        }

        self.hosts.with_host(&host, |s| s.record_success());

        if result.is_not_modified() {
            if let Some(prior_row) = prior {
                self.write_not_modified_row(&entry, &result, prior_row).await;
            } else {
                // A 304 with no prior row is unusual but not an error; treat
                // the response as an empty-body success.
                self.write_success_row(&entry, &result, None).await;
            }
        } else {
            self.write_success_row(&entry, &result, result.body.clone()).await;
        }

        self.counters.incr_processed();
        self.counters.incr_succeeded();
    }

    /// Fetches and parses `host`'s `robots.txt`, seeding its crawl-delay and
    /// rule set. A fetch failure is treated as allow-all (spec §4.D).
    async fn fetch_robots(&self, host: &str, sample_url: &str) {
        let scheme = url::Url::parse(sample_url)
            .map(|u| u.scheme().to_string())
            .unwrap_or_else(|_| "https".to_string());
        let robots_url = format!("{scheme}://{host}/robots.txt");
        let resp = self
            .http
            .fetch(
                &robots_url,
                crate::http_client::FetchParams::default(),
                2 * 1024 * 1024,
                &Default::default(),
                &Default::default(),
            )
            .await;

        let robots = if resp.is_success() {
            let body = resp
                .body
                .as_deref()
                .map(|b| String::from_utf8_lossy(b).into_owned())
                .unwrap_or_default();
            crate::robots::parse(&body, &self.options.user_agent)
        } else {
            RobotsRules::allow_all()
        };
        self.hosts.set_robots(host, robots, &self.options);
    }

    async fn write_success_row(
        &self,
        entry: &QueueEntry,
        result: &crate::http_client::HttpResult,
        body: Option<Vec<u8>>,
    ) {
        let content_hash = body.as_deref().map(sha256_hex);
        let body_text = body.map(|b| String::from_utf8_lossy(&b).into_owned());
        let row = ResultRow {
            url: result.final_url.clone(),
            surt_key: entry.surt_key.clone(),
            domain: entry.host.clone(),
            http_status: result.status as i32,
            body: body_text,
            content_type: result.headers.content_type.clone(),
            elapsed_ms: result.elapsed_ms as i64,
            crawled_at: Utc::now(),
            error: None,
            error_type: None,
            etag: result.headers.etag.clone(),
            last_modified: result.headers.last_modified.clone(),
            content_hash,
            is_deleted: false,
        };
        self.push_row(row).await;
    }

    /// A 304 never mutates `content_hash` (spec invariant 5); only
    /// `crawled_at`, `etag`, `last_modified` move forward.
    async fn write_not_modified_row(
        &self,
        entry: &QueueEntry,
        result: &crate::http_client::HttpResult,
        prior: ResultRow,
    ) {
        let row = ResultRow {
            url: entry.url.clone(),
            surt_key: entry.surt_key.clone(),
            domain: entry.host.clone(),
            crawled_at: Utc::now(),
            etag: result.headers.etag.clone().or(prior.etag),
            last_modified: result.headers.last_modified.clone().or(prior.last_modified),
            content_hash: prior.content_hash,
            body: prior.body,
            http_status: 304,
            ..prior
        };
        self.push_row(row).await;
    }

    async fn write_error_row(
        &self,
        entry: &QueueEntry,
        result: &crate::http_client::HttpResult,
        error_type: ErrorType,
        message: &str,
    ) {
        let row = ResultRow {
            url: entry.url.clone(),
            surt_key: entry.surt_key.clone(),
            domain: entry.host.clone(),
            http_status: result.status as i32,
            body: None,
            content_type: None,
            elapsed_ms: result.elapsed_ms as i64,
            crawled_at: Utc::now(),
            error: Some(message.to_string()),
            error_type: Some(error_type),
            etag: None,
            last_modified: None,
            content_hash: None,
            is_deleted: false,
        };
        self.push_row(row).await;
    }

    async fn write_skip_row(&self, entry: &QueueEntry, error_type: ErrorType, message: &str) {
        let row = ResultRow {
            url: entry.url.clone(),
            surt_key: entry.surt_key.clone(),
            domain: entry.host.clone(),
            http_status: -1,
            body: None,
            content_type: None,
            elapsed_ms: 0,
            crawled_at: Utc::now(),
            error: Some(message.to_string()),
            error_type: Some(error_type),
            etag: None,
            last_modified: None,
            content_hash: None,
            is_deleted: false,
        };
        self.push_row(row).await;
    }

    async fn push_row(&self, row: ResultRow) {
        // Every terminal outcome (success, not-modified, error, skip) funnels
        // through here; the durable queue mirror only needs entries that are
        // still in flight (spec §4.F "removed on terminal outcome").
        if let Err(e) = self.store.delete_queue_entry(&row.surt_key).await {
            tracing::error!(error = %e, "queue mirror delete failed");
        }
        let should_flush = {
            let mut batch = self.batch.lock().await;
            batch.push(row);
            batch.len() >= BATCH_SIZE
        };
        let time_elapsed = {
            let last = self.last_flush.lock().await;
            last.elapsed() >= BATCH_INTERVAL
        };
        if should_flush || time_elapsed {
            self.flush_if_any().await;
        }
    }

    async fn flush_if_any(&self) {
        let rows = {
            let mut batch = self.batch.lock().await;
            std::mem::take(&mut *batch)
        };
        if rows.is_empty() {
            return;
        }
        if let Err(e) = self.store.flush_batch(rows).await {
            tracing::error!(error = %e, "batch flush failed");
        }
        *self.last_flush.lock().await = Instant::now();
    }
}

fn sha256_hex(body: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(body);
    hex::encode(hasher.finalize())
}

fn path_with_query(url: &str) -> String {
    match url::Url::parse(url) {
        Ok(u) => {
            let mut s = u.path().to_string();
            if let Some(q) = u.query() {
                s.push('?');
                s.push_str(q);
            }
            s
        }
        Err(_) => "/".to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sha256_hex_is_deterministic() {
        let a = sha256_hex(b"hello");
        let b = sha256_hex(b"hello");
        assert_eq!(a, b);
        assert_eq!(a.len(), 64);
    }

    #[test]
    fn path_with_query_extracts_from_full_url() {
        assert_eq!(path_with_query("https://example.com/a/b?c=1"), "/a/b?c=1");
        assert_eq!(path_with_query("not a url"), "/");
    }

    #[cfg(feature = "duckdb")]
    mod process_tests {
        use super::*;
        use wiremock::matchers::{method, path as wm_path};
        use wiremock::{Mock, MockServer, ResponseTemplate};

        fn pool(store: Arc<DuckDbStore>, options: CrawlOptions) -> Arc<WorkerPool> {
            Arc::new(WorkerPool::new(
                Arc::new(WorkQueue::new(1000, 500)),
                HostMap::new(options.default_crawl_delay),
                Arc::new(HttpClient::new("TestBot/1.0", Duration::from_secs(5), true).unwrap()),
                store,
                Arc::new(Counters::default()),
                Arc::new(ShutdownController::new()),
                Arc::new(options),
            ))
        }

        #[tokio::test]
        async fn process_fetches_robots_once_and_honors_disallow() {
            let server = MockServer::start().await;
            Mock::given(method("GET"))
                .and(wm_path("/robots.txt"))
                .respond_with(ResponseTemplate::new(200).set_body_string("User-agent: *\nDisallow: /private\n"))
                .mount(&server)
                .await;
            Mock::given(method("GET"))
                .and(wm_path("/private/secret"))
                .respond_with(ResponseTemplate::new(200).set_body_string("should never be fetched"))
                .mount(&server)
                .await;

            let store = Arc::new(DuckDbStore::open(":memory:", "pages").unwrap());
            store.ensure_schema().await.unwrap();
            let mut options = CrawlOptions::new("TestBot/1.0");
            options.log_skipped = true;
            let host = server
                .uri()
                .trim_start_matches("http://")
                .to_string();
            let pool = pool(store, options);

            let url = format!("{}/private/secret", server.uri());
            let entry = QueueEntry::new(url.clone(), "k1".to_string(), host.clone(), Instant::now());
            pool.process(entry).await;

            assert!(pool.hosts.is_allowed(&host, "/public"));
            assert!(!pool.hosts.is_allowed(&host, "/private/secret"));
            // A second URL for the same host must not trigger a second
            // robots.txt fetch (`needs_robots_fetch` only returns true once).
            assert!(!pool.hosts.needs_robots_fetch(&host));
        }

        #[tokio::test]
        async fn process_without_robots_check_fetches_normally() {
            let server = MockServer::start().await;
            Mock::given(method("GET"))
                .and(wm_path("/page"))
                .respond_with(ResponseTemplate::new(200).set_body_string("hi"))
                .mount(&server)
                .await;

            let store = Arc::new(DuckDbStore::open(":memory:", "pages").unwrap());
            store.ensure_schema().await.unwrap();
            let mut options = CrawlOptions::new("TestBot/1.0");
            options.respect_robots_txt = false;
            let host = server.uri().trim_start_matches("http://").to_string();
            let pool = pool(store, options);

            let url = format!("{}/page", server.uri());
            let entry = QueueEntry::new(url, "k2".to_string(), host, Instant::now());
            pool.process(entry).await;
            pool.flush_if_any().await;

            let prior = pool.store.find_prior(&format!("{}/page", server.uri())).await.unwrap();
            assert!(prior.is_some());
        }
    }
}
