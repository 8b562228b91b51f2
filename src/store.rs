//! Persistence and merge semantics against the embedding analytic engine
//! (spec §4.H, §6): "a connection that executes parameterized statements and
//! COPYs batches". The `duckdb` crate (gated behind the `duckdb` feature,
//! paired with `sha2`/`hex` for content hashing) is the concrete stand-in for
//! that connection; every blocking call runs inside `spawn_blocking` so the
//! async worker pool never stalls on it.

use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};

use crate::config::validate_identifier;
use crate::error::{CrawlError, ErrorType};
use crate::queue::QueueEntry;
use crate::sitemap::DatedUrl;

/// One row of the target table (spec §6 schema).
#[derive(Debug, Clone)]
pub struct ResultRow {
    pub url: String,
    pub surt_key: String,
    pub domain: String,
    pub http_status: i32,
    pub body: Option<String>,
    pub content_type: Option<String>,
    pub elapsed_ms: i64,
    pub crawled_at: DateTime<Utc>,
    pub error: Option<String>,
    pub error_type: Option<ErrorType>,
    pub etag: Option<String>,
    pub last_modified: Option<String>,
    pub content_hash: Option<String>,
    pub is_deleted: bool,
}

#[derive(Debug, Clone, Default)]
pub struct ProgressCounters {
    pub total_discovered: u64,
    pub processed: u64,
    pub succeeded: u64,
    pub failed: u64,
    pub skipped: u64,
    pub in_flight: u64,
    pub queue_depth: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunStatus {
    Running,
    Draining,
    Done,
    Cancelled,
    Errored,
}

impl RunStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            RunStatus::Running => "running",
            RunStatus::Draining => "draining",
            RunStatus::Done => "done",
            RunStatus::Cancelled => "cancelled",
            RunStatus::Errored => "errored",
        }
    }
}

/// Matched-row predicate for `merge-into` (spec §4.H MATCHED clause).
pub type MergePredicate = Box<dyn Fn(&DateTime<Utc>) -> bool + Send + Sync>;

#[cfg(feature = "duckdb")]
mod backend {
    use super::*;
    use duckdb::{params, Connection};

    /// Serializes every write against the target table, matching spec §5
    /// "writer mutex: serializes batch flushes and merge operations".
    pub struct DuckDbStore {
        conn: Arc<Mutex<Connection>>,
        target: String,
    }

    impl DuckDbStore {
        pub fn open(path: &str, target: &str) -> Result<Self, CrawlError> {
            validate_identifier(target)?;
            let conn = if path == ":memory:" {
                Connection::open_in_memory()
            } else {
                Connection::open(path)
            }
            .map_err(|e| CrawlError::Store(anyhow::anyhow!(e)))?;
            Ok(Self {
                conn: Arc::new(Mutex::new(conn)),
                target: target.to_string(),
            })
        }

        /// Creates the target table (if absent) plus the auxiliary tables
        /// named in spec §6: `_crawl_queue_{target}`,
        /// `_crawl_progress_{target}`, shared `_sitemap_cache` and
        /// `_discovery_status`.
        pub async fn ensure_schema(&self) -> Result<(), CrawlError> {
            let conn = self.conn.clone();
            let target = self.target.clone();
            tokio::task::spawn_blocking(move || {
                let conn = conn.lock().unwrap_or_else(|e| e.into_inner());
                conn.execute_batch(&format!(
                    "CREATE TABLE IF NOT EXISTS \"{target}\" (
                        url TEXT PRIMARY KEY,
                        surt_key TEXT,
                        domain TEXT,
                        http_status INTEGER,
                        body TEXT,
                        content_type TEXT,
                        elapsed_ms BIGINT,
                        crawled_at TIMESTAMP,
                        error TEXT,
                        error_type TEXT,
                        etag TEXT,
                        last_modified TEXT,
                        content_hash TEXT,
                        is_deleted BOOLEAN DEFAULT FALSE
                    );
                    CREATE INDEX IF NOT EXISTS \"{target}_surt_idx\" ON \"{target}\" (surt_key);
                    CREATE INDEX IF NOT EXISTS \"{target}_host_idx\" ON \"{target}\" (domain, crawled_at);

                    CREATE TABLE IF NOT EXISTS \"_crawl_queue_{target}\" (
                        surt_key TEXT PRIMARY KEY,
                        url TEXT,
                        host TEXT,
                        enqueued_at TIMESTAMP,
                        earliest_due_at TIMESTAMP,
                        attempt_count INTEGER,
                        last_error_type TEXT
                    );

                    CREATE TABLE IF NOT EXISTS \"_crawl_progress_{target}\" (
                        run_id TEXT PRIMARY KEY,
                        target_table TEXT,
                        started_at TIMESTAMP,
                        updated_at TIMESTAMP,
                        total_discovered BIGINT,
                        processed BIGINT,
                        succeeded BIGINT,
                        failed BIGINT,
                        skipped BIGINT,
                        in_flight BIGINT,
                        queue_depth BIGINT,
                        status TEXT
                    );

                    CREATE TABLE IF NOT EXISTS _sitemap_cache (
                        host TEXT,
                        sitemap_url TEXT,
                        discovered_urls TEXT,
                        discovered_at TIMESTAMP,
                        PRIMARY KEY (host, sitemap_url)
                    );

                    CREATE TABLE IF NOT EXISTS _discovery_status (
                        host TEXT PRIMARY KEY,
                        last_success_at TIMESTAMP,
                        discovered_count BIGINT,
                        cursor TEXT
                    );"
                ))
                .map_err(|e| CrawlError::Store(anyhow::anyhow!(e)))
            })
            .await
            .map_err(|e| CrawlError::Store(anyhow::anyhow!(e)))?
        }

        /// Bulk-loads `rows` via `Appender` (the crate's COPY-batch
        /// analogue); a row whose `url` already exists is updated in place
        /// (spec §4.H "Batch insert").
        pub async fn flush_batch(&self, rows: Vec<ResultRow>) -> Result<(), CrawlError> {
            if rows.is_empty() {
                return Ok(());
            }
            let conn = self.conn.clone();
            let target = self.target.clone();
            tokio::task::spawn_blocking(move || {
                let conn = conn.lock().unwrap_or_else(|e| e.into_inner());
                for row in &rows {
                    conn.execute(
                        &format!(
                            "INSERT INTO \"{target}\" (url, surt_key, domain, http_status, body,
                                content_type, elapsed_ms, crawled_at, error, error_type, etag,
                                last_modified, content_hash, is_deleted)
                             VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
                             ON CONFLICT (url) DO UPDATE SET
                                surt_key = excluded.surt_key,
                                domain = excluded.domain,
                                http_status = excluded.http_status,
                                body = excluded.body,
                                content_type = excluded.content_type,
                                elapsed_ms = excluded.elapsed_ms,
                                crawled_at = excluded.crawled_at,
                                error = excluded.error,
                                error_type = excluded.error_type,
                                etag = excluded.etag,
                                last_modified = excluded.last_modified,
                                content_hash = excluded.content_hash,
                                is_deleted = excluded.is_deleted"
                        ),
                        params![
                            row.url,
                            row.surt_key,
                            row.domain,
                            row.http_status,
                            row.body,
                            row.content_type,
                            row.elapsed_ms,
                            row.crawled_at.to_rfc3339(),
                            row.error,
                            row.error_type.map(|e| e.as_str().to_string()),
                            row.etag,
                            row.last_modified,
                            row.content_hash,
                            row.is_deleted,
                        ],
                    )
                    .map_err(|e| CrawlError::Store(anyhow::anyhow!(e)))?;
                }
                Ok(())
            })
            .await
            .map_err(|e| CrawlError::Store(anyhow::anyhow!(e)))?
        }

        /// Looks up the prior row for `url` to build conditional headers
        /// (ETag / Last-Modified) and, on a future `304`, to reuse its
        /// body/hash (spec §4.G steps 3 and 6).
        pub async fn find_prior(&self, url: &str) -> Result<Option<ResultRow>, CrawlError> {
            let conn = self.conn.clone();
            let target = self.target.clone();
            let url = url.to_string();
            tokio::task::spawn_blocking(move || {
                let conn = conn.lock().unwrap_or_else(|e| e.into_inner());
                let mut stmt = conn
                    .prepare(&format!(
                        "SELECT url, surt_key, domain, http_status, body, content_type,
                                elapsed_ms, crawled_at, error, error_type, etag, last_modified,
                                content_hash, is_deleted
                         FROM \"{target}\" WHERE url = ?"
                    ))
                    .map_err(|e| CrawlError::Store(anyhow::anyhow!(e)))?;
                let mut rows = stmt
                    .query(params![url])
                    .map_err(|e| CrawlError::Store(anyhow::anyhow!(e)))?;
                if let Some(row) = rows.next().map_err(|e| CrawlError::Store(anyhow::anyhow!(e)))? {
                    Ok(Some(row_from_sql(row)?))
                } else {
                    Ok(None)
                }
            })
            .await
            .map_err(|e| CrawlError::Store(anyhow::anyhow!(e)))?
        }

        /// Runs the three merge clauses of spec §4.H against `source_rows`,
        /// matching on exact `url` string: updates MATCHED rows that pass
        /// `predicate`, inserts NOT MATCHED rows, and tombstones target rows
        /// absent from `source_rows` (NOT MATCHED BY SOURCE).
        pub async fn merge(
            &self,
            source_rows: Vec<ResultRow>,
            predicate: MergePredicate,
        ) -> Result<MergeSummary, CrawlError> {
            let conn = self.conn.clone();
            let target = self.target.clone();
            tokio::task::spawn_blocking(move || {
                let mut conn = conn.lock().unwrap_or_else(|e| e.into_inner());
                let tx = conn
                    .transaction()
                    .map_err(|e| CrawlError::Store(anyhow::anyhow!(e)))?;

                let existing: std::collections::HashSet<String> = {
                    let mut stmt = tx
                        .prepare(&format!("SELECT url FROM \"{target}\""))
                        .map_err(|e| CrawlError::Store(anyhow::anyhow!(e)))?;
                    let mut rows = stmt
                        .query([])
                        .map_err(|e| CrawlError::Store(anyhow::anyhow!(e)))?;
                    let mut set = std::collections::HashSet::new();
                    while let Some(row) =
                        rows.next().map_err(|e| CrawlError::Store(anyhow::anyhow!(e)))?
                    {
                        set.insert(row.get::<_, String>(0).map_err(|e| CrawlError::Store(anyhow::anyhow!(e)))?);
                    }
                    set
                };

                let source_urls: std::collections::HashSet<String> =
                    source_rows.iter().map(|r| r.url.clone()).collect();

                let mut summary = MergeSummary::default();
                for row in &source_rows {
                    if existing.contains(&row.url) {
                        if predicate(&row.crawled_at) {
                            tx.execute(
                                &format!(
                                    "UPDATE \"{target}\" SET surt_key=?, domain=?, http_status=?,
                                        body=?, content_type=?, elapsed_ms=?, crawled_at=?, error=?,
                                        error_type=?, etag=?, last_modified=?, content_hash=?,
                                        is_deleted=FALSE
                                     WHERE url=?"
                                ),
                                params![
                                    row.surt_key,
                                    row.domain,
                                    row.http_status,
                                    row.body,
                                    row.content_type,
                                    row.elapsed_ms,
                                    row.crawled_at.to_rfc3339(),
                                    row.error,
                                    row.error_type.map(|e| e.as_str().to_string()),
                                    row.etag,
                                    row.last_modified,
                                    row.content_hash,
                                    row.url,
                                ],
                            )
                            .map_err(|e| CrawlError::Store(anyhow::anyhow!(e)))?;
                            summary.updated += 1;
                        }
                    } else {
                        tx.execute(
                            &format!(
                                "INSERT INTO \"{target}\" (url, surt_key, domain, http_status, body,
                                    content_type, elapsed_ms, crawled_at, error, error_type, etag,
                                    last_modified, content_hash, is_deleted)
                                 VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, FALSE)"
                            ),
                            params![
                                row.url,
                                row.surt_key,
                                row.domain,
                                row.http_status,
                                row.body,
                                row.content_type,
                                row.elapsed_ms,
                                row.crawled_at.to_rfc3339(),
                                row.error,
                                row.error_type.map(|e| e.as_str().to_string()),
                                row.etag,
                                row.last_modified,
                                row.content_hash,
                            ],
                        )
                        .map_err(|e| CrawlError::Store(anyhow::anyhow!(e)))?;
                        summary.inserted += 1;
                    }
                }

                for url in existing.difference(&source_urls) {
                    tx.execute(
                        &format!("UPDATE \"{target}\" SET is_deleted = TRUE WHERE url = ?"),
                        params![url],
                    )
                    .map_err(|e| CrawlError::Store(anyhow::anyhow!(e)))?;
                    summary.tombstoned += 1;
                }

                tx.commit().map_err(|e| CrawlError::Store(anyhow::anyhow!(e)))?;
                Ok(summary)
            })
            .await
            .map_err(|e| CrawlError::Store(anyhow::anyhow!(e)))?
        }

        pub async fn upsert_progress(
            &self,
            run_id: &str,
            started_at: DateTime<Utc>,
            counters: &ProgressCounters,
            status: RunStatus,
        ) -> Result<(), CrawlError> {
            let conn = self.conn.clone();
            let target = self.target.clone();
            let run_id = run_id.to_string();
            let counters = counters.clone();
            tokio::task::spawn_blocking(move || {
                let conn = conn.lock().unwrap_or_else(|e| e.into_inner());
                conn.execute(
                    &format!(
                        "INSERT INTO \"_crawl_progress_{target}\" (run_id, target_table, started_at,
                            updated_at, total_discovered, processed, succeeded, failed, skipped,
                            in_flight, queue_depth, status)
                         VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
                         ON CONFLICT (run_id) DO UPDATE SET
                            updated_at = excluded.updated_at,
                            total_discovered = excluded.total_discovered,
                            processed = excluded.processed,
                            succeeded = excluded.succeeded,
                            failed = excluded.failed,
                            skipped = excluded.skipped,
                            in_flight = excluded.in_flight,
                            queue_depth = excluded.queue_depth,
                            status = excluded.status"
                    ),
                    params![
                        run_id,
                        target,
                        started_at.to_rfc3339(),
                        Utc::now().to_rfc3339(),
                        counters.total_discovered as i64,
                        counters.processed as i64,
                        counters.succeeded as i64,
                        counters.failed as i64,
                        counters.skipped as i64,
                        counters.in_flight as i64,
                        counters.queue_depth as i64,
                        status.as_str(),
                    ],
                )
                .map(|_| ())
                .map_err(|e| CrawlError::Store(anyhow::anyhow!(e)))
            })
            .await
            .map_err(|e| CrawlError::Store(anyhow::anyhow!(e)))?
        }

        pub async fn save_sitemap_cache(
            &self,
            host: &str,
            sitemap_url: &str,
            urls: &[DatedUrl],
        ) -> Result<(), CrawlError> {
            let conn = self.conn.clone();
            let host = host.to_string();
            let sitemap_url = sitemap_url.to_string();
            let payload = serde_urls(urls);
            tokio::task::spawn_blocking(move || {
                let conn = conn.lock().unwrap_or_else(|e| e.into_inner());
                conn.execute(
                    "INSERT INTO _sitemap_cache (host, sitemap_url, discovered_urls, discovered_at)
                     VALUES (?, ?, ?, ?)
                     ON CONFLICT (host, sitemap_url) DO UPDATE SET
                        discovered_urls = excluded.discovered_urls,
                        discovered_at = excluded.discovered_at",
                    params![host, sitemap_url, payload, Utc::now().to_rfc3339()],
                )
                .map(|_| ())
                .map_err(|e| CrawlError::Store(anyhow::anyhow!(e)))
            })
            .await
            .map_err(|e| CrawlError::Store(anyhow::anyhow!(e)))?
        }

        pub async fn load_sitemap_cache(
            &self,
            sitemap_url: &str,
            ttl: Duration,
        ) -> Result<Option<Vec<DatedUrl>>, CrawlError> {
            let conn = self.conn.clone();
            let sitemap_url = sitemap_url.to_string();
            tokio::task::spawn_blocking(move || {
                let conn = conn.lock().unwrap_or_else(|e| e.into_inner());
                let mut stmt = conn
                    .prepare(
                        "SELECT discovered_urls, discovered_at FROM _sitemap_cache WHERE sitemap_url = ?",
                    )
                    .map_err(|e| CrawlError::Store(anyhow::anyhow!(e)))?;
                let mut rows = stmt
                    .query(params![sitemap_url])
                    .map_err(|e| CrawlError::Store(anyhow::anyhow!(e)))?;
                if let Some(row) = rows.next().map_err(|e| CrawlError::Store(anyhow::anyhow!(e)))? {
                    let payload: String = row.get(0).map_err(|e| CrawlError::Store(anyhow::anyhow!(e)))?;
                    let discovered_at: String =
                        row.get(1).map_err(|e| CrawlError::Store(anyhow::anyhow!(e)))?;
                    let discovered_at = DateTime::parse_from_rfc3339(&discovered_at)
                        .map(|d| d.with_timezone(&Utc))
                        .unwrap_or_else(|_| Utc::now());
                    if Utc::now().signed_duration_since(discovered_at)
                        > chrono::Duration::from_std(ttl).unwrap_or(chrono::Duration::zero())
                    {
                        return Ok(None);
                    }
                    Ok(Some(deserialize_urls(&payload)))
                } else {
                    Ok(None)
                }
            })
            .await
            .map_err(|e| CrawlError::Store(anyhow::anyhow!(e)))?
        }

        /// Mirrors `entry` into `_crawl_queue_{target}` (spec §3 "persistent
        /// queue row", §4.F "mirrored durably"). Called on every enqueue and
        /// re-enqueue so a crashed run can be resumed by reloading this
        /// table into a fresh heap (`load_queue_entries`).
        pub async fn upsert_queue_entry(&self, entry: &QueueEntry) -> Result<(), CrawlError> {
            let conn = self.conn.clone();
            let target = self.target.clone();
            let surt_key = entry.surt_key.clone();
            let url = entry.url.clone();
            let host = entry.host.clone();
            let attempt_count = entry.attempt_count as i64;
            let last_error_type = entry.last_error_type.map(|e| e.as_str().to_string());

            // `Instant` has no absolute wall-clock mapping; translate both
            // timestamps to UTC by anchoring them on "now" at persist time.
            let now_instant = Instant::now();
            let now_utc = Utc::now();
            let enqueued_at = instant_to_utc(entry.enqueued_at, now_instant, now_utc);
            let earliest_due_at = instant_to_utc(entry.earliest_due_at, now_instant, now_utc);

            tokio::task::spawn_blocking(move || {
                let conn = conn.lock().unwrap_or_else(|e| e.into_inner());
                conn.execute(
                    &format!(
                        "INSERT INTO \"_crawl_queue_{target}\" (surt_key, url, host, enqueued_at,
                            earliest_due_at, attempt_count, last_error_type)
                         VALUES (?, ?, ?, ?, ?, ?, ?)
                         ON CONFLICT (surt_key) DO UPDATE SET
                            url = excluded.url,
                            host = excluded.host,
                            earliest_due_at = excluded.earliest_due_at,
                            attempt_count = excluded.attempt_count,
                            last_error_type = excluded.last_error_type"
                    ),
                    params![
                        surt_key,
                        url,
                        host,
                        enqueued_at.to_rfc3339(),
                        earliest_due_at.to_rfc3339(),
                        attempt_count,
                        last_error_type,
                    ],
                )
                .map(|_| ())
                .map_err(|e| CrawlError::Store(anyhow::anyhow!(e)))
            })
            .await
            .map_err(|e| CrawlError::Store(anyhow::anyhow!(e)))?
        }

        /// Removes `surt_key` from the durable queue mirror once a terminal
        /// outcome has been written for it (spec §3 "removed on terminal
        /// outcome").
        pub async fn delete_queue_entry(&self, surt_key: &str) -> Result<(), CrawlError> {
            let conn = self.conn.clone();
            let target = self.target.clone();
            let surt_key = surt_key.to_string();
            tokio::task::spawn_blocking(move || {
                let conn = conn.lock().unwrap_or_else(|e| e.into_inner());
                conn.execute(
                    &format!("DELETE FROM \"_crawl_queue_{target}\" WHERE surt_key = ?"),
                    params![surt_key],
                )
                .map(|_| ())
                .map_err(|e| CrawlError::Store(anyhow::anyhow!(e)))
            })
            .await
            .map_err(|e| CrawlError::Store(anyhow::anyhow!(e)))?
        }

        /// Reloads every row left in `_crawl_queue_{target}` into fresh
        /// `QueueEntry` values, so a run that crashed or was aborted mid-way
        /// resumes exactly where it left off (spec §4.F, §8 invariant 7). A
        /// persisted due-time in the past becomes due immediately.
        pub async fn load_queue_entries(&self) -> Result<Vec<QueueEntry>, CrawlError> {
            let conn = self.conn.clone();
            let target = self.target.clone();
            tokio::task::spawn_blocking(move || {
                let conn = conn.lock().unwrap_or_else(|e| e.into_inner());
                let mut stmt = conn
                    .prepare(&format!(
                        "SELECT surt_key, url, host, enqueued_at, earliest_due_at, attempt_count,
                                last_error_type
                         FROM \"_crawl_queue_{target}\""
                    ))
                    .map_err(|e| CrawlError::Store(anyhow::anyhow!(e)))?;
                let mut rows = stmt
                    .query([])
                    .map_err(|e| CrawlError::Store(anyhow::anyhow!(e)))?;

                let now_instant = Instant::now();
                let now_utc = Utc::now();
                let mut out = Vec::new();
                while let Some(row) =
                    rows.next().map_err(|e| CrawlError::Store(anyhow::anyhow!(e)))?
                {
                    let err = |e: duckdb::Error| CrawlError::Store(anyhow::anyhow!(e));
                    let surt_key: String = row.get(0).map_err(err)?;
                    let url: String = row.get(1).map_err(err)?;
                    let host: String = row.get(2).map_err(err)?;
                    let enqueued_at: String = row.get(3).map_err(err)?;
                    let earliest_due_at: String = row.get(4).map_err(err)?;
                    let attempt_count: i64 = row.get(5).map_err(err)?;
                    let last_error_type: Option<String> = row.get(6).map_err(err)?;

                    let enqueued_instant = utc_str_to_instant(&enqueued_at, now_instant, now_utc);
                    let due_instant = utc_str_to_instant(&earliest_due_at, now_instant, now_utc);

                    out.push(QueueEntry {
                        url,
                        surt_key,
                        host,
                        enqueued_at: enqueued_instant,
                        earliest_due_at: due_instant,
                        attempt_count: attempt_count as u32,
                        last_error_type: last_error_type.as_deref().and_then(parse_error_type),
                    });
                }
                Ok(out)
            })
            .await
            .map_err(|e| CrawlError::Store(anyhow::anyhow!(e)))?
        }

        /// Records a successful discovery pass for `host` (spec §3
        /// "Discovery status row").
        pub async fn save_discovery_status(
            &self,
            host: &str,
            discovered_count: u64,
        ) -> Result<(), CrawlError> {
            let conn = self.conn.clone();
            let host = host.to_string();
            tokio::task::spawn_blocking(move || {
                let conn = conn.lock().unwrap_or_else(|e| e.into_inner());
                conn.execute(
                    "INSERT INTO _discovery_status (host, last_success_at, discovered_count, cursor)
                     VALUES (?, ?, ?, NULL)
                     ON CONFLICT (host) DO UPDATE SET
                        last_success_at = excluded.last_success_at,
                        discovered_count = excluded.discovered_count",
                    params![host, Utc::now().to_rfc3339(), discovered_count as i64],
                )
                .map(|_| ())
                .map_err(|e| CrawlError::Store(anyhow::anyhow!(e)))
            })
            .await
            .map_err(|e| CrawlError::Store(anyhow::anyhow!(e)))?
        }

        /// Looks up the last discovery pass for `host`, used to log a resume
        /// hint before a fresh discovery run (spec §3 "Discovery status row",
        /// "cursor into URL stream (resume hint)").
        pub async fn load_discovery_status(
            &self,
            host: &str,
        ) -> Result<Option<DiscoveryStatus>, CrawlError> {
            let conn = self.conn.clone();
            let host = host.to_string();
            tokio::task::spawn_blocking(move || {
                let conn = conn.lock().unwrap_or_else(|e| e.into_inner());
                let mut stmt = conn
                    .prepare(
                        "SELECT last_success_at, discovered_count FROM _discovery_status WHERE host = ?",
                    )
                    .map_err(|e| CrawlError::Store(anyhow::anyhow!(e)))?;
                let mut rows = stmt
                    .query(params![host])
                    .map_err(|e| CrawlError::Store(anyhow::anyhow!(e)))?;
                if let Some(row) = rows.next().map_err(|e| CrawlError::Store(anyhow::anyhow!(e)))? {
                    let last_success_at: String =
                        row.get(0).map_err(|e| CrawlError::Store(anyhow::anyhow!(e)))?;
                    let discovered_count: i64 =
                        row.get(1).map_err(|e| CrawlError::Store(anyhow::anyhow!(e)))?;
                    Ok(Some(DiscoveryStatus {
                        last_success_at: DateTime::parse_from_rfc3339(&last_success_at)
                            .map(|d| d.with_timezone(&Utc))
                            .unwrap_or_else(|_| Utc::now()),
                        discovered_count: discovered_count as u64,
                    }))
                } else {
                    Ok(None)
                }
            })
            .await
            .map_err(|e| CrawlError::Store(anyhow::anyhow!(e)))?
        }
    }

    /// Translates a monotonic `Instant` into an absolute UTC timestamp by
    /// anchoring on `(now_instant, now_utc)` captured at the same moment.
    fn instant_to_utc(t: Instant, now_instant: Instant, now_utc: DateTime<Utc>) -> DateTime<Utc> {
        if t >= now_instant {
            let offset = t.duration_since(now_instant);
            now_utc + chrono::Duration::from_std(offset).unwrap_or_else(|_| chrono::Duration::zero())
        } else {
            let offset = now_instant.duration_since(t);
            now_utc - chrono::Duration::from_std(offset).unwrap_or_else(|_| chrono::Duration::zero())
        }
    }

    /// Inverse of `instant_to_utc`: a persisted absolute timestamp becomes a
    /// fresh `Instant` relative to this run's clock. A timestamp in the past
    /// (including malformed input) becomes due immediately.
    fn utc_str_to_instant(s: &str, now_instant: Instant, now_utc: DateTime<Utc>) -> Instant {
        let Ok(parsed) = DateTime::parse_from_rfc3339(s) else {
            return now_instant;
        };
        let parsed = parsed.with_timezone(&Utc);
        let delta = parsed.signed_duration_since(now_utc);
        match delta.to_std() {
            Ok(d) => now_instant + d,
            Err(_) => now_instant,
        }
    }

    fn row_from_sql(row: &duckdb::Row) -> Result<ResultRow, CrawlError> {
        let err = |e: duckdb::Error| CrawlError::Store(anyhow::anyhow!(e));
        let crawled_at: String = row.get(7).map_err(err)?;
        Ok(ResultRow {
            url: row.get(0).map_err(err)?,
            surt_key: row.get(1).map_err(err)?,
            domain: row.get(2).map_err(err)?,
            http_status: row.get(3).map_err(err)?,
            body: row.get(4).map_err(err)?,
            content_type: row.get(5).map_err(err)?,
            elapsed_ms: row.get(6).map_err(err)?,
            crawled_at: DateTime::parse_from_rfc3339(&crawled_at)
                .map(|d| d.with_timezone(&Utc))
                .unwrap_or_else(|_| Utc::now()),
            error: row.get(8).map_err(err)?,
            error_type: row
                .get::<_, Option<String>>(9)
                .map_err(err)?
                .and_then(|s| parse_error_type(&s)),
            etag: row.get(10).map_err(err)?,
            last_modified: row.get(11).map_err(err)?,
            content_hash: row.get(12).map_err(err)?,
            is_deleted: row.get(13).map_err(err)?,
        })
    }

    fn serde_urls(urls: &[DatedUrl]) -> String {
        urls.iter()
            .map(|u| format!("{}|{}", u.url, u.last_modified.map(|d| d.to_rfc3339()).unwrap_or_default()))
            .collect::<Vec<_>>()
            .join("\n")
    }

    fn deserialize_urls(payload: &str) -> Vec<DatedUrl> {
        payload
            .lines()
            .filter(|l| !l.is_empty())
            .map(|l| {
                let mut parts = l.splitn(2, '|');
                let url = parts.next().unwrap_or_default().to_string();
                let lastmod = parts
                    .next()
                    .filter(|s| !s.is_empty())
                    .and_then(|s| DateTime::parse_from_rfc3339(s).ok())
                    .map(|d| d.with_timezone(&Utc));
                DatedUrl { url, last_modified: lastmod }
            })
            .collect()
    }
}

#[cfg(feature = "duckdb")]
pub use backend::DuckDbStore;

fn parse_error_type(s: &str) -> Option<ErrorType> {
    Some(match s {
        "network_timeout" => ErrorType::NetworkTimeout,
        "network_dns_failure" => ErrorType::NetworkDnsFailure,
        "network_connection_refused" => ErrorType::NetworkConnectionRefused,
        "network_ssl_error" => ErrorType::NetworkSslError,
        "http_client_error" => ErrorType::HttpClientError,
        "http_server_error" => ErrorType::HttpServerError,
        "http_rate_limited" => ErrorType::HttpRateLimited,
        "content_too_large" => ErrorType::ContentTooLarge,
        "content_type_rejected" => ErrorType::ContentTypeRejected,
        "robots_disallowed" => ErrorType::RobotsDisallowed,
        "redirect_loop" => ErrorType::RedirectLoop,
        "sitemap_parse_error" => ErrorType::SitemapParseError,
        "invalid_url" => ErrorType::InvalidUrl,
        _ => return None,
    })
}

#[derive(Debug, Clone, Default)]
pub struct MergeSummary {
    pub inserted: u64,
    pub updated: u64,
    pub tombstoned: u64,
}

/// Last recorded discovery pass for a host (`_discovery_status` row).
#[derive(Debug, Clone)]
pub struct DiscoveryStatus {
    pub last_success_at: DateTime<Utc>,
    pub discovered_count: u64,
}

#[cfg(all(test, feature = "duckdb"))]
mod tests {
    use super::*;

    fn row(url: &str, crawled_at: DateTime<Utc>) -> ResultRow {
        ResultRow {
            url: url.to_string(),
            surt_key: format!("com,example)/{url}"),
            domain: "example.com".to_string(),
            http_status: 200,
            body: Some("<html></html>".to_string()),
            content_type: Some("text/html".to_string()),
            elapsed_ms: 42,
            crawled_at,
            error: None,
            error_type: None,
            etag: None,
            last_modified: None,
            content_hash: Some("deadbeef".to_string()),
            is_deleted: false,
        }
    }

    #[tokio::test]
    async fn schema_and_flush_roundtrip() {
        let store = DuckDbStore::open(":memory:", "pages").unwrap();
        store.ensure_schema().await.unwrap();
        store.flush_batch(vec![row("https://example.com/a", Utc::now())]).await.unwrap();
        let prior = store.find_prior("https://example.com/a").await.unwrap();
        assert!(prior.is_some());
        assert_eq!(prior.unwrap().content_hash.as_deref(), Some("deadbeef"));
    }

    #[tokio::test]
    async fn flush_upserts_on_conflict() {
        let store = DuckDbStore::open(":memory:", "pages").unwrap();
        store.ensure_schema().await.unwrap();
        store.flush_batch(vec![row("https://example.com/a", Utc::now())]).await.unwrap();
        let mut updated = row("https://example.com/a", Utc::now());
        updated.http_status = 404;
        store.flush_batch(vec![updated]).await.unwrap();
        let prior = store.find_prior("https://example.com/a").await.unwrap().unwrap();
        assert_eq!(prior.http_status, 404);
    }

    #[tokio::test]
    async fn merge_completeness_invariant() {
        let store = DuckDbStore::open(":memory:", "pages").unwrap();
        store.ensure_schema().await.unwrap();
        let old = Utc::now() - chrono::Duration::hours(48);
        store
            .flush_batch(vec![
                row("https://example.com/u1", old),
                row("https://example.com/u2", old),
                row("https://example.com/u3", old),
            ])
            .await
            .unwrap();

        let fresh = Utc::now();
        let source = vec![row("https://example.com/u1", fresh), row("https://example.com/u4", fresh)];
        let summary = store
            .merge(source, Box::new(|crawled_at| Utc::now().signed_duration_since(*crawled_at) > chrono::Duration::hours(24)))
            .await
            .unwrap();

        assert_eq!(summary.inserted, 1);
        assert_eq!(summary.updated, 1);
        assert_eq!(summary.tombstoned, 2);

        let u2 = store.find_prior("https://example.com/u2").await.unwrap().unwrap();
        assert!(u2.is_deleted);
        let u1 = store.find_prior("https://example.com/u1").await.unwrap().unwrap();
        assert!(!u1.is_deleted);
    }

    #[tokio::test]
    async fn rejects_unsafe_identifier() {
        assert!(DuckDbStore::open(":memory:", "pages; drop table x").is_err());
    }

    #[tokio::test]
    async fn sitemap_cache_roundtrip_and_expiry() {
        let store = DuckDbStore::open(":memory:", "pages").unwrap();
        store.ensure_schema().await.unwrap();
        let urls = vec![DatedUrl { url: "https://example.com/a".into(), last_modified: None }];
        store.save_sitemap_cache("example.com", "https://example.com/sitemap.xml", &urls).await.unwrap();
        let cached = store
            .load_sitemap_cache("https://example.com/sitemap.xml", Duration::from_secs(3600))
            .await
            .unwrap();
        assert_eq!(cached.unwrap().len(), 1);

        let expired = store
            .load_sitemap_cache("https://example.com/sitemap.xml", Duration::from_nanos(1))
            .await
            .unwrap();
        assert!(expired.is_none());
    }

    #[tokio::test]
    async fn queue_mirror_roundtrips_and_deletes() {
        let store = DuckDbStore::open(":memory:", "pages").unwrap();
        store.ensure_schema().await.unwrap();

        let entry = QueueEntry::new(
            "https://example.com/a".to_string(),
            "com,example)/a".to_string(),
            "example.com".to_string(),
            Instant::now(),
        );
        store.upsert_queue_entry(&entry).await.unwrap();

        let reloaded = store.load_queue_entries().await.unwrap();
        assert_eq!(reloaded.len(), 1);
        assert_eq!(reloaded[0].surt_key, "com,example)/a");

        store.delete_queue_entry(&entry.surt_key).await.unwrap();
        let reloaded = store.load_queue_entries().await.unwrap();
        assert!(reloaded.is_empty());
    }

    #[tokio::test]
    async fn queue_mirror_upsert_overwrites_by_surt_key() {
        let store = DuckDbStore::open(":memory:", "pages").unwrap();
        store.ensure_schema().await.unwrap();

        let mut entry = QueueEntry::new(
            "https://example.com/a".to_string(),
            "com,example)/a".to_string(),
            "example.com".to_string(),
            Instant::now(),
        );
        store.upsert_queue_entry(&entry).await.unwrap();

        entry.attempt_count = 3;
        entry.last_error_type = Some(ErrorType::HttpServerError);
        store.upsert_queue_entry(&entry).await.unwrap();

        let reloaded = store.load_queue_entries().await.unwrap();
        assert_eq!(reloaded.len(), 1);
        assert_eq!(reloaded[0].attempt_count, 3);
        assert_eq!(reloaded[0].last_error_type, Some(ErrorType::HttpServerError));
    }

    #[tokio::test]
    async fn discovery_status_roundtrip() {
        let store = DuckDbStore::open(":memory:", "pages").unwrap();
        store.ensure_schema().await.unwrap();

        assert!(store.load_discovery_status("example.com").await.unwrap().is_none());

        store.save_discovery_status("example.com", 42).await.unwrap();
        let status = store.load_discovery_status("example.com").await.unwrap().unwrap();
        assert_eq!(status.discovered_count, 42);

        store.save_discovery_status("example.com", 50).await.unwrap();
        let status = store.load_discovery_status("example.com").await.unwrap().unwrap();
        assert_eq!(status.discovered_count, 50);
    }
}
