//! Sitemap / robots-driven discovery (spec §4.D).

use std::collections::HashSet;
use std::sync::Arc;
use std::time::SystemTime;

use chrono::{DateTime, Utc};
use quick_xml::events::Event;
use quick_xml::Reader;

use crate::http_client::{FetchParams, HttpClient};
use crate::robots::{self, RobotsRules};
use crate::url_utils;

const MAX_RECURSION_DEPTH: u32 = 5;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SitemapEntry {
    Url(DatedUrl),
    Sitemap(String),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DatedUrl {
    pub url: String,
    pub last_modified: Option<DateTime<Utc>>,
}

/// Event-driven parse of a sitemap or sitemap-index body (grounded on
/// `StractOrg-stract`'s `core/src/sitemap.rs`, which walks `quick_xml`
/// events the same way for the same two document shapes).
pub fn parse_sitemap(body: &str) -> Vec<SitemapEntry> {
    let mut reader = Reader::from_str(body);
    let mut out = Vec::new();

    let mut in_sitemap_tag = false;
    let mut in_url_tag = false;
    let mut in_loc = false;
    let mut in_lastmod = false;
    let mut current_url: Option<String> = None;
    let mut current_lastmod: Option<DateTime<Utc>> = None;

    loop {
        match reader.read_event() {
            Ok(Event::Start(ref e)) => match e.name().as_ref() {
                b"sitemap" => in_sitemap_tag = true,
                b"url" => in_url_tag = true,
                b"loc" => in_loc = true,
                b"lastmod" => in_lastmod = true,
                _ => {}
            },
            Ok(Event::End(ref e)) => match e.name().as_ref() {
                b"sitemap" => in_sitemap_tag = false,
                b"url" => {
                    in_url_tag = false;
                    if let Some(url) = current_url.take() {
                        out.push(SitemapEntry::Url(DatedUrl {
                            url,
                            last_modified: current_lastmod.take(),
                        }));
                    }
                }
                b"loc" => in_loc = false,
                b"lastmod" => in_lastmod = false,
                _ => {}
            },
            Ok(Event::Text(e)) => {
                let Ok(text) = e.unescape() else { continue };
                let text = text.trim().to_string();
                if text.is_empty() {
                    continue;
                }
                if in_sitemap_tag && in_loc {
                    out.push(SitemapEntry::Sitemap(text));
                } else if in_url_tag && in_loc {
                    current_url = Some(text);
                } else if in_url_tag && in_lastmod {
                    current_lastmod = DateTime::parse_from_rfc3339(&text)
                        .ok()
                        .map(|d| d.with_timezone(&Utc));
                }
            }
            Ok(Event::Eof) => break,
            Err(_) => break,
            _ => {}
        }
    }

    out
}

/// A cache hook the engine wires to the store (spec §3 "Sitemap cache row").
/// Kept as a trait rather than a concrete type so discovery has no
/// dependency on the persistence backend.
#[async_trait::async_trait]
pub trait SitemapCache: Send + Sync {
    async fn get(&self, sitemap_url: &str, ttl: std::time::Duration) -> Option<Vec<DatedUrl>>;
    async fn put(&self, host: &str, sitemap_url: &str, urls: &[DatedUrl]);
}

/// No-op cache used when the caller doesn't want persistence (e.g. tests).
pub struct NullCache;

#[async_trait::async_trait]
impl SitemapCache for NullCache {
    async fn get(&self, _sitemap_url: &str, _ttl: std::time::Duration) -> Option<Vec<DatedUrl>> {
        None
    }
    async fn put(&self, _host: &str, _sitemap_url: &str, _urls: &[DatedUrl]) {}
}

pub struct DiscoveryResult {
    pub robots: RobotsRules,
    pub urls: Vec<DatedUrl>,
}

/// Discovers candidate URLs for `host`: fetches `robots.txt` (bypassing the
/// rate limiter, since it is itself the policy source), unions its
/// `Sitemap:` entries with `{scheme}://{host}/sitemap.xml`, then walks each
/// sitemap (recursively, capped at depth 5, each child visited once).
pub async fn discover(
    http: &Arc<HttpClient>,
    cache: &dyn SitemapCache,
    scheme: &str,
    host: &str,
    agent: &str,
    respect_robots: bool,
    sitemap_cache_ttl: std::time::Duration,
) -> DiscoveryResult {
    let robots_url = format!("{scheme}://{host}/robots.txt");
    let robots_resp = http
        .fetch(
            &robots_url,
            FetchParams::default(),
            2 * 1024 * 1024,
            &Default::default(),
            &Default::default(),
        )
        .await;

    let robots = if respect_robots && robots_resp.is_success() {
        let body = robots_resp
            .body
            .as_deref()
            .map(|b| String::from_utf8_lossy(b).into_owned())
            .unwrap_or_default();
        robots::parse(&body, agent)
    } else {
        RobotsRules::allow_all()
    };

    let mut sitemap_urls: Vec<String> = robots.sitemaps.clone();
    let default_sitemap = format!("{scheme}://{host}/sitemap.xml");
    if !sitemap_urls.contains(&default_sitemap) {
        sitemap_urls.push(default_sitemap);
    }

    let mut visited = HashSet::new();
    let mut urls = Vec::new();
    for sm_url in sitemap_urls {
        walk_sitemap(
            http,
            cache,
            host,
            &sm_url,
            0,
            sitemap_cache_ttl,
            &mut visited,
            &mut urls,
        )
        .await;
    }

    DiscoveryResult { robots, urls }
}

#[async_recursion::async_recursion]
async fn walk_sitemap(
    http: &Arc<HttpClient>,
    cache: &dyn SitemapCache,
    host: &str,
    sitemap_url: &str,
    depth: u32,
    ttl: std::time::Duration,
    visited: &mut HashSet<String>,
    out: &mut Vec<DatedUrl>,
) {
    if depth > MAX_RECURSION_DEPTH || !visited.insert(sitemap_url.to_string()) {
        return;
    }

    if let Some(cached) = cache.get(sitemap_url, ttl).await {
        out.extend(cached);
        return;
    }

    let resp = http
        .fetch(
            sitemap_url,
            FetchParams::default(),
            50 * 1024 * 1024,
            &Default::default(),
            &Default::default(),
        )
        .await;

    if !resp.is_success() {
        tracing::warn!(sitemap_url, "failed to fetch sitemap, skipping");
        return;
    }

    let Some(body) = resp.body.as_deref() else {
        return;
    };
    let text = String::from_utf8_lossy(body);
    let entries = parse_sitemap(&text);
    if entries.is_empty() && !text.trim().is_empty() {
        tracing::warn!(sitemap_url, "sitemap_parse_error, skipping subtree");
    }

    let mut direct_urls = Vec::new();
    for entry in entries {
        match entry {
            SitemapEntry::Url(dated) => direct_urls.push(dated.clone()),
            SitemapEntry::Sitemap(child) => {
                walk_sitemap(http, cache, host, &child, depth + 1, ttl, visited, out).await;
            }
        }
    }

    cache.put(host, sitemap_url, &direct_urls).await;
    out.extend(direct_urls);
}

/// Applies a `url LIKE` SQL pattern (`%` / `_` wildcards) as pushdown before
/// enqueuing discovered URLs (spec §4.D step 4).
pub fn like_filter<'a>(urls: &'a [DatedUrl], pattern: Option<&str>) -> Vec<&'a DatedUrl> {
    match pattern {
        None => urls.iter().collect(),
        Some(p) => {
            let re = like_to_regex(p);
            urls.iter().filter(|u| re.is_match(&u.url)).collect()
        }
    }
}

/// Minimal SQL `LIKE` matcher (`%` = any run, `_` = one char), implemented
/// without pulling in a regex engine since the grammar is tiny and fixed.
struct LikePattern {
    segments: Vec<LikeSeg>,
}

enum LikeSeg {
    Literal(String),
    AnyRun,
    AnyChar,
}

impl LikePattern {
    fn is_match(&self, input: &str) -> bool {
        match_segments(&self.segments, input)
    }
}

fn match_segments(segments: &[LikeSeg], input: &str) -> bool {
    match segments.split_first() {
        None => input.is_empty(),
        Some((LikeSeg::Literal(lit), rest)) => {
            input.starts_with(lit.as_str()) && match_segments(rest, &input[lit.len()..])
        }
        Some((LikeSeg::AnyChar, rest)) => match input.chars().next() {
            Some(c) => match_segments(rest, &input[c.len_utf8()..]),
            None => false,
        },
        Some((LikeSeg::AnyRun, rest)) => {
            if rest.is_empty() {
                return true;
            }
            for (idx, _) in input.char_indices().chain(std::iter::once((input.len(), ' '))) {
                if match_segments(rest, &input[idx..]) {
                    return true;
                }
            }
            false
        }
    }
}

fn like_to_regex(pattern: &str) -> LikePattern {
    let mut segments = Vec::new();
    let mut literal = String::new();
    for c in pattern.chars() {
        match c {
            '%' => {
                if !literal.is_empty() {
                    segments.push(LikeSeg::Literal(std::mem::take(&mut literal)));
                }
                segments.push(LikeSeg::AnyRun);
            }
            '_' => {
                if !literal.is_empty() {
                    segments.push(LikeSeg::Literal(std::mem::take(&mut literal)));
                }
                segments.push(LikeSeg::AnyChar);
            }
            c => literal.push(c),
        }
    }
    if !literal.is_empty() {
        segments.push(LikeSeg::Literal(literal));
    }
    LikePattern { segments }
}

/// `now - discovered_at > ttl` cache-expiry check (spec §3 sitemap cache row).
pub fn is_cache_expired(discovered_at: SystemTime, ttl: std::time::Duration) -> bool {
    SystemTime::now()
        .duration_since(discovered_at)
        .map(|age| age > ttl)
        .unwrap_or(false)
}

/// Used by `update_stale`: whether a sitemap `lastmod` postdates the stored
/// `crawled_at`, meaning the row should be re-fetched even if it errored
/// last time (spec §9 open question, resolved canonically: yes).
pub fn is_stale(lastmod: Option<DateTime<Utc>>, crawled_at: Option<DateTime<Utc>>) -> bool {
    match (lastmod, crawled_at) {
        (Some(lm), Some(ca)) => lm > ca,
        (Some(_), None) => true,
        _ => false,
    }
}

pub fn is_crawlable_dated_url(u: &DatedUrl) -> bool {
    url_utils::normalize(&u.url, None).is_ok()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_sitemap_index() {
        let xml = r#"<sitemapindex>
            <sitemap><loc>https://example.com/a.xml</loc></sitemap>
            <sitemap><loc>https://example.com/b.xml</loc></sitemap>
        </sitemapindex>"#;
        let entries = parse_sitemap(xml);
        assert_eq!(
            entries,
            vec![
                SitemapEntry::Sitemap("https://example.com/a.xml".into()),
                SitemapEntry::Sitemap("https://example.com/b.xml".into()),
            ]
        );
    }

    #[test]
    fn parses_urlset_with_lastmod() {
        let xml = r#"<urlset>
            <url><loc>https://example.com/product/1</loc><lastmod>2024-01-02T03:04:05+00:00</lastmod></url>
            <url><loc>https://example.com/about</loc></url>
        </urlset>"#;
        let entries = parse_sitemap(xml);
        assert_eq!(entries.len(), 2);
        match &entries[0] {
            SitemapEntry::Url(d) => {
                assert_eq!(d.url, "https://example.com/product/1");
                assert!(d.last_modified.is_some());
            }
            _ => panic!("expected url entry"),
        }
        match &entries[1] {
            SitemapEntry::Url(d) => assert!(d.last_modified.is_none()),
            _ => panic!("expected url entry"),
        }
    }

    #[test]
    fn like_filter_keeps_matching_pattern() {
        let urls = vec![
            DatedUrl { url: "https://shop.example/product/1".into(), last_modified: None },
            DatedUrl { url: "https://shop.example/about".into(), last_modified: None },
            DatedUrl { url: "https://shop.example/product/2".into(), last_modified: None },
        ];
        let kept = like_filter(&urls, Some("%/product/%"));
        assert_eq!(kept.len(), 2);
    }

    #[test]
    fn like_filter_with_underscore_wildcard() {
        let urls = vec![
            DatedUrl { url: "https://example.com/p1".into(), last_modified: None },
            DatedUrl { url: "https://example.com/p12".into(), last_modified: None },
        ];
        let kept = like_filter(&urls, Some("%/p_"));
        assert_eq!(kept.len(), 1);
        assert_eq!(kept[0].url, "https://example.com/p1");
    }

    #[test]
    fn stale_detection_requires_newer_lastmod() {
        let old = Utc::now() - chrono::Duration::days(2);
        let new = Utc::now();
        assert!(is_stale(Some(new), Some(old)));
        assert!(!is_stale(Some(old), Some(new)));
        assert!(is_stale(Some(new), None));
        assert!(!is_stale(None, Some(old)));
    }

    #[test]
    fn malformed_sitemap_yields_no_entries() {
        let entries = parse_sitemap("not xml at all <<<");
        assert!(entries.is_empty());
    }
}
