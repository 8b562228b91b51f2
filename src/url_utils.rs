//! URL normalization, resolution and SURT-key derivation (spec §3, §4.A).

use url::Url;

use crate::error::CrawlError;

/// Parses `raw`, resolving it against `base` when it is relative, and
/// normalizes the result: lowercase host, default port stripped, fragment
/// removed. Query strings (including tracking parameters) are preserved
/// verbatim — the crawler is neutral about them.
pub fn normalize(raw: &str, base: Option<&Url>) -> Result<Url, CrawlError> {
    let mut url = match Url::parse(raw) {
        Ok(url) => url,
        Err(url::ParseError::RelativeUrlWithoutBase) => {
            let base = base.ok_or_else(|| CrawlError::InvalidUrl(raw.to_string()))?;
            base.join(raw)
                .map_err(|_| CrawlError::InvalidUrl(raw.to_string()))?
        }
        Err(_) => return Err(CrawlError::InvalidUrl(raw.to_string())),
    };

    if url.scheme() != "http" && url.scheme() != "https" {
        return Err(CrawlError::InvalidUrl(raw.to_string()));
    }
    if url.host_str().is_none() {
        return Err(CrawlError::InvalidUrl(raw.to_string()));
    }

    url.set_fragment(None);

    // Strip the port when it matches the scheme's default so two
    // otherwise-identical URLs don't diverge on `:443` vs. bare.
    if url.port() == url.port_or_known_default() {
        let _ = url.set_port(None);
    }

    Ok(url)
}

/// Lowercased host, no port — the `domain` column and host-map key.
pub fn host_key(url: &Url) -> String {
    url.host_str().unwrap_or_default().to_ascii_lowercase()
}

/// Common-Crawl-compatible SURT key: host labels reversed and comma-joined,
/// followed by `)`, an optional non-default port, then path+query.
///
/// `https://www.example.co.uk/a?b=1` -> `uk,co,example,www)/a?b=1`
pub fn surt_key(url: &Url) -> String {
    let host = host_key(url);
    let mut labels: Vec<&str> = host.split('.').filter(|s| !s.is_empty()).collect();
    labels.reverse();
    let mut key = labels.join(",");
    key.push(')');

    if let Some(port) = url.port() {
        if Some(port) != url.port_or_known_default() {
            key.push(':');
            key.push_str(&port.to_string());
        }
    }

    key.push_str(url.path());
    if let Some(q) = url.query() {
        key.push('?');
        key.push_str(q);
    }
    key
}

/// `true` if the scheme/host pair is one the crawler is allowed to enqueue.
pub fn is_crawlable(url: &Url) -> bool {
    matches!(url.scheme(), "http" | "https") && url.host_str().is_some()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn surt_key_reverses_labels() {
        let url = Url::parse("https://www.example.co.uk/a?b=1").unwrap();
        assert_eq!(surt_key(&url), "uk,co,example,www)/a?b=1");
    }

    #[test]
    fn surt_key_keeps_non_default_port() {
        let url = Url::parse("http://example.com:8080/x").unwrap();
        assert_eq!(surt_key(&url), "com,example:8080/x");
    }

    #[test]
    fn surt_key_drops_default_port() {
        let url = Url::parse("https://example.com:443/x").unwrap();
        assert_eq!(surt_key(&url), "com,example/x");
    }

    #[test]
    fn normalize_lowercases_host_and_strips_fragment() {
        let url = normalize("HTTP://Example.COM/Path#frag", None).unwrap();
        assert_eq!(url.host_str(), Some("example.com"));
        assert_eq!(url.fragment(), None);
    }

    #[test]
    fn normalize_resolves_relative_against_base() {
        let base = Url::parse("https://example.com/a/b").unwrap();
        let url = normalize("../c", Some(&base)).unwrap();
        assert_eq!(url.as_str(), "https://example.com/c");
    }

    #[test]
    fn normalize_rejects_non_http_scheme() {
        assert!(normalize("ftp://example.com/a", None).is_err());
        assert!(normalize("not a url", None).is_err());
    }

    #[test]
    fn surt_key_ties_broken_by_exact_string() {
        let a = Url::parse("https://example.com/a?x=1&y=2").unwrap();
        let b = Url::parse("https://example.com/a?y=2&x=1").unwrap();
        assert_ne!(surt_key(&a), surt_key(&b));
    }
}
