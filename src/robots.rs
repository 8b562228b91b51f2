//! Hand-rolled `robots.txt` parser (spec §4.B).
//!
//! A line-splitting parser covering the full grammar needed here
//! (longest-match `Allow`/`Disallow`, `Crawl-delay`, `Request-rate`,
//! accumulated `Sitemap:` entries) rather than wrapping a crate whose
//! contract is a bare allow/deny matcher and nothing else.

#[derive(Debug, Clone)]
struct Rule {
    pattern: String,
    allow: bool,
}

/// The parsed rule set for one `robots.txt` body, already narrowed to the
/// configured user agent.
#[derive(Debug, Clone, Default)]
pub struct RobotsRules {
    rules: Vec<Rule>,
    pub crawl_delay: Option<f64>,
    pub sitemaps: Vec<String>,
}

impl RobotsRules {
    /// An "allow all" sentinel used when robots.txt is absent or fetching it
    /// failed (spec §4.D "treated as allow all").
    pub fn allow_all() -> Self {
        Self::default()
    }

    /// Longest-match `Allow`/`Disallow` lookup against `path_with_query`.
    /// Ties are broken in favor of `Allow` (matches common robots.txt
    /// practice and the RFC 9309 recommendation).
    pub fn is_allowed(&self, path_with_query: &str) -> bool {
        let mut best: Option<(&Rule, usize)> = None;
        for rule in &self.rules {
            if let Some(len) = match_len(&rule.pattern, path_with_query) {
                let better = match best {
                    None => true,
                    Some((best_rule, best_len)) => {
                        len > best_len || (len == best_len && rule.allow && !best_rule.allow)
                    }
                };
                if better {
                    best = Some((rule, len));
                }
            }
        }
        best.map(|(r, _)| r.allow).unwrap_or(true)
    }
}

/// Length of the match of `pattern` (a robots.txt `Allow`/`Disallow` value,
/// possibly containing `*` wildcards and a trailing `$` anchor) against
/// `path`, or `None` if it doesn't match. The returned length is the
/// pattern's literal length, used only to compare specificity between
/// candidate rules, per the "longest match wins" rule.
fn match_len(pattern: &str, path: &str) -> Option<usize> {
    if pattern.is_empty() {
        // An empty Disallow value means "allow everything".
        return Some(0);
    }

    let (pattern, end_anchored) = match pattern.strip_suffix('$') {
        Some(stripped) => (stripped, true),
        None => (pattern, false),
    };

    if !pattern.contains('*') {
        return if end_anchored {
            (path == pattern).then_some(pattern.len())
        } else {
            path.starts_with(pattern).then_some(pattern.len())
        };
    }

    let segments: Vec<&str> = pattern.split('*').collect();
    let mut cursor = 0usize;
    for (i, seg) in segments.iter().enumerate() {
        if seg.is_empty() {
            continue;
        }
        match path[cursor..].find(seg) {
            Some(pos) => cursor += pos + seg.len(),
            None => return None,
        }
        let _ = i;
    }
    if end_anchored && cursor != path.len() {
        return None;
    }
    Some(pattern.len())
}

/// Parses a `robots.txt` body for the given user agent. Unknown directives
/// are ignored. Agent-block selection picks the block whose `User-agent`
/// token is the longest case-insensitive match for `agent`, falling back to
/// `*`.
pub fn parse(body: &str, agent: &str) -> RobotsRules {
    let agent = agent.to_ascii_lowercase();

    // First pass: split the file into agent blocks (a block starts at a
    // `User-agent` line and runs until the next one), tracking sitemaps
    // globally since they apply regardless of block.
    let mut sitemaps = Vec::new();
    let mut blocks: Vec<(Vec<String>, Vec<(String, String)>)> = Vec::new();
    let mut current_agents: Vec<String> = Vec::new();
    let mut current_directives: Vec<(String, String)> = Vec::new();
    let mut block_open = false;

    for raw_line in body.lines() {
        let line = strip_comment(raw_line).trim();
        if line.is_empty() {
            continue;
        }
        let Some((key, value)) = line.split_once(':') else {
            continue;
        };
        let key = key.trim().to_ascii_lowercase();
        let value = value.trim().to_string();

        match key.as_str() {
            "user-agent" => {
                if block_open && !current_directives.is_empty() {
                    blocks.push((
                        std::mem::take(&mut current_agents),
                        std::mem::take(&mut current_directives),
                    ));
                    block_open = false;
                }
                current_agents.push(value.to_ascii_lowercase());
                block_open = true;
            }
            "sitemap" => sitemaps.push(value),
            "allow" | "disallow" | "crawl-delay" | "request-rate" => {
                current_directives.push((key, value));
            }
            _ => {}
        }
    }
    if !current_agents.is_empty() {
        blocks.push((current_agents, current_directives));
    }

    // Longest matching agent token across all blocks; `*` is the fallback.
    let mut chosen: Option<(&Vec<(String, String)>, usize)> = None;
    let mut wildcard: Option<&Vec<(String, String)>> = None;
    for (agents, directives) in &blocks {
        for token in agents {
            if token == "*" {
                wildcard = Some(directives);
                continue;
            }
            if agent.starts_with(token.as_str()) || token.starts_with(agent.as_str()) {
                let len = token.len();
                if chosen.map(|(_, best)| len > best).unwrap_or(true) {
                    chosen = Some((directives, len));
                }
            }
        }
    }
    let directives = chosen.map(|(d, _)| d).or(wildcard);

    let mut rules = Vec::new();
    let mut crawl_delay = None;
    if let Some(directives) = directives {
        for (key, value) in directives {
            match key.as_str() {
                "allow" => rules.push(Rule {
                    pattern: value.clone(),
                    allow: true,
                }),
                "disallow" => rules.push(Rule {
                    pattern: value.clone(),
                    allow: false,
                }),
                "crawl-delay" => {
                    if let Ok(v) = value.parse::<f64>() {
                        if v.is_finite() && v >= 0.0 {
                            crawl_delay = Some(v);
                        }
                    }
                }
                "request-rate" => {
                    // "<requests>/<seconds>" -> delay = seconds/requests.
                    if let Some((n, d)) = value.split_once('/') {
                        if let (Ok(n), Ok(d)) = (n.trim().parse::<f64>(), d.trim().parse::<f64>())
                        {
                            if n > 0.0 && d >= 0.0 {
                                crawl_delay = Some(d / n);
                            }
                        }
                    }
                }
                _ => {}
            }
        }
    }

    RobotsRules {
        rules,
        crawl_delay,
        sitemaps,
    }
}

fn strip_comment(line: &str) -> &str {
    match line.find('#') {
        Some(idx) => &line[..idx],
        None => line,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const BODY: &str = "User-Agent: FerrisCrawler\nAllow: /ocean\nDisallow: /rust\nDisallow: /forest*.py\nCrawl-Delay: 10\nUser-Agent: *\nDisallow: /private/*\nSitemap: https://www.example.com/site.xml\n";

    #[test]
    fn picks_named_agent_block_over_wildcard() {
        let rules = parse(BODY, "FerrisCrawler");
        assert_eq!(rules.crawl_delay, Some(10.0));
        assert!(rules.is_allowed("/ocean"));
        assert!(!rules.is_allowed("/rust"));
        assert!(rules.is_allowed("/private/secret")); // not in FerrisCrawler's block
    }

    #[test]
    fn falls_back_to_wildcard_agent() {
        let rules = parse(BODY, "SomeOtherBot");
        assert!(!rules.is_allowed("/private/secret"));
        assert!(rules.is_allowed("/public"));
    }

    #[test]
    fn accumulates_sitemaps() {
        let rules = parse(BODY, "FerrisCrawler");
        assert_eq!(rules.sitemaps, vec!["https://www.example.com/site.xml"]);
    }

    #[test]
    fn wildcard_and_end_anchor_patterns() {
        let rules = parse(BODY, "FerrisCrawler");
        assert!(!rules.is_allowed("/forest/a.py"));
        assert!(rules.is_allowed("/forest/a.pyc"));
    }

    #[test]
    fn longest_match_wins_over_shorter_allow() {
        let body = "User-agent: *\nAllow: /\nDisallow: /secret/\n";
        let rules = parse(body, "bot");
        assert!(rules.is_allowed("/public"));
        assert!(!rules.is_allowed("/secret/page"));
    }

    #[test]
    fn negative_or_non_numeric_crawl_delay_is_ignored() {
        let body = "User-agent: *\nCrawl-delay: -5\n";
        assert_eq!(parse(body, "bot").crawl_delay, None);
        let body = "User-agent: *\nCrawl-delay: banana\n";
        assert_eq!(parse(body, "bot").crawl_delay, None);
    }

    #[test]
    fn fractional_crawl_delay_accepted() {
        let body = "User-agent: *\nCrawl-delay: 0.5\n";
        assert_eq!(parse(body, "bot").crawl_delay, Some(0.5));
    }

    #[test]
    fn request_rate_converts_to_delay() {
        let body = "User-agent: *\nRequest-rate: 1/2\n";
        assert_eq!(parse(body, "bot").crawl_delay, Some(2.0));
    }

    #[test]
    fn allow_all_sentinel_allows_everything() {
        let rules = RobotsRules::allow_all();
        assert!(rules.is_allowed("/anything"));
    }

    #[test]
    fn unknown_directives_are_ignored() {
        let body = "User-agent: *\nCrawl-delay: 1\nNoindex: /x\nDisallow: /x\n";
        let rules = parse(body, "bot");
        assert!(!rules.is_allowed("/x"));
    }
}
