//! Per-host scheduler state: adaptive crawl delay, Fibonacci backoff,
//! concurrency accounting (spec §4.E, §5).

use std::collections::hash_map::DefaultHasher;
use std::collections::HashMap;
use std::hash::{Hash, Hasher};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use crate::config::CrawlOptions;
use crate::error::ErrorType;
use crate::robots::RobotsRules;

const EMA_ALPHA: f64 = 0.2;
const HIGH_LATENCY_MS: f64 = 2000.0;
const LOW_LATENCY_MS: f64 = 500.0;
const DECAY_FACTOR: f64 = 0.9;
const SHARD_COUNT: usize = 32;

/// Fibonacci sequence starting 1, 1, 2, 3, 5, 8, ... indexed by backoff tier.
fn fibonacci_seconds(tier: u32) -> u64 {
    let (mut a, mut b) = (1u64, 1u64);
    for _ in 0..tier {
        let next = a.saturating_add(b);
        a = b;
        b = next;
    }
    a
}

pub struct HostState {
    pub effective_delay: f64,
    pub seed_delay: f64,
    pub last_fetch: Option<Instant>,
    pub ema_latency_ms: Option<f64>,
    pub recent_failures: u32,
    pub recent_request_count: u32,
    pub backoff_tier: u32,
    pub robots: Option<RobotsRules>,
    pub robots_fetched: bool,
    pub in_flight: u32,
}

impl HostState {
    fn new(seed_delay: f64) -> Self {
        Self {
            effective_delay: seed_delay,
            seed_delay,
            last_fetch: None,
            ema_latency_ms: None,
            recent_failures: 0,
            recent_request_count: 0,
            backoff_tier: 0,
            robots: None,
            robots_fetched: false,
            in_flight: 0,
        }
    }

    /// `last_fetch + effective_delay` — the earliest moment the next
    /// request to this host may start (spec §4.E).
    pub fn due_at(&self) -> Instant {
        match self.last_fetch {
            Some(t) => t + Duration::from_secs_f64(self.effective_delay),
            None => Instant::now(),
        }
    }

    /// Records a completed request's latency, adjusting the effective delay
    /// via an EMA (spec §4.E "Adaptive").
    pub fn record_latency(&mut self, elapsed: Duration, opts: &CrawlOptions) {
        let ms = elapsed.as_secs_f64() * 1000.0;
        self.ema_latency_ms = Some(match self.ema_latency_ms {
            Some(prev) => EMA_ALPHA * ms + (1.0 - EMA_ALPHA) * prev,
            None => ms,
        });

        self.recent_request_count += 1;
        if self.recent_request_count > 10 {
            self.recent_request_count = 10;
        }

        let ema = self.ema_latency_ms.unwrap_or(0.0);
        if ema > HIGH_LATENCY_MS {
            self.effective_delay = opts.clamp_delay(self.effective_delay * 2.0);
        } else if ema < LOW_LATENCY_MS && self.recent_failures == 0 {
            let decayed = self.seed_delay + (self.effective_delay - self.seed_delay) * DECAY_FACTOR;
            self.effective_delay = opts.clamp_delay(decayed.max(self.seed_delay));
        }
    }

    /// Advances the Fibonacci backoff tier on a retryable error and returns
    /// the sleep duration to honor before the next attempt. A server
    /// `Retry-After` can push the wait beyond what the Fibonacci tier alone
    /// would give (spec §5: "Retry-After may push the next attempt beyond
    /// 3x the normal delay"), but the result is always capped at
    /// `max_retry_backoff_seconds`.
    pub fn record_failure(
        &mut self,
        error_type: ErrorType,
        retry_after_seconds: Option<u64>,
        opts: &CrawlOptions,
    ) -> Duration {
        self.recent_failures = self.recent_failures.saturating_add(1);
        if error_type.is_retryable() {
            self.backoff_tier += 1;
        }
        let fib = fibonacci_seconds(self.backoff_tier);
        let wait = fib.max(retry_after_seconds.unwrap_or(0));
        Duration::from_secs(wait.min(opts.max_retry_backoff_seconds))
    }

    /// Resets the backoff tier and failure streak on success (spec §4.E).
    pub fn record_success(&mut self) {
        self.backoff_tier = 0;
        self.recent_failures = 0;
    }

    pub fn mark_fetch(&mut self, now: Instant) {
        self.last_fetch = Some(now);
    }
}

/// Sharded host map: each shard guarded by its own mutex so unrelated hosts
/// never contend (spec §5 "sharded map keyed by host hash").
pub struct HostMap {
    shards: Vec<Mutex<HashMap<String, HostState>>>,
    default_delay: f64,
}

impl HostMap {
    pub fn new(default_delay: f64) -> Arc<Self> {
        Arc::new(Self {
            shards: (0..SHARD_COUNT).map(|_| Mutex::new(HashMap::new())).collect(),
            default_delay,
        })
    }

    fn shard_for(&self, host: &str) -> &Mutex<HashMap<String, HostState>> {
        let mut hasher = DefaultHasher::new();
        host.hash(&mut hasher);
        let idx = (hasher.finish() as usize) % self.shards.len();
        &self.shards[idx]
    }

    /// Runs `f` with exclusive access to `host`'s state, creating it with
    /// the default seed delay if this is the first time the host is seen.
    pub fn with_host<R>(&self, host: &str, f: impl FnOnce(&mut HostState) -> R) -> R {
        let shard = self.shard_for(host);
        let mut guard = shard.lock().unwrap_or_else(|e| e.into_inner());
        let entry = guard
            .entry(host.to_string())
            .or_insert_with(|| HostState::new(self.default_delay));
        f(entry)
    }

    pub fn due_at(&self, host: &str) -> Instant {
        self.with_host(host, |s| s.due_at())
    }

    pub fn try_acquire_slot(&self, host: &str, max_parallel: usize) -> bool {
        self.with_host(host, |s| {
            if (s.in_flight as usize) < max_parallel {
                s.in_flight += 1;
                true
            } else {
                false
            }
        })
    }

    pub fn release_slot(&self, host: &str) {
        self.with_host(host, |s| {
            s.in_flight = s.in_flight.saturating_sub(1);
        });
    }

    pub fn set_robots(&self, host: &str, robots: RobotsRules, opts: &CrawlOptions) {
        self.with_host(host, |s| {
            if let Some(delay) = robots.crawl_delay {
                s.seed_delay = opts.clamp_delay(delay);
                s.effective_delay = s.seed_delay;
            }
            s.robots = Some(robots);
            s.robots_fetched = true;
        });
    }

    pub fn is_allowed(&self, host: &str, path_with_query: &str) -> bool {
        self.with_host(host, |s| match &s.robots {
            Some(r) => r.is_allowed(path_with_query),
            None => true,
        })
    }

    /// Claims the right to fetch `host`'s `robots.txt`. Returns `true` at
    /// most once per host: the first caller gets `true` and every later
    /// caller (including concurrent workers racing on the same new host)
    /// gets `false`, so only one fetch is ever issued (spec §4.E "robots.txt
    /// fetched once per host before the first request").
    pub fn needs_robots_fetch(&self, host: &str) -> bool {
        self.with_host(host, |s| {
            if s.robots_fetched {
                false
            } else {
                s.robots_fetched = true;
                true
            }
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fibonacci_sequence_matches_spec() {
        let seq: Vec<u64> = (0..7).map(fibonacci_seconds).collect();
        assert_eq!(seq, vec![1, 1, 2, 3, 5, 8, 13]);
    }

    #[test]
    fn high_latency_doubles_delay() {
        let opts = CrawlOptions::new("bot");
        let mut state = HostState::new(1.0);
        state.record_latency(Duration::from_millis(2500), &opts);
        assert_eq!(state.effective_delay, 2.0);
    }

    #[test]
    fn low_latency_decays_toward_seed() {
        let opts = CrawlOptions::new("bot");
        let mut state = HostState::new(1.0);
        state.effective_delay = 4.0;
        for _ in 0..2 {
            state.record_latency(Duration::from_millis(100), &opts);
        }
        assert!(state.effective_delay < 4.0);
        assert!(state.effective_delay >= state.seed_delay);
    }

    #[test]
    fn success_resets_backoff_tier() {
        let opts = CrawlOptions::new("bot");
        let mut state = HostState::new(1.0);
        state.record_failure(ErrorType::HttpServerError, None, &opts);
        state.record_failure(ErrorType::HttpServerError, None, &opts);
        assert_eq!(state.backoff_tier, 2);
        state.record_success();
        assert_eq!(state.backoff_tier, 0);
        assert_eq!(state.recent_failures, 0);
    }

    #[test]
    fn concurrency_slot_cap_enforced() {
        let map = HostMap::new(0.1);
        assert!(map.try_acquire_slot("example.com", 1));
        assert!(!map.try_acquire_slot("example.com", 1));
        map.release_slot("example.com");
        assert!(map.try_acquire_slot("example.com", 1));
    }

    #[test]
    fn backoff_honors_retry_after_floor() {
        let opts = CrawlOptions::new("bot");
        let mut state = HostState::new(1.0);
        // tier becomes 1 -> fib(1) = 1s, but Retry-After: 2 pushes it to 2s.
        let wait = state.record_failure(ErrorType::HttpRateLimited, Some(2), &opts);
        assert_eq!(wait.as_secs(), 2);
    }

    #[test]
    fn backoff_capped_at_max_retry_backoff() {
        let mut opts = CrawlOptions::new("bot");
        opts.max_retry_backoff_seconds = 3;
        let mut state = HostState::new(1.0);
        let wait = state.record_failure(ErrorType::HttpRateLimited, Some(600), &opts);
        assert_eq!(wait.as_secs(), 3);
    }
}
