//! Collaborator contracts consumed by the orchestrator: robots policy,
//! rate limiting, and the metrics sink. Real deployments plug their own
//! implementations in; the adapters here are the permissive defaults.

use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Mutex;
use std::time::Duration;
use thiserror::Error;
use tracing::debug;

use crate::core::types::FetchMode;

// ── Robots policy ────────────────────────────────────────────────────────────

#[derive(Debug, Error)]
pub enum RobotsError {
    /// Hard block — the request must never be sent.
    #[error("disallowed by robots.txt: {0}")]
    Disallowed(String),
    /// The check itself failed (fetch error, parse error). Non-fatal.
    #[error("robots check failed: {0}")]
    Check(String),
}

#[async_trait]
pub trait RobotsPolicy: Send + Sync {
    /// Returns `Err(Disallowed)` when the URL must not be fetched.
    async fn check_and_enforce(&self, url: &str) -> Result<(), RobotsError>;

    /// Crawl delay advertised for this URL's domain, if any.
    async fn crawl_delay(&self, url: &str) -> Option<Duration>;
}

/// Default policy: everything allowed, no crawl delay.
#[derive(Debug, Default)]
pub struct AllowAllRobots;

#[async_trait]
impl RobotsPolicy for AllowAllRobots {
    async fn check_and_enforce(&self, _url: &str) -> Result<(), RobotsError> {
        Ok(())
    }

    async fn crawl_delay(&self, _url: &str) -> Option<Duration> {
        None
    }
}

// ── Rate limiter ─────────────────────────────────────────────────────────────

#[async_trait]
pub trait RateLimiter: Send + Sync {
    /// Suspends until this URL's domain is allowed another request.
    async fn check_limit(&self, url: &str);

    /// Override the inter-request spacing for one domain.
    async fn set_domain_limit(&self, domain: &str, delay: Duration);
}

/// Inter-request delay window, drawn uniformly per request.
#[derive(Debug, Clone, Copy)]
pub struct RequestDelay {
    pub min_ms: u64,
    pub max_ms: u64,
}

impl RequestDelay {
    pub fn new(min_ms: u64, max_ms: u64) -> Self {
        Self { min_ms, max_ms }
    }

    pub fn random_delay(&self) -> u64 {
        use rand::RngExt;
        let mut rng = rand::rng();
        rng.random_range(self.min_ms..=self.max_ms.max(self.min_ms))
    }

    /// Default polite spacing: 500–1500 ms.
    pub fn polite() -> Self {
        Self {
            min_ms: 500,
            max_ms: 1_500,
        }
    }

    /// Conservative spacing for protected sites: 1–3 s.
    pub fn conservative() -> Self {
        Self {
            min_ms: 1_000,
            max_ms: 3_000,
        }
    }
}

/// Fixed-delay limiter: spaces requests per domain by a randomized delay,
/// with optional per-domain overrides.
pub struct FixedDelayLimiter {
    delay: RequestDelay,
    overrides: Mutex<HashMap<String, Duration>>,
    last_request_ms: Mutex<HashMap<String, u64>>,
}

impl FixedDelayLimiter {
    pub fn new(delay: RequestDelay) -> Self {
        Self {
            delay,
            overrides: Mutex::new(HashMap::new()),
            last_request_ms: Mutex::new(HashMap::new()),
        }
    }

    fn domain_of(url: &str) -> String {
        url::Url::parse(url)
            .ok()
            .and_then(|u| u.host_str().map(|h| h.to_string()))
            .unwrap_or_default()
    }

    fn now_ms() -> u64 {
        std::time::SystemTime::now()
            .duration_since(std::time::UNIX_EPOCH)
            .map(|d| d.as_millis() as u64)
            .unwrap_or(0)
    }
}

impl Default for FixedDelayLimiter {
    fn default() -> Self {
        Self::new(RequestDelay::polite())
    }
}

#[async_trait]
impl RateLimiter for FixedDelayLimiter {
    async fn check_limit(&self, url: &str) {
        let domain = Self::domain_of(url);
        let delay_ms = {
            let overrides = self.overrides.lock().unwrap();
            overrides
                .get(&domain)
                .map(|d| d.as_millis() as u64)
                .unwrap_or_else(|| self.delay.random_delay())
        };

        let wait_ms = {
            let mut last = self.last_request_ms.lock().unwrap();
            let now = Self::now_ms();
            let elapsed = now.saturating_sub(last.get(&domain).copied().unwrap_or(0));
            let wait = delay_ms.saturating_sub(elapsed);
            last.insert(domain.clone(), now + wait);
            wait
        };

        if wait_ms > 0 {
            debug!("rate limit: waiting {}ms before hitting {}", wait_ms, domain);
            tokio::time::sleep(Duration::from_millis(wait_ms)).await;
        }
    }

    async fn set_domain_limit(&self, domain: &str, delay: Duration) {
        self.overrides
            .lock()
            .unwrap()
            .insert(domain.to_string(), delay);
    }
}

// ── Metrics sink ─────────────────────────────────────────────────────────────

pub trait MetricsSink: Send + Sync {
    fn record_fetch_metrics(&self, mode: FetchMode, status: u16, from_cache: bool, elapsed_ms: u64);
    fn record_cache_validation(&self, not_modified: bool);
    fn record_rate_limited(&self, waited_ms: u64);
    fn record_robots_blocked(&self);
}

#[derive(Debug, Default)]
pub struct NoopMetrics;

impl MetricsSink for NoopMetrics {
    fn record_fetch_metrics(&self, _: FetchMode, _: u16, _: bool, _: u64) {}
    fn record_cache_validation(&self, _: bool) {}
    fn record_rate_limited(&self, _: u64) {}
    fn record_robots_blocked(&self) {}
}

/// Atomic counters, mostly useful for tests and diagnostics endpoints.
#[derive(Debug, Default)]
pub struct CountingMetrics {
    pub fetches: AtomicU64,
    pub cache_hits: AtomicU64,
    pub validations: AtomicU64,
    pub not_modified: AtomicU64,
    pub rate_limited_ms: AtomicU64,
    pub robots_blocked: AtomicU64,
}

impl MetricsSink for CountingMetrics {
    fn record_fetch_metrics(&self, _mode: FetchMode, _status: u16, from_cache: bool, _elapsed_ms: u64) {
        self.fetches.fetch_add(1, Ordering::Relaxed);
        if from_cache {
            self.cache_hits.fetch_add(1, Ordering::Relaxed);
        }
    }

    fn record_cache_validation(&self, not_modified: bool) {
        self.validations.fetch_add(1, Ordering::Relaxed);
        if not_modified {
            self.not_modified.fetch_add(1, Ordering::Relaxed);
        }
    }

    fn record_rate_limited(&self, waited_ms: u64) {
        self.rate_limited_ms.fetch_add(waited_ms, Ordering::Relaxed);
    }

    fn record_robots_blocked(&self) {
        self.robots_blocked.fetch_add(1, Ordering::Relaxed);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn delay_windows() {
        let polite = RequestDelay::polite();
        assert_eq!((polite.min_ms, polite.max_ms), (500, 1_500));
        for _ in 0..20 {
            let d = polite.random_delay();
            assert!((500..=1_500).contains(&d));
        }
    }

    #[tokio::test]
    async fn limiter_spaces_consecutive_requests() {
        let limiter = FixedDelayLimiter::new(RequestDelay::new(40, 60));
        let start = std::time::Instant::now();
        limiter.check_limit("https://example.com/a").await;
        limiter.check_limit("https://example.com/b").await;
        assert!(start.elapsed().as_millis() >= 40);
    }

    #[tokio::test]
    async fn per_domain_override_wins() {
        let limiter = FixedDelayLimiter::new(RequestDelay::new(5_000, 6_000));
        limiter
            .set_domain_limit("example.com", Duration::from_millis(1))
            .await;
        let start = std::time::Instant::now();
        limiter.check_limit("https://example.com/a").await;
        limiter.check_limit("https://example.com/b").await;
        assert!(start.elapsed().as_secs() < 5);
    }

    #[test]
    fn counting_metrics_accumulate() {
        let m = CountingMetrics::default();
        m.record_fetch_metrics(FetchMode::Http, 200, true, 12);
        m.record_cache_validation(true);
        m.record_rate_limited(250);
        m.record_robots_blocked();
        assert_eq!(m.fetches.load(Ordering::Relaxed), 1);
        assert_eq!(m.cache_hits.load(Ordering::Relaxed), 1);
        assert_eq!(m.not_modified.load(Ordering::Relaxed), 1);
        assert_eq!(m.rate_limited_ms.load(Ordering::Relaxed), 250);
        assert_eq!(m.robots_blocked.load(Ordering::Relaxed), 1);
    }
}
