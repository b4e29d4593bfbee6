//! Fetch orchestrator: picks a fetch mode per request, validates against the
//! response cache, and degrades from rendered to plain HTTP when the
//! renderer cannot deliver — transparently, with the reason recorded in the
//! result's diagnostics.

pub mod cache;
pub mod policy;

use reqwest::header::{ETAG, IF_MODIFIED_SINCE, IF_NONE_MATCH, LAST_MODIFIED, USER_AGENT};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{info, warn};

use crate::core::clock::{Clock, SystemClock};
use crate::core::config::StealthFetchConfig;
use crate::core::error::{FetchError, RenderError};
use crate::core::types::{
    FallbackReason, FetchMode, FetchRequest, FetchResult, RenderDiagnostics,
};
use crate::renderer::{humanize, RendererManager};
use cache::{cache_key, CachedResponse, MokaResponseCache, ResponseCache};
use policy::{
    AllowAllRobots, FixedDelayLimiter, MetricsSink, NoopMetrics, RateLimiter, RobotsError,
    RobotsPolicy,
};

/// Browser-shaped request headers for the plain-HTTP transport.
/// `Accept-Encoding` is deliberately absent — setting it by hand would turn
/// off reqwest's automatic decompression.
fn stealth_headers() -> &'static [(&'static str, &'static str)] {
    &[
        (
            "Accept",
            "text/html,application/xhtml+xml,application/xml;q=0.9,image/webp,*/*;q=0.8",
        ),
        ("Accept-Language", "en-US,en;q=0.9"),
        ("DNT", "1"),
        ("Upgrade-Insecure-Requests", "1"),
        ("Sec-Fetch-Dest", "document"),
        ("Sec-Fetch-Mode", "navigate"),
        ("Sec-Fetch-Site", "none"),
        ("Cache-Control", "max-age=0"),
    ]
}

struct RenderCapture {
    html: String,
    final_url: String,
}

pub struct FetchOrchestrator {
    http: reqwest::Client,
    renderer: Arc<RendererManager>,
    cache: Arc<dyn ResponseCache>,
    robots: Arc<dyn RobotsPolicy>,
    limiter: Arc<dyn RateLimiter>,
    metrics: Arc<dyn MetricsSink>,
    clock: Arc<dyn Clock>,
    quiet_ms: u64,
    nav_timeout_ms: u64,
}

impl FetchOrchestrator {
    pub fn new(config: &StealthFetchConfig, renderer: Arc<RendererManager>) -> Self {
        let http = reqwest::Client::builder()
            .timeout(Duration::from_secs(config.resolve_http_timeout_secs()))
            .redirect(reqwest::redirect::Policy::limited(10))
            .build()
            .expect("http client construction");
        Self {
            http,
            renderer,
            cache: Arc::new(MokaResponseCache::new(
                config.resolve_cache_capacity(),
                Duration::from_secs(config.resolve_cache_ttl_secs()),
            )),
            robots: Arc::new(AllowAllRobots),
            limiter: Arc::new(FixedDelayLimiter::default()),
            metrics: Arc::new(NoopMetrics),
            clock: Arc::new(SystemClock),
            quiet_ms: config.resolve_quiet_ms(),
            nav_timeout_ms: config.resolve_navigation_timeout_ms(),
        }
    }

    pub fn with_cache(mut self, cache: Arc<dyn ResponseCache>) -> Self {
        self.cache = cache;
        self
    }

    pub fn with_robots(mut self, robots: Arc<dyn RobotsPolicy>) -> Self {
        self.robots = robots;
        self
    }

    pub fn with_limiter(mut self, limiter: Arc<dyn RateLimiter>) -> Self {
        self.limiter = limiter;
        self
    }

    pub fn with_metrics(mut self, metrics: Arc<dyn MetricsSink>) -> Self {
        self.metrics = metrics;
        self
    }

    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    /// Acquire one page. See the module docs for the decision sequence.
    pub async fn fetch_page(&self, req: FetchRequest) -> Result<FetchResult, FetchError> {
        let started = Instant::now();

        if !req.url.starts_with("http://") && !req.url.starts_with("https://") {
            return Err(FetchError::InvalidUrl {
                url: req.url,
                reason: "must start with http:// or https://".into(),
            });
        }

        let (effective, mut diagnostics) = resolve_mode(req.mode, self.renderer.enabled());

        // Robots: a hard block is fatal; a broken check is not.
        match self.robots.check_and_enforce(&req.url).await {
            Ok(()) => {}
            Err(RobotsError::Disallowed(msg)) => {
                self.metrics.record_robots_blocked();
                return Err(FetchError::RobotsBlocked(msg));
            }
            Err(RobotsError::Check(msg)) => {
                warn!("robots check failed for {} (ignored): {}", req.url, msg);
            }
        }

        // An advertised crawl delay tightens the domain's spacing.
        if let Some(delay) = self.robots.crawl_delay(&req.url).await {
            if let Some(domain) = crate::session::cookies::domain_of(&req.url) {
                self.limiter.set_domain_limit(&domain, delay).await;
            }
        }

        // Rate limiting is observed, never an error.
        let wait_started = Instant::now();
        self.limiter.check_limit(&req.url).await;
        let waited_ms = wait_started.elapsed().as_millis() as u64;
        if waited_ms > 0 {
            self.metrics.record_rate_limited(waited_ms);
        }

        // Cache: rendered entries and validator-less HTTP entries are served
        // as-is; an HTTP entry with validators goes through a conditional
        // request instead.
        let key = cache_key(&req.url, effective);
        let cached = if req.use_cache {
            self.cache.get(&key).await
        } else {
            None
        };
        if let Some(entry) = &cached {
            let revalidate = effective == FetchMode::Http && entry.has_validators();
            if !revalidate {
                let result = result_from_cache(entry, started, diagnostics.clone());
                self.metrics
                    .record_fetch_metrics(effective, result.status, true, result.elapsed_ms);
                return Ok(result);
            }
        }

        if effective == FetchMode::Rendered {
            match self.render_fetch(&req.url).await {
                Ok(result) => {
                    let entry = CachedResponse {
                        url: result.url.clone(),
                        status: result.status,
                        headers: result.headers.clone(),
                        body: result.body.clone(),
                        etag: None,
                        last_modified: None,
                    };
                    self.cache.set(key, entry).await;
                    self.metrics.record_fetch_metrics(
                        FetchMode::Rendered,
                        result.status,
                        false,
                        result.elapsed_ms,
                    );
                    return Ok(result);
                }
                Err(e) => {
                    let reason = e.fallback_reason();
                    warn!(
                        "render attempt for {} failed after {}ms ({}): {} — falling back to http",
                        req.url,
                        started.elapsed().as_millis(),
                        reason,
                        e
                    );
                    diagnostics = RenderDiagnostics {
                        requested_mode: FetchMode::Rendered,
                        effective_mode: FetchMode::Http,
                        attempted: e.was_attempted(),
                        fallback_reason: Some(reason),
                        error: Some(e.to_string()),
                        concurrency: Some(self.renderer.gate().snapshot()),
                    };
                }
            }
        }

        // Plain HTTP — either requested directly or the render fallback.
        // A fallback reuses whatever HTTP-mode validators the cache holds.
        let http_key = cache_key(&req.url, FetchMode::Http);
        let http_cached = if !req.use_cache {
            None
        } else if diagnostics.requested_mode == FetchMode::Http {
            cached
        } else {
            self.cache.get(&http_key).await
        };
        let validators = http_cached.as_ref().filter(|c| c.has_validators());

        let resp = self
            .http_transport(
                &req.url,
                validators.and_then(|c| c.etag.as_deref()),
                validators.and_then(|c| c.last_modified.as_deref()),
            )
            .await?;
        let status = resp.status().as_u16();
        let final_url = resp.url().to_string();
        let conditional_sent = validators.is_some();

        if status == 304 {
            if let Some(entry) = http_cached {
                // Not modified: serve the cached body, refresh validators.
                self.metrics.record_cache_validation(true);
                let refreshed = CachedResponse {
                    etag: header_value(resp.headers(), ETAG.as_str()).or(entry.etag.clone()),
                    last_modified: header_value(resp.headers(), LAST_MODIFIED.as_str())
                        .or(entry.last_modified.clone()),
                    ..entry
                };
                self.cache.set(http_key, refreshed.clone()).await;
                let result = result_from_cache(&refreshed, started, diagnostics);
                self.metrics
                    .record_fetch_metrics(FetchMode::Http, result.status, true, result.elapsed_ms);
                return Ok(result);
            }
            // A 304 we never asked for; hand it back like any non-2xx.
            warn!("unsolicited 304 from {} with no cached entry", req.url);
        } else if conditional_sent {
            self.metrics.record_cache_validation(false);
        }

        let headers = header_map(resp.headers());
        let etag = header_value(resp.headers(), ETAG.as_str());
        let last_modified = header_value(resp.headers(), LAST_MODIFIED.as_str());
        let body = resp.text().await?;

        let result = FetchResult {
            url: final_url,
            status,
            headers,
            body,
            elapsed_ms: started.elapsed().as_millis() as u64,
            from_cache: false,
            diagnostics,
        };

        // 2xx/3xx responses are cached with their validators; 4xx is handed
        // back to the caller uncached. An unsolicited 304 has no body worth
        // keeping.
        if result.is_success() && status != 304 {
            let entry = CachedResponse {
                url: result.url.clone(),
                status: result.status,
                headers: result.headers.clone(),
                body: result.body.clone(),
                etag,
                last_modified,
            };
            self.cache.set(http_key, entry).await;
        }
        self.metrics
            .record_fetch_metrics(FetchMode::Http, result.status, false, result.elapsed_ms);
        Ok(result)
    }

    /// One rendered navigation under the gate: goto, settle, drift, capture.
    async fn render_fetch(&self, url: &str) -> Result<FetchResult, RenderError> {
        let started = Instant::now();
        let url_owned = url.to_string();
        let quiet_ms = self.quiet_ms;
        let nav_timeout_ms = self.nav_timeout_ms;
        let clock = Arc::clone(&self.clock);
        let policy = Arc::clone(self.renderer.policy());

        let (capture, status) = self
            .renderer
            .with_page(move |page| async move {
                match tokio::time::timeout(
                    Duration::from_millis(nav_timeout_ms),
                    page.goto(url_owned.as_str()),
                )
                .await
                {
                    Ok(Ok(_)) => {}
                    Ok(Err(e)) => return Err(RenderError::Navigation(e.to_string())),
                    Err(_) => {
                        return Err(RenderError::Navigation(format!(
                            "navigation timed out after {}ms",
                            nav_timeout_ms
                        )))
                    }
                }
                humanize::wait_until_stable(&page, quiet_ms, nav_timeout_ms).await;
                humanize::pointer_drift(&page, policy.as_ref(), clock.as_ref()).await;

                let html = page
                    .content()
                    .await
                    .map_err(|e| RenderError::Runtime(e.to_string()))?;
                let final_url = page
                    .url()
                    .await
                    .ok()
                    .flatten()
                    .map(|u| u.to_string())
                    .unwrap_or(url_owned);
                Ok(RenderCapture { html, final_url })
            })
            .await?;

        info!(
            "✅ rendered fetch of {} ({} chars, {}ms)",
            url,
            capture.html.len(),
            started.elapsed().as_millis()
        );
        Ok(FetchResult {
            url: capture.final_url,
            status: 200,
            headers: HashMap::from([(
                "content-type".to_string(),
                "text/html; charset=utf-8".to_string(),
            )]),
            body: capture.html,
            elapsed_ms: started.elapsed().as_millis() as u64,
            from_cache: false,
            diagnostics: RenderDiagnostics::rendered(status.concurrency),
        })
    }

    /// The raw transport with stealth headers, optional conditional headers,
    /// and exponential-backoff retries for 5xx / transport failures.
    async fn http_transport(
        &self,
        url: &str,
        etag: Option<&str>,
        last_modified: Option<&str>,
    ) -> Result<reqwest::Response, FetchError> {
        let user_agent = self.renderer.policy().user_agent();
        backoff::future::retry(
            backoff::ExponentialBackoffBuilder::new()
                .with_initial_interval(Duration::from_millis(300))
                .with_max_interval(Duration::from_secs(3))
                .with_max_elapsed_time(Some(Duration::from_secs(15)))
                .build(),
            || async {
                let mut rb = self.http.get(url).header(USER_AGENT, user_agent.as_str());
                for (k, v) in stealth_headers() {
                    rb = rb.header(*k, *v);
                }
                if let Some(tag) = etag {
                    rb = rb.header(IF_NONE_MATCH, tag);
                }
                if let Some(lm) = last_modified {
                    rb = rb.header(IF_MODIFIED_SINCE, lm);
                }

                let resp = rb.send().await.map_err(|e| {
                    backoff::Error::transient(FetchError::Transport(e))
                })?;
                if resp.status().is_server_error() {
                    return Err(backoff::Error::transient(FetchError::UpstreamServer {
                        url: url.to_string(),
                        status: resp.status().as_u16(),
                    }));
                }
                Ok(resp)
            },
        )
        .await
    }
}

/// Mode resolution: rendered degrades to http (reason `rendering_disabled`)
/// when the renderer subsystem is off; otherwise rendered is attempted.
fn resolve_mode(requested: FetchMode, renderer_enabled: bool) -> (FetchMode, RenderDiagnostics) {
    match requested {
        FetchMode::Http => (FetchMode::Http, RenderDiagnostics::http()),
        FetchMode::Rendered if !renderer_enabled => (
            FetchMode::Http,
            RenderDiagnostics::degraded(FallbackReason::RenderingDisabled, false, None),
        ),
        FetchMode::Rendered => {
            // Filled in properly once the attempt resolves; effective mode
            // starts out rendered.
            let d = RenderDiagnostics {
                requested_mode: FetchMode::Rendered,
                effective_mode: FetchMode::Rendered,
                attempted: true,
                fallback_reason: None,
                error: None,
                concurrency: None,
            };
            (FetchMode::Rendered, d)
        }
    }
}

fn result_from_cache(entry: &CachedResponse, started: Instant, diagnostics: RenderDiagnostics) -> FetchResult {
    FetchResult {
        url: entry.url.clone(),
        status: entry.status,
        headers: entry.headers.clone(),
        body: entry.body.clone(),
        elapsed_ms: started.elapsed().as_millis() as u64,
        from_cache: true,
        diagnostics,
    }
}

fn header_map(headers: &reqwest::header::HeaderMap) -> HashMap<String, String> {
    headers
        .iter()
        .map(|(k, v)| {
            (
                k.as_str().to_string(),
                String::from_utf8_lossy(v.as_bytes()).to_string(),
            )
        })
        .collect()
}

fn header_value(headers: &reqwest::header::HeaderMap, name: &str) -> Option<String> {
    headers
        .get(name)
        .and_then(|v| v.to_str().ok())
        .map(|s| s.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn http_request_never_marks_an_attempt() {
        let (mode, d) = resolve_mode(FetchMode::Http, true);
        assert_eq!(mode, FetchMode::Http);
        assert!(!d.attempted);
        assert!(d.fallback_reason.is_none());
    }

    #[test]
    fn rendered_degrades_when_renderer_off() {
        let (mode, d) = resolve_mode(FetchMode::Rendered, false);
        assert_eq!(mode, FetchMode::Http);
        assert!(!d.attempted);
        assert_eq!(d.fallback_reason, Some(FallbackReason::RenderingDisabled));
    }

    #[test]
    fn rendered_attempts_when_renderer_on() {
        let (mode, d) = resolve_mode(FetchMode::Rendered, true);
        assert_eq!(mode, FetchMode::Rendered);
        assert!(d.attempted);
    }
}
