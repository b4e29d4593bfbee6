//! Persistent per-domain browser sessions.
//!
//! A session is one long-lived, warmed tab: cookies loaded from disk, a
//! human-pace browse of the domain's home page (and occasionally a couple of
//! same-site links), cookies saved back. Sessions rotate when they age out,
//! hit their request ceiling, or trip a CAPTCHA. A domain has at most one
//! live session; concurrent `get_session` calls during a warm share the one
//! in-flight creation.

pub mod captcha;
pub mod cookies;

use chromiumoxide::Page;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::{Arc, Mutex as StdMutex};
use std::time::Duration;
use thiserror::Error;
use tokio::sync::OnceCell;
use tracing::{debug, info, warn};

use crate::core::clock::{Clock, SystemClock};
use crate::core::config::StealthFetchConfig;
use crate::core::error::RenderError;
use crate::renderer::{humanize, RendererManager};
use captcha::{detect_captcha, CaptchaDetection};
use cookies::CookieStore;

#[derive(Debug, Error)]
pub enum SessionError {
    #[error("captcha detected while warming {domain}: {}", .detection.kind)]
    Captcha {
        domain: String,
        detection: CaptchaDetection,
    },

    #[error(transparent)]
    Renderer(#[from] RenderError),

    #[error("warm-up navigation failed: {0}")]
    Navigation(String),
}

/// One warmed browser tab, owned exclusively by its domain entry.
#[derive(Debug)]
pub struct Session {
    domain: String,
    page: Page,
    created_at: DateTime<Utc>,
    last_used: StdMutex<DateTime<Utc>>,
    requests: AtomicU32,
    warmed: AtomicBool,
    cookie_path: PathBuf,
}

impl Session {
    pub fn domain(&self) -> &str {
        &self.domain
    }

    pub fn page(&self) -> &Page {
        &self.page
    }

    pub fn request_count(&self) -> u32 {
        self.requests.load(Ordering::SeqCst)
    }

    pub fn is_warmed(&self) -> bool {
        self.warmed.load(Ordering::SeqCst)
    }

    pub fn cookie_path(&self) -> &PathBuf {
        &self.cookie_path
    }

    fn touch(&self, now: DateTime<Utc>) {
        self.requests.fetch_add(1, Ordering::SeqCst);
        *self.last_used.lock().unwrap() = now;
    }

    async fn close(&self) {
        if let Err(e) = self.page.clone().close().await {
            debug!("session page close error (non-fatal): {}", e);
        }
    }
}

/// Validity rule shared by rotation and stats: a session is usable only if
/// it finished warming, is younger than `max_age`, and has served fewer than
/// `max_requests` requests.
fn session_usable(
    warmed: bool,
    created_at: DateTime<Utc>,
    requests: u32,
    now: DateTime<Utc>,
    max_age: Duration,
    max_requests: u32,
) -> bool {
    if !warmed || requests >= max_requests {
        return false;
    }
    match (now - created_at).to_std() {
        Ok(age) => age < max_age,
        // Clock went backwards; treat as newborn.
        Err(_) => true,
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionStats {
    pub domain: String,
    pub age_secs: i64,
    pub request_count: u32,
    pub warmed: bool,
    pub last_used: DateTime<Utc>,
}

type SessionSlot = Arc<OnceCell<Arc<Session>>>;

pub struct PersistentSessionManager {
    renderer: Arc<RendererManager>,
    cookies: CookieStore,
    clock: Arc<dyn Clock>,
    max_age: Duration,
    max_requests: u32,
    cooldown_secs: (u64, u64),
    nav_timeout_ms: u64,
    slots: tokio::sync::Mutex<HashMap<String, SessionSlot>>,
}

impl PersistentSessionManager {
    pub fn new(config: &StealthFetchConfig, renderer: Arc<RendererManager>) -> Self {
        Self {
            renderer,
            cookies: CookieStore::new(config.resolve_cookie_store_path()),
            clock: Arc::new(SystemClock),
            max_age: Duration::from_secs(config.resolve_max_session_age_secs().max(1)),
            max_requests: config.resolve_max_session_requests().max(1),
            cooldown_secs: config.resolve_cooldown_secs(),
            nav_timeout_ms: config.resolve_navigation_timeout_ms(),
            slots: tokio::sync::Mutex::new(HashMap::new()),
        }
    }

    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    /// Get the domain's live session, creating and warming one when absent
    /// or no longer usable. Callers racing during a warm all land on the
    /// same in-flight creation, so exactly one tab exists per domain.
    pub async fn get_session(&self, domain: &str) -> Result<Arc<Session>, SessionError> {
        loop {
            let cell = self.slot_for(domain).await;

            let session = cell
                .get_or_try_init(|| self.create_session(domain))
                .await?
                .clone();

            let now = self.clock.now();
            if session_usable(
                session.is_warmed(),
                session.created_at,
                session.request_count(),
                now,
                self.max_age,
                self.max_requests,
            ) {
                session.touch(now);
                return Ok(session);
            }

            // Stale: retire this slot (if it is still the current one) and
            // go around for a fresh warm.
            info!(
                "♻️ rotating session for {} (age {}s, {} requests)",
                domain,
                (now - session.created_at).num_seconds(),
                session.request_count()
            );
            {
                let mut slots = self.slots.lock().await;
                if let Some(current) = slots.get(domain) {
                    if Arc::ptr_eq(current, &cell) {
                        slots.remove(domain);
                    }
                }
            }
            session.close().await;
        }
    }

    /// The domain's creation cell. Every concurrent caller for the same
    /// domain gets the same cell, which is what collapses racing warms onto
    /// one in-flight creation.
    async fn slot_for(&self, domain: &str) -> SessionSlot {
        let mut slots = self.slots.lock().await;
        slots.entry(domain.to_string()).or_default().clone()
    }

    async fn create_session(&self, domain: &str) -> Result<Arc<Session>, SessionError> {
        info!("🌱 warming new session for {}", domain);

        // Warming is browser work; it holds a page slot for its duration.
        let _permit = self.renderer.gate().acquire().await;
        let page = self.renderer.open_page().await?;

        if let Some(jar) = self.cookies.load(domain) {
            CookieStore::inject(&page, &jar).await;
        }

        if let Err(e) = self.warm(&page, domain).await {
            let _ = page.close().await;
            return Err(e);
        }

        let jar = CookieStore::capture(&page).await;
        if !jar.is_empty() {
            if let Err(e) = self.cookies.save(domain, &jar) {
                warn!("cookie save for {} failed (non-fatal): {}", domain, e);
            }
        }

        let now = self.clock.now();
        Ok(Arc::new(Session {
            domain: domain.to_string(),
            page,
            created_at: now,
            last_used: StdMutex::new(now),
            requests: AtomicU32::new(0),
            warmed: AtomicBool::new(true),
            cookie_path: self.cookies.path_for(domain),
        }))
    }

    /// Simulated first visit: home page, reading pause, randomized scroll
    /// passes, then occasionally a short wander through same-site links.
    async fn warm(&self, page: &Page, domain: &str) -> Result<(), SessionError> {
        let home = format!("https://{}/", domain);
        self.navigate(page, &home).await?;

        let (idle_ms, follow_count) = {
            use rand::RngExt;
            let mut rng = rand::rng();
            (rng.random_range(800..=2_500u64), rng.random_range(0..=2usize))
        };
        self.clock.sleep(Duration::from_millis(idle_ms)).await;
        humanize::human_scroll(page, self.clock.as_ref()).await;

        let html = page
            .content()
            .await
            .map_err(|e| SessionError::Navigation(e.to_string()))?;
        if let Some(detection) = detect_captcha(&html) {
            return Err(SessionError::Captcha {
                domain: domain.to_string(),
                detection,
            });
        }

        if follow_count > 0 {
            let links = humanize::same_site_links(page, 40).await;
            let picks: Vec<String> = {
                use rand::seq::IndexedRandom;
                let mut rng = rand::rng();
                links
                    .choose_multiple(&mut rng, follow_count)
                    .cloned()
                    .collect()
            };
            for link in picks {
                debug!("warm wander: {}", link);
                if let Err(e) = self.navigate(page, &link).await {
                    warn!("warm wander aborted (non-fatal): {}", e);
                    break;
                }
                let pause_ms = {
                    use rand::RngExt;
                    rand::rng().random_range(600..=1_800u64)
                };
                self.clock.sleep(Duration::from_millis(pause_ms)).await;
                humanize::human_scroll(page, self.clock.as_ref()).await;
            }
        }

        humanize::pointer_drift(page, self.renderer.policy().as_ref(), self.clock.as_ref()).await;
        Ok(())
    }

    async fn navigate(&self, page: &Page, url: &str) -> Result<(), SessionError> {
        match tokio::time::timeout(
            Duration::from_millis(self.nav_timeout_ms),
            page.goto(url),
        )
        .await
        {
            Ok(Ok(_)) => Ok(()),
            Ok(Err(e)) => Err(SessionError::Navigation(e.to_string())),
            Err(_) => Err(SessionError::Navigation(format!(
                "navigation to {} timed out after {}ms",
                url, self.nav_timeout_ms
            ))),
        }
    }

    /// Read the session's current DOM and scan it for a challenge.
    pub async fn detect_captcha(&self, session: &Session) -> Option<CaptchaDetection> {
        let html = session.page().content().await.ok()?;
        detect_captcha(&html)
    }

    /// Close the compromised session and sleep out a randomized cooldown
    /// (10–20 minutes by default) before returning. The next `get_session`
    /// for this domain re-warms from scratch.
    pub async fn handle_captcha(&self, domain: &str, detection: &CaptchaDetection) {
        warn!(
            "🧱 captcha ({}) on {} — closing session, entering cooldown",
            detection.kind, domain
        );
        self.close_session(domain).await;

        let (min, max) = self.cooldown_secs;
        let secs = {
            use rand::RngExt;
            rand::rng().random_range(min..=max)
        };
        info!("⏲️ cooling down {} for {}s", domain, secs);
        self.clock.sleep(Duration::from_secs(secs)).await;
        info!("cooldown for {} complete", domain);
    }

    pub async fn close_session(&self, domain: &str) {
        let slot = self.slots.lock().await.remove(domain);
        if let Some(cell) = slot {
            if let Some(session) = cell.get() {
                session.close().await;
                info!("closed session for {}", domain);
            }
        }
    }

    pub async fn close_all(&self) {
        let drained: Vec<SessionSlot> = {
            let mut slots = self.slots.lock().await;
            slots.drain().map(|(_, cell)| cell).collect()
        };
        for cell in drained {
            if let Some(session) = cell.get() {
                session.close().await;
            }
        }
    }

    /// Live sessions only; domains mid-warm or closed do not appear.
    pub async fn get_stats(&self) -> Vec<SessionStats> {
        let now = self.clock.now();
        let slots = self.slots.lock().await;
        slots
            .values()
            .filter_map(|cell| cell.get())
            .map(|s| SessionStats {
                domain: s.domain.clone(),
                age_secs: (now - s.created_at).num_seconds(),
                request_count: s.request_count(),
                warmed: s.is_warmed(),
                last_used: *s.last_used.lock().unwrap(),
            })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::clock::ManualClock;

    #[test]
    fn usability_requires_all_three_conditions() {
        let now = Utc::now();
        let max_age = Duration::from_secs(1_800);

        // Fresh, warmed, unused.
        assert!(session_usable(true, now, 0, now, max_age, 25));
        // Never finished warming.
        assert!(!session_usable(false, now, 0, now, max_age, 25));
        // Request ceiling hit.
        assert!(!session_usable(true, now, 25, now, max_age, 25));
        // Aged out.
        let old = now - chrono::Duration::seconds(3_600);
        assert!(!session_usable(true, old, 0, now, max_age, 25));
        // One second under the ceiling is still fine.
        let young = now - chrono::Duration::seconds(1_799);
        assert!(session_usable(true, young, 24, now, max_age, 25));
    }

    fn manager_with_manual_clock() -> (PersistentSessionManager, Arc<ManualClock>) {
        let config: StealthFetchConfig = serde_json::from_str(
            r#"{"rendering_enabled": false, "cooldown_min_secs": 600, "cooldown_max_secs": 1200}"#,
        )
        .unwrap();
        let renderer = RendererManager::new(&config);
        let clock = Arc::new(ManualClock::default());
        let mgr = PersistentSessionManager::new(&config, renderer).with_clock(clock.clone());
        (mgr, clock)
    }

    #[tokio::test]
    async fn handle_captcha_sleeps_a_ten_to_twenty_minute_cooldown() {
        let (mgr, clock) = manager_with_manual_clock();
        let detection = CaptchaDetection {
            kind: captcha::CaptchaKind::Cloudflare,
            signal: "cf-turnstile".into(),
        };
        mgr.handle_captcha("example.com", &detection).await;

        let slept = clock.total_slept();
        assert!(
            (600..=1_200).contains(&slept.as_secs()),
            "cooldown was {}s",
            slept.as_secs()
        );
        // And the domain no longer shows up in stats.
        assert!(mgr.get_stats().await.is_empty());
    }

    #[tokio::test]
    async fn racing_callers_for_one_domain_share_the_creation_cell() {
        let (mgr, _clock) = manager_with_manual_clock();
        let (a, b) = tokio::join!(mgr.slot_for("example.com"), mgr.slot_for("example.com"));
        assert!(
            Arc::ptr_eq(&a, &b),
            "both callers must land on the same in-flight creation"
        );
        let other = mgr.slot_for("other.com").await;
        assert!(!Arc::ptr_eq(&a, &other));
    }

    #[tokio::test]
    async fn get_session_without_browser_surfaces_renderer_error() {
        let (mgr, _clock) = manager_with_manual_clock();
        let err = mgr.get_session("example.com").await.unwrap_err();
        assert!(matches!(err, SessionError::Renderer(_)));
        // A failed warm leaves no slot behind that would poison retries.
        assert!(mgr.get_stats().await.is_empty());
    }
}
