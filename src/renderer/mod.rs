//! Native browser lifecycle management over `chromiumoxide`.
//!
//! One browser process per manager, launched lazily; every caller gets a
//! fresh, fingerprint-randomized tab under the page admission gate. Tab
//! teardown and gate release are guaranteed on every exit path of
//! [`RendererManager::with_page`], including handler failure.

pub mod browser;
pub mod fingerprint;
pub mod humanize;

use chromiumoxide::cdp::browser_protocol::network::SetUserAgentOverrideParams;
use chromiumoxide::cdp::browser_protocol::page::AddScriptToEvaluateOnNewDocumentParams;
use chromiumoxide::{Browser, Page};
use futures::StreamExt;
use std::future::Future;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::task::JoinHandle;
use tracing::{info, warn};

use crate::core::config::StealthFetchConfig;
use crate::core::error::RenderError;
use crate::core::types::RendererStatus;
use crate::gate::PageGate;
use browser::{find_browser_executable, headless_config};
use fingerprint::{DesktopChromeProfile, FingerprintPolicy};

pub struct RendererManager {
    enabled: bool,
    exe: Option<String>,
    // Held across the launch await: concurrent first-time callers
    // serialize here, so exactly one launch is ever in flight.
    browser: tokio::sync::Mutex<Option<Browser>>,
    event_loop: std::sync::Mutex<Option<JoinHandle<()>>>,
    initialized: AtomicBool,
    gate: Arc<PageGate>,
    policy: Arc<dyn FingerprintPolicy>,
}

impl RendererManager {
    pub fn new(config: &StealthFetchConfig) -> Arc<Self> {
        Self::with_policy(config, Arc::new(DesktopChromeProfile))
    }

    pub fn with_policy(config: &StealthFetchConfig, policy: Arc<dyn FingerprintPolicy>) -> Arc<Self> {
        let exe = find_browser_executable();
        let enabled = config.resolve_rendering_enabled() && exe.is_some();
        Self::build(config, exe, enabled, policy)
    }

    /// Pin a specific executable instead of auto-discovering one. Rendering
    /// is considered enabled even if the path turns out to be bogus — launch
    /// failure then surfaces as [`RenderError::Unavailable`].
    pub fn with_executable(config: &StealthFetchConfig, exe: impl Into<String>) -> Arc<Self> {
        let enabled = config.resolve_rendering_enabled();
        Self::build(config, Some(exe.into()), enabled, Arc::new(DesktopChromeProfile))
    }

    fn build(
        config: &StealthFetchConfig,
        exe: Option<String>,
        enabled: bool,
        policy: Arc<dyn FingerprintPolicy>,
    ) -> Arc<Self> {
        Arc::new(Self {
            enabled,
            exe,
            browser: tokio::sync::Mutex::new(None),
            event_loop: std::sync::Mutex::new(None),
            initialized: AtomicBool::new(false),
            gate: PageGate::new(config.resolve_max_pages()),
            policy,
        })
    }

    pub fn enabled(&self) -> bool {
        self.enabled
    }

    /// The admission gate shared by every page consumer (interactive and
    /// batch alike).
    pub fn gate(&self) -> &Arc<PageGate> {
        &self.gate
    }

    pub fn policy(&self) -> &Arc<dyn FingerprintPolicy> {
        &self.policy
    }

    pub fn status(&self) -> RendererStatus {
        RendererStatus {
            enabled: self.enabled,
            initialized: self.initialized.load(Ordering::SeqCst),
            concurrency: self.gate.snapshot(),
        }
    }

    /// Force the browser up without handing out a page.
    pub async fn init(&self) -> Result<(), RenderError> {
        let page = self.open_page().await?;
        if let Err(e) = page.close().await {
            warn!("init probe page close error (non-fatal): {}", e);
        }
        Ok(())
    }

    /// Run `handler` on a fresh, stealth-prepared tab under the gate.
    ///
    /// The tab is closed and the gate slot released whether the handler
    /// succeeds or fails.
    pub async fn with_page<F, Fut, T>(&self, handler: F) -> Result<(T, RendererStatus), RenderError>
    where
        F: FnOnce(Page) -> Fut,
        Fut: Future<Output = Result<T, RenderError>>,
    {
        let _permit = self.gate.acquire().await;
        let page = self.open_page().await?;
        let out = handler(page.clone()).await;
        if let Err(e) = page.close().await {
            warn!("page close error (non-fatal): {}", e);
        }
        out.map(|v| (v, self.status()))
    }

    /// Open a stealth-prepared tab *without* holding a gate slot. Callers
    /// owning long-lived pages (the session manager) acquire the gate
    /// themselves around active use.
    pub(crate) async fn open_page(&self) -> Result<Page, RenderError> {
        if !self.enabled {
            return Err(RenderError::Unavailable("rendering disabled".into()));
        }
        let exe = self
            .exe
            .clone()
            .ok_or_else(|| RenderError::Unavailable("no browser executable found".into()))?;

        let mut guard = self.browser.lock().await;

        // Reuse the live instance when it still answers.
        let probe = match guard.as_mut() {
            Some(b) => Some(b.new_page("about:blank").await),
            None => None,
        };
        match probe {
            Some(Ok(page)) => {
                drop(guard);
                if let Err(e) = self.prepare_page(&page).await {
                    let _ = page.close().await;
                    return Err(e);
                }
                return Ok(page);
            }
            Some(Err(e)) => {
                warn!("🔄 browser instance dead ({}), restarting", e);
                if let Some(mut old) = guard.take() {
                    let _ = old.close().await;
                }
                if let Some(h) = self.event_loop.lock().unwrap().take() {
                    h.abort();
                }
                self.initialized.store(false, Ordering::SeqCst);
            }
            None => {}
        }

        info!("🚀 launching browser ({})", exe);
        let ua = self.policy.user_agent();
        let (width, height) = self.policy.viewport();
        let config = headless_config(&exe, &ua, width, height)
            .map_err(|e| RenderError::Unavailable(e.to_string()))?;
        let (browser, mut handler) = Browser::launch(config)
            .await
            .map_err(|e| RenderError::Unavailable(format!("launch failed ({}): {}", exe, e)))?;

        let event_loop = tokio::spawn(async move {
            while let Some(event) = handler.next().await {
                if let Err(e) = event {
                    warn!("CDP handler error: {}", e);
                }
            }
        });
        *self.event_loop.lock().unwrap() = Some(event_loop);

        let page = browser
            .new_page("about:blank")
            .await
            .map_err(|e| RenderError::Unavailable(format!("failed to open tab: {}", e)))?;
        *guard = Some(browser);
        self.initialized.store(true, Ordering::SeqCst);
        drop(guard);

        if let Err(e) = self.prepare_page(&page).await {
            let _ = page.close().await;
            return Err(e);
        }
        Ok(page)
    }

    /// Per-tab stealth: rotated UA override plus the fingerprint policy's
    /// init script, registered before any navigation.
    async fn prepare_page(&self, page: &Page) -> Result<(), RenderError> {
        page.execute(SetUserAgentOverrideParams::new(self.policy.user_agent()))
            .await
            .map_err(|e| RenderError::Runtime(format!("ua override failed: {}", e)))?;
        page.execute(AddScriptToEvaluateOnNewDocumentParams::new(self.policy.init_script()))
            .await
            .map_err(|e| RenderError::Runtime(format!("stealth injection failed: {}", e)))?;
        Ok(())
    }

    /// Shut the browser down cleanly. Waits out any in-flight launch first
    /// (launches happen under the same lock).
    pub async fn dispose(&self) {
        let mut guard = self.browser.lock().await;
        if let Some(mut b) = guard.take() {
            if let Err(e) = b.close().await {
                warn!("browser close error (non-fatal): {}", e);
            } else {
                info!("🛑 renderer disposed");
            }
        }
        self.initialized.store(false, Ordering::SeqCst);
        if let Some(h) = self.event_loop.lock().unwrap().take() {
            h.abort();
        }
    }
}

impl Drop for RendererManager {
    fn drop(&mut self) {
        // Best-effort cleanup. Drop cannot await; if we're inside a tokio
        // runtime, spawn a task to close the browser to avoid zombie
        // Chromium processes.
        let Ok(handle) = tokio::runtime::Handle::try_current() else {
            return;
        };
        if let Ok(mut guard) = self.browser.try_lock() {
            if let Some(mut browser) = guard.take() {
                handle.spawn(async move {
                    let _ = browser.close().await;
                });
            }
        }
    }
}
