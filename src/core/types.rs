use serde::{Deserialize, Serialize};
use std::collections::HashMap;

/// How a page should be (or was) acquired.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum FetchMode {
    /// Raw HTTP request through the stealth-header transport.
    #[default]
    Http,
    /// Full headless-browser navigation (scripts executed, network settled).
    Rendered,
}

impl FetchMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            FetchMode::Http => "http",
            FetchMode::Rendered => "rendered",
        }
    }
}

impl std::fmt::Display for FetchMode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FetchRequest {
    pub url: String,
    #[serde(default = "default_use_cache")]
    pub use_cache: bool,
    #[serde(default)]
    pub mode: FetchMode,
}

fn default_use_cache() -> bool {
    true
}

impl FetchRequest {
    pub fn new(url: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            use_cache: true,
            mode: FetchMode::Http,
        }
    }

    pub fn rendered(mut self) -> Self {
        self.mode = FetchMode::Rendered;
        self
    }

    pub fn no_cache(mut self) -> Self {
        self.use_cache = false;
        self
    }
}

/// Why a rendered fetch was degraded to plain HTTP.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FallbackReason {
    /// The renderer subsystem is switched off (config or no browser binary).
    RenderingDisabled,
    /// The browser reached the page lifecycle but navigation failed.
    NavigationError,
    /// No browser instance could be obtained at all.
    RendererUnavailable,
    /// Anything else that went wrong mid-render.
    RenderRuntimeError,
}

impl FallbackReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            FallbackReason::RenderingDisabled => "rendering_disabled",
            FallbackReason::NavigationError => "navigation_error",
            FallbackReason::RendererUnavailable => "renderer_unavailable",
            FallbackReason::RenderRuntimeError => "render_runtime_error",
        }
    }
}

impl std::fmt::Display for FallbackReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Point-in-time view of the page admission gate.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct GateSnapshot {
    /// Slots currently free.
    pub available: usize,
    /// Callers parked in the FIFO queue.
    pub pending: usize,
    /// Configured capacity.
    pub max: usize,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct RendererStatus {
    pub enabled: bool,
    pub initialized: bool,
    pub concurrency: GateSnapshot,
}

/// Per-request record of what the orchestrator actually did.
///
/// Invariant: `effective_mode == Rendered` implies `attempted`, and a
/// `fallback_reason` is always present when the effective mode differs from
/// the requested one.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RenderDiagnostics {
    pub requested_mode: FetchMode,
    pub effective_mode: FetchMode,
    pub attempted: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub fallback_reason: Option<FallbackReason>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub concurrency: Option<GateSnapshot>,
}

impl RenderDiagnostics {
    /// Plain HTTP request, rendering never in play.
    pub fn http() -> Self {
        Self {
            requested_mode: FetchMode::Http,
            effective_mode: FetchMode::Http,
            attempted: false,
            fallback_reason: None,
            error: None,
            concurrency: None,
        }
    }

    /// Rendered fetch that completed in the browser.
    pub fn rendered(concurrency: GateSnapshot) -> Self {
        Self {
            requested_mode: FetchMode::Rendered,
            effective_mode: FetchMode::Rendered,
            attempted: true,
            fallback_reason: None,
            error: None,
            concurrency: Some(concurrency),
        }
    }

    /// Rendered request degraded to HTTP.
    pub fn degraded(reason: FallbackReason, attempted: bool, error: Option<String>) -> Self {
        Self {
            requested_mode: FetchMode::Rendered,
            effective_mode: FetchMode::Http,
            attempted,
            fallback_reason: Some(reason),
            error,
            concurrency: None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FetchResult {
    /// Final URL after any redirects.
    pub url: String,
    pub status: u16,
    pub headers: HashMap<String, String>,
    pub body: String,
    pub elapsed_ms: u64,
    pub from_cache: bool,
    pub diagnostics: RenderDiagnostics,
}

impl FetchResult {
    pub fn is_success(&self) -> bool {
        (200..400).contains(&self.status)
    }
}
