use crate::core::types::FallbackReason;
use thiserror::Error;

/// Fatal, caller-visible failures of a single `fetch_page` call.
///
/// Everything recoverable (render failures, robots *check* errors, 4xx
/// responses) is handled inside the orchestrator and never surfaces here.
#[derive(Debug, Error)]
pub enum FetchError {
    #[error("invalid url '{url}': {reason}")]
    InvalidUrl { url: String, reason: String },

    #[error("blocked by robots policy: {0}")]
    RobotsBlocked(String),

    #[error("upstream returned {status} for {url} after transport retries")]
    UpstreamServer { url: String, status: u16 },

    #[error("transport error: {0}")]
    Transport(#[from] reqwest::Error),
}

/// Classified failure of a single render attempt. The orchestrator maps each
/// variant onto a [`FallbackReason`] and degrades to plain HTTP.
#[derive(Debug, Error)]
pub enum RenderError {
    #[error("no browser instance available: {0}")]
    Unavailable(String),

    #[error("navigation failed: {0}")]
    Navigation(String),

    #[error("render runtime error: {0}")]
    Runtime(String),
}

impl RenderError {
    pub fn fallback_reason(&self) -> FallbackReason {
        match self {
            RenderError::Unavailable(_) => FallbackReason::RendererUnavailable,
            RenderError::Navigation(_) => FallbackReason::NavigationError,
            RenderError::Runtime(_) => FallbackReason::RenderRuntimeError,
        }
    }

    /// Whether the browser actually got as far as trying to render.
    pub fn was_attempted(&self) -> bool {
        !matches!(self, RenderError::Unavailable(_))
    }
}
