pub mod core;
pub mod fetch;
pub mod gate;
pub mod jobs;
pub mod renderer;
pub mod session;

// --- Primary exports ---
pub use crate::core::clock::{Clock, ManualClock, SystemClock};
pub use crate::core::init_tracing;
pub use crate::core::config::{load_config, StealthFetchConfig};
pub use crate::core::error::{FetchError, RenderError};
pub use crate::core::types::{
    FallbackReason, FetchMode, FetchRequest, FetchResult, GateSnapshot, RenderDiagnostics,
    RendererStatus,
};
pub use fetch::cache::{CachedResponse, MokaResponseCache, ResponseCache};
pub use fetch::policy::{
    AllowAllRobots, CountingMetrics, FixedDelayLimiter, MetricsSink, NoopMetrics, RateLimiter,
    RequestDelay, RobotsError, RobotsPolicy,
};
pub use fetch::FetchOrchestrator;
pub use gate::{PageGate, PagePermit};
pub use jobs::runner::BatchRunner;
pub use jobs::{JobItem, JobProgress, JobStats, JobStatus, JobTracker};
pub use renderer::fingerprint::{DesktopChromeProfile, FingerprintPolicy};
pub use renderer::RendererManager;
pub use session::captcha::{CaptchaDetection, CaptchaKind};
pub use session::{PersistentSessionManager, Session, SessionError, SessionStats};
