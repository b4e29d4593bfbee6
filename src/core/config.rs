use std::path::PathBuf;

// ---------------------------------------------------------------------------
// StealthFetchConfig — file-based config loader (stealthfetch.json) with
// env-var fallback per field
// ---------------------------------------------------------------------------

pub const ENV_CONFIG_PATH: &str = "STEALTHFETCH_CONFIG";
pub const ENV_CHROME_EXECUTABLE: &str = "CHROME_EXECUTABLE";

/// Top-level config loaded from `stealthfetch.json`. Every field is optional;
/// `resolve_*` accessors apply the `STEALTHFETCH_*` env-var fallback and the
/// built-in default, in that order.
#[derive(serde::Deserialize, Default, Clone, Debug)]
pub struct StealthFetchConfig {
    /// Master switch for the rendering subsystem. A missing browser binary
    /// disables rendering regardless of this flag.
    pub rendering_enabled: Option<bool>,
    /// Max simultaneously open browser pages (admission-gate capacity).
    pub max_pages: Option<usize>,
    /// Navigation timeout for rendered fetches, milliseconds.
    pub navigation_timeout_ms: Option<u64>,
    /// Network-quiet window before a rendered page is considered settled.
    pub quiet_ms: Option<u64>,
    /// Plain-HTTP request timeout, seconds.
    pub http_timeout_secs: Option<u64>,
    /// Response-cache capacity (entries) and TTL.
    pub cache_capacity: Option<u64>,
    pub cache_ttl_secs: Option<u64>,
    /// Session rotation: max age and max requests per warmed session.
    pub max_session_age_secs: Option<u64>,
    pub max_session_requests: Option<u32>,
    /// Post-CAPTCHA cooldown window, seconds (randomized within).
    pub cooldown_min_secs: Option<u64>,
    pub cooldown_max_secs: Option<u64>,
    /// Directory for per-domain cookie jars.
    pub cookie_store_path: Option<String>,
    /// Directory for job checkpoint files.
    pub checkpoint_path: Option<String>,
    /// Job retry policy: attempt ceiling and fixed inter-attempt delay.
    pub max_retries: Option<u32>,
    pub retry_delay_secs: Option<u64>,
    /// Checkpoint every N completed items.
    pub checkpoint_every: Option<u32>,
}

fn env_parse<T: std::str::FromStr>(key: &str) -> Option<T> {
    std::env::var(key).ok().and_then(|v| v.trim().parse().ok())
}

impl StealthFetchConfig {
    /// Rendering flag: JSON field → `STEALTHFETCH_RENDERING` env ("0"/"false"
    /// disables) → `true`.
    pub fn resolve_rendering_enabled(&self) -> bool {
        if let Some(b) = self.rendering_enabled {
            return b;
        }
        std::env::var("STEALTHFETCH_RENDERING")
            .map(|v| !matches!(v.trim(), "0" | "false" | "no" | "off"))
            .unwrap_or(true)
    }

    pub fn resolve_max_pages(&self) -> usize {
        self.max_pages
            .or_else(|| env_parse("STEALTHFETCH_MAX_PAGES"))
            .unwrap_or(4)
            .max(1)
    }

    pub fn resolve_navigation_timeout_ms(&self) -> u64 {
        self.navigation_timeout_ms
            .or_else(|| env_parse("STEALTHFETCH_NAVIGATION_TIMEOUT_MS"))
            .unwrap_or(30_000)
    }

    pub fn resolve_quiet_ms(&self) -> u64 {
        self.quiet_ms
            .or_else(|| env_parse("STEALTHFETCH_QUIET_MS"))
            .unwrap_or(1_500)
    }

    pub fn resolve_http_timeout_secs(&self) -> u64 {
        self.http_timeout_secs
            .or_else(|| env_parse("STEALTHFETCH_HTTP_TIMEOUT_SECS"))
            .unwrap_or(30)
    }

    pub fn resolve_cache_capacity(&self) -> u64 {
        self.cache_capacity
            .or_else(|| env_parse("STEALTHFETCH_CACHE_CAPACITY"))
            .unwrap_or(10_000)
    }

    pub fn resolve_cache_ttl_secs(&self) -> u64 {
        self.cache_ttl_secs
            .or_else(|| env_parse("STEALTHFETCH_CACHE_TTL_SECS"))
            .unwrap_or(60 * 30)
    }

    pub fn resolve_max_session_age_secs(&self) -> u64 {
        self.max_session_age_secs
            .or_else(|| env_parse("STEALTHFETCH_MAX_SESSION_AGE_SECS"))
            .unwrap_or(60 * 30)
    }

    pub fn resolve_max_session_requests(&self) -> u32 {
        self.max_session_requests
            .or_else(|| env_parse("STEALTHFETCH_MAX_SESSION_REQUESTS"))
            .unwrap_or(25)
    }

    /// CAPTCHA cooldown window. Defaults to 10–20 minutes; a `min > max`
    /// misconfiguration collapses to the min.
    pub fn resolve_cooldown_secs(&self) -> (u64, u64) {
        let min = self
            .cooldown_min_secs
            .or_else(|| env_parse("STEALTHFETCH_COOLDOWN_MIN_SECS"))
            .unwrap_or(600);
        let max = self
            .cooldown_max_secs
            .or_else(|| env_parse("STEALTHFETCH_COOLDOWN_MAX_SECS"))
            .unwrap_or(1_200);
        (min, max.max(min))
    }

    pub fn resolve_cookie_store_path(&self) -> PathBuf {
        if let Some(p) = &self.cookie_store_path {
            if !p.trim().is_empty() {
                return PathBuf::from(p);
            }
        }
        if let Ok(p) = std::env::var("STEALTHFETCH_COOKIE_STORE") {
            if !p.trim().is_empty() {
                return PathBuf::from(p);
            }
        }
        state_dir().join("cookies")
    }

    pub fn resolve_checkpoint_path(&self) -> PathBuf {
        if let Some(p) = &self.checkpoint_path {
            if !p.trim().is_empty() {
                return PathBuf::from(p);
            }
        }
        if let Ok(p) = std::env::var("STEALTHFETCH_CHECKPOINT_PATH") {
            if !p.trim().is_empty() {
                return PathBuf::from(p);
            }
        }
        state_dir().join("jobs")
    }

    pub fn resolve_max_retries(&self) -> u32 {
        self.max_retries
            .or_else(|| env_parse("STEALTHFETCH_MAX_RETRIES"))
            .unwrap_or(3)
    }

    pub fn resolve_retry_delay_secs(&self) -> u64 {
        self.retry_delay_secs
            .or_else(|| env_parse("STEALTHFETCH_RETRY_DELAY_SECS"))
            .unwrap_or(300)
    }

    pub fn resolve_checkpoint_every(&self) -> u32 {
        self.checkpoint_every
            .or_else(|| env_parse("STEALTHFETCH_CHECKPOINT_EVERY"))
            .unwrap_or(10)
            .max(1)
    }
}

/// Base directory for persisted state (`~/.stealthfetch`, or cwd-relative
/// when no home directory resolves).
pub fn state_dir() -> PathBuf {
    dirs::home_dir()
        .map(|h| h.join(".stealthfetch"))
        .unwrap_or_else(|| PathBuf::from(".stealthfetch"))
}

/// Load `stealthfetch.json` from standard locations.
///
/// Search order (first found wins):
/// 1. `STEALTHFETCH_CONFIG` env var path
/// 2. `./stealthfetch.json` (process cwd)
/// 3. `~/.stealthfetch/config.json`
///
/// Missing file → defaults (env-var fallbacks still apply per field).
/// Parse error → warn and fall back to defaults.
pub fn load_config() -> StealthFetchConfig {
    let mut candidates = vec![PathBuf::from("stealthfetch.json")];
    if let Some(home) = dirs::home_dir() {
        candidates.push(home.join(".stealthfetch").join("config.json"));
    }
    if let Ok(env_path) = std::env::var(ENV_CONFIG_PATH) {
        candidates.insert(0, PathBuf::from(env_path));
    }

    for path in &candidates {
        match std::fs::read_to_string(path) {
            Ok(contents) => match serde_json::from_str::<StealthFetchConfig>(&contents) {
                Ok(cfg) => {
                    tracing::info!("stealthfetch.json loaded from {}", path.display());
                    return cfg;
                }
                Err(e) => {
                    tracing::warn!(
                        "stealthfetch.json parse error at {}: {} — using defaults",
                        path.display(),
                        e
                    );
                    return StealthFetchConfig::default();
                }
            },
            Err(_) => continue,
        }
    }

    StealthFetchConfig::default()
}

/// Optional override for the Chromium-family browser executable. Only
/// returns a value when `CHROME_EXECUTABLE` points at an existing path.
pub fn chrome_executable_override() -> Option<String> {
    let p = std::env::var(ENV_CHROME_EXECUTABLE).ok()?;
    let p = p.trim();
    if p.is_empty() || !std::path::Path::new(p).exists() {
        return None;
    }
    Some(p.to_string())
}
