//! Per-domain cookie persistence.
//!
//! Cookies are stored as raw CDP-shaped JSON (`name`, `value`, `domain`,
//! `path`, `expires`, `httpOnly`, `secure`, `sameSite`, …) so the jar can be
//! handed straight back to `Network.setCookies` without a lossy conversion
//! through an intermediate struct. Any individual cookie that fails to
//! deserialize is skipped — a partially-malformed jar never blocks a warm.

use anyhow::{Context, Result};
use chromiumoxide::cdp::browser_protocol::network::{CookieParam, SetCookiesParams};
use chromiumoxide::Page;
use std::path::PathBuf;
use tracing::{info, warn};

pub struct CookieStore {
    dir: PathBuf,
}

impl CookieStore {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    /// `<cookie_store_path>/<domain>.json`, with path-hostile characters in
    /// the domain replaced.
    pub fn path_for(&self, domain: &str) -> PathBuf {
        self.dir.join(format!("{}.json", sanitize_domain(domain)))
    }

    /// Load the stored jar for a domain. `None` when the file is missing,
    /// empty, or unreadable.
    pub fn load(&self, domain: &str) -> Option<Vec<serde_json::Value>> {
        let path = self.path_for(domain);
        let content = std::fs::read_to_string(&path).ok()?;
        let cookies: Vec<serde_json::Value> = serde_json::from_str(&content).ok()?;
        if cookies.is_empty() {
            return None;
        }
        info!(
            "🍪 loaded {} cookies for '{}' ({})",
            cookies.len(),
            domain,
            path.display()
        );
        Some(cookies)
    }

    pub fn save(&self, domain: &str, cookies: &[serde_json::Value]) -> Result<()> {
        std::fs::create_dir_all(&self.dir)
            .with_context(|| format!("creating cookie dir {}", self.dir.display()))?;
        let path = self.path_for(domain);
        let json = serde_json::to_string_pretty(cookies)?;
        std::fs::write(&path, json)
            .with_context(|| format!("writing cookie jar {}", path.display()))?;
        info!("🍪 saved {} cookies for '{}'", cookies.len(), domain);
        Ok(())
    }

    /// Drop the stored jar so the next session starts clean.
    pub fn invalidate(&self, domain: &str) {
        let path = self.path_for(domain);
        if path.exists() {
            if let Err(e) = std::fs::remove_file(&path) {
                warn!("failed to remove cookie jar {}: {}", path.display(), e);
            }
        }
    }

    /// Inject a raw jar into a live page **before** navigation, so the
    /// cookies ride along on the first request.
    pub async fn inject(page: &Page, raw_cookies: &[serde_json::Value]) {
        let params: Vec<CookieParam> = raw_cookies
            .iter()
            .filter_map(|v| serde_json::from_value::<CookieParam>(v.clone()).ok())
            .collect();
        if params.is_empty() {
            warn!("stored jar contained no valid cookies — skipping injection");
            return;
        }
        let count = params.len();
        match page.execute(SetCookiesParams::new(params)).await {
            Ok(_) => info!("💉 injected {} session cookies", count),
            Err(e) => warn!("cookie injection failed: {}", e),
        }
    }

    /// Capture the page's current cookies as raw CDP JSON.
    pub async fn capture(page: &Page) -> Vec<serde_json::Value> {
        match page.get_cookies().await {
            Ok(cookies) => cookies
                .iter()
                .filter_map(|c| serde_json::to_value(c).ok())
                .collect(),
            Err(e) => {
                warn!("cookie capture failed: {}", e);
                Vec::new()
            }
        }
    }
}

fn sanitize_domain(domain: &str) -> String {
    domain
        .chars()
        .map(|c| match c {
            '/' | '\\' | ':' => '_',
            c => c,
        })
        .collect()
}

/// Hostname of a URL, or `None` for opaque/relative URLs.
pub fn domain_of(url: &str) -> Option<String> {
    url::Url::parse(url)
        .ok()
        .and_then(|u| u.host_str().map(|h| h.to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn jar_round_trips_through_disk() {
        let dir = tempfile::tempdir().unwrap();
        let store = CookieStore::new(dir.path());
        let jar = vec![
            json!({"name": "sid", "value": "abc123", "domain": ".example.com", "path": "/", "expires": 1_900_000_000.0, "httpOnly": true, "secure": true, "sameSite": "Lax"}),
            json!({"name": "theme", "value": "dark", "domain": "example.com", "path": "/", "expires": -1.0}),
        ];

        store.save("example.com", &jar).unwrap();
        let loaded = store.load("example.com").expect("jar present");
        assert_eq!(loaded.len(), 2);
        assert_eq!(loaded[0]["name"], "sid");
        assert_eq!(loaded[1]["expires"], -1.0);
    }

    #[test]
    fn missing_or_empty_jar_is_none() {
        let dir = tempfile::tempdir().unwrap();
        let store = CookieStore::new(dir.path());
        assert!(store.load("nothing.example").is_none());

        store.save("empty.example", &[]).unwrap();
        assert!(store.load("empty.example").is_none());
    }

    #[test]
    fn invalidate_removes_the_file() {
        let dir = tempfile::tempdir().unwrap();
        let store = CookieStore::new(dir.path());
        store
            .save("a.example", &[json!({"name": "x", "value": "1", "domain": "a.example", "path": "/"})])
            .unwrap();
        assert!(store.path_for("a.example").exists());
        store.invalidate("a.example");
        assert!(!store.path_for("a.example").exists());
    }

    #[test]
    fn domain_with_port_maps_to_safe_filename() {
        let store = CookieStore::new("/tmp/jars");
        let path = store.path_for("localhost:8080");
        assert_eq!(path.file_name().unwrap().to_str().unwrap(), "localhost_8080.json");
    }

    #[test]
    fn domain_of_extracts_host() {
        assert_eq!(domain_of("https://sub.example.com/a?b=c"), Some("sub.example.com".into()));
        assert_eq!(domain_of("not a url"), None);
    }
}
