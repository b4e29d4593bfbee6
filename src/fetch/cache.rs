//! Response cache as an explicit capability interface, with the in-memory
//! `moka` adapter used by default. A networked store can slot in behind the
//! same trait without touching the orchestrator.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::time::Duration;

use crate::core::types::FetchMode;

/// A cached response plus its revalidation metadata.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CachedResponse {
    /// Final URL the response was served from.
    pub url: String,
    pub status: u16,
    pub headers: HashMap<String, String>,
    pub body: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub etag: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_modified: Option<String>,
}

impl CachedResponse {
    /// Whether this entry can drive a conditional request.
    pub fn has_validators(&self) -> bool {
        self.etag.is_some() || self.last_modified.is_some()
    }
}

/// Cache entries are keyed by `(url, effective mode)` — a rendered capture
/// and a raw HTTP body for the same URL are different documents.
pub fn cache_key(url: &str, mode: FetchMode) -> String {
    format!("{}:{}", mode.as_str(), url)
}

#[async_trait]
pub trait ResponseCache: Send + Sync {
    async fn get(&self, key: &str) -> Option<CachedResponse>;
    async fn set(&self, key: String, entry: CachedResponse);
    async fn remove(&self, key: &str);

    async fn set_many(&self, entries: Vec<(String, CachedResponse)>) {
        for (key, entry) in entries {
            self.set(key, entry).await;
        }
    }
}

/// In-memory adapter over `moka::future::Cache`.
pub struct MokaResponseCache {
    inner: moka::future::Cache<String, CachedResponse>,
}

impl MokaResponseCache {
    pub fn new(capacity: u64, ttl: Duration) -> Self {
        Self {
            inner: moka::future::Cache::builder()
                .max_capacity(capacity)
                .time_to_live(ttl)
                .build(),
        }
    }
}

#[async_trait]
impl ResponseCache for MokaResponseCache {
    async fn get(&self, key: &str) -> Option<CachedResponse> {
        self.inner.get(key).await
    }

    async fn set(&self, key: String, entry: CachedResponse) {
        self.inner.insert(key, entry).await;
    }

    async fn remove(&self, key: &str) {
        self.inner.invalidate(key).await;
    }
}
