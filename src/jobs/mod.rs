//! Resumable job tracking for large URL sets.
//!
//! Items are keyed by a deterministic URL hash, so re-adding a URL is a
//! no-op and a resumed job lines up with its checkpoint. The tracker owns
//! the full item state machine and persists itself to
//! `<checkpoint_path>/<job_id>.json` — periodically in the background, and
//! on demand via [`JobTracker::save`].

pub mod runner;

use anyhow::{anyhow, Result};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::task::JoinHandle;
use tracing::{info, warn};

use crate::core::clock::{Clock, SystemClock};
use crate::core::config::StealthFetchConfig;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum JobStatus {
    Pending,
    Processing,
    Completed,
    Failed,
    Captcha,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct JobItem {
    pub id: String,
    pub url: String,
    pub status: JobStatus,
    pub attempts: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_attempt: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub completed_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub result: Option<serde_json::Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

/// Deterministic item identity: hex of the first 16 bytes of the URL's
/// SHA-256. Stable across runs, so checkpoints and re-adds line up.
pub fn item_id(url: &str) -> String {
    let digest = Sha256::digest(url.as_bytes());
    digest[..16].iter().map(|b| format!("{:02x}", b)).collect()
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct JobStats {
    pub total: usize,
    pub pending: usize,
    pub processing: usize,
    pub completed: usize,
    pub failed: usize,
    pub captcha: usize,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct JobProgress {
    pub stats: JobStats,
    pub started_at: DateTime<Utc>,
    pub last_update: DateTime<Utc>,
    /// `None` until the first completion — with nothing completed there is
    /// no rate to extrapolate from.
    pub estimated_remaining_secs: Option<u64>,
}

#[derive(Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct Checkpoint {
    job_id: String,
    started_at: DateTime<Utc>,
    last_update: DateTime<Utc>,
    items: Vec<(String, JobItem)>,
    stats: JobStats,
}

struct TrackerState {
    items: HashMap<String, JobItem>,
    /// Insertion order, so scans are deterministic.
    order: Vec<String>,
    started_at: DateTime<Utc>,
    last_update: DateTime<Utc>,
    completions_since_save: u32,
}

pub struct JobTracker {
    job_id: String,
    checkpoint_dir: PathBuf,
    max_attempts: u32,
    retry_delay: Duration,
    checkpoint_every: u32,
    clock: Arc<dyn Clock>,
    state: Mutex<TrackerState>,
    saves: Mutex<Vec<JoinHandle<()>>>,
}

impl JobTracker {
    pub fn new(job_id: impl Into<String>, config: &StealthFetchConfig) -> Self {
        let clock: Arc<dyn Clock> = Arc::new(SystemClock);
        let now = clock.now();
        Self {
            job_id: job_id.into(),
            checkpoint_dir: config.resolve_checkpoint_path(),
            max_attempts: config.resolve_max_retries().max(1),
            retry_delay: Duration::from_secs(config.resolve_retry_delay_secs()),
            checkpoint_every: config.resolve_checkpoint_every(),
            clock,
            state: Mutex::new(TrackerState {
                items: HashMap::new(),
                order: Vec::new(),
                started_at: now,
                last_update: now,
                completions_since_save: 0,
            }),
            saves: Mutex::new(Vec::new()),
        }
    }

    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        let now = clock.now();
        {
            let mut st = self.state.lock().unwrap();
            st.started_at = now;
            st.last_update = now;
        }
        self.clock = clock;
        self
    }

    /// Restore a job from its checkpoint file. A missing or corrupt file
    /// (or an id mismatch) yields a fresh, empty tracker rather than an
    /// error. Items that were `processing` when the process died go back to
    /// `pending` so the job can resume.
    pub fn load(job_id: impl Into<String>, config: &StealthFetchConfig) -> Self {
        let tracker = Self::new(job_id, config);
        let path = tracker.checkpoint_file();
        let content = match std::fs::read_to_string(&path) {
            Ok(c) => c,
            Err(_) => return tracker,
        };
        let checkpoint: Checkpoint = match serde_json::from_str(&content) {
            Ok(cp) => cp,
            Err(e) => {
                warn!(
                    "checkpoint {} is corrupt ({}) — starting fresh",
                    path.display(),
                    e
                );
                return tracker;
            }
        };
        if checkpoint.job_id != tracker.job_id {
            warn!(
                "checkpoint {} belongs to job '{}' — starting fresh",
                path.display(),
                checkpoint.job_id
            );
            return tracker;
        }

        {
            let mut st = tracker.state.lock().unwrap();
            st.started_at = checkpoint.started_at;
            st.last_update = checkpoint.last_update;
            st.order = checkpoint.items.iter().map(|(id, _)| id.clone()).collect();
            st.items = checkpoint
                .items
                .into_iter()
                .map(|(id, mut item)| {
                    if item.status == JobStatus::Processing {
                        item.status = JobStatus::Pending;
                    }
                    (id, item)
                })
                .collect();
            info!(
                "📦 resumed job '{}' from checkpoint ({} items)",
                tracker.job_id,
                st.items.len()
            );
        }
        tracker
    }

    pub fn job_id(&self) -> &str {
        &self.job_id
    }

    pub fn checkpoint_file(&self) -> PathBuf {
        self.checkpoint_dir.join(format!("{}.json", self.job_id))
    }

    /// Add URLs as pending items. Already-known URLs are skipped; returns
    /// how many items were actually added.
    pub fn add_items<I, S>(&self, urls: I) -> usize
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let now = self.clock.now();
        let mut st = self.state.lock().unwrap();
        let mut added = 0;
        for url in urls {
            let url = url.into();
            let id = item_id(&url);
            if st.items.contains_key(&id) {
                continue;
            }
            st.items.insert(
                id.clone(),
                JobItem {
                    id: id.clone(),
                    url,
                    status: JobStatus::Pending,
                    attempts: 0,
                    last_attempt: None,
                    completed_at: None,
                    result: None,
                    error: None,
                },
            );
            st.order.push(id);
            added += 1;
        }
        if added > 0 {
            st.last_update = now;
        }
        added
    }

    /// Next item to work on: retry-eligible items (attempted before, back in
    /// `pending`, fixed delay elapsed) come before never-attempted ones.
    /// Selection does not change item state — callers follow up with
    /// [`JobTracker::mark_processing`].
    pub fn get_next_item(&self) -> Option<JobItem> {
        let now = self.clock.now();
        let st = self.state.lock().unwrap();

        let retry_ready = |item: &JobItem| {
            item.attempts > 0
                && item.attempts < self.max_attempts
                && item
                    .last_attempt
                    .and_then(|last| (now - last).to_std().ok())
                    .map(|since| since >= self.retry_delay)
                    .unwrap_or(false)
        };

        for id in &st.order {
            let item = &st.items[id];
            if item.status == JobStatus::Pending && retry_ready(item) {
                return Some(item.clone());
            }
        }
        for id in &st.order {
            let item = &st.items[id];
            if item.status == JobStatus::Pending && item.attempts == 0 {
                return Some(item.clone());
            }
        }
        None
    }

    pub fn mark_processing(&self, id: &str) -> Result<()> {
        let now = self.clock.now();
        let mut st = self.state.lock().unwrap();
        let item = st
            .items
            .get_mut(id)
            .ok_or_else(|| anyhow!("unknown job item: {}", id))?;
        item.status = JobStatus::Processing;
        item.attempts += 1;
        item.last_attempt = Some(now);
        st.last_update = now;
        Ok(())
    }

    /// Store the result and, every `checkpoint_every` completions, kick off
    /// a background checkpoint save (observable via
    /// [`JobTracker::flush_saves`]).
    pub fn mark_completed(&self, id: &str, result: serde_json::Value) -> Result<()> {
        let now = self.clock.now();
        let checkpoint = {
            let mut st = self.state.lock().unwrap();
            let item = st
                .items
                .get_mut(id)
                .ok_or_else(|| anyhow!("unknown job item: {}", id))?;
            item.status = JobStatus::Completed;
            item.completed_at = Some(now);
            item.result = Some(result);
            item.error = None;
            st.last_update = now;
            st.completions_since_save += 1;
            if st.completions_since_save >= self.checkpoint_every {
                st.completions_since_save = 0;
                Some(self.checkpoint_from(&st))
            } else {
                None
            }
        };
        if let Some(checkpoint) = checkpoint {
            self.spawn_save(checkpoint);
        }
        Ok(())
    }

    /// Failed attempt: back to `pending` while retries remain, else the
    /// terminal `failed` state.
    pub fn mark_failed(&self, id: &str, error: &str) -> Result<()> {
        let now = self.clock.now();
        let mut st = self.state.lock().unwrap();
        let max_attempts = self.max_attempts;
        let item = st
            .items
            .get_mut(id)
            .ok_or_else(|| anyhow!("unknown job item: {}", id))?;
        item.error = Some(error.to_string());
        item.status = if item.attempts < max_attempts {
            JobStatus::Pending
        } else {
            JobStatus::Failed
        };
        st.last_update = now;
        Ok(())
    }

    pub fn mark_captcha(&self, id: &str) -> Result<()> {
        let now = self.clock.now();
        let mut st = self.state.lock().unwrap();
        let item = st
            .items
            .get_mut(id)
            .ok_or_else(|| anyhow!("unknown job item: {}", id))?;
        item.status = JobStatus::Captcha;
        st.last_update = now;
        Ok(())
    }

    /// Bulk-return every `captcha` item to `pending` with a zeroed attempt
    /// counter. Called after the session manager's cooldown has run.
    pub fn reset_captcha_items(&self) -> usize {
        let now = self.clock.now();
        let mut st = self.state.lock().unwrap();
        let mut reset = 0;
        for item in st.items.values_mut() {
            if item.status == JobStatus::Captcha {
                item.status = JobStatus::Pending;
                item.attempts = 0;
                item.last_attempt = None;
                item.error = None;
                reset += 1;
            }
        }
        if reset > 0 {
            st.last_update = now;
            info!("🔓 reset {} captcha items to pending", reset);
        }
        reset
    }

    pub fn get_stats(&self) -> JobStats {
        let st = self.state.lock().unwrap();
        stats_of(&st.items)
    }

    /// A job is complete once every item is terminal (`completed` or
    /// `failed`). Items parked in `captcha` still count as outstanding.
    pub fn is_complete(&self) -> bool {
        let s = self.get_stats();
        s.total > 0 && s.pending == 0 && s.processing == 0 && s.captcha == 0
    }

    pub fn progress(&self) -> JobProgress {
        let now = self.clock.now();
        let st = self.state.lock().unwrap();
        let stats = stats_of(&st.items);
        let estimated_remaining_secs = if stats.completed == 0 {
            None
        } else {
            let elapsed = (now - st.started_at).num_seconds().max(0) as f64;
            let per_item = elapsed / stats.completed as f64;
            let outstanding = stats.pending + stats.processing + stats.captcha;
            Some((per_item * outstanding as f64).round() as u64)
        };
        JobProgress {
            stats,
            started_at: st.started_at,
            last_update: st.last_update,
            estimated_remaining_secs,
        }
    }

    /// Completed items as a JSON document — what a downstream consumer of a
    /// finished job wants to export.
    pub fn export_data(&self) -> serde_json::Value {
        let st = self.state.lock().unwrap();
        let completed: Vec<serde_json::Value> = st
            .order
            .iter()
            .filter_map(|id| st.items.get(id))
            .filter(|item| item.status == JobStatus::Completed)
            .map(|item| {
                serde_json::json!({
                    "url": item.url,
                    "completedAt": item.completed_at,
                    "result": item.result,
                })
            })
            .collect();
        serde_json::json!({
            "jobId": self.job_id,
            "stats": stats_of(&st.items),
            "completed": completed,
        })
    }

    /// Synchronous checkpoint write. A failure is reported to the caller but
    /// the in-memory state stays authoritative either way.
    pub fn save(&self) -> Result<()> {
        let checkpoint = {
            let st = self.state.lock().unwrap();
            self.checkpoint_from(&st)
        };
        std::fs::create_dir_all(&self.checkpoint_dir)?;
        let json = serde_json::to_string_pretty(&checkpoint)?;
        std::fs::write(self.checkpoint_file(), json)?;
        Ok(())
    }

    /// Await all in-flight background checkpoint saves. Lets tests (and
    /// orderly shutdowns) observe completion of the fire-and-forget writes.
    pub async fn flush_saves(&self) {
        let handles: Vec<JoinHandle<()>> = self.saves.lock().unwrap().drain(..).collect();
        for handle in handles {
            let _ = handle.await;
        }
    }

    fn checkpoint_from(&self, st: &TrackerState) -> Checkpoint {
        Checkpoint {
            job_id: self.job_id.clone(),
            started_at: st.started_at,
            last_update: st.last_update,
            items: st
                .order
                .iter()
                .filter_map(|id| st.items.get(id).map(|item| (id.clone(), item.clone())))
                .collect(),
            stats: stats_of(&st.items),
        }
    }

    fn spawn_save(&self, checkpoint: Checkpoint) {
        let dir = self.checkpoint_dir.clone();
        let path = self.checkpoint_file();
        let write = move || -> Result<()> {
            std::fs::create_dir_all(&dir)?;
            let json = serde_json::to_string_pretty(&checkpoint)?;
            std::fs::write(&path, json)?;
            Ok(())
        };
        match tokio::runtime::Handle::try_current() {
            Ok(handle) => {
                let task = handle.spawn(async move {
                    if let Err(e) = tokio::task::spawn_blocking(write)
                        .await
                        .unwrap_or_else(|e| Err(anyhow!("checkpoint task panicked: {}", e)))
                    {
                        warn!("checkpoint write failed (state stays in memory): {}", e);
                    }
                });
                self.saves.lock().unwrap().push(task);
            }
            Err(_) => {
                if let Err(e) = write() {
                    warn!("checkpoint write failed (state stays in memory): {}", e);
                }
            }
        }
    }
}

fn stats_of(items: &HashMap<String, JobItem>) -> JobStats {
    let mut stats = JobStats {
        total: items.len(),
        ..JobStats::default()
    };
    for item in items.values() {
        match item.status {
            JobStatus::Pending => stats.pending += 1,
            JobStatus::Processing => stats.processing += 1,
            JobStatus::Completed => stats.completed += 1,
            JobStatus::Failed => stats.failed += 1,
            JobStatus::Captcha => stats.captcha += 1,
        }
    }
    stats
}
