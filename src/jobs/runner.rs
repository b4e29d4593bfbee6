//! Bounded-concurrency batch driver.
//!
//! Pulls items off the tracker, obtains warmed sessions per domain, runs a
//! caller-supplied processor on each item, and maps outcomes back onto the
//! tracker's state machine. CAPTCHA hits close the affected domain, wait
//! out the cooldown, and release every parked item for another pass.

use anyhow::Result;
use futures::stream::{self, StreamExt};
use std::future::Future;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{info, warn};

use super::{JobItem, JobStats, JobTracker};
use crate::core::clock::{Clock, SystemClock};
use crate::session::captcha::CaptchaDetection;
use crate::session::cookies::domain_of;
use crate::session::{PersistentSessionManager, Session, SessionError};

pub struct BatchRunner {
    tracker: Arc<JobTracker>,
    sessions: Arc<PersistentSessionManager>,
    max_concurrent: usize,
    idle_tick: Duration,
    clock: Arc<dyn Clock>,
}

impl BatchRunner {
    pub fn new(
        tracker: Arc<JobTracker>,
        sessions: Arc<PersistentSessionManager>,
        max_concurrent: usize,
    ) -> Self {
        Self {
            tracker,
            sessions,
            max_concurrent: max_concurrent.max(1),
            idle_tick: Duration::from_secs(5),
            clock: Arc::new(SystemClock),
        }
    }

    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    /// How long to sleep when every pending item is still waiting out its
    /// retry delay.
    pub fn with_idle_tick(mut self, tick: Duration) -> Self {
        self.idle_tick = tick;
        self
    }

    /// Drive the job to completion. `process` receives the item plus a
    /// warmed session for the item's domain and returns the result payload
    /// stored on completion.
    pub async fn run<F, Fut>(&self, process: F) -> Result<JobStats>
    where
        F: Fn(Arc<Session>, JobItem) -> Fut + Send + Sync + Clone,
        Fut: Future<Output = Result<serde_json::Value>> + Send,
    {
        info!(
            "🚚 batch run '{}' starting: {:?}",
            self.tracker.job_id(),
            self.tracker.get_stats()
        );

        loop {
            if self.tracker.is_complete() {
                break;
            }

            let mut batch = Vec::new();
            while batch.len() < self.max_concurrent {
                match self.tracker.get_next_item() {
                    Some(item) => {
                        self.tracker.mark_processing(&item.id)?;
                        batch.push(item);
                    }
                    None => break,
                }
            }

            if batch.is_empty() {
                let stats = self.tracker.get_stats();
                if stats.captcha > 0 && stats.pending == 0 && stats.processing == 0 {
                    // Nothing left but parked items and no cooldown of our
                    // own pending — an operator reset_captcha_items() call
                    // has to release these.
                    warn!(
                        "batch run '{}': {} items parked on captcha, stopping",
                        self.tracker.job_id(),
                        stats.captcha
                    );
                    break;
                }
                self.clock.sleep(self.idle_tick).await;
                continue;
            }

            let captcha_hits: Vec<Option<(String, CaptchaDetection)>> = stream::iter(batch)
                .map(|item| self.process_item(item, process.clone()))
                .buffer_unordered(self.max_concurrent)
                .collect()
                .await;

            // One cooldown covers every hit in this batch; afterwards all
            // parked items go back into rotation with fresh attempts.
            if let Some((domain, detection)) = captcha_hits.into_iter().flatten().next() {
                self.sessions.handle_captcha(&domain, &detection).await;
                self.tracker.reset_captcha_items();
            }
        }

        if let Err(e) = self.tracker.save() {
            warn!("final checkpoint save failed (non-fatal): {}", e);
        }
        self.tracker.flush_saves().await;

        let stats = self.tracker.get_stats();
        info!("🏁 batch run '{}' finished: {:?}", self.tracker.job_id(), stats);
        Ok(stats)
    }

    async fn process_item<F, Fut>(
        &self,
        item: JobItem,
        process: F,
    ) -> Option<(String, CaptchaDetection)>
    where
        F: Fn(Arc<Session>, JobItem) -> Fut + Send + Sync,
        Fut: Future<Output = Result<serde_json::Value>> + Send,
    {
        let started = Instant::now();
        let Some(domain) = domain_of(&item.url) else {
            let _ = self.tracker.mark_failed(&item.id, "invalid url: no host");
            return None;
        };

        match self.sessions.get_session(&domain).await {
            Err(SessionError::Captcha { domain, detection }) => {
                let _ = self.tracker.mark_captcha(&item.id);
                Some((domain, detection))
            }
            Err(e) => {
                warn!("session for {} unavailable: {}", domain, e);
                let _ = self.tracker.mark_failed(&item.id, &e.to_string());
                None
            }
            Ok(session) => match process(session.clone(), item.clone()).await {
                Ok(payload) => {
                    let _ = self.tracker.mark_completed(&item.id, payload);
                    info!(
                        "✔ {} completed in {}ms",
                        item.url,
                        started.elapsed().as_millis()
                    );
                    None
                }
                Err(e) => {
                    // A processing error on a live session is often a
                    // challenge page in disguise; check before writing it
                    // off as a plain failure.
                    if let Some(detection) = self.sessions.detect_captcha(&session).await {
                        let _ = self.tracker.mark_captcha(&item.id);
                        Some((domain, detection))
                    } else {
                        let _ = self.tracker.mark_failed(&item.id, &e.to_string());
                        None
                    }
                }
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::clock::ManualClock;
    use crate::core::config::StealthFetchConfig;
    use crate::renderer::RendererManager;

    fn test_config(dir: &std::path::Path) -> StealthFetchConfig {
        serde_json::from_str(&format!(
            r#"{{
                "rendering_enabled": false,
                "checkpoint_path": {:?},
                "max_retries": 2,
                "retry_delay_secs": 1,
                "checkpoint_every": 100
            }}"#,
            dir.to_string_lossy()
        ))
        .unwrap()
    }

    /// No browser available: every item exhausts its retries through
    /// renderer-unavailable session errors and lands in terminal `failed`,
    /// the run loop terminates, and a final checkpoint is written.
    #[tokio::test]
    async fn run_drains_to_failed_without_a_browser() {
        let dir = tempfile::tempdir().unwrap();
        let config = test_config(dir.path());
        let clock = Arc::new(ManualClock::default());

        let renderer = RendererManager::new(&config);
        let sessions = Arc::new(
            PersistentSessionManager::new(&config, renderer).with_clock(clock.clone()),
        );
        let tracker = Arc::new(
            JobTracker::new("job-run", &config).with_clock(clock.clone()),
        );
        tracker.add_items(["https://a.example/x", "https://b.example/y"]);

        let runner = BatchRunner::new(tracker.clone(), sessions, 2)
            .with_clock(clock.clone())
            .with_idle_tick(Duration::from_secs(2));
        let stats = runner
            .run(|_session, _item| async { Ok(serde_json::json!({})) })
            .await
            .unwrap();

        assert_eq!(stats.failed, 2);
        assert_eq!(stats.completed, 0);
        assert!(tracker.is_complete());
        assert!(tracker.checkpoint_file().exists());
    }

    /// Items whose URL has no host are failed rather than retried forever.
    #[tokio::test]
    async fn hostless_urls_exhaust_retries() {
        let dir = tempfile::tempdir().unwrap();
        let config = test_config(dir.path());
        let clock = Arc::new(ManualClock::default());

        let renderer = RendererManager::new(&config);
        let sessions = Arc::new(
            PersistentSessionManager::new(&config, renderer).with_clock(clock.clone()),
        );
        let tracker = Arc::new(
            JobTracker::new("job-badurl", &config).with_clock(clock.clone()),
        );
        tracker.add_items(["https://good.example/a", "data:text/plain,hi"]);

        let runner = BatchRunner::new(tracker.clone(), sessions, 1)
            .with_clock(clock.clone())
            .with_idle_tick(Duration::from_secs(2));
        let stats = runner
            .run(|_session, _item| async { Ok(serde_json::json!({})) })
            .await
            .unwrap();

        assert_eq!(stats.failed, 2);
        assert!(tracker.is_complete());
    }
}
