//! End-to-end job-tracker lifecycle through the public API.

use std::sync::Arc;
use std::time::Duration;

use stealthfetch::{jobs, JobStatus, JobTracker, ManualClock, StealthFetchConfig};

fn config(dir: &std::path::Path, max_retries: u32) -> StealthFetchConfig {
    serde_json::from_str(&format!(
        r#"{{
            "checkpoint_path": {:?},
            "max_retries": {},
            "retry_delay_secs": 60,
            "checkpoint_every": 5
        }}"#,
        dir.to_string_lossy(),
        max_retries
    ))
    .unwrap()
}

#[tokio::test]
async fn retry_cycle_ends_in_terminal_failed() {
    let dir = tempfile::tempdir().unwrap();
    let clock = Arc::new(ManualClock::default());
    let tracker = JobTracker::new("lifecycle", &config(dir.path(), 3)).with_clock(clock.clone());

    assert_eq!(tracker.add_items(["https://a.com"]), 1);
    assert_eq!(tracker.add_items(["https://a.com"]), 0, "same URL is a no-op");
    assert_eq!(tracker.get_stats().total, 1);

    let item = tracker.get_next_item().expect("one pending item");
    assert_eq!(item.status, JobStatus::Pending);
    assert_eq!(item.attempts, 0);
    let id = item.id.clone();

    tracker.mark_processing(&id).unwrap();
    let stats = tracker.get_stats();
    assert_eq!(stats.processing, 1);

    // First failure: 1 < 3 attempts, so back to pending.
    tracker.mark_failed(&id, "x").unwrap();
    assert_eq!(tracker.get_stats().pending, 1);

    // Two more rounds; the third failure is terminal.
    for _ in 0..2 {
        clock.advance(Duration::from_secs(61));
        let item = tracker.get_next_item().expect("retry-eligible");
        tracker.mark_processing(&item.id).unwrap();
        tracker.mark_failed(&item.id, "x").unwrap();
    }
    let stats = tracker.get_stats();
    assert_eq!(stats.failed, 1);
    assert_eq!(stats.pending, 0);
    assert!(tracker.is_complete());
}

#[tokio::test]
async fn checkpoint_reproduces_stats_and_statuses() {
    let dir = tempfile::tempdir().unwrap();
    let cfg = config(dir.path(), 3);
    let tracker = JobTracker::new("persist", &cfg);

    tracker.add_items([
        "https://one.example/",
        "https://two.example/",
        "https://three.example/",
        "https://four.example/",
    ]);
    let one = jobs::item_id("https://one.example/");
    let two = jobs::item_id("https://two.example/");
    let three = jobs::item_id("https://three.example/");

    tracker.mark_processing(&one).unwrap();
    tracker
        .mark_completed(&one, serde_json::json!({"words": 120}))
        .unwrap();
    tracker.mark_processing(&two).unwrap();
    tracker.mark_captcha(&two).unwrap();
    // Burn through all three attempts so `three` lands terminal.
    for _ in 0..3 {
        tracker.mark_processing(&three).unwrap();
        tracker.mark_failed(&three, "boom").unwrap();
    }
    assert_eq!(tracker.get_stats().failed, 1);

    tracker.save().unwrap();
    let restored = JobTracker::load("persist", &cfg);

    assert_eq!(restored.get_stats(), tracker.get_stats());
    let progress = restored.progress();
    assert_eq!(progress.stats.completed, 1);
    assert_eq!(progress.stats.captcha, 1);

    // Captcha items come back with zeroed attempts after a reset.
    assert_eq!(restored.reset_captcha_items(), 1);
    let revived = restored
        .get_next_item()
        .expect("reset captcha item is pending again");
    assert_eq!(revived.id, two);
    assert_eq!(revived.attempts, 0);
}
