//! Human-pace page interaction: settle waits, randomized scrolling, and
//! synthetic pointer drift. Shared by the rendered-fetch path and session
//! warming.

use chromiumoxide::Page;
use rand::distr::{Distribution, Uniform};
use std::time::Duration;
use tracing::{debug, warn};

use crate::core::clock::Clock;
use crate::renderer::fingerprint::FingerprintPolicy;

/// Wait until the page network goes idle (no new resource entries for
/// `quiet_ms` consecutive ms) or until `timeout_ms` has elapsed.
///
/// Polls `performance.getEntriesByType("resource").length` every 250 ms — a
/// networkidle heuristic that works without subscribing to CDP Network
/// events.
pub async fn wait_until_stable(page: &Page, quiet_ms: u64, timeout_ms: u64) {
    let poll_ms = 250u64;
    let start = std::time::Instant::now();
    let mut last_count: u64 = 0;
    let mut stable_since = std::time::Instant::now();

    loop {
        if start.elapsed().as_millis() as u64 >= timeout_ms {
            debug!("wait_until_stable: timeout after {}ms", timeout_ms);
            break;
        }

        let count: u64 = page
            .evaluate("performance.getEntriesByType('resource').length")
            .await
            .ok()
            .and_then(|v| v.into_value::<serde_json::Value>().ok())
            .and_then(|j| j.as_u64())
            .unwrap_or(0);

        let ready_complete: bool = page
            .evaluate("document.readyState")
            .await
            .ok()
            .and_then(|v| v.into_value::<serde_json::Value>().ok())
            .and_then(|j| j.as_str().map(|s| s == "complete"))
            .unwrap_or(false);

        if !ready_complete {
            // DOM not fully loaded; "idle" must not trigger yet.
            stable_since = std::time::Instant::now();
            last_count = count;
        } else if count != last_count {
            last_count = count;
            stable_since = std::time::Instant::now();
        } else if stable_since.elapsed().as_millis() as u64 >= quiet_ms {
            debug!(
                "wait_until_stable: idle after {}ms ({} resources)",
                start.elapsed().as_millis(),
                count
            );
            break;
        }

        tokio::time::sleep(Duration::from_millis(poll_ms)).await;
    }
}

/// One pass of reading-pace scrolling: a few randomized downward scrolls
/// with pauses, occasionally drifting back up the way a human skims.
pub async fn human_scroll(page: &Page, clock: &dyn Clock) {
    // Draw all randomness before the first await; rng handles are not Send.
    let actions: Vec<(u16, u64, bool, u16)> = {
        let mut rng = rand::rng();
        let pass_dist = Uniform::new(2usize, 6).unwrap();
        let scroll_dist = Uniform::new(200u16, 700).unwrap();
        let pause_dist = Uniform::new(300u64, 1500).unwrap();
        let up_dist = Uniform::new(50u16, 200).unwrap();
        let chance_dist = Uniform::new(0u8, 5).unwrap();

        (0..pass_dist.sample(&mut rng))
            .map(|_| {
                (
                    scroll_dist.sample(&mut rng),
                    pause_dist.sample(&mut rng),
                    chance_dist.sample(&mut rng) == 0,
                    up_dist.sample(&mut rng),
                )
            })
            .collect()
    };

    debug!("human_scroll: {} randomized passes", actions.len());
    for (down, pause, drift_up, up) in actions {
        if let Err(e) = page
            .evaluate(format!("window.scrollBy({{top: {}, behavior: 'smooth'}});", down))
            .await
        {
            warn!("scroll simulation error: {}", e);
        }
        clock.sleep(Duration::from_millis(pause)).await;

        if drift_up {
            if let Err(e) = page
                .evaluate(format!("window.scrollBy({{top: -{}, behavior: 'smooth'}});", up))
                .await
            {
                warn!("scroll-up simulation error: {}", e);
            }
            clock.sleep(Duration::from_millis(200 + (up as u64 % 300))).await;
        }
    }
}

/// Replay the policy's synthetic pointer drift over the page.
pub async fn pointer_drift(page: &Page, policy: &dyn FingerprintPolicy, clock: &dyn Clock) {
    for (x, y, pause) in policy.pointer_motion() {
        if let Err(e) = page
            .evaluate(format!("document.elementFromPoint({}, {})", x, y))
            .await
        {
            warn!("pointer simulation error: {}", e);
        }
        clock.sleep(Duration::from_millis(pause)).await;
    }
}

/// Collect up to `limit` same-origin link targets from the current page.
pub async fn same_site_links(page: &Page, limit: usize) -> Vec<String> {
    let script = format!(
        "Array.from(document.querySelectorAll('a[href]'))\
           .map(a => a.href)\
           .filter(h => h.startsWith(location.origin) && h !== location.href)\
           .slice(0, {limit})"
    );
    page.evaluate(script)
        .await
        .ok()
        .and_then(|v| v.into_value::<Vec<String>>().ok())
        .unwrap_or_default()
}
