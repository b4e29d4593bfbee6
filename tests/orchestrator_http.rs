//! Orchestrator behavior against a local HTTP origin: plain fetches,
//! conditional revalidation, 4xx handling, and render-to-HTTP fallback.

use std::net::SocketAddr;
use std::sync::{Arc, Mutex};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpListener;

use stealthfetch::{
    CountingMetrics, FallbackReason, FetchMode, FetchOrchestrator, FetchRequest,
    FixedDelayLimiter, RendererManager, RequestDelay, StealthFetchConfig,
};

// Initialize logging for tests
fn init_logger() {
    let _ = tracing_subscriber::fmt()
        .with_max_level(tracing::Level::INFO)
        .with_test_writer()
        .try_init();
}

#[derive(Debug, Clone)]
struct SeenRequest {
    path: String,
    if_none_match: Option<String>,
}

/// Minimal HTTP/1.1 origin:
/// * `/page`    — 200 + `ETag: "v1"`, or 304 when the tag comes back
/// * `/missing` — 404
/// * anything else — 200 without validators
async fn spawn_origin() -> (SocketAddr, Arc<Mutex<Vec<SeenRequest>>>) {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let log: Arc<Mutex<Vec<SeenRequest>>> = Arc::new(Mutex::new(Vec::new()));

    let accept_log = log.clone();
    tokio::spawn(async move {
        loop {
            let Ok((mut stream, _)) = listener.accept().await else {
                break;
            };
            let log = accept_log.clone();
            tokio::spawn(async move {
                let mut buf = vec![0u8; 16 * 1024];
                let mut read = 0;
                loop {
                    match stream.read(&mut buf[read..]).await {
                        Ok(0) | Err(_) => break,
                        Ok(n) => {
                            read += n;
                            if buf[..read].windows(4).any(|w| w == b"\r\n\r\n") {
                                break;
                            }
                        }
                    }
                }
                let raw = String::from_utf8_lossy(&buf[..read]).to_string();
                let path = raw
                    .lines()
                    .next()
                    .and_then(|l| l.split_whitespace().nth(1))
                    .unwrap_or("/")
                    .to_string();
                let if_none_match = raw
                    .lines()
                    .find(|l| l.to_ascii_lowercase().starts_with("if-none-match:"))
                    .map(|l| l.splitn(2, ':').nth(1).unwrap_or("").trim().to_string());

                log.lock().unwrap().push(SeenRequest {
                    path: path.clone(),
                    if_none_match: if_none_match.clone(),
                });

                let response = match path.as_str() {
                    "/page" if if_none_match.as_deref() == Some("\"v1\"") => {
                        "HTTP/1.1 304 Not Modified\r\nETag: \"v1\"\r\nConnection: close\r\n\r\n"
                            .to_string()
                    }
                    "/page" => {
                        let body = "hello world";
                        format!(
                            "HTTP/1.1 200 OK\r\nContent-Type: text/html\r\nETag: \"v1\"\r\nContent-Length: {}\r\nConnection: close\r\n\r\n{}",
                            body.len(),
                            body
                        )
                    }
                    "/missing" => {
                        let body = "nope";
                        format!(
                            "HTTP/1.1 404 Not Found\r\nContent-Type: text/plain\r\nContent-Length: {}\r\nConnection: close\r\n\r\n{}",
                            body.len(),
                            body
                        )
                    }
                    _ => {
                        let body = "plain";
                        format!(
                            "HTTP/1.1 200 OK\r\nContent-Type: text/plain\r\nContent-Length: {}\r\nConnection: close\r\n\r\n{}",
                            body.len(),
                            body
                        )
                    }
                };
                let _ = stream.write_all(response.as_bytes()).await;
                let _ = stream.shutdown().await;
            });
        }
    });

    (addr, log)
}

fn no_render_config() -> StealthFetchConfig {
    serde_json::from_str(r#"{"rendering_enabled": false, "http_timeout_secs": 5}"#).unwrap()
}

fn fast_orchestrator(config: &StealthFetchConfig, renderer: Arc<RendererManager>) -> FetchOrchestrator {
    FetchOrchestrator::new(config, renderer)
        .with_limiter(Arc::new(FixedDelayLimiter::new(RequestDelay::new(0, 0))))
}

#[tokio::test]
async fn http_mode_sets_no_fallback_and_no_attempt() {
    init_logger();
    let (addr, _log) = spawn_origin().await;
    let config = no_render_config();
    let orchestrator = fast_orchestrator(&config, RendererManager::new(&config));

    let result = orchestrator
        .fetch_page(FetchRequest::new(format!("http://{}/page", addr)))
        .await
        .unwrap();

    assert_eq!(result.status, 200);
    assert_eq!(result.body, "hello world");
    assert!(!result.from_cache);
    assert_eq!(result.diagnostics.effective_mode, FetchMode::Http);
    assert!(!result.diagnostics.attempted);
    assert!(result.diagnostics.fallback_reason.is_none());
}

#[tokio::test]
async fn stored_etag_drives_a_conditional_refetch() {
    let (addr, log) = spawn_origin().await;
    let config = no_render_config();
    let metrics = Arc::new(CountingMetrics::default());
    let orchestrator = fast_orchestrator(&config, RendererManager::new(&config))
        .with_metrics(metrics.clone());
    let url = format!("http://{}/page", addr);

    let first = orchestrator.fetch_page(FetchRequest::new(&url)).await.unwrap();
    assert_eq!(first.status, 200);
    assert!(!first.from_cache);

    let second = orchestrator.fetch_page(FetchRequest::new(&url)).await.unwrap();
    assert_eq!(second.status, 200, "304 revalidation serves the cached body");
    assert!(second.from_cache);
    assert_eq!(second.body, "hello world");

    let seen = log.lock().unwrap().clone();
    assert_eq!(seen.len(), 2);
    assert_eq!(seen[0].if_none_match, None);
    assert_eq!(
        seen[1].if_none_match.as_deref(),
        Some("\"v1\""),
        "second same-URL fetch must carry the stored entity tag"
    );
    assert_eq!(
        metrics
            .not_modified
            .load(std::sync::atomic::Ordering::Relaxed),
        1
    );
}

#[tokio::test]
async fn responses_without_validators_are_served_from_cache() {
    let (addr, log) = spawn_origin().await;
    let config = no_render_config();
    let orchestrator = fast_orchestrator(&config, RendererManager::new(&config));
    let url = format!("http://{}/plain", addr);

    let first = orchestrator.fetch_page(FetchRequest::new(&url)).await.unwrap();
    assert!(!first.from_cache);
    let second = orchestrator.fetch_page(FetchRequest::new(&url)).await.unwrap();
    assert!(second.from_cache);

    // No validators, no revalidation: the origin saw exactly one request.
    assert_eq!(log.lock().unwrap().len(), 1);
}

#[tokio::test]
async fn a_404_is_returned_but_never_cached() {
    let (addr, log) = spawn_origin().await;
    let config = no_render_config();
    let orchestrator = fast_orchestrator(&config, RendererManager::new(&config));
    let url = format!("http://{}/missing", addr);

    let first = orchestrator.fetch_page(FetchRequest::new(&url)).await.unwrap();
    assert_eq!(first.status, 404);
    assert_eq!(first.body, "nope");

    let second = orchestrator.fetch_page(FetchRequest::new(&url)).await.unwrap();
    assert_eq!(second.status, 404);
    assert!(!second.from_cache);
    assert_eq!(log.lock().unwrap().len(), 2, "4xx responses bypass the cache");
}

#[tokio::test]
async fn rendered_request_degrades_when_renderer_disabled() {
    let (addr, _log) = spawn_origin().await;
    let config = no_render_config();
    let orchestrator = fast_orchestrator(&config, RendererManager::new(&config));

    let result = orchestrator
        .fetch_page(FetchRequest::new(format!("http://{}/page", addr)).rendered())
        .await
        .unwrap();

    assert_eq!(result.status, 200);
    assert_eq!(result.diagnostics.requested_mode, FetchMode::Rendered);
    assert_eq!(result.diagnostics.effective_mode, FetchMode::Http);
    assert!(!result.diagnostics.attempted);
    assert_eq!(
        result.diagnostics.fallback_reason,
        Some(FallbackReason::RenderingDisabled)
    );
}

#[tokio::test]
async fn failed_render_falls_back_to_http_with_a_reason() {
    init_logger();
    let (addr, _log) = spawn_origin().await;
    let config: StealthFetchConfig =
        serde_json::from_str(r#"{"http_timeout_secs": 5, "max_pages": 2}"#).unwrap();
    // An executable path that cannot launch: the render attempt dies, the
    // orchestrator transparently degrades to plain HTTP.
    let renderer = RendererManager::with_executable(&config, "/nonexistent/chromium-binary");
    let orchestrator = fast_orchestrator(&config, renderer.clone());

    let result = orchestrator
        .fetch_page(FetchRequest::new(format!("http://{}/page", addr)).rendered())
        .await
        .unwrap();

    assert_eq!(result.status, 200);
    assert_eq!(result.body, "hello world");
    assert_eq!(result.diagnostics.effective_mode, FetchMode::Http);
    assert_eq!(
        result.diagnostics.fallback_reason,
        Some(FallbackReason::RendererUnavailable)
    );
    assert!(result.diagnostics.error.is_some());
    // All gate slots free again after the failed attempt.
    assert_eq!(renderer.gate().snapshot().available, 2);
}
