//! End-to-end tests against a loopback `tokio::net::TcpListener` fixture.
//!
//! Grounded in the donor's `tests/core_integration_tests.rs`, which spins up
//! real temp-file/network fixtures rather than mocking; here the fixture is
//! a minimal raw-socket HTTP server so the request builder and HTTP client
//! can be exercised against bytes actually observed on the wire, matching
//! scenarios 1, 2 and 3 from the specification's end-to-end section.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use gb403_engine::config::{HttpClientOptions, PoolConfig, ThrottleConfig};
use gb403_engine::dialer::Dialer;
use gb403_engine::error::DoRequestError;
use gb403_engine::http_client::{ErrorContext, ErrorSink, HttpClient};
use gb403_engine::payload::BypassPayload;
use gb403_engine::pool::WorkerPool;
use gb403_engine::resolver::ChainResolver;
use gb403_engine::sinks::{Finding, FindingsSink};
use gb403_engine::throttle::Throttler;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpListener;

struct SilentErrorSink;

#[async_trait::async_trait]
impl ErrorSink for SilentErrorSink {
    async fn handle_error(&self, _err: &DoRequestError, _ctx: ErrorContext<'_>) -> bool {
        false
    }
}

struct CollectingFindingsSink {
    findings: tokio::sync::Mutex<Vec<Finding>>,
}

impl CollectingFindingsSink {
    fn new() -> Self {
        Self { findings: tokio::sync::Mutex::new(Vec::new()) }
    }
}

#[async_trait::async_trait]
impl FindingsSink for CollectingFindingsSink {
    async fn append(&self, finding: Finding) {
        self.findings.lock().await.push(finding);
    }
}

async fn new_client(options: HttpClientOptions) -> HttpClient {
    let dialer = Arc::new(Dialer::new(
        Arc::new(ChainResolver::new().expect("resolver chain should initialize")),
        64,
        Duration::from_secs(60),
    ));
    let throttler = Arc::new(Throttler::new(ThrottleConfig::default()));
    HttpClient::new(dialer, options, throttler)
}

/// Reads one HTTP/1.1 request off `stream` (headers only) and returns the
/// raw bytes, so assertions can check the request-line and header bytes
/// exactly as sent, with no normalization applied by the fixture itself.
async fn read_request_head(stream: &mut tokio::net::TcpStream) -> Vec<u8> {
    let mut buf = Vec::new();
    let mut chunk = [0u8; 4096];
    loop {
        let n = stream.read(&mut chunk).await.expect("read from client");
        buf.extend_from_slice(&chunk[..n]);
        if buf.windows(4).any(|w| w == b"\r\n\r\n") || n == 0 {
            break;
        }
    }
    buf
}

#[tokio::test]
async fn exact_raw_uri_bytes_reach_the_wire_unchanged() {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();

    let server = tokio::spawn(async move {
        let (mut stream, _) = listener.accept().await.unwrap();
        let head = read_request_head(&mut stream).await;
        let text = String::from_utf8_lossy(&head);
        let request_line = text.lines().next().unwrap().to_string();
        stream
            .write_all(b"HTTP/1.1 200 OK\r\nContent-Length: 0\r\n\r\n")
            .await
            .unwrap();
        request_line
    });

    let payload = BypassPayload::new(
        format!("http://{addr}/a/b"),
        "GET",
        "http",
        addr.to_string(),
        "/a/../b/;%2e/c",
        "mid_paths",
    );

    let client = new_client(HttpClientOptions::default()).await;
    let (_, resp) = client.do_request(&payload, &SilentErrorSink).await.unwrap();
    assert_eq!(resp.status_code, 200);

    let request_line = server.await.unwrap();
    assert_eq!(request_line, "GET /a/../b/;%2e/c HTTP/1.1");
}

#[tokio::test]
async fn host_header_override_drives_wire_host_and_redirect() {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();

    let server = tokio::spawn(async move {
        let (mut stream, _) = listener.accept().await.unwrap();
        let head = read_request_head(&mut stream).await;
        let text = String::from_utf8_lossy(&head);
        let host_line = text
            .lines()
            .find(|l| l.to_ascii_lowercase().starts_with("host:"))
            .unwrap()
            .to_string();
        stream
            .write_all(b"HTTP/1.1 302 Found\r\nLocation: https://evil.com/pwned\r\nContent-Length: 0\r\n\r\n")
            .await
            .unwrap();
        host_line
    });

    let payload = BypassPayload::new(
        format!("http://{addr}/"),
        "GET",
        "http",
        addr.to_string(),
        "/",
        "http_headers_url",
    )
    .with_header("Host", "evil.com:1337");

    let client = new_client(HttpClientOptions::default()).await;
    let (_, resp) = client.do_request(&payload, &SilentErrorSink).await.unwrap();
    assert_eq!(resp.status_code, 302);
    assert_eq!(
        resp.headers.iter().find(|h| h.name.eq_ignore_ascii_case("location")).map(|h| h.value.as_str()),
        Some("https://evil.com/pwned")
    );

    let host_line = server.await.unwrap();
    assert_eq!(host_line.trim(), "Host: evil.com:1337");
}

#[tokio::test]
async fn worker_pool_streams_one_finding_per_payload_and_closes_cleanly() {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let served = Arc::new(AtomicUsize::new(0));

    let served_clone = served.clone();
    let server = tokio::spawn(async move {
        for _ in 0..3 {
            let (mut stream, _) = listener.accept().await.unwrap();
            let _ = read_request_head(&mut stream).await;
            stream
                .write_all(b"HTTP/1.1 200 OK\r\nContent-Length: 0\r\n\r\n")
                .await
                .unwrap();
            served_clone.fetch_add(1, Ordering::Relaxed);
        }
    });

    let payloads: Vec<BypassPayload> = (0..3)
        .map(|i| {
            BypassPayload::new(
                format!("http://{addr}/p{i}"),
                "GET",
                "http",
                addr.to_string(),
                format!("/p{i}"),
                "mid_paths",
            )
        })
        .collect();

    let client = Arc::new(new_client(HttpClientOptions::default()).await);
    let pool = WorkerPool::new(client, PoolConfig { max_concurrent: 2, channel_capacity: 8 });
    let sink = Arc::new(CollectingFindingsSink::new());

    pool.run(payloads, Arc::new(SilentErrorSink), sink.clone()).await;
    server.await.unwrap();

    assert_eq!(served.load(Ordering::Relaxed), 3);
    assert_eq!(sink.findings.lock().await.len(), 3);
    assert_eq!(pool.stats().completed.load(Ordering::Relaxed), 3);
    assert_eq!(pool.stats().failed.load(Ordering::Relaxed), 0);
}

#[tokio::test]
async fn consecutive_failures_cancel_the_pool_before_all_payloads_run() {
    // An address nothing listens on: every connection attempt fails fast.
    let unreachable = "127.0.0.1:1";

    let options = HttpClientOptions {
        max_retries: 0,
        max_consecutive_failed_reqs: 3,
        dial_timeout: Duration::from_millis(200),
        timeout: Duration::from_millis(200),
        ..HttpClientOptions::default()
    };
    let client = Arc::new(new_client(options).await);
    let pool = WorkerPool::new(client, PoolConfig { max_concurrent: 1, channel_capacity: 8 });
    let sink = Arc::new(CollectingFindingsSink::new());

    let payloads: Vec<BypassPayload> = (0..20)
        .map(|i| {
            BypassPayload::new(
                format!("http://{unreachable}/p{i}"),
                "GET",
                "http",
                unreachable.to_string(),
                format!("/p{i}"),
                "mid_paths",
            )
        })
        .collect();

    pool.run(payloads, Arc::new(SilentErrorSink), sink.clone()).await;

    // The pool must have cancelled before attempting every payload, and no
    // payload should have produced a finding (every attempt fails).
    assert!(pool.stats().completed.load(Ordering::Relaxed) < 20);
    assert!(sink.findings.lock().await.is_empty());
}
