//! HTTP Client: single-target raw HTTP/1.1 execution
//!
//! Wraps the shared [`Dialer`], owns the [`Throttler`] and the per-client
//! consecutive-failure counter (tracked per client, shared across the pool
//! through this instance). Generalizes "build one request, send it over
//! one connection, parse the response" to whatever host and raw URI a
//! payload names, rather than one fixed endpoint.

use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use rustls::{ClientConfig, OwnedTrustAnchor, RootCertStore, ServerName};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::sync::RwLock;
use tokio::time::timeout;
use tokio_rustls::TlsConnector;
use tracing::{debug, warn};

use crate::builder::{apply_retry_marker, build_request};
use crate::buffers::BufferPool;
use crate::config::HttpClientOptions;
use crate::dialer::Dialer;
use crate::error::DoRequestError;
use crate::payload::BypassPayload;
use crate::response::{parse_wire_response, WireResponse};
use crate::throttle::Throttler;

/// What the pool's critical-cancellation check needs to observe.
pub struct ErrorContext<'a> {
    pub host: &'a str,
    pub bypass_module: &'a str,
    pub source: &'static str,
    pub debug_token: &'a str,
}

/// External collaborator: `handle_error` may return `true` to force the
/// caller to treat the failure as the critical
/// `MaxConsecutiveFailuresReached` condition regardless of the counter.
#[async_trait::async_trait]
pub trait ErrorSink: Send + Sync {
    async fn handle_error(&self, err: &DoRequestError, ctx: ErrorContext<'_>) -> bool;
}

/// Default sink: logs via `tracing`, and never itself claims the critical
/// consecutive-failure condition (the client decides that from its own
/// counter).
pub struct TracingErrorSink;

#[async_trait::async_trait]
impl ErrorSink for TracingErrorSink {
    async fn handle_error(&self, err: &DoRequestError, ctx: ErrorContext<'_>) -> bool {
        warn!(
            host = ctx.host,
            module = ctx.bypass_module,
            source = ctx.source,
            token = ctx.debug_token,
            error = %err,
            "request failed"
        );
        false
    }
}

fn real_tls_connector() -> TlsConnector {
    let mut roots = RootCertStore::empty();
    roots.add_trust_anchors(webpki_roots::TLS_SERVER_ROOTS.iter().map(|ta| {
        OwnedTrustAnchor::from_subject_spki_name_constraints(
            ta.subject.as_ref(),
            ta.spki.as_ref(),
            ta.name_constraints.as_ref().map(|nc| nc.as_ref()),
        )
    }));
    let config = ClientConfig::builder()
        .with_safe_defaults()
        .with_root_certificates(roots)
        .with_no_client_auth();
    TlsConnector::from(Arc::new(config))
}

pub struct HttpClient {
    dialer: Arc<Dialer>,
    options: RwLock<HttpClientOptions>,
    throttler: Arc<Throttler>,
    consecutive_failures: AtomicU32,
    last_response_time_ms: AtomicU64,
    tls_connector: TlsConnector,
    /// Freelist for request-scratch buffers, keyed by `write_buffer_size`;
    /// avoids a fresh `Vec<u8>` allocation on every attempt.
    write_pool: BufferPool,
    /// Freelist for the response accumulation buffer, keyed by
    /// `read_buffer_size`.
    read_pool: BufferPool,
}

impl HttpClient {
    pub fn new(dialer: Arc<Dialer>, options: HttpClientOptions, throttler: Arc<Throttler>) -> Self {
        let write_pool = BufferPool::new(options.write_buffer_size);
        let read_pool = BufferPool::new(options.read_buffer_size);
        Self {
            dialer,
            options: RwLock::new(options),
            throttler,
            consecutive_failures: AtomicU32::new(0),
            last_response_time_ms: AtomicU64::new(0),
            tls_connector: real_tls_connector(),
            write_pool,
            read_pool,
        }
    }

    pub fn get_last_response_time(&self) -> u64 {
        self.last_response_time_ms.load(Ordering::Relaxed)
    }

    pub fn consecutive_failures(&self) -> u32 {
        self.consecutive_failures.load(Ordering::SeqCst)
    }

    /// Snapshot of the options currently in effect, for callers (the worker
    /// pool's response processing) that need the same view `do_request`
    /// used to build the request.
    pub async fn options_snapshot(&self) -> HttpClientOptions {
        self.options.read().await.clone()
    }

    async fn target_host_port(&self, payload: &BypassPayload) -> (String, u16) {
        // A payload `Host` header overrides the authority used for routing
        // only in terms of the wire bytes (handled in `build_request`); the
        // TCP/TLS authority still comes from `scheme://host`.
        match payload.host.rsplit_once(':') {
            Some((h, p)) if p.chars().all(|c| c.is_ascii_digit()) => {
                (h.to_string(), p.parse().unwrap_or(default_port(&payload.scheme)))
            }
            _ => (payload.host.clone(), default_port(&payload.scheme)),
        }
    }

    async fn connect(
        &self,
        payload: &BypassPayload,
        dial_timeout: Duration,
        proxy_url: Option<&str>,
    ) -> Result<Conn, DoRequestError> {
        let (host, port) = self.target_host_port(payload).await;
        let tcp = match proxy_url {
            Some(proxy) => self
                .dialer
                .proxy_dial(proxy, &host, port, dial_timeout)
                .await
                .map_err(DoRequestError::Dial)?,
            None => self
                .dialer
                .dial(&host, port, dial_timeout)
                .await
                .map_err(DoRequestError::Dial)?,
        };

        if payload.scheme == "https" {
            let server_name = ServerName::try_from(host.as_str())
                .map_err(|_| DoRequestError::Other("invalid SNI host".to_string()))?;
            let tls = timeout(dial_timeout, self.tls_connector.connect(server_name, tcp))
                .await
                .map_err(|_| DoRequestError::Timeout)?
                .map_err(|e| DoRequestError::Other(format!("tls handshake failed: {e}")))?;
            Ok(Conn::Tls(Box::new(tls)))
        } else {
            Ok(Conn::Plain(tcp))
        }
    }

    /// Executes `payload`: applies request/throttle delays, builds and
    /// sends the request, retries retryable failures up to the configured
    /// limit, and returns the elapsed time and parsed response on success.
    pub async fn do_request(
        &self,
        payload: &BypassPayload,
        error_sink: &dyn ErrorSink,
    ) -> Result<(u64, WireResponse), DoRequestError> {
        let options = self.options.read().await.clone();

        if !options.request_delay.is_zero() {
            tokio::time::sleep(options.request_delay).await;
        }

        if options.auto_throttle {
            let delay = self.throttler.current_throttle_delay();
            if delay > Duration::ZERO {
                tokio::time::sleep(delay).await;
            }
        }

        // Acquired from the freelist rather than allocated fresh; returned
        // before every exit path below.
        let mut scratch = self.write_pool.acquire();
        let mut last_err: Option<DoRequestError> = None;

        for attempt in 0..=options.max_retries {
            if attempt == 0 {
                build_request(&mut scratch, payload, &options);
            } else {
                tokio::time::sleep(options.retry_delay).await;
                apply_retry_marker(&mut scratch, payload, &options, attempt);
            }

            let per_attempt_timeout = if attempt > 0 {
                options.timeout + options.retry_delay
            } else {
                options.timeout
            };

            let start = Instant::now();
            let result = timeout(
                per_attempt_timeout,
                self.send_once(payload, &scratch, &options),
            )
            .await;

            let outcome: Result<WireResponse, DoRequestError> = match result {
                Ok(inner) => inner,
                Err(_) => Err(DoRequestError::Timeout),
            };

            match outcome {
                Ok(resp) => {
                    let elapsed_ms = start.elapsed().as_millis() as u64;
                    self.last_response_time_ms.store(elapsed_ms, Ordering::Relaxed);
                    self.consecutive_failures.store(0, Ordering::SeqCst);
                    if options.auto_throttle {
                        self.throttler.record_response(resp.status_code);
                    }
                    self.write_pool.release(scratch);
                    return Ok((elapsed_ms, resp));
                }
                Err(err) => {
                    if !err.is_retryable() {
                        self.write_pool.release(scratch);
                        return self.finalize_failure(err, payload, error_sink).await;
                    }
                    last_err = Some(err);
                }
            }
        }

        self.write_pool.release(scratch);
        let final_err = DoRequestError::MaxRetriesExceeded(
            options.max_retries,
            Box::new(last_err.unwrap_or(DoRequestError::Other("unknown".to_string()))),
        );
        self.finalize_failure(final_err, payload, error_sink).await
    }

    async fn finalize_failure(
        &self,
        err: DoRequestError,
        payload: &BypassPayload,
        error_sink: &dyn ErrorSink,
    ) -> Result<(u64, WireResponse), DoRequestError> {
        let options = self.options.read().await;
        let failures = self.consecutive_failures.fetch_add(1, Ordering::SeqCst) + 1;
        let ceiling = options.max_consecutive_failed_reqs;
        drop(options);

        let ctx = ErrorContext {
            host: &payload.host,
            bypass_module: &payload.bypass_module,
            source: "HTTPClient.DoRequest",
            debug_token: &payload.token,
        };
        let critical_signal = error_sink.handle_error(&err, ctx).await;

        if critical_signal || failures >= ceiling {
            self.disable_keep_alive().await;
            return Err(DoRequestError::MaxConsecutiveFailuresReached);
        }

        Err(err)
    }

    async fn disable_keep_alive(&self) {
        let mut options = self.options.write().await;
        options.disable_keep_alive = true;
    }

    /// Acquires the read-accumulation buffer from the freelist, runs the
    /// actual send/receive, and always returns it before propagating the
    /// result — every exit path below funnels through this one release.
    async fn send_once(
        &self,
        payload: &BypassPayload,
        request_bytes: &[u8],
        options: &HttpClientOptions,
    ) -> Result<WireResponse, DoRequestError> {
        let mut buf = self.read_pool.acquire();
        let result = self.send_once_inner(payload, request_bytes, options, &mut buf).await;
        self.read_pool.release(buf);
        result
    }

    async fn send_once_inner(
        &self,
        payload: &BypassPayload,
        request_bytes: &[u8],
        options: &HttpClientOptions,
        buf: &mut Vec<u8>,
    ) -> Result<WireResponse, DoRequestError> {
        let mut conn = self
            .connect(payload, options.dial_timeout, options.proxy_url.as_deref())
            .await?;

        conn.write_all(request_bytes)
            .await
            .map_err(|_| DoRequestError::ConnectionClosed)?;

        let mut chunk = vec![0u8; options.read_buffer_size];
        let mut connection_closed = false;

        loop {
            let n = conn.read(&mut chunk).await.map_err(|_| DoRequestError::Eof)?;
            if n == 0 {
                connection_closed = true;
                break;
            }
            buf.extend_from_slice(&chunk[..n]);

            if buf.len() > options.max_response_body {
                return Err(DoRequestError::BodyTooLarge);
            }

            if response_body_complete(&buf, options) {
                break;
            }
        }

        let resp = parse_wire_response(&buf, connection_closed)
            .ok_or(DoRequestError::MalformedStatusLine)?;

        if let Some(len) = resp.declared_content_length {
            if len as usize > options.max_response_body {
                return Err(DoRequestError::BodyTooLarge);
            }
        }

        debug!(host = %payload.host, status = resp.status_code, "response received");
        Ok(resp)
    }
}

fn default_port(scheme: &str) -> u16 {
    if scheme == "https" {
        443
    } else {
        80
    }
}

/// Returns true once we've read the full declared body (or reached the
/// bound needed for streaming-preview mode); if `Content-Length` is absent
/// we keep reading until the connection closes.
fn response_body_complete(buf: &[u8], options: &HttpClientOptions) -> bool {
    let Some(header_end) = buf.windows(4).position(|w| w == b"\r\n\r\n") else { return false };
    let body_start = header_end + 4;
    let header_text = String::from_utf8_lossy(&buf[..header_end]);

    let declared: Option<usize> = header_text.lines().find_map(|line| {
        let (name, value) = line.split_once(':')?;
        if name.trim().eq_ignore_ascii_case("content-length") {
            value.trim().parse().ok()
        } else {
            None
        }
    });

    match declared {
        Some(len) => {
            if options.stream_response_body {
                buf.len() - body_start >= len.min(options.response_body_preview_size)
            } else {
                buf.len() - body_start >= len
            }
        }
        None => false,
    }
}

enum Conn {
    Plain(TcpStream),
    Tls(Box<tokio_rustls::client::TlsStream<TcpStream>>),
}

impl tokio::io::AsyncRead for Conn {
    fn poll_read(
        self: std::pin::Pin<&mut Self>,
        cx: &mut std::task::Context<'_>,
        buf: &mut tokio::io::ReadBuf<'_>,
    ) -> std::task::Poll<std::io::Result<()>> {
        match self.get_mut() {
            Conn::Plain(s) => std::pin::Pin::new(s).poll_read(cx, buf),
            Conn::Tls(s) => std::pin::Pin::new(s.as_mut()).poll_read(cx, buf),
        }
    }
}

impl tokio::io::AsyncWrite for Conn {
    fn poll_write(
        self: std::pin::Pin<&mut Self>,
        cx: &mut std::task::Context<'_>,
        buf: &[u8],
    ) -> std::task::Poll<std::io::Result<usize>> {
        match self.get_mut() {
            Conn::Plain(s) => std::pin::Pin::new(s).poll_write(cx, buf),
            Conn::Tls(s) => std::pin::Pin::new(s.as_mut()).poll_write(cx, buf),
        }
    }

    fn poll_flush(
        self: std::pin::Pin<&mut Self>,
        cx: &mut std::task::Context<'_>,
    ) -> std::task::Poll<std::io::Result<()>> {
        match self.get_mut() {
            Conn::Plain(s) => std::pin::Pin::new(s).poll_flush(cx),
            Conn::Tls(s) => std::pin::Pin::new(s.as_mut()).poll_flush(cx),
        }
    }

    fn poll_shutdown(
        self: std::pin::Pin<&mut Self>,
        cx: &mut std::task::Context<'_>,
    ) -> std::task::Poll<std::io::Result<()>> {
        match self.get_mut() {
            Conn::Plain(s) => std::pin::Pin::new(s).poll_shutdown(cx),
            Conn::Tls(s) => std::pin::Pin::new(s.as_mut()).poll_shutdown(cx),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_port_matches_scheme() {
        assert_eq!(default_port("https"), 443);
        assert_eq!(default_port("http"), 80);
    }

    #[test]
    fn response_body_complete_waits_for_declared_length() {
        let opts = HttpClientOptions::default();
        let partial = b"HTTP/1.1 200 OK\r\nContent-Length: 10\r\n\r\nhel".to_vec();
        assert!(!response_body_complete(&partial, &opts));
        let full = b"HTTP/1.1 200 OK\r\nContent-Length: 3\r\n\r\nhel".to_vec();
        assert!(response_body_complete(&full, &opts));
    }
}
