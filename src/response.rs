//! Response Processor and the pooled `RawHTTPResponseDetails` entity
//!
//! The wire response is parsed permissively: case-insensitive header names
//! on reading, and a missing `Content-Length` tolerated via a
//! connection-close fallback, all under strict byte budgets. Shaped after
//! the common "read headers, then a bounded body window" pattern used by
//! hand-rolled HTTP clients that need raw access to the wire bytes.

use crate::builder::curl_reproducer;
use crate::config::HttpClientOptions;
use crate::payload::BypassPayload;

/// One parsed HTTP/1.1 response header line.
#[derive(Debug, Clone)]
pub struct RawHeader {
    pub name: String,
    pub value: String,
}

/// A parsed response split into a status line, headers (in receipt order),
/// and whatever body bytes were read up to the preview/stream bound.
#[derive(Debug, Clone)]
pub struct WireResponse {
    pub proto: String,
    pub status_code: u16,
    pub reason: String,
    pub headers: Vec<RawHeader>,
    pub body: Vec<u8>,
    /// `Some` only when the transport actually knows the full declared
    /// length; absent on connection-close-terminated bodies.
    pub declared_content_length: Option<u64>,
}

impl WireResponse {
    fn header(&self, name: &str) -> Option<&str> {
        self.headers
            .iter()
            .find(|h| h.name.eq_ignore_ascii_case(name))
            .map(|h| h.value.as_str())
    }
}

/// Pool-allocated result entity. Instances are acquired from a reuse pool
/// per response and released back after the consumer extracts scalar
/// values.
#[derive(Debug, Clone, Default)]
pub struct RawHTTPResponseDetails {
    pub url: String,
    pub bypass_module: String,
    pub status_code: u16,
    pub response_headers: String,
    pub body_preview: Vec<u8>,
    pub content_type: String,
    pub content_length: Option<u64>,
    pub response_bytes: u64,
    pub server_info: String,
    pub redirect_url: Option<String>,
    pub title: String,
    pub response_time_ms: u64,
    pub curl_reproducer: String,
    pub debug_token: String,
}

impl RawHTTPResponseDetails {
    /// Resets every field to empty/default so the instance can be returned
    /// to a freelist pool and reused without leaking data across requests.
    pub fn reset(&mut self) {
        *self = Self::default();
    }
}

/// Freelist of [`RawHTTPResponseDetails`] instances, avoiding an allocation
/// per completed response. The worker pool acquires one per
/// completed job, fills it via [`process_response`], hands it to the
/// consumer (which converts it into a `Finding`), then releases it here.
pub struct DetailsPool {
    free: std::sync::Mutex<Vec<RawHTTPResponseDetails>>,
}

impl DetailsPool {
    pub fn new() -> Self {
        Self { free: std::sync::Mutex::new(Vec::new()) }
    }

    pub fn acquire(&self) -> RawHTTPResponseDetails {
        self.free.lock().unwrap().pop().unwrap_or_default()
    }

    pub fn release(&self, mut details: RawHTTPResponseDetails) {
        details.reset();
        self.free.lock().unwrap().push(details);
    }
}

impl Default for DetailsPool {
    fn default() -> Self {
        Self::new()
    }
}

fn is_redirect(status: u16) -> bool {
    (300..400).contains(&status)
}

/// Extracts `<title>...</title>` from an HTML preview: only scanned when
/// `content_type` contains the ASCII substring `html`, case-sensitive tag
/// matching, trimmed interior slice.
fn extract_title(content_type: &str, preview: &[u8]) -> String {
    if !content_type.to_ascii_lowercase().contains("html") {
        return String::new();
    }
    let text = String::from_utf8_lossy(preview);
    let Some(open) = text.find("<title>") else { return String::new() };
    let after_open = open + "<title>".len();
    let Some(close_rel) = text[after_open..].find("</title>") else { return String::new() };
    text[after_open..after_open + close_rel].trim().to_string()
}

/// Builds the canonical response-headers block:
/// `<proto> <status> <reason>\r\n` then each header in receipt order,
/// terminated with a blank line.
fn canonical_headers_block(resp: &WireResponse) -> String {
    let mut out = format!("{} {} {}\r\n", resp.proto, resp.status_code, resp.reason);
    for h in &resp.headers {
        out.push_str(&h.name);
        out.push_str(": ");
        out.push_str(&h.value);
        out.push_str("\r\n");
    }
    out.push_str("\r\n");
    out
}

/// Processes a parsed wire response into `RawHTTPResponseDetails` under the
/// bounds configured in `options`.
pub fn process_response(
    out: &mut RawHTTPResponseDetails,
    resp: &WireResponse,
    payload: &BypassPayload,
    options: &HttpClientOptions,
    response_time_ms: u64,
) {
    out.reset();
    out.url = format!("{}://{}{}", payload.scheme, payload.host, payload.raw_uri);
    out.bypass_module = payload.bypass_module.clone();
    out.status_code = resp.status_code;
    out.response_headers = canonical_headers_block(resp);
    out.content_type = resp.header("content-type").unwrap_or_default().to_string();
    out.server_info = resp.header("server").unwrap_or_default().to_string();
    out.content_length = resp.declared_content_length;
    out.response_time_ms = response_time_ms;
    out.curl_reproducer = curl_reproducer(payload, options);
    out.debug_token = payload.token.clone();

    out.redirect_url = if is_redirect(resp.status_code) {
        resp.header("location").map(|s| s.to_string())
    } else {
        None
    };

    let preview_cap = options.response_body_preview_size;
    out.body_preview = resp.body[..resp.body.len().min(preview_cap)].to_vec();

    out.title = extract_title(&out.content_type, &out.body_preview);

    out.response_bytes = if options.stream_response_body {
        // Streaming mode derives this from the declared Content-Length
        // rather than actually-observed bytes; `body_preview.len()` is the
        // observed-bytes fallback when no length was declared.
        resp.declared_content_length.unwrap_or(out.body_preview.len() as u64)
    } else if resp.body.len() <= preview_cap {
        resp.body.len() as u64
    } else {
        resp.declared_content_length.unwrap_or(resp.body.len() as u64)
    };
}

/// Parses a raw HTTP/1.1 response out of `buf`, permissively: tolerates
/// case-insensitive header names and a missing `Content-Length` (body
/// terminated by connection close, signaled by `connection_closed`).
pub fn parse_wire_response(buf: &[u8], connection_closed: bool) -> Option<WireResponse> {
    let header_end = find_header_terminator(buf)?;
    let header_block = std::str::from_utf8(&buf[..header_end]).ok()?;
    let mut lines = header_block.split("\r\n");
    let status_line = lines.next()?.trim_start();

    let mut parts = status_line.splitn(3, ' ');
    let proto = parts.next()?.to_string();
    let status_code: u16 = parts.next()?.parse().ok()?;
    let reason = parts.next().unwrap_or("").to_string();

    let mut headers = Vec::new();
    for line in lines {
        if line.is_empty() {
            continue;
        }
        if let Some((name, value)) = line.split_once(':') {
            headers.push(RawHeader {
                name: name.trim().to_string(),
                value: value.trim().to_string(),
            });
        }
    }

    let declared_content_length = headers
        .iter()
        .find(|h| h.name.eq_ignore_ascii_case("content-length"))
        .and_then(|h| h.value.parse::<u64>().ok());

    let body_start = header_end + 4; // past the terminating "\r\n\r\n"
    let body = buf.get(body_start..).unwrap_or_default().to_vec();

    let declared_content_length = declared_content_length.or(if connection_closed {
        Some(body.len() as u64)
    } else {
        None
    });

    Some(WireResponse {
        proto,
        status_code,
        reason,
        headers,
        body,
        declared_content_length,
    })
}

fn find_header_terminator(buf: &[u8]) -> Option<usize> {
    buf.windows(4).position(|w| w == b"\r\n\r\n")
}
