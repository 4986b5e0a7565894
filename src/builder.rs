//! Request Builder: byte-exact wire assembly from a `BypassPayload`
//!
//! Higher-level HTTP clients normalize request URIs and headers, which
//! defeats the "send these exact bytes" requirement a bypass payload needs,
//! so the builder writes directly into a `Vec<u8>` scratch buffer: assemble
//! wire bytes, hand them to a raw connection.

use crate::config::HttpClientOptions;
use crate::payload::BypassPayload;

/// Builds the request-line + headers + trailing CRLF for `payload`,
/// appending to `out` rather than allocating, so callers can reuse a pooled
/// buffer acquired from a pool.
pub fn build_request(out: &mut Vec<u8>, payload: &BypassPayload, options: &HttpClientOptions) {
    out.clear();

    out.extend_from_slice(payload.method.as_bytes());
    out.push(b' ');
    out.extend_from_slice(payload.raw_uri.as_bytes());
    out.extend_from_slice(b" HTTP/1.1\r\n");

    let mut wrote_host = false;
    let mut wrote_user_agent = false;
    let mut force_close = false;

    for (name, value) in &payload.headers {
        if name.eq_ignore_ascii_case("host") {
            wrote_host = true;
            force_close = true;
        }
        if name.eq_ignore_ascii_case("user-agent") {
            wrote_user_agent = true;
        }
        write_header(out, name, value);
    }

    if !wrote_host {
        write_header(out, "Host", &payload.host);
    }

    if !wrote_user_agent {
        write_header(out, "User-Agent", &options.user_agent);
    }

    for (name, value) in &options.custom_headers {
        write_header(out, name, value);
    }

    let connection_close = force_close
        || !payload.headers.is_empty()
        || !options.custom_headers.is_empty()
        || options.disable_keep_alive
        || options.proxy_url.is_some();

    if connection_close {
        write_header(out, "Connection", "close");
    }

    if options.debug_tokens {
        write_header(out, "X-GB403-Token", &payload.token);
    }

    out.extend_from_slice(b"\r\n");
}

/// Appends a retry marker to an already-built request: clears any
/// `Connection` header line, forces `Connection: close`, and appends
/// `X-Retry: N`. Operates on the byte buffer directly so the retried
/// request is otherwise byte-identical to the original.
pub fn apply_retry_marker(out: &mut Vec<u8>, payload: &BypassPayload, options: &HttpClientOptions, attempt: u32) {
    build_request(out, payload, options);

    // Strip the line we just wrote if it isn't already "Connection: close"
    // (build_request may have omitted it when the payload carried no
    // headers and keep-alive was otherwise allowed).
    if !contains_header_line(out, "connection", "close") {
        insert_before_trailing_crlf(out, b"Connection: close\r\n");
    }
    insert_before_trailing_crlf(out, format!("X-Retry: {attempt}\r\n").as_bytes());
}

fn write_header(out: &mut Vec<u8>, name: &str, value: &str) {
    out.extend_from_slice(name.as_bytes());
    out.extend_from_slice(b": ");
    out.extend_from_slice(value.as_bytes());
    out.extend_from_slice(b"\r\n");
}

fn contains_header_line(buf: &[u8], name_lower: &str, value_lower: &str) -> bool {
    let text = String::from_utf8_lossy(buf);
    text.lines().any(|line| {
        if let Some((n, v)) = line.split_once(':') {
            n.trim().eq_ignore_ascii_case(name_lower) && v.trim().eq_ignore_ascii_case(value_lower)
        } else {
            false
        }
    })
}

fn insert_before_trailing_crlf(out: &mut Vec<u8>, header_line: &[u8]) {
    // `out` ends with "\r\n\r\n" (headers terminator); insert just before
    // the final blank line.
    let insert_at = out.len().saturating_sub(2);
    out.splice(insert_at..insert_at, header_line.iter().copied());
}

/// Produces a shell-escaped single-line curl reproducer for a payload.
pub fn curl_reproducer(payload: &BypassPayload, options: &HttpClientOptions) -> String {
    let mut cmd = vec!["curl".to_string(), "-sk".to_string(), "--path-as-is".to_string()];

    if payload.method != "GET" {
        cmd.push("-X".to_string());
        cmd.push(payload.method.clone());
    }

    for (name, value) in &payload.headers {
        cmd.push("-H".to_string());
        cmd.push(shell_escape::escape(format!("{name}: {value}").into()).into_owned());
    }
    for (name, value) in &options.custom_headers {
        cmd.push("-H".to_string());
        cmd.push(shell_escape::escape(format!("{name}: {value}").into()).into_owned());
    }

    let url = format!("{}://{}{}", payload.scheme, payload.host, payload.raw_uri);
    cmd.push(shell_escape::escape(url.into()).into_owned());

    cmd.join(" ")
}

#[cfg(test)]
mod tests {
    use super::*;

    fn opts() -> HttpClientOptions {
        HttpClientOptions::default()
    }

    #[test]
    fn preserves_raw_uri_bytes_verbatim() {
        let payload = BypassPayload::new(
            "http://localhost/a/b",
            "GET",
            "http",
            "localhost",
            "/a/../b/;%2e/c",
            "mid_paths",
        );
        let mut out = Vec::new();
        build_request(&mut out, &payload, &opts());
        let text = String::from_utf8(out).unwrap();
        assert!(text.starts_with("GET /a/../b/;%2e/c HTTP/1.1\r\n"));
    }

    #[test]
    fn host_header_override_forces_close() {
        let payload = BypassPayload::new("http://x/", "GET", "http", "x", "/", "headers")
            .with_header("Host", "evil.com:1337");
        let mut out = Vec::new();
        build_request(&mut out, &payload, &opts());
        let text = String::from_utf8(out).unwrap();
        assert!(text.contains("Host: evil.com:1337\r\n"));
        assert!(text.contains("Connection: close\r\n"));
        // Only one Host header line should be present.
        assert_eq!(text.matches("Host:").count(), 1);
    }

    #[test]
    fn header_order_is_preserved() {
        let payload = BypassPayload::new("http://x/", "GET", "http", "x", "/", "headers")
            .with_header("X-First", "1")
            .with_header("X-Second", "2");
        let mut out = Vec::new();
        build_request(&mut out, &payload, &opts());
        let text = String::from_utf8(out).unwrap();
        let first_idx = text.find("X-First").unwrap();
        let second_idx = text.find("X-Second").unwrap();
        assert!(first_idx < second_idx);
    }

    #[test]
    fn no_content_type_without_body() {
        let payload = BypassPayload::new("http://x/", "GET", "http", "x", "/", "m");
        let mut out = Vec::new();
        build_request(&mut out, &payload, &opts());
        let text = String::from_utf8(out).unwrap();
        assert!(!text.to_lowercase().contains("content-type"));
    }

    #[test]
    fn retry_marker_appends_header_and_keeps_body_identical() {
        let payload = BypassPayload::new("http://x/", "GET", "http", "x", "/secret", "m");
        let mut original = Vec::new();
        build_request(&mut original, &payload, &opts());

        let mut retried = Vec::new();
        apply_retry_marker(&mut retried, &payload, &opts(), 1);

        let retried_text = String::from_utf8(retried).unwrap();
        assert!(retried_text.contains("X-Retry: 1\r\n"));
        assert!(retried_text.contains("Connection: close\r\n"));
        assert!(retried_text.starts_with("GET /secret HTTP/1.1\r\n"));
    }

    #[test]
    fn building_twice_is_byte_identical() {
        let payload = BypassPayload::new("http://x/", "GET", "http", "x", "/a", "m");
        let mut a = Vec::new();
        let mut b = Vec::new();
        build_request(&mut a, &payload, &opts());
        build_request(&mut b, &payload, &opts());
        assert_eq!(a, b);
    }
}
