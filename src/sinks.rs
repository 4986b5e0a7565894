//! Output sinks: where findings go once a worker has a processed response
//!
//! Streams results out as they're produced rather than buffering the whole
//! run in memory, generalized behind a trait so the CLI can point results
//! at a file, a JSONL writer, or stdout interchangeably.

use std::path::PathBuf;
use std::sync::Arc;

use serde::Serialize;
use tokio::fs::OpenOptions;
use tokio::io::{self, AsyncWriteExt};
use tokio::sync::Mutex;
use tracing::error;

use crate::response::RawHTTPResponseDetails;
use crate::sanitize::{sanitize_non_printable, sanitize_text};

/// A single finding, the JSON shape written to the findings sink. Carries a
/// monotonically increasing `id` stamped by whoever drains the worker
/// pool's output channel, so findings from one run can be referenced
/// unambiguously regardless of the order a sink happens to write them in.
#[derive(Debug, Clone, Serialize)]
pub struct Finding {
    pub id: u64,
    pub url: String,
    pub bypass_module: String,
    pub status_code: u16,
    pub response_headers: String,
    pub body_preview: String,
    pub content_length: Option<u64>,
    pub response_bytes: u64,
    pub content_type: String,
    pub server_info: String,
    pub redirect_url: Option<String>,
    pub title: String,
    pub response_time_ms: u64,
    pub curl_reproducer: String,
    pub debug_token: String,
}

impl Finding {
    /// Builds a `Finding` from a completed response, stamping it with `id`.
    /// Headers and the body preview are sanitized here, at the boundary
    /// where a response stops being an internal pooled buffer and becomes
    /// an externally-visible record.
    pub fn new(id: u64, details: &RawHTTPResponseDetails) -> Self {
        Self {
            id,
            url: details.url.clone(),
            bypass_module: details.bypass_module.clone(),
            status_code: details.status_code,
            response_headers: sanitize_text(&details.response_headers),
            body_preview: sanitize_non_printable(&details.body_preview),
            content_length: details.content_length,
            response_bytes: details.response_bytes,
            content_type: details.content_type.clone(),
            server_info: details.server_info.clone(),
            redirect_url: details.redirect_url.clone(),
            title: details.title.clone(),
            response_time_ms: details.response_time_ms,
            curl_reproducer: details.curl_reproducer.clone(),
            debug_token: details.debug_token.clone(),
        }
    }
}

/// Where successful scan results are appended.
#[async_trait::async_trait]
pub trait FindingsSink: Send + Sync {
    async fn append(&self, finding: Finding);
}

/// Streams each finding as one JSON line to stdout, unbuffered, so a
/// long-running scan is observable as it progresses.
pub struct StdoutFindingsSink;

#[async_trait::async_trait]
impl FindingsSink for StdoutFindingsSink {
    async fn append(&self, finding: Finding) {
        match serde_json::to_string(&finding) {
            Ok(line) => println!("{line}"),
            Err(e) => error!(error = %e, "failed to serialize finding"),
        }
    }
}

/// Appends each finding as one JSON line to a file, an append-only output
/// rather than paginated batch files.
pub struct FileFindingsSink {
    file: Mutex<tokio::fs::File>,
}

impl FileFindingsSink {
    pub async fn open(path: impl Into<PathBuf>) -> io::Result<Self> {
        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(path.into())
            .await?;
        Ok(Self { file: Mutex::new(file) })
    }
}

#[async_trait::async_trait]
impl FindingsSink for FileFindingsSink {
    async fn append(&self, finding: Finding) {
        let Ok(mut line) = serde_json::to_string(&finding) else {
            error!("failed to serialize finding");
            return;
        };
        line.push('\n');
        let mut file = self.file.lock().await;
        if let Err(e) = file.write_all(line.as_bytes()).await {
            error!(error = %e, "failed to write finding to sink file");
        }
    }
}

/// Fans a single finding out to more than one sink (used when the CLI is
/// asked to both print to stdout and persist to a file).
pub struct TeeFindingsSink {
    sinks: Vec<Arc<dyn FindingsSink>>,
}

impl TeeFindingsSink {
    pub fn new(sinks: Vec<Arc<dyn FindingsSink>>) -> Self {
        Self { sinks }
    }
}

#[async_trait::async_trait]
impl FindingsSink for TeeFindingsSink {
    async fn append(&self, finding: Finding) {
        for sink in &self.sinks {
            sink.append(finding.clone()).await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample() -> RawHTTPResponseDetails {
        let mut d = RawHTTPResponseDetails::default();
        d.url = "https://example.com/admin".to_string();
        d.bypass_module = "mid_paths".to_string();
        d.status_code = 200;
        d
    }

    #[test]
    fn finding_conversion_copies_scalar_fields() {
        let details = sample();
        let finding = Finding::new(7, &details);
        assert_eq!(finding.id, 7);
        assert_eq!(finding.url, details.url);
        assert_eq!(finding.status_code, 200);
    }

    #[tokio::test]
    async fn file_sink_appends_one_line_per_finding() {
        let dir = std::env::temp_dir().join(format!("gb403-sink-test-{}", std::process::id()));
        let sink = FileFindingsSink::open(&dir).await.unwrap();
        sink.append(Finding::new(0, &sample())).await;
        sink.append(Finding::new(1, &sample())).await;
        let contents = tokio::fs::read_to_string(&dir).await.unwrap();
        assert_eq!(contents.lines().count(), 2);
        let _ = tokio::fs::remove_file(&dir).await;
    }
}
