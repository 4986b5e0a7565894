//! Configuration knobs for the HTTP client, throttler, and worker pool
//!
//! Defaults cover timeouts, retry counts, and buffer sizes for a reasonably
//! conservative default scan. `retry.rs` keeps a similar `RetryConfig` with a
//! hand-written `Default` impl; this module follows the same shape for every
//! configuration struct the engine needs.

use std::collections::HashSet;
use std::time::Duration;

/// Options read by `HttpClient` on every request; mutated only on retry
/// (to flip keep-alive off after a consecutive-failure ceiling is hit).
#[derive(Debug, Clone)]
pub struct HttpClientOptions {
    pub timeout: Duration,
    pub dial_timeout: Duration,
    pub max_conns_per_host: usize,
    pub max_idle_conn_duration: Duration,
    pub max_conn_wait_timeout: Duration,
    pub max_response_body: usize,
    pub read_buffer_size: usize,
    pub write_buffer_size: usize,
    pub response_body_preview_size: usize,
    pub stream_response_body: bool,
    pub max_retries: u32,
    pub retry_delay: Duration,
    pub max_consecutive_failed_reqs: u32,
    pub proxy_url: Option<String>,
    pub request_delay: Duration,
    pub auto_throttle: bool,
    pub throttle_on_status_codes: HashSet<u16>,
    pub custom_headers: Vec<(String, String)>,
    pub bypass_module_id: String,
    pub disable_keep_alive: bool,
    pub user_agent: String,
    pub debug_tokens: bool,
}

impl Default for HttpClientOptions {
    fn default() -> Self {
        Self {
            timeout: Duration::from_millis(20_000),
            dial_timeout: Duration::from_millis(5_000),
            max_conns_per_host: 128,
            max_idle_conn_duration: Duration::from_secs(60),
            max_conn_wait_timeout: Duration::from_secs(1),
            max_response_body: 8192,
            read_buffer_size: 12_288,
            write_buffer_size: 12_288,
            response_body_preview_size: 2048,
            stream_response_body: true,
            max_retries: 2,
            retry_delay: Duration::from_millis(1_000),
            max_consecutive_failed_reqs: 15,
            proxy_url: None,
            request_delay: Duration::ZERO,
            auto_throttle: true,
            throttle_on_status_codes: [429u16, 503, 507].into_iter().collect(),
            custom_headers: Vec::new(),
            bypass_module_id: String::new(),
            disable_keep_alive: false,
            user_agent: "gb403-engine/0.1".to_string(),
            debug_tokens: false,
        }
    }
}

impl HttpClientOptions {
    /// `max_conns_per_host` auto-bump rule: if it's too low for the
    /// configured worker concurrency, bump it to `1.5x` the worker count.
    pub fn bumped_for_concurrency(mut self, max_concurrent: usize) -> Self {
        let floor = max_concurrent + max_concurrent / 2;
        if self.max_conns_per_host < floor {
            self.max_conns_per_host = floor;
        }
        self
    }
}

/// Backoff parameters consumed by the throttler.
#[derive(Debug, Clone)]
pub struct ThrottleConfig {
    pub base_delay: Duration,
    pub max_delay: Duration,
    pub exponential_factor: f64,
    pub jitter_percent: u8,
    pub throttle_on_status_codes: HashSet<u16>,
}

impl Default for ThrottleConfig {
    fn default() -> Self {
        Self {
            base_delay: Duration::from_millis(1_000),
            max_delay: Duration::from_millis(30_000),
            exponential_factor: 2.0,
            jitter_percent: 20,
            throttle_on_status_codes: [429u16, 503, 507].into_iter().collect(),
        }
    }
}

/// Worker-pool level configuration.
#[derive(Debug, Clone)]
pub struct PoolConfig {
    pub max_concurrent: usize,
    pub channel_capacity: usize,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            max_concurrent: 40,
            channel_capacity: 256,
        }
    }
}
