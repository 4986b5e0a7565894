//! Typed error taxonomy for the raw-HTTP engine
//!
//! `anyhow` is used at the application edges (CLI, batch driver); internally,
//! the engine classifies failures with this `thiserror` enum so that
//! retry/cancellation logic can match on error *kind* rather than string
//! contents.

use thiserror::Error;

/// Errors produced while dialing or resolving a target host.
#[derive(Debug, Error)]
pub enum DialError {
    #[error("dns resolution failed for {host}: {source}")]
    Resolve {
        host: String,
        #[source]
        source: ResolverError,
    },
    #[error("all candidate addresses refused connection for {host}")]
    ConnectRefused { host: String },
    #[error("dial timed out after {0:?}")]
    Timeout(std::time::Duration),
    #[error("proxy dial failed: {0}")]
    ProxyDial(String),
    #[error(transparent)]
    Io(#[from] std::io::Error),
}

/// Errors from the resolver chain.
#[derive(Debug, Error, Clone)]
pub enum ResolverError {
    #[error("no strategy returned an address before the deadline")]
    AllStrategiesExhausted,
    #[error("no record found for {0}")]
    NoRecord(String),
    #[error("resolver deadline exceeded")]
    Timeout,
}

/// Errors surfaced by `HttpClient::do_request`.
#[derive(Debug, Error)]
pub enum DoRequestError {
    #[error("connection closed by peer")]
    ConnectionClosed,
    #[error("unexpected end of stream")]
    Eof,
    #[error("request timed out")]
    Timeout,
    #[error("response body exceeded the configured limit")]
    BodyTooLarge,
    #[error("malformed status line")]
    MalformedStatusLine,
    #[error(transparent)]
    Dial(#[from] DialError),
    #[error("exceeded max retries ({0}); last error: {1}")]
    MaxRetriesExceeded(u32, Box<DoRequestError>),
    #[error("consecutive failure ceiling reached")]
    MaxConsecutiveFailuresReached,
    #[error("non-retryable transport error: {0}")]
    Other(String),
}

impl DoRequestError {
    /// Which errors the client loop retries rather than surfacing immediately.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            DoRequestError::Eof
                | DoRequestError::ConnectionClosed
                | DoRequestError::Timeout
                | DoRequestError::BodyTooLarge
                | DoRequestError::MalformedStatusLine
        )
    }
}

/// Errors from the debug-token codec.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum TokenError {
    #[error("unsupported token version: {0}")]
    BadVersion(u8),
    #[error("unknown field tag: {0}")]
    UnknownTag(u8),
    #[error("token truncated")]
    Truncated,
    #[error("bad token sentinel")]
    BadSentinel,
    #[error("base64 decode failed: {0}")]
    Base64(String),
    #[error("compressed payload decode failed: {0}")]
    Decompress(String),
}

/// Error surfaced by recon probing.
#[derive(Debug, Error)]
pub enum ReconError {
    #[error(transparent)]
    Resolve(#[from] ResolverError),
    #[error("invalid host/port input: {0}")]
    InvalidInput(String),
}
