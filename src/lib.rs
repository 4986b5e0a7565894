// gb403-engine: concurrent raw-HTTP authorization-bypass scanning engine
// Exposes the crate's core modules as a library so the CLI binary (and
// integration tests) can drive them directly.

pub mod builder;
pub mod buffers;
pub mod cli;
pub mod config;
pub mod dialer;
pub mod error;
pub mod http_client;
pub mod payload;
pub mod pool;
pub mod recon;
pub mod recon_cache;
pub mod resolver;
pub mod response;
pub mod sanitize;
pub mod sinks;
pub mod throttle;
pub mod token;
