//! Command-line interface for the `gb403` raw-HTTP bypass scanner
//!
//! `scan` runs one or more bypass modules against a target URL with
//! configurable concurrency and output routing; `resend` replays a single
//! previously-issued request from its debug token, for reproducing one
//! finding in isolation.

use clap::{Parser, Subcommand};
use std::path::PathBuf;

#[derive(Parser)]
#[command(
    name = "gb403",
    about = "Concurrent raw-HTTP authorization-bypass scanning engine",
    version
)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Commands,

    /// Number of in-flight requests allowed at once
    #[arg(short = 'c', long, default_value = "40")]
    pub concurrent_requests: usize,

    /// Per-request timeout in milliseconds
    #[arg(short = 't', long, default_value = "20000")]
    pub timeout_ms: u64,

    /// Attach an `X-GB403-Token` debug token to every outgoing request
    #[arg(long)]
    pub debug_tokens: bool,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Scan a target URL with one or more bypass modules
    Scan {
        /// Target URL, e.g. https://example.com/admin
        url: String,

        /// Bypass modules to run (repeatable); defaults to all built in
        #[arg(short, long = "module")]
        modules: Vec<String>,

        /// Write findings to this file (JSONL), in addition to stdout
        #[arg(short, long)]
        output_file: Option<PathBuf>,

        /// Fixed delay between requests from the same client, in milliseconds
        #[arg(long, default_value = "0")]
        request_delay_ms: u64,

        /// Disable adaptive throttling on 429/503/507 responses
        #[arg(long)]
        no_auto_throttle: bool,

        /// Abort the run after this many consecutive request failures
        #[arg(long, default_value = "15")]
        max_consecutive_failures: u32,
    },
    /// Decode a debug token and replay its request in isolation
    Resend {
        /// Debug token previously printed in a finding's `debug_token` field
        token: String,
    },
    /// Decode a debug token and print its fields without replaying it
    InspectToken {
        token: String,
    },
}
