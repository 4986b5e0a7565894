use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::Parser;
use tokio::runtime::Builder;
use tracing::info;

use gb403_engine::cli::{Cli, Commands};
use gb403_engine::config::{HttpClientOptions, PoolConfig, ThrottleConfig};
use gb403_engine::dialer::Dialer;
use gb403_engine::http_client::{HttpClient, TracingErrorSink};
use gb403_engine::payload::{http_headers_url, mid_paths, BypassPayload};
use gb403_engine::pool::WorkerPool;
use gb403_engine::response::{process_response, RawHTTPResponseDetails};
use gb403_engine::sanitize::sanitize_text;
use gb403_engine::sinks::{FileFindingsSink, FindingsSink, StdoutFindingsSink, TeeFindingsSink};
use gb403_engine::throttle::Throttler;
use gb403_engine::token;

fn main() -> Result<()> {
    let num_cpus = std::thread::available_parallelism().map(|n| n.get()).unwrap_or(4);
    let worker_threads = std::cmp::min(num_cpus + 2, 16);

    let runtime = Builder::new_multi_thread()
        .worker_threads(worker_threads)
        .enable_all()
        .build()
        .expect("failed to build tokio runtime");

    runtime.block_on(async_main())
}

fn generate_payloads(url: &str, modules: &[String]) -> Vec<BypassPayload> {
    let wanted: Vec<&str> = if modules.is_empty() {
        vec!["mid_paths", "http_headers_url"]
    } else {
        modules.iter().map(String::as_str).collect()
    };

    let mut payloads = Vec::new();
    for module in wanted {
        match module {
            "mid_paths" => payloads.extend(mid_paths(url)),
            "http_headers_url" => payloads.extend(http_headers_url(url)),
            other => tracing::warn!(module = other, "unknown bypass module, skipping"),
        }
    }
    payloads
}

async fn async_main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    let cli = Cli::parse();

    match &cli.command {
        Commands::Scan {
            url,
            modules,
            output_file,
            request_delay_ms,
            no_auto_throttle,
            max_consecutive_failures,
        } => {
            info!(url, modules = ?modules, "starting scan");

            let options = HttpClientOptions {
                timeout: Duration::from_millis(cli.timeout_ms),
                request_delay: Duration::from_millis(*request_delay_ms),
                auto_throttle: !no_auto_throttle,
                max_consecutive_failed_reqs: *max_consecutive_failures,
                debug_tokens: cli.debug_tokens,
                ..HttpClientOptions::default()
            }
            .bumped_for_concurrency(cli.concurrent_requests);

            let dialer = Dialer::shared();
            let throttler = Arc::new(Throttler::new(ThrottleConfig::default()));
            let client = Arc::new(HttpClient::new(dialer, options, throttler));

            let pool_config = PoolConfig {
                max_concurrent: cli.concurrent_requests,
                channel_capacity: cli.concurrent_requests * 4,
            };
            let pool = WorkerPool::new(client, pool_config);

            let findings_sink: Arc<dyn FindingsSink> = match output_file {
                Some(path) => {
                    let file_sink = Arc::new(
                        FileFindingsSink::open(path)
                            .await
                            .with_context(|| format!("opening output file {path:?}"))?,
                    );
                    Arc::new(TeeFindingsSink::new(vec![Arc::new(StdoutFindingsSink), file_sink]))
                }
                None => Arc::new(StdoutFindingsSink),
            };

            let payloads = generate_payloads(url, modules);
            info!(count = payloads.len(), "generated bypass payloads");

            pool.run(payloads, Arc::new(TracingErrorSink), findings_sink).await;

            let stats = pool.stats();
            info!(
                completed = stats.completed.load(std::sync::atomic::Ordering::Relaxed),
                failed = stats.failed.load(std::sync::atomic::Ordering::Relaxed),
                "scan finished"
            );
        }

        Commands::Resend { token: token_str } => {
            let payload = token::decode(token_str).context("decoding debug token")?;
            info!(host = %payload.host, raw_uri = %payload.raw_uri, "resending request");

            let options = HttpClientOptions::default();
            let dialer = Dialer::shared();
            let throttler = Arc::new(Throttler::new(ThrottleConfig::default()));
            let client = HttpClient::new(dialer, options.clone(), throttler);

            let (elapsed_ms, resp) = client
                .do_request(&payload, &TracingErrorSink)
                .await
                .context("resend request failed")?;

            let mut details = RawHTTPResponseDetails::default();
            process_response(&mut details, &resp, &payload, &options, elapsed_ms);
            println!("status: {}", details.status_code);
            println!("content-type: {}", sanitize_text(&details.content_type));
            println!("title: {}", sanitize_text(&details.title));
            println!("curl: {}", details.curl_reproducer);
        }

        Commands::InspectToken { token: token_str } => {
            let fields = token::inspect(token_str).context("decoding debug token")?;
            for (key, value) in fields {
                println!("{key}: {}", sanitize_text(&value));
            }
        }
    }

    Ok(())
}
