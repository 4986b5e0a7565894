//! Process-wide shared TCP dialer with DNS caching and dual-stack dialing
//!
//! Modeled as a lazily-initialized singleton, behind a one-shot initializer
//! whose handle is passed explicitly rather than reached for globally.
//! Callers obtain the handle via [`Dialer::shared`] once at startup and then
//! pass `Arc<Dialer>` around explicitly — nothing in `http_client.rs` or
//! `recon.rs` reaches for the global directly.

use std::net::IpAddr;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use dashmap::DashMap;
use once_cell::sync::OnceCell;
use tokio::net::TcpStream;
use tokio::time::timeout;
use tracing::debug;

use crate::error::{DialError, ResolverError};
use crate::resolver::{ChainResolver, Resolver};

static SHARED: OnceCell<Arc<Dialer>> = OnceCell::new();

struct CacheEntry {
    ips: Vec<IpAddr>,
    inserted_at: Instant,
    next_index: AtomicUsize,
}

/// Process-wide TCP dialer: dual-stack dialing, a connection concurrency
/// cap, and a pluggable resolver chain.
pub struct Dialer {
    resolver: Arc<dyn Resolver>,
    dns_cache: DashMap<String, CacheEntry>,
    dns_cache_ttl: Duration,
    concurrency: Arc<tokio::sync::Semaphore>,
}

impl Dialer {
    pub fn new(resolver: Arc<dyn Resolver>, concurrency_cap: usize, dns_cache_ttl: Duration) -> Self {
        Self {
            resolver,
            dns_cache: DashMap::new(),
            dns_cache_ttl,
            concurrency: Arc::new(tokio::sync::Semaphore::new(concurrency_cap)),
        }
    }

    /// Returns the process-wide singleton, initializing it on first call.
    pub fn shared() -> Arc<Dialer> {
        SHARED
            .get_or_init(|| {
                let resolver = ChainResolver::new().expect("failed to initialize resolver chain");
                Arc::new(Dialer::new(Arc::new(resolver), 4096, Duration::from_secs(120 * 60)))
            })
            .clone()
    }

    /// Resolves `host` to an ordered, deduplicated set of addresses, using
    /// the cache when fresh.
    pub async fn resolve(&self, host: &str, deadline: Instant) -> Result<Vec<IpAddr>, ResolverError> {
        if let Ok(ip) = host.parse::<IpAddr>() {
            return Ok(vec![ip]);
        }

        if let Some(entry) = self.dns_cache.get(host) {
            if entry.inserted_at.elapsed() < self.dns_cache_ttl {
                return Ok(entry.ips.clone());
            }
        }

        let ips = self.resolver.lookup_ip(host, deadline).await?;
        self.dns_cache.insert(
            host.to_string(),
            CacheEntry {
                ips: ips.clone(),
                inserted_at: Instant::now(),
                next_index: AtomicUsize::new(0),
            },
        );
        Ok(ips)
    }

    pub async fn lookup_cname(&self, host: &str, deadline: Instant) -> Result<String, ResolverError> {
        self.resolver.lookup_cname(host, deadline).await
    }

    /// Dials `host:port`, preferring the first-resolved address family and
    /// round-robining across cached IPs of that family on subsequent calls.
    pub async fn dial(&self, host: &str, port: u16, dial_timeout: Duration) -> Result<TcpStream, DialError> {
        let deadline = Instant::now() + dial_timeout;
        let ips = self
            .resolve(host, deadline)
            .await
            .map_err(|e| DialError::Resolve { host: host.to_string(), source: e })?;

        if ips.is_empty() {
            return Err(DialError::ConnectRefused { host: host.to_string() });
        }

        let ordered = self.order_dual_stack(host, &ips);

        let mut last_err = None;
        for ip in ordered {
            let addr = std::net::SocketAddr::new(ip, port);
            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                return Err(DialError::Timeout(dial_timeout));
            }
            let _permit = self.concurrency.clone().acquire_owned().await;
            match timeout(remaining, TcpStream::connect(addr)).await {
                Ok(Ok(stream)) => {
                    debug!(host, %addr, "dial succeeded");
                    return Ok(stream);
                }
                Ok(Err(e)) => last_err = Some(DialError::Io(e)),
                Err(_) => return Err(DialError::Timeout(dial_timeout)),
            }
        }

        Err(last_err.unwrap_or(DialError::ConnectRefused { host: host.to_string() }))
    }

    /// Dials through an HTTP forward proxy via `CONNECT`, per the
    /// `proxy_url` configuration knob.
    pub async fn proxy_dial(
        &self,
        proxy_addr: &str,
        target_host: &str,
        target_port: u16,
        dial_timeout: Duration,
    ) -> Result<TcpStream, DialError> {
        let (proxy_host, proxy_port) = split_host_port(proxy_addr);
        let mut stream = self.dial(&proxy_host, proxy_port, dial_timeout).await?;

        use tokio::io::{AsyncReadExt, AsyncWriteExt};
        let connect_req = format!(
            "CONNECT {target_host}:{target_port} HTTP/1.1\r\nHost: {target_host}:{target_port}\r\n\r\n"
        );
        stream
            .write_all(connect_req.as_bytes())
            .await
            .map_err(DialError::Io)?;

        let mut buf = [0u8; 512];
        let n = stream.read(&mut buf).await.map_err(DialError::Io)?;
        let response = String::from_utf8_lossy(&buf[..n]);
        if !response.starts_with("HTTP/1.1 200") && !response.starts_with("HTTP/1.0 200") {
            return Err(DialError::ProxyDial(format!(
                "proxy refused CONNECT: {}",
                response.lines().next().unwrap_or_default()
            )));
        }
        Ok(stream)
    }

    /// Prefer the family of the first-resolved IP, then round-robin inside
    /// each family on repeat calls.
    fn order_dual_stack(&self, host: &str, ips: &[IpAddr]) -> Vec<IpAddr> {
        if ips.len() <= 1 {
            return ips.to_vec();
        }

        let preferred_is_v4 = ips[0].is_ipv4();
        let (mut preferred, mut other): (Vec<IpAddr>, Vec<IpAddr>) =
            ips.iter().copied().partition(|ip| ip.is_ipv4() == preferred_is_v4);

        if let Some(entry) = self.dns_cache.get(host) {
            if preferred.len() > 1 {
                let idx = entry.next_index.fetch_add(1, Ordering::Relaxed) % preferred.len();
                preferred.rotate_left(idx);
            }
        }

        preferred.append(&mut other);
        preferred
    }
}

fn split_host_port(addr: &str) -> (String, u16) {
    match addr.rsplit_once(':') {
        Some((host, port)) => (host.to_string(), port.parse().unwrap_or(80)),
        None => (addr.to_string(), 80),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn split_host_port_parses_port() {
        assert_eq!(split_host_port("proxy.local:8080"), ("proxy.local".to_string(), 8080));
        assert_eq!(split_host_port("proxy.local"), ("proxy.local".to_string(), 80));
    }

    #[tokio::test]
    async fn resolve_literal_ip_short_circuits() {
        let resolver = Arc::new(ChainResolver::new().unwrap());
        let dialer = Dialer::new(resolver, 8, Duration::from_secs(60));
        let ips = dialer
            .resolve("127.0.0.1", Instant::now() + Duration::from_millis(50))
            .await
            .unwrap();
        assert_eq!(ips, vec!["127.0.0.1".parse::<IpAddr>().unwrap()]);
    }
}
