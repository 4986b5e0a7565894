//! Pluggable resolver capability and the three-strategy parallel chain
//!
//! The built-in resolver chains a system stub resolver, a set of explicit UDP
//! nameservers, and DNS-over-HTTPS, racing all three and returning as soon as
//! one yields an address. Grounded in the donor's `dns.rs`, which
//! wraps a single `trust_dns_resolver::TokioAsyncResolver` with retry and
//! rate limiting; this module keeps that resolver as one of three strategies
//! and adds DoH following the shape in
//! `other_examples/..dns_over_https.rs` (a plain `reqwest::Client` GET
//! against a `dns-json` endpoint).

use std::collections::HashSet;
use std::net::IpAddr;
use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use serde::Deserialize;
use tokio::time::timeout as tokio_timeout;
use trust_dns_resolver::config::{NameServerConfigGroup, ResolverConfig, ResolverOpts};
use trust_dns_resolver::TokioAsyncResolver;

use crate::error::ResolverError;

/// The capability set every resolution strategy and the aggregate chain
/// expose: a small trait, not an inheritance hierarchy.
#[async_trait]
pub trait Resolver: Send + Sync {
    async fn lookup_ip(&self, host: &str, deadline: Instant) -> Result<Vec<IpAddr>, ResolverError>;
    async fn lookup_cname(&self, host: &str, deadline: Instant) -> Result<String, ResolverError>;
}

/// System stub resolver strategy (A + AAAA via the OS configuration).
pub struct StubStrategy {
    resolver: TokioAsyncResolver,
}

impl StubStrategy {
    pub fn from_system_conf() -> anyhow::Result<Self> {
        let resolver = TokioAsyncResolver::tokio_from_system_conf()?;
        Ok(Self { resolver })
    }
}

#[async_trait]
impl Resolver for StubStrategy {
    async fn lookup_ip(&self, host: &str, deadline: Instant) -> Result<Vec<IpAddr>, ResolverError> {
        let remaining = deadline.saturating_duration_since(Instant::now());
        let fut = self.resolver.lookup_ip(host);
        match tokio_timeout(remaining, fut).await {
            Ok(Ok(lookup)) => Ok(lookup.iter().collect()),
            Ok(Err(_)) => Err(ResolverError::NoRecord(host.to_string())),
            Err(_) => Err(ResolverError::Timeout),
        }
    }

    async fn lookup_cname(&self, host: &str, deadline: Instant) -> Result<String, ResolverError> {
        let remaining = deadline.saturating_duration_since(Instant::now());
        let fut = self.resolver.lookup(host, trust_dns_resolver::proto::rr::RecordType::CNAME);
        match tokio_timeout(remaining, fut).await {
            Ok(Ok(lookup)) => lookup
                .iter()
                .next()
                .map(|r| r.to_string().trim_end_matches('.').to_string())
                .ok_or_else(|| ResolverError::NoRecord(host.to_string())),
            _ => Err(ResolverError::NoRecord(host.to_string())),
        }
    }
}

/// Upstream UDP nameserver strategy: a `trust-dns-resolver` instance pinned
/// at a fixed set of nameservers instead of the system configuration, with a
/// 2-second sub-deadline of its own regardless of the caller's overall
/// deadline.
pub struct UdpStrategy {
    resolver: TokioAsyncResolver,
}

impl UdpStrategy {
    pub fn new(servers: Vec<IpAddr>) -> anyhow::Result<Self> {
        let mut group = NameServerConfigGroup::new();
        for ip in servers {
            group.merge(NameServerConfigGroup::from_ips_clear(&[ip], 53, true));
        }
        let config = ResolverConfig::from_parts(None, vec![], group);
        let mut opts = ResolverOpts::default();
        opts.timeout = Duration::from_secs(2);
        opts.attempts = 1;
        let resolver = TokioAsyncResolver::tokio(config, opts);
        Ok(Self { resolver })
    }

    pub fn defaults() -> anyhow::Result<Self> {
        // At minimum one IPv4 and one IPv6 public resolver.
        Self::new(vec![
            "1.1.1.1".parse().unwrap(),
            "8.8.8.8".parse().unwrap(),
            "2606:4700:4700::1111".parse().unwrap(),
        ])
    }
}

#[async_trait]
impl Resolver for UdpStrategy {
    async fn lookup_ip(&self, host: &str, deadline: Instant) -> Result<Vec<IpAddr>, ResolverError> {
        let sub_deadline = deadline.min(Instant::now() + Duration::from_secs(2));
        let remaining = sub_deadline.saturating_duration_since(Instant::now());
        match tokio_timeout(remaining, self.resolver.lookup_ip(host)).await {
            Ok(Ok(lookup)) => Ok(lookup.iter().collect()),
            _ => Err(ResolverError::NoRecord(host.to_string())),
        }
    }

    async fn lookup_cname(&self, _host: &str, _deadline: Instant) -> Result<String, ResolverError> {
        Err(ResolverError::NoRecord(_host.to_string()))
    }
}

#[derive(Debug, Deserialize)]
struct DohAnswer {
    #[serde(rename = "type")]
    rtype: u16,
    data: String,
}

#[derive(Debug, Deserialize)]
struct DohResponse {
    #[serde(rename = "Answer", default)]
    answer: Vec<DohAnswer>,
}

/// DNS-over-HTTPS strategy with automatic fastest-provider selection and an
/// internal response cache. Grounded directly in
/// `other_examples/..dns_over_https.rs`'s `reqwest::Client` + `dns-json`
/// pattern.
pub struct DohStrategy {
    client: reqwest::Client,
    providers: Vec<String>,
    cache: dashmap::DashMap<(String, u16), (Vec<String>, Instant)>,
}

impl DohStrategy {
    pub fn new() -> Self {
        Self::with_providers(vec![
            "https://cloudflare-dns.com/dns-query".to_string(),
            "https://dns.google/resolve".to_string(),
            "https://dns.quad9.net:5053/dns-query".to_string(),
        ])
    }

    pub fn with_providers(providers: Vec<String>) -> Self {
        Self {
            client: reqwest::Client::builder()
                .user_agent("gb403-engine/0.1")
                .build()
                .expect("failed to build DoH client"),
            providers,
            cache: dashmap::DashMap::new(),
        }
    }

    async fn query_one(&self, endpoint: &str, host: &str, rtype: u16, deadline: Instant) -> Result<Vec<String>, ResolverError> {
        if let Some(entry) = self.cache.get(&(host.to_string(), rtype)) {
            let (values, cached_at) = entry.value();
            if cached_at.elapsed() < Duration::from_secs(60) {
                return Ok(values.clone());
            }
        }
        let url = format!("{endpoint}?name={host}&type={rtype}");
        let remaining = deadline.saturating_duration_since(Instant::now());
        let resp = tokio_timeout(
            remaining,
            self.client
                .get(&url)
                .header("accept", "application/dns-json")
                .send(),
        )
        .await
        .map_err(|_| ResolverError::Timeout)?
        .map_err(|_| ResolverError::NoRecord(host.to_string()))?;

        let parsed: DohResponse = resp
            .json()
            .await
            .map_err(|_| ResolverError::NoRecord(host.to_string()))?;

        let values: Vec<String> = parsed
            .answer
            .into_iter()
            .filter(|a| a.rtype == rtype)
            .map(|a| a.data)
            .collect();

        if values.is_empty() {
            return Err(ResolverError::NoRecord(host.to_string()));
        }

        self.cache
            .insert((host.to_string(), rtype), (values.clone(), Instant::now()));
        Ok(values)
    }

    /// Races all configured providers and returns the first success,
    /// implementing "automatic fastest-provider selection". Providers are
    /// polled concurrently via `FuturesUnordered` so the fastest responder
    /// wins without needing a `'static` spawn per provider.
    async fn query_fastest(&self, host: &str, rtype: u16, deadline: Instant) -> Result<Vec<String>, ResolverError> {
        use futures::stream::{FuturesUnordered, StreamExt};

        if self.providers.is_empty() {
            return Err(ResolverError::AllStrategiesExhausted);
        }

        let mut pending: FuturesUnordered<_> = self
            .providers
            .iter()
            .map(|endpoint| self.query_one(endpoint, host, rtype, deadline))
            .collect();

        while let Some(result) = pending.next().await {
            if let Ok(values) = result {
                return Ok(values);
            }
        }
        Err(ResolverError::AllStrategiesExhausted)
    }
}

#[async_trait]
impl Resolver for DohStrategy {
    async fn lookup_ip(&self, host: &str, deadline: Instant) -> Result<Vec<IpAddr>, ResolverError> {
        // A and AAAA in parallel; merge whichever arrives.
        let a = self.query_fastest(host, 1, deadline);
        let aaaa = self.query_fastest(host, 28, deadline);
        let (a, aaaa) = tokio::join!(a, aaaa);

        let mut ips = Vec::new();
        for batch in [a, aaaa].into_iter().flatten() {
            for s in batch {
                if let Ok(ip) = s.parse::<IpAddr>() {
                    ips.push(ip);
                }
            }
        }
        if ips.is_empty() {
            Err(ResolverError::AllStrategiesExhausted)
        } else {
            Ok(ips)
        }
    }

    async fn lookup_cname(&self, host: &str, deadline: Instant) -> Result<String, ResolverError> {
        let values = self.query_fastest(host, 5, deadline).await?;
        values
            .into_iter()
            .next()
            .map(|v| v.trim_end_matches('.').to_string())
            .ok_or_else(|| ResolverError::NoRecord(host.to_string()))
    }
}

/// Aggregate resolver that races the three built-in strategies: launches all
/// three concurrently and returns as soon as any strategy yields at least
/// one IP, or once every strategy has replied empty-handed.
pub struct ChainResolver {
    stub: Arc<StubStrategy>,
    udp: Arc<UdpStrategy>,
    doh: Arc<DohStrategy>,
}

impl ChainResolver {
    pub fn new() -> anyhow::Result<Self> {
        Ok(Self {
            stub: Arc::new(StubStrategy::from_system_conf()?),
            udp: Arc::new(UdpStrategy::defaults()?),
            doh: Arc::new(DohStrategy::new()),
        })
    }
}

#[async_trait]
impl Resolver for ChainResolver {
    async fn lookup_ip(&self, host: &str, deadline: Instant) -> Result<Vec<IpAddr>, ResolverError> {
        // Each strategy runs as its own detached task rather than a future
        // borrowed from `self`: the loser of the race keeps running after
        // this function returns, so it still populates its own cache (the
        // DoH strategy's `query_one` cache, in particular) instead of being
        // dropped mid-flight the moment a faster strategy answers first.
        let stub = self.stub.clone();
        let udp = self.udp.clone();
        let doh = self.doh.clone();
        let host_owned = host.to_string();

        let mut stub_handle = {
            let host = host_owned.clone();
            tokio::spawn(async move { stub.lookup_ip(&host, deadline).await })
        };
        let mut udp_handle = {
            let host = host_owned.clone();
            tokio::spawn(async move { udp.lookup_ip(&host, deadline).await })
        };
        let mut doh_handle = {
            let host = host_owned.clone();
            tokio::spawn(async move { doh.lookup_ip(&host, deadline).await })
        };

        let mut collected: Vec<IpAddr> = Vec::new();
        let mut seen: HashSet<IpAddr> = HashSet::new();

        let mut stub_done = false;
        let mut udp_done = false;
        let mut doh_done = false;

        loop {
            if stub_done && udp_done && doh_done {
                break;
            }
            tokio::select! {
                res = &mut stub_handle, if !stub_done => {
                    stub_done = true;
                    if let Ok(Ok(ips)) = res {
                        for ip in ips { if seen.insert(ip) { collected.push(ip); } }
                        if !collected.is_empty() { break; }
                    }
                }
                res = &mut udp_handle, if !udp_done => {
                    udp_done = true;
                    if let Ok(Ok(ips)) = res {
                        for ip in ips { if seen.insert(ip) { collected.push(ip); } }
                        if !collected.is_empty() { break; }
                    }
                }
                res = &mut doh_handle, if !doh_done => {
                    doh_done = true;
                    if let Ok(Ok(ips)) = res {
                        for ip in ips { if seen.insert(ip) { collected.push(ip); } }
                        if !collected.is_empty() { break; }
                    }
                }
                _ = tokio::time::sleep_until(tokio::time::Instant::from_std(deadline)), if Instant::now() < deadline => {
                    break;
                }
            }
        }

        if collected.is_empty() {
            Err(ResolverError::AllStrategiesExhausted)
        } else {
            Ok(collected)
        }
    }

    async fn lookup_cname(&self, host: &str, deadline: Instant) -> Result<String, ResolverError> {
        // DoH first, fall back to the stub resolver.
        match self.doh.lookup_cname(host, deadline).await {
            Ok(name) if name != host => Ok(name),
            _ => {
                let name = self.stub.lookup_cname(host, deadline).await?;
                if name == host {
                    Err(ResolverError::NoRecord(host.to_string()))
                } else {
                    Ok(name)
                }
            }
        }
    }
}
