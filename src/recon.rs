//! Recon Service: per-host reconnaissance producing a [`ReconResult`]
//!
//! For each candidate (ip, port) the engine dials, attempts a TLS handshake
//! that accepts any certificate, and falls back to a bare HTTP/1.1 probe.
//! Grounded in the donor's `dns.rs` for the "resolve, then fan out under one
//! mutex" shape and in `core.rs::process_chunk`'s
//! `futures::stream::iter(..).buffer_unordered(..)` concurrency pattern.

use std::collections::BTreeMap;
use std::net::IpAddr;
use std::sync::Arc;
use std::time::{Duration, Instant};

use futures::stream::{self, StreamExt};
use rustls::client::{ServerCertVerified, ServerCertVerifier};
use rustls::{Certificate, ClientConfig, Error as TlsError, RootCertStore, ServerName};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::time::timeout;
use tokio_rustls::TlsConnector;
use tracing::debug;

use crate::dialer::Dialer;
use crate::error::ReconError;
use crate::recon_cache::ReconCache;

/// Scheme -> IP -> ordered distinct ports. No duplicate (ip, port) pairs
/// may appear within a scheme.
pub type ServiceMap = BTreeMap<String, BTreeMap<IpAddr, Vec<u16>>>;

#[derive(Debug, Clone)]
pub struct ReconResult {
    pub hostname: String,
    pub cnames: Vec<String>,
    pub ipv4_services: ServiceMap,
    pub ipv6_services: ServiceMap,
}

impl ReconResult {
    fn new(hostname: String) -> Self {
        Self {
            hostname,
            cnames: Vec::new(),
            ipv4_services: BTreeMap::new(),
            ipv6_services: BTreeMap::new(),
        }
    }

    fn record(&mut self, ip: IpAddr, scheme: &str, port: u16) {
        let map = if ip.is_ipv4() { &mut self.ipv4_services } else { &mut self.ipv6_services };
        let ports = map.entry(scheme.to_string()).or_default().entry(ip).or_default();
        if !ports.contains(&port) {
            ports.push(port);
            ports.sort_unstable();
        }
    }
}

/// Verifier that accepts any presented certificate, used only for recon
/// port probing (attempt a TLS handshake, accepting any certificate, with
/// `sni_host` as SNI). Never used on the real request path in
/// `http_client.rs`, which verifies against `webpki-roots`.
struct AcceptAnyCert;

impl ServerCertVerifier for AcceptAnyCert {
    fn verify_server_cert(
        &self,
        _end_entity: &Certificate,
        _intermediates: &[Certificate],
        _server_name: &ServerName,
        _scts: &mut dyn Iterator<Item = &[u8]>,
        _ocsp_response: &[u8],
        _now: std::time::SystemTime,
    ) -> Result<ServerCertVerified, TlsError> {
        Ok(ServerCertVerified::assertion())
    }
}

fn probing_tls_connector() -> TlsConnector {
    // rustls no longer supports TLS 1.0/1.1; we use rustls's safe defaults
    // (TLS 1.2 + 1.3) as the closest available minimum, noted as an Open
    // Question resolution in DESIGN.md.
    let config = ClientConfig::builder()
        .with_safe_defaults()
        .with_custom_certificate_verifier(Arc::new(AcceptAnyCert))
        .with_no_client_auth();
    TlsConnector::from(Arc::new(config))
}

pub struct ReconService {
    dialer: Arc<Dialer>,
    cache: Arc<ReconCache>,
}

impl ReconService {
    pub fn new(dialer: Arc<Dialer>, cache: Arc<ReconCache>) -> Self {
        Self { dialer, cache }
    }

    /// Extracts host and optional `:port` from free-form input.
    fn parse_input(input: &str) -> Result<(String, Option<u16>), ReconError> {
        if let Some((host, port)) = input.rsplit_once(':') {
            if let Ok(port) = port.parse::<u16>() {
                if !host.is_empty() {
                    return Ok((host.to_string(), Some(port)));
                }
            }
        }
        if input.is_empty() {
            return Err(ReconError::InvalidInput("empty host".to_string()));
        }
        Ok((input.to_string(), None))
    }

    pub async fn process_host(&self, input: &str) -> Result<ReconResult, ReconError> {
        let (host, custom_port) = Self::parse_input(input)?;

        if let Some(cached) = self.cache.get(&host) {
            debug!(host, "recon cache hit");
            return Ok(cached);
        }

        let slot = self.cache.flight_slot(&host);
        let _guard = slot.lock().await;

        // Another caller may have completed the probe while we waited.
        if let Some(cached) = self.cache.get(&host) {
            return Ok(cached);
        }

        let deadline = Instant::now() + Duration::from_secs(10);
        let mut result = ReconResult::new(host.clone());

        let cname_fut = self.dialer.lookup_cname(&host, deadline);
        let ips_fut = self.dialer.resolve(&host, deadline);
        let (cname, ips) = tokio::join!(cname_fut, ips_fut);

        if let Ok(name) = cname {
            result.cnames.push(name);
        }

        let ips = ips.map_err(ReconError::Resolve)?;

        let mut ports: Vec<u16> = vec![80, 443];
        if let Some(p) = custom_port {
            if !ports.contains(&p) {
                ports.push(p);
            }
        }

        let probes: Vec<(IpAddr, u16)> = ips
            .iter()
            .flat_map(|ip| ports.iter().map(move |p| (*ip, *p)))
            .collect();

        let sni_host = host.clone();
        let outcomes: Vec<(IpAddr, u16, Option<String>)> = stream::iter(probes)
            .map(|(ip, port)| {
                let sni_host = sni_host.clone();
                async move {
                    let scheme = probe_port(ip, port, &sni_host).await;
                    (ip, port, scheme)
                }
            })
            .buffer_unordered(16)
            .collect()
            .await;

        for (ip, port, scheme) in outcomes {
            if let Some(scheme) = scheme {
                result.record(ip, &scheme, port);
            }
        }

        self.cache.set(&host, result.clone());
        Ok(result)
    }
}

/// Probes a single `(ip, port)` for an HTTP or HTTPS speaker. Returns
/// `Some("https"|"http")` or `None` if the port is closed or speaks
/// something else. Closes the raw connection explicitly before returning in
/// every branch, resolving an Open Question about the source leaking the
/// connection on a successful-then-dropped TLS handshake.
pub async fn probe_port(ip: IpAddr, port: u16, sni_host: &str) -> Option<String> {
    let addr = std::net::SocketAddr::new(ip, port);
    let connect_timeout = Duration::from_secs(3);
    let tls_timeout = Duration::from_secs(2);

    let stream = match timeout(connect_timeout, TcpStream::connect(addr)).await {
        Ok(Ok(s)) => s,
        _ => return None,
    };

    let connector = probing_tls_connector();
    let server_name = match ServerName::try_from(sni_host) {
        Ok(name) => name,
        Err(_) => {
            let _ = stream.shutdown().await;
            return None;
        }
    };

    match timeout(tls_timeout, connector.connect(server_name, stream)).await {
        Ok(Ok(mut tls_stream)) => {
            let _ = tls_stream.shutdown().await;
            return Some("https".to_string());
        }
        Ok(Err(_)) | Err(_) => {
            // Fall through to a plaintext probe on a fresh connection; the
            // original TLS-wrapped stream above is already consumed/dropped
            // and closed by the failed handshake path.
        }
    }

    let mut plain = match timeout(connect_timeout, TcpStream::connect(addr)).await {
        Ok(Ok(s)) => s,
        _ => return None,
    };

    let request = format!("GET / HTTP/1.1\r\nHost: {sni_host}\r\nConnection: close\r\n\r\n");
    if plain.write_all(request.as_bytes()).await.is_err() {
        let _ = plain.shutdown().await;
        return None;
    }

    let mut buf = [0u8; 16];
    let read_result = timeout(Duration::from_secs(3), plain.read(&mut buf)).await;
    let _ = plain.shutdown().await;

    match read_result {
        Ok(Ok(n)) if n > 0 && buf[..n].starts_with(b"HTTP") => Some("http".to_string()),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_input_splits_port() {
        assert_eq!(
            ReconService::parse_input("example.com:8443").unwrap(),
            ("example.com".to_string(), Some(8443))
        );
        assert_eq!(
            ReconService::parse_input("example.com").unwrap(),
            ("example.com".to_string(), None)
        );
    }

    #[test]
    fn parse_input_rejects_empty() {
        assert!(ReconService::parse_input("").is_err());
    }

    #[test]
    fn record_deduplicates_ports() {
        let mut result = ReconResult::new("example.com".to_string());
        let ip: IpAddr = "93.184.216.34".parse().unwrap();
        result.record(ip, "https", 443);
        result.record(ip, "https", 443);
        result.record(ip, "https", 8443);
        let ports = &result.ipv4_services["https"][&ip];
        assert_eq!(ports, &vec![443, 8443]);
    }

    #[tokio::test]
    async fn probe_port_rejects_unreachable() {
        let scheme = probe_port("127.0.0.1".parse().unwrap(), 1, "localhost").await;
        assert!(scheme.is_none());
    }
}
