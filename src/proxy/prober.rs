//! Prober module: one bounded connection attempt per endpoint, optionally
//! tunnelled through an upstream SOCKS5 relay.

use crate::proxy::checker::CheckerConfig;
use crate::proxy::models::{Anonymity, Endpoint, ProbeOutcome, RelayChoice};
use async_trait::async_trait;
use hickory_resolver::config::{ResolverConfig, ResolverOpts};
use hickory_resolver::TokioAsyncResolver;
use std::io;
use std::net::IpAddr;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio_socks::tcp::Socks5Stream;
use tracing::{debug, warn};

/// Hostname recorded when reverse DNS yields nothing
pub const UNKNOWN_HOSTNAME: &str = "Unknown";

/// SOCKS5 greeting offering only the "no authentication" method
const SOCKS5_GREETING: [u8; 3] = [0x05, 0x01, 0x00];
const SOCKS5_VERSION: u8 = 0x05;

/// Something that can verify a single endpoint
#[async_trait]
pub trait Probe: Send + Sync {
    async fn probe(&self, endpoint: &Endpoint, via: Option<&RelayChoice>) -> ProbeOutcome;

    /// Direct connect latency only, without enrichment
    async fn measure(&self, endpoint: &Endpoint) -> Option<u64> {
        self.probe(endpoint, None).await.latency_ms()
    }
}

/// PTR lookup used for the anonymity heuristic
#[async_trait]
pub trait ReverseResolver: Send + Sync {
    async fn reverse(&self, address: IpAddr) -> Option<String>;
}

/// Reverse resolver that never resolves anything
#[derive(Debug, Clone, Copy, Default)]
pub struct NoReverse;

#[async_trait]
impl ReverseResolver for NoReverse {
    async fn reverse(&self, _address: IpAddr) -> Option<String> {
        None
    }
}

/// Reverse resolver backed by the system DNS configuration
pub struct DnsReverseResolver {
    resolver: TokioAsyncResolver,
}

impl DnsReverseResolver {
    /// Build from the system resolver configuration, falling back to the
    /// library defaults when it cannot be read.
    pub fn from_system_conf(timeout: Duration) -> Self {
        let (config, mut opts) = hickory_resolver::system_conf::read_system_conf()
            .unwrap_or_else(|e| {
                warn!("cannot read system DNS configuration, using defaults: {}", e);
                (ResolverConfig::default(), ResolverOpts::default())
            });
        opts.timeout = timeout;
        opts.attempts = 1;

        Self {
            resolver: TokioAsyncResolver::tokio(config, opts),
        }
    }
}

#[async_trait]
impl ReverseResolver for DnsReverseResolver {
    async fn reverse(&self, address: IpAddr) -> Option<String> {
        match self.resolver.reverse_lookup(address).await {
            Ok(lookup) => lookup
                .iter()
                .next()
                .map(|name| name.to_string().trim_end_matches('.').to_string()),
            Err(e) => {
                debug!("Hostname lookup failed for {}: {}", address, e);
                None
            }
        }
    }
}

/// TCP prober with optional relay chaining
pub struct Socks5Prober {
    timeout: Duration,
    reverse_dns_timeout: Duration,
    handshake: bool,
    resolver: Arc<dyn ReverseResolver>,
}

impl Socks5Prober {
    pub fn new(config: &CheckerConfig, resolver: Arc<dyn ReverseResolver>) -> Self {
        Self {
            timeout: config.timeout,
            reverse_dns_timeout: config.reverse_dns_timeout,
            handshake: config.handshake,
            resolver,
        }
    }

    /// Open the transport, optionally greet, and return the connect latency.
    ///
    /// The stream lives only inside this future, so it is closed on every
    /// exit path, including when the future is dropped on timeout or
    /// cancellation.
    async fn connect(&self, endpoint: &Endpoint, via: Option<&RelayChoice>) -> io::Result<u64> {
        let start = Instant::now();
        match via {
            Some(relay) => {
                let mut stream =
                    Socks5Stream::connect(relay.endpoint.socket_addr(), endpoint.socket_addr())
                        .await
                        .map_err(|e| io::Error::other(format!("via relay {}: {}", relay, e)))?;
                let latency = elapsed_ms(start);
                if self.handshake {
                    greet(&mut stream).await?;
                }
                Ok(latency)
            }
            None => {
                let mut stream = TcpStream::connect(endpoint.socket_addr()).await?;
                let latency = elapsed_ms(start);
                if self.handshake {
                    greet(&mut stream).await?;
                }
                Ok(latency)
            }
        }
    }

    /// `connect` bounded by the probe timeout, failures flattened to a reason
    async fn timed_connect(&self, endpoint: &Endpoint, via: Option<&RelayChoice>) -> Result<u64, String> {
        match tokio::time::timeout(self.timeout, self.connect(endpoint, via)).await {
            Ok(Ok(latency)) => Ok(latency),
            Ok(Err(e)) => {
                debug!("Connection failed for {}: {}", endpoint, e);
                Err(e.to_string())
            }
            Err(_) => {
                debug!("Connection timed out for {}", endpoint);
                Err(format!("timed out after {}ms", self.timeout.as_millis()))
            }
        }
    }

    async fn hostname(&self, address: IpAddr) -> Option<String> {
        tokio::time::timeout(self.reverse_dns_timeout, self.resolver.reverse(address))
            .await
            .ok()
            .flatten()
    }
}

#[async_trait]
impl Probe for Socks5Prober {
    async fn probe(&self, endpoint: &Endpoint, via: Option<&RelayChoice>) -> ProbeOutcome {
        if let Some(reason) = invalid_reason(endpoint) {
            debug!("Invalid endpoint {}: {}", endpoint, reason);
            return ProbeOutcome::invalid(reason);
        }

        let latency_ms = match self.timed_connect(endpoint, via).await {
            Ok(latency) => latency,
            Err(reason) => return ProbeOutcome::unreachable(reason),
        };

        let hostname = self.hostname(endpoint.address).await;
        let anonymity = Anonymity::classify(&endpoint.address, hostname.as_deref());
        let hostname = hostname.unwrap_or_else(|| UNKNOWN_HOSTNAME.to_string());

        debug!(
            "Connected to {} - Speed={}ms, Anonymity={}",
            endpoint, latency_ms, anonymity
        );
        ProbeOutcome::Verified {
            hostname,
            latency_ms,
            anonymity,
        }
    }

    async fn measure(&self, endpoint: &Endpoint) -> Option<u64> {
        if invalid_reason(endpoint).is_some() {
            return None;
        }
        self.timed_connect(endpoint, None).await.ok()
    }
}

/// Reject endpoints that cannot be connected to at all
fn invalid_reason(endpoint: &Endpoint) -> Option<String> {
    if endpoint.port == 0 {
        Some("port 0 is out of range".to_string())
    } else if endpoint.address.is_unspecified() {
        Some(format!("unspecified address {}", endpoint.address))
    } else if endpoint.address.is_multicast() {
        Some(format!("multicast address {}", endpoint.address))
    } else {
        None
    }
}

/// Offer the no-auth method and require a SOCKS5 version byte in reply
async fn greet<S>(stream: &mut S) -> io::Result<()>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    stream.write_all(&SOCKS5_GREETING).await?;
    let mut reply = [0u8; 2];
    stream.read_exact(&mut reply).await?;
    if reply[0] != SOCKS5_VERSION {
        return Err(io::Error::new(
            io::ErrorKind::InvalidData,
            format!("not a SOCKS5 server (version byte {:#04x})", reply[0]),
        ));
    }
    Ok(())
}

fn elapsed_ms(start: Instant) -> u64 {
    start.elapsed().as_millis() as u64
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::{Ipv4Addr, SocketAddr};
    use tokio::net::TcpListener;

    struct FixedReverse(&'static str);

    #[async_trait]
    impl ReverseResolver for FixedReverse {
        async fn reverse(&self, _address: IpAddr) -> Option<String> {
            Some(self.0.to_string())
        }
    }

    #[derive(Default)]
    struct CountingReverse(std::sync::atomic::AtomicUsize);

    #[async_trait]
    impl ReverseResolver for CountingReverse {
        async fn reverse(&self, _address: IpAddr) -> Option<String> {
            self.0.fetch_add(1, std::sync::atomic::Ordering::SeqCst);
            Some("proxy.example.net".to_string())
        }
    }

    fn prober(config: CheckerConfig, resolver: Arc<dyn ReverseResolver>) -> Socks5Prober {
        Socks5Prober::new(&config, resolver)
    }

    fn fast_config() -> CheckerConfig {
        CheckerConfig::new().with_timeout(Duration::from_millis(500))
    }

    async fn listener() -> (TcpListener, Endpoint) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        (listener, Endpoint::from(addr))
    }

    async fn closed_endpoint() -> Endpoint {
        let (listener, endpoint) = listener().await;
        drop(listener);
        endpoint
    }

    #[tokio::test]
    async fn test_probe_reachable_without_hostname() {
        let (_listener, endpoint) = listener().await;
        let outcome = prober(fast_config(), Arc::new(NoReverse))
            .probe(&endpoint, None)
            .await;

        match outcome {
            ProbeOutcome::Verified {
                hostname,
                anonymity,
                latency_ms,
            } => {
                assert_eq!(hostname, UNKNOWN_HOSTNAME);
                assert_eq!(anonymity, Anonymity::Low);
                assert!(latency_ms < 500);
            }
            other => panic!("expected verified, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_probe_distinct_hostname_is_high() {
        let (_listener, endpoint) = listener().await;
        let outcome = prober(fast_config(), Arc::new(FixedReverse("proxy.example.net")))
            .probe(&endpoint, None)
            .await;

        assert!(matches!(
            outcome,
            ProbeOutcome::Verified { anonymity: Anonymity::High, ref hostname, .. } if hostname == "proxy.example.net"
        ));
    }

    #[tokio::test]
    async fn test_probe_literal_hostname_is_low() {
        let (_listener, endpoint) = listener().await;
        let outcome = prober(fast_config(), Arc::new(FixedReverse("127.0.0.1")))
            .probe(&endpoint, None)
            .await;

        assert!(matches!(
            outcome,
            ProbeOutcome::Verified { anonymity: Anonymity::Low, .. }
        ));
    }

    #[tokio::test]
    async fn test_measure_skips_reverse_dns() {
        let (_listener, endpoint) = listener().await;
        let resolver = Arc::new(CountingReverse::default());
        let prober = prober(fast_config(), resolver.clone());

        assert!(prober.measure(&endpoint).await.is_some());
        assert!(prober.measure(&closed_endpoint().await).await.is_none());
        assert_eq!(resolver.0.load(std::sync::atomic::Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_probe_refused_is_unreachable() {
        let endpoint = closed_endpoint().await;
        let outcome = prober(fast_config(), Arc::new(NoReverse))
            .probe(&endpoint, None)
            .await;
        assert!(matches!(outcome, ProbeOutcome::Unreachable { .. }));
    }

    #[tokio::test]
    async fn test_probe_invalid_port() {
        let endpoint = Endpoint::new(IpAddr::V4(Ipv4Addr::LOCALHOST), 0);
        let outcome = prober(fast_config(), Arc::new(NoReverse))
            .probe(&endpoint, None)
            .await;
        assert!(matches!(outcome, ProbeOutcome::Invalid { .. }));
    }

    #[tokio::test]
    async fn test_probe_unspecified_address() {
        let endpoint = Endpoint::from("0.0.0.0:1080".parse::<SocketAddr>().unwrap());
        let outcome = prober(fast_config(), Arc::new(NoReverse))
            .probe(&endpoint, None)
            .await;
        assert!(matches!(outcome, ProbeOutcome::Invalid { .. }));
    }

    #[tokio::test]
    async fn test_silent_peer_times_out_within_bound() {
        let (listener, endpoint) = listener().await;
        // Accept and hold the connection without ever answering the greeting.
        tokio::spawn(async move {
            let mut held = Vec::new();
            while let Ok((socket, _)) = listener.accept().await {
                held.push(socket);
            }
        });

        let timeout = Duration::from_millis(200);
        let config = CheckerConfig::new().with_timeout(timeout).with_handshake(true);
        let start = Instant::now();
        let outcome = prober(config, Arc::new(NoReverse)).probe(&endpoint, None).await;

        assert!(matches!(outcome, ProbeOutcome::Unreachable { .. }));
        assert!(start.elapsed() < timeout + Duration::from_secs(1));
    }

    #[tokio::test]
    async fn test_handshake_accepts_socks5_reply() {
        let (listener, endpoint) = listener().await;
        tokio::spawn(async move {
            let (mut socket, _) = listener.accept().await.unwrap();
            let mut greeting = [0u8; 3];
            socket.read_exact(&mut greeting).await.unwrap();
            socket.write_all(&[0x05, 0x00]).await.unwrap();
        });

        let config = fast_config().with_handshake(true);
        let outcome = prober(config, Arc::new(NoReverse)).probe(&endpoint, None).await;
        assert!(outcome.is_verified());
    }

    #[tokio::test]
    async fn test_handshake_rejects_non_socks_server() {
        let (listener, endpoint) = listener().await;
        tokio::spawn(async move {
            let (mut socket, _) = listener.accept().await.unwrap();
            let mut greeting = [0u8; 3];
            socket.read_exact(&mut greeting).await.unwrap();
            socket.write_all(b"HTTP/1.1 400 Bad Request\r\n\r\n").await.unwrap();
        });

        let config = fast_config().with_handshake(true);
        let outcome = prober(config, Arc::new(NoReverse)).probe(&endpoint, None).await;
        match outcome {
            ProbeOutcome::Unreachable { reason } => assert!(reason.contains("not a SOCKS5 server")),
            other => panic!("expected unreachable, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_dead_relay_is_unreachable() {
        let (_target, endpoint) = listener().await;
        let relay = RelayChoice::new(closed_endpoint().await);

        let outcome = prober(fast_config(), Arc::new(NoReverse))
            .probe(&endpoint, Some(&relay))
            .await;
        match outcome {
            ProbeOutcome::Unreachable { reason } => assert!(reason.contains("via relay")),
            other => panic!("expected unreachable, got {:?}", other),
        }
    }
}
