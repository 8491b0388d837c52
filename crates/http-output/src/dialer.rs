// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Outbound TCP dialer backed by the [`DnsCache`].
//!
//! The dialer is also the connector of the HTTP client: it implements
//! `tower::Service<Uri>` so every new pooled connection goes through the cache.

use hyper::Uri;
use hyper_util::rt::TokioIo;
use std::future::Future;
use std::io;
use std::net::SocketAddr;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};
use std::time::Duration;
use tokio::net::TcpStream;
use tokio::time::{timeout_at, Instant};
use tracing::debug;

use crate::dns_cache::DnsCache;
use crate::error::DialError;

#[derive(Clone)]
pub struct Dialer {
    cache: Arc<DnsCache>,
    timeout: Duration,
}

impl Dialer {
    pub fn new(cache: Arc<DnsCache>, timeout: Duration) -> Self {
        Dialer { cache, timeout }
    }

    pub fn cache(&self) -> &Arc<DnsCache> {
        &self.cache
    }

    /// Connects to `addr` (`host:port`, IPv6 hosts bracketed).
    pub async fn dial(&self, addr: &str) -> Result<TcpStream, DialError> {
        let (host, port) =
            split_host_port(addr).ok_or_else(|| DialError::InvalidAddress(addr.to_string()))?;
        self.dial_host(host, port).await
    }

    /// Resolves `host` and tries each candidate address in order until one accepts.
    ///
    /// The whole operation, resolution included, is bounded by the dial timeout: an
    /// attempt still pending at the deadline is abandoned and no further candidate
    /// is tried. Dropping the returned future cancels the dial.
    pub async fn dial_host(&self, host: &str, port: u16) -> Result<TcpStream, DialError> {
        let deadline = Instant::now() + self.timeout;
        let addr = format!("{host}:{port}");

        let candidates = match timeout_at(deadline, self.cache.resolve(host)).await {
            Ok(resolved) => resolved?,
            Err(_) => return Err(DialError::DeadlineExceeded { addr, attempted: 0 }),
        };

        let mut last_error = None;
        for (attempted, ip) in candidates.iter().enumerate() {
            if Instant::now() >= deadline {
                return Err(DialError::DeadlineExceeded { addr, attempted });
            }
            let target = SocketAddr::new(*ip, port);
            match timeout_at(deadline, TcpStream::connect(target)).await {
                Ok(Ok(stream)) => {
                    if let Err(e) = stream.set_nodelay(true) {
                        debug!("Failed to set TCP_NODELAY on {target}: {e}");
                    }
                    return Ok(stream);
                }
                Ok(Err(e)) => {
                    debug!("Dial {target} for {addr} failed: {e}");
                    last_error = Some(e);
                }
                Err(_) => {
                    return Err(DialError::DeadlineExceeded {
                        addr,
                        attempted: attempted + 1,
                    })
                }
            }
        }

        Err(DialError::AllCandidatesFailed {
            addr,
            attempted: candidates.len(),
            source: last_error.unwrap_or_else(|| {
                io::Error::new(io::ErrorKind::NotFound, "no candidate addresses")
            }),
        })
    }

    async fn dial_uri(&self, uri: &Uri) -> Result<TcpStream, DialError> {
        let host = uri
            .host()
            .map(|host| host.trim_start_matches('[').trim_end_matches(']'))
            .ok_or_else(|| DialError::InvalidAddress(uri.to_string()))?;
        let port = match uri.port_u16() {
            Some(port) => port,
            None if uri.scheme_str() == Some("https") => 443,
            None => 80,
        };
        self.dial_host(host, port).await
    }
}

impl tower::Service<Uri> for Dialer {
    type Response = TokioIo<TcpStream>;
    type Error = DialError;
    type Future = Pin<Box<dyn Future<Output = Result<Self::Response, Self::Error>> + Send>>;

    fn poll_ready(&mut self, _cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
        Poll::Ready(Ok(()))
    }

    fn call(&mut self, uri: Uri) -> Self::Future {
        let dialer = self.clone();
        Box::pin(async move { dialer.dial_uri(&uri).await.map(TokioIo::new) })
    }
}

/// Splits `host:port`, accepting `[v6]:port`.
fn split_host_port(addr: &str) -> Option<(&str, u16)> {
    let (host, port) = if let Some(rest) = addr.strip_prefix('[') {
        let (host, port) = rest.split_once("]:")?;
        (host, port)
    } else {
        let (host, port) = addr.rsplit_once(':')?;
        if host.contains(':') {
            return None;
        }
        (host, port)
    };
    if host.is_empty() {
        return None;
    }
    Some((host, port.parse().ok()?))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dns_cache::tests::StaticLookup;
    use std::net::{IpAddr, Ipv4Addr};
    use tokio::net::TcpListener;
    use tower::ServiceExt;

    fn dialer_for(addresses: Vec<IpAddr>) -> (Dialer, Arc<StaticLookup>) {
        let lookup = Arc::new(StaticLookup::new(addresses));
        let cache = Arc::new(DnsCache::with_lookup(
            Duration::from_secs(60),
            lookup.clone(),
        ));
        (Dialer::new(cache, Duration::from_secs(5)), lookup)
    }

    #[test]
    fn test_split_host_port() {
        assert_eq!(split_host_port("intake.local:8080"), Some(("intake.local", 8080)));
        assert_eq!(split_host_port("[::1]:443"), Some(("::1", 443)));
        assert_eq!(split_host_port("intake.local"), None);
        assert_eq!(split_host_port("::1:443"), None);
        assert_eq!(split_host_port(":80"), None);
        assert_eq!(split_host_port("intake.local:http"), None);
    }

    #[tokio::test]
    async fn test_falls_through_to_next_candidate() {
        // Only 127.0.0.1 listens; 127.0.0.2 is loopback too but refuses the port.
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        let refusing = IpAddr::V4(Ipv4Addr::new(127, 0, 0, 2));
        let accepting = IpAddr::V4(Ipv4Addr::LOCALHOST);
        let (dialer, _) = dialer_for(vec![refusing, accepting]);

        let stream = dialer
            .dial(&format!("intake.local:{port}"))
            .await
            .expect("second candidate should accept");

        assert_eq!(stream.peer_addr().unwrap(), SocketAddr::new(accepting, port));
    }

    #[tokio::test]
    async fn test_all_candidates_refused_returns_last_error() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        drop(listener);
        let (dialer, _) = dialer_for(vec![
            IpAddr::V4(Ipv4Addr::new(127, 0, 0, 2)),
            IpAddr::V4(Ipv4Addr::new(127, 0, 0, 3)),
        ]);

        let error = dialer
            .dial(&format!("intake.local:{port}"))
            .await
            .unwrap_err();

        match error {
            DialError::AllCandidatesFailed {
                attempted, source, ..
            } => {
                assert_eq!(attempted, 2);
                assert_eq!(source.kind(), io::ErrorKind::ConnectionRefused);
            }
            other => panic!("unexpected error: {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_resolution_failure_skips_connecting() {
        let mut lookup = StaticLookup::new(vec![]);
        lookup.fail = true;
        let lookup = Arc::new(lookup);
        let cache = Arc::new(DnsCache::with_lookup(
            Duration::from_secs(60),
            lookup.clone(),
        ));
        let dialer = Dialer::new(cache, Duration::from_secs(5));

        let error = dialer.dial("missing.local:80").await.unwrap_err();

        assert!(matches!(error, DialError::Resolution(_)));
        assert_eq!(lookup.calls(), 1);
    }

    #[tokio::test]
    async fn test_deadline_stops_resolution() {
        let mut lookup = StaticLookup::new(vec![IpAddr::V4(Ipv4Addr::LOCALHOST)]);
        lookup.delay = Duration::from_millis(500);
        let cache = Arc::new(DnsCache::with_lookup(
            Duration::from_secs(60),
            Arc::new(lookup),
        ));
        let dialer = Dialer::new(cache, Duration::from_millis(20));

        let error = dialer.dial("slow.local:80").await.unwrap_err();

        assert!(matches!(
            error,
            DialError::DeadlineExceeded { attempted: 0, .. }
        ));
    }

    #[tokio::test]
    async fn test_in_flight_attempt_abandoned_at_deadline() {
        // TEST-NET-1, never answers where the route exists.
        let blackhole = IpAddr::V4(Ipv4Addr::new(192, 0, 2, 1));
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        let settled = tokio::time::timeout(
            Duration::from_millis(100),
            TcpStream::connect(SocketAddr::new(blackhole, port)),
        )
        .await;
        if settled.is_ok() {
            eprintln!("192.0.2.1 is not blackholed on this host, skipping");
            return;
        }

        let lookup = Arc::new(StaticLookup::new(vec![
            blackhole,
            IpAddr::V4(Ipv4Addr::LOCALHOST),
        ]));
        let cache = Arc::new(DnsCache::with_lookup(Duration::from_secs(60), lookup));
        let dialer = Dialer::new(cache, Duration::from_millis(200));

        let error = dialer
            .dial(&format!("intake.local:{port}"))
            .await
            .unwrap_err();

        assert!(
            matches!(error, DialError::DeadlineExceeded { attempted: 1, .. }),
            "unexpected error: {error:?}"
        );
        assert!(
            tokio::time::timeout(Duration::from_millis(50), listener.accept())
                .await
                .is_err(),
            "second candidate must not be dialed after the deadline"
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_no_candidate_tried_once_deadline_passed() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        let dial_timeout = Duration::from_millis(100);
        // Resolution completes exactly at the deadline.
        let mut lookup = StaticLookup::new(vec![IpAddr::V4(Ipv4Addr::LOCALHOST)]);
        lookup.delay = dial_timeout;
        let cache = Arc::new(DnsCache::with_lookup(
            Duration::from_secs(60),
            Arc::new(lookup),
        ));
        let dialer = Dialer::new(cache.clone(), dial_timeout);

        let error = dialer
            .dial(&format!("intake.local:{port}"))
            .await
            .unwrap_err();

        assert!(
            matches!(error, DialError::DeadlineExceeded { attempted: 0, .. }),
            "unexpected error: {error:?}"
        );
        // Resolved and cached, but nothing was dialed.
        assert_eq!(cache.len(), 1);
        assert!(
            tokio::time::timeout(Duration::from_millis(50), listener.accept())
                .await
                .is_err()
        );
    }

    #[tokio::test]
    async fn test_invalid_address() {
        let (dialer, lookup) = dialer_for(vec![IpAddr::V4(Ipv4Addr::LOCALHOST)]);

        assert!(matches!(
            dialer.dial("no-port").await,
            Err(DialError::InvalidAddress(_))
        ));
        assert_eq!(lookup.calls(), 0);
    }

    #[tokio::test]
    async fn test_service_dials_uri_through_cache() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        let (dialer, lookup) = dialer_for(vec![IpAddr::V4(Ipv4Addr::LOCALHOST)]);
        let uri: Uri = format!("http://intake.local:{port}/message").parse().unwrap();

        let io = dialer.oneshot(uri).await.unwrap();

        assert_eq!(io.inner().peer_addr().unwrap().port(), port);
        assert_eq!(lookup.calls(), 1);
    }
}
