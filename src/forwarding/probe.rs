//! Forward readiness probe
//!
//! A negotiated forward is not guaranteed to be usable immediately, so
//! establishment polls the bind address until it accepts a connection.

use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr};
use std::time::Duration;

use tokio::net::TcpStream;
use tokio::sync::watch;
use tracing::debug;

/// Per-connect timeout for a single probe
const PROBE_CONNECT_TIMEOUT: Duration = Duration::from_secs(1);

/// Polling parameters for the probe window
#[derive(Debug, Clone, Copy)]
pub struct ProbeSettings {
    pub interval: Duration,
    pub max_attempts: u32,
}

impl Default for ProbeSettings {
    fn default() -> Self {
        Self {
            interval: Duration::from_millis(500),
            max_attempts: 20,
        }
    }
}

/// Outcome of a probe window
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProbeOutcome {
    /// The address accepted a connection on the given attempt
    Ready { attempts: u32 },
    /// The forward went away while probing
    Closed,
    /// Every attempt failed
    TimedOut { attempts: u32 },
}

/// Address a client should dial to reach a listener bound to `bound`.
///
/// Wildcard binds are reached through loopback.
pub fn probe_target(bound: SocketAddr) -> SocketAddr {
    match bound.ip() {
        IpAddr::V4(ip) if ip.is_unspecified() => {
            SocketAddr::new(IpAddr::V4(Ipv4Addr::LOCALHOST), bound.port())
        }
        IpAddr::V6(ip) if ip.is_unspecified() => {
            SocketAddr::new(IpAddr::V6(Ipv6Addr::LOCALHOST), bound.port())
        }
        _ => bound,
    }
}

/// Single connect attempt, bounded by [`PROBE_CONNECT_TIMEOUT`]
pub async fn check_port(addr: SocketAddr) -> bool {
    matches!(
        tokio::time::timeout(PROBE_CONNECT_TIMEOUT, TcpStream::connect(addr)).await,
        Ok(Ok(_))
    )
}

/// Poll `addr` every `settings.interval` until it accepts, `closed` reads
/// `true`, or `settings.max_attempts` is exhausted.
pub async fn wait_until_ready(
    addr: SocketAddr,
    settings: ProbeSettings,
    closed: &watch::Receiver<bool>,
) -> ProbeOutcome {
    let target = probe_target(addr);
    let mut ticker = tokio::time::interval(settings.interval);

    for attempt in 1..=settings.max_attempts {
        ticker.tick().await;

        if *closed.borrow() {
            return ProbeOutcome::Closed;
        }

        if check_port(target).await {
            debug!("Forward {} ready after {} probe(s)", target, attempt);
            return ProbeOutcome::Ready { attempts: attempt };
        }
    }

    ProbeOutcome::TimedOut {
        attempts: settings.max_attempts,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::net::TcpListener;

    fn fast() -> ProbeSettings {
        ProbeSettings {
            interval: Duration::from_millis(10),
            max_attempts: 5,
        }
    }

    #[test]
    fn test_defaults_cap_at_ten_seconds() {
        let settings = ProbeSettings::default();
        assert_eq!(settings.interval * settings.max_attempts, Duration::from_secs(10));
    }

    #[test]
    fn test_wildcard_probe_target() {
        let v4: SocketAddr = "0.0.0.0:15432".parse().unwrap();
        assert_eq!(probe_target(v4), "127.0.0.1:15432".parse().unwrap());
        let v6: SocketAddr = "[::]:8080".parse().unwrap();
        assert_eq!(probe_target(v6), "[::1]:8080".parse().unwrap());
        let exact: SocketAddr = "10.0.0.5:22".parse().unwrap();
        assert_eq!(probe_target(exact), exact);
    }

    #[tokio::test]
    async fn test_ready_when_listening() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let (_tx, rx) = watch::channel(false);
        let outcome = wait_until_ready(listener.local_addr().unwrap(), fast(), &rx).await;
        assert_eq!(outcome, ProbeOutcome::Ready { attempts: 1 });
    }

    #[tokio::test]
    async fn test_times_out_on_closed_port() {
        let addr = {
            let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
            listener.local_addr().unwrap()
        };
        let (_tx, rx) = watch::channel(false);
        let outcome = wait_until_ready(addr, fast(), &rx).await;
        assert_eq!(outcome, ProbeOutcome::TimedOut { attempts: 5 });
    }

    #[tokio::test]
    async fn test_stops_early_when_forward_closed() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let (_tx, rx) = watch::channel(true);
        let outcome = wait_until_ready(listener.local_addr().unwrap(), fast(), &rx).await;
        assert_eq!(outcome, ProbeOutcome::Closed);
    }
}
