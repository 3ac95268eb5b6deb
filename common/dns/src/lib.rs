use std::error::Error as StdError;
use std::fmt;
use std::net::{Ipv4Addr, SocketAddr, ToSocketAddrs};

use reqwest::dns::{Addrs, Name, Resolve, Resolving};
use thiserror::Error;
use url::{Host, Url};

mod client;
pub use client::{vet_target, TargetError, WebhookClient, WebhookClientBuilder};

/// Error returned when DNS resolution yields no publicly routable IPv4
/// address. Surfaced both by the resolver (connect time) and by the
/// admission-time URL check.
#[derive(Debug, Clone, Copy)]
pub struct NoPublicIpError;

impl fmt::Display for NoPublicIpError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("No public IPv4 found for specified host")
    }
}

impl StdError for NoPublicIpError {}

#[derive(Debug, Error)]
pub enum SsrfError {
    #[error("webhook url must be absolute http(s)")]
    InvalidScheme,
    #[error("webhook url has no host")]
    MissingHost,
    #[error(transparent)]
    NoPublicIp(#[from] NoPublicIpError),
    #[error("failed to resolve host: {0}")]
    Resolution(String),
}

/// Returns true if the address is routable on the public internet.
///
/// `Ipv4Addr::is_global` is still unstable, so the ranges are spelled out:
/// loopback, RFC1918 private, link-local, CGNAT (100.64/10), the protocol
/// assignment block (192.0.0/24), documentation, benchmarking (198.18/15),
/// broadcast and the reserved 240/4 block are all rejected.
pub fn is_global_ipv4(ip: &Ipv4Addr) -> bool {
    let octets = ip.octets();
    !(ip.is_unspecified()
        || ip.is_loopback()
        || ip.is_private()
        || ip.is_link_local()
        || ip.is_broadcast()
        || ip.is_documentation()
        || (octets[0] == 100 && (octets[1] & 0b1100_0000) == 0b0100_0000)
        || (octets[0] == 192 && octets[1] == 0 && octets[2] == 0)
        || (octets[0] == 198 && (octets[1] & 0xfe) == 18)
        || octets[0] >= 240)
}

fn is_public_addr(addr: &SocketAddr) -> bool {
    match addr {
        SocketAddr::V4(v4) => is_global_ipv4(v4.ip()),
        // IPv6 targets are not supported: scoped/ULA/embedded-v4 ranges make
        // a correct allow-list much harder, and every production webhook
        // target we have seen resolves an A record.
        SocketAddr::V6(_) => false,
    }
}

/// A DNS resolver for reqwest that only ever yields public IPv4 addresses.
/// Plugging this into the client closes the DNS-rebinding hole: the address
/// actually dialed is the address that was checked.
pub struct PublicIpResolver;

impl Resolve for PublicIpResolver {
    fn resolve(&self, name: Name) -> Resolving {
        let host = name.as_str().to_owned();
        Box::pin(async move {
            // getaddrinfo blocks, keep it off the runtime.
            let addrs = tokio::task::spawn_blocking(move || (host.as_str(), 0u16).to_socket_addrs())
                .await
                .map_err(|join| -> Box<dyn StdError + Send + Sync> { Box::new(join) })?
                .map_err(|io| -> Box<dyn StdError + Send + Sync> { Box::new(io) })?;

            let public: Vec<SocketAddr> = addrs.filter(is_public_addr).collect();
            if public.is_empty() {
                let err: Box<dyn StdError + Send + Sync> = Box::new(NoPublicIpError);
                Err(err)
            } else {
                let addrs: Addrs = Box::new(public.into_iter());
                Ok(addrs)
            }
        })
    }
}

/// Admission-time SSRF check for a webhook target.
///
/// Validates the scheme, then requires every resolved address to be public:
/// a host with even one private A record is rejected, so an attacker cannot
/// mix a public and an internal record to slip past admission. The
/// dispatcher re-checks at send time through `PublicIpResolver`.
pub async fn ensure_public_webhook_target(url: &Url) -> Result<(), SsrfError> {
    if url.scheme() != "http" && url.scheme() != "https" {
        return Err(SsrfError::InvalidScheme);
    }

    match url.host() {
        None => Err(SsrfError::MissingHost),
        Some(Host::Ipv4(ip)) => {
            if is_global_ipv4(&ip) {
                Ok(())
            } else {
                Err(NoPublicIpError.into())
            }
        }
        Some(Host::Ipv6(_)) => Err(NoPublicIpError.into()),
        Some(Host::Domain(domain)) => {
            let port = url.port_or_known_default().unwrap_or(443);
            let target = format!("{domain}:{port}");
            let addrs = tokio::net::lookup_host(target)
                .await
                .map_err(|e| SsrfError::Resolution(e.to_string()))?
                .collect::<Vec<_>>();

            if addrs.is_empty() || !addrs.iter().all(is_public_addr) {
                return Err(NoPublicIpError.into());
            }
            Ok(())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ip(s: &str) -> Ipv4Addr {
        s.parse().unwrap()
    }

    #[test]
    fn blocks_special_purpose_ranges() {
        assert!(!is_global_ipv4(&ip("0.0.0.0")));
        assert!(!is_global_ipv4(&ip("127.0.0.1")));
        assert!(!is_global_ipv4(&ip("10.1.2.3")));
        assert!(!is_global_ipv4(&ip("172.16.0.1")));
        assert!(!is_global_ipv4(&ip("192.168.1.1")));
        assert!(!is_global_ipv4(&ip("169.254.169.254")));
        assert!(!is_global_ipv4(&ip("100.64.0.1")));
        assert!(!is_global_ipv4(&ip("192.0.0.10")));
        assert!(!is_global_ipv4(&ip("198.18.0.1")));
        assert!(!is_global_ipv4(&ip("240.0.0.1")));
        assert!(!is_global_ipv4(&ip("255.255.255.255")));
    }

    #[test]
    fn allows_public_addresses() {
        assert!(is_global_ipv4(&ip("1.1.1.1")));
        assert!(is_global_ipv4(&ip("8.8.8.8")));
        assert!(is_global_ipv4(&ip("93.184.216.34")));
    }

    #[tokio::test]
    async fn rejects_loopback_webhook_url() {
        let url = Url::parse("http://127.0.0.1:22").unwrap();
        assert!(matches!(
            ensure_public_webhook_target(&url).await,
            Err(SsrfError::NoPublicIp(_))
        ));
    }

    #[tokio::test]
    async fn rejects_private_ip_webhook_url() {
        let url = Url::parse("https://192.168.0.10/hooks").unwrap();
        assert!(matches!(
            ensure_public_webhook_target(&url).await,
            Err(SsrfError::NoPublicIp(_))
        ));
    }

    #[tokio::test]
    async fn rejects_ipv6_webhook_url() {
        let url = Url::parse("http://[::1]:8080/hooks").unwrap();
        assert!(matches!(
            ensure_public_webhook_target(&url).await,
            Err(SsrfError::NoPublicIp(_))
        ));
    }

    #[tokio::test]
    async fn rejects_non_http_scheme() {
        let url = Url::parse("ftp://example.com/hooks").unwrap();
        assert!(matches!(
            ensure_public_webhook_target(&url).await,
            Err(SsrfError::InvalidScheme)
        ));
    }

    #[tokio::test]
    async fn rejects_localhost_hostname() {
        let url = Url::parse("http://localhost:9999/hooks").unwrap();
        assert!(ensure_public_webhook_target(&url).await.is_err());
    }
}
