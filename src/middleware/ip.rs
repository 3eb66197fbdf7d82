//! Client address resolution.
//!
//! The peer address comes from axum's [`ConnectInfo<SocketAddr>`] extension,
//! which is present when the server is started with
//! `into_make_service_with_connect_info::<SocketAddr>()`.
//!
//! `X-Forwarded-For` (first entry) and `X-Real-IP` are honored only when the
//! peer is inside a `TRUSTED_PROXIES` range. With no ranges configured the
//! headers are ignored and the peer address is the client. The proxy in front
//! should overwrite these headers:
//!
//! ```nginx
//! proxy_set_header X-Real-IP $remote_addr;
//! proxy_set_header X-Forwarded-For $remote_addr;
//! ```
//!
//! A forwarded value that does not parse as an IP address is not replaced by
//! the peer address: the request has no valid client address and the rate
//! limiter rejects it.

use std::net::{IpAddr, SocketAddr};

use axum::extract::ConnectInfo;
use axum::http::Request;
use tracing::{debug, warn};

/// Header value chosen as the client address.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ForwardedIp<'a> {
    /// First entry of `X-Forwarded-For`.
    FromXff(&'a str),
    FromRealIp(&'a str),
    NotFound,
}

#[inline]
fn forwarded_ip<B>(req: &Request<B>) -> ForwardedIp<'_> {
    if let Some(forwarded) = req.headers().get("x-forwarded-for")
        && let Ok(value) = forwarded.to_str()
        && let Some(first_ip) = value.split(',').next()
    {
        return ForwardedIp::FromXff(first_ip.trim());
    }

    if let Some(real_ip) = req.headers().get("x-real-ip")
        && let Ok(value) = real_ip.to_str()
    {
        return ForwardedIp::FromRealIp(value.trim());
    }

    ForwardedIp::NotFound
}

/// Parse an address as sent by proxies: bare IP or `ip:port` / `[ipv6]:port`.
pub fn parse_client_addr(value: &str) -> Option<IpAddr> {
    let value = value.trim();
    value
        .parse::<IpAddr>()
        .ok()
        .or_else(|| value.parse::<SocketAddr>().ok().map(|addr| addr.ip()))
}

/// Peer address of the TCP connection, if the server recorded it.
#[inline]
pub fn peer_addr<B>(req: &Request<B>) -> Option<IpAddr> {
    req.extensions()
        .get::<ConnectInfo<SocketAddr>>()
        .map(|ConnectInfo(addr)| addr.ip())
}

/// Resolve the client address for a request.
///
/// Returns `None` when there is no usable address: no peer and no trusted
/// forwarding header, or a trusted forwarding header that is not an IP.
pub fn resolve_client_ip<B>(req: &Request<B>, trusted_proxies: &TrustedProxyConfig) -> Option<IpAddr> {
    let peer = peer_addr(req);

    let (forwarded, source) = match forwarded_ip(req) {
        ForwardedIp::FromXff(value) => (value, "x-forwarded-for"),
        ForwardedIp::FromRealIp(value) => (value, "x-real-ip"),
        ForwardedIp::NotFound => return peer,
    };

    let trusted = peer.is_some_and(|peer| trusted_proxies.is_trusted(&peer));

    if !trusted {
        if trusted_proxies.is_enabled() {
            warn!(
                peer = ?peer,
                header = source,
                "Ignoring forwarded client address from untrusted peer"
            );
        }
        return peer;
    }

    let resolved = parse_client_addr(forwarded);
    if resolved.is_none() {
        debug!(header = source, value = %forwarded, "Forwarded client address is not an IP");
    }
    resolved
}

// =============================================================================
// Trusted Proxy CIDR Matching
// =============================================================================

/// Parsed CIDR network range for trusted proxy validation.
#[derive(Debug, Clone)]
pub struct CidrRange {
    network: IpAddr,
    prefix_len: u8,
}

impl CidrRange {
    /// Parse `"10.0.0.0/8"`, `"::1/128"` or a bare IP (implicit /32 or /128).
    pub fn parse(cidr: &str) -> Option<Self> {
        let cidr = cidr.trim();

        let Some((addr, prefix)) = cidr.split_once('/') else {
            let ip: IpAddr = cidr.parse().ok()?;
            return Some(Self {
                network: ip,
                prefix_len: max_prefix(&ip),
            });
        };

        let ip: IpAddr = addr.parse().ok()?;
        let prefix_len: u8 = prefix.parse().ok()?;
        if prefix_len > max_prefix(&ip) {
            return None;
        }

        Some(Self {
            network: ip,
            prefix_len,
        })
    }

    pub fn contains(&self, ip: &IpAddr) -> bool {
        match (&self.network, ip) {
            (IpAddr::V4(net), IpAddr::V4(addr)) => {
                let mask = u32::MAX
                    .checked_shl(32 - u32::from(self.prefix_len))
                    .unwrap_or(0);
                (u32::from(*net) & mask) == (u32::from(*addr) & mask)
            }
            (IpAddr::V6(net), IpAddr::V6(addr)) => {
                let mask = u128::MAX
                    .checked_shl(128 - u32::from(self.prefix_len))
                    .unwrap_or(0);
                (u128::from(*net) & mask) == (u128::from(*addr) & mask)
            }
            _ => false,
        }
    }
}

fn max_prefix(ip: &IpAddr) -> u8 {
    match ip {
        IpAddr::V4(_) => 32,
        IpAddr::V6(_) => 128,
    }
}

/// Proxies allowed to set `X-Forwarded-For` / `X-Real-IP`.
#[derive(Debug, Clone, Default)]
pub struct TrustedProxyConfig {
    ranges: Vec<CidrRange>,
}

impl TrustedProxyConfig {
    /// Build from CIDR strings. Invalid entries are logged and skipped.
    pub fn new(cidrs: &[String]) -> Self {
        let ranges: Vec<CidrRange> = cidrs
            .iter()
            .filter_map(|cidr| {
                let parsed = CidrRange::parse(cidr);
                if parsed.is_none() {
                    warn!(cidr = %cidr, "Invalid CIDR range in TRUSTED_PROXIES, skipping");
                }
                parsed
            })
            .collect();

        if !ranges.is_empty() {
            debug!(count = ranges.len(), "Trusted proxy validation enabled");
        }

        Self { ranges }
    }

    pub fn is_enabled(&self) -> bool {
        !self.ranges.is_empty()
    }

    /// True if `ip` is inside a configured range.
    pub fn is_trusted(&self, ip: &IpAddr) -> bool {
        self.ranges.iter().any(|range| range.contains(ip))
    }
}
