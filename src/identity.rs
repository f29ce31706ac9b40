use std::{
    fmt,
    net::{IpAddr, SocketAddr},
};
use tracing::debug;

use crate::{config::IdentitySettings, token::Claim};

/// Bucket key for rate-limit accounting
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum PartitionKey {
    User(String),
    Address(IpAddr),
}

impl PartitionKey {
    pub fn subject(&self) -> Option<&str> {
        match self {
            PartitionKey::User(subject) => Some(subject),
            PartitionKey::Address(_) => None,
        }
    }

    pub fn is_anonymous(&self) -> bool {
        matches!(self, PartitionKey::Address(_))
    }
}

impl fmt::Display for PartitionKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PartitionKey::User(subject) => write!(f, "user:{}", subject),
            PartitionKey::Address(addr) => write!(f, "addr:{}", addr),
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct IdentityResolver {
    trust_proxy_header: bool,
}

impl IdentityResolver {
    pub fn new(settings: &IdentitySettings) -> Self {
        Self {
            trust_proxy_header: settings.trust_proxy_header,
        }
    }

    pub fn resolve(
        &self,
        claim: Option<&Claim>,
        peer: SocketAddr,
        forwarded_for: Option<&str>,
    ) -> PartitionKey {
        match claim {
            Some(claim) => PartitionKey::User(claim.sub.clone()),
            None => PartitionKey::Address(self.client_address(peer, forwarded_for)),
        }
    }

    /// Normalized caller address: port dropped, IPv4-mapped IPv6 unwrapped
    pub fn client_address(&self, peer: SocketAddr, forwarded_for: Option<&str>) -> IpAddr {
        if self.trust_proxy_header {
            if let Some(header) = forwarded_for {
                match parse_forwarded(header) {
                    Some(addr) => return normalize(addr),
                    None => debug!(header, "Ignoring unparseable X-Forwarded-For"),
                }
            }
        }
        normalize(peer.ip())
    }
}

fn parse_forwarded(header: &str) -> Option<IpAddr> {
    let first = header.split(',').next()?.trim();
    first
        .parse::<IpAddr>()
        .ok()
        .or_else(|| first.parse::<SocketAddr>().ok().map(|s| s.ip()))
}

fn normalize(addr: IpAddr) -> IpAddr {
    match addr {
        IpAddr::V6(v6) => v6
            .to_ipv4_mapped()
            .map(IpAddr::V4)
            .unwrap_or(IpAddr::V6(v6)),
        v4 => v4,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::token::Role;

    fn resolver(trust_proxy_header: bool) -> IdentityResolver {
        IdentityResolver::new(&IdentitySettings { trust_proxy_header })
    }

    #[test]
    fn test_claim_wins_over_address() {
        let claim = Claim {
            sub: "42".to_string(),
            role: Role::Standard,
            iat: 0,
            exp: 60,
        };
        let a = resolver(false).resolve(Some(&claim), "10.0.0.1:1000".parse().unwrap(), None);
        let b = resolver(true).resolve(
            Some(&claim),
            "10.0.0.2:2000".parse().unwrap(),
            Some("1.1.1.1"),
        );
        assert_eq!(a.to_string(), "user:42");
        assert_eq!(a, b);
    }

    #[test]
    fn test_port_is_stripped() {
        let r = resolver(false);
        let a = r.resolve(None, "192.168.1.5:50000".parse().unwrap(), None);
        let b = r.resolve(None, "192.168.1.5:50001".parse().unwrap(), None);
        assert_eq!(a, b);
        assert_eq!(a.to_string(), "addr:192.168.1.5");
    }

    #[test]
    fn test_ipv4_mapped_ipv6_is_unwrapped() {
        let r = resolver(false);
        let mapped = r.resolve(None, "[::ffff:192.168.1.5]:443".parse().unwrap(), None);
        let plain = r.resolve(None, "192.168.1.5:80".parse().unwrap(), None);
        assert_eq!(mapped, plain);
    }

    #[test]
    fn test_forwarded_header_only_when_trusted() {
        let peer: SocketAddr = "10.0.0.1:8000".parse().unwrap();
        let header = Some("203.0.113.7, 10.0.0.1");

        assert_eq!(
            resolver(false).resolve(None, peer, header).to_string(),
            "addr:10.0.0.1"
        );
        assert_eq!(
            resolver(true).resolve(None, peer, header).to_string(),
            "addr:203.0.113.7"
        );
    }

    #[test]
    fn test_forwarded_header_with_port_and_garbage() {
        let peer: SocketAddr = "10.0.0.1:8000".parse().unwrap();
        let r = resolver(true);

        let v4: IpAddr = "203.0.113.7".parse().unwrap();
        let v6: IpAddr = "2001:db8::1".parse().unwrap();
        assert_eq!(r.client_address(peer, Some("203.0.113.7:5555")), v4);
        assert_eq!(r.client_address(peer, Some("[2001:db8::1]:443")), v6);
        assert_eq!(r.client_address(peer, Some("not-an-ip")), peer.ip());
    }
}
