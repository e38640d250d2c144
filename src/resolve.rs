use log::debug;
use std::net::{IpAddr, Ipv4Addr};

use crate::error::{Error, Result};

/// What to ping: an address, or a host name still to be resolved.
#[derive(Clone, Eq, PartialEq, Hash, Debug)]
pub enum Target {
    Addr(Ipv4Addr),
    Host(String),
}

impl From<Ipv4Addr> for Target {
    fn from(addr: Ipv4Addr) -> Self {
        Self::Addr(addr)
    }
}

impl From<&str> for Target {
    fn from(target: &str) -> Self {
        match target.parse::<Ipv4Addr>() {
            Ok(addr) => Self::Addr(addr),
            Err(_) => Self::Host(target.to_owned()),
        }
    }
}

impl From<String> for Target {
    fn from(target: String) -> Self {
        match target.parse::<Ipv4Addr>() {
            Ok(addr) => Self::Addr(addr),
            Err(_) => Self::Host(target),
        }
    }
}

/// Resolves `host` to its first IPv4 address through the system resolver.
///
/// # Errors
/// Returns [`Error::ResolutionFailure`] if the lookup fails or yields no IPv4 address.
pub async fn resolve(host: &str) -> Result<Ipv4Addr> {
    let addrs = tokio::net::lookup_host((host, 0))
        .await
        .map_err(|err| {
            debug!("lookup of {} failed: {}", host, err);
            Error::ResolutionFailure(host.to_owned())
        })?;
    let addr = addrs
        .map(|addr| addr.ip())
        .find_map(|ip| match ip {
            IpAddr::V4(v4) => Some(v4),
            IpAddr::V6(_) => None,
        })
        .ok_or_else(|| Error::ResolutionFailure(host.to_owned()))?;
    debug!("resolved {} to {}", host, addr);
    Ok(addr)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_target_from_literal() {
        assert_eq!(
            Target::from("192.168.1.1"),
            Target::Addr(Ipv4Addr::new(192, 168, 1, 1))
        );
        assert_eq!(
            Target::from(String::from("10.0.0.1")),
            Target::Addr(Ipv4Addr::new(10, 0, 0, 1))
        );
    }

    #[test]
    fn test_target_from_host() {
        assert_eq!(
            Target::from("example.com"),
            Target::Host("example.com".to_owned())
        );
        assert_eq!(Target::from("::1"), Target::Host("::1".to_owned()));
    }

    #[tokio::test]
    async fn test_resolve_literal() {
        assert_eq!(resolve("127.0.0.1").await.unwrap(), Ipv4Addr::LOCALHOST);
    }

    #[tokio::test]
    async fn test_resolve_failure() {
        assert!(matches!(
            resolve("").await,
            Err(Error::ResolutionFailure(_))
        ));
    }
}
