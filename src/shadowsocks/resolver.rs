//! Dual A/AAAA DNS resolution with `ipv6_first` preference.
//!
//! A libc-ares based client fires one `ares_gethostbyname` query per
//! address family and waits for both callbacks before picking an answer
//! (`choose_ipv6_first` in `resolv.c`). The `tokio`/`hickory-resolver`
//! rendering is a `tokio::join!` of the two lookups instead of two
//! callbacks racing on the same event loop; both still must complete
//! before an answer is chosen, preserving that synchronization.
//!
//! `hickory-resolver` maintains its own background I/O, so unlike an
//! `ev_timer`-driven maintenance tick, there is nothing to reschedule
//! here.

use std::net::{IpAddr, SocketAddr};

use hickory_resolver::config::{ResolverConfig, ResolverOpts};
use hickory_resolver::TokioAsyncResolver;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ResolveError {
    #[error("no A or AAAA records found for {0}")]
    NoAddresses(String),
}

/// Wraps a `hickory-resolver` handle configured from the tunnel's
/// `nameserver` override, or the system default if none was given.
#[derive(Clone)]
pub struct Resolver {
    inner: TokioAsyncResolver,
}

impl Resolver {
    pub fn new(nameserver: Option<SocketAddr>) -> Resolver {
        let inner = match nameserver {
            Some(addr) => TokioAsyncResolver::tokio(
                ResolverConfig::from_parts(
                    None,
                    vec![],
                    hickory_resolver::config::NameServerConfigGroup::from_ips_clear(
                        &[addr.ip()],
                        addr.port(),
                        true,
                    ),
                ),
                ResolverOpts::default(),
            ),
            None => TokioAsyncResolver::tokio(ResolverConfig::default(), ResolverOpts::default()),
        };
        Resolver { inner }
    }

    /// Resolve `host`, racing A and AAAA queries and waiting for both to
    /// settle before applying the `ipv6_first` selection policy.
    pub async fn resolve(&self, host: &str, ipv6_first: bool) -> Result<IpAddr, ResolveError> {
        let (v4, v6) = tokio::join!(self.inner.ipv4_lookup(host), self.inner.ipv6_lookup(host));

        let mut v4_addrs: Vec<IpAddr> = v4
            .map(|r| r.iter().map(|a| IpAddr::V4(a.0)).collect())
            .unwrap_or_default();
        let v6_addrs: Vec<IpAddr> = v6
            .map(|r| r.iter().map(|a| IpAddr::V6(a.0)).collect())
            .unwrap_or_default();

        let selected = if ipv6_first {
            v6_addrs.first().or_else(|| v4_addrs.first())
        } else {
            v4_addrs.first().or_else(|| v6_addrs.first())
        };

        selected
            .copied()
            .ok_or_else(|| ResolveError::NoAddresses(host.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn selection_prefers_ipv6_when_ipv6_first_and_both_present() {
        let v4 = vec![IpAddr::from([192, 0, 2, 1])];
        let v6 = vec![IpAddr::from([0x2001, 0x0db8, 0, 0, 0, 0, 0, 1])];

        let picked = pick(&v4, &v6, true);
        assert_eq!(picked, Some(v6[0]));

        let picked = pick(&v4, &v6, false);
        assert_eq!(picked, Some(v4[0]));
    }

    #[test]
    fn selection_falls_back_to_the_only_family_present() {
        let v4 = vec![IpAddr::from([192, 0, 2, 1])];
        let empty: Vec<IpAddr> = Vec::new();
        assert_eq!(pick(&v4, &empty, true), Some(v4[0]));
        assert_eq!(pick(&empty, &v4, false), Some(v4[0]));
    }

    #[test]
    fn selection_none_when_both_empty() {
        let empty: Vec<IpAddr> = Vec::new();
        assert_eq!(pick(&empty, &empty, true), None);
    }

    /// Mirrors the selection policy in [`Resolver::resolve`] over plain
    /// vectors, so it can be tested without a live resolver.
    fn pick(v4: &[IpAddr], v6: &[IpAddr], ipv6_first: bool) -> Option<IpAddr> {
        if ipv6_first {
            v6.first().or_else(|| v4.first()).copied()
        } else {
            v4.first().or_else(|| v6.first()).copied()
        }
    }
}
