//! The SOCKS-style address frame that opens every Shadowsocks TCP session:
//!
//! ```text
//! +------+----------+----------+
//! | ATYP | DST.ADDR | DST.PORT |
//! +------+----------+----------+
//! |  1   | variable |    2     |
//! +------+----------+----------+
//! ```
//!
//! ATYP 1 = IPv4 (4 bytes), 3 = domain (1-byte length prefix + N bytes,
//! N >= 1), 4 = IPv6 (16 bytes). Port is big-endian.

use std::fmt;
use std::net::{Ipv4Addr, Ipv6Addr, SocketAddr};

const ATYP_V4: u8 = 1;
const ATYP_DOMAIN: u8 = 3;
const ATYP_V6: u8 = 4;

/// Maximum domain name length: the 1-byte length prefix caps it at 255,
/// and an empty domain is rejected as malformed.
const MAX_DOMAIN_LEN: usize = 255;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AddressError {
    /// Buffer too short to contain a complete frame.
    Truncated,
    /// ATYP byte is not one of 1, 3, 4.
    UnknownType(u8),
    /// A domain name frame claimed a zero-length name.
    EmptyDomain,
}

impl fmt::Display for AddressError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            AddressError::Truncated => write!(f, "address frame truncated"),
            AddressError::UnknownType(t) => write!(f, "unknown address type {t}"),
            AddressError::EmptyDomain => write!(f, "zero-length domain name"),
        }
    }
}

impl std::error::Error for AddressError {}

/// A Shadowsocks target address: either a literal socket address or a
/// hostname awaiting resolution.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Address {
    Socket(SocketAddr),
    Domain(String, u16),
}

impl Address {
    /// Encode this address as the ATYP/DST.ADDR/DST.PORT frame, appending
    /// to `out`.
    pub fn encode(&self, out: &mut Vec<u8>) {
        match self {
            Address::Socket(SocketAddr::V4(addr)) => {
                out.push(ATYP_V4);
                out.extend_from_slice(&addr.ip().octets());
                out.extend_from_slice(&addr.port().to_be_bytes());
            }
            Address::Socket(SocketAddr::V6(addr)) => {
                out.push(ATYP_V6);
                out.extend_from_slice(&addr.ip().octets());
                out.extend_from_slice(&addr.port().to_be_bytes());
            }
            Address::Domain(host, port) => {
                let bytes = host.as_bytes();
                debug_assert!(!bytes.is_empty() && bytes.len() <= MAX_DOMAIN_LEN);
                out.push(ATYP_DOMAIN);
                out.push(bytes.len() as u8);
                out.extend_from_slice(bytes);
                out.extend_from_slice(&port.to_be_bytes());
            }
        }
    }

    /// Decode one address frame from the front of `buf`, returning the
    /// address and the number of bytes consumed.
    pub fn decode(buf: &[u8]) -> Result<(Address, usize), AddressError> {
        let atyp = *buf.first().ok_or(AddressError::Truncated)?;
        match atyp {
            ATYP_V4 => {
                if buf.len() < 1 + 4 + 2 {
                    return Err(AddressError::Truncated);
                }
                let ip = Ipv4Addr::new(buf[1], buf[2], buf[3], buf[4]);
                let port = u16::from_be_bytes([buf[5], buf[6]]);
                Ok((Address::Socket(SocketAddr::new(ip.into(), port)), 7))
            }
            ATYP_V6 => {
                if buf.len() < 1 + 16 + 2 {
                    return Err(AddressError::Truncated);
                }
                let mut octets = [0u8; 16];
                octets.copy_from_slice(&buf[1..17]);
                let ip = Ipv6Addr::from(octets);
                let port = u16::from_be_bytes([buf[17], buf[18]]);
                Ok((Address::Socket(SocketAddr::new(ip.into(), port)), 19))
            }
            ATYP_DOMAIN => {
                let len = *buf.get(1).ok_or(AddressError::Truncated)? as usize;
                if len == 0 {
                    return Err(AddressError::EmptyDomain);
                }
                let end = 2 + len;
                if buf.len() < end + 2 {
                    return Err(AddressError::Truncated);
                }
                let host = String::from_utf8_lossy(&buf[2..end]).into_owned();
                let port = u16::from_be_bytes([buf[end], buf[end + 1]]);
                Ok((Address::Domain(host, port), end + 2))
            }
            other => Err(AddressError::UnknownType(other)),
        }
    }

    /// Parse `host` as a literal IP address, falling back to a domain
    /// record if it isn't one (the hostname then needs [`super::resolver`]).
    pub fn from_host_port(host: &str, port: u16) -> Address {
        match host.parse() {
            Ok(ip) => Address::Socket(SocketAddr::new(ip, port)),
            Err(_) => Address::Domain(host.to_string(), port),
        }
    }

    pub fn port(&self) -> u16 {
        match self {
            Address::Socket(addr) => addr.port(),
            Address::Domain(_, port) => *port,
        }
    }
}

impl fmt::Display for Address {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Address::Socket(addr) => write!(f, "{addr}"),
            Address::Domain(host, port) => write!(f, "{host}:{port}"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::SocketAddrV4;

    #[test]
    fn ipv4_roundtrips_and_matches_worked_example() {
        let addr = Address::Socket(SocketAddr::V4(SocketAddrV4::new(
            Ipv4Addr::new(203, 0, 113, 7),
            443,
        )));
        let mut buf = Vec::new();
        addr.encode(&mut buf);
        assert_eq!(buf, vec![0x01, 0xCB, 0x00, 0x71, 0x07, 0x01, 0xBB]);

        let (decoded, consumed) = Address::decode(&buf).unwrap();
        assert_eq!(decoded, addr);
        assert_eq!(consumed, 7);
    }

    #[test]
    fn ipv6_roundtrips() {
        let addr = Address::Socket("[2001:db8::1]:8080".parse().unwrap());
        let mut buf = Vec::new();
        addr.encode(&mut buf);
        assert_eq!(buf.len(), 1 + 16 + 2);
        let (decoded, consumed) = Address::decode(&buf).unwrap();
        assert_eq!(decoded, addr);
        assert_eq!(consumed, buf.len());
    }

    #[test]
    fn domain_roundtrips() {
        let addr = Address::Domain("example.com".to_string(), 80);
        let mut buf = Vec::new();
        addr.encode(&mut buf);
        assert_eq!(buf[0], ATYP_DOMAIN);
        assert_eq!(buf[1] as usize, "example.com".len());
        let (decoded, consumed) = Address::decode(&buf).unwrap();
        assert_eq!(decoded, addr);
        assert_eq!(consumed, buf.len());
    }

    #[test]
    fn decode_rejects_unknown_atyp() {
        assert_eq!(Address::decode(&[0x02, 0, 0]), Err(AddressError::UnknownType(2)));
    }

    #[test]
    fn decode_rejects_truncated_frame() {
        assert_eq!(Address::decode(&[0x01, 1, 2, 3]), Err(AddressError::Truncated));
    }

    #[test]
    fn decode_rejects_empty_domain() {
        assert_eq!(Address::decode(&[0x03, 0x00, 0, 0]), Err(AddressError::EmptyDomain));
    }

    #[test]
    fn from_host_port_prefers_literal_ip() {
        assert_eq!(
            Address::from_host_port("192.0.2.1", 53),
            Address::Socket("192.0.2.1:53".parse().unwrap())
        );
        assert_eq!(
            Address::from_host_port("example.com", 53),
            Address::Domain("example.com".to_string(), 53)
        );
    }
}
