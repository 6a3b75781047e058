//! The configuration record consumed by the Shadowsocks tunnel engine.
//!
//! Producing this record (parsing a config file, CLI flags, or a platform
//! settings UI) is out of scope; the engine only consumes the typed struct
//! below.

use std::net::{IpAddr, SocketAddr};
use std::time::Duration;

/// AEAD method identifier. `ChaCha20IetfPoly1305` is the default cipher.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CipherKind {
    Aes128Gcm,
    Aes256Gcm,
    ChaCha20IetfPoly1305,
}

impl CipherKind {
    /// Parse the `method` configuration string into a cipher identifier.
    pub fn parse(method: &str) -> Option<CipherKind> {
        match method {
            "aes-128-gcm" => Some(CipherKind::Aes128Gcm),
            "aes-256-gcm" => Some(CipherKind::Aes256Gcm),
            "chacha20-ietf-poly1305" | "chacha20-poly1305" => {
                Some(CipherKind::ChaCha20IetfPoly1305)
            }
            _ => None,
        }
    }

    /// Key length in bytes, per the method's underlying AEAD primitive.
    pub const fn key_len(self) -> usize {
        match self {
            CipherKind::Aes128Gcm => 16,
            CipherKind::Aes256Gcm => 32,
            CipherKind::ChaCha20IetfPoly1305 => 32,
        }
    }

    /// Per-direction salt length. Matches the key length, as required by
    /// the AEAD framing rules.
    pub const fn salt_len(self) -> usize {
        self.key_len()
    }

    /// AEAD authentication tag length; 16 bytes for every method here.
    pub const fn tag_len(self) -> usize {
        16
    }
}

impl Default for CipherKind {
    fn default() -> Self {
        CipherKind::ChaCha20IetfPoly1305
    }
}

/// Which traffic classes the tunnel handles.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Mode {
    TcpOnly,
    TcpAndUdp,
    UdpOnly,
}

impl Default for Mode {
    fn default() -> Self {
        Mode::TcpOnly
    }
}

/// Key material: either a raw key or a password run through the
/// EVP_BytesToKey-style derivation in [`crate::shadowsocks::crypto`].
#[derive(Debug, Clone)]
pub enum KeyMaterial {
    Password(String),
    Key(Vec<u8>),
}

/// Per-port differentiated-services marking, as named in the
/// `dscp` configuration option.
#[derive(Debug, Clone, Copy)]
pub struct DscpEntry {
    pub port: u16,
    pub value: u8,
}

/// The full configuration record the tunnel engine consumes.
#[derive(Debug, Clone)]
pub struct ServerConfig {
    /// Ordered list of relay endpoints, round-robined per accepted
    /// connection (capped at [`crate::config::SHADOWSOCKS_MAX_REMOTE_NUM`]).
    pub remote_addrs: Vec<(String, Option<u16>)>,
    /// Default relay port, used for entries in `remote_addrs` with no
    /// explicit port.
    pub remote_port: u16,
    pub local_addr: IpAddr,
    pub local_port: u16,
    pub key: KeyMaterial,
    pub method: CipherKind,
    pub timeout: Duration,
    pub mode: Mode,
    pub mtu: Option<usize>,
    pub mptcp: bool,
    pub fast_open: bool,
    /// Disable `TCP_NODELAY` after the first end-to-end response, unless
    /// forced on here.
    pub no_delay: bool,
    pub reuse_port: bool,
    pub ipv6_first: bool,
    pub nameserver: Option<SocketAddr>,
    pub dscp: Vec<DscpEntry>,
    pub plugin: Option<String>,
    pub plugin_opts: Option<String>,
    pub acl: Option<String>,
    pub tunnel_address: Option<(String, u16)>,
}

impl ServerConfig {
    /// A minimal config suitable as a starting point for tests and demos:
    /// one remote, default cipher, default timeout.
    pub fn new(remote_host: impl Into<String>, remote_port: u16, key: KeyMaterial) -> Self {
        ServerConfig {
            remote_addrs: vec![(remote_host.into(), None)],
            remote_port,
            local_addr: IpAddr::from([127, 0, 0, 1]),
            local_port: 1080,
            key,
            method: CipherKind::default(),
            timeout: Duration::from_secs(60),
            mode: Mode::default(),
            mtu: None,
            mptcp: false,
            fast_open: false,
            no_delay: false,
            reuse_port: false,
            ipv6_first: false,
            nameserver: None,
            dscp: Vec::new(),
            plugin: None,
            plugin_opts: None,
            acl: None,
            tunnel_address: None,
        }
    }

    /// Resolve the `n`th round-robin remote target (host, port), wrapping
    /// around the configured list. Capped at
    /// [`crate::config::SHADOWSOCKS_MAX_REMOTE_NUM`] entries, per the
    /// "round-robin-select one of up to MAX_REMOTE_NUM" rule.
    pub fn remote_target(&self, index: usize) -> (&str, u16) {
        let count = self
            .remote_addrs
            .len()
            .min(crate::config::SHADOWSOCKS_MAX_REMOTE_NUM)
            .max(1);
        let (host, port) = &self.remote_addrs[index % count];
        (host.as_str(), port.unwrap_or(self.remote_port))
    }

    pub fn local_socket_addr(&self) -> SocketAddr {
        SocketAddr::new(self.local_addr, self.local_port)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn cipher_kind_parses_known_methods() {
        assert_eq!(CipherKind::parse("aes-128-gcm"), Some(CipherKind::Aes128Gcm));
        assert_eq!(CipherKind::parse("aes-256-gcm"), Some(CipherKind::Aes256Gcm));
        assert_eq!(
            CipherKind::parse("chacha20-ietf-poly1305"),
            Some(CipherKind::ChaCha20IetfPoly1305)
        );
        assert_eq!(CipherKind::parse("rc4-md5"), None);
    }

    #[test]
    fn cipher_kind_key_and_salt_lengths() {
        assert_eq!(CipherKind::Aes128Gcm.key_len(), 16);
        assert_eq!(CipherKind::Aes256Gcm.key_len(), 32);
        assert_eq!(CipherKind::ChaCha20IetfPoly1305.key_len(), 32);
        for kind in [
            CipherKind::Aes128Gcm,
            CipherKind::Aes256Gcm,
            CipherKind::ChaCha20IetfPoly1305,
        ] {
            assert_eq!(kind.salt_len(), kind.key_len());
            assert_eq!(kind.tag_len(), 16);
        }
    }

    #[test]
    fn remote_target_round_robins_and_defaults_port() {
        let config = ServerConfig {
            remote_addrs: vec![
                ("a.example".to_string(), None),
                ("b.example".to_string(), Some(9000)),
            ],
            ..ServerConfig::new("unused", 8388, KeyMaterial::Password("x".into()))
        };
        assert_eq!(config.remote_target(0), ("a.example", 8388));
        assert_eq!(config.remote_target(1), ("b.example", 9000));
        assert_eq!(config.remote_target(2), ("a.example", 8388));
    }
}
