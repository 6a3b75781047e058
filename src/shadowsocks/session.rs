//! Per-connection stage state machine and AEAD data shuttle.
//!
//! One [`run`] call is spawned as its own `tokio` task per accepted local
//! connection (see [`super::listener`]), playing the role a C client's
//! `server_t`/`remote_t` pair plus `server_recv_cb`/`server_send_cb`/
//! `remote_recv_cb`/`remote_send_cb` would play on a shared event loop:
//! each task *is* one cooperative state machine, and `tokio::select!`
//! enumerates its suspension points.

use std::io;
use std::net::{IpAddr, SocketAddr};
use std::sync::Arc;
use std::time::Duration;

use rand::RngCore;
use thiserror::Error;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::time::timeout;

use super::address::{Address, AddressError};
use super::config::{CipherKind, KeyMaterial, ServerConfig};
use super::crypto::{self, ChunkDecoder, ChunkEncoder, CryptoError, FeedResult};
use super::resolver::{ResolveError, Resolver};
use crate::config::SHADOWSOCKS_MAX_CHUNK_SIZE;

/// How long [`Stage::Connect`] waits for the remote relay to accept the
/// connection before giving up.
const CONNECT_TIMEOUT: Duration = Duration::from_secs(10);

#[derive(Debug, Error)]
pub enum SessionError {
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),
    #[error("crypto error: {0}")]
    Crypto(#[from] CryptoError),
    #[error("DNS resolution failed: {0}")]
    Resolve(#[from] ResolveError),
    #[error("malformed address frame: {0}")]
    Address(#[from] AddressError),
    #[error("idle timeout")]
    IdleTimeout,
}

/// Session lifecycle stage, with `Connect` inserted between `Resolve` and
/// `Stream` to distinguish "resolved, dialing the remote" from "resolved,
/// streaming", since the idle and connect timers apply to these two phases
/// differently.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Stage {
    Init,
    Handshake,
    Sni,
    Resolve,
    Connect,
    Stream,
    Stop,
    Error,
}

fn master_key(config: &ServerConfig) -> Vec<u8> {
    match &config.key {
        KeyMaterial::Key(raw) => raw.clone(),
        KeyMaterial::Password(password) => {
            crypto::evp_bytes_to_key(password.as_bytes(), config.method.key_len())
        }
    }
}

/// Resolve the round-robin-selected remote relay host to a connectable
/// address. A literal IP short-circuits `Stage::Resolve` entirely; a
/// hostname is resolved via `resolver`, racing A/AAAA as described there.
async fn resolve_remote(
    config: &ServerConfig,
    resolver: &Resolver,
    remote_index: usize,
) -> Result<SocketAddr, SessionError> {
    let (host, port) = config.remote_target(remote_index);
    if let Ok(ip) = host.parse::<IpAddr>() {
        return Ok(SocketAddr::new(ip, port));
    }
    let ip = resolver.resolve(host, config.ipv6_first).await?;
    Ok(SocketAddr::new(ip, port))
}

/// Apply the socket options described for the remote relay connection:
/// `TCP_NODELAY`, keepalive, and (on the platforms where the underlying
/// crates expose it) `SO_NOSIGPIPE`/DSCP marking. Source-address and
/// outbound-interface binding have no corresponding field in the
/// configuration record consumed here, so they are not applied (see
/// `DESIGN.md`).
fn configure_remote_socket(socket: &socket2::Socket, config: &ServerConfig) -> io::Result<()> {
    socket.set_nodelay(true)?;
    let keepalive = socket2::TcpKeepalive::new()
        .with_time(Duration::from_secs(30))
        .with_interval(Duration::from_secs(10));
    #[cfg(any(target_os = "linux", target_os = "android"))]
    let keepalive = keepalive.with_retries(3);
    socket.set_tcp_keepalive(&keepalive)?;

    #[cfg(any(target_os = "macos", target_os = "ios"))]
    socket.set_nosigpipe(true)?;

    if let Some(dscp) = config.dscp.iter().find(|e| e.port == config.local_port) {
        let _ = socket.set_tos(dscp.value as u32);
    }

    Ok(())
}

/// Attempt TCP Fast Open on the platforms this crate can address directly;
/// other platforms fall back to a plain `connect`, matching the failure
/// semantics ("fast-open unsupported on the platform... falls back to
/// standard connect on the next session").
#[cfg(any(target_os = "linux", target_os = "android"))]
fn enable_fast_open_connect(socket: &socket2::Socket) -> io::Result<()> {
    use std::os::fd::AsRawFd;
    // TCP_FASTOPEN_CONNECT (Linux 4.11+); not always present in `libc`.
    const TCP_FASTOPEN_CONNECT: libc::c_int = 30;
    let enable: libc::c_int = 1;
    let ret = unsafe {
        libc::setsockopt(
            socket.as_raw_fd(),
            libc::IPPROTO_TCP,
            TCP_FASTOPEN_CONNECT,
            &enable as *const _ as *const libc::c_void,
            std::mem::size_of::<libc::c_int>() as libc::socklen_t,
        )
    };
    if ret != 0 {
        return Err(io::Error::last_os_error());
    }
    Ok(())
}

#[cfg(not(any(target_os = "linux", target_os = "android")))]
fn enable_fast_open_connect(_socket: &socket2::Socket) -> io::Result<()> {
    Err(io::Error::new(
        io::ErrorKind::Unsupported,
        "TCP Fast Open connect is not implemented on this platform",
    ))
}

/// Dial the resolved remote address, applying socket options and an
/// optional Fast Open attempt before handing back a `tokio` stream.
async fn dial_remote(
    remote_addr: SocketAddr,
    config: &ServerConfig,
) -> Result<TcpStream, SessionError> {
    let domain = match remote_addr {
        SocketAddr::V4(_) => socket2::Domain::IPV4,
        SocketAddr::V6(_) => socket2::Domain::IPV6,
    };
    let socket = socket2::Socket::new(domain, socket2::Type::STREAM, Some(socket2::Protocol::TCP))?;
    socket.set_nonblocking(true)?;
    configure_remote_socket(&socket, config)?;

    if config.fast_open {
        match enable_fast_open_connect(&socket) {
            Ok(()) => net_debug!("shadowsocks: TCP_FASTOPEN_CONNECT enabled"),
            Err(e) => log::warn!("shadowsocks: fast_open requested but unavailable: {e}"),
        }
    }

    let connect = async {
        match socket.connect(&remote_addr.into()) {
            Ok(()) => {}
            Err(e) if e.kind() == io::ErrorKind::WouldBlock || e.raw_os_error() == Some(libc::EINPROGRESS) => {}
            Err(e) => return Err(e),
        }
        let std_stream: std::net::TcpStream = socket.into();
        let stream = TcpStream::from_std(std_stream)?;
        stream.writable().await?;
        if let Some(e) = stream.take_error()? {
            return Err(e);
        }
        Ok(stream)
    };

    timeout(CONNECT_TIMEOUT, connect)
        .await
        .map_err(|_| SessionError::Io(io::Error::new(io::ErrorKind::TimedOut, "connect timeout")))?
        .map_err(SessionError::from)
}

/// Chunk `payload` at the maximum AEAD frame size and encode each piece.
fn encode_all(encoder: &mut ChunkEncoder, payload: &[u8]) -> Vec<u8> {
    let mut out = Vec::with_capacity(payload.len() + payload.len() / SHADOWSOCKS_MAX_CHUNK_SIZE + 32);
    for chunk in payload.chunks(SHADOWSOCKS_MAX_CHUNK_SIZE) {
        out.extend_from_slice(&encoder.encode_chunk(chunk));
    }
    out
}

/// Run one accepted local connection to completion: resolve and dial the
/// remote relay, perform the handshake, then shuttle ciphertext/plaintext
/// in both directions until either side closes or an error occurs.
pub async fn run(
    mut local: TcpStream,
    target: Address,
    config: Arc<ServerConfig>,
    resolver: Arc<Resolver>,
    remote_index: usize,
) -> Result<(), SessionError> {
    let mut stage = Stage::Init;
    net_trace!("shadowsocks: session {:?}, target={}", stage, target);

    stage = Stage::Handshake;
    net_trace!("shadowsocks: session stage {:?}", stage);

    // No TLS ClientHello/SNI sniffing is performed (out of scope for the
    // local-proxy/tunnel/redir paths this core supports); the stage is
    // retained for parity with the session data model and is a pass-through.
    stage = Stage::Sni;
    net_trace!("shadowsocks: session stage {:?}", stage);

    stage = Stage::Resolve;
    net_trace!("shadowsocks: session stage {:?}", stage);
    let remote_addr = resolve_remote(&config, &resolver, remote_index).await?;

    stage = Stage::Connect;
    net_trace!("shadowsocks: session stage {:?}, dialing {}", stage, remote_addr);
    let mut remote = dial_remote(remote_addr, &config).await?;
    net_debug!("shadowsocks: connected to relay {}", remote_addr);

    let key = master_key(&config);
    let kind = config.method;

    let mut send_salt = vec![0u8; kind.salt_len()];
    rand::thread_rng().fill_bytes(&mut send_salt);
    let send_subkey = crypto::derive_subkey(&key, &send_salt, kind.key_len());
    let mut encoder = ChunkEncoder::new(kind, &send_subkey);
    let mut decoder = ChunkDecoder::new(kind, key);

    let mut addr_frame = Vec::new();
    target.encode(&mut addr_frame);

    stage = Stage::Stream;
    net_trace!("shadowsocks: session stage {:?}", stage);
    remote.write_all(&send_salt).await?;
    remote.write_all(&encoder.encode_chunk(&addr_frame)).await?;

    let result = shuttle(&mut local, &mut remote, &mut encoder, &mut decoder, &config).await;

    stage = match &result {
        Ok(()) => Stage::Stop,
        Err(_) => Stage::Error,
    };
    net_trace!("shadowsocks: session ended in stage {:?}", stage);
    result
}

/// The bidirectional data shuttle: local plaintext <-> AEAD-framed remote
/// ciphertext, with an idle timer rearmed on every byte read from either
/// socket, and half-close propagation in both directions.
async fn shuttle(
    local: &mut TcpStream,
    remote: &mut TcpStream,
    encoder: &mut ChunkEncoder,
    decoder: &mut ChunkDecoder,
    config: &ServerConfig,
) -> Result<(), SessionError> {
    let mut local_buf = vec![0u8; 16 * 1024];
    let mut remote_buf = vec![0u8; 16 * 1024];
    let mut local_open = true;
    let mut remote_open = true;
    let mut nodelay_relaxed = false;

    loop {
        if !local_open && !remote_open {
            return Ok(());
        }

        tokio::select! {
            result = local.read(&mut local_buf), if local_open => {
                match result? {
                    0 => {
                        local_open = false;
                        remote.shutdown().await?;
                    }
                    n => {
                        let encoded = encode_all(encoder, &local_buf[..n]);
                        remote.write_all(&encoded).await?;
                    }
                }
            }
            result = remote.read(&mut remote_buf), if remote_open => {
                match result? {
                    0 => {
                        remote_open = false;
                        local.shutdown().await?;
                    }
                    n => {
                        match decoder.feed(&remote_buf[..n]) {
                            FeedResult::Ready(chunks) => {
                                for chunk in chunks {
                                    local.write_all(&chunk).await?;
                                }
                                if !nodelay_relaxed && !config.no_delay {
                                    let _ = local.set_nodelay(false);
                                    nodelay_relaxed = true;
                                }
                            }
                            FeedResult::NeedMore => {}
                            FeedResult::Error(e) => return Err(SessionError::Crypto(e)),
                        }
                    }
                }
            }
            _ = tokio::time::sleep(config.timeout), if local_open || remote_open => {
                return Err(SessionError::IdleTimeout);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn master_key_from_raw_key_passes_through() {
        let config = ServerConfig::new(
            "relay.example",
            8388,
            KeyMaterial::Key(vec![0xAA; CipherKind::ChaCha20IetfPoly1305.key_len()]),
        );
        assert_eq!(master_key(&config), vec![0xAA; 32]);
    }

    #[test]
    fn master_key_from_password_is_derived() {
        let config = ServerConfig::new(
            "relay.example",
            8388,
            KeyMaterial::Password("hunter2".to_string()),
        );
        let key = master_key(&config);
        assert_eq!(key.len(), config.method.key_len());
    }

    #[test]
    fn encode_all_splits_oversized_payload_into_multiple_chunks() {
        let kind = CipherKind::ChaCha20IetfPoly1305;
        let key = crypto::evp_bytes_to_key(b"pw", kind.key_len());
        let salt = vec![0u8; kind.salt_len()];
        let subkey = crypto::derive_subkey(&key, &salt, kind.key_len());
        let mut encoder = ChunkEncoder::new(kind, &subkey);

        let payload = vec![0x7Fu8; SHADOWSOCKS_MAX_CHUNK_SIZE + 10];
        let encoded = encode_all(&mut encoder, &payload);
        // Two chunks: each carries its own 2+tag length header and tag,
        // so the encoded size must exceed the raw payload length.
        assert!(encoded.len() > payload.len());
    }
}
