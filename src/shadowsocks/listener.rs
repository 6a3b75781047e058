//! The accept loop: binds the local listener, round-robins remote relay
//! selection across accepted connections, and tracks every in-flight
//! session so shutdown can tear them all down at once.
//!
//! A C event-loop client would keep sessions on a process-wide intrusive
//! linked list so a shutdown signal handler can walk it and close every
//! socket. Rust ownership makes an intrusive list both unsafe and
//! unnecessary here; this crate keeps a `tokio::sync::Mutex`-guarded
//! `HashMap` of session ids to `JoinHandle`s instead (see `DESIGN.md`).

use std::collections::HashMap;
use std::io;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;

use tokio::net::TcpListener;
use tokio::sync::Mutex;
use tokio::task::JoinHandle;

use super::address::Address;
use super::config::ServerConfig;
use super::resolver::Resolver;
use super::session;

type Registry = Arc<Mutex<HashMap<u64, JoinHandle<()>>>>;

/// A running listener. Dropping this does not stop the listener; call
/// [`Handle::shutdown`] for that (an explicit `ev_break`/session-list style
/// teardown rather than relying on `Drop`, so a caller can choose to keep
/// the tunnel running after the handle that started it goes out of scope).
pub struct Handle {
    accept_task: JoinHandle<()>,
    sessions: Registry,
}

impl Handle {
    /// Stop accepting new connections and close every in-flight session.
    pub async fn shutdown(&self) {
        self.accept_task.abort();
        let mut sessions = self.sessions.lock().await;
        for (_, handle) in sessions.drain() {
            handle.abort();
        }
    }

    /// Number of sessions currently being shuttled.
    pub async fn active_sessions(&self) -> usize {
        self.sessions.lock().await.len()
    }
}

/// Bind the configured local listener and start accepting connections.
/// Returns immediately once the listener is bound; the accept loop runs
/// as its own background task.
pub async fn run(config: ServerConfig) -> io::Result<Handle> {
    let config = Arc::new(config);
    let local_addr = config.local_socket_addr();

    let listener = bind_listener(local_addr, config.reuse_port)?;
    net_debug!("shadowsocks: listening on {}", local_addr);

    let resolver = Arc::new(Resolver::new(config.nameserver));
    let sessions: Registry = Arc::new(Mutex::new(HashMap::new()));
    let next_session_id = Arc::new(AtomicU64::new(0));
    let remote_cursor = Arc::new(AtomicUsize::new(0));

    let accept_sessions = sessions.clone();
    let accept_task = tokio::spawn(accept_loop(
        listener,
        config,
        resolver,
        accept_sessions,
        next_session_id,
        remote_cursor,
    ));

    Ok(Handle {
        accept_task,
        sessions,
    })
}

fn bind_listener(addr: std::net::SocketAddr, reuse_port: bool) -> io::Result<TcpListener> {
    let domain = match addr {
        std::net::SocketAddr::V4(_) => socket2::Domain::IPV4,
        std::net::SocketAddr::V6(_) => socket2::Domain::IPV6,
    };
    let socket = socket2::Socket::new(domain, socket2::Type::STREAM, Some(socket2::Protocol::TCP))?;
    socket.set_reuse_address(true)?;
    #[cfg(unix)]
    if reuse_port {
        socket.set_reuse_port(true)?;
    }
    #[cfg(not(unix))]
    let _ = reuse_port;
    socket.set_nonblocking(true)?;
    socket.bind(&addr.into())?;
    socket.listen(crate::config::TCP_DEFAULT_BACKLOG as i32)?;
    let std_listener: std::net::TcpListener = socket.into();
    TcpListener::from_std(std_listener)
}

async fn accept_loop(
    listener: TcpListener,
    config: Arc<ServerConfig>,
    resolver: Arc<Resolver>,
    sessions: Registry,
    next_session_id: Arc<AtomicU64>,
    remote_cursor: Arc<AtomicUsize>,
) {
    loop {
        let (stream, peer) = match listener.accept().await {
            Ok(accepted) => accepted,
            Err(e) => {
                log::warn!("shadowsocks: accept failed: {e}");
                continue;
            }
        };

        let target = match target_for_accepted_connection(&config) {
            Some(target) => target,
            None => {
                log::warn!(
                    "shadowsocks: connection from {peer} has no resolvable target \
                     (SOCKS5/redir destination decoding is provided by the surrounding \
                     application, not this core); dropping"
                );
                continue;
            }
        };

        let _ = stream.set_nodelay(true);

        let id = next_session_id.fetch_add(1, Ordering::Relaxed);
        let remote_index = remote_cursor.fetch_add(1, Ordering::Relaxed);

        let config = config.clone();
        let resolver = resolver.clone();
        let sessions_for_task = sessions.clone();

        let handle = tokio::spawn(async move {
            if let Err(e) = session::run(stream, target, config, resolver, remote_index).await {
                net_debug!("shadowsocks: session {} ({}) ended: {}", id, peer, e);
            }
            sessions_for_task.lock().await.remove(&id);
        });

        sessions.lock().await.insert(id, handle);
    }
}

/// Determine the session target for an accepted connection. Only tunnel
/// mode's statically configured target is decided inside this core; local-
/// proxy SOCKS5 request decoding and redirected-TCP `SO_ORIGINAL_DST`
/// lookup are external collaborators and are not implemented here.
fn target_for_accepted_connection(config: &ServerConfig) -> Option<Address> {
    config
        .tunnel_address
        .as_ref()
        .map(|(host, port)| Address::from_host_port(host, *port))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::shadowsocks::config::KeyMaterial;

    #[test]
    fn target_resolution_uses_tunnel_address_when_configured() {
        let mut config = ServerConfig::new("relay.example", 8388, KeyMaterial::Password("x".into()));
        config.tunnel_address = Some(("10.0.0.5".to_string(), 80));
        let target = target_for_accepted_connection(&config).unwrap();
        assert_eq!(target, Address::from_host_port("10.0.0.5", 80));
    }

    #[test]
    fn target_resolution_is_none_without_tunnel_address() {
        let config = ServerConfig::new("relay.example", 8388, KeyMaterial::Password("x".into()));
        assert!(target_for_accepted_connection(&config).is_none());
    }
}
