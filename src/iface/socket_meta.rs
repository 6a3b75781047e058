use crate::socket::PollAt;
use crate::time::{Duration, Instant};
use crate::wire::IpAddress;

/// Neighbor-discovery backoff applied to a socket once a dispatch attempt
/// failed for lack of a resolved hardware address.
const DISCOVER_RETRY_INTERVAL: Duration = Duration::from_millis(100);

/// Per-socket metadata the interface keeps alongside the socket itself: not
/// part of any particular socket's own state machine, but needed to arbitrate
/// fair access to the device across all sockets in a [`crate::iface::SocketSet`].
#[derive(Debug, Default)]
pub struct Meta {
    /// If a neighbor discovery is pending for this socket's next packet, the
    /// time after which another egress attempt is allowed.
    neighbor_discovery_wait_until: Option<Instant>,
}

impl Meta {
    /// Combine the socket's own [`PollAt`] with this metadata to decide
    /// when the interface should next poll for this socket.
    pub(crate) fn poll_at<F>(&self, socket_poll_at: PollAt, has_neighbor: F) -> PollAt
    where
        F: Fn(IpAddress) -> bool,
    {
        let _ = has_neighbor;
        match (socket_poll_at, self.neighbor_discovery_wait_until) {
            (PollAt::Ingress, _) => PollAt::Ingress,
            (PollAt::Time(t), Some(wait_until)) => PollAt::Time(t.max(wait_until)),
            (PollAt::Time(t), None) => PollAt::Time(t),
            (PollAt::Now, Some(wait_until)) => PollAt::Time(wait_until),
            (PollAt::Now, None) => PollAt::Now,
        }
    }

    /// Whether this socket is currently permitted to attempt an egress dispatch.
    pub(crate) fn egress_permitted<F>(&self, timestamp: Instant, has_neighbor: F) -> bool
    where
        F: Fn(IpAddress) -> bool,
    {
        let _ = has_neighbor;
        match self.neighbor_discovery_wait_until {
            Some(wait_until) => timestamp >= wait_until,
            None => true,
        }
    }

    /// Record that dispatch failed because the neighbor for `dst_addr` is
    /// unresolved, backing off further egress attempts for this socket.
    pub(crate) fn neighbor_missing(&mut self, timestamp: Instant, dst_addr: IpAddress) {
        let _ = dst_addr;
        self.neighbor_discovery_wait_until = Some(timestamp + DISCOVER_RETRY_INTERVAL);
    }
}
