use heapless::LinearMap;

use crate::config::IFACE_NEIGHBOR_CACHE_COUNT;
use crate::time::{Duration, Instant};
use crate::wire::{HardwareAddress, IpAddress};

/// Neighbor cache entry lifetime, akin to Neighbor Unreachability Detection's
/// REACHABLE_TIME, though without the full NUD state machine.
const ENTRY_LIFETIME: Duration = Duration::from_secs(60);

/// Minimum interval between two neighbor discovery requests for the same
/// destination, so an unreachable host does not get ARP-flooded.
const SILENT_TIME: Duration = Duration::from_millis(1000);

/// Answer from [`Cache::lookup`].
#[derive(Debug, PartialEq, Eq, Clone, Copy)]
pub enum Answer {
    /// The neighbor's hardware address is in the cache.
    Found(HardwareAddress),
    /// The neighbor is not in the cache, and discovery has been rate-limited:
    /// the caller should not send another discovery request yet.
    RateLimited,
    /// The neighbor is not in the cache; the caller may send a discovery
    /// request.
    NotFound,
}

impl Answer {
    /// Query whether this represents a `Found` answer.
    pub fn found(&self) -> bool {
        matches!(self, Answer::Found(_))
    }
}

/// A neighbor cache backed by a map.
#[derive(Debug)]
pub struct Cache {
    storage: LinearMap<IpAddress, Neighbor, IFACE_NEIGHBOR_CACHE_COUNT>,
    silent_until: Instant,
}

impl Cache {
    /// Create a cache.
    pub fn new() -> Self {
        Self {
            storage: LinearMap::new(),
            silent_until: Instant::from_millis(0),
        }
    }

    /// Record a mapping from `protocol_addr` to `hardware_addr`, valid until
    /// `timestamp + ENTRY_LIFETIME`.
    pub fn fill(&mut self, protocol_addr: IpAddress, hardware_addr: HardwareAddress, timestamp: Instant) {
        if protocol_addr.is_unspecified() {
            return;
        }

        let expires_at = timestamp + ENTRY_LIFETIME;
        match self.storage.get_mut(&protocol_addr) {
            Some(neighbor) => {
                neighbor.hardware_addr = hardware_addr;
                neighbor.expires_at = expires_at;
                return;
            }
            None => {
                if self.storage.len() < self.storage.capacity() {
                    self.storage
                        .insert(
                            protocol_addr,
                            Neighbor {
                                hardware_addr,
                                expires_at,
                            },
                        )
                        .ok();
                    return;
                }
            }
        }

        // The map is full: evict the entry expiring soonest.
        if let Some((&oldest_addr, _)) = self
            .storage
            .iter()
            .min_by_key(|(_, neighbor)| neighbor.expires_at)
        {
            self.storage.remove(&oldest_addr);
            self.storage
                .insert(
                    protocol_addr,
                    Neighbor {
                        hardware_addr,
                        expires_at,
                    },
                )
                .ok();
        }
    }

    /// If `protocol_addr` is already in the cache, refresh its expiry and
    /// hardware address; otherwise do nothing. Used for passively learning
    /// neighbors from unsolicited traffic (e.g. gratuitous ARP) without
    /// growing the cache unboundedly.
    pub fn reset_expiry_if_existing(
        &mut self,
        protocol_addr: IpAddress,
        hardware_addr: HardwareAddress,
        timestamp: Instant,
    ) {
        if let Some(neighbor) = self.storage.get_mut(&protocol_addr) {
            neighbor.hardware_addr = hardware_addr;
            neighbor.expires_at = timestamp + ENTRY_LIFETIME;
        }
    }

    /// Look up the hardware address for `protocol_addr`.
    pub fn lookup(&self, protocol_addr: &IpAddress, timestamp: Instant) -> Answer {
        if let Some(neighbor) = self.storage.get(protocol_addr) {
            if neighbor.expires_at >= timestamp {
                return Answer::Found(neighbor.hardware_addr);
            }
        }

        if timestamp < self.silent_until {
            Answer::RateLimited
        } else {
            Answer::NotFound
        }
    }

    /// Mark the cache as silent (no new discovery requests should be sent)
    /// until `timestamp + SILENT_TIME`.
    pub fn limit_rate(&mut self, timestamp: Instant) {
        self.silent_until = timestamp + SILENT_TIME;
    }

    pub(crate) fn flush(&mut self) {
        self.storage.clear()
    }
}

impl Default for Cache {
    fn default() -> Self {
        Self::new()
    }
}

/// A cached neighbor.
///
/// A neighbor mapping translates from a protocol address to a hardware address,
/// and contains the timestamp past which the mapping should be discarded.
#[derive(Debug, Clone, Copy)]
pub struct Neighbor {
    hardware_addr: HardwareAddress,
    expires_at: Instant,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn hw(n: u8) -> HardwareAddress {
        HardwareAddress::Ethernet(crate::wire::EthernetAddress::new([n; 6]))
    }

    #[test]
    fn fill_then_lookup_finds_entry() {
        let mut cache = Cache::new();
        let addr = IpAddress::v4(192, 168, 1, 1);
        cache.fill(addr, hw(1), Instant::from_secs(0));
        assert_eq!(
            cache.lookup(&addr, Instant::from_secs(1)),
            Answer::Found(hw(1))
        );
    }

    #[test]
    fn expired_entry_is_not_found() {
        let mut cache = Cache::new();
        let addr = IpAddress::v4(192, 168, 1, 1);
        cache.fill(addr, hw(1), Instant::from_secs(0));
        let later = Instant::from_secs(0) + ENTRY_LIFETIME + Duration::from_secs(1);
        assert_eq!(cache.lookup(&addr, later), Answer::NotFound);
    }

    #[test]
    fn limit_rate_causes_rate_limited_answer() {
        let mut cache = Cache::new();
        let addr = IpAddress::v4(192, 168, 1, 2);
        cache.limit_rate(Instant::from_secs(0));
        assert_eq!(cache.lookup(&addr, Instant::from_millis(500)), Answer::RateLimited);
    }
}
