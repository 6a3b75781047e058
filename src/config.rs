//! Compile-time capacity limits for the process-wide pools: every pool
//! (routes, neighbors, reassembly entries, sockets, SACK ranges) is bounded
//! so that a hostile peer cannot grow memory use without limit.

/// Maximum number of entries in a [`crate::iface::Routes`] table.
pub const IFACE_MAX_ROUTE_COUNT: usize = 4;

/// Maximum number of entries in the neighbor (ARP) cache.
pub const IFACE_NEIGHBOR_CACHE_COUNT: usize = 8;

/// Maximum number of IP addresses bound to one interface.
pub const IFACE_MAX_ADDR_COUNT: usize = 4;

/// Maximum number of in-flight IPv4 reassembly entries.
pub const REASSEMBLY_MAX_ENTRIES: usize = 4;

/// Maximum number of fragments buffered across all reassembly entries.
pub const REASSEMBLY_MAX_FRAGMENTS: usize = 64;

/// Seconds before an incomplete reassembly entry is abandoned
/// (`IP_REASS_MAXAGE`).
pub const REASSEMBLY_MAX_AGE_SECS: u8 = 15;

/// Number of receiver-side SACK ranges tracked per TCP PCB.
pub const TCP_MAX_SACK_BLOCKS: usize = 4;

/// Per-PCB cap, in bytes, on the out-of-order reassembly queue.
pub const TCP_OOO_QUEUE_BYTE_LIMIT: usize = 1 << 20;

/// Per-PCB cap on the number of discrete out-of-order segments queued.
pub const TCP_OOO_QUEUE_SEGMENT_LIMIT: usize = 128;

/// Maximum number of disjoint filled ranges the reassembly [`crate::storage::Assembler`]
/// tracks before it starts coalescing overlapping/adjacent inserts more eagerly.
pub const ASSEMBLER_MAX_SEGMENT_COUNT: usize = 32;

/// Coarse tick period driving retransmission, delayed ACK, persist and
/// keepalive timers.
pub const TCP_COARSE_TICK_MS: u64 = 500;

/// Slow tick period driving 2MSL and reassembly cleanup.
pub const TCP_SLOW_TICK_MS: u64 = 500;

/// Default listen backlog when not otherwise configured.
pub const TCP_DEFAULT_BACKLOG: usize = 16;

/// Low end of the ephemeral port range used for unbound UDP sockets.
pub const EPHEMERAL_PORT_START: u16 = 0xC000;
pub const EPHEMERAL_PORT_END: u16 = 0xFFFF;

/// Maximum number of relay endpoints round-robined by the Shadowsocks
/// tunnel.
pub const SHADOWSOCKS_MAX_REMOTE_NUM: usize = 10;

/// Maximum AEAD chunk payload size.
pub const SHADOWSOCKS_MAX_CHUNK_SIZE: usize = 0x3FFF;
