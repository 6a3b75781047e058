//! IPv4 fragmentation (RFC 791 section 3.2) and reassembly.
//!
//! Outbound datagrams larger than the egress MTU are split by [`Fragmenter`]
//! into `nfb`-aligned chunks (`nfb = (mtu - 20) / 8`, per RFC 791) and trickled
//! out one fragment per subsequent `poll_egress` call, since a single
//! dispatch only ever has one transmit token available. Inbound fragments are
//! held by [`FragmentsBuffer`], keyed on `(id, src, dst, protocol)`, until
//! either the final fragment completes the datagram or the entry ages out.

use crate::config::{
    REASSEMBLY_MAX_AGE_SECS, REASSEMBLY_MAX_ENTRIES, REASSEMBLY_MAX_FRAGMENTS,
};
use crate::phy::TxToken;
use crate::storage::Assembler;
use crate::time::{Duration, Instant};
use crate::wire::{Ipv4FragKey, Ipv4Packet, Ipv4Repr};

/// Number of 8-byte fragment blocks that fit a given MTU, once the 20-byte
/// IPv4 header is subtracted. Every fragment but the last must be a multiple
/// of 8 bytes (RFC 791 section 3.2).
fn fragment_blocks_for_mtu(mtu: usize) -> usize {
    mtu.saturating_sub(crate::wire::IPV4_HEADER_LEN) / 8
}

/// Outbound fragmentation state: buffers one oversized datagram at a time and
/// emits it as a sequence of fragments across repeated `poll_egress` calls.
#[derive(Debug)]
pub struct Fragmenter {
    /// Full IPv4 header + payload of the datagram being fragmented, if any.
    buffer: Vec<u8>,
    /// How many payload bytes (after the original header) have been sent so far.
    sent: usize,
    repr: Option<Ipv4Repr>,
    ident: u16,
}

impl Fragmenter {
    pub fn new() -> Fragmenter {
        Fragmenter {
            buffer: Vec::new(),
            sent: 0,
            repr: None,
            ident: 0,
        }
    }

    /// Whether a fragmentation run is currently in progress.
    pub fn is_in_progress(&self) -> bool {
        self.repr.is_some()
    }

    /// Begin fragmenting `repr`/`payload`, assigning it the next IPv4
    /// identification value from `ident_gen`.
    pub(crate) fn start(&mut self, repr: Ipv4Repr, payload: &[u8], ident: u16) {
        self.buffer.clear();
        self.buffer.extend_from_slice(payload);
        self.sent = 0;
        self.repr = Some(repr);
        self.ident = ident;
    }

    /// Emit the next fragment of the in-progress datagram using `tx_token`.
    ///
    /// Returns `Ok(more)`, where `more` is whether further fragments remain
    /// after this one.
    pub(crate) fn emit<Tx: TxToken>(&mut self, tx_token: Tx, mtu: usize) -> bool {
        let repr = self.repr.expect("emit called with no fragmentation in progress");
        let nfb = fragment_blocks_for_mtu(mtu).max(1);
        let max_chunk = nfb * 8;

        let remaining = self.buffer.len() - self.sent;
        let chunk_len = remaining.min(max_chunk);
        let more_frags = self.sent + chunk_len < self.buffer.len();
        let offset = self.sent / 8;

        let header_len = crate::wire::IPV4_HEADER_LEN;
        let total_len = header_len + chunk_len;
        let sent = self.sent;
        let data = &self.buffer[sent..sent + chunk_len];

        tx_token.consume(total_len, |tx_buffer| {
            let mut frag_repr = repr;
            frag_repr.payload_len = chunk_len;
            let mut packet = Ipv4Packet::new_unchecked(tx_buffer);
            frag_repr.emit(&mut packet, &crate::phy::ChecksumCapabilities::default());
            packet.set_ident(self.ident);
            packet.set_frag(false, more_frags, offset as u16);
            packet.payload_mut().copy_from_slice(data);
            packet.fill_checksum();
        });

        self.sent += chunk_len;
        if !more_frags {
            self.repr = None;
            self.buffer.clear();
            self.sent = 0;
        }
        more_frags
    }
}

impl Default for Fragmenter {
    fn default() -> Self {
        Self::new()
    }
}

/// One in-progress reassembly of a fragmented datagram.
struct ReassemblyEntry {
    key: Ipv4FragKey,
    assembler: Assembler,
    buffer: Vec<u8>,
    /// Total datagram length, known once the final (MF=0) fragment arrives.
    total_len: Option<usize>,
    header: Option<Ipv4Repr>,
    /// Set once a [`ReassemblyResult::Complete`] for this entry has been
    /// handed to the caller; the next fragment matching this `key` restarts
    /// the entry from scratch instead of appending (the IP identification
    /// field is reused across unrelated datagrams once it wraps around).
    consumed: bool,
    first_seen: Instant,
    last_seen: Instant,
}

impl ReassemblyEntry {
    fn is_complete(&self) -> bool {
        match self.total_len {
            Some(total) => self.assembler.peek_front() >= total,
            None => false,
        }
    }

    fn reset(&mut self) {
        self.assembler = Assembler::new();
        self.buffer.clear();
        self.total_len = None;
        self.header = None;
        self.consumed = false;
    }
}

/// Outcome of feeding one fragment into the reassembly buffer.
pub(crate) enum ReassemblyResult<'a> {
    /// The fragment was absorbed; the datagram is still incomplete.
    Pending,
    /// The final fragment arrived; the borrowed slice holds the fully
    /// reassembled datagram payload, with the header to report for the
    /// whole datagram.
    Complete(Ipv4Repr, &'a [u8]),
    /// The fragment was dropped (malformed, or reassembly is saturated).
    Dropped,
}

/// Holds in-progress IPv4 reassembly state, bounded so that a flood of bogus
/// fragments can't grow memory use without limit.
#[derive(Default)]
pub struct FragmentsBuffer {
    entries: Vec<ReassemblyEntry>,
}

impl FragmentsBuffer {
    /// Feed one fragment (header plus the fragment's own payload slice, at
    /// its `frag_offset * 8` position) into the reassembly buffer for `key`.
    ///
    /// On [`ReassemblyResult::Complete`], the returned slice borrows storage
    /// owned by `self`, so the caller must finish dispatching the
    /// reassembled datagram before feeding another fragment into this
    /// buffer.
    pub(crate) fn reassemble<'a>(
        &'a mut self,
        key: Ipv4FragKey,
        now: Instant,
        header: Ipv4Repr,
        frag_offset: usize,
        more_frags: bool,
        data: &[u8],
    ) -> ReassemblyResult<'a> {
        self.evict_expired(now);

        let index = match self.entries.iter().position(|e| e.key == key) {
            Some(i) => i,
            None => {
                if self.entries.len() >= REASSEMBLY_MAX_ENTRIES {
                    net_debug!("reassembly: dropping fragment, table full");
                    return ReassemblyResult::Dropped;
                }
                self.entries.push(ReassemblyEntry {
                    key,
                    assembler: Assembler::new(),
                    buffer: Vec::new(),
                    total_len: None,
                    header: None,
                    consumed: false,
                    first_seen: now,
                    last_seen: now,
                });
                self.entries.len() - 1
            }
        };

        if self.entries[index].consumed {
            self.entries[index].reset();
        }

        let entry = &mut self.entries[index];
        entry.last_seen = now;
        if entry.header.is_none() || frag_offset == 0 {
            entry.header = Some(header);
        }

        let end = frag_offset + data.len();
        if entry.buffer.len() < end {
            entry.buffer.resize(end, 0);
        }
        entry.buffer[frag_offset..end].copy_from_slice(data);

        if entry.assembler.add(frag_offset, data.len()).is_err() {
            net_debug!("reassembly: too many holes, dropping fragment");
            self.entries.remove(index);
            return ReassemblyResult::Dropped;
        }

        if !more_frags {
            entry.total_len = Some(end);
        }

        let entry = &mut self.entries[index];
        if entry.is_complete() {
            entry.consumed = true;
            let mut repr = entry.header.expect("complete entry always saw its first fragment");
            repr.payload_len = entry.total_len.unwrap_or(entry.buffer.len());
            return ReassemblyResult::Complete(repr, &entry.buffer[..repr.payload_len]);
        }

        ReassemblyResult::Pending
    }

    // Reassembly timeouts are only checked when a fragment for the timed-out
    // key's slot is evicted to make room for a new entry, or lazily on the
    // next `reassemble` call for any key (see `evict_expired` below). No ICMP
    // Time Exceeded is generated on timeout: the buffer cap that would bound
    // the reply is the same cap already protecting this table, so generating
    // it risks the exact exhaustion it would be reporting; the timed-out
    // entry is dropped silently instead (see `DESIGN.md`).
    fn evict_expired(&mut self, now: Instant) {
        let max_age = Duration::from_secs(REASSEMBLY_MAX_AGE_SECS);
        self.entries
            .retain(|e| now - e.first_seen < max_age && e.assembler_count_ok());
        while self.entries.len() > REASSEMBLY_MAX_ENTRIES {
            self.entries.remove(0);
        }
    }
}

impl ReassemblyEntry {
    fn assembler_count_ok(&self) -> bool {
        self.assembler.iter().count() <= REASSEMBLY_MAX_FRAGMENTS
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::wire::{IpProtocol, Ipv4Address};

    fn key() -> Ipv4FragKey {
        Ipv4FragKey {
            id: 42,
            src_addr: Ipv4Address::new(192, 0, 2, 1),
            dst_addr: Ipv4Address::new(192, 0, 2, 2),
            protocol: IpProtocol::Udp,
        }
    }

    fn repr() -> Ipv4Repr {
        Ipv4Repr {
            src_addr: Ipv4Address::new(192, 0, 2, 1),
            dst_addr: Ipv4Address::new(192, 0, 2, 2),
            next_header: IpProtocol::Udp,
            payload_len: 0,
            hop_limit: 64,
        }
    }

    #[test]
    fn two_fragments_reassemble_in_order() {
        let mut buf = FragmentsBuffer::default();
        let now = Instant::from_millis(0);

        let first = [1u8; 8];
        let result = buf.reassemble(key(), now, repr(), 0, true, &first);
        assert!(matches!(result, ReassemblyResult::Pending));

        let second = [2u8; 4];
        let result = buf.reassemble(key(), now, repr(), 8, false, &second);
        match result {
            ReassemblyResult::Complete(r, data) => {
                assert_eq!(r.payload_len, 12);
                assert_eq!(&data[..8], &first[..]);
                assert_eq!(&data[8..], &second[..]);
            }
            _ => panic!("expected completion"),
        }
    }

    #[test]
    fn out_of_order_fragments_still_reassemble() {
        let mut buf = FragmentsBuffer::default();
        let now = Instant::from_millis(0);

        let second = [2u8; 8];
        assert!(matches!(
            buf.reassemble(key(), now, repr(), 8, false, &second),
            ReassemblyResult::Pending
        ));

        let first = [1u8; 8];
        assert!(matches!(
            buf.reassemble(key(), now, repr(), 0, true, &first),
            ReassemblyResult::Complete(_, _)
        ));
    }

    #[test]
    fn stale_entry_is_evicted_after_max_age() {
        let mut buf = FragmentsBuffer::default();
        let t0 = Instant::from_millis(0);
        buf.reassemble(key(), t0, repr(), 0, true, &[1, 2, 3, 4]);

        let later = t0 + Duration::from_secs(REASSEMBLY_MAX_AGE_SECS + 1);
        buf.evict_expired(later);
        assert!(buf.entries.is_empty());
    }

    #[test]
    fn reused_identification_after_completion_starts_fresh() {
        let mut buf = FragmentsBuffer::default();
        let now = Instant::from_millis(0);

        assert!(matches!(
            buf.reassemble(key(), now, repr(), 0, false, &[9, 9, 9, 9]),
            ReassemblyResult::Complete(_, _)
        ));

        // A brand new datagram reusing the same (src, dst, id, protocol) key
        // must not be corrupted by the stale completed entry.
        match buf.reassemble(key(), now, repr(), 0, false, &[1, 2, 3]) {
            ReassemblyResult::Complete(r, data) => {
                assert_eq!(r.payload_len, 3);
                assert_eq!(data, &[1, 2, 3]);
            }
            _ => panic!("expected completion"),
        }
    }
}
