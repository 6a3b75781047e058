use core::fmt;

use super::RingBuffer;

/// Error returned by packet buffer operations.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Error {
    /// There is no room in the buffer for a packet of the requested size,
    /// or the metadata ring is full.
    Exhausted,
    /// The requested operation cannot be completed because the buffer
    /// contains no datagram metadata to act on.
    Truncated,
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            Error::Exhausted => write!(f, "exhausted"),
            Error::Truncated => write!(f, "truncated"),
        }
    }
}

/// Metadata for a single datagram queued in a [`PacketBuffer`].
///
/// `header` carries per-protocol routing information (e.g. the UDP peer
/// endpoint, or the ICMP identifying address) alongside the byte range it
/// tags in the payload ring. A padding entry (`header: None`) marks the
/// bytes skipped when a datagram would otherwise wrap past the end of the
/// payload ring's backing storage.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PacketMetadata<H> {
    size: usize,
    header: Option<H>,
}

impl<H> PacketMetadata<H> {
    /// Empty packet description used to fill the metadata ring's storage.
    pub const EMPTY: PacketMetadata<H> = PacketMetadata {
        size: 0,
        header: None,
    };

    fn padding(size: usize) -> PacketMetadata<H> {
        PacketMetadata { size, header: None }
    }

    fn packet(size: usize, header: H) -> PacketMetadata<H> {
        PacketMetadata {
            size,
            header: Some(header),
        }
    }

    fn is_padding(&self) -> bool {
        self.header.is_none()
    }
}

/// A ring buffer that queues discrete, header-tagged datagrams over a
/// contiguous byte buffer shared between all of them.
#[derive(Debug)]
pub struct PacketBuffer<'a, H> {
    metadata_ring: RingBuffer<'a, PacketMetadata<H>>,
    payload_ring: RingBuffer<'a, u8>,
}

impl<'a, H> PacketBuffer<'a, H> {
    /// Create a new packet buffer with the given metadata and payload storage.
    pub fn new<MS, PS>(metadata_storage: MS, payload_storage: PS) -> PacketBuffer<'a, H>
    where
        MS: Into<managed::ManagedSlice<'a, PacketMetadata<H>>>,
        PS: Into<managed::ManagedSlice<'a, u8>>,
    {
        PacketBuffer {
            metadata_ring: RingBuffer::new(metadata_storage),
            payload_ring: RingBuffer::new(payload_storage),
        }
    }

    /// Reset the packet buffer, discarding all queued datagrams.
    pub fn reset(&mut self) {
        self.metadata_ring.clear();
        self.payload_ring.clear();
    }

    /// Query whether the buffer holds no datagrams.
    pub fn is_empty(&self) -> bool {
        self.metadata_ring.is_empty()
    }

    /// Query whether the buffer cannot accept any more datagrams of any size.
    pub fn is_full(&self) -> bool {
        self.metadata_ring.is_full()
    }

    /// Enqueue a new datagram of `size` bytes tagged with `header`, and
    /// return a mutable slice to write the payload into.
    ///
    /// Fails with `Exhausted` rather than splitting a datagram's payload
    /// across the end of the backing storage: the caller should retry once
    /// room has been freed by dequeuing older datagrams.
    pub fn enqueue(&mut self, size: usize, header: H) -> Result<&mut [u8], Error> {
        if self.payload_ring.capacity() < size {
            return Err(Error::Truncated);
        }
        if self.payload_ring.window() < size {
            return Err(Error::Exhausted);
        }

        if self.metadata_ring.is_full() {
            return Err(Error::Exhausted);
        }

        let payload = self.payload_ring.enqueue_many(size);
        if payload.len() < size {
            return Err(Error::Exhausted);
        }

        *self.metadata_ring.enqueue_one().expect("checked above") =
            PacketMetadata::packet(size, header);
        Ok(payload)
    }

    /// Dequeue the oldest datagram, returning its header and payload.
    pub fn dequeue(&mut self) -> Result<(H, &[u8]), Error> {
        loop {
            let meta = *self.metadata_ring.dequeue_one().map_err(|_| Error::Exhausted)?;
            let payload = self.payload_ring.dequeue_many(meta.size);
            match meta.header {
                Some(header) => return Ok((header, payload)),
                None => continue,
            }
        }
    }

    /// Peek at the oldest datagram without dequeueing it.
    ///
    /// Padding entries (there are none in current use, since `enqueue` never
    /// wraps a datagram's payload around the ring) are skipped defensively.
    pub fn peek(&mut self) -> Result<(&H, &[u8]), Error> {
        let size = loop {
            let meta = self
                .metadata_ring
                .get_allocated(0, 1)
                .first()
                .copied()
                .ok_or(Error::Exhausted)?;
            if !meta.is_padding() {
                break meta.size;
            }
            self.metadata_ring.dequeue_one().ok();
            self.payload_ring.dequeue_many(meta.size);
        };

        let header = self.metadata_ring.get_allocated(0, 1)[0]
            .header
            .as_ref()
            .expect("checked non-padding above");
        let payload = self.payload_ring.get_allocated(0, size);
        Ok((header, payload))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn enqueue_then_dequeue_round_trips() {
        let mut meta_storage = vec![PacketMetadata::<u32>::EMPTY; 4];
        let mut payload_storage = vec![0u8; 16];
        let mut buf = PacketBuffer::new(&mut meta_storage[..], &mut payload_storage[..]);
        assert!(buf.is_empty());
        buf.enqueue(3, 42).unwrap().copy_from_slice(b"abc");
        let (header, payload) = buf.dequeue().unwrap();
        assert_eq!(header, 42);
        assert_eq!(payload, b"abc");
        assert!(buf.is_empty());
    }
}
