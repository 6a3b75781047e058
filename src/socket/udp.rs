use crate::iface::InterfaceInner;
use crate::phy::PacketMeta;
use crate::socket::PollAt;
use crate::storage::PacketBufferError;
use crate::wire::{IpAddress, IpEndpoint, IpListenEndpoint, IpProtocol, IpRepr, Ipv4Repr, UdpRepr};

/// A UDP packet ring buffer.
pub type PacketBuffer<'a> = crate::storage::PacketBuffer<'a, UdpMetadata>;

/// A UDP packet metadata.
pub type PacketMetadata = crate::storage::PacketMetadata<UdpMetadata>;

/// Metadata for a sent or received UDP packet.
#[derive(Debug, PartialEq, Eq, Clone, Copy)]
pub struct UdpMetadata {
    /// The IP endpoint from which an incoming datagram was received, or to which an outgoing
    /// datagram will be sent.
    pub endpoint: IpEndpoint,
    /// The IP address to which an incoming datagram was sent, or from which an outgoing datagram
    /// will be sent. Incoming datagrams always have this set. On outgoing datagrams, if it is not
    /// set, and the socket is not bound to a single address anyway, a suitable address will be
    /// determined using the algorithms of RFC 6724 (candidate source address selection) or some
    /// heuristic (for IPv4).
    pub local_address: Option<IpAddress>,
    pub meta: PacketMeta,
}

impl From<IpEndpoint> for UdpMetadata {
    fn from(endpoint: IpEndpoint) -> UdpMetadata {
        UdpMetadata {
            endpoint,
            local_address: None,
            meta: PacketMeta::default(),
        }
    }
}

/// Error returned by [`Socket::bind`]
#[derive(Debug)]
pub struct BindError;

/// Error returned by [`Socket::send`] and [`Socket::send_slice`]
#[derive(Debug)]
pub enum SendError {
    Unaddressable,
    BufferFull,
}

/// Error returned by [`Socket::recv`] and [`Socket::recv_slice`]
#[derive(Debug)]
pub enum RecvError {
    Exhausted,
}

impl From<PacketBufferError> for SendError {
    fn from(_: PacketBufferError) -> Self {
        SendError::BufferFull
    }
}

impl From<PacketBufferError> for RecvError {
    fn from(_: PacketBufferError) -> Self {
        RecvError::Exhausted
    }
}

/// A User Datagram Protocol socket.
///
/// A UDP socket is bound to a specific endpoint, and owns transmit and receive
/// packet buffers.
#[derive(Debug)]
pub struct Socket<'a> {
    endpoint: IpListenEndpoint,
    rx_buffer: PacketBuffer<'a>,
    tx_buffer: PacketBuffer<'a>,
    /// The time-to-live (IPv4) or hop limit (IPv6) value used in outgoing packets.
    hop_limit: Option<u8>,
}

impl<'a> Socket<'a> {
    /// Create an UDP socket with the given buffers.
    pub fn new(rx_buffer: PacketBuffer<'a>, tx_buffer: PacketBuffer<'a>) -> Socket<'a> {
        Socket {
            endpoint: IpListenEndpoint::default(),
            rx_buffer,
            tx_buffer,
            hop_limit: None,
        }
    }

    /// Return the bound endpoint.
    pub fn endpoint(&self) -> IpListenEndpoint {
        self.endpoint
    }

    /// Return whether the socket is open, i.e. bound to a port.
    pub fn is_open(&self) -> bool {
        self.endpoint.port != 0
    }

    /// Stop listening, closing the socket.
    pub fn close(&mut self) {
        self.endpoint = IpListenEndpoint::default();
        self.rx_buffer.reset();
        self.tx_buffer.reset();
    }

    /// Bind the socket to the given endpoint.
    ///
    /// This function returns an error if the port in the given endpoint is zero.
    pub fn bind<T: Into<IpListenEndpoint>>(&mut self, endpoint: T) -> Result<(), BindError> {
        let endpoint = endpoint.into();
        if endpoint.port == 0 {
            return Err(BindError);
        }

        self.endpoint = endpoint;

        self.rx_buffer.reset();
        self.tx_buffer.reset();

        Ok(())
    }

    /// Return the time-to-live (IPv4) or hop limit (IPv6) value used in outgoing packets.
    pub fn hop_limit(&self) -> Option<u8> {
        self.hop_limit
    }

    /// Set the time-to-live (IPv4) or hop limit (IPv6) value used in outgoing packets.
    ///
    /// A hop limit of 0 is invalid and will panic.
    pub fn set_hop_limit(&mut self, hop_limit: Option<u8>) {
        if hop_limit == Some(0) {
            panic!("the time-to-live value of a packet must not be zero")
        }

        self.hop_limit = hop_limit
    }

    /// Check whether the transmit buffer is full.
    pub fn can_send(&self) -> bool {
        !self.tx_buffer.is_full()
    }

    /// Check whether the receive buffer is not empty.
    pub fn can_recv(&self) -> bool {
        !self.rx_buffer.is_empty()
    }

    /// Enqueue a packet to be sent to a given remote endpoint, and return a pointer
    /// to its payload.
    pub fn send(&mut self, size: usize, meta: impl Into<UdpMetadata>) -> Result<&mut [u8], SendError> {
        let meta = meta.into();
        if meta.endpoint.addr.is_unspecified() {
            return Err(SendError::Unaddressable);
        }
        if meta.endpoint.port == 0 {
            return Err(SendError::Unaddressable);
        }

        Ok(self.tx_buffer.enqueue(size, meta)?)
    }

    /// Enqueue a packet to be sent to a given remote endpoint, and fill it from a slice.
    pub fn send_slice(&mut self, data: &[u8], meta: impl Into<UdpMetadata>) -> Result<(), SendError> {
        self.send(data.len(), meta)?.copy_from_slice(data);
        Ok(())
    }

    /// Dequeue a packet received from a remote endpoint, and return the endpoint as
    /// well as a pointer to the payload.
    pub fn recv(&mut self) -> Result<(&[u8], UdpMetadata), RecvError> {
        let (meta, payload) = self.rx_buffer.dequeue()?;
        Ok((payload, meta))
    }

    /// Dequeue a packet received from a remote endpoint, copy the payload into the
    /// given slice, and return the amount of octets copied as well as the endpoint.
    pub fn recv_slice(&mut self, data: &mut [u8]) -> Result<(usize, UdpMetadata), RecvError> {
        let (buffer, endpoint) = self.recv()?;
        let length = data.len().min(buffer.len());
        data[..length].copy_from_slice(&buffer[..length]);
        Ok((length, endpoint))
    }

    pub(crate) fn accepts(&self, cx: &mut InterfaceInner, ip_repr: &IpRepr, repr: &UdpRepr) -> bool {
        let _ = cx;
        if self.endpoint.port != repr.dst_port {
            return false;
        }
        if self.endpoint.addr.is_some()
            && self.endpoint.addr != Some(ip_repr.dst_addr())
            && !cx.is_broadcast(&ip_repr.dst_addr())
        {
            return false;
        }

        true
    }

    pub(crate) fn process(
        &mut self,
        cx: &mut InterfaceInner,
        meta: PacketMeta,
        ip_repr: &IpRepr,
        repr: &UdpRepr,
        payload: &[u8],
    ) {
        let _ = cx;
        net_trace!(
            "udp:{}:{}: receiving {} octets",
            repr.src_port,
            repr.dst_port,
            payload.len()
        );

        let metadata = UdpMetadata {
            endpoint: IpEndpoint::new(ip_repr.src_addr(), repr.src_port),
            local_address: Some(ip_repr.dst_addr()),
            meta,
        };

        match self.rx_buffer.enqueue(payload.len(), metadata) {
            Ok(buf) => buf.copy_from_slice(payload),
            Err(_) => net_trace!(
                "udp:{}:{}: buffer full, dropped incoming packet",
                repr.src_port,
                repr.dst_port
            ),
        }
    }

    pub(crate) fn dispatch<F, E>(&mut self, cx: &mut InterfaceInner, emit: F) -> Result<(), E>
    where
        F: FnOnce(&mut InterfaceInner, PacketMeta, (IpRepr, UdpRepr, &[u8])) -> Result<(), E>,
    {
        let hop_limit = self.hop_limit.unwrap_or(64);

        let res = self.tx_buffer.dequeue().and_then(|(meta, payload)| {
            let src_addr = match meta.local_address {
                Some(addr) => addr,
                None => cx
                    .get_source_address(&meta.endpoint.addr)
                    .ok_or(PacketBufferError::Exhausted)?,
            };

            match (src_addr, meta.endpoint.addr) {
                (IpAddress::Ipv4(src_addr), IpAddress::Ipv4(dst_addr)) => {
                    let repr = UdpRepr {
                        src_port: self.endpoint.port,
                        dst_port: meta.endpoint.port,
                    };
                    let ip_repr = IpRepr::Ipv4(Ipv4Repr {
                        src_addr,
                        dst_addr,
                        next_header: IpProtocol::Udp,
                        payload_len: repr.header_len() + payload.len(),
                        hop_limit,
                    });
                    Ok((meta.meta, ip_repr, repr, payload))
                }
                #[allow(unreachable_patterns)]
                _ => Err(PacketBufferError::Exhausted),
            }
        });

        match res {
            Ok((packet_meta, ip_repr, repr, payload)) => {
                net_trace!(
                    "udp:{}:{}: sending {} octets",
                    repr.src_port,
                    repr.dst_port,
                    payload.len()
                );
                emit(cx, packet_meta, (ip_repr, repr, payload))
            }
            Err(_) => Ok(()),
        }
    }

    pub(crate) fn poll_at(&self, _cx: &mut InterfaceInner) -> PollAt {
        if self.tx_buffer.is_empty() {
            PollAt::Ingress
        } else {
            PollAt::Now
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::PacketMetadata;
    use crate::wire::Ipv4Address;

    fn buffer(n: usize) -> PacketBuffer<'static> {
        PacketBuffer::new(
            (0..n).map(|_| PacketMetadata::EMPTY).collect::<Vec<_>>(),
            vec![0u8; n * 64],
        )
    }

    #[test]
    fn bind_then_accepts_matching_port() {
        let mut socket = Socket::new(buffer(1), buffer(1));
        socket.bind(12345u16).unwrap();
        assert!(socket.is_open());
        assert_eq!(socket.endpoint().port, 12345);
    }

    #[test]
    fn send_without_address_is_rejected() {
        let mut socket = Socket::new(buffer(1), buffer(1));
        socket.bind(12345u16).unwrap();
        let endpoint = IpEndpoint::new(IpAddress::Ipv4(Ipv4Address::new(0, 0, 0, 0)), 80);
        assert!(matches!(
            socket.send_slice(b"hi", endpoint),
            Err(SendError::Unaddressable)
        ));
    }
}
