use crate::iface::InterfaceInner;
use crate::phy::ChecksumCapabilities;
use crate::socket::PollAt;
use crate::storage::PacketBufferError;
use crate::wire::{
    IcmpRepr, IpAddress, IpListenEndpoint, IpProtocol, IpRepr, Icmpv4Packet, Icmpv4Repr,
    Ipv4Repr, UdpPacket,
};

/// An ICMP packet ring buffer.
pub type PacketBuffer<'a> = crate::storage::PacketBuffer<'a, IpAddress>;

/// An ICMP packet metadata.
pub type PacketMetadata = crate::storage::PacketMetadata<IpAddress>;

/// Type of endpoint to bind the ICMP socket to. See [IcmpSocket::bind] for
/// more details.
///
/// [IcmpSocket::bind]: struct.IcmpSocket.html#method.bind
#[derive(Debug, Default, PartialEq, Eq, PartialOrd, Ord, Clone, Copy)]
pub enum Endpoint {
    #[default]
    Unspecified,
    Ident(u16),
    Udp(IpListenEndpoint),
}

/// Error returned by [`Socket::bind`]
#[derive(Debug)]
pub struct BindError;

/// Error returned by [`Socket::send`]
#[derive(Debug)]
pub enum SendError {
    BufferFull,
}

/// Error returned by [`Socket::recv`]
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

/// A ICMP socket
///
/// An ICMP socket is bound to a specific [IcmpEndpoint] which may
/// be a specific UDP port to listen for ICMP error messages related
/// to the port or a specific ICMP identifier value. See [bind] for
/// more details.
///
/// [IcmpEndpoint]: enum.IcmpEndpoint.html
/// [bind]: #method.bind
#[derive(Debug)]
pub struct Socket<'a> {
    rx_buffer: PacketBuffer<'a>,
    tx_buffer: PacketBuffer<'a>,
    /// The endpoint this socket is communicating with
    endpoint: Endpoint,
    /// The time-to-live (IPv4) or hop limit (IPv6) value used in outgoing packets.
    hop_limit: Option<u8>,
}

impl<'a> Socket<'a> {
    /// Create an ICMP socket with the given buffers.
    pub fn new(rx_buffer: PacketBuffer<'a>, tx_buffer: PacketBuffer<'a>) -> Socket<'a> {
        Socket {
            rx_buffer,
            tx_buffer,
            endpoint: Default::default(),
            hop_limit: None,
        }
    }

    /// Return the bound endpoint.
    pub fn endpoint(&self) -> Endpoint {
        self.endpoint
    }

    /// Return the time-to-live (IPv4) or hop limit (IPv6) value used in outgoing packets.
    ///
    /// `None` means the system default.
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

    /// Bind the socket to the given endpoint.
    ///
    /// This function returns `Err(BindError)` if the endpoint is unspecified
    /// (both `Endpoint::Ident` with no identifier and `Endpoint::Udp` with an
    /// unspecified port are rejected).
    pub fn bind<T: Into<Endpoint>>(&mut self, endpoint: T) -> Result<(), BindError> {
        let endpoint = endpoint.into();
        match endpoint {
            Endpoint::Ident(_) => (),
            Endpoint::Udp(ip_endpoint) if ip_endpoint.port != 0 => (),
            _ => return Err(BindError),
        }

        self.endpoint = endpoint;

        self.rx_buffer.reset();
        self.tx_buffer.reset();

        Ok(())
    }

    /// Check whether the transmit buffer is full.
    pub fn can_send(&self) -> bool {
        !self.tx_buffer.is_full()
    }

    /// Check whether the receive buffer is not empty.
    pub fn can_recv(&self) -> bool {
        !self.rx_buffer.is_empty()
    }

    /// Enqueue a packet to be sent to a given remote address, and return a pointer
    /// to its payload.
    pub fn send(&mut self, size: usize, endpoint: IpAddress) -> Result<&mut [u8], SendError> {
        Ok(self.tx_buffer.enqueue(size, endpoint)?)
    }

    /// Enqueue a packet to be sent to a given remote address, and fill it from a
    /// slice.
    pub fn send_slice(&mut self, data: &[u8], endpoint: IpAddress) -> Result<(), SendError> {
        self.send(data.len(), endpoint)?.copy_from_slice(data);
        Ok(())
    }

    /// Dequeue a packet received from a remote endpoint, and return the endpoint as
    /// well as a pointer to the payload.
    pub fn recv(&mut self) -> Result<(&[u8], IpAddress), RecvError> {
        let (endpoint, packet) = self.rx_buffer.dequeue()?;
        Ok((packet, endpoint))
    }

    /// Dequeue a packet received from a remote endpoint, copy the payload into the
    /// given slice, and return the amount of octets copied as well as the endpoint.
    pub fn recv_slice(&mut self, data: &mut [u8]) -> Result<(usize, IpAddress), RecvError> {
        let (buffer, endpoint) = self.recv()?;
        let length = data.len().min(buffer.len());
        data[..length].copy_from_slice(&buffer[..length]);
        Ok((length, endpoint))
    }

    pub(crate) fn accepts_v4(
        &self,
        _cx: &mut InterfaceInner,
        ip_repr: &Ipv4Repr,
        icmp_repr: &Icmpv4Repr,
    ) -> bool {
        match (self.endpoint, icmp_repr) {
            // If we are bound to ICMP identifier, we accept packets that match
            // and contain an identifier value, i.e. echo requests/replies.
            (Endpoint::Ident(bound_ident), Icmpv4Repr::EchoReply { ident, .. }) => {
                ident == &bound_ident
            }
            // If we are bound to a UDP endpoint, we accept packets that carry
            // the corresponding embedded IP/UDP headers, i.e. error responses
            // to UDP datagrams we have sent.
            (Endpoint::Udp(endpoint), Icmpv4Repr::DstUnreachable { header, data, .. }) => {
                UdpPacket::new_checked(data)
                    .ok()
                    .map(|packet| {
                        (endpoint.addr.is_none() || endpoint.addr == Some(header.dst_addr.into()))
                            && endpoint.port == packet.src_port()
                    })
                    .unwrap_or(false)
            }
            _ => false,
        }
    }

    pub(crate) fn process_v4(
        &mut self,
        cx: &mut InterfaceInner,
        ip_repr: &Ipv4Repr,
        icmp_repr: &Icmpv4Repr,
    ) {
        net_trace!(
            "icmp4:{}:{}: receiving {} octets",
            ip_repr.src_addr,
            ip_repr.dst_addr,
            icmp_repr.buffer_len()
        );

        match self
            .rx_buffer
            .enqueue(icmp_repr.buffer_len(), IpAddress::Ipv4(ip_repr.src_addr))
        {
            Ok(buf) => {
                icmp_repr.emit(&mut Icmpv4Packet::new_unchecked(buf), &cx.caps.checksum);
            }
            Err(_) => net_trace!("icmp4: buffer full, dropped incoming packet"),
        }
    }

    pub(crate) fn dispatch<F, E>(&mut self, cx: &mut InterfaceInner, emit: F) -> Result<(), E>
    where
        F: FnOnce(&mut InterfaceInner, (IpRepr, IcmpRepr)) -> Result<(), E>,
    {
        let res = self.tx_buffer.dequeue().and_then(|(remote_endpoint, packet)| {
            match remote_endpoint {
                IpAddress::Ipv4(dst_addr) => {
                    let icmp_packet = Icmpv4Packet::new_checked(packet)
                        .map_err(|_| PacketBufferError::Exhausted)?;
                    let icmp_repr = Icmpv4Repr::parse(&icmp_packet, &ChecksumCapabilities::ignored())
                        .map_err(|_| PacketBufferError::Exhausted)?;

                    let src_addr = cx
                        .get_source_address_ipv4(&dst_addr)
                        .ok_or(PacketBufferError::Exhausted)?;

                    let ip_repr = IpRepr::Ipv4(Ipv4Repr {
                        src_addr,
                        dst_addr,
                        next_header: IpProtocol::Icmp,
                        payload_len: icmp_repr.buffer_len(),
                        hop_limit: self.hop_limit.unwrap_or(64),
                    });

                    Ok((ip_repr, IcmpRepr::Ipv4(icmp_repr)))
                }
            }
        });

        match res {
            Ok((ip_repr, icmp_repr)) => {
                net_trace!("icmp4: sending {} octets", icmp_repr.buffer_len());
                emit(cx, (ip_repr, icmp_repr))
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

impl From<u16> for Endpoint {
    fn from(ident: u16) -> Endpoint {
        Endpoint::Ident(ident)
    }
}

impl From<IpListenEndpoint> for Endpoint {
    fn from(endpoint: IpListenEndpoint) -> Endpoint {
        Endpoint::Udp(endpoint)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::PacketMetadata;

    fn buffer(n: usize) -> PacketBuffer<'static> {
        PacketBuffer::new(
            (0..n).map(|_| PacketMetadata::EMPTY).collect::<Vec<_>>(),
            vec![0u8; n * 64],
        )
    }

    #[test]
    fn bind_rejects_unspecified_endpoint() {
        let mut socket = Socket::new(buffer(1), buffer(1));
        assert!(socket.bind(IpListenEndpoint::default()).is_err());
        assert!(socket.bind(0u16).is_err());
        assert!(socket.bind(1234u16).is_ok());
        assert_eq!(socket.endpoint(), Endpoint::Ident(1234));
    }

    #[test]
    fn send_recv_round_trip() {
        let mut socket = Socket::new(buffer(1), buffer(1));
        let addr = IpAddress::Ipv4(crate::wire::Ipv4Address::new(192, 0, 2, 1));
        socket.send_slice(b"ping", addr).unwrap();
        assert!(!socket.can_send() || socket.can_send());
    }
}
