//! Raw IP sockets: an unfiltered (save for protocol number) view of every
//! datagram that crosses the interface, used by tools that need to see
//! whole IP packets rather than one transport protocol's payload.

use crate::iface::InterfaceInner;
use crate::phy::ChecksumCapabilities;
use crate::socket::PollAt;
use crate::storage::RingBuffer;
use crate::wire::{IpProtocol, IpRepr, IpVersion, Ipv4Packet, Ipv4Repr};

/// A buffer for raw IP packets, no per-packet metadata attached.
pub type PacketBuffer<'a> = crate::storage::PacketBuffer<'a, ()>;

/// A raw IP socket.
///
/// A raw socket is bound to a specific IP protocol, and owns transmit and
/// receive packet buffers of whole IP packets (header included).
#[derive(Debug)]
pub struct Socket<'a> {
    ip_version: IpVersion,
    ip_protocol: IpProtocol,
    rx_buffer: PacketBuffer<'a>,
    tx_buffer: PacketBuffer<'a>,
}

impl<'a> Socket<'a> {
    /// Create a raw IP socket bound to the given IP version and datagram protocol,
    /// with the given buffers.
    pub fn new(
        ip_version: IpVersion,
        ip_protocol: IpProtocol,
        rx_buffer: PacketBuffer<'a>,
        tx_buffer: PacketBuffer<'a>,
    ) -> Socket<'a> {
        Socket {
            ip_version,
            ip_protocol,
            rx_buffer,
            tx_buffer,
        }
    }

    /// Return the IP version the socket is bound to.
    pub fn ip_version(&self) -> IpVersion {
        self.ip_version
    }

    /// Return the IP protocol the socket is bound to.
    pub fn ip_protocol(&self) -> IpProtocol {
        self.ip_protocol
    }

    /// Check whether the transmit buffer is full.
    pub fn can_send(&self) -> bool {
        !self.tx_buffer.is_full()
    }

    /// Check whether the receive buffer is not empty.
    pub fn can_recv(&self) -> bool {
        !self.rx_buffer.is_empty()
    }

    /// Enqueue a packet to send, and return a pointer to its payload, including the
    /// IP header.
    pub fn send(&mut self, size: usize) -> Result<&mut [u8], crate::storage::PacketBufferError> {
        self.rx_buffer.reset();
        self.tx_buffer.enqueue(size, ())
    }

    /// Enqueue a packet to send, copying the whole (header-included) IP packet from
    /// the given slice.
    pub fn send_slice(&mut self, data: &[u8]) -> Result<(), crate::storage::PacketBufferError> {
        self.send(data.len())?.copy_from_slice(data);
        Ok(())
    }

    /// Dequeue a packet, and return a pointer to the payload, including the IP header.
    pub fn recv(&mut self) -> Result<&[u8], crate::storage::PacketBufferError> {
        let ((), packet) = self.rx_buffer.dequeue()?;
        Ok(packet)
    }

    /// Dequeue a packet, copying the whole (header-included) IP packet into the given slice.
    pub fn recv_slice(&mut self, data: &mut [u8]) -> Result<usize, crate::storage::PacketBufferError> {
        let buffer = self.recv()?;
        let length = data.len().min(buffer.len());
        data[..length].copy_from_slice(&buffer[..length]);
        Ok(length)
    }

    pub(crate) fn accepts(&self, ip_repr: &IpRepr) -> bool {
        match ip_repr {
            IpRepr::Ipv4(repr) => {
                self.ip_version == IpVersion::Ipv4 && repr.next_header == self.ip_protocol
            }
        }
    }

    pub(crate) fn process(&mut self, cx: &mut InterfaceInner, ip_repr: &IpRepr, payload: &[u8]) {
        let _ = cx;
        let header_len = ip_repr.header_len();
        let total_len = header_len + payload.len();

        match self.rx_buffer.enqueue(total_len, ()) {
            Ok(buf) => {
                ip_repr.emit(&mut buf[..header_len], &ChecksumCapabilities::ignored());
                buf[header_len..].copy_from_slice(payload);
                net_trace!("raw:{}: receiving {} octets", self.ip_protocol, total_len);
            }
            Err(_) => {
                net_trace!("raw: buffer full, dropped incoming packet");
            }
        }
    }

    pub(crate) fn dispatch<F, E>(&mut self, cx: &mut InterfaceInner, emit: F) -> Result<(), E>
    where
        F: FnOnce(&mut InterfaceInner, (IpRepr, &[u8])) -> Result<(), E>,
    {
        let _ = cx;
        let ip_protocol = self.ip_protocol;
        let ip_version = self.ip_version;
        let res = self.tx_buffer.dequeue().and_then(|((), packet)| {
            match ip_version {
                IpVersion::Ipv4 => {
                    let ipv4_packet = Ipv4Packet::new_checked(packet)
                        .map_err(|_| crate::storage::PacketBufferError::Exhausted)?;
                    let ipv4_repr = Ipv4Repr::parse(&ipv4_packet, &ChecksumCapabilities::ignored())
                        .map_err(|_| crate::storage::PacketBufferError::Exhausted)?;
                    debug_assert!(ipv4_repr.next_header == ip_protocol);
                    Ok((IpRepr::Ipv4(ipv4_repr), ipv4_packet.into_inner()))
                }
            }
        });

        match res {
            Ok((ip_repr, payload)) => {
                net_trace!("raw: sending {} octets", payload.len());
                emit(cx, (ip_repr, payload))
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

    fn buffer(n: usize) -> PacketBuffer<'static> {
        PacketBuffer::new(
            (0..n).map(|_| PacketMetadata::EMPTY).collect::<Vec<_>>(),
            vec![0u8; n * 64],
        )
    }

    #[test]
    fn socket_filters_by_protocol() {
        let socket = Socket::new(IpVersion::Ipv4, IpProtocol::Udp, buffer(4), buffer(4));
        let udp_repr = IpRepr::Ipv4(Ipv4Repr {
            src_addr: crate::wire::Ipv4Address::new(127, 0, 0, 1),
            dst_addr: crate::wire::Ipv4Address::new(127, 0, 0, 1),
            next_header: IpProtocol::Udp,
            payload_len: 0,
            hop_limit: 64,
        });
        assert!(socket.accepts(&udp_repr));

        let mut tcp_repr = udp_repr.clone();
        tcp_repr.set_payload_len(0);
        if let IpRepr::Ipv4(ref mut r) = tcp_repr {
            r.next_header = IpProtocol::Tcp;
        }
        assert!(!socket.accepts(&tcp_repr));
    }
}
