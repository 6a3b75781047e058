//! Network sockets.
//!
//! A socket is a buffered interface to an underlying OSI layer 4 (transport)
//! protocol, attached to a particular [`Interface`](crate::iface::Interface).
//! Every socket type, including RAW, ICMP, UDP and TCP, is driven the same
//! way: ingress packets are fed to it by the interface via `process`, egress
//! packets are pulled from it via `dispatch`, and `poll_at` tells the
//! interface when the socket next needs attention even with no packets
//! flowing in either direction (for retransmission, keep-alive, etc).

mod congestion;
pub mod icmp;
pub mod raw;
pub mod tcp;
pub mod udp;

use crate::iface::InterfaceInner;
use crate::time::Instant;

/// Gives an indication on the next time the socket should be polled.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PollAt {
    /// The socket needs to be polled immediately.
    Now,
    /// The socket needs to be polled at given [Instant][struct.Instant.html].
    Time(Instant),
    /// The socket does not need to be polled until there are external changes.
    Ingress,
}

/// A network socket.
///
/// This enumeration abstracts the various types of sockets based on the
/// IP protocol. Read the documentation on a particular socket type to learn
/// more about it.
#[derive(Debug)]
pub enum Socket<'a> {
    Raw(raw::Socket<'a>),
    Icmp(icmp::Socket<'a>),
    Udp(udp::Socket<'a>),
    Tcp(tcp::Socket<'a>),
}

impl<'a> Socket<'a> {
    pub(crate) fn poll_at(&self, cx: &mut InterfaceInner) -> PollAt {
        match self {
            Socket::Raw(s) => s.poll_at(cx),
            Socket::Icmp(s) => s.poll_at(cx),
            Socket::Udp(s) => s.poll_at(cx),
            Socket::Tcp(s) => s.poll_at(cx),
        }
    }
}

macro_rules! from_socket {
    ($variant:ident, $ty:ty) => {
        impl<'a> From<$ty> for Socket<'a> {
            fn from(socket: $ty) -> Self {
                Socket::$variant(socket)
            }
        }
    };
}

from_socket!(Raw, raw::Socket<'a>);
from_socket!(Icmp, icmp::Socket<'a>);
from_socket!(Udp, udp::Socket<'a>);
from_socket!(Tcp, tcp::Socket<'a>);

/// A trait for tracking a socket's associated handles (Rx/Tx tokens,
/// listening endpoints, ...), and downcasting a [`Socket`] to its concrete
/// type.
pub trait AnySocket<'a> {
    fn downcast(socket: &Socket<'a>) -> Option<&Self>
    where
        Self: Sized;
    fn downcast_mut(socket: &mut Socket<'a>) -> Option<&mut Self>
    where
        Self: Sized;
}

macro_rules! any_socket {
    ($variant:ident, $ty:ty) => {
        impl<'a> AnySocket<'a> for $ty {
            fn downcast(socket: &Socket<'a>) -> Option<&Self> {
                match socket {
                    Socket::$variant(socket) => Some(socket),
                    #[allow(unreachable_patterns)]
                    _ => None,
                }
            }

            fn downcast_mut(socket: &mut Socket<'a>) -> Option<&mut Self> {
                match socket {
                    Socket::$variant(socket) => Some(socket),
                    #[allow(unreachable_patterns)]
                    _ => None,
                }
            }
        }
    };
}

any_socket!(Raw, raw::Socket<'a>);
any_socket!(Icmp, icmp::Socket<'a>);
any_socket!(Udp, udp::Socket<'a>);
any_socket!(Tcp, tcp::Socket<'a>);
