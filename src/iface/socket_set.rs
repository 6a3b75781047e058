use core::marker::PhantomData;

use crate::socket::Socket;

use super::socket_meta::Meta;

/// An item of a socket set.
#[derive(Debug)]
pub struct Item {
    pub meta: Meta,
    pub socket: Socket,
}

/// A handle, identifying a socket in an Interface.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct SocketHandle(usize);

impl core::fmt::Display for SocketHandle {
    fn fmt(&self, f: &mut core::fmt::Formatter) -> core::fmt::Result {
        write!(f, "#{}", self.0)
    }
}

enum Slot {
    Empty,
    Filled(Item),
}

/// An extensible set of sockets, with stable numeric handles tied to an Interface.
///
/// Mirrors smoltcp's design: a slab of optional slots so that removing a
/// socket doesn't disturb the handles of the sockets that remain.
#[derive(Debug, Default)]
pub struct SocketSet<'a> {
    sockets: Vec<Slot>,
    _lifetime: PhantomData<&'a ()>,
}

impl<'a> SocketSet<'a> {
    /// Create a socket set using the provided storage.
    pub fn new() -> SocketSet<'a> {
        SocketSet {
            sockets: Vec::new(),
            _lifetime: PhantomData,
        }
    }

    /// Add a socket to the set, and return its handle.
    pub fn add<T: Into<Socket>>(&mut self, socket: T) -> SocketHandle {
        let socket = socket.into();
        let item = Item {
            meta: Meta::default(),
            socket,
        };

        for (index, slot) in self.sockets.iter_mut().enumerate() {
            if let Slot::Empty = slot {
                *slot = Slot::Filled(item);
                return SocketHandle(index);
            }
        }

        let index = self.sockets.len();
        self.sockets.push(Slot::Filled(item));
        SocketHandle(index)
    }

    /// Get a socket from the set by its handle, as mutable.
    pub fn get_mut<T: crate::socket::AnySocket<'a>>(&mut self, handle: SocketHandle) -> &mut T {
        match &mut self.sockets[handle.0] {
            Slot::Filled(item) => {
                T::downcast_mut(&mut item.socket).expect("handle refers to a socket of a wrong type")
            }
            Slot::Empty => panic!("handle does not refer to a valid socket"),
        }
    }

    /// Get a socket from the set by its handle, as immutable.
    pub fn get<T: crate::socket::AnySocket<'a>>(&self, handle: SocketHandle) -> &T {
        match &self.sockets[handle.0] {
            Slot::Filled(item) => {
                T::downcast(&item.socket).expect("handle refers to a socket of a wrong type")
            }
            Slot::Empty => panic!("handle does not refer to a valid socket"),
        }
    }

    /// Remove a socket from the set, without changing its other handles.
    pub fn remove(&mut self, handle: SocketHandle) -> Socket {
        match core::mem::replace(&mut self.sockets[handle.0], Slot::Empty) {
            Slot::Filled(item) => item.socket,
            Slot::Empty => panic!("handle does not refer to a valid socket"),
        }
    }

    /// Get an iterator to the inner sockets.
    pub fn iter(&self) -> impl Iterator<Item = (SocketHandle, &Socket)> {
        self.sockets.iter().enumerate().filter_map(|(index, slot)| {
            if let Slot::Filled(item) = slot {
                Some((SocketHandle(index), &item.socket))
            } else {
                None
            }
        })
    }

    /// Get a mutable iterator to the inner sockets.
    pub fn iter_mut(&mut self) -> impl Iterator<Item = (SocketHandle, &mut Socket)> {
        self.sockets.iter_mut().enumerate().filter_map(|(index, slot)| {
            if let Slot::Filled(item) = slot {
                Some((SocketHandle(index), &mut item.socket))
            } else {
                None
            }
        })
    }

    /// Get an iterator to the set's items, as `(handle, &Item)`.
    pub(crate) fn items(&self) -> impl Iterator<Item = &Item> {
        self.sockets.iter().filter_map(|slot| match slot {
            Slot::Filled(item) => Some(item),
            Slot::Empty => None,
        })
    }

    /// Get a mutable iterator to the set's items, as `(handle, &mut Item)`.
    pub(crate) fn items_mut(&mut self) -> impl Iterator<Item = &mut Item> {
        self.sockets.iter_mut().filter_map(|slot| match slot {
            Slot::Filled(item) => Some(item),
            Slot::Empty => None,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::socket::{icmp, PollAt};
    use crate::storage::PacketBuffer;

    fn make_icmp() -> icmp::Socket<'static> {
        icmp::Socket::new(
            PacketBuffer::new(Vec::new(), Vec::new()),
            PacketBuffer::new(Vec::new(), Vec::new()),
        )
    }

    #[test]
    fn add_get_remove_round_trips() {
        let mut set = SocketSet::new();
        let handle = set.add(make_icmp());
        let _: &icmp::Socket = set.get(handle);
        set.remove(handle);
        assert_eq!(set.iter().count(), 0);
    }

    #[test]
    fn removed_handle_slot_is_reused() {
        let mut set = SocketSet::new();
        let h1 = set.add(make_icmp());
        set.remove(h1);
        let h2 = set.add(make_icmp());
        assert_eq!(h1, h2);
        let _ = PollAt::Now;
    }
}
