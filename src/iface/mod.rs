mod fragmentation;
mod interface;
mod neighbor;
mod packet;
mod route;
mod socket_meta;
mod socket_set;

pub use self::interface::{Config, Interface, PollIngressSingleResult, PollResult};
pub(crate) use self::interface::InterfaceInner;
pub use self::route::{Route, RouteTableFull, Routes};
pub use self::socket_set::{SocketHandle, SocketSet};
