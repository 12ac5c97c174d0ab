pub mod conntrack;
pub mod rendezvous;

pub use conntrack::{ConntrackSource, Origin, OriginResolver, ProcConntrack, Table};
pub use rendezvous::{Room, RoomRole, Rooms, Route};
