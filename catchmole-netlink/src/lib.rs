//! # catchmole-netlink
//!
//! Raw netlink clients for the three kernel tables the accounting pipeline
//! consumes: conntrack (dump + multicast event stream), the neighbor table,
//! and per-interface addresses.
//!
//! Sockets are thin owned-fd wrappers over `libc`; message encoding and
//! attribute parsing are bounds-checked and never panic on kernel input.
//! Requires root or CAP_NET_ADMIN for the conntrack groups.

pub mod addr;
pub mod conntrack;
pub mod error;
pub mod message;
pub mod neighbor;
pub mod socket;

pub use addr::{interface_addrs, interface_index};
pub use conntrack::{ConntrackFlow, ConntrackListener, ConntrackSocket};
pub use error::NetlinkError;
pub use neighbor::{neighbor_dump, NeighborEntry};
