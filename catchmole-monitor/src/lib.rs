//! # catchmole-monitor
//!
//! The ingestion half of the pipeline: the neighbor resolver that maps local
//! IPs to MAC addresses, and the conntrack monitor that merges the multicast
//! event stream with periodic full-table polls and differences the kernel's
//! cumulative byte counters into per-flow deltas.

pub mod conntrack;
pub mod neighbor;

pub use conntrack::{ConntrackMonitor, FlowDiff, MonitorError};
pub use neighbor::NeighborResolver;
