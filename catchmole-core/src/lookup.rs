//! The lookup contract the aggregator needs from the neighbor table.

use std::net::IpAddr;

/// Point lookups into an IP → MAC snapshot, plus the refresh hook the
/// aggregator tick drives.
///
/// Implementations must keep `lookup` cheap and non-blocking; `refresh` may
/// do kernel I/O but must never fail loudly (a failed refresh keeps the
/// previous snapshot).
pub trait NeighborLookup: Send + Sync {
    /// Lower-cased MAC for `ip`, if the device is a known local neighbor.
    fn lookup(&self, ip: &IpAddr) -> Option<String>;

    /// Rebuilds the snapshot; errors are handled internally.
    fn refresh(&self) {}
}
