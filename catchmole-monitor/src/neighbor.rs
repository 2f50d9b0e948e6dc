//! IP → MAC resolution from the kernel neighbor table.

use std::collections::HashMap;
use std::net::IpAddr;

use parking_lot::RwLock;
use tracing::warn;

use catchmole_core::lookup::NeighborLookup;
use catchmole_netlink::neighbor::{neighbor_dump, nud, NeighborEntry};

/// Snapshot view of the neighbor table, refreshed on the aggregator tick.
///
/// Lookups are wait-free against the current snapshot; `refresh` builds a
/// complete replacement map and swaps it in, so readers never observe a
/// partial merge. A failed refresh keeps the previous snapshot.
#[derive(Default)]
pub struct NeighborResolver {
    ip_to_mac: RwLock<HashMap<IpAddr, String>>,
}

impl NeighborResolver {
    pub fn new() -> Self {
        Self::default()
    }

    /// Lower-cased MAC for `ip`, if the neighbor table knows it.
    pub fn lookup(&self, ip: &IpAddr) -> Option<String> {
        self.ip_to_mac.read().get(ip).cloned()
    }

    /// Rebuilds the snapshot from the kernel, both address families.
    pub fn refresh(&self) {
        let v4 = neighbor_dump(libc::AF_INET as u8);
        let v6 = neighbor_dump(libc::AF_INET6 as u8);
        let (v4, v6) = match (v4, v6) {
            (Ok(v4), Ok(v6)) => (v4, v6),
            (Err(e), _) | (_, Err(e)) => {
                warn!("neighbor refresh failed, keeping previous snapshot: {e}");
                return;
            }
        };

        let snapshot = build_snapshot(v4.into_iter().chain(v6));
        *self.ip_to_mac.write() = snapshot;
    }

    /// Number of resolvable neighbors in the current snapshot.
    pub fn len(&self) -> usize {
        self.ip_to_mac.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.ip_to_mac.read().is_empty()
    }

    #[cfg(test)]
    pub(crate) fn with_entries(entries: Vec<NeighborEntry>) -> Self {
        let resolver = Self::new();
        *resolver.ip_to_mac.write() = build_snapshot(entries);
        resolver
    }
}

impl NeighborLookup for NeighborResolver {
    fn lookup(&self, ip: &IpAddr) -> Option<String> {
        NeighborResolver::lookup(self, ip)
    }

    fn refresh(&self) {
        NeighborResolver::refresh(self)
    }
}

/// Keeps entries that are usable for attribution: any state except
/// incomplete/failed, and a real 6-byte hardware address.
fn build_snapshot(entries: impl IntoIterator<Item = NeighborEntry>) -> HashMap<IpAddr, String> {
    let mut map = HashMap::new();
    for entry in entries {
        if entry.state & (nud::INCOMPLETE | nud::FAILED) != 0 {
            continue;
        }
        if let Some(mac) = entry.mac_string() {
            map.insert(entry.ip, mac);
        }
    }
    map
}
