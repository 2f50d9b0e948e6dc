//! Neighbor table (RTM_GETNEIGH) dump client.

use std::net::{IpAddr, Ipv4Addr, Ipv6Addr};

use crate::error::NetlinkError;
use crate::message::AttrIter;
use crate::socket::route_dump;

const RTM_NEWNEIGH: u16 = 28;
const RTM_GETNEIGH: u16 = 30;

const NDMSG_LEN: usize = 12;
const NDA_DST: u16 = 1;
const NDA_LLADDR: u16 = 2;

/// Neighbor unreachability detection states.
pub mod nud {
    pub const INCOMPLETE: u16 = 0x01;
    pub const REACHABLE: u16 = 0x02;
    pub const STALE: u16 = 0x04;
    pub const DELAY: u16 = 0x08;
    pub const PROBE: u16 = 0x10;
    pub const FAILED: u16 = 0x20;
    pub const NOARP: u16 = 0x40;
    pub const PERMANENT: u16 = 0x80;
}

/// One neighbor table entry.
#[derive(Clone, Debug)]
pub struct NeighborEntry {
    pub ip: IpAddr,
    pub lladdr: Vec<u8>,
    pub state: u16,
    pub ifindex: i32,
}

impl NeighborEntry {
    /// Lower-cased `aa:bb:cc:dd:ee:ff` form of the hardware address.
    ///
    /// Returns `None` unless the address is 6 bytes and not all-zero, which
    /// filters out incomplete entries and point-to-point pseudo-neighbors.
    pub fn mac_string(&self) -> Option<String> {
        if self.lladdr.len() != 6 || self.lladdr.iter().all(|&b| b == 0) {
            return None;
        }
        Some(
            self.lladdr
                .iter()
                .map(|b| format!("{b:02x}"))
                .collect::<Vec<_>>()
                .join(":"),
        )
    }
}

/// Dumps the neighbor table for one address family (`libc::AF_INET` /
/// `libc::AF_INET6`), all interfaces.
pub fn neighbor_dump(family: u8) -> Result<Vec<NeighborEntry>, NetlinkError> {
    // ndmsg: family + 3 pad bytes, ifindex, state, flags, type. For a dump
    // request only the family matters.
    let header = [family, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0];
    let payloads = route_dump(RTM_GETNEIGH, RTM_NEWNEIGH, &header)?;

    let mut entries = Vec::with_capacity(payloads.len());
    for payload in &payloads {
        if let Some(entry) = parse_neighbor(payload) {
            entries.push(entry);
        }
    }
    Ok(entries)
}

fn parse_neighbor(payload: &[u8]) -> Option<NeighborEntry> {
    if payload.len() < NDMSG_LEN {
        return None;
    }
    let family = payload[0];
    let ifindex = i32::from_ne_bytes([payload[4], payload[5], payload[6], payload[7]]);
    let state = u16::from_ne_bytes([payload[8], payload[9]]);

    let mut ip = None;
    let mut lladdr = Vec::new();
    for (atype, adata) in AttrIter::new(&payload[NDMSG_LEN..]) {
        match atype {
            NDA_DST => ip = read_ip(family, adata),
            NDA_LLADDR => lladdr = adata.to_vec(),
            _ => {}
        }
    }

    Some(NeighborEntry {
        ip: ip?,
        lladdr,
        state,
        ifindex,
    })
}

fn read_ip(family: u8, data: &[u8]) -> Option<IpAddr> {
    match family as i32 {
        libc::AF_INET => data
            .get(..4)
            .map(|b| IpAddr::V4(Ipv4Addr::new(b[0], b[1], b[2], b[3]))),
        libc::AF_INET6 => {
            let b = data.get(..16)?;
            let mut octets = [0u8; 16];
            octets.copy_from_slice(b);
            Some(IpAddr::V6(Ipv6Addr::from(octets)))
        }
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::message::align4;

    fn attr(atype: u16, payload: &[u8]) -> Vec<u8> {
        let len = (4 + payload.len()) as u16;
        let mut out = Vec::new();
        out.extend_from_slice(&len.to_ne_bytes());
        out.extend_from_slice(&atype.to_ne_bytes());
        out.extend_from_slice(payload);
        out.resize(align4(out.len()), 0);
        out
    }

    fn ndmsg(family: u8, ifindex: i32, state: u16) -> Vec<u8> {
        let mut out = vec![family, 0, 0, 0];
        out.extend_from_slice(&ifindex.to_ne_bytes());
        out.extend_from_slice(&state.to_ne_bytes());
        out.extend_from_slice(&[0, 0]); // ndm_flags, ndm_type
        out
    }

    #[test]
    fn parses_reachable_v4_entry() {
        let mut payload = ndmsg(libc::AF_INET as u8, 3, nud::REACHABLE);
        payload.extend_from_slice(&attr(NDA_DST, &[192, 168, 1, 10]));
        payload.extend_from_slice(&attr(NDA_LLADDR, &[0xaa, 0xbb, 0xcc, 0x00, 0x11, 0x22]));

        let entry = parse_neighbor(&payload).unwrap();
        assert_eq!(entry.ip.to_string(), "192.168.1.10");
        assert_eq!(entry.state, nud::REACHABLE);
        assert_eq!(entry.ifindex, 3);
        assert_eq!(entry.mac_string().unwrap(), "aa:bb:cc:00:11:22");
    }

    #[test]
    fn zero_mac_yields_no_string() {
        let mut payload = ndmsg(libc::AF_INET as u8, 1, nud::STALE);
        payload.extend_from_slice(&attr(NDA_DST, &[10, 0, 0, 1]));
        payload.extend_from_slice(&attr(NDA_LLADDR, &[0; 6]));
        let entry = parse_neighbor(&payload).unwrap();
        assert!(entry.mac_string().is_none());
    }

    #[test]
    fn missing_lladdr_parses_with_empty_address() {
        let mut payload = ndmsg(libc::AF_INET6 as u8, 2, nud::INCOMPLETE);
        let v6 = [0xfe, 0x80, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 1];
        payload.extend_from_slice(&attr(NDA_DST, &v6));
        let entry = parse_neighbor(&payload).unwrap();
        assert!(entry.lladdr.is_empty());
        assert!(entry.mac_string().is_none());
        assert_eq!(entry.ip.to_string(), "fe80::1");
    }

    #[test]
    fn entry_without_destination_is_skipped() {
        let payload = ndmsg(libc::AF_INET as u8, 1, nud::REACHABLE);
        assert!(parse_neighbor(&payload).is_none());
    }
}
