//! Interface address (RTM_GETADDR) client.

use std::ffi::CString;
use std::io;
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr};

use ipnetwork::IpNetwork;

use crate::error::NetlinkError;
use crate::message::AttrIter;
use crate::socket::route_dump;

const RTM_NEWADDR: u16 = 20;
const RTM_GETADDR: u16 = 22;

const IFADDRMSG_LEN: usize = 8;
const IFA_ADDRESS: u16 = 1;
const IFA_LOCAL: u16 = 2;

/// Resolves an interface name to its kernel index.
pub fn interface_index(name: &str) -> Result<u32, NetlinkError> {
    let cname =
        CString::new(name).map_err(|_| NetlinkError::UnknownInterface(name.to_string()))?;
    let index = unsafe { libc::if_nametoindex(cname.as_ptr()) };
    if index == 0 {
        let err = io::Error::last_os_error();
        if err.raw_os_error() == Some(libc::ENODEV) {
            return Err(NetlinkError::UnknownInterface(name.to_string()));
        }
        return Err(err.into());
    }
    Ok(index)
}

/// Lists the subnets configured on one interface, both address families.
pub fn interface_addrs(ifindex: u32) -> Result<Vec<IpNetwork>, NetlinkError> {
    // ifaddrmsg: family, prefixlen, flags, scope, index. AF_UNSPEC dumps both
    // families; the kernel ignores the index in dump requests, so filter here.
    let header = [0u8, 0, 0, 0, 0, 0, 0, 0];
    let payloads = route_dump(RTM_GETADDR, RTM_NEWADDR, &header)?;

    let mut subnets = Vec::new();
    for payload in &payloads {
        if let Some(net) = parse_ifaddr(payload, ifindex) {
            subnets.push(net);
        }
    }
    Ok(subnets)
}

fn parse_ifaddr(payload: &[u8], want_index: u32) -> Option<IpNetwork> {
    if payload.len() < IFADDRMSG_LEN {
        return None;
    }
    let family = payload[0];
    let prefixlen = payload[1];
    let index = u32::from_ne_bytes([payload[4], payload[5], payload[6], payload[7]]);
    if index != want_index {
        return None;
    }

    let mut address = None;
    let mut local = None;
    for (atype, adata) in AttrIter::new(&payload[IFADDRMSG_LEN..]) {
        match atype {
            IFA_ADDRESS => address = read_ip(family, adata),
            IFA_LOCAL => local = read_ip(family, adata),
            _ => {}
        }
    }

    // IFA_LOCAL is the interface's own address on IPv4 (IFA_ADDRESS may be
    // the peer on point-to-point links); IPv6 entries carry only IFA_ADDRESS.
    let ip = local.or(address)?;
    IpNetwork::new(ip, prefixlen).ok()
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
