//! Canonical flow keys and protocol display names.

use std::net::IpAddr;

/// Builds the canonical tracker key for a flow's origin-direction 5-tuple.
///
/// The key is stable for the lifetime of a logical connection and doubles as
/// the string the HTTP layer reports, so the format must not change.
pub fn flow_key(
    src_ip: &IpAddr,
    src_port: u16,
    dst_ip: &IpAddr,
    dst_port: u16,
    proto: u8,
) -> String {
    format!("{src_ip}:{src_port}->{dst_ip}:{dst_port}:{proto}")
}

/// Display name for an IP protocol number.
///
/// ICMPv6 (58) intentionally collapses onto "ICMP"; the kernel reports
/// type/code in the port slots for both, so the two aggregate the same way.
pub fn protocol_name(proto: u8) -> String {
    match proto {
        6 => "TCP".to_string(),
        17 => "UDP".to_string(),
        1 | 58 => "ICMP".to_string(),
        other => other.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::{Ipv4Addr, Ipv6Addr};

    #[test]
    fn v4_key_format() {
        let src = IpAddr::V4(Ipv4Addr::new(192, 168, 1, 10));
        let dst = IpAddr::V4(Ipv4Addr::new(1, 1, 1, 1));
        assert_eq!(
            flow_key(&src, 50123, &dst, 443, 6),
            "192.168.1.10:50123->1.1.1.1:443:6"
        );
    }

    #[test]
    fn v6_key_format() {
        let src = IpAddr::V6(Ipv6Addr::new(0xfd00, 0, 0, 0, 0, 0, 0, 1));
        let dst = IpAddr::V6(Ipv6Addr::new(0x2606, 0x4700, 0, 0, 0, 0, 0, 0x1111));
        assert_eq!(
            flow_key(&src, 52000, &dst, 853, 17),
            "fd00::1:52000->2606:4700::1111:853:17"
        );
    }

    #[test]
    fn protocol_names() {
        assert_eq!(protocol_name(6), "TCP");
        assert_eq!(protocol_name(17), "UDP");
        assert_eq!(protocol_name(1), "ICMP");
        assert_eq!(protocol_name(58), "ICMP");
        assert_eq!(protocol_name(132), "132");
    }
}
