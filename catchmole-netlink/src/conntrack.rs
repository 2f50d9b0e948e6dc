//! Conntrack (ctnetlink) dump and event-stream clients.
//!
//! Both clients speak NETLINK_NETFILTER. The dump socket issues a full-table
//! GET per poll; the listener stays bound to the new/update/destroy multicast
//! groups. Byte counters require `nf_conntrack_acct`; entries dumped without
//! counters parse as zero.

use std::net::{IpAddr, Ipv4Addr, Ipv6Addr};
use std::time::Duration;

use tracing::trace;

use crate::error::NetlinkError;
use crate::message::{
    read_u16_be, read_u32_be, read_u64_be, AttrIter, MessageBuilder, MessageIter,
};
use crate::socket::NetlinkSocket;

const NFNL_SUBSYS_CTNETLINK: u16 = 1;
const IPCTNL_MSG_CT_GET: u16 = 1;
const IPCTNL_MSG_CT_DELETE: u16 = 2;

// Multicast group bits: NEW (1), UPDATE (2), DESTROY (3).
const CT_GROUP_MASK: u32 = 0b111;

const CTA_TUPLE_ORIG: u16 = 1;
const CTA_COUNTERS_ORIG: u16 = 9;
const CTA_COUNTERS_REPLY: u16 = 10;
const CTA_ID: u16 = 12;

const CTA_TUPLE_IP: u16 = 1;
const CTA_TUPLE_PROTO: u16 = 2;

const CTA_IP_V4_SRC: u16 = 1;
const CTA_IP_V4_DST: u16 = 2;
const CTA_IP_V6_SRC: u16 = 3;
const CTA_IP_V6_DST: u16 = 4;

const CTA_PROTO_NUM: u16 = 1;
const CTA_PROTO_SRC_PORT: u16 = 2;
const CTA_PROTO_DST_PORT: u16 = 3;
const CTA_PROTO_ICMP_ID: u16 = 4;
const CTA_PROTO_ICMP_TYPE: u16 = 5;
const CTA_PROTO_ICMP_CODE: u16 = 6;
const CTA_PROTO_ICMPV6_ID: u16 = 7;
const CTA_PROTO_ICMPV6_TYPE: u16 = 8;
const CTA_PROTO_ICMPV6_CODE: u16 = 9;

const CTA_COUNTERS_BYTES: u16 = 2;
const CTA_COUNTERS32_BYTES: u16 = 4;

const RECV_BUF_LEN: usize = 64 * 1024;

/// One conntrack entry as reported by the kernel: origin-direction 5-tuple,
/// cumulative per-direction byte counters, and the kernel's entry id.
///
/// For ICMP/ICMPv6 the kernel has no ports; the echo id rides in `src_port`
/// and type/code packed big-endian in `dst_port`, which keeps the tuple
/// usable as an aggregation key.
#[derive(Clone, Debug)]
pub struct ConntrackFlow {
    pub src_ip: IpAddr,
    pub dst_ip: IpAddr,
    pub src_port: u16,
    pub dst_port: u16,
    pub proto: u8,
    pub flow_id: u32,
    pub orig_bytes: u64,
    pub reply_bytes: u64,
    /// True when this sample came from a DESTROY message.
    pub destroy: bool,
}

/// Request/response socket for full-table dumps.
pub struct ConntrackSocket {
    sock: NetlinkSocket,
    seq: u32,
    buf: Vec<u8>,
}

impl ConntrackSocket {
    pub fn open() -> Result<Self, NetlinkError> {
        let sock = NetlinkSocket::connect(libc::NETLINK_NETFILTER, 0)?;
        Ok(Self {
            sock,
            seq: 1,
            buf: vec![0u8; RECV_BUF_LEN],
        })
    }

    /// Dumps every live conntrack entry, both address families.
    pub fn dump(&mut self) -> Result<Vec<ConntrackFlow>, NetlinkError> {
        self.seq = self.seq.wrapping_add(1);
        let msg_type = (NFNL_SUBSYS_CTNETLINK << 8) | IPCTNL_MSG_CT_GET;
        let flags = (libc::NLM_F_REQUEST | libc::NLM_F_DUMP) as u16;
        // nfgenmsg: AF_UNSPEC, NFNETLINK_V0, res_id 0.
        let request = MessageBuilder::new(msg_type, flags, self.seq)
            .append(&[0u8, 0, 0, 0])
            .finish();
        self.sock.send(&request)?;

        let mut flows = Vec::new();
        loop {
            let len = match self.sock.recv(&mut self.buf)? {
                Some(len) => len,
                None => continue, // interrupted; the dump is still in flight
            };
            for msg in MessageIter::new(&self.buf[..len]) {
                if msg.is_done() {
                    return Ok(flows);
                }
                if let Some(err) = msg.kernel_error() {
                    return Err(err);
                }
                if let Some(flow) = parse_flow(msg.msg_type, msg.payload) {
                    flows.push(flow);
                }
            }
        }
    }
}

/// Event-stream socket subscribed to the conntrack multicast groups.
pub struct ConntrackListener {
    sock: NetlinkSocket,
    buf: Vec<u8>,
}

impl ConntrackListener {
    /// Opens the listener and forces its receive buffer to `recv_buffer`
    /// bytes. Failing to get the buffer is fatal: an undersized socket drops
    /// event bursts on busy routers.
    pub fn open(recv_buffer: usize, read_timeout: Duration) -> Result<Self, NetlinkError> {
        let sock = NetlinkSocket::connect(libc::NETLINK_NETFILTER, CT_GROUP_MASK)?;
        sock.set_recv_buffer(recv_buffer)?;
        sock.set_recv_timeout(read_timeout)?;
        Ok(Self {
            sock,
            buf: vec![0u8; RECV_BUF_LEN],
        })
    }

    /// Reads one batch of events.
    ///
    /// Returns `Ok(None)` when the read timeout elapsed with nothing to read.
    /// A kernel NLMSG_ERROR in the stream (typically an overrun note) is
    /// returned as `Err`; the stream remains usable afterwards.
    pub fn next_batch(&mut self) -> Result<Option<Vec<ConntrackFlow>>, NetlinkError> {
        let len = match self.sock.recv(&mut self.buf)? {
            Some(len) => len,
            None => return Ok(None),
        };

        let mut flows = Vec::new();
        for msg in MessageIter::new(&self.buf[..len]) {
            if let Some(err) = msg.kernel_error() {
                return Err(err);
            }
            if let Some(flow) = parse_flow(msg.msg_type, msg.payload) {
                flows.push(flow);
            } else {
                trace!(msg_type = msg.msg_type, "skipping unparseable ct message");
            }
        }
        Ok(Some(flows))
    }
}

/// Parses one ctnetlink message payload (nfgenmsg + attributes).
pub(crate) fn parse_flow(msg_type: u16, payload: &[u8]) -> Option<ConntrackFlow> {
    if msg_type >> 8 != NFNL_SUBSYS_CTNETLINK {
        return None;
    }
    let destroy = msg_type & 0xff == IPCTNL_MSG_CT_DELETE;

    // Skip the 4-byte nfgenmsg.
    let attrs = payload.get(4..)?;

    let mut tuple = None;
    let mut flow_id = None;
    let mut orig_bytes = 0u64;
    let mut reply_bytes = 0u64;

    for (atype, adata) in AttrIter::new(attrs) {
        match atype {
            CTA_TUPLE_ORIG => tuple = parse_tuple(adata),
            CTA_COUNTERS_ORIG => orig_bytes = parse_counter_bytes(adata),
            CTA_COUNTERS_REPLY => reply_bytes = parse_counter_bytes(adata),
            CTA_ID => flow_id = read_u32_be(adata),
            _ => {}
        }
    }

    let (src_ip, dst_ip, src_port, dst_port, proto) = tuple?;
    Some(ConntrackFlow {
        src_ip,
        dst_ip,
        src_port,
        dst_port,
        proto,
        flow_id: flow_id?,
        orig_bytes,
        reply_bytes,
        destroy,
    })
}

type Tuple = (IpAddr, IpAddr, u16, u16, u8);

fn parse_tuple(data: &[u8]) -> Option<Tuple> {
    let mut src_ip = None;
    let mut dst_ip = None;
    let mut proto = None;
    let mut src_port = 0u16;
    let mut dst_port = 0u16;
    let mut icmp_id = 0u16;
    let mut icmp_type = 0u8;
    let mut icmp_code = 0u8;

    for (atype, adata) in AttrIter::new(data) {
        match atype {
            CTA_TUPLE_IP => {
                for (iptype, ipdata) in AttrIter::new(adata) {
                    match iptype {
                        CTA_IP_V4_SRC => src_ip = read_v4(ipdata),
                        CTA_IP_V4_DST => dst_ip = read_v4(ipdata),
                        CTA_IP_V6_SRC => src_ip = read_v6(ipdata),
                        CTA_IP_V6_DST => dst_ip = read_v6(ipdata),
                        _ => {}
                    }
                }
            }
            CTA_TUPLE_PROTO => {
                for (ptype, pdata) in AttrIter::new(adata) {
                    match ptype {
                        CTA_PROTO_NUM => proto = pdata.first().copied(),
                        CTA_PROTO_SRC_PORT => src_port = read_u16_be(pdata).unwrap_or(0),
                        CTA_PROTO_DST_PORT => dst_port = read_u16_be(pdata).unwrap_or(0),
                        CTA_PROTO_ICMP_ID | CTA_PROTO_ICMPV6_ID => {
                            icmp_id = read_u16_be(pdata).unwrap_or(0)
                        }
                        CTA_PROTO_ICMP_TYPE | CTA_PROTO_ICMPV6_TYPE => {
                            icmp_type = pdata.first().copied().unwrap_or(0)
                        }
                        CTA_PROTO_ICMP_CODE | CTA_PROTO_ICMPV6_CODE => {
                            icmp_code = pdata.first().copied().unwrap_or(0)
                        }
                        _ => {}
                    }
                }
            }
            _ => {}
        }
    }

    let proto = proto?;
    if proto == 1 || proto == 58 {
        src_port = icmp_id;
        dst_port = u16::from_be_bytes([icmp_type, icmp_code]);
    }
    Some((src_ip?, dst_ip?, src_port, dst_port, proto))
}

fn parse_counter_bytes(data: &[u8]) -> u64 {
    let mut bytes = 0u64;
    for (atype, adata) in AttrIter::new(data) {
        match atype {
            CTA_COUNTERS_BYTES => {
                if let Some(v) = read_u64_be(adata) {
                    bytes = v;
                }
            }
            // Legacy 32-bit counter, only taken when no 64-bit value came.
            CTA_COUNTERS32_BYTES => {
                if bytes == 0 {
                    if let Some(v) = read_u32_be(adata) {
                        bytes = u64::from(v);
                    }
                }
            }
            _ => {}
        }
    }
    bytes
}

fn read_v4(data: &[u8]) -> Option<IpAddr> {
    data.get(..4)
        .map(|b| IpAddr::V4(Ipv4Addr::new(b[0], b[1], b[2], b[3])))
}

fn read_v6(data: &[u8]) -> Option<IpAddr> {
    let b = data.get(..16)?;
    let mut octets = [0u8; 16];
    octets.copy_from_slice(b);
    Some(IpAddr::V6(Ipv6Addr::from(octets)))
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

    fn nested(atype: u16, children: &[Vec<u8>]) -> Vec<u8> {
        let inner: Vec<u8> = children.iter().flatten().copied().collect();
        attr(0x8000 | atype, &inner)
    }

    fn tcp_tuple(src: [u8; 4], dst: [u8; 4], sport: u16, dport: u16) -> Vec<u8> {
        nested(
            CTA_TUPLE_ORIG,
            &[
                nested(
                    CTA_TUPLE_IP,
                    &[attr(CTA_IP_V4_SRC, &src), attr(CTA_IP_V4_DST, &dst)],
                ),
                nested(
                    CTA_TUPLE_PROTO,
                    &[
                        attr(CTA_PROTO_NUM, &[6]),
                        attr(CTA_PROTO_SRC_PORT, &sport.to_be_bytes()),
                        attr(CTA_PROTO_DST_PORT, &dport.to_be_bytes()),
                    ],
                ),
            ],
        )
    }

    fn ct_payload(parts: &[Vec<u8>]) -> Vec<u8> {
        let mut payload = vec![2u8, 0, 0, 0]; // nfgenmsg, AF_INET
        for part in parts {
            payload.extend_from_slice(part);
        }
        payload
    }

    #[test]
    fn parses_update_with_counters() {
        let payload = ct_payload(&[
            tcp_tuple([192, 168, 1, 10], [1, 1, 1, 1], 50000, 443),
            nested(
                CTA_COUNTERS_ORIG,
                &[attr(CTA_COUNTERS_BYTES, &10_000u64.to_be_bytes())],
            ),
            nested(
                CTA_COUNTERS_REPLY,
                &[attr(CTA_COUNTERS_BYTES, &20_000u64.to_be_bytes())],
            ),
            attr(CTA_ID, &7u32.to_be_bytes()),
        ]);

        let flow = parse_flow(NFNL_SUBSYS_CTNETLINK << 8, &payload).unwrap();
        assert_eq!(flow.src_ip.to_string(), "192.168.1.10");
        assert_eq!(flow.dst_ip.to_string(), "1.1.1.1");
        assert_eq!(flow.src_port, 50000);
        assert_eq!(flow.dst_port, 443);
        assert_eq!(flow.proto, 6);
        assert_eq!(flow.flow_id, 7);
        assert_eq!(flow.orig_bytes, 10_000);
        assert_eq!(flow.reply_bytes, 20_000);
        assert!(!flow.destroy);
    }

    #[test]
    fn destroy_message_type_is_flagged() {
        let payload = ct_payload(&[
            tcp_tuple([10, 0, 0, 2], [9, 9, 9, 9], 1234, 53),
            attr(CTA_ID, &42u32.to_be_bytes()),
        ]);
        let msg_type = (NFNL_SUBSYS_CTNETLINK << 8) | IPCTNL_MSG_CT_DELETE;
        let flow = parse_flow(msg_type, &payload).unwrap();
        assert!(flow.destroy);
        assert_eq!(flow.orig_bytes, 0);
        assert_eq!(flow.reply_bytes, 0);
    }

    #[test]
    fn legacy_32bit_counters() {
        let payload = ct_payload(&[
            tcp_tuple([10, 0, 0, 2], [9, 9, 9, 9], 1234, 80),
            nested(
                CTA_COUNTERS_ORIG,
                &[attr(CTA_COUNTERS32_BYTES, &5_000u32.to_be_bytes())],
            ),
            attr(CTA_ID, &1u32.to_be_bytes()),
        ]);
        let flow = parse_flow(NFNL_SUBSYS_CTNETLINK << 8, &payload).unwrap();
        assert_eq!(flow.orig_bytes, 5_000);
    }

    #[test]
    fn icmp_rides_in_port_slots() {
        let payload = ct_payload(&[
            nested(
                CTA_TUPLE_ORIG,
                &[
                    nested(
                        CTA_TUPLE_IP,
                        &[
                            attr(CTA_IP_V4_SRC, &[192, 168, 1, 10]),
                            attr(CTA_IP_V4_DST, &[8, 8, 8, 8]),
                        ],
                    ),
                    nested(
                        CTA_TUPLE_PROTO,
                        &[
                            attr(CTA_PROTO_NUM, &[1]),
                            attr(CTA_PROTO_ICMP_ID, &0x1234u16.to_be_bytes()),
                            attr(CTA_PROTO_ICMP_TYPE, &[8]),
                            attr(CTA_PROTO_ICMP_CODE, &[0]),
                        ],
                    ),
                ],
            ),
            attr(CTA_ID, &3u32.to_be_bytes()),
        ]);
        let flow = parse_flow(NFNL_SUBSYS_CTNETLINK << 8, &payload).unwrap();
        assert_eq!(flow.proto, 1);
        assert_eq!(flow.src_port, 0x1234);
        assert_eq!(flow.dst_port, 0x0800); // echo request, code 0
    }

    #[test]
    fn v6_tuple_parses() {
        let src: [u8; 16] = [0xfd, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 1];
        let dst: [u8; 16] = [0x20, 1, 0x48, 0x60, 0x48, 0x60, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0x88];
        let payload = ct_payload(&[
            nested(
                CTA_TUPLE_ORIG,
                &[
                    nested(
                        CTA_TUPLE_IP,
                        &[attr(CTA_IP_V6_SRC, &src), attr(CTA_IP_V6_DST, &dst)],
                    ),
                    nested(
                        CTA_TUPLE_PROTO,
                        &[
                            attr(CTA_PROTO_NUM, &[17]),
                            attr(CTA_PROTO_SRC_PORT, &5353u16.to_be_bytes()),
                            attr(CTA_PROTO_DST_PORT, &5353u16.to_be_bytes()),
                        ],
                    ),
                ],
            ),
            attr(CTA_ID, &9u32.to_be_bytes()),
        ]);
        let flow = parse_flow(NFNL_SUBSYS_CTNETLINK << 8, &payload).unwrap();
        assert_eq!(flow.src_ip.to_string(), "fd00::1");
        assert_eq!(flow.proto, 17);
    }

    #[test]
    fn missing_tuple_is_skipped() {
        let payload = ct_payload(&[attr(CTA_ID, &1u32.to_be_bytes())]);
        assert!(parse_flow(NFNL_SUBSYS_CTNETLINK << 8, &payload).is_none());
    }

    #[test]
    fn non_conntrack_subsystem_is_ignored() {
        let payload = ct_payload(&[tcp_tuple([10, 0, 0, 1], [10, 0, 0, 2], 1, 2)]);
        assert!(parse_flow(0x0200, &payload).is_none());
    }
}
