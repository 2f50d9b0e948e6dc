//! Netlink message framing and attribute parsing.
//!
//! Headers use host byte order; netfilter attribute payloads are big-endian.
//! Every parse path is bounds-checked: a truncated buffer ends iteration
//! rather than panicking, and the caller decides whether that is an error.

use crate::error::NetlinkError;

pub const NLMSG_HDRLEN: usize = 16;
const NLA_HDRLEN: usize = 4;
const NLA_TYPE_MASK: u16 = 0x3fff;

#[inline]
pub fn align4(len: usize) -> usize {
    (len + 3) & !3
}

/// Serializes one request message: header, then caller-appended payload.
pub struct MessageBuilder {
    buf: Vec<u8>,
}

impl MessageBuilder {
    pub fn new(msg_type: u16, flags: u16, seq: u32) -> Self {
        let mut buf = Vec::with_capacity(64);
        buf.extend_from_slice(&0u32.to_ne_bytes()); // length, patched in finish()
        buf.extend_from_slice(&msg_type.to_ne_bytes());
        buf.extend_from_slice(&flags.to_ne_bytes());
        buf.extend_from_slice(&seq.to_ne_bytes());
        buf.extend_from_slice(&0u32.to_ne_bytes()); // pid: kernel fills ours in
        Self { buf }
    }

    pub fn append(mut self, payload: &[u8]) -> Self {
        self.buf.extend_from_slice(payload);
        self
    }

    pub fn finish(mut self) -> Vec<u8> {
        let len = self.buf.len() as u32;
        self.buf[..4].copy_from_slice(&len.to_ne_bytes());
        self.buf
    }
}

/// One parsed message within a receive buffer.
#[derive(Debug)]
pub struct NlMsg<'a> {
    pub msg_type: u16,
    pub flags: u16,
    pub payload: &'a [u8],
}

impl NlMsg<'_> {
    pub fn is_done(&self) -> bool {
        self.msg_type == libc::NLMSG_DONE as u16
    }

    /// Extracts the errno from an NLMSG_ERROR payload, if this is one.
    ///
    /// An errno of zero is an ACK, not a failure.
    pub fn kernel_error(&self) -> Option<NetlinkError> {
        if self.msg_type != libc::NLMSG_ERROR as u16 {
            return None;
        }
        let errno = self
            .payload
            .get(..4)
            .map(|b| i32::from_ne_bytes([b[0], b[1], b[2], b[3]]))
            .unwrap_or(0);
        if errno == 0 {
            None
        } else {
            Some(NetlinkError::Kernel(-errno))
        }
    }
}

/// Walks the messages packed into one receive buffer.
pub struct MessageIter<'a> {
    buf: &'a [u8],
}

impl<'a> MessageIter<'a> {
    pub fn new(buf: &'a [u8]) -> Self {
        Self { buf }
    }
}

impl<'a> Iterator for MessageIter<'a> {
    type Item = NlMsg<'a>;

    fn next(&mut self) -> Option<NlMsg<'a>> {
        if self.buf.len() < NLMSG_HDRLEN {
            return None;
        }
        let len = u32::from_ne_bytes([self.buf[0], self.buf[1], self.buf[2], self.buf[3]]) as usize;
        if len < NLMSG_HDRLEN || len > self.buf.len() {
            self.buf = &[];
            return None;
        }
        let msg = NlMsg {
            msg_type: u16::from_ne_bytes([self.buf[4], self.buf[5]]),
            flags: u16::from_ne_bytes([self.buf[6], self.buf[7]]),
            payload: &self.buf[NLMSG_HDRLEN..len],
        };
        let advance = align4(len).min(self.buf.len());
        self.buf = &self.buf[advance..];
        Some(msg)
    }
}

/// Walks a run of netlink attributes, yielding `(type, payload)` pairs.
///
/// The nested and byte-order flag bits are masked off the returned type.
pub struct AttrIter<'a> {
    buf: &'a [u8],
}

impl<'a> AttrIter<'a> {
    pub fn new(buf: &'a [u8]) -> Self {
        Self { buf }
    }
}

impl<'a> Iterator for AttrIter<'a> {
    type Item = (u16, &'a [u8]);

    fn next(&mut self) -> Option<(u16, &'a [u8])> {
        if self.buf.len() < NLA_HDRLEN {
            return None;
        }
        let len = u16::from_ne_bytes([self.buf[0], self.buf[1]]) as usize;
        if len < NLA_HDRLEN || len > self.buf.len() {
            self.buf = &[];
            return None;
        }
        let atype = u16::from_ne_bytes([self.buf[2], self.buf[3]]) & NLA_TYPE_MASK;
        let payload = &self.buf[NLA_HDRLEN..len];
        let advance = align4(len).min(self.buf.len());
        self.buf = &self.buf[advance..];
        Some((atype, payload))
    }
}

#[inline]
pub fn read_u16_be(payload: &[u8]) -> Option<u16> {
    payload.get(..2).map(|b| u16::from_be_bytes([b[0], b[1]]))
}

#[inline]
pub fn read_u32_be(payload: &[u8]) -> Option<u32> {
    payload
        .get(..4)
        .map(|b| u32::from_be_bytes([b[0], b[1], b[2], b[3]]))
}

#[inline]
pub fn read_u64_be(payload: &[u8]) -> Option<u64> {
    payload
        .get(..8)
        .map(|b| u64::from_be_bytes([b[0], b[1], b[2], b[3], b[4], b[5], b[6], b[7]]))
}
