//! Delta events derived from cumulative conntrack counters.

use std::net::IpAddr;
use std::time::Instant;

/// Whether the kernel reported a live counter sample or the end of a flow.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum EventKind {
    Update,
    Destroy,
}

/// Byte deltas for one conntrack flow since its previous sample.
///
/// The 5-tuple is the origin-direction tuple the kernel recorded at flow
/// creation; `orig_delta` counts bytes in that direction, `reply_delta` the
/// opposite. Both are non-negative by construction of the differencing step.
#[derive(Clone, Debug)]
pub struct DeltaEvent {
    pub src_ip: IpAddr,
    pub dst_ip: IpAddr,
    pub src_port: u16,
    pub dst_port: u16,
    pub proto: u8,

    /// Kernel conntrack entry id. May be reused across flow lifetimes.
    pub flow_id: u32,

    pub orig_delta: u64,
    pub reply_delta: u64,

    pub timestamp: Instant,
    pub kind: EventKind,
}

impl DeltaEvent {
    /// True when neither direction carried new bytes.
    #[inline]
    pub fn is_empty(&self) -> bool {
        self.orig_delta == 0 && self.reply_delta == 0
    }
}
