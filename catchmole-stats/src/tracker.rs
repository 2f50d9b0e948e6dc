//! Per-flow tracker state.

use std::net::IpAddr;
use std::time::Instant;

use crate::model::SpeedWindow;

/// Accumulated state for one tracked flow, keyed by the canonical 5-tuple
/// string. Totals only grow; resets happen by deleting the tracker.
#[derive(Clone, Debug)]
pub(crate) struct FlowTracker {
    pub flow_id: u32,
    pub first_seen: Instant,
    pub last_seen: Instant,

    pub src_ip: IpAddr,
    pub dst_ip: IpAddr,
    pub src_port: u16,
    pub dst_port: u16,
    pub proto: u8,

    pub total_orig: u64,
    pub total_reply: u64,

    /// Totals at the start of the current session view.
    pub session_start_orig: u64,
    pub session_start_reply: u64,

    pub orig_speed: u64,
    pub reply_speed: u64,
    pub speed: SpeedWindow,
}

impl FlowTracker {
    pub(crate) fn new(
        flow_id: u32,
        src_ip: IpAddr,
        dst_ip: IpAddr,
        src_port: u16,
        dst_port: u16,
        proto: u8,
        now: Instant,
    ) -> Self {
        Self {
            flow_id,
            first_seen: now,
            last_seen: now,
            src_ip,
            dst_ip,
            src_port,
            dst_port,
            proto,
            total_orig: 0,
            total_reply: 0,
            session_start_orig: 0,
            session_start_reply: 0,
            orig_speed: 0,
            reply_speed: 0,
            speed: SpeedWindow::default(),
        }
    }

    /// Session-scoped origin bytes (totals minus the session-start snapshot).
    pub(crate) fn session_orig(&self) -> u64 {
        self.total_orig.saturating_sub(self.session_start_orig)
    }

    /// Session-scoped reply bytes.
    pub(crate) fn session_reply(&self) -> u64 {
        self.total_reply.saturating_sub(self.session_start_reply)
    }
}
