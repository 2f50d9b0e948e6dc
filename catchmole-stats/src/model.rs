//! JSON data model served to the UI.
//!
//! Field names are the UI contract; they stay lower-snake-case and stable.

use std::time::Instant;

use chrono::{DateTime, Utc};
use serde::Serialize;

/// Minimum elapsed time before a speed window recomputes, so sub-tick calls
/// cannot divide by a near-zero interval.
pub(crate) const MIN_SPEED_WINDOW_SECS: f64 = 0.5;

/// Aggregated statistics for one client device, keyed by lower-cased MAC.
#[derive(Clone, Debug, Serialize)]
pub struct ClientStats {
    pub mac: String,
    pub name: String,
    pub total_download: u64,
    pub total_upload: u64,
    pub session_download: u64,
    pub session_upload: u64,
    pub download_speed: u64,
    pub upload_speed: u64,
    pub active_connections: u64,
    pub start_time: DateTime<Utc>,
    pub last_active: DateTime<Utc>,

    #[serde(skip)]
    pub(crate) speed: SpeedWindow,
    #[serde(skip)]
    pub(crate) smoothed_conns: f64,
    #[serde(skip)]
    pub(crate) raw_conns: u64,
}

impl ClientStats {
    /// A fresh, zeroed entry for a newly seen device.
    pub fn new(mac: String, name: String, now: DateTime<Utc>) -> Self {
        Self {
            mac,
            name,
            total_download: 0,
            total_upload: 0,
            session_download: 0,
            session_upload: 0,
            download_speed: 0,
            upload_speed: 0,
            active_connections: 0,
            start_time: now,
            last_active: now,
            speed: SpeedWindow::default(),
            smoothed_conns: 0.0,
            raw_conns: 0,
        }
    }
}

/// One aggregated flow from a client's perspective: everything the client
/// exchanged with one remote `(protocol, ip, port)` endpoint.
///
/// For ICMP the kernel has no ports, so `remote_port` carries the type/code
/// pair conntrack reports in the port slots, not a transport port.
#[derive(Clone, Debug, Serialize)]
pub struct FlowDetail {
    pub protocol: String,
    pub client_ip: String,
    pub remote_ip: String,
    pub remote_port: u16,
    pub total_download: u64,
    pub total_upload: u64,
    pub session_download: u64,
    pub session_upload: u64,
    pub download_speed: u64,
    pub upload_speed: u64,
    pub duration: u64,
    pub active_connections: u64,
    pub ttl_remaining: i64,
}

/// WAN-attributed totals plus derived speeds and the smoothed global
/// connection count.
#[derive(Clone, Debug, Default, Serialize)]
pub struct GlobalStats {
    pub total_download: u64,
    pub total_upload: u64,
    pub download_speed: u64,
    pub upload_speed: u64,
    pub active_connections: u64,
}

/// Rate computation over a pair of cumulative counters.
///
/// Primes itself on the first sample and afterwards yields byte rates
/// whenever at least [`MIN_SPEED_WINDOW_SECS`] elapsed since the last
/// accepted sample.
#[derive(Clone, Copy, Debug, Default)]
pub(crate) struct SpeedWindow {
    last_a: u64,
    last_b: u64,
    last_calc: Option<Instant>,
}

impl SpeedWindow {
    /// Feeds the current totals; returns `(rate_a, rate_b)` in bytes/sec when
    /// the window advanced.
    pub(crate) fn sample(&mut self, now: Instant, a: u64, b: u64) -> Option<(u64, u64)> {
        let Some(last) = self.last_calc else {
            self.last_calc = Some(now);
            self.last_a = a;
            self.last_b = b;
            return None;
        };

        let secs = now.saturating_duration_since(last).as_secs_f64();
        if secs < MIN_SPEED_WINDOW_SECS {
            return None;
        }

        let rate_a = (a.saturating_sub(self.last_a) as f64 / secs) as u64;
        let rate_b = (b.saturating_sub(self.last_b) as f64 / secs) as u64;
        self.last_a = a;
        self.last_b = b;
        self.last_calc = Some(now);
        Some((rate_a, rate_b))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[test]
    fn speed_window_primes_then_measures() {
        let t0 = Instant::now();
        let mut window = SpeedWindow::default();

        assert!(window.sample(t0, 1_000, 2_000).is_none());

        let (up, down) = window.sample(t0 + Duration::from_secs(1), 3_000, 2_500).unwrap();
        assert_eq!(up, 2_000);
        assert_eq!(down, 500);
    }

    #[test]
    fn speed_window_rejects_short_intervals() {
        let t0 = Instant::now();
        let mut window = SpeedWindow::default();
        window.sample(t0, 0, 0);
        assert!(window
            .sample(t0 + Duration::from_millis(200), 10_000, 0)
            .is_none());
        // The rejected sample did not move the baseline.
        let (up, _) = window.sample(t0 + Duration::from_secs(1), 10_000, 0).unwrap();
        assert_eq!(up, 10_000);
    }

    #[test]
    fn client_serializes_contract_fields_only() {
        let client = ClientStats::new(
            "aa:bb:cc:dd:ee:ff".into(),
            "laptop".into(),
            Utc::now(),
        );
        let json = serde_json::to_value(&client).unwrap();
        let obj = json.as_object().unwrap();
        for field in [
            "mac",
            "name",
            "total_download",
            "total_upload",
            "session_download",
            "session_upload",
            "download_speed",
            "upload_speed",
            "active_connections",
            "start_time",
            "last_active",
        ] {
            assert!(obj.contains_key(field), "missing {field}");
        }
        assert_eq!(obj.len(), 11);
    }
}
