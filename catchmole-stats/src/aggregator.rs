//! Client and flow aggregation over the delta stream.
//!
//! One value of [`Aggregator`] is shared by the drain task (event handler),
//! the tick task, and every HTTP reader. A single read/write lock covers all
//! aggregator state, so snapshot readers never observe a partial update.

use std::collections::{HashMap, HashSet};
use std::net::IpAddr;
use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use ipnetwork::IpNetwork;
use parking_lot::RwLock;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use catchmole_core::events::{DeltaBus, DeltaEvent};
use catchmole_core::flow::{flow_key, protocol_name};
use catchmole_core::lookup::NeighborLookup;
use catchmole_netlink::{interface_addrs, interface_index, NetlinkError};

use crate::model::{ClientStats, FlowDetail, GlobalStats};
use crate::tracker::FlowTracker;

/// Per-event deltas above this are treated as differencing errors escaping
/// the monitor and clamped to zero. Legitimate one-second deltas only
/// approach it at 8 Gb/s and beyond.
const DELTA_SAFE_CAP: u64 = 1024 * 1024 * 1024;

/// EMA factor for active-connection smoothing.
const SMOOTHING_ALPHA: f64 = 0.2;

const DEFAULT_FLOW_TTL: Duration = Duration::from_secs(60);

/// Aggregated flows and local addresses for one client, as served by
/// `/api/client`.
#[derive(Clone, Debug, Default)]
pub struct ClientFlowView {
    pub flows: Vec<FlowDetail>,
    pub active_connections: u64,
    pub local_ips: Vec<String>,
}

struct AggState {
    clients: HashMap<String, ClientStats>,
    flows: HashMap<String, FlowTracker>,

    global_download: u64,
    global_upload: u64,
    global_smoothed_conns: f64,
    start_time: DateTime<Utc>,

    static_names: HashMap<String, String>,
    ignore_lan: bool,
    interface: Option<String>,
    lan_subnets: Vec<IpNetwork>,
    flow_ttl: Duration,
}

pub struct Aggregator {
    resolver: Arc<dyn NeighborLookup>,
    inner: RwLock<AggState>,
}

impl Aggregator {
    pub fn new(resolver: Arc<dyn NeighborLookup>) -> Self {
        Self {
            resolver,
            inner: RwLock::new(AggState {
                clients: HashMap::new(),
                flows: HashMap::new(),
                global_download: 0,
                global_upload: 0,
                global_smoothed_conns: 0.0,
                start_time: Utc::now(),
                static_names: HashMap::new(),
                ignore_lan: true,
                interface: None,
                lan_subnets: Vec::new(),
                flow_ttl: DEFAULT_FLOW_TTL,
            }),
        }
    }

    /// Spawns the drain and tick workers. The drain exits when the delta
    /// stream closes; the tick runs until aborted.
    pub fn start(self: &Arc<Self>, events: DeltaBus, interval: Duration) -> Vec<JoinHandle<()>> {
        let drain = {
            let agg = Arc::clone(self);
            tokio::spawn(async move {
                loop {
                    while let Some(event) = events.recv() {
                        agg.handle_event(event);
                    }
                    if events.is_closed() {
                        break;
                    }
                    tokio::time::sleep(Duration::from_millis(5)).await;
                }
                debug!("delta stream closed, aggregator drain exiting");
            })
        };

        let tick = {
            let agg = Arc::clone(self);
            tokio::spawn(async move {
                let mut ticker = tokio::time::interval(interval);
                ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
                loop {
                    ticker.tick().await;
                    let agg = Arc::clone(&agg);
                    // Neighbor and address refreshes are blocking kernel I/O.
                    if tokio::task::spawn_blocking(move || agg.tick()).await.is_err() {
                        warn!("aggregator tick panicked");
                    }
                }
            })
        };

        vec![drain, tick]
    }

    /// Applies one delta event under the exclusive lock.
    pub fn handle_event(&self, event: DeltaEvent) {
        let state = &mut *self.inner.write();
        let now = event.timestamp;

        // Interface subnet filter: with an interface configured, at least one
        // endpoint must sit in one of its subnets.
        if state.interface.is_some()
            && !in_any(&state.lan_subnets, event.src_ip)
            && !in_any(&state.lan_subnets, event.dst_ip)
        {
            return;
        }

        if is_multicast_or_broadcast(&event.dst_ip) {
            return;
        }

        let src_mac = self.resolver.lookup(&event.src_ip);
        let dst_mac = self.resolver.lookup(&event.dst_ip);

        let key = flow_key(
            &event.src_ip,
            event.src_port,
            &event.dst_ip,
            event.dst_port,
            event.proto,
        );

        if !state.flows.contains_key(&key) && state.ignore_lan {
            // LAN-to-LAN filter, applied only when creating a tracker.
            let both_lan = if state.lan_subnets.is_empty() {
                src_mac.is_some() && dst_mac.is_some()
            } else {
                in_any(&state.lan_subnets, event.src_ip) && in_any(&state.lan_subnets, event.dst_ip)
            };
            if both_lan {
                return;
            }
        }

        let mut orig_delta = event.orig_delta;
        let mut reply_delta = event.reply_delta;
        if orig_delta > DELTA_SAFE_CAP {
            warn!(flow_id = event.flow_id, delta = orig_delta, "oversized origin delta clamped");
            orig_delta = 0;
        }
        if reply_delta > DELTA_SAFE_CAP {
            warn!(flow_id = event.flow_id, delta = reply_delta, "oversized reply delta clamped");
            reply_delta = 0;
        }

        let tracker = state.flows.entry(key).or_insert_with(|| {
            FlowTracker::new(
                event.flow_id,
                event.src_ip,
                event.dst_ip,
                event.src_port,
                event.dst_port,
                event.proto,
                now,
            )
        });
        tracker.last_seen = now;
        tracker.total_orig += orig_delta;
        tracker.total_reply += reply_delta;

        if orig_delta == 0 && reply_delta == 0 {
            return;
        }

        let wall = Utc::now();
        let src_local = src_mac.is_some();
        let dst_local = dst_mac.is_some() && dst_mac != src_mac;

        if let Some(mac) = &src_mac {
            let client = get_client(&mut state.clients, &state.static_names, mac, wall);
            client.total_upload += orig_delta;
            client.session_upload += orig_delta;
            client.total_download += reply_delta;
            client.session_download += reply_delta;
            client.last_active = wall;
        }

        if dst_local {
            if let Some(mac) = &dst_mac {
                // From the destination's perspective origin bytes arrive.
                let client = get_client(&mut state.clients, &state.static_names, mac, wall);
                client.total_download += orig_delta;
                client.session_download += orig_delta;
                client.total_upload += reply_delta;
                client.session_upload += reply_delta;
                client.last_active = wall;
            }
        }

        // Global WAN totals: only flows with exactly one local endpoint.
        if src_local && !dst_local {
            state.global_upload += orig_delta;
            state.global_download += reply_delta;
        } else if dst_local && !src_local {
            state.global_download += orig_delta;
            state.global_upload += reply_delta;
        }
    }

    /// The periodic tick: neighbor refresh, LAN subnet refresh, speed
    /// recomputation, TTL sweep, and connection-count smoothing.
    pub fn tick(&self) {
        self.resolver.refresh();
        self.refresh_subnets();
        self.run_tick(Instant::now());
    }

    pub(crate) fn run_tick(&self, now: Instant) {
        let state = &mut *self.inner.write();

        for client in state.clients.values_mut() {
            client.raw_conns = 0;
            if let Some((up, down)) =
                client
                    .speed
                    .sample(now, client.total_upload, client.total_download)
            {
                client.upload_speed = up;
                client.download_speed = down;
            }
        }

        let ttl = state.flow_ttl;
        state
            .flows
            .retain(|_, f| now.saturating_duration_since(f.last_seen) <= ttl);

        let mut global_raw = 0u64;
        let clients = &mut state.clients;
        for tracker in state.flows.values_mut() {
            if let Some((orig, reply)) =
                tracker
                    .speed
                    .sample(now, tracker.total_orig, tracker.total_reply)
            {
                tracker.orig_speed = orig;
                tracker.reply_speed = reply;
            }

            global_raw += 1;
            if let Some(mac) = self.resolver.lookup(&tracker.src_ip) {
                if let Some(client) = clients.get_mut(&mac) {
                    client.raw_conns += 1;
                }
            }
            if let Some(mac) = self.resolver.lookup(&tracker.dst_ip) {
                if let Some(client) = clients.get_mut(&mac) {
                    client.raw_conns += 1;
                }
            }
        }

        for client in clients.values_mut() {
            client.smoothed_conns = smooth(client.smoothed_conns, client.raw_conns);
            client.active_connections = round_conns(client.smoothed_conns);
        }
        state.global_smoothed_conns = smooth(state.global_smoothed_conns, global_raw);
    }

    fn refresh_subnets(&self) {
        let Some(name) = self.inner.read().interface.clone() else {
            return;
        };
        let subnets = match interface_index(&name).and_then(interface_addrs) {
            Ok(subnets) => subnets,
            Err(e) => {
                debug!("subnet refresh for {name} failed: {e}");
                return;
            }
        };
        self.inner.write().lan_subnets = subnets;
    }

    // ---- read API ------------------------------------------------------

    pub fn global_stats(&self) -> GlobalStats {
        let state = self.inner.read();
        let mut download_speed = 0u64;
        let mut upload_speed = 0u64;
        for client in state.clients.values() {
            download_speed += client.download_speed;
            upload_speed += client.upload_speed;
        }
        GlobalStats {
            total_download: state.global_download,
            total_upload: state.global_upload,
            download_speed,
            upload_speed,
            active_connections: round_conns(state.global_smoothed_conns),
        }
    }

    /// All known clients, sorted by MAC for stable output.
    pub fn clients(&self) -> Vec<ClientStats> {
        let state = self.inner.read();
        let mut clients: Vec<ClientStats> = state.clients.values().cloned().collect();
        clients.sort_by(|a, b| a.mac.cmp(&b.mac));
        clients
    }

    pub fn client_with_session(&self, mac: &str) -> Option<ClientStats> {
        self.inner.read().clients.get(mac).cloned()
    }

    pub fn start_time(&self) -> DateTime<Utc> {
        self.inner.read().start_time
    }

    /// Aggregated per-remote-endpoint view of one client's flows.
    pub fn flows_by_mac(&self, mac: &str) -> ClientFlowView {
        self.flows_by_mac_at(mac, Instant::now())
    }

    pub(crate) fn flows_by_mac_at(&self, mac: &str, now: Instant) -> ClientFlowView {
        #[derive(Default)]
        struct Bucket {
            total_download: u64,
            total_upload: u64,
            session_download: u64,
            session_upload: u64,
            download_speed: u64,
            upload_speed: u64,
            conns: u64,
            local_ip: String,
            first_seen: Option<Instant>,
            last_seen: Option<Instant>,
        }

        let state = self.inner.read();
        let mut buckets: HashMap<(u8, String, u16), Bucket> = HashMap::new();
        let mut ip_set: HashSet<String> = HashSet::new();

        for tracker in state.flows.values() {
            let src_mac = self.resolver.lookup(&tracker.src_ip);
            let dst_mac = self.resolver.lookup(&tracker.dst_ip);
            let is_src = src_mac.as_deref() == Some(mac);
            let is_dst = dst_mac.as_deref() == Some(mac);
            if !is_src && !is_dst {
                continue;
            }

            if is_src {
                ip_set.insert(tracker.src_ip.to_string());
            }
            if is_dst {
                ip_set.insert(tracker.dst_ip.to_string());
            }

            // Remote endpoint is the opposite side; byte direction flips when
            // the client sits on the destination side of the tuple.
            let (local_ip, remote_ip, remote_port) = if is_src {
                (tracker.src_ip, tracker.dst_ip, tracker.dst_port)
            } else {
                (tracker.dst_ip, tracker.src_ip, tracker.src_port)
            };
            let (download, upload, session_download, session_upload, download_speed, upload_speed) =
                if is_src {
                    (
                        tracker.total_reply,
                        tracker.total_orig,
                        tracker.session_reply(),
                        tracker.session_orig(),
                        tracker.reply_speed,
                        tracker.orig_speed,
                    )
                } else {
                    (
                        tracker.total_orig,
                        tracker.total_reply,
                        tracker.session_orig(),
                        tracker.session_reply(),
                        tracker.orig_speed,
                        tracker.reply_speed,
                    )
                };

            let bucket = buckets
                .entry((tracker.proto, remote_ip.to_string(), remote_port))
                .or_default();
            if bucket.conns == 0 {
                bucket.local_ip = local_ip.to_string();
            }
            bucket.total_download += download;
            bucket.total_upload += upload;
            bucket.session_download += session_download;
            bucket.session_upload += session_upload;
            bucket.download_speed += download_speed;
            bucket.upload_speed += upload_speed;
            bucket.conns += 1;
            bucket.first_seen = Some(match bucket.first_seen {
                Some(seen) => seen.min(tracker.first_seen),
                None => tracker.first_seen,
            });
            bucket.last_seen = Some(match bucket.last_seen {
                Some(seen) => seen.max(tracker.last_seen),
                None => tracker.last_seen,
            });
        }

        let ttl_secs = state.flow_ttl.as_secs() as i64;
        let mut flows = Vec::with_capacity(buckets.len());
        let mut active_connections = 0u64;
        for ((proto, remote_ip, remote_port), bucket) in buckets {
            active_connections += bucket.conns;
            let first_seen = bucket.first_seen.unwrap_or(now);
            let last_seen = bucket.last_seen.unwrap_or(now);
            flows.push(FlowDetail {
                protocol: protocol_name(proto),
                client_ip: bucket.local_ip,
                remote_ip,
                remote_port,
                total_download: bucket.total_download,
                total_upload: bucket.total_upload,
                session_download: bucket.session_download,
                session_upload: bucket.session_upload,
                download_speed: bucket.download_speed,
                upload_speed: bucket.upload_speed,
                duration: last_seen.saturating_duration_since(first_seen).as_secs(),
                active_connections: bucket.conns,
                ttl_remaining: ttl_secs
                    - now.saturating_duration_since(last_seen).as_secs() as i64,
            });
        }
        flows.sort_by(|a, b| {
            (&a.remote_ip, a.remote_port, &a.protocol).cmp(&(&b.remote_ip, b.remote_port, &b.protocol))
        });

        let mut local_ips: Vec<String> = ip_set.into_iter().collect();
        local_ips.sort();

        ClientFlowView {
            flows,
            active_connections,
            local_ips,
        }
    }

    // ---- resets --------------------------------------------------------

    /// Zeroes global totals and the start time, drops all clients and flow
    /// trackers. Configuration is untouched.
    pub fn reset(&self) {
        let state = &mut *self.inner.write();
        state.start_time = Utc::now();
        state.global_download = 0;
        state.global_upload = 0;
        state.clients.clear();
        state.flows.clear();
        info!("global statistics reset");
    }

    /// Drops the client entirely, along with every tracker that currently
    /// resolves to its MAC on either endpoint.
    pub fn reset_client_by_mac(&self, mac: &str) {
        let state = &mut *self.inner.write();
        state.clients.remove(mac);
        let resolver = &self.resolver;
        state.flows.retain(|_, f| {
            resolver.lookup(&f.src_ip).as_deref() != Some(mac)
                && resolver.lookup(&f.dst_ip).as_deref() != Some(mac)
        });
    }

    /// Zeroes the client's session counters and drops its trackers; new
    /// trackers start with fresh session baselines on the next event.
    /// Cumulative client totals are preserved.
    pub fn reset_session_by_mac(&self, mac: &str) {
        let state = &mut *self.inner.write();
        if let Some(client) = state.clients.get_mut(mac) {
            client.session_download = 0;
            client.session_upload = 0;
        }
        let resolver = &self.resolver;
        state.flows.retain(|_, f| {
            resolver.lookup(&f.src_ip).as_deref() != Some(mac)
                && resolver.lookup(&f.dst_ip).as_deref() != Some(mac)
        });
    }

    // ---- configuration -------------------------------------------------

    /// Restricts accounting to the given interface and primes its subnet
    /// list; the tick keeps the list current afterwards.
    pub fn set_interface(&self, name: &str) -> Result<(), NetlinkError> {
        let ifindex = interface_index(name)?;
        let subnets = interface_addrs(ifindex)?;
        let state = &mut *self.inner.write();
        for net in &subnets {
            info!("detected LAN subnet {net} on {name}");
        }
        state.interface = Some(name.to_string());
        state.lan_subnets = subnets;
        Ok(())
    }

    pub fn set_ignore_lan(&self, ignore: bool) {
        self.inner.write().ignore_lan = ignore;
    }

    pub fn set_flow_ttl(&self, ttl: Duration) {
        let ttl = if ttl.is_zero() { DEFAULT_FLOW_TTL } else { ttl };
        self.inner.write().flow_ttl = ttl;
    }

    /// Installs the static MAC → display-name table (keys lower-cased) and
    /// renames already-known clients to match.
    pub fn set_device_names(&self, names: &HashMap<String, String>) {
        let state = &mut *self.inner.write();
        state.static_names = names
            .iter()
            .map(|(mac, name)| (mac.to_lowercase(), name.clone()))
            .collect();
        for (mac, client) in state.clients.iter_mut() {
            if let Some(name) = state.static_names.get(mac) {
                client.name = name.clone();
            }
        }
    }

    #[cfg(test)]
    pub(crate) fn set_interface_for_test(&self, name: &str, subnets: Vec<IpNetwork>) {
        let state = &mut *self.inner.write();
        state.interface = Some(name.to_string());
        state.lan_subnets = subnets;
    }
}

fn get_client<'a>(
    clients: &'a mut HashMap<String, ClientStats>,
    static_names: &HashMap<String, String>,
    mac: &str,
    now: DateTime<Utc>,
) -> &'a mut ClientStats {
    clients.entry(mac.to_string()).or_insert_with(|| {
        let name = static_names.get(mac).cloned().unwrap_or_else(|| mac.to_string());
        ClientStats::new(mac.to_string(), name, now)
    })
}

fn in_any(subnets: &[IpNetwork], ip: IpAddr) -> bool {
    subnets.iter().any(|net| net.contains(ip))
}

fn is_multicast_or_broadcast(ip: &IpAddr) -> bool {
    match ip {
        IpAddr::V4(v4) => v4.is_multicast() || v4.is_broadcast(),
        IpAddr::V6(v6) => v6.is_multicast(),
    }
}

/// EMA with the seed rule: a jump from smoothed 0 to a positive raw count
/// adopts the raw value outright instead of ramping up from zero.
fn smooth(smoothed: f64, raw: u64) -> f64 {
    if smoothed == 0.0 && raw > 0 {
        raw as f64
    } else {
        SMOOTHING_ALPHA * raw as f64 + (1.0 - SMOOTHING_ALPHA) * smoothed
    }
}

fn round_conns(smoothed: f64) -> u64 {
    (smoothed + 0.5) as u64
}
