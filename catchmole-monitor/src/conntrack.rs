//! Conntrack ingestion: listen + poll merged into one delta stream.
//!
//! One worker thread owns both kernel connections. The listen socket wakes
//! it for multicast events (with a short receive timeout so the loop can
//! also service poll ticks and shutdown), and every `poll_interval` it dumps
//! the full table and synthesizes an update per live flow. Both paths feed
//! the same differencing state, keyed by the kernel's 32-bit flow id, so a
//! sample is differenced correctly no matter which source delivered it
//! first.

use std::collections::hash_map::Entry;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use thiserror::Error;
use tracing::{debug, info, trace, warn};

use catchmole_core::events::{BusError, DeltaBus, DeltaEvent, EventKind};
use catchmole_netlink::conntrack::{ConntrackFlow, ConntrackListener, ConntrackSocket};
use catchmole_netlink::NetlinkError;

/// Sized to ride out event bursts on busy gateways; startup fails if the
/// kernel will not grant it.
const LISTEN_RECV_BUFFER: usize = 2 * 1024 * 1024;

/// Wake-up granularity for poll ticks and shutdown checks.
const LISTEN_TIMEOUT: Duration = Duration::from_millis(200);

const BUS_CAPACITY: usize = 1024;

#[derive(Debug, Error)]
pub enum MonitorError {
    #[error("conntrack socket: {0}")]
    Netlink(#[from] NetlinkError),

    #[error("delta bus: {0}")]
    Bus(#[from] BusError),
}

#[derive(Clone, Copy)]
struct Baseline {
    orig: u64,
    reply: u64,
}

/// Per-flow-id differencing of cumulative counters into deltas.
///
/// The rules absorb the three counter anomalies conntrack exhibits:
/// a flow already in flight at startup (first observation), a transient
/// glitch to zero, and flow-id reuse on a fresh connection.
#[derive(Default)]
pub struct FlowDiff {
    baselines: Mutex<HashMap<u32, Baseline>>,
}

impl FlowDiff {
    pub fn new() -> Self {
        Self::default()
    }

    /// Differences one kernel sample; `None` when nothing should be emitted.
    pub fn apply(&self, flow: &ConntrackFlow) -> Option<DeltaEvent> {
        let mut baselines = self.baselines.lock();

        let (orig_delta, reply_delta) = match baselines.entry(flow.flow_id) {
            Entry::Vacant(slot) => {
                // First observation: adopt the counters without emitting,
                // otherwise a flow already in flight would show up as one
                // giant delta.
                slot.insert(Baseline {
                    orig: flow.orig_bytes,
                    reply: flow.reply_bytes,
                });
                (0, 0)
            }
            Entry::Occupied(mut slot) => {
                let baseline = slot.get_mut();
                let orig = diff_direction(flow.orig_bytes, &mut baseline.orig);
                let reply = diff_direction(flow.reply_bytes, &mut baseline.reply);
                (orig, reply)
            }
        };

        let kind = if flow.destroy {
            baselines.remove(&flow.flow_id);
            EventKind::Destroy
        } else {
            EventKind::Update
        };
        drop(baselines);

        let event = DeltaEvent {
            src_ip: flow.src_ip,
            dst_ip: flow.dst_ip,
            src_port: flow.src_port,
            dst_port: flow.dst_port,
            proto: flow.proto,
            flow_id: flow.flow_id,
            orig_delta,
            reply_delta,
            timestamp: Instant::now(),
            kind,
        };
        if event.is_empty() {
            return None;
        }
        Some(event)
    }

    /// Number of flow ids currently tracked.
    pub fn len(&self) -> usize {
        self.baselines.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.baselines.lock().is_empty()
    }
}

/// One direction's differencing step.
fn diff_direction(current: u64, prev: &mut u64) -> u64 {
    if current >= *prev {
        let delta = current - *prev;
        *prev = current;
        delta
    } else if current == 0 {
        // Transient glitch (hardware-offload artifact): keep the baseline so
        // the counter resuming at its old level does not ramp up spuriously.
        0
    } else {
        // 0 < current < prev: the flow id was reused by a fresh connection;
        // abandon the old baseline.
        *prev = current;
        0
    }
}

/// Background conntrack ingestion with a drop-on-full delta stream.
pub struct ConntrackMonitor {
    bus: DeltaBus,
    shutdown: Arc<AtomicBool>,
    worker: Option<JoinHandle<()>>,
}

impl ConntrackMonitor {
    /// Opens both kernel connections and spawns the ingestion worker.
    ///
    /// Socket or buffer failures here are fatal; once running, listen and
    /// dump errors are logged and the loop continues (the next poll
    /// self-heals any missed samples).
    pub fn start(poll_interval: Duration) -> Result<Self, MonitorError> {
        let listener = ConntrackListener::open(LISTEN_RECV_BUFFER, LISTEN_TIMEOUT)?;
        let dump_sock = ConntrackSocket::open()?;
        let bus = DeltaBus::with_capacity(BUS_CAPACITY)?;

        let shutdown = Arc::new(AtomicBool::new(false));
        let worker = {
            let bus = bus.share();
            let shutdown = shutdown.clone();
            thread::Builder::new()
                .name("conntrack-monitor".into())
                .spawn(move || run_loop(listener, dump_sock, bus, shutdown, poll_interval))
                .map_err(|e| MonitorError::Netlink(NetlinkError::Io(e)))?
        };

        info!(?poll_interval, "conntrack monitor started");
        Ok(Self {
            bus,
            shutdown,
            worker: Some(worker),
        })
    }

    /// Consumer handle for the delta stream.
    pub fn events(&self) -> DeltaBus {
        self.bus.share()
    }

    /// Signals the worker and waits for it to release both connections.
    pub fn stop(&mut self) {
        self.shutdown.store(true, Ordering::Relaxed);
        if let Some(worker) = self.worker.take() {
            if worker.join().is_err() {
                warn!("conntrack worker panicked during shutdown");
            }
        }
    }
}

impl Drop for ConntrackMonitor {
    fn drop(&mut self) {
        self.stop();
    }
}

fn run_loop(
    mut listener: ConntrackListener,
    mut dump_sock: ConntrackSocket,
    bus: DeltaBus,
    shutdown: Arc<AtomicBool>,
    poll_interval: Duration,
) {
    let diff = FlowDiff::new();
    let mut next_poll = Instant::now() + poll_interval;

    while !shutdown.load(Ordering::Relaxed) {
        match listener.next_batch() {
            Ok(Some(flows)) => {
                for flow in &flows {
                    emit(&diff, &bus, flow);
                }
            }
            Ok(None) => {}
            Err(e) => warn!("conntrack listen error: {e}"),
        }

        if Instant::now() >= next_poll {
            match dump_sock.dump() {
                Ok(flows) => {
                    trace!(flows = flows.len(), "conntrack poll");
                    for flow in &flows {
                        emit(&diff, &bus, flow);
                    }
                }
                Err(e) => warn!("conntrack dump error: {e}"),
            }
            next_poll = Instant::now() + poll_interval;
        }
    }
    bus.close();
    debug!("conntrack worker exiting");
}

fn emit(diff: &FlowDiff, bus: &DeltaBus, flow: &ConntrackFlow) {
    if let Some(event) = diff.apply(flow) {
        if bus.send(event).is_err() {
            // Safe to drop: counters are cumulative, the next sample for
            // this flow carries the missed bytes.
            trace!(flow_id = flow.flow_id, "delta bus full, dropping sample");
        }
    }
}
