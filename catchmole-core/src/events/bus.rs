//! Bounded SPSC bus carrying delta events from the monitor to the aggregator.
//!
//! A circular buffer with atomic head/tail counters. The producer side never
//! blocks: when the buffer is full the caller drops the event, which is safe
//! here because conntrack counters are cumulative and the next sample for the
//! same flow recovers the missed bytes.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use thiserror::Error;

use super::delta::DeltaEvent;

/// Bus error conditions.
#[derive(Error, Debug)]
pub enum BusError {
    #[error("delta bus capacity exceeded")]
    Full,
    #[error("invalid capacity (must be a power of two)")]
    InvalidCapacity,
}

/// Cache-line aligned atomic counter to prevent false sharing
#[repr(align(64))]
struct AlignedCounter(AtomicU64);

impl AlignedCounter {
    #[inline]
    fn new(value: u64) -> Self {
        Self(AtomicU64::new(value))
    }
}

struct InnerBus {
    buffer: Box<[std::cell::UnsafeCell<Option<DeltaEvent>>]>,
    head: AlignedCounter,
    tail: AlignedCounter,
    mask: usize,
    closed: AtomicBool,
}

/// Single-producer single-consumer delta event channel.
///
/// The conntrack worker is the only producer and the aggregator drain task
/// the only consumer; clones made with [`DeltaBus::share`] refer to the same
/// underlying buffer.
pub struct DeltaBus {
    inner: Arc<InnerBus>,
}

impl DeltaBus {
    /// Creates a bus with the given capacity.
    ///
    /// # Arguments
    ///
    /// * `capacity` - Must be a power of two for efficient index masking.
    pub fn with_capacity(capacity: usize) -> Result<Self, BusError> {
        if !capacity.is_power_of_two() {
            return Err(BusError::InvalidCapacity);
        }

        let buffer = (0..capacity)
            .map(|_| std::cell::UnsafeCell::new(None))
            .collect::<Vec<_>>()
            .into_boxed_slice();

        Ok(Self {
            inner: Arc::new(InnerBus {
                buffer,
                head: AlignedCounter::new(0),
                tail: AlignedCounter::new(0),
                mask: capacity - 1,
                closed: AtomicBool::new(false),
            }),
        })
    }

    /// Creates a new handle to the shared bus.
    #[inline]
    pub fn share(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }

    /// Attempts to enqueue an event; fails with [`BusError::Full`] instead of
    /// blocking.
    ///
    /// # Safety
    ///
    /// Uses unsafe code for interior mutability guarded by atomic counters.
    #[inline]
    pub fn send(&self, event: DeltaEvent) -> Result<(), BusError> {
        let head = self.inner.head.0.load(Ordering::Relaxed);
        let tail = self.inner.tail.0.load(Ordering::Acquire);

        if head - tail >= self.inner.buffer.len() as u64 {
            return Err(BusError::Full);
        }

        // SAFETY: Exclusive write access ensured by atomic counters
        unsafe {
            let idx = (head as usize) & self.inner.mask;
            *self.inner.buffer[idx].get() = Some(event)
        }

        self.inner.head.0.store(head + 1, Ordering::Release);
        Ok(())
    }

    /// Attempts to dequeue the next event.
    ///
    /// Returns `None` if the bus is empty.
    #[inline]
    pub fn recv(&self) -> Option<DeltaEvent> {
        let tail = self.inner.tail.0.load(Ordering::Relaxed);
        let head = self.inner.head.0.load(Ordering::Acquire);

        if head == tail {
            return None;
        }

        // SAFETY: Exclusive read access ensured by atomic counters
        let event = unsafe {
            let idx = (tail as usize) & self.inner.mask;
            (*self.inner.buffer[idx].get()).take()
        };

        self.inner.tail.0.store(tail + 1, Ordering::Release);
        event
    }

    /// Marks the producer side as finished. Queued events stay readable;
    /// the consumer treats closed-and-empty as end of stream.
    pub fn close(&self) {
        self.inner.closed.store(true, Ordering::Release);
    }

    pub fn is_closed(&self) -> bool {
        self.inner.closed.load(Ordering::Acquire)
    }

    /// Number of events currently queued.
    #[inline]
    pub fn len(&self) -> usize {
        let head = self.inner.head.0.load(Ordering::Acquire);
        let tail = self.inner.tail.0.load(Ordering::Acquire);
        (head - tail) as usize
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

// SAFETY: Thread safety ensured by atomic counters and Arc
unsafe impl Send for InnerBus {}
unsafe impl Sync for InnerBus {}
