//! Event types and transport for the monitor → aggregator hand-off.

pub mod bus;
pub mod delta;

pub use bus::{BusError, DeltaBus};
pub use delta::{DeltaEvent, EventKind};
