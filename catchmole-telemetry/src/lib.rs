//! # CatchMole Telemetry
//!
//! Crate for logging and metrics-export functionality.

pub mod logging;
pub mod metrics;

pub use logging::EventLogger;
pub use metrics::MetricsRecorder;
