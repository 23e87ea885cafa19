//! Observability for cadence daemons.
//!
//! - **Logging**: human-readable or JSON output via `tracing-subscriber`
//! - **Metrics**: process-wide counters, gauges and a cycle-duration
//!   histogram with Prometheus text export

pub mod logging;
pub mod metrics;
