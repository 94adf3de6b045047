#![cfg_attr(
    not(test),
    deny(
        clippy::unwrap_used,
        clippy::expect_used,
        clippy::panic,
        clippy::unimplemented,
        clippy::todo,
        clippy::indexing_slicing
    )
)]

//! # Agora Telemetry
//!
//! Observability infrastructure for the Agora node: structured logging
//! initialization and abstract sinks that decouple metric instrumentation
//! from any concrete backend. Dashboards and exporters live outside the
//! kernel; the kernel only ever talks to the sink traits.

/// The initialization routine for global structured logging.
pub mod init;
/// Abstract traits (`*MetricsSink`) that define the contract for metrics reporting.
pub mod sinks;
/// Apply-path stopwatch that reports into the ingest sink and flags
/// budget overruns.
pub mod time;

pub use init::init_tracing;
pub use sinks::{ingest_metrics, protocol_metrics, NopSink};
pub use time::IngestStopwatch;
