//! Defines abstract traits for metrics reporting, decoupling core logic from the backend.

use once_cell::sync::OnceCell;

// --- Static Sink Access ---

/// A no-op sink for use in tests or when telemetry is disabled.
#[derive(Debug, Clone, Copy)]
pub struct NopSink;

/// A lazily-initialized static reference to the global `MetricsSink` implementation.
pub static SINK: OnceCell<&'static dyn MetricsSink> = OnceCell::new();
static NOP_SINK: NopSink = NopSink;

/// Returns a static reference to the configured ingest metrics sink.
/// If no sink has been initialized, it returns a no-op sink.
pub fn ingest_metrics() -> &'static dyn IngestMetricsSink {
    SINK.get().copied().unwrap_or(&NOP_SINK)
}

/// Returns a static reference to the configured protocol metrics sink.
/// If no sink has been initialized, it returns a no-op sink.
pub fn protocol_metrics() -> &'static dyn ProtocolMetricsSink {
    SINK.get().copied().unwrap_or(&NOP_SINK)
}

// --- Trait Definitions ---

/// A sink for metrics related to envelope ingestion.
pub trait IngestMetricsSink: Send + Sync + std::fmt::Debug {
    /// Increments the counter for envelopes accepted, labeled by verb.
    fn inc_envelopes_accepted(&self, verb: &str);
    /// Increments the counter for envelopes dropped at verification.
    fn inc_envelopes_rejected(&self, code: &str);
    /// Increments the counter for ingress policy denials.
    fn inc_policy_denials(&self, code: &str);
    /// Observes how long one envelope spent in the pipeline.
    fn observe_ingest_duration(&self, duration_secs: f64);
}
impl IngestMetricsSink for NopSink {
    fn inc_envelopes_accepted(&self, _verb: &str) {}
    fn inc_envelopes_rejected(&self, _code: &str) {}
    fn inc_policy_denials(&self, _code: &str) {}
    fn observe_ingest_duration(&self, _duration_secs: f64) {}
}

/// A sink for metrics related to the negotiation protocol.
pub trait ProtocolMetricsSink: Send + Sync + std::fmt::Debug {
    /// Increments the counter for need slots decided.
    fn inc_slots_decided(&self);
    /// Increments the counter for leases scavenged after missed heartbeats.
    fn inc_leases_scavenged(&self);
    /// Increments the counter for tasks finalized.
    fn inc_tasks_finalized(&self);
    /// Increments the counter for challenges, labeled by outcome.
    fn inc_challenges(&self, outcome: &str);
}
impl ProtocolMetricsSink for NopSink {
    fn inc_slots_decided(&self) {}
    fn inc_leases_scavenged(&self) {}
    fn inc_tasks_finalized(&self) {}
    fn inc_challenges(&self, _outcome: &str) {}
}

/// The union trait a backend implements to serve every sink.
pub trait MetricsSink: IngestMetricsSink + ProtocolMetricsSink {}
impl MetricsSink for NopSink {}

/// Installs the process-wide sink. Later calls are ignored.
pub fn install(sink: &'static dyn MetricsSink) {
    let _ = SINK.set(sink);
}
