//! Envelope apply-path timing.
//!
//! A stopwatch armed at the top of the apply path. On drop it feeds the
//! measured duration into the ingest sink and, when the envelope overran
//! its budget, writes the offender to the audit log with its verb — slow
//! handlers surface in metrics and logs from the same measurement, and a
//! handler that early-returns still gets measured.

use std::time::{Duration, Instant};

/// Default apply budget: anything slower than this is worth a log line.
const DEFAULT_BUDGET: Duration = Duration::from_millis(250);

/// One timed trip through the apply path.
pub struct IngestStopwatch {
    verb: &'static str,
    budget: Duration,
    started: Instant,
}

impl IngestStopwatch {
    /// Arms a stopwatch for `verb` with the default budget.
    pub fn begin(verb: &'static str) -> Self {
        Self::with_budget(verb, DEFAULT_BUDGET)
    }

    /// Arms a stopwatch with an explicit budget.
    pub fn with_budget(verb: &'static str, budget: Duration) -> Self {
        Self {
            verb,
            budget,
            started: Instant::now(),
        }
    }
}

impl Drop for IngestStopwatch {
    fn drop(&mut self) {
        let elapsed = self.started.elapsed();
        crate::sinks::ingest_metrics().observe_ingest_duration(elapsed.as_secs_f64());
        if elapsed > self.budget {
            tracing::warn!(
                target: "telemetry",
                verb = self.verb,
                elapsed_ms = elapsed.as_millis() as u64,
                budget_ms = self.budget.as_millis() as u64,
                "envelope apply overran its budget"
            );
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn stopwatch_drops_cleanly_under_and_over_budget() {
        {
            let _fast = IngestStopwatch::begin("NEED");
        }
        {
            let _slow = IngestStopwatch::with_budget("COMMIT", Duration::from_millis(0));
            std::thread::sleep(Duration::from_millis(2));
        }
    }
}
