//! Per-pipeline counters

use std::sync::atomic::{AtomicU64, Ordering};

/// Delivery counters of one pipeline, shared by its stream tasks
#[derive(Debug, Default)]
pub struct PipelineStats {
    /// Records handed to the operator chain
    pub events_received: AtomicU64,
    /// Records that reached every operator
    pub events_delivered: AtomicU64,
    /// Records dropped by an operator
    pub events_dropped: AtomicU64,
    /// Records whose delivery failed
    pub events_failed: AtomicU64,
}

/// Point-in-time copy of [`PipelineStats`]
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct StatsSnapshot {
    pub events_received: u64,
    pub events_delivered: u64,
    pub events_dropped: u64,
    pub events_failed: u64,
}

impl PipelineStats {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn snapshot(&self) -> StatsSnapshot {
        StatsSnapshot {
            events_received: self.events_received.load(Ordering::Relaxed),
            events_delivered: self.events_delivered.load(Ordering::Relaxed),
            events_dropped: self.events_dropped.load(Ordering::Relaxed),
            events_failed: self.events_failed.load(Ordering::Relaxed),
        }
    }
}

type Counter = (&'static str, &'static str, fn(&StatsSnapshot) -> u64);

const COUNTERS: [Counter; 4] = [
    (
        "tracewire_events_received_total",
        "Records handed to the operator chain",
        |s| s.events_received,
    ),
    (
        "tracewire_events_delivered_total",
        "Records that reached every operator",
        |s| s.events_delivered,
    ),
    (
        "tracewire_events_dropped_total",
        "Records dropped by an operator",
        |s| s.events_dropped,
    ),
    (
        "tracewire_events_failed_total",
        "Records whose delivery failed",
        |s| s.events_failed,
    ),
];

/// Counters of several pipelines in Prometheus text format, one family
/// per counter with a `pipeline` label
pub fn to_prometheus(pipelines: &[(&str, StatsSnapshot)]) -> String {
    let mut output = String::new();

    for (metric, help, value) in COUNTERS {
        output.push_str(&format!("# HELP {} {}\n", metric, help));
        output.push_str(&format!("# TYPE {} counter\n", metric));
        for (pipeline, snapshot) in pipelines {
            output.push_str(&format!(
                "{}{{pipeline=\"{}\"}} {}\n",
                metric,
                pipeline,
                value(snapshot)
            ));
        }
        output.push('\n');
    }

    output
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_prometheus_output() {
        let dns = PipelineStats::new();
        dns.events_received.fetch_add(3, Ordering::Relaxed);
        dns.events_failed.fetch_add(1, Ordering::Relaxed);
        let exec = PipelineStats::new();
        exec.events_delivered.fetch_add(7, Ordering::Relaxed);

        let text = to_prometheus(&[("dns", dns.snapshot()), ("exec", exec.snapshot())]);
        assert!(text.contains("# TYPE tracewire_events_received_total counter"));
        assert!(text.contains("tracewire_events_received_total{pipeline=\"dns\"} 3"));
        assert!(text.contains("tracewire_events_failed_total{pipeline=\"dns\"} 1"));
        assert!(text.contains("tracewire_events_dropped_total{pipeline=\"dns\"} 0"));
        assert!(text.contains("tracewire_events_delivered_total{pipeline=\"exec\"} 7"));
        // One family header per counter, whatever the pipeline count
        assert_eq!(text.matches("# TYPE").count(), 4);
    }
}
