//! Prometheus Metrics
//!
//! Process-wide counters registered once in the default registry and served
//! by the daemon's `/metrics` endpoint.

use prometheus::{register_int_counter_vec, IntCounterVec};
use std::sync::OnceLock;

/// Storage core metrics
pub struct Metrics {
    /// External commands by program and outcome (ok, failed, timeout, retried)
    pub commands: IntCounterVec,
    /// Maintenance status transitions by kind and status
    pub transitions: IntCounterVec,
    /// Usage samples written by series and mode (inserted, coalesced)
    pub samples: IntCounterVec,
}

impl Metrics {
    fn register() -> Self {
        Self {
            commands: register_int_counter_vec!(
                "storage_pool_manager_commands_total",
                "External tool invocations by outcome",
                &["program", "outcome"]
            )
            .unwrap_or_else(|_| unregistered_counter("commands", &["program", "outcome"])),
            transitions: register_int_counter_vec!(
                "storage_pool_manager_maintenance_transitions_total",
                "Balance and scrub status transitions",
                &["kind", "status"]
            )
            .unwrap_or_else(|_| unregistered_counter("transitions", &["kind", "status"])),
            samples: register_int_counter_vec!(
                "storage_pool_manager_usage_samples_total",
                "Usage samples written",
                &["series", "mode"]
            )
            .unwrap_or_else(|_| unregistered_counter("samples", &["series", "mode"])),
        }
    }
}

fn unregistered_counter(name: &str, labels: &[&str]) -> IntCounterVec {
    // Only reached if a metric of the same name was registered elsewhere
    IntCounterVec::new(
        prometheus::Opts::new(format!("storage_pool_manager_{}_fallback", name), name),
        labels,
    )
    .expect("static metric definition is valid")
}

/// Global metrics handle
pub fn metrics() -> &'static Metrics {
    static METRICS: OnceLock<Metrics> = OnceLock::new();
    METRICS.get_or_init(Metrics::register)
}
