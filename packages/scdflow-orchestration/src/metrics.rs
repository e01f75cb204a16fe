//! Prometheus metrics (feature `metrics`)

use std::sync::OnceLock;

use prometheus::{
    register_int_counter_vec_with_registry, Encoder, IntCounterVec, Opts, Registry, TextEncoder,
};

/// Orchestrator counters
#[derive(Clone)]
pub struct OrchestratorMetrics {
    pub registry: Registry,
    pub runs: IntCounterVec,
    pub batches: IntCounterVec,
    pub events_applied: IntCounterVec,
    pub anomalies: IntCounterVec,
}

impl OrchestratorMetrics {
    pub fn new(registry: Registry) -> prometheus::Result<Self> {
        Ok(Self {
            runs: register_int_counter_vec_with_registry!(
                Opts::new("scdflow_task_runs_total", "Task runs by final status"),
                &["task_id", "status"],
                registry
            )?,
            batches: register_int_counter_vec_with_registry!(
                Opts::new("scdflow_batches_committed_total", "Merge batches committed"),
                &["dataset"],
                registry
            )?,
            events_applied: register_int_counter_vec_with_registry!(
                Opts::new("scdflow_events_applied_total", "Ledger events applied by merges"),
                &["dataset"],
                registry
            )?,
            anomalies: register_int_counter_vec_with_registry!(
                Opts::new("scdflow_anomalies_total", "Anomalies reported"),
                &["kind"],
                registry
            )?,
            registry,
        })
    }
}

static METRICS: OnceLock<Option<OrchestratorMetrics>> = OnceLock::new();

pub fn global() -> Option<&'static OrchestratorMetrics> {
    METRICS
        .get_or_init(|| OrchestratorMetrics::new(Registry::new()).ok())
        .as_ref()
}

pub fn record_run(task_id: &str, status: &str) {
    if let Some(m) = global() {
        m.runs.with_label_values(&[task_id, status]).inc();
    }
}

pub fn record_batch(dataset: &str, events_applied: usize) {
    if let Some(m) = global() {
        m.batches.with_label_values(&[dataset]).inc();
        m.events_applied
            .with_label_values(&[dataset])
            .inc_by(events_applied as u64);
    }
}

pub fn record_anomaly(kind: &str) {
    if let Some(m) = global() {
        m.anomalies.with_label_values(&[kind]).inc();
    }
}

/// Text exposition of every counter
pub fn gather() -> String {
    let Some(m) = global() else {
        return String::new();
    };
    let mut buffer = Vec::new();
    if TextEncoder::new()
        .encode(&m.registry.gather(), &mut buffer)
        .is_err()
    {
        return String::new();
    }
    String::from_utf8(buffer).unwrap_or_default()
}
