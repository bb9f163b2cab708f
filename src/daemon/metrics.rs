//! Prometheus metrics for the event loop

use lazy_static::lazy_static;
use prometheus::{register_gauge, register_histogram_vec, Encoder, Gauge, HistogramVec, TextEncoder};

/// Label carrying the outcome of a sync or job
pub const LABEL_SUCCESS: &str = "success";

lazy_static! {
    /// Histogram: sync attempt duration (seconds)
    pub static ref SYNC_DURATION: HistogramVec = register_histogram_vec!(
        "reconciler_sync_duration_seconds",
        "Duration of sync attempts, in seconds",
        &[LABEL_SUCCESS],
        vec![0.5, 1.0, 2.5, 5.0, 10.0, 30.0, 60.0, 120.0, 300.0]
    )
    .expect("Failed to create sync_duration metric");

    /// Histogram: background job duration (seconds)
    pub static ref JOB_DURATION: HistogramVec = register_histogram_vec!(
        "reconciler_job_duration_seconds",
        "Duration of background jobs, in seconds",
        &[LABEL_SUCCESS],
        vec![0.1, 0.5, 1.0, 2.5, 5.0, 10.0, 30.0, 60.0]
    )
    .expect("Failed to create job_duration metric");

    /// Gauge: jobs waiting in the queue
    pub static ref JOB_QUEUE_LENGTH: Gauge = register_gauge!(
        "reconciler_job_queue_length",
        "Count of jobs waiting in the queue"
    )
    .expect("Failed to create job_queue_length metric");
}

fn success_label(success: bool) -> &'static str {
    if success {
        "true"
    } else {
        "false"
    }
}

/// Record a sync attempt's duration
pub fn record_sync_duration(success: bool, duration_secs: f64) {
    SYNC_DURATION
        .with_label_values(&[success_label(success)])
        .observe(duration_secs);
}

/// Record a job's duration
pub fn record_job_duration(success: bool, duration_secs: f64) {
    JOB_DURATION
        .with_label_values(&[success_label(success)])
        .observe(duration_secs);
}

/// Set the job queue depth
pub fn set_queue_length(len: usize) {
    JOB_QUEUE_LENGTH.set(len as f64);
}

/// Encode all metrics as Prometheus text format
pub fn encode_metrics() -> crate::Result<String> {
    let encoder = TextEncoder::new();
    let metric_families = prometheus::gather();
    let mut buffer = Vec::new();
    encoder
        .encode(&metric_families, &mut buffer)
        .map_err(|e| crate::ReconcilerError::Other(format!("Failed to encode metrics: {}", e)))?;
    String::from_utf8(buffer)
        .map_err(|e| crate::ReconcilerError::Other(format!("Metrics are not UTF-8: {}", e)))
}
