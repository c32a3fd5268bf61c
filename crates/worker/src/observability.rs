use std::sync::OnceLock;

use anyhow::Result;
use metrics::{counter, gauge, histogram};
use metrics_exporter_prometheus::{PrometheusBuilder, PrometheusHandle};

const LINKS_PROCESSED_TOTAL: &str = "benang_worker_link_jobs_processed_total";
const LINK_PROCESSING_DURATION_MS: &str = "benang_worker_link_job_duration_ms";
const QUEUE_READY_GAUGE: &str = "benang_worker_queue_ready_total";
const QUEUE_DELAYED_GAUGE: &str = "benang_worker_queue_delayed_total";
const QUEUE_PROCESSING_GAUGE: &str = "benang_worker_queue_processing_total";
const QUEUE_LAG_GAUGE: &str = "benang_worker_queue_lag_ms";
const SWEEP_REPAIRS_TOTAL: &str = "benang_worker_sweep_repairs_total";

static METRICS_HANDLE: OnceLock<PrometheusHandle> = OnceLock::new();

pub fn init_metrics() -> Result<()> {
    let handle = PrometheusBuilder::new().install_recorder()?;
    let _ = METRICS_HANDLE.set(handle);
    Ok(())
}

pub fn _render_metrics() -> Option<String> {
    METRICS_HANDLE.get().map(PrometheusHandle::render)
}

pub fn register_link_job(job_type: &str, result: &str, duration_ms: f64) {
    counter!(
        LINKS_PROCESSED_TOTAL,
        "job_type" => job_type.to_string(),
        "result" => result.to_string()
    )
    .increment(1);

    histogram!(
        LINK_PROCESSING_DURATION_MS,
        "job_type" => job_type.to_string()
    )
    .record(duration_ms.max(0.0));
}

pub fn register_sweep_repairs(repaired: usize) {
    counter!(SWEEP_REPAIRS_TOTAL).increment(repaired as u64);
}

pub fn set_queue_depth_gauge(ready: u64, delayed: u64, processing: u64) {
    gauge!(QUEUE_READY_GAUGE).set(ready as f64);
    gauge!(QUEUE_DELAYED_GAUGE).set(delayed as f64);
    gauge!(QUEUE_PROCESSING_GAUGE).set(processing as f64);
}

pub fn set_queue_lag_ms(lag_ms: i64) {
    gauge!(QUEUE_LAG_GAUGE).set(lag_ms.max(0) as f64);
}
