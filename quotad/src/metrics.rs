//! Prometheus metrics for reconciliation runs.
//!
//! Everything is recorded through the `metrics` facade. Nothing is exported unless
//! [`install_exporter`] has installed a recorder.

use metrics::{Unit, describe_counter, describe_histogram};
use metrics_exporter_prometheus::PrometheusBuilder;

use crate::config::MetricsConfig;

/// Runs started by the scheduler or `--once`, by `outcome` (`completed`, `fetch_failed`).
pub const RUNS_TOTAL: &str = "quotad_runs_total";
/// Ticks skipped because a run was still in flight.
pub const RUNS_SKIPPED_TOTAL: &str = "quotad_runs_skipped_total";
/// Per-profile writes, by `outcome` (`disabled`, `incremented`, `failed`).
pub const RECORDS_TOTAL: &str = "quotad_records_total";
/// Wall time of a run from fetch to last write.
pub const RUN_DURATION_SECONDS: &str = "quotad_run_duration_seconds";

/// Register descriptions for every metric this crate emits.
pub fn describe() {
    describe_counter!(RUNS_TOTAL, "Reconciliation runs by outcome");
    describe_counter!(RUNS_SKIPPED_TOTAL, "Scheduled ticks skipped while a run was in flight");
    describe_counter!(RECORDS_TOTAL, "Profile writes by outcome");
    describe_histogram!(RUN_DURATION_SECONDS, Unit::Seconds, "Reconciliation run duration");
}

/// Start the Prometheus HTTP listener on `config.listen`.
pub fn install_exporter(config: &MetricsConfig) -> anyhow::Result<()> {
    PrometheusBuilder::new()
        .with_http_listener(config.listen)
        .install()
        .map_err(|e| anyhow::anyhow!("failed to install prometheus exporter on {}: {e}", config.listen))?;

    describe();
    Ok(())
}
