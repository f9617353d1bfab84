use std::net::SocketAddr;

use metrics_exporter_prometheus::{BuildError, PrometheusBuilder};
use tracing::debug;

use crate::engine::EngineError;

// ── Request-driven metrics ──────────────────────────────────────

/// Counter: events committed to the WAL and applied. Labels: event.
pub const EVENTS_COMMITTED_TOTAL: &str = "visitcore_events_committed_total";

/// Counter: operations refused by a slot rule or a lifecycle guard. Labels: op, code.
pub const REJECTIONS_TOTAL: &str = "visitcore_rejections_total";

// ── Storage metrics ─────────────────────────────────────────────

/// Histogram: WAL group-commit flush duration in seconds.
pub const WAL_FLUSH_DURATION_SECONDS: &str = "visitcore_wal_flush_duration_seconds";

/// Histogram: WAL group-commit batch size (events per flush).
pub const WAL_FLUSH_BATCH_SIZE: &str = "visitcore_wal_flush_batch_size";

/// Counter: completed WAL compactions.
pub const WAL_COMPACTIONS_TOTAL: &str = "visitcore_wal_compactions_total";

/// Record a refused operation. Logged at debug: refusals are normal traffic.
pub fn rejected(op: &'static str, err: &EngineError) {
    let code = err.code();
    metrics::counter!(REJECTIONS_TOTAL, "op" => op, "code" => code.as_str()).increment(1);
    debug!(op, code = code.as_str(), "rejected: {err}");
}

/// Install the fmt subscriber once per process; later calls are no-ops.
pub fn init_tracing() {
    let _ = tracing_subscriber::fmt::try_init();
}

/// Install the Prometheus exporter on the given port. No-op if port is None.
pub fn init_metrics(port: Option<u16>) -> Result<(), BuildError> {
    let Some(port) = port else { return Ok(()) };
    let addr: SocketAddr = ([0, 0, 0, 0], port).into();
    PrometheusBuilder::new().with_http_listener(addr).install()?;
    tracing::info!("metrics endpoint: http://0.0.0.0:{port}/metrics");
    Ok(())
}

/// Logging plus, when a port is given, the metrics endpoint.
pub fn init(metrics_port: Option<u16>) -> Result<(), BuildError> {
    init_tracing();
    init_metrics(metrics_port)
}
