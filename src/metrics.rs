//! Engine metrics, exposed in Prometheus format
//!
//! Every recorder here is a no-op until [`init_metrics`] installs the exporter.

use metrics::{counter, gauge, histogram};
use metrics_exporter_prometheus::PrometheusBuilder;
use std::net::SocketAddr;

/// Installs the Prometheus exporter listening on `addr`
pub fn init_metrics(addr: SocketAddr) -> Result<(), Box<dyn std::error::Error>> {
    PrometheusBuilder::new()
        .with_http_listener(addr)
        .install()?;
    Ok(())
}

/// Record an inserted row and its point count
pub fn record_insert(points: u64) {
    counter!("memquery.insert.rows").increment(1);
    counter!("memquery.insert.points").increment(points);
}

/// Estimated bytes held by the working memtable
pub fn update_memtable_bytes(bytes: u64) {
    gauge!("memquery.memtable.bytes").set(bytes as f64);
}

pub fn update_outstanding_tvlists(count: usize) {
    gauge!("memquery.tvlist.outstanding").set(count as f64);
}

/// Record a finished query
pub fn record_query(duration_ms: f64) {
    counter!("memquery.query.count").increment(1);
    histogram!("memquery.query.duration_ms").record(duration_ms);
}

/// Record bytes written to a spill file
pub fn record_spill(bytes: u64) {
    counter!("memquery.spill.files").increment(1);
    counter!("memquery.spill.bytes").increment(bytes);
}

/// Record a memtable flush
pub fn record_flush(points: u64, duration_ms: f64) {
    counter!("memquery.flush.points").increment(points);
    histogram!("memquery.flush.duration_ms").record(duration_ms);
}
