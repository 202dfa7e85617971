//! Metrics collection for observability
//!
//! Metrics are recorded through the `metrics` facade; installing a recorder
//! (and any exporter) is left to the embedding binary.

use metrics::{counter, describe_counter, describe_gauge, describe_histogram, gauge, histogram};
use std::time::Instant;

pub const STORE_READS: &str = "store.operations.read";
pub const STORE_WRITES: &str = "store.operations.write";
pub const STORE_DELETES: &str = "store.operations.delete";

pub const CATALOG_REQUESTS: &str = "catalog.requests.total";
pub const CATALOG_REQUESTS_FAILED: &str = "catalog.requests.failed";
pub const CATALOG_REQUEST_DURATION: &str = "catalog.request.duration_ms";
pub const CATALOG_CONFLICT_RETRIES: &str = "catalog.conflicts.retried";
pub const CATALOG_TRANSACTIONS_COMMITTED: &str = "catalog.transactions.committed";
pub const CATALOG_TRANSACTIONS_ROLLED_BACK: &str = "catalog.transactions.rolled_back";

pub const SERVICE_REQUESTS: &str = "catalog.service.requests";
pub const SERVICE_REJECTED: &str = "catalog.service.rejected";
pub const SERVICE_OPEN_TRANSACTIONS: &str = "catalog.service.transactions.open";
pub const SERVICE_TRANSACTIONS_REAPED: &str = "catalog.service.transactions.reaped";
pub const SERVICE_FRAME_BYTES: &str = "catalog.service.frame_bytes";

pub const MERGE_RUNS: &str = "merge.runs.total";
pub const MERGE_FAILURES: &str = "merge.runs.failed";
pub const MERGE_RECORDS: &str = "merge.records.upserted";

/// Initialize metrics with descriptions
pub fn init_metrics() {
    // Store metrics
    describe_counter!(STORE_READS, "Store read operations");
    describe_counter!(STORE_WRITES, "Store write operations");
    describe_counter!(STORE_DELETES, "Store delete operations");

    // Catalog client metrics
    describe_counter!(CATALOG_REQUESTS, "Catalog RPC requests sent");
    describe_counter!(CATALOG_REQUESTS_FAILED, "Catalog RPC requests that failed");
    describe_histogram!(
        CATALOG_REQUEST_DURATION,
        "Catalog RPC round-trip duration in milliseconds"
    );
    describe_counter!(
        CATALOG_CONFLICT_RETRIES,
        "Metadata writes retried after a row version conflict"
    );
    describe_counter!(CATALOG_TRANSACTIONS_COMMITTED, "Catalog transactions committed");
    describe_counter!(CATALOG_TRANSACTIONS_ROLLED_BACK, "Catalog transactions rolled back");

    // Catalog service metrics
    describe_counter!(SERVICE_REQUESTS, "Requests handled by the catalog service");
    describe_counter!(
        SERVICE_REJECTED,
        "Requests rejected before dispatch (auth, replay, framing)"
    );
    describe_gauge!(SERVICE_OPEN_TRANSACTIONS, "Open server-side transactions");
    describe_counter!(
        SERVICE_TRANSACTIONS_REAPED,
        "Transactions rolled back after idling or losing their connection"
    );
    describe_histogram!(SERVICE_FRAME_BYTES, "Size of request frames in bytes");

    // Merge metrics
    describe_counter!(MERGE_RUNS, "Merge/sync procedures started");
    describe_counter!(MERGE_FAILURES, "Merge/sync procedures that rolled back");
    describe_counter!(MERGE_RECORDS, "Records upserted by merge/sync procedures");
}

/// Record a counter metric
pub fn record_counter(name: &'static str, value: u64) {
    counter!(name).increment(value);
}

/// Record a gauge metric
pub fn record_gauge(name: &'static str, value: f64) {
    gauge!(name).set(value);
}

/// Record a histogram metric
pub fn record_histogram(name: &'static str, value: f64) {
    histogram!(name).record(value);
}

/// Timer for measuring operation duration
pub struct Timer {
    name: &'static str,
    start: Instant,
}

impl Timer {
    pub fn new(name: &'static str) -> Self {
        Self {
            name,
            start: Instant::now(),
        }
    }

    /// Stop the timer and record the duration in milliseconds
    pub fn stop(self) {
        let duration = self.start.elapsed();
        histogram!(self.name).record(duration.as_secs_f64() * 1000.0);
    }
}
