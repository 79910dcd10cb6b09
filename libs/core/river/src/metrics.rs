//! Counters on the `metrics` facade.
//!
//! Recording only; embedding applications install whatever recorder
//! they expose (Prometheus, statsd, none).

use metrics::counter;

/// A message reached a terminal state: `acked`, `rejected`, `invalid`.
pub fn record_message(queue: &str, status: &'static str) {
    counter!("river_messages_total", "queue" => queue.to_string(), "status" => status)
        .increment(1);
}

/// A worker error-path traversal: `connection` or `handler`.
pub fn record_worker_error(queue: &str, category: &'static str) {
    counter!("river_worker_errors_total", "queue" => queue.to_string(), "category" => category)
        .increment(1);
}

/// The connection retry policy backed off during `op`.
pub fn record_connection_retry(op: &'static str) {
    counter!("river_connection_retries_total", "op" => op).increment(1);
}

pub fn record_worker_spawned(queue: &str) {
    counter!("river_workers_spawned_total", "queue" => queue.to_string()).increment(1);
}

pub fn record_worker_died(queue: &str) {
    counter!("river_workers_died_total", "queue" => queue.to_string()).increment(1);
}
