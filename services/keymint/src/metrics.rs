//! Prometheus metrics for token minting.

use once_cell::sync::Lazy;
use prometheus::{register_counter_vec, register_histogram_vec, CounterVec, HistogramVec};
use std::time::Duration;

static TOKEN_REQUESTS: Lazy<CounterVec> = Lazy::new(|| {
    register_counter_vec!(
        "keymint_token_requests_total",
        "Total token requests by backend and outcome",
        &["backend", "status"]
    )
    .expect("Failed to register token_requests metric")
});

static TOKEN_LATENCY: Lazy<HistogramVec> = Lazy::new(|| {
    register_histogram_vec!(
        "keymint_token_latency_seconds",
        "End-to-end token latency, lock wait included",
        &["backend"],
        vec![0.001, 0.005, 0.01, 0.025, 0.05, 0.1, 0.25, 0.5, 1.0, 2.5, 5.0]
    )
    .expect("Failed to register token_latency metric")
});

static LOCK_WAIT: Lazy<HistogramVec> = Lazy::new(|| {
    register_histogram_vec!(
        "keymint_lock_wait_seconds",
        "Time spent waiting for the per-source lock",
        &["backend"],
        vec![0.0001, 0.001, 0.01, 0.05, 0.1, 0.5, 1.0, 5.0]
    )
    .expect("Failed to register lock_wait metric")
});

static CLOSE_FAILURES: Lazy<CounterVec> = Lazy::new(|| {
    register_counter_vec!(
        "keymint_signer_close_failures_total",
        "Signer sessions that failed to close cleanly",
        &["backend"]
    )
    .expect("Failed to register close_failures metric")
});

/// Metrics recorder shared by all token sources.
#[derive(Debug, Clone, Copy, Default)]
pub struct TokenMetrics;

impl TokenMetrics {
    /// Create a recorder, registering the collectors on first use.
    #[must_use]
    pub fn new() -> Self {
        Lazy::force(&TOKEN_REQUESTS);
        Lazy::force(&TOKEN_LATENCY);
        Lazy::force(&LOCK_WAIT);
        Lazy::force(&CLOSE_FAILURES);
        Self
    }

    /// Record a finished token request.
    pub fn record_request(&self, backend: &str, success: bool, latency: Duration) {
        let status = if success { "success" } else { "failure" };
        TOKEN_REQUESTS.with_label_values(&[backend, status]).inc();
        TOKEN_LATENCY
            .with_label_values(&[backend])
            .observe(latency.as_secs_f64());
    }

    /// Record time spent queued behind other callers.
    pub fn record_lock_wait(&self, backend: &str, wait: Duration) {
        LOCK_WAIT
            .with_label_values(&[backend])
            .observe(wait.as_secs_f64());
    }

    /// Record a session that could not be closed.
    pub fn record_close_failure(&self, backend: &str) {
        CLOSE_FAILURES.with_label_values(&[backend]).inc();
    }
}
