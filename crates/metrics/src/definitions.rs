//! Metric name and label definitions.
//!
//! Every metric the worker emits is named here so the set of exported series
//! is documented in one place.

/// Mirror loop metrics
pub mod mirror {
    /// Mirror cycles by outcome (`changed`, `unchanged`, `failed`)
    pub const CYCLES_TOTAL: &str = "deckhand_mirror_cycles_total";
    /// Wall-clock duration of one mirror cycle in seconds
    pub const CYCLE_DURATION_SECONDS: &str = "deckhand_mirror_cycle_duration_seconds";
    /// Jobs reported by the executor on the last successful listing
    pub const JOBS_OBSERVED: &str = "deckhand_mirror_jobs_observed";
    /// Current backoff delay before the next mirror cycle in seconds
    pub const BACKOFF_SECONDS: &str = "deckhand_mirror_backoff_seconds";
}

/// Command queue drain metrics
pub mod drain {
    /// Executor commands run for queued requests, labelled by queue and status
    pub const EXECUTIONS_TOTAL: &str = "deckhand_drain_executions_total";
    /// Executor command duration in seconds, labelled by queue
    pub const EXECUTION_DURATION_SECONDS: &str = "deckhand_drain_execution_duration_seconds";
    /// Requests skipped because another pass had already claimed them
    pub const CLAIM_CONFLICTS_TOTAL: &str = "deckhand_drain_claim_conflicts_total";
}

/// Stuck-request watchdog metrics
pub mod watchdog {
    /// Requests force-failed after sitting in `queued` past the cutoff
    pub const REQUESTS_FAILED_TOTAL: &str = "deckhand_watchdog_requests_failed_total";
    /// Audit activity writes that failed and were dropped
    pub const AUDIT_FAILURES_TOTAL: &str = "deckhand_watchdog_audit_failures_total";
}

/// Per-loop health
pub mod loops {
    /// Cycles that returned an error, labelled by loop
    pub const CYCLE_ERRORS_TOTAL: &str = "deckhand_loop_cycle_errors_total";
    /// Cycles skipped because the previous one was still in flight
    pub const CYCLES_SKIPPED_TOTAL: &str = "deckhand_loop_cycles_skipped_total";
}

/// Common label keys
pub mod labels {
    pub const QUEUE: &str = "queue";
    pub const STATUS: &str = "status";
    pub const OUTCOME: &str = "outcome";
    pub const LOOP: &str = "loop";
}

/// Standard histogram buckets for different metric types
pub mod buckets {
    use once_cell::sync::Lazy;

    /// Mirror cycle duration buckets (in seconds)
    /// Covers 10ms to the 20s listing timeout
    pub static MIRROR_DURATION: Lazy<Vec<f64>> = Lazy::new(|| {
        vec![
            0.01, 0.05, 0.1, 0.25, 0.5, 1.0, 2.5, 5.0, 10.0, 15.0, 20.0,
        ]
    });

    /// Executor command duration buckets (in seconds)
    /// Covers 100ms to the 10 minute run timeout
    pub static COMMAND_DURATION: Lazy<Vec<f64>> = Lazy::new(|| {
        vec![
            0.1, 0.5, 1.0, 2.5, 5.0, 10.0, 30.0, 60.0, 120.0, 300.0, 600.0,
        ]
    });
}
