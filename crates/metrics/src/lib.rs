//! Metrics collection and export for deckhand.
//!
//! Uses the `metrics` crate facade. With the `prometheus` feature, metrics are
//! exported in Prometheus text format, either rendered on demand through
//! [`MetricsHandle::render`] or served from a scrape listener.
//!
//! ```rust,ignore
//! use deckhand_metrics::{counter, mirror};
//!
//! counter!(mirror::CYCLES_TOTAL, "outcome" => "changed").increment(1);
//! ```

mod definitions;
mod recorder;

pub use {
    definitions::*,
    recorder::{MetricsHandle, MetricsRecorderConfig, init_metrics},
};

// Re-export metrics macros for convenience
pub use metrics::{counter, gauge, histogram};
