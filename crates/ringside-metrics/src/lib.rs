//! Ringside Metrics - sample aggregation for fight sessions
//!
//! Folds raw watcher samples into per-participant running statistics.
//! Duration and sample counts only ever grow within a session's lifetime;
//! duplicate and overly stale samples are dropped on ingestion.

pub mod aggregator;

pub use aggregator::{
    AggregatorConfig, IngestStatus, MetricsAggregator, MetricsError, MetricsSnapshot,
    ParticipantMetrics,
};
