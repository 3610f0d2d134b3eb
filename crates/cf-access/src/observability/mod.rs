//! Observability for the Access gate.
//!
//! Counters and histograms are emitted through the `metrics` facade; the
//! embedding application chooses the exporter. Logging uses `tracing` with
//! `cf_access.*` targets.

pub mod metrics;
