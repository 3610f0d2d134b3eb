//! Metrics definitions for the Access gate.
//!
//! All metrics follow Prometheus naming conventions:
//! - `cf_access_` prefix
//! - `_total` suffix for counters
//! - `_seconds` suffix for duration histograms
//!
//! # Cardinality
//!
//! Labels are bounded to prevent cardinality explosion:
//! - `outcome`: 3 values (accepted, rejected, error)
//! - `reason`: bounded by `RejectReason` variants plus `none`
//! - `status`: 2 values (success, error)
//! - `guard`: 2 values (require_auth, require_identity)
//! - `decision`: 4 values (allow, unauthorized, forbidden, unavailable)

use crate::errors::RejectReason;
use metrics::{counter, histogram};
use std::time::Duration;

/// Outcome of one `authenticate` call.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AuthOutcome {
    Accepted,
    Rejected(RejectReason),
    /// The broker could not be reached, so no decision was made.
    Error,
}

impl AuthOutcome {
    fn labels(&self) -> (&'static str, &'static str) {
        match self {
            AuthOutcome::Accepted => ("accepted", "none"),
            AuthOutcome::Rejected(reason) => ("rejected", reason.as_str()),
            AuthOutcome::Error => ("error", "none"),
        }
    }
}

/// Record an authentication attempt.
///
/// Metric: `cf_access_authentications_total`
/// Labels: `outcome`, `reason`
pub fn record_authentication(outcome: AuthOutcome) {
    let (outcome, reason) = outcome.labels();
    counter!("cf_access_authentications_total",
        "outcome" => outcome,
        "reason" => reason
    )
    .increment(1);
}

/// Record a key set fetch from the broker.
///
/// Metric: `cf_access_jwks_fetches_total`, `cf_access_jwks_fetch_duration_seconds`
/// Labels: `status`
pub fn record_jwks_fetch(status: &'static str, duration: Duration) {
    counter!("cf_access_jwks_fetches_total", "status" => status).increment(1);
    histogram!("cf_access_jwks_fetch_duration_seconds", "status" => status)
        .record(duration.as_secs_f64());
}

/// Record an identity document fetch.
///
/// Metric: `cf_access_identity_fetches_total`
/// Labels: `status`
pub fn record_identity_fetch(status: &'static str) {
    counter!("cf_access_identity_fetches_total", "status" => status).increment(1);
}

/// Record a guard decision.
///
/// Metric: `cf_access_guard_decisions_total`
/// Labels: `guard`, `decision`
pub fn record_guard_decision(guard: &'static str, decision: &'static str) {
    counter!("cf_access_guard_decisions_total",
        "guard" => guard,
        "decision" => decision
    )
    .increment(1);
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use metrics_util::debugging::{DebugValue, DebuggingRecorder};

    /// Collect `(name, labels, value)` for every metric recorded inside `f`.
    fn capture(f: impl FnOnce()) -> Vec<(String, Vec<(String, String)>, DebugValue)> {
        let recorder = DebuggingRecorder::new();
        let snapshotter = recorder.snapshotter();

        metrics::with_local_recorder(&recorder, f);

        snapshotter
            .snapshot()
            .into_vec()
            .into_iter()
            .map(|(key, _, _, value)| {
                let key = key.key();
                let labels = key
                    .labels()
                    .map(|l| (l.key().to_string(), l.value().to_string()))
                    .collect();
                (key.name().to_string(), labels, value)
            })
            .collect()
    }

    fn label<'a>(labels: &'a [(String, String)], name: &str) -> Option<&'a str> {
        labels
            .iter()
            .find(|(k, _)| k == name)
            .map(|(_, v)| v.as_str())
    }

    #[test]
    fn test_record_authentication_rejected_carries_reason() {
        let recorded = capture(|| {
            record_authentication(AuthOutcome::Rejected(RejectReason::WrongAudience));
        });

        assert_eq!(recorded.len(), 1);
        let (name, labels, value) = recorded.first().unwrap();
        assert_eq!(name, "cf_access_authentications_total");
        assert_eq!(label(labels, "outcome"), Some("rejected"));
        assert_eq!(label(labels, "reason"), Some("wrong_audience"));
        assert_eq!(value, &DebugValue::Counter(1));
    }

    #[test]
    fn test_record_authentication_outcomes_are_distinct_series() {
        let recorded = capture(|| {
            record_authentication(AuthOutcome::Accepted);
            record_authentication(AuthOutcome::Accepted);
            record_authentication(AuthOutcome::Error);
        });

        let accepted = recorded
            .iter()
            .find(|(_, labels, _)| label(labels, "outcome") == Some("accepted"))
            .unwrap();
        assert_eq!(accepted.2, DebugValue::Counter(2));
        assert_eq!(label(&accepted.1, "reason"), Some("none"));

        assert!(recorded
            .iter()
            .any(|(_, labels, _)| label(labels, "outcome") == Some("error")));
    }

    #[test]
    fn test_record_jwks_fetch_emits_counter_and_histogram() {
        let recorded = capture(|| {
            record_jwks_fetch("success", Duration::from_millis(15));
        });

        let names: Vec<&str> = recorded.iter().map(|(n, _, _)| n.as_str()).collect();
        assert!(names.contains(&"cf_access_jwks_fetches_total"));
        assert!(names.contains(&"cf_access_jwks_fetch_duration_seconds"));

        let (_, _, histogram) = recorded
            .iter()
            .find(|(n, _, _)| n == "cf_access_jwks_fetch_duration_seconds")
            .unwrap();
        assert!(matches!(histogram, DebugValue::Histogram(values) if values.len() == 1));
    }

    #[test]
    fn test_record_identity_fetch() {
        let recorded = capture(|| {
            record_identity_fetch("error");
        });

        let (name, labels, _) = recorded.first().unwrap();
        assert_eq!(name, "cf_access_identity_fetches_total");
        assert_eq!(label(labels, "status"), Some("error"));
    }

    #[test]
    fn test_record_guard_decision() {
        let recorded = capture(|| {
            record_guard_decision("require_identity", "forbidden");
        });

        let (name, labels, value) = recorded.first().unwrap();
        assert_eq!(name, "cf_access_guard_decisions_total");
        assert_eq!(label(labels, "guard"), Some("require_identity"));
        assert_eq!(label(labels, "decision"), Some("forbidden"));
        assert_eq!(value, &DebugValue::Counter(1));
    }
}
