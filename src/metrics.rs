//! Evaluation counters shared by the request handlers.

use std::sync::{Mutex, MutexGuard, PoisonError};

use serde::Serialize;

use crate::error::CellError;
use crate::session::unix_seconds_now;

#[derive(Debug, Default)]
struct Counters {
    attempts: u64,
    successes: u64,
    failures: u64,
    security_failures: u64,
    total_elapsed_ms: f64,
    max_elapsed_ms: f64,
    last_run_at: Option<f64>,
    last_error: Option<String>,
    last_security_violation: Option<String>,
    last_error_details: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct MetricsSnapshot {
    pub attempts: u64,
    pub successes: u64,
    pub failures: u64,
    pub security_failures: u64,
    /// Mean over successful runs only; `0.0` before the first success.
    pub avg_elapsed_ms: f64,
    pub max_elapsed_ms: f64,
    pub last_run_at: Option<f64>,
    pub last_error: Option<String>,
    pub last_security_violation: Option<String>,
    pub last_error_details: Option<String>,
}

#[derive(Debug, Default)]
pub struct EvaluationMetrics {
    counters: Mutex<Counters>,
}

impl EvaluationMetrics {
    pub fn new() -> Self {
        Self::default()
    }

    fn counters(&self) -> MutexGuard<'_, Counters> {
        self.counters.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn record_success(&self, elapsed_ms: f64) {
        let now = unix_seconds_now();
        let mut c = self.counters();
        c.attempts += 1;
        c.successes += 1;
        c.total_elapsed_ms += elapsed_ms;
        c.max_elapsed_ms = c.max_elapsed_ms.max(elapsed_ms);
        c.last_run_at = Some(now);
    }

    pub fn record_failure(&self, message: &str, is_security: bool, details: Option<&str>) {
        let now = unix_seconds_now();
        let mut c = self.counters();
        c.attempts += 1;
        c.failures += 1;
        c.last_run_at = Some(now);
        c.last_error = Some(message.to_string());
        if is_security {
            c.security_failures += 1;
            c.last_security_violation = Some(message.to_string());
        }
        c.last_error_details = Some(details.unwrap_or(message).to_string());
    }

    /// Record a failed evaluation. The traceback, when present, becomes the
    /// detail text.
    pub fn record_error(&self, err: &CellError) {
        let details = match err {
            CellError::Evaluation { traceback, .. } => traceback.as_deref(),
            _ => None,
        };
        self.record_failure(&err.to_string(), err.is_security_violation(), details);
    }

    pub fn snapshot(&self) -> MetricsSnapshot {
        let c = self.counters();
        MetricsSnapshot {
            attempts: c.attempts,
            successes: c.successes,
            failures: c.failures,
            security_failures: c.security_failures,
            avg_elapsed_ms: if c.successes > 0 {
                c.total_elapsed_ms / c.successes as f64
            } else {
                0.0
            },
            max_elapsed_ms: c.max_elapsed_ms,
            last_run_at: c.last_run_at,
            last_error: c.last_error.clone(),
            last_security_violation: c.last_security_violation.clone(),
            last_error_details: c.last_error_details.clone(),
        }
    }

    pub fn reset(&self) {
        *self.counters() = Counters::default();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_snapshot_has_zero_average() {
        let metrics = EvaluationMetrics::new();
        let snap = metrics.snapshot();
        assert_eq!(snap.attempts, 0);
        assert_eq!(snap.avg_elapsed_ms, 0.0);
        assert!(snap.last_run_at.is_none());
    }

    #[test]
    fn successes_and_failures_are_counted_separately() {
        let metrics = EvaluationMetrics::new();
        metrics.record_success(10.0);
        metrics.record_success(30.0);
        metrics.record_failure("NameError: x", false, Some("Traceback ..."));
        metrics.record_error(&CellError::SecurityViolation {
            message: "import statements are disabled".into(),
        });

        let snap = metrics.snapshot();
        assert_eq!(snap.attempts, 4);
        assert_eq!(snap.successes, 2);
        assert_eq!(snap.failures, 2);
        assert_eq!(snap.security_failures, 1);
        assert_eq!(snap.avg_elapsed_ms, 20.0);
        assert_eq!(snap.max_elapsed_ms, 30.0);
        assert_eq!(
            snap.last_security_violation.as_deref(),
            Some("security violation: import statements are disabled")
        );
        assert_eq!(snap.last_error, snap.last_error_details);
    }

    #[test]
    fn details_default_to_the_message() {
        let metrics = EvaluationMetrics::new();
        metrics.record_failure("boom", false, None);
        assert_eq!(metrics.snapshot().last_error_details.as_deref(), Some("boom"));
        metrics.reset();
        assert_eq!(metrics.snapshot().failures, 0);
    }
}
