use crate::constants::{MAX_ESTIMATED_WAIT, MAX_RETRIES, RETRY_FLOOR};
use crate::types::{ModelReadiness, RelayError};
use axum::http::StatusCode;
use lazy_static::lazy_static;
use regex::Regex;
use serde_json::Value;
use std::time::Duration;

lazy_static! {
    static ref ESTIMATED_TIME_RE: Regex =
        Regex::new(r#"estimated_(?:time|seconds)"?\s*[:=]\s*([0-9]+(?:\.[0-9]+)?)"#)
            .expect("static regex");
}

/// Decides whether a failed attempt is retried and how long to wait first.
#[derive(Debug, Clone, Copy)]
pub struct RetryPolicy {
    pub max_retries: u32,
    pub floor: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::new(MAX_RETRIES, RETRY_FLOOR)
    }
}

impl RetryPolicy {
    pub fn new(max_retries: u32, floor: Duration) -> Self {
        Self { max_retries, floor }
    }

    /// `attempt` is zero-based: the first submission is attempt 0.
    pub fn should_retry(&self, attempt: u32, err: &RelayError) -> bool {
        err.is_retryable() && attempt < self.max_retries
    }

    pub fn backoff(&self, estimated_seconds: Option<f64>) -> Duration {
        estimated_wait(estimated_seconds).max(self.floor)
    }
}

/// An upstream wait estimate as a `Duration`, capped at `MAX_ESTIMATED_WAIT`.
/// Missing, negative or non-finite estimates are zero.
pub fn estimated_wait(estimated_seconds: Option<f64>) -> Duration {
    match estimated_seconds {
        Some(s) if s.is_finite() && s > 0.0 => Duration::try_from_secs_f64(s)
            .unwrap_or(MAX_ESTIMATED_WAIT)
            .min(MAX_ESTIMATED_WAIT),
        _ => Duration::ZERO,
    }
}

/// Pulls an estimated wait out of an upstream error body, if it has one.
pub fn extract_estimated_seconds(body: &str) -> Option<f64> {
    if let Ok(json) = serde_json::from_str::<Value>(body) {
        return estimated_from_json(&json);
    }
    ESTIMATED_TIME_RE
        .captures(body)
        .and_then(|c| c.get(1))
        .and_then(|m| m.as_str().parse::<f64>().ok())
}

fn estimated_from_json(json: &Value) -> Option<f64> {
    let lookup = |v: &Value| {
        v.get("estimated_seconds")
            .or_else(|| v.get("estimated_time"))
            .and_then(|t| t.as_f64())
    };
    lookup(json).or_else(|| json.get("error").and_then(lookup))
}

/// Best human-readable message in an upstream error body.
pub fn extract_error_message(body: &str) -> String {
    if let Ok(json) = serde_json::from_str::<Value>(body) {
        let candidates = [
            json.get("detail"),
            json.get("error").and_then(|e| e.get("message")),
            json.get("error"),
            json.get("message"),
        ];
        for c in candidates.into_iter().flatten() {
            if let Some(s) = c.as_str() {
                if !s.trim().is_empty() {
                    return s.to_string();
                }
            }
        }
    }
    let trimmed = body.trim();
    if trimmed.is_empty() {
        "Upstream returned an empty error body".to_string()
    } else {
        crate::str_utils::prefix_chars(trimmed, 500).to_string()
    }
}

/// Turns a non-2xx upstream response into either a retryable loading error or a hard failure.
pub fn classify_upstream_failure(status: StatusCode, body: &str) -> RelayError {
    let message = extract_error_message(body);
    match extract_estimated_seconds(body) {
        Some(estimated_seconds) => RelayError::UpstreamLoading {
            estimated_seconds,
            message,
        },
        None => RelayError::Upstream(status, message),
    }
}

/// Readiness of a model from the response to a minimal probe.
///
/// A 422 means the endpoint is reachable and the model rejected the probe payload,
/// which is the only positive signal some providers give for an empty request.
pub fn classify_probe(status: StatusCode, body: &str) -> ModelReadiness {
    if status.is_success() || status == StatusCode::UNPROCESSABLE_ENTITY {
        return ModelReadiness::Online;
    }
    if extract_estimated_seconds(body).is_some() {
        return ModelReadiness::Loading;
    }
    ModelReadiness::Offline
}
