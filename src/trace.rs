use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use crate::store::CoordStore;

/// HTTP header carrying the trace id end-to-end.
pub const TRACE_HEADER: &str = "x-trace-id";

/// A stage in the request pipeline.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Step {
    /// Request received by the gateway
    Received,
    /// JWT authentication
    Auth,
    /// Rate limiting check
    RateLimit,
    /// Circuit breaker check
    Circuit,
    /// Forwarding to the backend
    Forward,
    /// Response received from the backend
    Response,
    /// Request completed
    Complete,
}

/// Outcome of a pipeline step.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Status {
    Pending,
    Running,
    Success,
    Failed,
    Skipped,
}

/// A trace event emitted during request processing and published on the
/// `trace:{trace_id}` channel.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TraceEvent {
    pub trace_id: String,
    pub step: Step,
    pub status: Status,
    pub timestamp: DateTime<Utc>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub duration_us: Option<i64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(default, skip_serializing_if = "HashMap::is_empty")]
    pub details: HashMap<String, Value>,
}

impl TraceEvent {
    pub fn new(trace_id: impl Into<String>, step: Step, status: Status) -> Self {
        Self {
            trace_id: trace_id.into(),
            step,
            status,
            timestamp: Utc::now(),
            duration_us: None,
            error: None,
            details: HashMap::new(),
        }
    }

    pub fn with_duration(mut self, duration: Duration) -> Self {
        self.duration_us = Some(duration.as_micros() as i64);
        self
    }

    pub fn with_error(mut self, error: impl Into<String>) -> Self {
        self.error = Some(error.into());
        self
    }

    pub fn with_detail(mut self, key: impl Into<String>, value: impl Into<Value>) -> Self {
        self.details.insert(key.into(), value.into());
        self
    }
}

/// Generate a fresh 128-bit trace id as 32 hex characters.
pub fn generate_trace_id() -> String {
    uuid::Uuid::new_v4().simple().to_string()
}

/// First path segment without the leading slash: "/service-a/hello" -> "service-a".
pub fn extract_service(path: &str) -> String {
    path.trim_start_matches('/')
        .split('/')
        .next()
        .unwrap_or("")
        .to_string()
}

/// Publishes trace events on the coordination store. Publishing is
/// best-effort: failures are logged and swallowed, and a publisher without a
/// store silently drops events so the gateway can run without one.
#[derive(Clone)]
pub struct TracePublisher {
    store: Option<Arc<CoordStore>>,
}

impl TracePublisher {
    pub fn new(store: Option<Arc<CoordStore>>) -> Self {
        Self { store }
    }

    /// A publisher that drops every event.
    pub fn disabled() -> Self {
        Self { store: None }
    }

    pub fn enabled(&self) -> bool {
        self.store.is_some()
    }

    pub async fn publish(&self, event: &TraceEvent) {
        let Some(store) = &self.store else {
            return;
        };
        let payload = match serde_json::to_vec(event) {
            Ok(payload) => payload,
            Err(err) => {
                tracing::warn!(error = %err, "failed to serialize trace event");
                return;
            }
        };
        let channel = format!("trace:{}", event.trace_id);
        if let Err(err) = store.publish(&channel, &payload).await {
            tracing::warn!(error = %err, channel = %channel, "trace publish failed");
        }
    }
}

/// Per-request carrier threaded through the pipeline as a request extension.
/// Lives exactly as long as the request.
#[derive(Clone)]
pub struct RequestContext {
    pub trace_id: String,
    pub publisher: TracePublisher,
    pub received_at: std::time::Instant,
}

impl RequestContext {
    pub fn new(trace_id: String, publisher: TracePublisher) -> Self {
        Self {
            trace_id,
            publisher,
            received_at: std::time::Instant::now(),
        }
    }

    /// Emit a single step event for this request.
    pub async fn emit(&self, event: TraceEvent) {
        self.publisher.publish(&event).await;
    }

    pub fn event(&self, step: Step, status: Status) -> TraceEvent {
        TraceEvent::new(self.trace_id.clone(), step, status)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_generate_trace_id_is_32_hex() {
        let id = generate_trace_id();
        assert_eq!(id.len(), 32);
        assert!(id.chars().all(|c| c.is_ascii_hexdigit()));
    }

    #[test]
    fn test_generate_trace_id_unique() {
        assert_ne!(generate_trace_id(), generate_trace_id());
    }

    #[test]
    fn test_extract_service() {
        assert_eq!(extract_service("/service-a/hello"), "service-a");
        assert_eq!(extract_service("/service-a"), "service-a");
        assert_eq!(extract_service("/"), "");
        assert_eq!(extract_service(""), "");
    }

    #[test]
    fn test_step_serialization_names() {
        assert_eq!(serde_json::to_string(&Step::Received).unwrap(), "\"RECEIVED\"");
        assert_eq!(serde_json::to_string(&Step::RateLimit).unwrap(), "\"RATE_LIMIT\"");
        assert_eq!(serde_json::to_string(&Step::Circuit).unwrap(), "\"CIRCUIT\"");
        assert_eq!(serde_json::to_string(&Status::Success).unwrap(), "\"SUCCESS\"");
        assert_eq!(serde_json::to_string(&Status::Failed).unwrap(), "\"FAILED\"");
    }

    #[test]
    fn test_event_json_shape() {
        let event = TraceEvent::new("abc123", Step::Forward, Status::Failed)
            .with_duration(Duration::from_micros(1500))
            .with_error("backend timeout")
            .with_detail("service", "/service-a");

        let json: Value = serde_json::to_value(&event).unwrap();
        assert_eq!(json["trace_id"], "abc123");
        assert_eq!(json["step"], "FORWARD");
        assert_eq!(json["status"], "FAILED");
        assert_eq!(json["duration_us"], 1500);
        assert_eq!(json["error"], "backend timeout");
        assert_eq!(json["details"]["service"], "/service-a");
    }

    #[test]
    fn test_event_omits_empty_fields() {
        let event = TraceEvent::new("abc123", Step::Received, Status::Success);
        let json: Value = serde_json::to_value(&event).unwrap();
        let obj = json.as_object().unwrap();
        assert!(!obj.contains_key("duration_us"));
        assert!(!obj.contains_key("error"));
        assert!(!obj.contains_key("details"));
    }

    #[tokio::test]
    async fn test_disabled_publisher_drops_events() {
        let publisher = TracePublisher::disabled();
        assert!(!publisher.enabled());
        // Must not panic or block.
        publisher
            .publish(&TraceEvent::new("abc", Step::Received, Status::Success))
            .await;
    }
}
