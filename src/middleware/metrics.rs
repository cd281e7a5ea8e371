use axum::{extract::Request, middleware::Next, response::Response};
use std::time::Instant;

use crate::metrics;

/// Metrics stage: observes the final status code and latency of every
/// pipelined request, including short-circuited ones.
pub async fn metrics_middleware(req: Request, next: Next) -> Response {
    let start = Instant::now();
    let service = service_label(req.uri().path());
    let method = req.method().to_string();

    let response = next.run(req).await;

    metrics::record_request(&service, &method, response.status().as_u16());
    metrics::record_duration(&service, &method, start.elapsed());

    response
}

/// Metric label for a request path: "/service-a/hello" -> "/service-a".
fn service_label(path: &str) -> String {
    if path.len() < 2 {
        return "unknown".to_string();
    }
    match path[1..].find('/') {
        Some(i) => path[..i + 1].to_string(),
        None => path.to_string(),
    }
}
