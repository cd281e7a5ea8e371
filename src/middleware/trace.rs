use axum::{
    extract::{Request, State},
    http::HeaderValue,
    middleware::Next,
    response::Response,
};

use crate::trace::{
    extract_service, generate_trace_id, RequestContext, Status, Step, TracePublisher, TRACE_HEADER,
};

/// Trace-initiation stage: extracts or mints the trace id, attaches the
/// request-scoped context, and emits the RECEIVED event. The trace id is
/// echoed back on the response for debugging.
pub async fn trace_middleware(
    State(publisher): State<TracePublisher>,
    mut req: Request,
    next: Next,
) -> Response {
    let trace_id = req
        .headers()
        .get(TRACE_HEADER)
        .and_then(|v| v.to_str().ok())
        .filter(|v| !v.is_empty())
        .map(str::to_string)
        .unwrap_or_else(generate_trace_id);

    let ctx = RequestContext::new(trace_id.clone(), publisher);

    ctx.emit(
        ctx.event(Step::Received, Status::Success)
            .with_detail("method", req.method().as_str())
            .with_detail("path", req.uri().path())
            .with_detail("service", extract_service(req.uri().path())),
    )
    .await;

    req.extensions_mut().insert(ctx);

    let mut response = next.run(req).await;
    if let Ok(value) = HeaderValue::from_str(&trace_id) {
        response.headers_mut().insert(TRACE_HEADER, value);
    }
    response
}
