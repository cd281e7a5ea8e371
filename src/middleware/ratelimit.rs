use axum::{
    extract::{Request, State},
    http::{HeaderName, HeaderValue},
    middleware::Next,
    response::Response,
};
use std::sync::Arc;
use std::time::Instant;

use crate::error::AppError;
use crate::forwarder;
use crate::jwt::Claims;
use crate::metrics;
use crate::ratelimit::SlidingWindowLimiter;
use crate::trace::{RequestContext, Status, Step};

use super::auth::client_request_id;

pub const LIMIT_HEADER: &str = "x-ratelimit-limit";
pub const REMAINING_HEADER: &str = "x-ratelimit-remaining";

/// Rate-limit stage. Keys the sliding window on the authenticated
/// `client_id`, falling back to the caller address, and decorates every
/// response with the X-RateLimit headers. Store failures have already been
/// turned into an allow by the limiter, so the chain always continues.
pub async fn rate_limit_middleware(
    State(limiter): State<Arc<SlidingWindowLimiter>>,
    req: Request,
    next: Next,
) -> Response {
    let start = Instant::now();
    let ctx = req.extensions().get::<RequestContext>().cloned();
    let request_id = client_request_id(&req);
    let key = rate_limit_key(&req);

    let result = limiter.allow(&key).await;
    let limit = limiter.limit();
    let remaining = (limit - result.count).max(0);

    if !result.allowed {
        metrics::record_rate_limit_rejection(&key);
        if let Some(ctx) = &ctx {
            ctx.emit(
                ctx.event(Step::RateLimit, Status::Failed)
                    .with_duration(start.elapsed())
                    .with_detail("client_id", key.as_str())
                    .with_detail("count", result.count)
                    .with_detail("limit", limit)
                    .with_detail("retry_after", result.retry_after),
            )
            .await;
        }

        let mut response = AppError::RateLimited {
            message: "rate limit exceeded".to_string(),
            retry_after: result.retry_after,
        }
        .into_response_with_request_id(request_id);
        set_limit_headers(&mut response, limit, remaining);
        return response;
    }

    if let Some(ctx) = &ctx {
        ctx.emit(
            ctx.event(Step::RateLimit, Status::Success)
                .with_duration(start.elapsed())
                .with_detail("client_id", key.as_str())
                .with_detail("count", result.count)
                .with_detail("remaining", remaining),
        )
        .await;
    }

    let mut response = next.run(req).await;
    set_limit_headers(&mut response, limit, remaining);
    response
}

/// Throttling key: authenticated client_id, else first X-Forwarded-For
/// entry, else the peer address.
fn rate_limit_key(req: &Request) -> String {
    if let Some(client_id) = req
        .extensions()
        .get::<Claims>()
        .and_then(|claims| claims.client_id.as_deref())
    {
        if !client_id.is_empty() {
            return client_id.to_string();
        }
    }
    let ip = forwarder::client_ip(req);
    if ip.is_empty() {
        "unknown".to_string()
    } else {
        ip
    }
}

fn set_limit_headers(response: &mut Response, limit: i64, remaining: i64) {
    let headers = response.headers_mut();
    if let Ok(value) = HeaderValue::from_str(&limit.to_string()) {
        headers.insert(HeaderName::from_static(LIMIT_HEADER), value);
    }
    if let Ok(value) = HeaderValue::from_str(&remaining.to_string()) {
        headers.insert(HeaderName::from_static(REMAINING_HEADER), value);
    }
}
