use axum::{
    extract::{Request, State},
    http::header,
    middleware::Next,
    response::Response,
};
use std::sync::Arc;
use std::time::Instant;

use crate::error::AppError;
use crate::forwarder;
use crate::jwt::TokenValidator;
use crate::trace::{RequestContext, Status, Step};

/// Authentication stage. Validates the Bearer token and attaches the
/// claims to the request for the rate limiter and forwarder. Failures
/// surface as a uniform 401; validation error kinds are never logged on
/// the request path.
pub async fn auth_middleware(
    State(validator): State<Arc<TokenValidator>>,
    mut req: Request,
    next: Next,
) -> Response {
    let start = Instant::now();
    let ctx = req.extensions().get::<RequestContext>().cloned();
    let request_id = client_request_id(&req);

    let Some(token) = extract_bearer_token(&req) else {
        emit_auth(&ctx, Status::Failed, start, Some("missing authorization token")).await;
        return AppError::Unauthorized("missing authorization token".to_string())
            .into_response_with_request_id(request_id);
    };

    match validator.validate(&token) {
        Ok(claims) => {
            emit_auth(&ctx, Status::Success, start, None).await;
            req.extensions_mut().insert(claims);
            next.run(req).await
        }
        Err(_) => {
            emit_auth(&ctx, Status::Failed, start, Some("invalid token")).await;
            AppError::Unauthorized("invalid token".to_string())
                .into_response_with_request_id(request_id)
        }
    }
}

async fn emit_auth(
    ctx: &Option<RequestContext>,
    status: Status,
    start: Instant,
    error: Option<&str>,
) {
    let Some(ctx) = ctx else { return };
    let mut event = ctx.event(Step::Auth, status).with_duration(start.elapsed());
    if let Some(error) = error {
        event = event.with_error(error);
    }
    ctx.emit(event).await;
}

/// Token from `Authorization: Bearer <token>`; scheme match is
/// case-insensitive.
fn extract_bearer_token(req: &Request) -> Option<String> {
    let auth = req.headers().get(header::AUTHORIZATION)?.to_str().ok()?;
    let (scheme, token) = auth.split_once(' ')?;
    if !scheme.eq_ignore_ascii_case("bearer") || token.is_empty() {
        return None;
    }
    Some(token.to_string())
}

pub(crate) fn client_request_id(req: &Request) -> Option<String> {
    req.headers()
        .get(forwarder::REQUEST_ID_HEADER)
        .and_then(|v| v.to_str().ok())
        .filter(|v| !v.is_empty())
        .map(str::to_string)
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::body::Body;

    fn request_with_auth(value: Option<&str>) -> Request {
        let mut builder = axum::http::Request::builder().uri("/x");
        if let Some(value) = value {
            builder = builder.header("authorization", value);
        }
        builder.body(Body::empty()).unwrap()
    }

    #[test]
    fn test_extract_bearer_token() {
        let req = request_with_auth(Some("Bearer tok-123"));
        assert_eq!(extract_bearer_token(&req).as_deref(), Some("tok-123"));
    }

    #[test]
    fn test_extract_bearer_token_case_insensitive_scheme() {
        let req = request_with_auth(Some("bearer tok-123"));
        assert_eq!(extract_bearer_token(&req).as_deref(), Some("tok-123"));
    }

    #[test]
    fn test_extract_bearer_token_missing_header() {
        assert!(extract_bearer_token(&request_with_auth(None)).is_none());
    }

    #[test]
    fn test_extract_bearer_token_wrong_scheme() {
        let req = request_with_auth(Some("Basic dXNlcjpwYXNz"));
        assert!(extract_bearer_token(&req).is_none());
    }

    #[test]
    fn test_extract_bearer_token_empty_token() {
        let req = request_with_auth(Some("Bearer "));
        assert!(extract_bearer_token(&req).is_none());
    }
}
