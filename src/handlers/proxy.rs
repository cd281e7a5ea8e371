use axum::{
    extract::{Request, State},
    http::StatusCode,
    response::Response,
};
use std::sync::Arc;
use std::time::Instant;

use crate::circuitbreaker::BreakerRegistry;
use crate::error::AppError;
use crate::forwarder::Forwarder;
use crate::jwt::Claims;
use crate::metrics;
use crate::routes::RouteTable;
use crate::trace::{RequestContext, Status, Step, TraceEvent};

/// Shared state for the innermost pipeline stage.
#[derive(Clone)]
pub struct ProxyState {
    pub routes: Arc<RouteTable>,
    pub forwarder: Arc<Forwarder>,
    pub breakers: Arc<BreakerRegistry>,
}

/// Proxy dispatch: route match -> circuit check -> forward -> outcome
/// record. Every accepted forward attempt records exactly one breaker
/// outcome and emits exactly one COMPLETE event.
pub async fn proxy_dispatch(State(state): State<ProxyState>, req: Request) -> Response {
    let ctx = req.extensions().get::<RequestContext>().cloned();
    let request_id = req
        .headers()
        .get(crate::forwarder::REQUEST_ID_HEADER)
        .and_then(|v| v.to_str().ok())
        .filter(|v| !v.is_empty())
        .map(str::to_string);

    let path = req.uri().path().to_string();
    let Some(route) = state.routes.match_route(&path).cloned() else {
        return AppError::NotFound("Route not found".to_string())
            .into_response_with_request_id(request_id);
    };

    // Service identifier is the matched route's path prefix. The registry
    // was pre-populated from the same route table, so a matched route
    // always has its breaker.
    let service = route.path_prefix.clone();
    let Some(breaker) = state.breakers.get(&service) else {
        return AppError::Internal("no circuit breaker for service".to_string())
            .into_response_with_request_id(request_id);
    };

    let cb_start = Instant::now();
    let cb = breaker.allow().await;
    metrics::set_circuit_state(&service, cb.state);

    if !cb.allowed {
        emit(
            &ctx,
            |ctx| {
                ctx.event(Step::Circuit, Status::Failed)
                    .with_duration(cb_start.elapsed())
                    .with_detail("service", service.as_str())
                    .with_detail("state", cb.state.as_str())
                    .with_detail("reason", "circuit open")
            },
        )
        .await;
        return AppError::ServiceUnavailable("circuit breaker open".to_string())
            .into_response_with_request_id(request_id);
    }

    emit(
        &ctx,
        |ctx| {
            ctx.event(Step::Circuit, Status::Success)
                .with_duration(cb_start.elapsed())
                .with_detail("service", service.as_str())
                .with_detail("state", cb.state.as_str())
        },
    )
    .await;

    let claims = req.extensions().get::<Claims>().cloned();
    let fwd_start = Instant::now();

    match state.forwarder.forward(&route, req, claims.as_ref()).await {
        Ok(response) => {
            breaker.record_success().await;
            emit(
                &ctx,
                |ctx| {
                    ctx.event(Step::Forward, Status::Success)
                        .with_duration(fwd_start.elapsed())
                        .with_detail("service", service.as_str())
                        .with_detail("target", route.target.as_str())
                },
            )
            .await;
            emit(&ctx, |ctx| ctx.event(Step::Complete, Status::Success)).await;
            response
        }
        Err(proxy_err) => {
            breaker.record_failure().await;
            emit(
                &ctx,
                |ctx| {
                    ctx.event(Step::Forward, Status::Failed)
                        .with_duration(fwd_start.elapsed())
                        .with_detail("service", service.as_str())
                        .with_detail("target", route.target.as_str())
                        .with_detail("status_code", proxy_err.code.as_u16())
                        .with_error(proxy_err.message)
                },
            )
            .await;
            emit(&ctx, |ctx| {
                ctx.event(Step::Complete, Status::Failed)
                    .with_error(proxy_err.message)
            })
            .await;

            let app_err = if proxy_err.code == StatusCode::GATEWAY_TIMEOUT {
                AppError::GatewayTimeout(proxy_err.message.to_string())
            } else {
                AppError::BadGateway(proxy_err.message.to_string())
            };
            app_err.into_response_with_request_id(request_id)
        }
    }
}

async fn emit(ctx: &Option<RequestContext>, build: impl FnOnce(&RequestContext) -> TraceEvent) {
    if let Some(ctx) = ctx {
        ctx.emit(build(ctx)).await;
    }
}
