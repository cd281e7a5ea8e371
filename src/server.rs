use anyhow::Result;
use axum::{
    http::{header, HeaderName, Method},
    middleware::{from_fn, from_fn_with_state},
    routing::get,
    Router,
};
use metrics_exporter_prometheus::PrometheusHandle;
use std::net::SocketAddr;
use std::sync::Arc;
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;
use tracing::{info, warn};

use crate::{
    circuitbreaker::BreakerRegistry,
    config::Config,
    forwarder::Forwarder,
    handlers,
    jwt::TokenValidator,
    metrics,
    middleware as mw,
    ratelimit::SlidingWindowLimiter,
    routes::RouteTable,
    store::{CoordStore, ScriptEvaluator},
    trace::TracePublisher,
};

/// Everything the router needs, assembled once at startup.
pub struct GatewayParts {
    pub routes: Arc<RouteTable>,
    pub validator: Arc<TokenValidator>,
    pub limiter: Arc<SlidingWindowLimiter>,
    pub breakers: Arc<BreakerRegistry>,
    pub forwarder: Arc<Forwarder>,
    pub publisher: TracePublisher,
    pub store: Arc<CoordStore>,
    pub metrics_handle: Arc<PrometheusHandle>,
}

/// Start the gateway server: load collaborators, assemble the pipeline,
/// bind, and serve until shutdown.
pub async fn start_server(config: Config) -> Result<()> {
    info!("Initializing Prometheus metrics...");
    let metrics_handle = Arc::new(metrics::init_metrics());

    let routes = Arc::new(RouteTable::load(&config.routes_file)?);
    info!("Loaded {} routes", routes.len());

    let validator = Arc::new(TokenValidator::from_pem_file(
        &config.auth.public_key_path,
        config.auth.issuer.clone(),
    )?);
    info!("JWT auth enabled");

    let store = Arc::new(CoordStore::new(&config.redis.addr)?);
    match store.ping().await {
        Ok(()) => info!("Coordination store connected at {}", config.redis.addr),
        Err(err) => warn!(
            "Coordination store unavailable, rate limiting and circuit breaking will fail open: {}",
            err
        ),
    }

    let evaluator: Arc<dyn ScriptEvaluator> = store.clone();
    let limiter = Arc::new(SlidingWindowLimiter::new(
        evaluator.clone(),
        config.rate_limit.requests_per_minute,
    ));
    let breakers = Arc::new(BreakerRegistry::from_routes(evaluator, &routes));
    info!("Circuit breaker enabled for {} services", breakers.len());

    let publisher = if config.trace.enabled {
        info!("Trace visualization enabled");
        TracePublisher::new(Some(store.clone()))
    } else {
        TracePublisher::disabled()
    };

    let parts = GatewayParts {
        routes,
        validator,
        limiter,
        breakers,
        forwarder: Arc::new(Forwarder::new()),
        publisher,
        store,
        metrics_handle,
    };

    let app = create_router(parts);

    let addr = SocketAddr::from((
        config.server.host.parse::<std::net::IpAddr>()?,
        config.server.port,
    ));
    let listener = tokio::net::TcpListener::bind(addr).await?;
    info!("Starting gateway on {}", addr);

    axum::serve(
        listener,
        app.into_make_service_with_connect_info::<SocketAddr>(),
    )
    .with_graceful_shutdown(shutdown_signal())
    .await?;

    info!("Server stopped gracefully");
    Ok(())
}

/// Assemble the full router: public endpoints plus the pipelined proxy
/// fallback. Pipeline nesting outer-to-inner: CORS -> trace init ->
/// metrics -> auth -> rate limit -> proxy dispatch.
pub fn create_router(parts: GatewayParts) -> Router {
    let proxy_state = handlers::proxy::ProxyState {
        routes: parts.routes,
        forwarder: parts.forwarder,
        breakers: parts.breakers,
    };

    let pipeline = Router::new()
        .fallback(handlers::proxy::proxy_dispatch)
        .with_state(proxy_state)
        .layer(from_fn_with_state(
            parts.limiter,
            mw::ratelimit::rate_limit_middleware,
        ))
        .layer(from_fn_with_state(parts.validator, mw::auth::auth_middleware))
        .layer(from_fn(mw::metrics::metrics_middleware))
        .layer(from_fn_with_state(
            parts.publisher,
            mw::trace::trace_middleware,
        ));

    Router::new()
        .route("/health", get(handlers::health::health_check))
        .route(
            "/metrics",
            get(handlers::metrics_handler::metrics).with_state(parts.metrics_handle),
        )
        .route(
            "/ws/trace/{trace_id}",
            get(handlers::trace_ws::trace_stream).with_state(parts.store),
        )
        .merge(pipeline)
        .layer(TraceLayer::new_for_http())
        .layer(cors_layer())
}

/// CORS for browser clients of the trace visualizer. Preflights are
/// answered here before the pipeline runs.
fn cors_layer() -> CorsLayer {
    CorsLayer::new()
        .allow_origin(Any)
        .allow_methods([
            Method::GET,
            Method::POST,
            Method::PUT,
            Method::DELETE,
            Method::OPTIONS,
        ])
        .allow_headers([
            header::AUTHORIZATION,
            header::CONTENT_TYPE,
            HeaderName::from_static("x-trace-id"),
            HeaderName::from_static("x-request-id"),
        ])
        .expose_headers([
            HeaderName::from_static("x-trace-id"),
            HeaderName::from_static("x-ratelimit-limit"),
            HeaderName::from_static("x-ratelimit-remaining"),
            header::RETRY_AFTER,
        ])
}

async fn shutdown_signal() {
    if let Err(err) = tokio::signal::ctrl_c().await {
        warn!("Failed to listen for shutdown signal: {}", err);
        return;
    }
    info!("Shutdown signal received, draining connections...");
}
