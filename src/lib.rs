pub mod circuitbreaker;
pub mod config;
pub mod error;
pub mod forwarder;
pub mod handlers;
pub mod jwt;
pub mod metrics;
pub mod middleware;
pub mod ratelimit;
pub mod routes;
pub mod server;
pub mod store;
pub mod trace;

use tracing_subscriber::{fmt, prelude::*, EnvFilter};

/// Initialize tracing/logging. Call once at process start.
pub fn init_tracing() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));

    tracing_subscriber::registry()
        .with(filter)
        .with(fmt::layer().with_target(true))
        .init();
}
