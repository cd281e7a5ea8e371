pub mod health;
pub mod metrics_handler;
pub mod proxy;
pub mod trace_ws;
