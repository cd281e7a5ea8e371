use metrics::{counter, describe_counter, describe_gauge, describe_histogram, gauge, histogram};
use metrics_exporter_prometheus::{Matcher, PrometheusBuilder, PrometheusHandle};
use std::time::Duration;

use crate::circuitbreaker::BreakerState;

/// Initialize the Prometheus exporter and describe the gateway's metrics.
pub fn init_metrics() -> PrometheusHandle {
    let handle = PrometheusBuilder::new()
        .set_buckets_for_metric(
            Matcher::Full("gateway_request_duration_seconds".to_string()),
            &[0.01, 0.05, 0.1, 0.25, 0.5, 1.0, 2.5, 5.0, 10.0],
        )
        .expect("invalid histogram buckets")
        .install_recorder()
        .expect("failed to install Prometheus recorder");

    describe_metrics();

    handle
}

fn describe_metrics() {
    describe_counter!(
        "gateway_requests_total",
        "Total number of requests processed by the gateway"
    );
    describe_histogram!(
        "gateway_request_duration_seconds",
        "Request duration in seconds"
    );
    describe_counter!(
        "gateway_rate_limit_rejections_total",
        "Total number of requests rejected due to rate limiting"
    );
    describe_gauge!(
        "gateway_circuit_breaker_state",
        "Circuit breaker state (0=closed, 1=open, 2=half-open)"
    );
}

/// Count one finished request.
pub fn record_request(service: &str, method: &str, status: u16) {
    counter!(
        "gateway_requests_total",
        "service" => service.to_string(),
        "method" => method.to_string(),
        "status" => status.to_string(),
    )
    .increment(1);
}

/// Observe one finished request's latency.
pub fn record_duration(service: &str, method: &str, duration: Duration) {
    histogram!(
        "gateway_request_duration_seconds",
        "service" => service.to_string(),
        "method" => method.to_string(),
    )
    .record(duration.as_secs_f64());
}

/// Count one rate-limit rejection.
pub fn record_rate_limit_rejection(client_id: &str) {
    counter!(
        "gateway_rate_limit_rejections_total",
        "client_id" => client_id.to_string(),
    )
    .increment(1);
}

/// Reflect the last observed breaker state for a service.
pub fn set_circuit_state(service: &str, state: BreakerState) {
    gauge!(
        "gateway_circuit_breaker_state",
        "service" => service.to_string(),
    )
    .set(state.gauge_value());
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_record_metrics_do_not_panic() {
        describe_metrics();

        record_request("/service-a", "GET", 200);
        record_duration("/service-a", "GET", Duration::from_millis(12));
        record_rate_limit_rejection("c1");
        set_circuit_state("/service-a", BreakerState::Open);
    }
}
