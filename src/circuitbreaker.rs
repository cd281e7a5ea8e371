use redis::Value;
use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};

use crate::routes::RouteTable;
use crate::store::ScriptEvaluator;

/// Minimum windowed calls and failures before the circuit can open.
pub const FAILURE_THRESHOLD: i64 = 5;
/// Minimum failure rate (percent) to open.
pub const FAILURE_RATE_PERCENT: i64 = 50;
/// Seconds spent OPEN before probing with HALF_OPEN.
pub const COOLDOWN_SECS: i64 = 30;
/// Consecutive HALF_OPEN successes required to close.
pub const HALF_OPEN_SUCCESSES: i64 = 2;
/// Failure-accounting window in seconds.
pub const WINDOW_SECS: i64 = 60;

// Allow decision and state transition in one round-trip.
// Keys: [state_key, window_key]
// Args: [now, cooldown, window_size, failure_threshold, failure_rate, half_open_successes]
// Returns: [allowed (0/1), state]
const ALLOW_SCRIPT: &str = r#"
local state_key = KEYS[1]
local window_key = KEYS[2]
local now = tonumber(ARGV[1])
local cooldown = tonumber(ARGV[2])
local window_size = tonumber(ARGV[3])
local failure_threshold = tonumber(ARGV[4])
local failure_rate = tonumber(ARGV[5])

local state_data = redis.call('HGETALL', state_key)
local state = 'CLOSED'
local opened_at = 0

for i = 1, #state_data, 2 do
    if state_data[i] == 'state' then state = state_data[i+1] end
    if state_data[i] == 'opened_at' then opened_at = tonumber(state_data[i+1]) end
end

if state == 'OPEN' then
    if now - opened_at >= cooldown then
        redis.call('HSET', state_key, 'state', 'HALF_OPEN', 'successes', 0)
        return {1, 'HALF_OPEN'}
    end
    return {0, 'OPEN'}
end

if state == 'HALF_OPEN' then
    return {1, 'HALF_OPEN'}
end

-- CLOSED: open when the window shows enough volume and failures.
local window = redis.call('HGETALL', window_key)
local total = 0
local failures = 0
for i = 1, #window, 2 do
    if window[i] == 'total' then total = tonumber(window[i+1]) end
    if window[i] == 'failures' then failures = tonumber(window[i+1]) end
end

if total >= failure_threshold then
    local rate = (failures / total) * 100
    if failures >= failure_threshold and rate >= failure_rate then
        redis.call('HSET', state_key, 'state', 'OPEN', 'opened_at', now)
        return {0, 'OPEN'}
    end
end

return {1, 'CLOSED'}
"#;

// Record one call outcome against the window and drive HALF_OPEN bookkeeping.
// Keys: [state_key, window_key]
// Args: [success (0/1), window_size, half_open_successes, now]
const RECORD_SCRIPT: &str = r#"
local state_key = KEYS[1]
local window_key = KEYS[2]
local success = tonumber(ARGV[1])
local window_size = tonumber(ARGV[2])
local half_open_successes = tonumber(ARGV[3])
local now = tonumber(ARGV[4])

local state = redis.call('HGET', state_key, 'state') or 'CLOSED'

redis.call('HINCRBY', window_key, 'total', 1)
if success == 0 then
    redis.call('HINCRBY', window_key, 'failures', 1)
end
redis.call('EXPIRE', window_key, window_size * 2)

if state == 'HALF_OPEN' then
    if success == 0 then
        redis.call('HSET', state_key, 'state', 'OPEN', 'opened_at', now)
    else
        local successes = redis.call('HINCRBY', state_key, 'successes', 1)
        if successes >= half_open_successes then
            redis.call('DEL', state_key)
        end
    end
end

return 1
"#;

/// Circuit state as persisted in the coordination store.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BreakerState {
    Closed,
    Open,
    HalfOpen,
}

impl BreakerState {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Closed => "CLOSED",
            Self::Open => "OPEN",
            Self::HalfOpen => "HALF_OPEN",
        }
    }

    fn parse(s: &str) -> Self {
        match s {
            "OPEN" => Self::Open,
            "HALF_OPEN" => Self::HalfOpen,
            _ => Self::Closed,
        }
    }

    /// Gauge encoding: CLOSED=0, OPEN=1, HALF_OPEN=2.
    pub fn gauge_value(&self) -> f64 {
        match self {
            Self::Closed => 0.0,
            Self::Open => 1.0,
            Self::HalfOpen => 2.0,
        }
    }
}

impl fmt::Display for BreakerState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Outcome of a breaker check.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BreakerResult {
    pub allowed: bool,
    pub state: BreakerState,
}

impl BreakerResult {
    fn fail_open() -> Self {
        Self {
            allowed: true,
            state: BreakerState::Closed,
        }
    }
}

/// Per-service three-state failure-isolation machine backed by the
/// coordination store. The allow decision and every state transition run
/// atomically server-side, so concurrent gateway instances observe
/// consistent state.
pub struct CircuitBreaker {
    store: Arc<dyn ScriptEvaluator>,
    service: String,
}

impl CircuitBreaker {
    pub fn new(store: Arc<dyn ScriptEvaluator>, service: impl Into<String>) -> Self {
        Self {
            store,
            service: service.into(),
        }
    }

    pub fn service(&self) -> &str {
        &self.service
    }

    /// Check whether a call to this service should proceed. Store errors
    /// fail open with a CLOSED state.
    pub async fn allow(&self) -> BreakerResult {
        self.allow_at(unix_now()).await
    }

    async fn allow_at(&self, now: i64) -> BreakerResult {
        let keys = self.keys(now);
        let args = [
            now,
            COOLDOWN_SECS,
            WINDOW_SECS,
            FAILURE_THRESHOLD,
            FAILURE_RATE_PERCENT,
            HALF_OPEN_SUCCESSES,
        ];

        match self.store.eval(ALLOW_SCRIPT, &keys, &args).await {
            Ok(value) => parse_result(&value),
            Err(err) => {
                tracing::warn!(
                    error = %err,
                    service = %self.service,
                    "circuit breaker store error, failing open"
                );
                BreakerResult::fail_open()
            }
        }
    }

    pub async fn record_success(&self) {
        self.record(true).await;
    }

    pub async fn record_failure(&self) {
        self.record(false).await;
    }

    async fn record(&self, success: bool) {
        let now = unix_now();
        let keys = self.keys(now);
        let args = [i64::from(success), WINDOW_SECS, HALF_OPEN_SUCCESSES, now];
        if let Err(err) = self.store.eval(RECORD_SCRIPT, &keys, &args).await {
            tracing::warn!(
                error = %err,
                service = %self.service,
                "circuit breaker record failed"
            );
        }
    }

    fn keys(&self, now: i64) -> [String; 2] {
        let window_start = now / WINDOW_SECS * WINDOW_SECS;
        [
            format!("circuit:{}:state", self.service),
            format!("circuit:{}:window:{}", self.service, window_start),
        ]
    }
}

/// Script reply is `[allowed, state]`; anything else fails open.
fn parse_result(value: &Value) -> BreakerResult {
    let Value::Array(items) = value else {
        return BreakerResult::fail_open();
    };
    if items.len() < 2 {
        return BreakerResult::fail_open();
    }
    let allowed = matches!(items[0], Value::Int(1));
    let state = match &items[1] {
        Value::BulkString(bytes) => BreakerState::parse(&String::from_utf8_lossy(bytes)),
        Value::SimpleString(s) => BreakerState::parse(s),
        _ => BreakerState::Closed,
    };
    BreakerResult { allowed, state }
}

fn unix_now() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs() as i64)
        .unwrap_or(0)
}

/// Immutable mapping from service identifier (the route's path prefix) to
/// its breaker. Pre-populated from the route table at startup so concurrent
/// request handlers never mutate it.
pub struct BreakerRegistry {
    breakers: HashMap<String, CircuitBreaker>,
}

impl BreakerRegistry {
    pub fn from_routes(store: Arc<dyn ScriptEvaluator>, routes: &RouteTable) -> Self {
        let breakers = routes
            .routes()
            .iter()
            .map(|route| {
                (
                    route.path_prefix.clone(),
                    CircuitBreaker::new(store.clone(), route.path_prefix.clone()),
                )
            })
            .collect();
        Self { breakers }
    }

    pub fn get(&self, service: &str) -> Option<&CircuitBreaker> {
        self.breakers.get(service)
    }

    pub fn len(&self) -> usize {
        self.breakers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.breakers.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ratelimit::tests::MockStore;
    use crate::routes::Route;
    use std::time::Duration;

    fn bulk(s: &str) -> Value {
        Value::BulkString(s.as_bytes().to_vec())
    }

    #[tokio::test]
    async fn test_allow_closed() {
        let store = MockStore::with_replies(vec![Ok(Value::Array(vec![
            Value::Int(1),
            bulk("CLOSED"),
        ]))]);
        let breaker = CircuitBreaker::new(store, "/svc");

        let result = breaker.allow().await;
        assert!(result.allowed);
        assert_eq!(result.state, BreakerState::Closed);
    }

    #[tokio::test]
    async fn test_allow_denied_when_open() {
        let store = MockStore::with_replies(vec![Ok(Value::Array(vec![
            Value::Int(0),
            bulk("OPEN"),
        ]))]);
        let breaker = CircuitBreaker::new(store, "/svc");

        let result = breaker.allow().await;
        assert!(!result.allowed);
        assert_eq!(result.state, BreakerState::Open);
    }

    #[tokio::test]
    async fn test_allow_half_open_probe() {
        let store = MockStore::with_replies(vec![Ok(Value::Array(vec![
            Value::Int(1),
            bulk("HALF_OPEN"),
        ]))]);
        let breaker = CircuitBreaker::new(store, "/svc");

        let result = breaker.allow().await;
        assert!(result.allowed);
        assert_eq!(result.state, BreakerState::HalfOpen);
    }

    #[tokio::test]
    async fn test_store_error_fails_open_closed() {
        let store = MockStore::with_replies(vec![Err(MockStore::store_error())]);
        let breaker = CircuitBreaker::new(store, "/svc");

        let result = breaker.allow().await;
        assert!(result.allowed);
        assert_eq!(result.state, BreakerState::Closed);
    }

    #[tokio::test]
    async fn test_record_swallows_store_errors() {
        let store = MockStore::with_replies(vec![
            Err(MockStore::store_error()),
            Err(MockStore::store_error()),
        ]);
        let breaker = CircuitBreaker::new(store, "/svc");
        // Neither call may panic or surface the error.
        breaker.record_success().await;
        breaker.record_failure().await;
    }

    #[tokio::test]
    async fn test_key_and_arg_layout() {
        let store = MockStore::with_replies(vec![Ok(Value::Array(vec![
            Value::Int(1),
            bulk("CLOSED"),
        ]))]);
        let breaker = CircuitBreaker::new(store.clone(), "/service-a");

        breaker.allow_at(95).await;

        let calls = store.calls.lock().unwrap();
        let (keys, args) = &calls[0];
        assert_eq!(keys[0], "circuit:/service-a:state");
        assert_eq!(keys[1], "circuit:/service-a:window:60");
        assert_eq!(
            args,
            &vec![
                95,
                COOLDOWN_SECS,
                WINDOW_SECS,
                FAILURE_THRESHOLD,
                FAILURE_RATE_PERCENT,
                HALF_OPEN_SUCCESSES
            ]
        );
    }

    #[tokio::test]
    async fn test_record_arg_layout() {
        let store = MockStore::with_replies(vec![Ok(Value::Int(1)), Ok(Value::Int(1))]);
        let breaker = CircuitBreaker::new(store.clone(), "/svc");

        breaker.record_success().await;
        breaker.record_failure().await;

        let calls = store.calls.lock().unwrap();
        assert_eq!(calls[0].1[0], 1);
        assert_eq!(calls[1].1[0], 0);
        assert_eq!(calls[0].1[1], WINDOW_SECS);
        assert_eq!(calls[0].1[2], HALF_OPEN_SUCCESSES);
    }

    #[test]
    fn test_registry_prepopulated_from_routes() {
        let store = MockStore::with_replies(vec![]);
        let routes = RouteTable::new(vec![
            Route {
                path_prefix: "/service-a".to_string(),
                target: "http://a:6000".to_string(),
                strip_prefix: true,
                timeout: Duration::from_secs(5),
            },
            Route {
                path_prefix: "/service-b".to_string(),
                target: "http://b:7000".to_string(),
                strip_prefix: false,
                timeout: Duration::from_secs(5),
            },
        ])
        .unwrap();

        let registry = BreakerRegistry::from_routes(store, &routes);
        assert_eq!(registry.len(), 2);
        assert!(registry.get("/service-a").is_some());
        assert!(registry.get("/service-b").is_some());
        assert!(registry.get("/unknown").is_none());
    }

    #[test]
    fn test_state_gauge_values() {
        assert_eq!(BreakerState::Closed.gauge_value(), 0.0);
        assert_eq!(BreakerState::Open.gauge_value(), 1.0);
        assert_eq!(BreakerState::HalfOpen.gauge_value(), 2.0);
    }

    #[test]
    fn test_state_parse() {
        assert_eq!(BreakerState::parse("OPEN"), BreakerState::Open);
        assert_eq!(BreakerState::parse("HALF_OPEN"), BreakerState::HalfOpen);
        assert_eq!(BreakerState::parse("CLOSED"), BreakerState::Closed);
        assert_eq!(BreakerState::parse("garbage"), BreakerState::Closed);
    }
}
