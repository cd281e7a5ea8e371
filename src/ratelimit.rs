use redis::Value;
use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};

use crate::store::ScriptEvaluator;

/// Fixed window size in seconds.
pub const WINDOW_SECS: i64 = 60;
/// Limit applied when the configured value is zero or negative.
pub const DEFAULT_LIMIT: i64 = 100;

// Atomic sliding-window decision.
// Keys: [current_window_key, prev_window_key]
// Args: [limit, window_start, now, window_size]
// Returns: [allowed (0/1), count, retry_after]
const SLIDING_WINDOW_SCRIPT: &str = r#"
local curr_key = KEYS[1]
local prev_key = KEYS[2]
local limit = tonumber(ARGV[1])
local window_start = tonumber(ARGV[2])
local now = tonumber(ARGV[3])
local window_size = tonumber(ARGV[4])

local curr_count = tonumber(redis.call('GET', curr_key) or '0')
local prev_count = tonumber(redis.call('GET', prev_key) or '0')

-- Weight the previous window by how much of it still overlaps the
-- rolling 60s window ending now.
local elapsed = now - window_start
local weight = 1 - (elapsed / window_size)
if weight < 0 then weight = 0 end
local weighted_count = (prev_count * weight) + curr_count

if weighted_count >= limit then
    local retry_after = window_size - elapsed
    if retry_after < 1 then retry_after = 1 end
    return {0, weighted_count, retry_after}
end

redis.call('INCR', curr_key)
redis.call('EXPIRE', curr_key, window_size * 2)

return {1, weighted_count + 1, 0}
"#;

/// Outcome of a rate-limit decision.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RateLimitResult {
    pub allowed: bool,
    /// Weighted observed count after this decision.
    pub count: i64,
    /// Seconds until the client may retry; meaningful only when rejected.
    pub retry_after: i64,
}

impl RateLimitResult {
    fn fail_open() -> Self {
        Self {
            allowed: true,
            count: 0,
            retry_after: 0,
        }
    }
}

/// Distributed sliding-window rate limiter keyed by client identity.
/// Decision, read and increment run as one script on the coordination
/// store; store errors fail open.
pub struct SlidingWindowLimiter {
    store: Arc<dyn ScriptEvaluator>,
    limit: i64,
}

impl SlidingWindowLimiter {
    pub fn new(store: Arc<dyn ScriptEvaluator>, limit: i64) -> Self {
        let limit = if limit <= 0 { DEFAULT_LIMIT } else { limit };
        Self { store, limit }
    }

    pub fn limit(&self) -> i64 {
        self.limit
    }

    /// Check whether the request identified by `key` is allowed within the
    /// current rolling window.
    pub async fn allow(&self, key: &str) -> RateLimitResult {
        self.allow_at(key, unix_now()).await
    }

    async fn allow_at(&self, key: &str, now: i64) -> RateLimitResult {
        let window_start = now / WINDOW_SECS * WINDOW_SECS;
        let prev_window_start = window_start - WINDOW_SECS;

        let keys = [
            format!("ratelimit:{}:{}", key, window_start),
            format!("ratelimit:{}:{}", key, prev_window_start),
        ];
        let args = [self.limit, window_start, now, WINDOW_SECS];

        match self.store.eval(SLIDING_WINDOW_SCRIPT, &keys, &args).await {
            Ok(value) => parse_result(&value),
            Err(err) => {
                tracing::warn!(error = %err, "rate limiter store error, failing open");
                RateLimitResult::fail_open()
            }
        }
    }
}

/// Script reply is `[allowed, count, retry_after]`; anything else fails open.
fn parse_result(value: &Value) -> RateLimitResult {
    let Value::Array(items) = value else {
        return RateLimitResult::fail_open();
    };
    if items.len() < 3 {
        return RateLimitResult::fail_open();
    }
    RateLimitResult {
        allowed: as_i64(&items[0]) == 1,
        count: as_i64(&items[1]),
        retry_after: as_i64(&items[2]),
    }
}

fn as_i64(value: &Value) -> i64 {
    match value {
        Value::Int(n) => *n,
        _ => 0,
    }
}

fn unix_now() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs() as i64)
        .unwrap_or(0)
}
