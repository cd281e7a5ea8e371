use async_trait::async_trait;
use redis::aio::{ConnectionManager, ConnectionManagerConfig, PubSub};
use redis::{AsyncCommands, RedisResult, Value};
use std::time::Duration;
use tokio::sync::Mutex;

/// Dial/read/write budget for every coordination-store round-trip.
const STORE_TIMEOUT: Duration = Duration::from_secs(1);

/// Runs server-side atomic scripts against the coordination store.
///
/// The rate limiter and circuit breaker depend on this trait rather than the
/// concrete client so their decision logic can be exercised against a mock.
#[async_trait]
pub trait ScriptEvaluator: Send + Sync {
    /// Evaluate `script` atomically with the given key and scalar argument
    /// lists. Errors are first-class: callers translate them into fail-open
    /// decisions.
    async fn eval(&self, script: &str, keys: &[String], args: &[i64]) -> RedisResult<Value>;
}

/// Thin client over the Redis coordination store: atomic scripting plus
/// pub/sub. Construction never touches the network; the underlying connection
/// is established lazily so an unreachable store degrades to fail-open
/// behavior instead of blocking startup.
pub struct CoordStore {
    client: redis::Client,
    conn: Mutex<Option<ConnectionManager>>,
}

impl CoordStore {
    pub fn new(addr: &str) -> anyhow::Result<Self> {
        let client = redis::Client::open(format!("redis://{}", addr))?;
        Ok(Self {
            client,
            conn: Mutex::new(None),
        })
    }

    /// Returns the shared multiplexed connection, establishing it on first
    /// use. Once established, the manager reconnects on its own after
    /// transient failures.
    async fn connection(&self) -> RedisResult<ConnectionManager> {
        let mut guard = self.conn.lock().await;
        if guard.is_none() {
            let cfg = ConnectionManagerConfig::new()
                .set_connection_timeout(STORE_TIMEOUT)
                .set_response_timeout(STORE_TIMEOUT)
                .set_number_of_retries(1);
            let manager = ConnectionManager::new_with_config(self.client.clone(), cfg).await?;
            *guard = Some(manager);
        }
        Ok(guard.as_ref().expect("connection just initialized").clone())
    }

    /// Connectivity probe used at startup to log whether the store is
    /// reachable. Failure is not fatal.
    pub async fn ping(&self) -> RedisResult<()> {
        let mut conn = self.connection().await?;
        redis::cmd("PING").query_async(&mut conn).await
    }

    /// Publish a payload on a pub/sub channel.
    pub async fn publish(&self, channel: &str, payload: &[u8]) -> RedisResult<()> {
        let mut conn = self.connection().await?;
        conn.publish::<_, _, ()>(channel, payload).await
    }

    /// Subscribe to a channel on a dedicated connection. Resolves only after
    /// the server acknowledges the subscription.
    pub async fn subscribe(&self, channel: &str) -> RedisResult<PubSub> {
        let mut pubsub = tokio::time::timeout(STORE_TIMEOUT, self.client.get_async_pubsub())
            .await
            .map_err(|_| {
                redis::RedisError::from(std::io::Error::new(
                    std::io::ErrorKind::TimedOut,
                    "subscribe connection timed out",
                ))
            })??;
        pubsub.subscribe(channel).await?;
        Ok(pubsub)
    }
}

#[async_trait]
impl ScriptEvaluator for CoordStore {
    async fn eval(&self, script: &str, keys: &[String], args: &[i64]) -> RedisResult<Value> {
        let mut conn = self.connection().await?;
        let mut cmd = redis::cmd("EVAL");
        cmd.arg(script).arg(keys.len());
        for key in keys {
            cmd.arg(key);
        }
        for arg in args {
            cmd.arg(*arg);
        }
        cmd.query_async(&mut conn).await
    }
}
