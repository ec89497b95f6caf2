//! Redis-backed counter store.

use std::future::Future;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use redis::aio::ConnectionManager;
use redis::{AsyncCommands, Client, RedisResult, Script};
use tracing::{debug, info};

use super::{CounterStore, StoreError};

/// Writes the counter and its expiry in one step, never lowering a live count.
///
/// An `INCR` from another instance can land between the limiter's first
/// increment and this call; taking the maximum keeps that increment counted.
const SET_WITH_EXPIRY_SCRIPT: &str = r#"
local current = tonumber(redis.call("GET", KEYS[1])) or 0
local value = math.max(current, tonumber(ARGV[1]))
redis.call("SET", KEYS[1], value, "PX", ARGV[2])
return value
"#;

/// Connection parameters for [`RedisCounterStore`].
#[derive(Debug, Clone)]
pub struct RedisStoreOptions {
    /// Redis connection URL, e.g. `redis://:password@host:6379/0`
    pub url: String,
    /// Namespace prepended to every counter key
    pub key_prefix: String,
    /// Number of multiplexed connections to spread requests over
    pub pool_size: usize,
    /// Upper bound on every store round trip
    pub operation_timeout: Duration,
}

/// A [`CounterStore`] shared between service instances through Redis.
///
/// Requests are spread round-robin over a small pool of
/// [`ConnectionManager`]s, each of which multiplexes and reconnects on its
/// own, so a slow reply on one connection does not stall every request.
pub struct RedisCounterStore {
    connections: Arc<Vec<ConnectionManager>>,
    next_connection: AtomicUsize,
    key_prefix: String,
    operation_timeout: Duration,
    set_with_expiry_script: Script,
    closed: AtomicBool,
}

impl std::fmt::Debug for RedisCounterStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RedisCounterStore")
            .field("pool_size", &self.connections.len())
            .field("key_prefix", &self.key_prefix)
            .field("operation_timeout", &self.operation_timeout)
            .finish()
    }
}

impl RedisCounterStore {
    /// Open the connection pool and verify the server answers.
    pub async fn connect(options: RedisStoreOptions) -> Result<Self, StoreError> {
        let pool_size = options.pool_size.max(1);
        let client = Client::open(options.url.as_str())?;

        let mut connections = Vec::with_capacity(pool_size);
        for _ in 0..pool_size {
            let connection = with_timeout(
                "CONNECT",
                options.operation_timeout,
                client.get_connection_manager(),
            )
            .await?;
            connections.push(connection);
        }

        let mut connection = connections[0].clone();
        let pong: String = with_timeout("PING", options.operation_timeout, async move {
            redis::cmd("PING").query_async(&mut connection).await
        })
        .await?;
        debug!(reply = %pong, "Redis answered ping");

        info!(
            pool_size,
            key_prefix = %options.key_prefix,
            timeout_ms = options.operation_timeout.as_millis() as u64,
            "Connected to Redis counter store"
        );

        Ok(Self {
            connections: Arc::new(connections),
            next_connection: AtomicUsize::new(0),
            key_prefix: options.key_prefix,
            operation_timeout: options.operation_timeout,
            set_with_expiry_script: Script::new(SET_WITH_EXPIRY_SCRIPT),
            closed: AtomicBool::new(false),
        })
    }

    fn connection(&self) -> Result<ConnectionManager, StoreError> {
        if self.closed.load(Ordering::Acquire) {
            return Err(StoreError::Closed);
        }
        let index = self.next_connection.fetch_add(1, Ordering::Relaxed);
        Ok(self.connections[index % self.connections.len()].clone())
    }

    fn namespaced(&self, key: &str) -> String {
        format!("{}:{}", self.key_prefix, key)
    }

    async fn run<T, F>(&self, operation: &'static str, command: F) -> Result<T, StoreError>
    where
        F: Future<Output = RedisResult<T>>,
    {
        with_timeout(operation, self.operation_timeout, command).await
    }
}

async fn with_timeout<T, F>(
    operation: &'static str,
    after: Duration,
    command: F,
) -> Result<T, StoreError>
where
    F: Future<Output = RedisResult<T>>,
{
    match tokio::time::timeout(after, command).await {
        Ok(result) => result.map_err(StoreError::from),
        Err(_) => Err(StoreError::Timeout { operation, after }),
    }
}

#[async_trait]
impl CounterStore for RedisCounterStore {
    async fn increment(&self, key: &str) -> Result<u64, StoreError> {
        let mut connection = self.connection()?;
        let key = self.namespaced(key);

        let count: u64 = self
            .run("INCR", async move { connection.incr::<_, _, u64>(&key, 1u64).await })
            .await?;
        Ok(count)
    }

    async fn get(&self, key: &str) -> Result<Option<u64>, StoreError> {
        let mut connection = self.connection()?;
        let key = self.namespaced(key);

        let count: Option<u64> = self
            .run("GET", async move { connection.get::<_, Option<u64>>(&key).await })
            .await?;
        Ok(count)
    }

    async fn set_with_expiry(
        &self,
        key: &str,
        value: u64,
        ttl: Duration,
    ) -> Result<(), StoreError> {
        let mut connection = self.connection()?;
        let key = self.namespaced(key);
        let ttl_ms = u64::try_from(ttl.as_millis()).unwrap_or(u64::MAX).max(1);
        let script = &self.set_with_expiry_script;

        let _stored: u64 = self
            .run("SET", async move {
                script
                    .key(&key)
                    .arg(value)
                    .arg(ttl_ms)
                    .invoke_async(&mut connection)
                    .await
            })
            .await?;
        Ok(())
    }

    async fn delete(&self, key: &str) -> Result<(), StoreError> {
        let mut connection = self.connection()?;
        let key = self.namespaced(key);

        let _removed: u64 = self
            .run("DEL", async move { connection.del::<_, u64>(&key).await })
            .await?;
        Ok(())
    }

    /// Refuse further operations.
    ///
    /// The pooled connections stay open until the store is dropped; dropping
    /// the last handle releases them.
    async fn close(&self) -> Result<(), StoreError> {
        if !self.closed.swap(true, Ordering::AcqRel) {
            info!("Redis counter store closed");
        }
        Ok(())
    }
}
