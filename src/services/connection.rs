//! Connection management for the broker and the result cache.
//!
//! Both collaborators live behind a single multiplexed Redis connection per
//! process role. The connection is established with bounded retries at
//! startup, reused afterwards, and re-acquired once when an operation finds
//! it dropped.

use redis::aio::MultiplexedConnection;
use redis::RedisError;
use std::future::Future;
use std::time::Duration;
use tokio::sync::Mutex;

/// Fixed-delay retry schedule for establishing a connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub delay: Duration,
}

impl RetryPolicy {
    pub fn new(max_attempts: u32, delay: Duration) -> Self {
        Self {
            max_attempts: max_attempts.max(1),
            delay,
        }
    }

    /// Broker defaults: 30 attempts, 2 seconds apart.
    pub fn broker() -> Self {
        Self::new(30, Duration::from_secs(2))
    }

    /// Cache defaults: 10 attempts, 2 seconds apart.
    pub fn cache() -> Self {
        Self::new(10, Duration::from_secs(2))
    }
}

#[derive(Debug, thiserror::Error)]
pub enum ConnectionError {
    #[error("could not connect to {target} after {attempts} attempts: {last_error}")]
    Exhausted {
        target: String,
        attempts: u32,
        last_error: String,
    },

    #[error("invalid connection settings for {target}: {source}")]
    Config {
        target: String,
        #[source]
        source: RedisError,
    },

    #[error("Redis error: {0}")]
    Redis(#[from] RedisError),
}

impl ConnectionError {
    /// Whether retries ran out while connecting.
    pub fn is_exhausted(&self) -> bool {
        matches!(self, ConnectionError::Exhausted { .. })
    }
}

/// Run `connect` until it succeeds or `policy.max_attempts` is reached.
pub async fn connect_with_retry<T, E, F, Fut>(
    target: &str,
    policy: RetryPolicy,
    mut connect: F,
) -> Result<T, ConnectionError>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, E>>,
    E: std::fmt::Display,
{
    let mut attempt = 0;
    loop {
        attempt += 1;
        match connect().await {
            Ok(conn) => {
                tracing::info!(target_name = %target, attempt, "Connected");
                return Ok(conn);
            }
            Err(e) if attempt < policy.max_attempts => {
                tracing::warn!(
                    target_name = %target,
                    attempt,
                    max_attempts = policy.max_attempts,
                    error = %e,
                    "Connection attempt failed, retrying"
                );
                tokio::time::sleep(policy.delay).await;
            }
            Err(e) => {
                tracing::error!(
                    target_name = %target,
                    attempts = attempt,
                    error = %e,
                    "Connection retries exhausted"
                );
                return Err(ConnectionError::Exhausted {
                    target: target.to_string(),
                    attempts: attempt,
                    last_error: e.to_string(),
                });
            }
        }
    }
}

/// Whether an error means the shared connection itself is gone.
pub fn is_connection_lost(error: &RedisError) -> bool {
    error.is_connection_dropped() || error.is_io_error() || error.is_connection_refusal()
}

/// Run `op` on a connection from `acquire`. If the connection turns out to
/// be lost, ask `acquire` for a fresh one (`fresh = true`) and run `op`
/// exactly once more.
///
/// `op` must be safe to run twice: the first attempt may have reached the
/// server before its reply was lost.
pub async fn retry_once_if_lost<C, T, A, AFut, F, Fut>(
    target: &str,
    acquire: A,
    op: F,
) -> Result<T, ConnectionError>
where
    A: Fn(bool) -> AFut,
    AFut: Future<Output = Result<C, ConnectionError>>,
    F: Fn(C) -> Fut,
    Fut: Future<Output = Result<T, RedisError>>,
{
    let conn = acquire(false).await?;
    match op(conn).await {
        Ok(value) => Ok(value),
        Err(e) if is_connection_lost(&e) => {
            tracing::warn!(target_name = %target, error = %e, "Connection lost, re-acquiring");
            let conn = acquire(true).await?;
            Ok(op(conn).await?)
        }
        Err(e) => Err(e.into()),
    }
}

/// Owner of one lazily established, process-wide Redis connection.
pub struct RedisConnector {
    target: String,
    client: redis::Client,
    policy: RetryPolicy,
    conn: Mutex<Option<MultiplexedConnection>>,
}

impl RedisConnector {
    pub fn new(target: &str, url: &str, policy: RetryPolicy) -> Result<Self, ConnectionError> {
        let client = redis::Client::open(url).map_err(|source| ConnectionError::Config {
            target: target.to_string(),
            source,
        })?;
        Ok(Self {
            target: target.to_string(),
            client,
            policy,
            conn: Mutex::new(None),
        })
    }

    pub fn target(&self) -> &str {
        &self.target
    }

    /// Return the shared connection, connecting with retries if there is none.
    pub async fn acquire(&self) -> Result<MultiplexedConnection, ConnectionError> {
        let mut slot = self.conn.lock().await;
        if let Some(conn) = slot.as_ref() {
            return Ok(conn.clone());
        }
        let client = &self.client;
        let conn = connect_with_retry(&self.target, self.policy, || {
            client.get_multiplexed_async_connection()
        })
        .await?;
        *slot = Some(conn.clone());
        Ok(conn)
    }

    /// Forget the shared connection so the next `acquire` reconnects.
    pub async fn invalidate(&self) {
        self.conn.lock().await.take();
    }

    /// Run an idempotent `op` on the shared connection, re-acquiring and
    /// retrying once if the connection was lost.
    pub async fn run<T, F, Fut>(&self, op: F) -> Result<T, ConnectionError>
    where
        F: Fn(MultiplexedConnection) -> Fut,
        Fut: Future<Output = Result<T, RedisError>>,
    {
        retry_once_if_lost(
            &self.target,
            |fresh| async move {
                if fresh {
                    self.invalidate().await;
                }
                self.acquire().await
            },
            op,
        )
        .await
    }

    /// Run `op` once. A lost connection is dropped so the next call
    /// reconnects, but `op` is not replayed.
    pub async fn run_once<T, F, Fut>(&self, op: F) -> Result<T, ConnectionError>
    where
        F: FnOnce(MultiplexedConnection) -> Fut,
        Fut: Future<Output = Result<T, RedisError>>,
    {
        let conn = self.acquire().await?;
        match op(conn).await {
            Ok(value) => Ok(value),
            Err(e) => {
                if is_connection_lost(&e) {
                    tracing::warn!(target_name = %self.target, error = %e, "Connection lost, will reconnect on next use");
                    self.invalidate().await;
                }
                Err(e.into())
            }
        }
    }

    /// Round-trip a PING.
    pub async fn ping(&self) -> Result<(), ConnectionError> {
        self.run(|mut conn| async move {
            redis::cmd("PING").query_async::<String>(&mut conn).await
        })
        .await?;
        Ok(())
    }
}
