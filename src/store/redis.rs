//! Redis connection management.

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use ::redis::aio::MultiplexedConnection;
use ::redis::{Client, RedisResult};
use tokio::sync::Mutex;

use crate::config::StoreConfig;
use crate::store::StoreError;

/// Handle to the shared Redis instance.
///
/// Cloning is cheap; all clones share one lazily established multiplexed connection.
#[derive(Clone)]
pub struct RedisStore {
    client: Client,
    conn: Arc<Mutex<Option<MultiplexedConnection>>>,
    op_timeout: Duration,
    prefix: String,
}

impl RedisStore {
    /// Parse the URL. No connection is made until the first operation.
    pub fn open(url: &str, config: &StoreConfig) -> Result<Self, StoreError> {
        let client = Client::open(url)?;
        Ok(Self {
            client,
            conn: Arc::new(Mutex::new(None)),
            op_timeout: config.op_timeout(),
            prefix: config.key_prefix.clone(),
        })
    }

    pub fn client(&self) -> &Client {
        &self.client
    }

    pub fn op_timeout(&self) -> Duration {
        self.op_timeout
    }

    /// Build a namespaced key: `{prefix}:{part}:{part}...`.
    pub fn key(&self, parts: &[&str]) -> String {
        let mut key = self.prefix.clone();
        for part in parts {
            key.push(':');
            key.push_str(part);
        }
        key
    }

    async fn connection(&self) -> Result<MultiplexedConnection, StoreError> {
        let mut guard = self.conn.lock().await;
        if let Some(conn) = guard.as_ref() {
            return Ok(conn.clone());
        }
        let conn = tokio::time::timeout(self.op_timeout, self.client.get_multiplexed_async_connection())
            .await
            .map_err(|_| StoreError::Timeout)??;
        tracing::debug!("Redis connection established");
        *guard = Some(conn.clone());
        Ok(conn)
    }

    async fn drop_connection(&self) {
        self.conn.lock().await.take();
    }

    /// Run one bounded operation against the shared connection.
    pub async fn run<T, F, Fut>(&self, op: F) -> Result<T, StoreError>
    where
        F: FnOnce(MultiplexedConnection) -> Fut,
        Fut: Future<Output = RedisResult<T>>,
    {
        let conn = self.connection().await?;
        match tokio::time::timeout(self.op_timeout, op(conn)).await {
            Ok(Ok(value)) => Ok(value),
            Ok(Err(e)) => {
                if e.is_io_error() || e.is_connection_dropped() || e.is_connection_refusal() {
                    self.drop_connection().await;
                }
                Err(e.into())
            }
            Err(_) => {
                self.drop_connection().await;
                Err(StoreError::Timeout)
            }
        }
    }
}
