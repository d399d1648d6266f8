use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use keel_core::error::AppError;
use keel_core::traits::KvStore;
use redis::AsyncCommands;
use redis::aio::ConnectionManager;
use tokio::sync::OnceCell;

const DEFAULT_OP_TIMEOUT: Duration = Duration::from_secs(2);

/// Redis-backed [`KvStore`].
///
/// The connection is opened on first use rather than at construction, so a
/// Redis that is down at startup only fails individual operations (which a
/// [`FallbackStore`](keel_core::store::FallbackStore) absorbs). Every call is
/// bounded by an operation timeout to keep an unresponsive server from
/// stalling job writes.
#[derive(Clone)]
pub struct RedisStore {
    client: redis::Client,
    conn: Arc<OnceCell<ConnectionManager>>,
    op_timeout: Duration,
}

impl fmt::Debug for RedisStore {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RedisStore")
            .field("connected", &self.conn.initialized())
            .field("op_timeout", &self.op_timeout)
            .finish()
    }
}

impl RedisStore {
    /// Validate the URL; no connection is attempted yet.
    pub fn new(url: &str) -> Result<Self, AppError> {
        let client = redis::Client::open(url)
            .map_err(|e| AppError::ConfigError(format!("Invalid REDIS_URL: {e}")))?;
        Ok(Self {
            client,
            conn: Arc::new(OnceCell::new()),
            op_timeout: DEFAULT_OP_TIMEOUT,
        })
    }

    pub fn with_op_timeout(mut self, timeout: Duration) -> Self {
        self.op_timeout = timeout;
        self
    }

    /// Establish the connection now instead of on first use.
    pub async fn connect(&self) -> Result<(), AppError> {
        self.connection().await.map(|_| ())
    }

    async fn connection(&self) -> Result<ConnectionManager, AppError> {
        let conn = self
            .conn
            .get_or_try_init(|| async {
                let manager = tokio::time::timeout(
                    self.op_timeout,
                    ConnectionManager::new(self.client.clone()),
                )
                .await
                .map_err(|_| AppError::StoreError("Redis connection timed out".into()))?
                .map_err(|e| AppError::StoreError(format!("Redis connection failed: {e}")))?;
                tracing::info!("Connected to Redis");
                Ok::<_, AppError>(manager)
            })
            .await?;
        Ok(conn.clone())
    }

    async fn bounded<T>(
        &self,
        op: &'static str,
        fut: impl Future<Output = redis::RedisResult<T>>,
    ) -> Result<T, AppError> {
        match tokio::time::timeout(self.op_timeout, fut).await {
            Ok(result) => result.map_err(|e| AppError::StoreError(format!("Redis {op} failed: {e}"))),
            Err(_) => Err(AppError::StoreError(format!(
                "Redis {op} timed out after {}ms",
                self.op_timeout.as_millis()
            ))),
        }
    }
}

impl KvStore for RedisStore {
    async fn get(&self, key: &str) -> Result<Option<String>, AppError> {
        let mut conn = self.connection().await?;
        self.bounded("GET", conn.get::<_, Option<String>>(key)).await
    }

    async fn set(&self, key: &str, value: &str, ttl: Option<Duration>) -> Result<(), AppError> {
        let mut conn = self.connection().await?;
        match ttl {
            // SETEX rejects zero, so sub-second TTLs round up.
            Some(ttl) => {
                let secs = ttl.as_secs().max(1);
                self.bounded("SETEX", conn.set_ex::<_, _, ()>(key, value, secs))
                    .await
            }
            None => self.bounded("SET", conn.set::<_, _, ()>(key, value)).await,
        }
    }

    async fn delete(&self, key: &str) -> Result<(), AppError> {
        let mut conn = self.connection().await?;
        self.bounded("DEL", conn.del::<_, ()>(key)).await
    }
}
