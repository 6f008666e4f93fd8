// SQLite-backed durable queue
//
// Messages live in `queue_messages`. A `get` leases the oldest ready row by
// stamping it with a fresh delivery tag; `ack` deletes the row and
// `nack_requeue` clears the lease. A lease older than the visibility timeout
// is handed out again as a redelivery, which is what a broker does when a
// consumer dies without acknowledging.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use scanfleet_core::port::{
    Delivery, DeliveryTag, QueueChannel, QueueConnector, TimeProvider, TransportError,
};
use sqlx::SqlitePool;
use tracing::{debug, info};

/// Default queue name
pub const DEFAULT_QUEUE_NAME: &str = "scan_jobs";

/// Default lease duration before an unacknowledged message is redelivered
pub const DEFAULT_VISIBILITY_TIMEOUT: Duration = Duration::from_secs(3 * 3600);

fn map_transport_error(err: sqlx::Error) -> TransportError {
    match err {
        sqlx::Error::PoolClosed | sqlx::Error::PoolTimedOut | sqlx::Error::Io(_) => {
            TransportError::ConnectionLost(err.to_string())
        }
        other => TransportError::Broker(other.to_string()),
    }
}

pub struct SqliteQueueConnector {
    pool: SqlitePool,
    queue: String,
    visibility_timeout: Duration,
    time_provider: Arc<dyn TimeProvider>,
}

impl SqliteQueueConnector {
    pub fn new(pool: SqlitePool, time_provider: Arc<dyn TimeProvider>) -> Self {
        Self {
            pool,
            queue: DEFAULT_QUEUE_NAME.to_string(),
            visibility_timeout: DEFAULT_VISIBILITY_TIMEOUT,
            time_provider,
        }
    }

    pub fn with_queue(mut self, queue: impl Into<String>) -> Self {
        self.queue = queue.into();
        self
    }

    /// Must exceed the longest scan, or a running job gets delivered twice
    pub fn with_visibility_timeout(mut self, timeout: Duration) -> Self {
        self.visibility_timeout = timeout;
        self
    }
}

#[async_trait]
impl QueueConnector for SqliteQueueConnector {
    async fn connect(&self) -> Result<Arc<dyn QueueChannel>, TransportError> {
        sqlx::query("SELECT 1")
            .execute(&self.pool)
            .await
            .map_err(|e| TransportError::Connect(e.to_string()))?;

        Ok(Arc::new(SqliteQueueChannel {
            pool: self.pool.clone(),
            queue: self.queue.clone(),
            visibility_timeout_ms: self.visibility_timeout.as_millis() as i64,
            time_provider: Arc::clone(&self.time_provider),
        }))
    }
}

/// Same shape as the queue migration; declared again on every (re)connect
const QUEUE_TABLE_DDL: &str = r#"
    CREATE TABLE IF NOT EXISTS queue_messages (
        seq INTEGER PRIMARY KEY AUTOINCREMENT,
        queue TEXT NOT NULL,
        body BLOB NOT NULL,
        enqueued_at INTEGER NOT NULL,
        delivery_tag TEXT UNIQUE,
        leased_at INTEGER,
        redelivered INTEGER NOT NULL DEFAULT 0
    )
"#;

const QUEUE_INDEX_DDL: &str =
    "CREATE INDEX IF NOT EXISTS idx_queue_ready ON queue_messages(queue, delivery_tag, seq)";

pub struct SqliteQueueChannel {
    pool: SqlitePool,
    queue: String,
    visibility_timeout_ms: i64,
    time_provider: Arc<dyn TimeProvider>,
}

#[async_trait]
impl QueueChannel for SqliteQueueChannel {
    async fn declare_topology(&self) -> Result<(), TransportError> {
        for statement in [QUEUE_TABLE_DDL, QUEUE_INDEX_DDL] {
            sqlx::query(statement)
                .execute(&self.pool)
                .await
                .map_err(map_transport_error)?;
        }

        let depth: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM queue_messages WHERE queue = ?")
            .bind(&self.queue)
            .fetch_one(&self.pool)
            .await
            .map_err(map_transport_error)?;
        info!(queue = %self.queue, depth = depth, "Queue declared");
        Ok(())
    }

    async fn publish(&self, body: &[u8]) -> Result<(), TransportError> {
        sqlx::query("INSERT INTO queue_messages (queue, body, enqueued_at) VALUES (?, ?, ?)")
            .bind(&self.queue)
            .bind(body)
            .bind(self.time_provider.now_millis())
            .execute(&self.pool)
            .await
            .map_err(map_transport_error)?;
        Ok(())
    }

    async fn get(&self) -> Result<Option<Delivery>, TransportError> {
        let now = self.time_provider.now_millis();
        let tag = DeliveryTag(uuid::Uuid::new_v4().to_string());

        // Single statement, so two consumers can never lease the same row
        let row: Option<(Vec<u8>, bool)> = sqlx::query_as(
            r#"
            UPDATE queue_messages
            SET delivery_tag = ?1,
                leased_at = ?2,
                redelivered = CASE WHEN delivery_tag IS NULL THEN redelivered ELSE 1 END
            WHERE seq = (
                SELECT seq FROM queue_messages
                WHERE queue = ?3
                  AND (delivery_tag IS NULL OR leased_at <= ?4)
                ORDER BY seq ASC
                LIMIT 1
            )
            RETURNING body, redelivered
            "#,
        )
        .bind(&tag.0)
        .bind(now)
        .bind(&self.queue)
        .bind(now - self.visibility_timeout_ms)
        .fetch_optional(&self.pool)
        .await
        .map_err(map_transport_error)?;

        Ok(row.map(|(body, redelivered)| {
            debug!(queue = %self.queue, delivery = %tag, redelivered = redelivered, "Message leased");
            Delivery {
                tag,
                body,
                redelivered,
            }
        }))
    }

    async fn ack(&self, tag: &DeliveryTag) -> Result<(), TransportError> {
        let result = sqlx::query("DELETE FROM queue_messages WHERE delivery_tag = ?")
            .bind(&tag.0)
            .execute(&self.pool)
            .await
            .map_err(map_transport_error)?;

        if result.rows_affected() == 0 {
            return Err(TransportError::UnknownDelivery(tag.clone()));
        }
        Ok(())
    }

    async fn nack_requeue(&self, tag: &DeliveryTag) -> Result<(), TransportError> {
        let result = sqlx::query(
            r#"
            UPDATE queue_messages
            SET delivery_tag = NULL, leased_at = NULL, redelivered = 1
            WHERE delivery_tag = ?
            "#,
        )
        .bind(&tag.0)
        .execute(&self.pool)
        .await
        .map_err(map_transport_error)?;

        if result.rows_affected() == 0 {
            return Err(TransportError::UnknownDelivery(tag.clone()));
        }
        Ok(())
    }

    fn is_open(&self) -> bool {
        !self.pool.is_closed()
    }
}
