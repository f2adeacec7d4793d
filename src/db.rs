use crate::store::{KvStore, StoreError};
use async_trait::async_trait;
use sqlx::postgres::{PgPool, PgPoolOptions};
use sqlx::Executor;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::{sleep, Instant};
use tracing::debug;

/// How often an idle `pop` re-checks the queue table.
const POP_POLL_INTERVAL: Duration = Duration::from_millis(250);

/// `KvStore` on PostgreSQL, shared by every API and worker instance.
#[derive(Clone)]
pub struct PgStore {
    pool: Arc<PgPool>,
}

fn ttl_secs(ttl: Duration) -> f64 {
    ttl.as_secs_f64()
}

impl PgStore {
    pub async fn new(url: &str) -> Result<Self, StoreError> {
        let pool = PgPoolOptions::new()
            .max_connections(5)
            .connect(url)
            .await?;

        (&pool).execute(include_str!("setup.sql")).await?;

        Ok(PgStore {
            pool: Arc::new(pool),
        })
    }

    async fn try_pop(&self, queue: &str) -> Result<Option<String>, StoreError> {
        Ok(sqlx::query_scalar::<_, String>(
            "DELETE FROM posterq_queue \
            WHERE id = ( \
                SELECT id FROM posterq_queue \
                WHERE queue = $1 \
                ORDER BY id \
                FOR UPDATE SKIP LOCKED \
                LIMIT 1 \
            ) \
            RETURNING item",
        )
        .bind(queue)
        .fetch_optional(&*self.pool)
        .await?)
    }
}

#[async_trait]
impl KvStore for PgStore {
    async fn get(&self, key: &str) -> Result<Option<String>, StoreError> {
        Ok(sqlx::query_scalar::<_, String>(
            "SELECT value FROM posterq_kv \
            WHERE key = $1 AND (expires_at IS NULL OR expires_at > now())",
        )
        .bind(key)
        .fetch_optional(&*self.pool)
        .await?)
    }

    async fn set(&self, key: &str, value: &str, ttl: Option<Duration>) -> Result<(), StoreError> {
        sqlx::query(
            "INSERT INTO posterq_kv (key, value, expires_at) \
            VALUES ($1, $2, now() + make_interval(secs => $3)) \
            ON CONFLICT (key) DO UPDATE \
                SET value = EXCLUDED.value, expires_at = EXCLUDED.expires_at",
        )
        .bind(key)
        .bind(value)
        .bind(ttl.map(ttl_secs))
        .execute(&*self.pool)
        .await?;

        Ok(())
    }

    async fn set_if_absent(&self, key: &str, value: &str, ttl: Duration) -> Result<bool, StoreError> {
        // An expired row counts as absent and is taken over in the same statement.
        let written = sqlx::query_scalar::<_, String>(
            "INSERT INTO posterq_kv (key, value, expires_at) \
            VALUES ($1, $2, now() + make_interval(secs => $3)) \
            ON CONFLICT (key) DO UPDATE \
                SET value = EXCLUDED.value, expires_at = EXCLUDED.expires_at \
                WHERE posterq_kv.expires_at IS NOT NULL AND posterq_kv.expires_at <= now() \
            RETURNING key",
        )
        .bind(key)
        .bind(value)
        .bind(ttl_secs(ttl))
        .fetch_optional(&*self.pool)
        .await?;

        Ok(written.is_some())
    }

    async fn compare_and_delete(&self, key: &str, expected: &str) -> Result<bool, StoreError> {
        let result = sqlx::query(
            "DELETE FROM posterq_kv \
            WHERE key = $1 AND value = $2 \
                AND (expires_at IS NULL OR expires_at > now())",
        )
        .bind(key)
        .bind(expected)
        .execute(&*self.pool)
        .await?;

        Ok(result.rows_affected() == 1)
    }

    async fn compare_and_swap(&self, key: &str, expected: &str, value: &str) -> Result<bool, StoreError> {
        let result = sqlx::query(
            "UPDATE posterq_kv SET value = $3 \
            WHERE key = $1 AND value = $2 \
                AND (expires_at IS NULL OR expires_at > now())",
        )
        .bind(key)
        .bind(expected)
        .bind(value)
        .execute(&*self.pool)
        .await?;

        Ok(result.rows_affected() == 1)
    }

    async fn push(&self, queue: &str, item: &str) -> Result<(), StoreError> {
        debug!("Pushing {} onto {}", item, queue);
        sqlx::query("INSERT INTO posterq_queue (queue, item) VALUES ($1, $2)")
            .bind(queue)
            .bind(item)
            .execute(&*self.pool)
            .await?;

        Ok(())
    }

    async fn pop(&self, queue: &str, timeout: Duration) -> Result<Option<String>, StoreError> {
        let deadline = Instant::now() + timeout;
        loop {
            if let Some(item) = self.try_pop(queue).await? {
                return Ok(Some(item));
            }
            let now = Instant::now();
            if now >= deadline {
                return Ok(None);
            }
            sleep(POP_POLL_INTERVAL.min(deadline - now)).await;
        }
    }

    async fn ping(&self) -> Result<(), StoreError> {
        sqlx::query("SELECT 1").execute(&*self.pool).await?;
        Ok(())
    }
}
