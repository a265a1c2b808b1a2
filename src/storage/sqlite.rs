//! SQLite [`MessageStore`] adapter.
//!
//! Claim atomicity rides on SQLite's single-writer model: the claim is one
//! `UPDATE ... WHERE id = (SELECT ...) RETURNING` statement, so two
//! concurrent claimants can never receive the same row.

use std::{sync::Arc, time::Duration};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::{
    sqlite::{SqliteConnectOptions, SqlitePool, SqlitePoolOptions},
    Sqlite, Transaction,
};

use crate::{
    config::MqConfig,
    error::{MqError, Result},
    message::{Message, MessageId, MessageStatus},
    storage::{MessageStore, QueueFilter},
    time::{Clock, SystemClock},
};

/// Durable store backed by a SQLite database.
#[derive(Debug, Clone)]
pub struct SqliteStore {
    pool: SqlitePool,
    table: String,
    clock: Arc<dyn Clock>,
}

impl SqliteStore {
    /// Wraps an existing pool, taking the table name from `config`.
    pub fn new(pool: SqlitePool, config: &MqConfig) -> Result<Self> {
        Self::with_clock(pool, config, Arc::new(SystemClock))
    }

    /// Wraps an existing pool with an explicit clock.
    pub fn with_clock(pool: SqlitePool, config: &MqConfig, clock: Arc<dyn Clock>) -> Result<Self> {
        validate_table_name(&config.table_name)?;
        Ok(Self {
            pool,
            table: config.table_name.clone(),
            clock,
        })
    }

    /// Opens (creating if needed) the database at `path` and wraps it.
    pub async fn connect(path: &str, config: &MqConfig) -> Result<Self> {
        let options = SqliteConnectOptions::new()
            .filename(path)
            .create_if_missing(true)
            .busy_timeout(Duration::from_secs(5));
        let pool = SqlitePoolOptions::new()
            .max_connections(5)
            .connect_with(options)
            .await?;
        Self::new(pool, config)
    }

    /// The underlying connection pool.
    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }

    /// Stores a message inside a caller-managed transaction, so the publish
    /// commits or rolls back together with the caller's own writes.
    pub async fn publish_in_tx(
        &self,
        tx: &mut Transaction<'_, Sqlite>,
        message: &Message,
    ) -> Result<()> {
        sqlx::query(&self.insert_sql())
            .bind(message.id)
            .bind(&message.topic)
            .bind(&message.queue)
            .bind(&message.data)
            .bind(&message.header)
            .bind(message.status)
            .bind(message.create_time)
            .bind(message.executable_time)
            .bind(message.retry_count)
            .execute(&mut **tx)
            .await?;
        Ok(())
    }

    /// Stores a batch of messages inside a caller-managed transaction.
    pub async fn publish_batch_in_tx(
        &self,
        tx: &mut Transaction<'_, Sqlite>,
        messages: &[Message],
    ) -> Result<()> {
        for message in messages {
            self.publish_in_tx(tx, message).await?;
        }
        Ok(())
    }

    fn insert_sql(&self) -> String {
        format!(
            "INSERT INTO {} \
             (id, topic, queue, data, header, status, create_time, executable_time, retry_count) \
             VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?)",
            self.table
        )
    }
}

/// Table names are interpolated into SQL, so only identifier characters are
/// accepted.
fn validate_table_name(name: &str) -> Result<()> {
    let valid = !name.is_empty()
        && !name.starts_with(|c: char| c.is_ascii_digit())
        && name.chars().all(|c| c.is_ascii_alphanumeric() || c == '_');
    if valid {
        Ok(())
    } else {
        Err(MqError::config(format!("invalid table name: {name:?}")))
    }
}

#[async_trait]
impl MessageStore for SqliteStore {
    async fn init_schema(&self) -> Result<()> {
        let ddl = format!(
            "CREATE TABLE IF NOT EXISTS {table} (\
                 id TEXT PRIMARY KEY, \
                 topic TEXT NOT NULL, \
                 queue TEXT, \
                 data TEXT NOT NULL, \
                 header TEXT, \
                 status TEXT NOT NULL, \
                 create_time TEXT NOT NULL, \
                 executable_time TEXT NOT NULL, \
                 retry_count INTEGER NOT NULL DEFAULT 0\
             )",
            table = self.table
        );
        sqlx::query(&ddl).execute(&self.pool).await?;

        let index = format!(
            "CREATE INDEX IF NOT EXISTS idx_{table}_claim \
             ON {table} (topic, status, executable_time)",
            table = self.table
        );
        sqlx::query(&index).execute(&self.pool).await?;
        Ok(())
    }

    async fn publish(&self, message: &Message) -> Result<()> {
        let mut tx = self.pool.begin().await?;
        self.publish_in_tx(&mut tx, message).await?;
        tx.commit().await?;
        Ok(())
    }

    async fn publish_batch(&self, messages: &[Message]) -> Result<()> {
        let mut tx = self.pool.begin().await?;
        self.publish_batch_in_tx(&mut tx, messages).await?;
        tx.commit().await?;
        Ok(())
    }

    async fn claim(&self, topic: &str, queue: QueueFilter<'_>) -> Result<Option<Message>> {
        let now = self.clock.now();
        let queue_clause = match queue {
            QueueFilter::Any => "",
            QueueFilter::Exact(Some(_)) => " AND queue = ?",
            QueueFilter::Exact(None) => " AND queue IS NULL",
        };
        let sql = format!(
            "UPDATE {table} SET status = ?, executable_time = ? \
             WHERE id = (\
                 SELECT id FROM {table} \
                 WHERE topic = ? AND status = ? AND executable_time <= ?{queue_clause} \
                 ORDER BY create_time, id LIMIT 1\
             ) \
             RETURNING id, topic, queue, data, header, status, create_time, \
                       executable_time, retry_count",
            table = self.table
        );

        let mut query = sqlx::query_as::<_, Message>(&sql)
            .bind(MessageStatus::Processing)
            .bind(now)
            .bind(topic)
            .bind(MessageStatus::Waiting)
            .bind(now);
        if let QueueFilter::Exact(Some(queue)) = queue {
            query = query.bind(queue);
        }

        Ok(query.fetch_optional(&self.pool).await?)
    }

    async fn ack(&self, id: MessageId) -> Result<()> {
        let sql = format!("UPDATE {} SET status = ? WHERE id = ?", self.table);
        sqlx::query(&sql)
            .bind(MessageStatus::Success)
            .bind(id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    async fn nack(&self, id: MessageId) -> Result<()> {
        let sql = format!("UPDATE {} SET status = ? WHERE id = ?", self.table);
        sqlx::query(&sql)
            .bind(MessageStatus::Failed)
            .bind(id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    async fn retry_update(
        &self,
        id: MessageId,
        retry_count: u32,
        executable_time: DateTime<Utc>,
    ) -> Result<()> {
        let sql = format!(
            "UPDATE {} SET status = ?, retry_count = ?, executable_time = ? WHERE id = ?",
            self.table
        );
        sqlx::query(&sql)
            .bind(MessageStatus::Waiting)
            .bind(retry_count)
            .bind(executable_time)
            .bind(id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    async fn reset_to_waiting(&self, id: MessageId) -> Result<()> {
        let sql = format!("UPDATE {} SET status = ? WHERE id = ?", self.table);
        sqlx::query(&sql)
            .bind(MessageStatus::Waiting)
            .bind(id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    async fn list_queues(&self, topic: &str) -> Result<Vec<Option<String>>> {
        let sql = format!(
            "SELECT queue FROM {} \
             WHERE topic = ? AND status = ? AND executable_time <= ? \
             GROUP BY queue",
            self.table
        );
        let rows: Vec<(Option<String>,)> = sqlx::query_as(&sql)
            .bind(topic)
            .bind(MessageStatus::Waiting)
            .bind(self.clock.now())
            .fetch_all(&self.pool)
            .await?;
        Ok(rows.into_iter().map(|(queue,)| queue).collect())
    }

    async fn reset_expired(&self, topic: &str, deadline: DateTime<Utc>) -> Result<u64> {
        let sql = format!(
            "UPDATE {} SET status = ?, executable_time = ? \
             WHERE topic = ? AND status = ? AND executable_time <= ?",
            self.table
        );
        let result = sqlx::query(&sql)
            .bind(MessageStatus::Waiting)
            .bind(self.clock.now())
            .bind(topic)
            .bind(MessageStatus::Processing)
            .bind(deadline)
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected())
    }

    async fn purge(&self, before: DateTime<Utc>) -> Result<u64> {
        let sql = format!("DELETE FROM {} WHERE create_time <= ?", self.table);
        let result = sqlx::query(&sql)
            .bind(before)
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn table_names_are_restricted_to_identifiers() {
        assert!(validate_table_name("mq_message").is_ok());
        assert!(validate_table_name("Messages2").is_ok());
        assert!(validate_table_name("").is_err());
        assert!(validate_table_name("2fast").is_err());
        assert!(validate_table_name("mq; DROP TABLE users").is_err());
    }
}
