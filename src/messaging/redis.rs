//! Redis-backed message queue.
//!
//! Uses the reliable-queue pattern: `LPUSH` to enqueue, `BRPOPLPUSH` into a
//! per-queue processing list on receive, `LREM` from the processing list on
//! delete. A consumer that dies mid-handling leaves its message on the
//! processing list, where [`RedisQueue::recover`] pushes it back for
//! redelivery.

use async_trait::async_trait;
use deadpool_redis::{Config as PoolConfig, Pool, Runtime};
use std::time::Duration;
use tracing::{debug, info};

use super::{MessageQueue, MessagingError, MessagingResult, ReceivedMessage};

/// Queue client over a shared Redis connection pool.
pub struct RedisQueue {
    name: String,
    processing: String,
    pool: Pool,
}

impl RedisQueue {
    /// Connect a queue to a Redis URL (e.g. `redis://localhost:6379`).
    pub async fn connect(url: &str, name: impl Into<String>) -> MessagingResult<Self> {
        let pool = PoolConfig::from_url(url)
            .builder()
            .map_err(MessagingError::backend)?
            .max_size(4)
            .runtime(Runtime::Tokio1)
            .build()
            .map_err(MessagingError::backend)?;

        let queue = Self::with_pool(pool, name);

        // Fail fast on an unreachable broker.
        let mut conn = queue.conn().await?;
        let _: String = redis::cmd("PING")
            .query_async(&mut conn)
            .await
            .map_err(MessagingError::backend)?;
        info!(queue = %queue.name, "Connected to message queue");
        Ok(queue)
    }

    /// Build from an existing pool, sharing connections across queues.
    pub fn with_pool(pool: Pool, name: impl Into<String>) -> Self {
        let name = name.into();
        let processing = format!("{name}:processing");
        Self {
            name,
            processing,
            pool,
        }
    }

    async fn conn(&self) -> MessagingResult<deadpool_redis::Connection> {
        self.pool.get().await.map_err(MessagingError::backend)
    }

    /// Push any stranded processing-list entries back onto the queue.
    pub async fn recover(&self) -> MessagingResult<usize> {
        let mut conn = self.conn().await?;
        let mut recovered = 0;
        loop {
            let moved: Option<String> = redis::cmd("RPOPLPUSH")
                .arg(&self.processing)
                .arg(&self.name)
                .query_async(&mut conn)
                .await
                .map_err(MessagingError::backend)?;
            if moved.is_none() {
                break;
            }
            recovered += 1;
        }
        if recovered > 0 {
            debug!(queue = %self.name, count = recovered, "Recovered in-flight messages");
        }
        Ok(recovered)
    }
}

#[async_trait]
impl MessageQueue for RedisQueue {
    fn name(&self) -> &str {
        &self.name
    }

    async fn send(&self, body: &str) -> MessagingResult<()> {
        let mut conn = self.conn().await?;
        let _: i64 = redis::cmd("LPUSH")
            .arg(&self.name)
            .arg(body)
            .query_async(&mut conn)
            .await
            .map_err(MessagingError::backend)?;
        Ok(())
    }

    async fn receive(&self, wait: Duration, max: usize) -> MessagingResult<Vec<ReceivedMessage>> {
        let mut conn = self.conn().await?;
        let mut received = Vec::new();

        // Block for the first message only; drain the rest without waiting.
        let first: Option<String> = redis::cmd("BRPOPLPUSH")
            .arg(&self.name)
            .arg(&self.processing)
            .arg(wait.as_secs_f64())
            .query_async(&mut conn)
            .await
            .map_err(MessagingError::backend)?;

        let Some(first) = first else {
            return Ok(received);
        };
        received.push(ReceivedMessage {
            handle: first.clone(),
            body: first,
        });

        while received.len() < max {
            let next: Option<String> = redis::cmd("RPOPLPUSH")
                .arg(&self.name)
                .arg(&self.processing)
                .query_async(&mut conn)
                .await
                .map_err(MessagingError::backend)?;
            match next {
                Some(body) => received.push(ReceivedMessage {
                    handle: body.clone(),
                    body,
                }),
                None => break,
            }
        }
        Ok(received)
    }

    async fn delete(&self, handle: &str) -> MessagingResult<()> {
        let mut conn = self.conn().await?;
        let _: i64 = redis::cmd("LREM")
            .arg(&self.processing)
            .arg(1)
            .arg(handle)
            .query_async(&mut conn)
            .await
            .map_err(MessagingError::backend)?;
        Ok(())
    }
}
