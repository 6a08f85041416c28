use std::time::Duration;

use async_trait::async_trait;
use redis::aio::ConnectionManager;
use redis::AsyncCommands;
use uuid::Uuid;

use crate::queue::{Broker, QueueError};

/// Redis key semantics shared by every producer and consumer
/// Keys are deterministic so the API, workers and operators agree on them

pub const QUEUE_PREFIX: &str = "ces:queue";

/// List holding messages waiting to be claimed
pub fn queue_key(name: &str) -> String {
    format!("{}:{}", QUEUE_PREFIX, name)
}

/// List holding messages claimed by one consumer and not yet settled
pub fn processing_key(name: &str, consumer: &Uuid) -> String {
    format!("{}:processing:{}", queue_key(name), consumer)
}

/// List holding messages rejected without requeue
pub fn dead_letter_key(name: &str) -> String {
    format!("{}:dead", queue_key(name))
}

/// Broker backed by redis lists.
///
/// Claims block on their own connection so publishing and settling never
/// queue up behind a `BLMOVE`.
#[derive(Clone)]
pub struct RedisBroker {
    commands: ConnectionManager,
    blocking: ConnectionManager,
}

impl RedisBroker {
    pub async fn connect(url: &str) -> Result<Self, QueueError> {
        let client = redis::Client::open(url)?;
        let commands = ConnectionManager::new(client.clone()).await?;
        let blocking = ConnectionManager::new(client).await?;
        Ok(Self { commands, blocking })
    }
}

#[async_trait]
impl Broker for RedisBroker {
    async fn publish(&self, queue: &str, payload: &str) -> Result<(), QueueError> {
        let mut conn = self.commands.clone();
        conn.lpush::<_, _, ()>(queue, payload).await?;
        Ok(())
    }

    async fn claim(
        &self,
        queue: &str,
        processing: &str,
        timeout: Duration,
    ) -> Result<Option<String>, QueueError> {
        let mut conn = self.blocking.clone();
        let payload: Option<String> = redis::cmd("BLMOVE")
            .arg(queue)
            .arg(processing)
            .arg("RIGHT")
            .arg("LEFT")
            .arg(timeout.as_secs_f64())
            .query_async(&mut conn)
            .await?;
        Ok(payload)
    }

    async fn settle(&self, processing: &str, payload: &str) -> Result<(), QueueError> {
        let mut conn = self.commands.clone();
        conn.lrem::<_, _, ()>(processing, 1, payload).await?;
        Ok(())
    }

    async fn restore(
        &self,
        queue: &str,
        processing: &str,
        payload: &str,
    ) -> Result<(), QueueError> {
        let mut conn = self.commands.clone();
        redis::pipe()
            .atomic()
            .lrem(processing, 1, payload)
            .ignore()
            .rpush(queue, payload)
            .ignore()
            .query_async::<_, ()>(&mut conn)
            .await?;
        Ok(())
    }

    async fn bury(
        &self,
        dead_letter: &str,
        processing: &str,
        payload: &str,
    ) -> Result<(), QueueError> {
        let mut conn = self.commands.clone();
        redis::pipe()
            .atomic()
            .lrem(processing, 1, payload)
            .ignore()
            .lpush(dead_letter, payload)
            .ignore()
            .query_async::<_, ()>(&mut conn)
            .await?;
        Ok(())
    }
}
