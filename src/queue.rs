use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex};

use redis::AsyncCommands;

use crate::error::QueueError;

/// Write-behind backlog, drained by the persistence pump.
pub const DB_WRITE_QUEUE: &str = "chess:db_write_queue";
/// Tasks whose durable application failed; kept for operator inspection.
pub const DB_WRITE_DEAD_LETTER: &str = "chess:db_write_dead_letter";
pub const MATCHMAKING_QUEUE_PREFIX: &str = "chess:matchmaking_queue:";

/// The time controls (seconds per side) the matchmaking engine sweeps.
pub const TIME_CONTROLS: [u32; 6] = [60, 180, 300, 600, 900, 1800];

pub fn matchmaking_queue_name(time_control: u32) -> String {
    format!("{MATCHMAKING_QUEUE_PREFIX}{time_control}")
}

/// Named FIFO lists shared across coordinator processes. Backed by Redis in
/// production; the in-memory backend serves the test harness.
#[derive(Clone)]
pub struct SharedQueue {
    backend: Backend,
}

#[derive(Clone)]
enum Backend {
    Redis(redis::Client),
    Memory(Arc<Mutex<HashMap<String, VecDeque<String>>>>),
}

impl SharedQueue {
    pub fn redis(url: &str) -> Result<Self, QueueError> {
        Ok(Self {
            backend: Backend::Redis(redis::Client::open(url)?),
        })
    }

    pub fn memory() -> Self {
        Self {
            backend: Backend::Memory(Arc::new(Mutex::new(HashMap::new()))),
        }
    }

    /// Appends to the tail (normal enqueue position).
    pub async fn push_back(&self, queue: &str, value: &str) -> Result<(), QueueError> {
        match &self.backend {
            Backend::Redis(client) => {
                let mut conn = client.get_multiplexed_async_connection().await?;
                conn.rpush::<_, _, ()>(queue, value).await?;
                Ok(())
            }
            Backend::Memory(lists) => {
                lists
                    .lock()
                    .unwrap()
                    .entry(queue.to_string())
                    .or_default()
                    .push_back(value.to_string());
                Ok(())
            }
        }
    }

    /// Prepends to the head. Used to restore a popped-but-unmatched entry
    /// to its original queue position.
    pub async fn push_front(&self, queue: &str, value: &str) -> Result<(), QueueError> {
        match &self.backend {
            Backend::Redis(client) => {
                let mut conn = client.get_multiplexed_async_connection().await?;
                conn.lpush::<_, _, ()>(queue, value).await?;
                Ok(())
            }
            Backend::Memory(lists) => {
                lists
                    .lock()
                    .unwrap()
                    .entry(queue.to_string())
                    .or_default()
                    .push_front(value.to_string());
                Ok(())
            }
        }
    }

    pub async fn pop_front(&self, queue: &str) -> Result<Option<String>, QueueError> {
        match &self.backend {
            Backend::Redis(client) => {
                let mut conn = client.get_multiplexed_async_connection().await?;
                Ok(conn.lpop::<_, Option<String>>(queue, None).await?)
            }
            Backend::Memory(lists) => Ok(lists
                .lock()
                .unwrap()
                .get_mut(queue)
                .and_then(|l| l.pop_front())),
        }
    }

    pub async fn len(&self, queue: &str) -> Result<usize, QueueError> {
        match &self.backend {
            Backend::Redis(client) => {
                let mut conn = client.get_multiplexed_async_connection().await?;
                Ok(conn.llen::<_, usize>(queue).await?)
            }
            Backend::Memory(lists) => Ok(lists
                .lock()
                .unwrap()
                .get(queue)
                .map(|l| l.len())
                .unwrap_or(0)),
        }
    }

    /// Removes every occurrence of `value`. Returns how many were removed.
    pub async fn remove(&self, queue: &str, value: &str) -> Result<usize, QueueError> {
        match &self.backend {
            Backend::Redis(client) => {
                let mut conn = client.get_multiplexed_async_connection().await?;
                Ok(conn.lrem::<_, _, usize>(queue, 0, value).await?)
            }
            Backend::Memory(lists) => {
                let mut lists = lists.lock().unwrap();
                let Some(list) = lists.get_mut(queue) else {
                    return Ok(0);
                };
                let before = list.len();
                list.retain(|v| v != value);
                Ok(before - list.len())
            }
        }
    }
}
