//! Redis-backed stream store
//!
//! Regular commands go through a `ConnectionManager`, which reconnects on
//! failure. Blocking `XREADGROUP` calls use a dedicated multiplexed
//! connection without a response timeout so a long `BLOCK` neither trips the
//! client-side timeout nor stalls acknowledgments queued behind it.

use super::{AutoClaimed, ConsumerInfo, PendingEntry, StreamEntry, StreamStore};
use crate::error::{StreamError, StreamResult};
use async_trait::async_trait;
use redis::aio::{ConnectionManager, MultiplexedConnection};
use redis::streams::{
    StreamAutoClaimReply, StreamId, StreamInfoConsumersReply, StreamPendingCountReply,
    StreamReadReply,
};
use redis::{AsyncConnectionConfig, Client, RedisError};
use std::time::Duration;
use tokio::sync::Mutex;
use tracing::{info, warn};

/// Stream store speaking to a Redis/Valkey server.
pub struct RedisStore {
    client: Client,
    conn: ConnectionManager,
    blocking: Mutex<Option<MultiplexedConnection>>,
}

impl RedisStore {
    /// Open a client for `url` and verify it with PING.
    pub async fn connect(url: &str) -> StreamResult<Self> {
        let client = Client::open(url)?;
        let conn = ConnectionManager::new(client.clone()).await?;
        let store = Self {
            client,
            conn,
            blocking: Mutex::new(None),
        };
        store.ping().await?;
        Ok(store)
    }

    /// Get a clone of the connection manager.
    pub fn connection(&self) -> ConnectionManager {
        self.conn.clone()
    }

    async fn blocking_connection(&self) -> StreamResult<MultiplexedConnection> {
        let mut slot = self.blocking.lock().await;
        if let Some(conn) = slot.as_ref() {
            return Ok(conn.clone());
        }
        let config = AsyncConnectionConfig::new().set_response_timeout(None);
        let conn = self
            .client
            .get_multiplexed_async_connection_with_config(&config)
            .await?;
        *slot = Some(conn.clone());
        Ok(conn)
    }

    async fn reset_blocking_connection(&self) {
        *self.blocking.lock().await = None;
    }
}

/// Connect with exponential backoff, doubling `initial_delay` after each
/// failed attempt.
pub async fn connect_with_retry(
    url: &str,
    attempts: u32,
    initial_delay: Duration,
) -> StreamResult<RedisStore> {
    let attempts = attempts.max(1);
    let mut delay = initial_delay;
    let mut attempt = 1;

    loop {
        info!(attempt, "Attempting to connect to Redis");
        match RedisStore::connect(url).await {
            Ok(store) => {
                info!("Successfully connected to Redis");
                return Ok(store);
            }
            Err(e) if attempt < attempts => {
                warn!(
                    attempt,
                    max_attempts = attempts,
                    retry_in_ms = delay.as_millis() as u64,
                    error = %e,
                    "Redis connection failed, retrying"
                );
                tokio::time::sleep(delay).await;
                delay = delay.saturating_mul(2);
                attempt += 1;
            }
            Err(e) => return Err(e),
        }
    }
}

fn map_group_error(err: RedisError, stream: &str, group: &str) -> StreamError {
    match err.code() {
        Some("NOGROUP") => StreamError::NoGroup {
            stream: stream.to_string(),
            group: group.to_string(),
        },
        Some("BUSYGROUP") => StreamError::GroupExists {
            stream: stream.to_string(),
            group: group.to_string(),
        },
        _ => StreamError::Redis(err),
    }
}

/// XINFO on a stream that does not exist replies `ERR no such key`.
fn is_missing_key_reply(message: &str) -> bool {
    message.contains("no such key")
}

fn to_entry(id: &StreamId) -> StreamEntry {
    let fields = id
        .map
        .keys()
        .filter_map(|key| id.get::<Vec<u8>>(key).map(|value| (key.clone(), value)))
        .collect();
    StreamEntry {
        id: id.id.clone(),
        fields,
    }
}

#[async_trait]
impl StreamStore for RedisStore {
    async fn group_create(
        &self,
        stream: &str,
        group: &str,
        start_id: &str,
        mkstream: bool,
    ) -> StreamResult<()> {
        let mut cmd = redis::cmd("XGROUP");
        cmd.arg("CREATE").arg(stream).arg(group).arg(start_id);
        if mkstream {
            cmd.arg("MKSTREAM");
        }
        let mut conn = self.conn.clone();
        cmd.query_async::<()>(&mut conn)
            .await
            .map_err(|e| map_group_error(e, stream, group))
    }

    async fn group_create_consumer(
        &self,
        stream: &str,
        group: &str,
        consumer: &str,
    ) -> StreamResult<bool> {
        let mut conn = self.conn.clone();
        let created: i64 = redis::cmd("XGROUP")
            .arg("CREATECONSUMER")
            .arg(stream)
            .arg(group)
            .arg(consumer)
            .query_async(&mut conn)
            .await
            .map_err(|e| map_group_error(e, stream, group))?;
        Ok(created == 1)
    }

    async fn group_delete_consumer(
        &self,
        stream: &str,
        group: &str,
        consumer: &str,
    ) -> StreamResult<u64> {
        let mut conn = self.conn.clone();
        let pending: u64 = redis::cmd("XGROUP")
            .arg("DELCONSUMER")
            .arg(stream)
            .arg(group)
            .arg(consumer)
            .query_async(&mut conn)
            .await
            .map_err(|e| map_group_error(e, stream, group))?;
        Ok(pending)
    }

    async fn group_read(
        &self,
        stream: &str,
        group: &str,
        consumer: &str,
        count: usize,
        block: Duration,
    ) -> StreamResult<Vec<StreamEntry>> {
        let mut conn = self.blocking_connection().await?;
        let result: Result<Option<StreamReadReply>, RedisError> = redis::cmd("XREADGROUP")
            .arg("GROUP")
            .arg(group)
            .arg(consumer)
            .arg("COUNT")
            .arg(count)
            .arg("BLOCK")
            .arg(block.as_millis() as u64)
            .arg("STREAMS")
            .arg(stream)
            .arg(">")
            .query_async(&mut conn)
            .await;

        match result {
            Ok(Some(reply)) => Ok(reply
                .keys
                .iter()
                .flat_map(|key| key.ids.iter().map(to_entry))
                .collect()),
            Ok(None) => Ok(Vec::new()),
            Err(e) => {
                if e.is_io_error() || e.is_connection_dropped() {
                    self.reset_blocking_connection().await;
                }
                Err(map_group_error(e, stream, group))
            }
        }
    }

    async fn ack(&self, stream: &str, group: &str, entry_id: &str) -> StreamResult<bool> {
        let mut conn = self.conn.clone();
        let acked: i64 = redis::cmd("XACK")
            .arg(stream)
            .arg(group)
            .arg(entry_id)
            .query_async(&mut conn)
            .await?;
        Ok(acked > 0)
    }

    async fn auto_claim(
        &self,
        stream: &str,
        group: &str,
        consumer: &str,
        min_idle: Duration,
        start_id: &str,
        count: usize,
    ) -> StreamResult<AutoClaimed> {
        let mut conn = self.conn.clone();
        let reply: StreamAutoClaimReply = redis::cmd("XAUTOCLAIM")
            .arg(stream)
            .arg(group)
            .arg(consumer)
            .arg(min_idle.as_millis() as u64)
            .arg(start_id)
            .arg("COUNT")
            .arg(count)
            .query_async(&mut conn)
            .await
            .map_err(|e| map_group_error(e, stream, group))?;

        Ok(AutoClaimed {
            next_start_id: reply.next_stream_id,
            entries: reply.claimed.iter().map(to_entry).collect(),
            deleted_ids: reply.deleted_ids,
        })
    }

    async fn pending_entry(
        &self,
        stream: &str,
        group: &str,
        entry_id: &str,
    ) -> StreamResult<Option<PendingEntry>> {
        let mut conn = self.conn.clone();
        let reply: StreamPendingCountReply = redis::cmd("XPENDING")
            .arg(stream)
            .arg(group)
            .arg(entry_id)
            .arg(entry_id)
            .arg(1)
            .query_async(&mut conn)
            .await
            .map_err(|e| map_group_error(e, stream, group))?;

        Ok(reply
            .ids
            .into_iter()
            .find(|p| p.id == entry_id)
            .map(|p| PendingEntry {
                id: p.id,
                consumer: p.consumer,
                idle: Duration::from_millis(p.last_delivered_ms as u64),
                delivery_count: p.times_delivered as u64,
            }))
    }

    async fn consumers_info(&self, stream: &str, group: &str) -> StreamResult<Vec<ConsumerInfo>> {
        let mut conn = self.conn.clone();
        let reply: StreamInfoConsumersReply = redis::cmd("XINFO")
            .arg("CONSUMERS")
            .arg(stream)
            .arg(group)
            .query_async(&mut conn)
            .await
            .map_err(|e| {
                if is_missing_key_reply(&e.to_string()) {
                    StreamError::NoGroup {
                        stream: stream.to_string(),
                        group: group.to_string(),
                    }
                } else {
                    map_group_error(e, stream, group)
                }
            })?;

        Ok(reply
            .consumers
            .into_iter()
            .map(|c| ConsumerInfo {
                name: c.name,
                pending: c.pending as u64,
                idle: Duration::from_millis(c.idle as u64),
            })
            .collect())
    }

    async fn append(
        &self,
        stream: &str,
        max_len: Option<usize>,
        field: &str,
        value: &[u8],
    ) -> StreamResult<String> {
        let mut cmd = redis::cmd("XADD");
        cmd.arg(stream);
        if let Some(max_len) = max_len {
            // Approximate trimming (~) lets Redis trim whole macro nodes
            cmd.arg("MAXLEN").arg("~").arg(max_len);
        }
        cmd.arg("*").arg(field).arg(value);

        let mut conn = self.conn.clone();
        let id: String = cmd.query_async(&mut conn).await?;
        Ok(id)
    }

    async fn ping(&self) -> StreamResult<()> {
        let mut conn = self.conn.clone();
        let pong: String = redis::cmd("PING").query_async(&mut conn).await?;
        if pong != "PONG" {
            return Err(StreamError::Protocol(format!(
                "unexpected PING reply: {pong}"
            )));
        }
        Ok(())
    }
}
