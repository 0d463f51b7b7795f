//! Stream store command surface
//!
//! The engine only talks to the store through [`StreamStore`]. `RedisStore`
//! speaks to a Redis/Valkey server; `MemoryStore` keeps everything in process.

mod memory;
mod redis;

pub use self::memory::MemoryStore;
pub use self::redis::{connect_with_retry, RedisStore};

use crate::error::StreamResult;
use async_trait::async_trait;
use std::collections::HashMap;
use std::time::Duration;

/// A single stream entry.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StreamEntry {
    pub id: String,
    pub fields: HashMap<String, Vec<u8>>,
}

impl StreamEntry {
    pub fn new(id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            fields: HashMap::new(),
        }
    }

    pub fn with_field(mut self, key: impl Into<String>, value: impl Into<Vec<u8>>) -> Self {
        self.fields.insert(key.into(), value.into());
        self
    }

    /// Value of `key`, or an empty payload when the field is absent.
    pub fn field_or_empty(&self, key: &str) -> Vec<u8> {
        self.fields.get(key).cloned().unwrap_or_default()
    }
}

/// Result of one XAUTOCLAIM page.
#[derive(Debug, Clone, Default)]
pub struct AutoClaimed {
    /// Cursor for the next page ("0-0" once the scan wrapped around)
    pub next_start_id: String,
    pub entries: Vec<StreamEntry>,
    /// Pending IDs whose stream entry no longer exists (removed from the PEL by the store)
    pub deleted_ids: Vec<String>,
}

/// Pending-entries-list metadata for one entry.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PendingEntry {
    pub id: String,
    pub consumer: String,
    pub idle: Duration,
    pub delivery_count: u64,
}

/// XINFO CONSUMERS row.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConsumerInfo {
    pub name: String,
    pub pending: u64,
    pub idle: Duration,
}

/// Narrow stream command surface used by the consumer-group engine.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait StreamStore: Send + Sync {
    /// XGROUP CREATE. Fails with `StreamError::GroupExists` when the group exists.
    async fn group_create(
        &self,
        stream: &str,
        group: &str,
        start_id: &str,
        mkstream: bool,
    ) -> StreamResult<()>;

    /// XGROUP CREATECONSUMER. Returns whether the consumer was newly created.
    async fn group_create_consumer(
        &self,
        stream: &str,
        group: &str,
        consumer: &str,
    ) -> StreamResult<bool>;

    /// XGROUP DELCONSUMER. Returns the number of pending entries the consumer had.
    async fn group_delete_consumer(
        &self,
        stream: &str,
        group: &str,
        consumer: &str,
    ) -> StreamResult<u64>;

    /// XREADGROUP ... STREAMS stream `>`. Empty when the block timeout elapsed.
    async fn group_read(
        &self,
        stream: &str,
        group: &str,
        consumer: &str,
        count: usize,
        block: Duration,
    ) -> StreamResult<Vec<StreamEntry>>;

    /// XACK for a single entry. `false` when the entry was not pending.
    async fn ack(&self, stream: &str, group: &str, entry_id: &str) -> StreamResult<bool>;

    /// XAUTOCLAIM.
    async fn auto_claim(
        &self,
        stream: &str,
        group: &str,
        consumer: &str,
        min_idle: Duration,
        start_id: &str,
        count: usize,
    ) -> StreamResult<AutoClaimed>;

    /// XPENDING stream group id id 1.
    async fn pending_entry(
        &self,
        stream: &str,
        group: &str,
        entry_id: &str,
    ) -> StreamResult<Option<PendingEntry>>;

    /// XINFO CONSUMERS.
    async fn consumers_info(&self, stream: &str, group: &str) -> StreamResult<Vec<ConsumerInfo>>;

    /// XADD with approximate MAXLEN trimming when `max_len` is set.
    async fn append(
        &self,
        stream: &str,
        max_len: Option<usize>,
        field: &str,
        value: &[u8],
    ) -> StreamResult<String>;

    /// Connectivity check.
    async fn ping(&self) -> StreamResult<()>;
}
