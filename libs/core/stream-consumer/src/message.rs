//! Delivered stream message
//!
//! A [`Message`] is produced by the reader or the stealer and carries an
//! [`Acker`] bound to exactly one entry on one stream/group.

use crate::consumer::ConsumerIdentity;
use crate::error::StreamResult;
use crate::store::StreamStore;
use chrono::{DateTime, Utc};
use std::fmt;
use std::sync::Arc;
use tracing::debug;

/// How the message reached this consumer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Delivery {
    /// First delivery via the blocking read
    Fresh,
    /// Reclaimed from an idle consumer
    Stolen,
}

/// Acknowledgment bound to a single entry.
#[derive(Clone)]
pub struct Acker {
    store: Arc<dyn StreamStore>,
    identity: Arc<ConsumerIdentity>,
    entry_id: String,
}

impl Acker {
    pub fn new(
        store: Arc<dyn StreamStore>,
        identity: Arc<ConsumerIdentity>,
        entry_id: impl Into<String>,
    ) -> Self {
        Self {
            store,
            identity,
            entry_id: entry_id.into(),
        }
    }

    /// XACK the bound entry. `Ok(false)` when it was no longer pending.
    pub async fn ack(&self) -> StreamResult<bool> {
        let acked = self
            .store
            .ack(self.identity.stream(), self.identity.group(), &self.entry_id)
            .await?;
        debug!(entry_id = %self.entry_id, acked, "Acknowledged entry");
        Ok(acked)
    }
}

impl fmt::Debug for Acker {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Acker")
            .field("identity", &self.identity)
            .field("entry_id", &self.entry_id)
            .finish()
    }
}

/// A stream entry handed to a worker.
#[derive(Debug, Clone)]
pub struct Message {
    entry_id: String,
    data: Vec<u8>,
    delivery: Delivery,
    acker: Acker,
}

impl Message {
    pub fn new(
        entry_id: impl Into<String>,
        data: Vec<u8>,
        delivery: Delivery,
        acker: Acker,
    ) -> Self {
        Self {
            entry_id: entry_id.into(),
            data,
            delivery,
            acker,
        }
    }

    /// Store-assigned entry ID (e.g. "1700000000000-0")
    pub fn entry_id(&self) -> &str {
        &self.entry_id
    }

    /// Raw payload of the configured entry field.
    pub fn data(&self) -> &[u8] {
        &self.data
    }

    pub fn delivery(&self) -> Delivery {
        self.delivery
    }

    /// Whether the message was reclaimed from an idle consumer.
    pub fn is_stolen(&self) -> bool {
        self.delivery == Delivery::Stolen
    }

    /// Creation time encoded in the entry ID's millisecond part.
    pub fn timestamp(&self) -> Option<DateTime<Utc>> {
        self.entry_id
            .split('-')
            .next()
            .and_then(|ms| ms.parse::<i64>().ok())
            .and_then(DateTime::from_timestamp_millis)
    }

    /// Acknowledge this entry. Repeated calls return `Ok(false)`.
    pub async fn ack(&self) -> StreamResult<bool> {
        self.acker.ack().await
    }
}
