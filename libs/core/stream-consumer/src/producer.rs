//! Stream producer
//!
//! Appends payloads under the entry field the consumers read (`msg` by
//! default), trimming the stream with `MAXLEN ~`.
//!
//! # Example
//!
//! ```rust,ignore
//! use stream_consumer::StreamProducer;
//!
//! let producer = StreamProducer::new(store, "image:process:request").with_max_length(50_000);
//! let entry_id = producer.push_json(&request).await?;
//! ```

use crate::config::DEFAULT_ENTRY_FIELD_KEY;
use crate::error::StreamResult;
use crate::store::StreamStore;
use serde::Serialize;
use std::sync::Arc;
use tracing::debug;

/// Default approximate stream cap
pub const DEFAULT_STREAM_SIZE: usize = 100_000;

/// Appends entries to one stream.
#[derive(Clone)]
pub struct StreamProducer {
    store: Arc<dyn StreamStore>,
    stream_name: String,
    entry_field_key: String,
    max_length: Option<usize>,
}

impl StreamProducer {
    pub fn new(store: Arc<dyn StreamStore>, stream_name: impl Into<String>) -> Self {
        Self {
            store,
            stream_name: stream_name.into(),
            entry_field_key: DEFAULT_ENTRY_FIELD_KEY.to_string(),
            max_length: Some(DEFAULT_STREAM_SIZE),
        }
    }

    /// Set the approximate maximum stream length (`None` disables trimming).
    pub fn with_max_length(mut self, max_length: Option<usize>) -> Self {
        self.max_length = max_length;
        self
    }

    /// Write the payload under a different entry field.
    pub fn with_entry_field_key(mut self, key: impl Into<String>) -> Self {
        self.entry_field_key = key.into();
        self
    }

    pub fn stream_name(&self) -> &str {
        &self.stream_name
    }

    /// Append raw bytes. Returns the entry ID.
    pub async fn push(&self, payload: &[u8]) -> StreamResult<String> {
        let entry_id = self
            .store
            .append(
                &self.stream_name,
                self.max_length,
                &self.entry_field_key,
                payload,
            )
            .await?;

        debug!(
            stream = %self.stream_name,
            entry_id = %entry_id,
            bytes = payload.len(),
            "Appended entry"
        );
        Ok(entry_id)
    }

    /// Serialize `value` as JSON and append it.
    pub async fn push_json<T: Serialize>(&self, value: &T) -> StreamResult<String> {
        let payload = serde_json::to_vec(value)?;
        self.push(&payload).await
    }
}
