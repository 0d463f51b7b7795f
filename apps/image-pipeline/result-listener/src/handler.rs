//! Image process result handling

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use stream_consumer::{HandleError, Message, MessageHandler};
use tracing::{debug, info, warn};

/// Outcome of processing one image variant.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ProcessStatus {
    Succeeded,
    Failed,
}

/// Result published by the image processor.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ImageProcessResult {
    pub image_id: String,
    pub preset: String,
    pub status: ProcessStatus,
    #[serde(default)]
    pub error_message: Option<String>,
    #[serde(default)]
    pub processed_at: Option<DateTime<Utc>>,
    /// Propagated tracing headers
    #[serde(default)]
    pub trace_context: HashMap<String, String>,
}

impl ImageProcessResult {
    fn validate(&self) -> Result<(), HandleError> {
        if self.image_id.trim().is_empty() {
            return Err(HandleError::invalid_payload("image_id is empty"));
        }
        if self.preset.trim().is_empty() {
            return Err(HandleError::invalid_payload("preset is empty"));
        }
        Ok(())
    }
}

/// Decodes results and records them.
#[derive(Debug, Default)]
pub struct ImageProcessResultHandler;

#[async_trait]
impl MessageHandler for ImageProcessResultHandler {
    async fn handle(&self, message: &Message) -> Result<(), HandleError> {
        debug!(
            entry_id = %message.entry_id(),
            data = %String::from_utf8_lossy(message.data()),
            "Handling image process result"
        );

        let result: ImageProcessResult = serde_json::from_slice(message.data())?;
        result.validate()?;

        match result.status {
            ProcessStatus::Succeeded => info!(
                image_id = %result.image_id,
                preset = %result.preset,
                processed_at = ?result.processed_at,
                stolen = message.is_stolen(),
                "Image processed"
            ),
            ProcessStatus::Failed => warn!(
                image_id = %result.image_id,
                preset = %result.preset,
                error = result.error_message.as_deref().unwrap_or("unknown"),
                "Image processing failed"
            ),
        }
        Ok(())
    }

    fn name(&self) -> &'static str {
        "ImageProcessResultHandler"
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::time::Duration;
    use stream_consumer::{ErrorCategory, MemoryStore, StreamStore};

    const STREAM: &str = "image:process:result";
    const GROUP: &str = "gateway";

    async fn message(payload: &[u8]) -> Message {
        use stream_consumer::{Acker, ConsumerIdentity, Delivery};

        let store = Arc::new(MemoryStore::new());
        store.group_create(STREAM, GROUP, "0", true).await.unwrap();
        let id = store.append(STREAM, None, "msg", payload).await.unwrap();
        store
            .group_read(STREAM, GROUP, "c1", 1, Duration::from_millis(1))
            .await
            .unwrap();

        let identity = Arc::new(ConsumerIdentity::new(STREAM, GROUP, "c1"));
        let acker = Acker::new(store, identity, id.clone());
        Message::new(id, payload.to_vec(), Delivery::Fresh, acker)
    }

    #[tokio::test]
    async fn test_handles_valid_result() {
        let payload = serde_json::to_vec(&ImageProcessResult {
            image_id: "img-1".to_string(),
            preset: "thumbnail".to_string(),
            status: ProcessStatus::Succeeded,
            error_message: None,
            processed_at: Some(Utc::now()),
            trace_context: HashMap::new(),
        })
        .unwrap();

        let result = ImageProcessResultHandler.handle(&message(&payload).await).await;
        assert!(result.is_ok());
    }

    #[tokio::test]
    async fn test_failed_status_is_still_handled() {
        let payload = br#"{"image_id":"img-2","preset":"webp","status":"failed","error_message":"decode"}"#;
        let result = ImageProcessResultHandler.handle(&message(payload).await).await;
        assert!(result.is_ok());
    }

    #[tokio::test]
    async fn test_malformed_json_is_invalid_payload() {
        let err = ImageProcessResultHandler
            .handle(&message(b"{not json").await)
            .await
            .unwrap_err();
        assert_eq!(err.category(), ErrorCategory::InvalidPayload);
    }

    #[tokio::test]
    async fn test_empty_image_id_is_invalid_payload() {
        let payload = br#"{"image_id":" ","preset":"webp","status":"succeeded"}"#;
        let err = ImageProcessResultHandler
            .handle(&message(payload).await)
            .await
            .unwrap_err();
        assert_eq!(err.category(), ErrorCategory::InvalidPayload);
    }
}
