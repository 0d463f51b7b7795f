//! Business handler trait.

use crate::error::HandleError;
use crate::message::Message;
use async_trait::async_trait;

/// Processes one message.
///
/// Return `Ok(())` to acknowledge. A [`HandleError`] categorised as
/// `NotFound` or `InvalidPayload` acknowledges and drops the entry; any other
/// error leaves it pending so it is redelivered after the steal threshold.
/// Handlers must be idempotent: delivery is at-least-once.
///
/// # Example
///
/// ```rust,ignore
/// struct ResizeHandler;
///
/// #[async_trait]
/// impl MessageHandler for ResizeHandler {
///     async fn handle(&self, message: &Message) -> Result<(), HandleError> {
///         let request: ResizeRequest = serde_json::from_slice(message.data())?;
///         resize(request).await.map_err(|e| HandleError::transient(e.to_string()))
///     }
///
///     fn name(&self) -> &'static str {
///         "ResizeHandler"
///     }
/// }
/// ```
#[async_trait]
pub trait MessageHandler: Send + Sync {
    async fn handle(&self, message: &Message) -> Result<(), HandleError>;

    /// Handler name for logging.
    fn name(&self) -> &'static str;
}
