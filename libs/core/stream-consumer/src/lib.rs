//! Reliable Redis stream consumer
//!
//! Turns a Redis stream into an at-least-once work queue using consumer
//! groups, with recovery of work abandoned by crashed consumers.
//!
//! ## Components
//!
//! - **Initializer**: creates the group (`XGROUP CREATE ... MKSTREAM`) and registers the consumer
//! - **Reaper**: removes consumers that are idle and own no pending entries
//! - **Reader**: blocking `XREADGROUP` of fresh entries
//! - **Stealer**: periodic `XAUTOCLAIM` of idle entries, dropping poison ones
//! - **Orchestrator**: fans both sources into a bounded worker pool and owns shutdown
//!
//! ## Example
//!
//! ```ignore
//! use stream_consumer::{connect_with_retry, Orchestrator, OrchestratorConfig};
//!
//! let store = Arc::new(connect_with_retry(&redis_url, 5, Duration::from_millis(200)).await?);
//! let config = OrchestratorConfig::from_env_prefixed("IMAGE_RESULT")?;
//!
//! let mut orchestrator = Orchestrator::new(store, config, Arc::new(MyHandler))?;
//! orchestrator.initialize().await?;
//! orchestrator.run()?;
//! shutdown_signal().await;
//! orchestrator.shutdown().await?;
//! ```

mod config;
mod consumer;
mod error;
mod handler;
mod health;
mod initializer;
mod message;
pub mod metrics;
mod orchestrator;
mod producer;
mod reader;
mod reaper;
mod stealer;
pub mod store;

pub use config::{
    OrchestratorConfig, ReaderConfig, ReaperConfig, StealerConfig, DEFAULT_ENTRY_FIELD_KEY,
};
pub use consumer::{generate_consumer_name, ConsumerIdentity};
pub use error::{ErrorCategory, HandleError, StreamError, StreamResult};
pub use handler::MessageHandler;
pub use health::{health_router, HealthState};
pub use initializer::Initializer;
pub use message::{Acker, Delivery, Message};
pub use metrics::{init_metrics, render_metrics, MetricsSink, NoopMetrics, PrometheusMetrics};
pub use orchestrator::{LifecycleState, Orchestrator};
pub use producer::{StreamProducer, DEFAULT_STREAM_SIZE};
pub use reader::{Reader, READ_ERROR_BACKOFF};
pub use reaper::Reaper;
pub use stealer::{Stealer, STEAL_PAGE_SIZE};
pub use store::{
    connect_with_retry, AutoClaimed, ConsumerInfo, MemoryStore, PendingEntry, RedisStore,
    StreamEntry, StreamStore,
};
