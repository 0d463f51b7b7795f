//! Consumer group bootstrap.

use crate::consumer::ConsumerIdentity;
use crate::error::StreamResult;
use crate::store::StreamStore;
use std::sync::Arc;
use tracing::{debug, info};

/// Creates the consumer group (if needed) and registers this consumer.
pub struct Initializer {
    store: Arc<dyn StreamStore>,
    identity: Arc<ConsumerIdentity>,
}

impl Initializer {
    pub fn new(store: Arc<dyn StreamStore>, identity: Arc<ConsumerIdentity>) -> Self {
        Self { store, identity }
    }

    /// Create the group at ID `0` with MKSTREAM, then register the consumer.
    ///
    /// An existing group is not an error; anything else is.
    pub async fn initialize(&self) -> StreamResult<()> {
        let stream = self.identity.stream();
        let group = self.identity.group();

        match self.store.group_create(stream, group, "0", true).await {
            Ok(()) => info!(stream, group, "Created consumer group"),
            Err(e) if e.is_group_exists() => {
                debug!(stream, group, "Consumer group already exists");
            }
            Err(e) => return Err(e),
        }

        let created = self
            .store
            .group_create_consumer(stream, group, self.identity.name())
            .await?;
        info!(
            stream,
            group,
            consumer = self.identity.name(),
            created,
            "Registered consumer"
        );
        Ok(())
    }
}
