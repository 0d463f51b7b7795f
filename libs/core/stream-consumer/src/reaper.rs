//! Dead consumer removal
//!
//! A consumer is dead when it has no pending entries and has been idle for
//! at least the configured threshold. Consumers that still own pending
//! entries are never removed; the stealer recovers their work instead.

use crate::config::ReaperConfig;
use crate::consumer::ConsumerIdentity;
use crate::error::StreamResult;
use crate::metrics::MetricsSink;
use crate::store::{ConsumerInfo, StreamStore};
use std::sync::Arc;
use tracing::{debug, info};

pub struct Reaper {
    store: Arc<dyn StreamStore>,
    identity: Arc<ConsumerIdentity>,
    config: ReaperConfig,
    metrics: Arc<dyn MetricsSink>,
}

impl Reaper {
    pub fn new(
        store: Arc<dyn StreamStore>,
        identity: Arc<ConsumerIdentity>,
        config: ReaperConfig,
        metrics: Arc<dyn MetricsSink>,
    ) -> Self {
        Self {
            store,
            identity,
            config,
            metrics,
        }
    }

    fn is_dead(&self, consumer: &ConsumerInfo) -> bool {
        consumer.pending == 0 && consumer.idle >= self.config.idle_time_threshold
    }

    /// Delete every dead consumer of the group, one at a time.
    ///
    /// The first deletion failure aborts the pass. Returns the removed names.
    pub async fn reap_idle_consumers(&self) -> StreamResult<Vec<String>> {
        let stream = self.identity.stream();
        let group = self.identity.group();

        let consumers = self.store.consumers_info(stream, group).await?;
        let mut reaped = Vec::new();

        for consumer in consumers.iter().filter(|c| self.is_dead(c)) {
            self.store
                .group_delete_consumer(stream, group, &consumer.name)
                .await?;
            info!(
                stream,
                group,
                consumer = %consumer.name,
                idle_ms = consumer.idle.as_millis() as u64,
                "Reaped idle consumer"
            );
            self.metrics.consumer_reaped();
            reaped.push(consumer.name.clone());
        }

        debug!(
            stream,
            group,
            inspected = consumers.len(),
            reaped = reaped.len(),
            "Reaper pass finished"
        );
        Ok(reaped)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::StreamError;
    use crate::metrics::NoopMetrics;
    use crate::store::MockStreamStore;
    use mockall::predicate::{always, eq};
    use std::time::Duration;

    fn info(name: &str, pending: u64, idle_secs: u64) -> ConsumerInfo {
        ConsumerInfo {
            name: name.to_string(),
            pending,
            idle: Duration::from_secs(idle_secs),
        }
    }

    fn reaper(store: MockStreamStore) -> Reaper {
        Reaper::new(
            Arc::new(store),
            Arc::new(ConsumerIdentity::new("img:req", "workers", "workers-consumer-self")),
            ReaperConfig {
                idle_time_threshold: Duration::from_secs(3600),
            },
            Arc::new(NoopMetrics),
        )
    }

    #[tokio::test]
    async fn test_only_idle_consumers_without_pending_are_reaped() {
        let mut store = MockStreamStore::new();
        store.expect_consumers_info().times(1).returning(|_, _| {
            Ok(vec![
                info("dead", 0, 7200),
                info("exactly-threshold", 0, 3600),
                info("busy-but-idle", 3, 7200),
                info("recent", 0, 60),
            ])
        });
        store
            .expect_group_delete_consumer()
            .with(eq("img:req"), eq("workers"), eq("dead"))
            .times(1)
            .returning(|_, _, _| Ok(0));
        store
            .expect_group_delete_consumer()
            .with(eq("img:req"), eq("workers"), eq("exactly-threshold"))
            .times(1)
            .returning(|_, _, _| Ok(0));

        let reaped = reaper(store).reap_idle_consumers().await.unwrap();
        assert_eq!(reaped, vec!["dead".to_string(), "exactly-threshold".to_string()]);
    }

    #[tokio::test]
    async fn test_deletion_failure_aborts_pass() {
        let mut store = MockStreamStore::new();
        store
            .expect_consumers_info()
            .returning(|_, _| Ok(vec![info("a", 0, 7200), info("b", 0, 7200)]));
        store
            .expect_group_delete_consumer()
            .with(always(), always(), eq("a"))
            .times(1)
            .returning(|_, _, _| Err(StreamError::Protocol("connection reset".to_string())));
        store
            .expect_group_delete_consumer()
            .with(always(), always(), eq("b"))
            .never();

        assert!(reaper(store).reap_idle_consumers().await.is_err());
    }

    #[tokio::test]
    async fn test_info_failure_propagates() {
        let mut store = MockStreamStore::new();
        store.expect_consumers_info().returning(|s, g| {
            Err(StreamError::NoGroup {
                stream: s.to_string(),
                group: g.to_string(),
            })
        });

        assert!(reaper(store).reap_idle_consumers().await.is_err());
    }

    #[tokio::test]
    async fn test_nothing_to_reap() {
        let mut store = MockStreamStore::new();
        store.expect_consumers_info().returning(|_, _| Ok(vec![]));
        store.expect_group_delete_consumer().never();

        assert!(reaper(store).reap_idle_consumers().await.unwrap().is_empty());
    }
}
