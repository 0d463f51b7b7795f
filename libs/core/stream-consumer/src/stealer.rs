//! Idle-entry stealer
//!
//! On every tick, claims entries that were delivered (to any consumer) but
//! not acknowledged within `steal_min_idle_time`. Entries delivered more than
//! `max_delivery_attempt` times are acknowledged without being handled.

use crate::config::StealerConfig;
use crate::consumer::ConsumerIdentity;
use crate::message::{Acker, Delivery, Message};
use crate::metrics::MetricsSink;
use crate::store::{StreamEntry, StreamStore};
use std::sync::Arc;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio::time::{interval_at, Instant, MissedTickBehavior};
use tracing::{debug, error, info, info_span, warn, Instrument};

/// Entries claimed per tick
pub const STEAL_PAGE_SIZE: usize = 100;

const STEAL_START_ID: &str = "0-0";

pub struct Stealer {
    store: Arc<dyn StreamStore>,
    identity: Arc<ConsumerIdentity>,
    config: StealerConfig,
    metrics: Arc<dyn MetricsSink>,
    shutdown_tx: watch::Sender<bool>,
    handle: Option<JoinHandle<()>>,
}

impl Stealer {
    pub fn new(
        store: Arc<dyn StreamStore>,
        identity: Arc<ConsumerIdentity>,
        config: StealerConfig,
        metrics: Arc<dyn MetricsSink>,
    ) -> Self {
        let (shutdown_tx, _) = watch::channel(false);
        Self {
            store,
            identity,
            config,
            metrics,
            shutdown_tx,
            handle: None,
        }
    }

    /// Start the steal loop. The returned channel closes when the loop exits.
    pub fn run(&mut self) -> mpsc::Receiver<Message> {
        let (tx, rx) = mpsc::channel(1);
        let steal_loop = StealLoop {
            store: self.store.clone(),
            identity: self.identity.clone(),
            config: self.config.clone(),
            metrics: self.metrics.clone(),
        };
        let span = info_span!(
            "stealer",
            stream = %self.identity.stream(),
            group = %self.identity.group(),
            consumer = %self.identity.name(),
        );
        let shutdown = self.shutdown_tx.subscribe();
        self.handle = Some(tokio::spawn(steal_loop.run(tx, shutdown).instrument(span)));
        rx
    }

    /// Signal the loop to stop and wait until it has.
    ///
    /// Like the reader, a send in progress completes first.
    pub async fn shutdown(&mut self) {
        let _ = self.shutdown_tx.send(true);
        if let Some(handle) = self.handle.take() {
            if let Err(e) = handle.await {
                error!(error = %e, "Stealer task failed");
            }
        }
    }
}

struct StealLoop {
    store: Arc<dyn StreamStore>,
    identity: Arc<ConsumerIdentity>,
    config: StealerConfig,
    metrics: Arc<dyn MetricsSink>,
}

/// Receiver of the stealer output went away.
struct OutputClosed;

impl StealLoop {
    async fn run(self, tx: mpsc::Sender<Message>, mut shutdown: watch::Receiver<bool>) {
        info!(
            interval_ms = self.config.steal_interval.as_millis() as u64,
            min_idle_ms = self.config.steal_min_idle_time.as_millis() as u64,
            max_delivery_attempt = self.config.max_delivery_attempt,
            "Stealer started"
        );

        let mut ticker = interval_at(
            Instant::now() + self.config.steal_interval,
            self.config.steal_interval,
        );
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                biased;
                _ = shutdown.changed() => break,
                _ = ticker.tick() => {}
            }

            if self.steal(&tx).await.is_err() {
                debug!("Stealer output closed");
                return;
            }
        }

        info!("Stealer stopped");
    }

    async fn steal(&self, tx: &mpsc::Sender<Message>) -> Result<(), OutputClosed> {
        let stream = self.identity.stream();
        let group = self.identity.group();

        let claimed = match self
            .store
            .auto_claim(
                stream,
                group,
                self.identity.name(),
                self.config.steal_min_idle_time,
                STEAL_START_ID,
                STEAL_PAGE_SIZE,
            )
            .await
        {
            Ok(claimed) => claimed,
            Err(e) => {
                error!(error = %e, "Failed to claim idle entries");
                return Ok(());
            }
        };

        if !claimed.deleted_ids.is_empty() {
            debug!(
                deleted = claimed.deleted_ids.len(),
                "Dropped pending entries whose stream entry no longer exists"
            );
        }
        if !claimed.entries.is_empty() {
            debug!(count = claimed.entries.len(), "Claimed idle entries");
        }

        for entry in claimed.entries {
            if let Some(message) = self.inspect(entry).await {
                self.metrics.message_stolen();
                tx.send(message).await.map_err(|_| OutputClosed)?;
            }
        }
        Ok(())
    }

    /// Decide whether a claimed entry is redelivered. `None` means skip it.
    async fn inspect(&self, entry: StreamEntry) -> Option<Message> {
        let stream = self.identity.stream();
        let group = self.identity.group();

        let pending = match self.store.pending_entry(stream, group, &entry.id).await {
            Ok(Some(pending)) => pending,
            Ok(None) => {
                debug!(entry_id = %entry.id, "Entry acknowledged concurrently, skipping");
                return None;
            }
            Err(e) => {
                error!(
                    entry_id = %entry.id,
                    error = %e,
                    "Failed to inspect claimed entry, leaving it pending"
                );
                return None;
            }
        };

        if pending.delivery_count > self.config.max_delivery_attempt {
            warn!(
                entry_id = %entry.id,
                delivery_count = pending.delivery_count,
                max_delivery_attempt = self.config.max_delivery_attempt,
                "Entry exceeded max delivery attempts, dropping"
            );
            match self.store.ack(stream, group, &entry.id).await {
                Ok(true) => self.metrics.poison_dropped(),
                Ok(false) => debug!(entry_id = %entry.id, "Poison entry was already acknowledged"),
                Err(e) => {
                    self.metrics.ack_failed();
                    error!(entry_id = %entry.id, error = %e, "Failed to drop poison entry");
                }
            }
            return None;
        }

        let data = entry.field_or_empty(&self.config.entry_field_key);
        let acker = Acker::new(self.store.clone(), self.identity.clone(), entry.id.clone());
        Some(Message::new(entry.id, data, Delivery::Stolen, acker))
    }
}
