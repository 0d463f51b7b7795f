//! Fresh-entry reader
//!
//! Pulls never-delivered entries (`>`) for this consumer with a blocking
//! group read and forwards them as [`Message`]s.

use crate::config::ReaderConfig;
use crate::consumer::ConsumerIdentity;
use crate::message::{Acker, Delivery, Message};
use crate::store::{StreamEntry, StreamStore};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, info_span, warn, Instrument};

/// Pause after a failed read.
pub const READ_ERROR_BACKOFF: Duration = Duration::from_secs(5);

pub struct Reader {
    store: Arc<dyn StreamStore>,
    identity: Arc<ConsumerIdentity>,
    config: ReaderConfig,
    shutdown_tx: watch::Sender<bool>,
    handle: Option<JoinHandle<()>>,
}

impl Reader {
    pub fn new(
        store: Arc<dyn StreamStore>,
        identity: Arc<ConsumerIdentity>,
        config: ReaderConfig,
    ) -> Self {
        let (shutdown_tx, _) = watch::channel(false);
        Self {
            store,
            identity,
            config,
            shutdown_tx,
            handle: None,
        }
    }

    /// Start the read loop. The returned channel closes when the loop exits.
    pub fn run(&mut self) -> mpsc::Receiver<Message> {
        let (tx, rx) = mpsc::channel(1);
        let read_loop = ReadLoop {
            store: self.store.clone(),
            identity: self.identity.clone(),
            config: self.config.clone(),
        };
        let span = info_span!(
            "reader",
            stream = %self.identity.stream(),
            group = %self.identity.group(),
            consumer = %self.identity.name(),
        );
        let shutdown = self.shutdown_tx.subscribe();
        self.handle = Some(tokio::spawn(read_loop.run(tx, shutdown).instrument(span)));
        rx
    }

    /// Signal the loop to stop and wait until it has.
    ///
    /// A send in progress is completed first, so the output channel must keep
    /// being drained (or be dropped) while this runs.
    pub async fn shutdown(&mut self) {
        let _ = self.shutdown_tx.send(true);
        if let Some(handle) = self.handle.take() {
            if let Err(e) = handle.await {
                error!(error = %e, "Reader task failed");
            }
        }
    }
}

struct ReadLoop {
    store: Arc<dyn StreamStore>,
    identity: Arc<ConsumerIdentity>,
    config: ReaderConfig,
}

impl ReadLoop {
    async fn run(self, tx: mpsc::Sender<Message>, mut shutdown: watch::Receiver<bool>) {
        info!(
            batch_size = self.config.read_batch_size,
            block_ms = self.config.read_block_timeout.as_millis() as u64,
            "Reader started"
        );

        loop {
            if *shutdown.borrow() {
                break;
            }

            // An abandoned read leaves its entries pending for this consumer;
            // the stealer picks them up once they go idle.
            let result = tokio::select! {
                biased;
                _ = shutdown.changed() => break,
                result = self.store.group_read(
                    self.identity.stream(),
                    self.identity.group(),
                    self.identity.name(),
                    self.config.read_batch_size,
                    self.config.read_block_timeout,
                ) => result,
            };

            match result {
                Ok(entries) => {
                    for entry in entries {
                        let message = self.to_message(entry);
                        if tx.send(message).await.is_err() {
                            debug!("Reader output closed");
                            return;
                        }
                    }
                }
                Err(e) => {
                    error!(
                        error = %e,
                        backoff_ms = READ_ERROR_BACKOFF.as_millis() as u64,
                        "Failed to read from stream, backing off"
                    );
                    tokio::select! {
                        biased;
                        _ = shutdown.changed() => break,
                        _ = tokio::time::sleep(READ_ERROR_BACKOFF) => {}
                    }
                }
            }
        }

        info!("Reader stopped");
    }

    fn to_message(&self, entry: StreamEntry) -> Message {
        if !entry.fields.contains_key(&self.config.entry_field_key) {
            warn!(
                entry_id = %entry.id,
                field = %self.config.entry_field_key,
                "Entry is missing the payload field, delivering empty data"
            );
        }
        let data = entry.field_or_empty(&self.config.entry_field_key);
        let acker = Acker::new(self.store.clone(), self.identity.clone(), entry.id.clone());
        Message::new(entry.id, data, Delivery::Fresh, acker)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::StreamError;
    use crate::store::{MemoryStore, MockStreamStore};
    use std::sync::atomic::{AtomicUsize, Ordering};

    const STREAM: &str = "img:req";
    const GROUP: &str = "workers";

    fn config() -> ReaderConfig {
        ReaderConfig {
            entry_field_key: "msg".to_string(),
            read_block_timeout: Duration::from_millis(500),
            read_batch_size: 10,
        }
    }

    fn identity() -> Arc<ConsumerIdentity> {
        Arc::new(ConsumerIdentity::new(STREAM, GROUP, "workers-consumer-reader"))
    }

    async fn memory_store() -> Arc<MemoryStore> {
        let store = Arc::new(MemoryStore::new());
        store.group_create(STREAM, GROUP, "0", true).await.unwrap();
        store
    }

    #[tokio::test(start_paused = true)]
    async fn test_reads_fresh_entries_in_order() {
        let store = memory_store().await;
        for payload in ["a", "b", "c"] {
            store.append(STREAM, None, "msg", payload.as_bytes()).await.unwrap();
        }

        let mut reader = Reader::new(store.clone(), identity(), config());
        let mut rx = reader.run();

        let mut payloads = Vec::new();
        for _ in 0..3 {
            let message = rx.recv().await.unwrap();
            assert_eq!(message.delivery(), Delivery::Fresh);
            payloads.push(String::from_utf8(message.data().to_vec()).unwrap());
        }
        assert_eq!(payloads, vec!["a", "b", "c"]);

        reader.shutdown().await;
        assert!(rx.recv().await.is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn test_missing_field_yields_empty_data() {
        let store = memory_store().await;
        store.append(STREAM, None, "other", b"x").await.unwrap();

        let mut reader = Reader::new(store.clone(), identity(), config());
        let mut rx = reader.run();

        let message = rx.recv().await.unwrap();
        assert!(message.data().is_empty());
        reader.shutdown().await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_shutdown_interrupts_blocking_read() {
        let store = memory_store().await;
        let mut reader = Reader::new(
            store,
            identity(),
            ReaderConfig {
                read_block_timeout: Duration::from_secs(3600),
                ..config()
            },
        );
        let mut rx = reader.run();
        tokio::time::sleep(Duration::from_millis(10)).await;

        reader.shutdown().await;
        assert!(rx.recv().await.is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn test_read_error_backs_off_then_retries() {
        let calls = Arc::new(AtomicUsize::new(0));
        let mut store = MockStreamStore::new();
        {
            let calls = calls.clone();
            store.expect_group_read().returning(move |_, _, _, _, _| {
                if calls.fetch_add(1, Ordering::SeqCst) == 0 {
                    Err(StreamError::Protocol("connection reset".to_string()))
                } else {
                    Ok(vec![StreamEntry::new("1-0").with_field("msg", b"ok".to_vec())])
                }
            });
        }

        let start = tokio::time::Instant::now();
        let mut reader = Reader::new(Arc::new(store), identity(), config());
        let mut rx = reader.run();

        let message = rx.recv().await.unwrap();
        assert_eq!(message.entry_id(), "1-0");
        assert!(start.elapsed() >= READ_ERROR_BACKOFF);

        // The mock keeps producing; release the blocked send before stopping
        drop(rx);
        reader.shutdown().await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_shutdown_interrupts_backoff() {
        let mut store = MockStreamStore::new();
        store
            .expect_group_read()
            .returning(|_, _, _, _, _| Err(StreamError::Protocol("down".to_string())));

        let mut reader = Reader::new(Arc::new(store), identity(), config());
        let mut rx = reader.run();
        tokio::time::sleep(Duration::from_millis(10)).await;

        let start = tokio::time::Instant::now();
        reader.shutdown().await;
        assert!(start.elapsed() < READ_ERROR_BACKOFF);
        assert!(rx.recv().await.is_none());
    }
}
