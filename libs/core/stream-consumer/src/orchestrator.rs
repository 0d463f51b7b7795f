//! Consumer orchestration
//!
//! The orchestrator wires the components together:
//!
//! ```text
//!  Reader  ──► relay ──┐
//!                      ├──► messages (cap 1) ──► N workers ──► handler ──► ack
//!  Stealer ──► relay ──┘
//! ```
//!
//! `messages` closes once both relays have dropped their sender, i.e. after
//! both sources are exhausted, so nothing is ever sent on a closed channel
//! and every message produced before shutdown reaches a worker.

use crate::config::OrchestratorConfig;
use crate::consumer::ConsumerIdentity;
use crate::error::{HandleError, StreamError, StreamResult};
use crate::handler::MessageHandler;
use crate::initializer::Initializer;
use crate::message::Message;
use crate::metrics::{MetricsSink, NoopMetrics};
use crate::reader::Reader;
use crate::reaper::Reaper;
use crate::stealer::Stealer;
use crate::store::StreamStore;
use futures::FutureExt;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::{mpsc, Mutex};
use tokio::task::{JoinHandle, JoinSet};
use tracing::{debug, error, info, info_span, warn, Instrument};

/// Lifecycle of an [`Orchestrator`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LifecycleState {
    Created,
    Initialized,
    Running,
    ShuttingDown,
    Stopped,
}

impl LifecycleState {
    pub fn as_str(&self) -> &'static str {
        match self {
            LifecycleState::Created => "created",
            LifecycleState::Initialized => "initialized",
            LifecycleState::Running => "running",
            LifecycleState::ShuttingDown => "shutting down",
            LifecycleState::Stopped => "stopped",
        }
    }
}

/// Runs a consumer: bootstrap, read/steal loops and the worker pool.
///
/// `initialize` → `run` → `shutdown`, each exactly once and in that order.
/// Dropping a running orchestrator stops the read and steal loops; the
/// workers are detached, finish their in-flight messages, drain whatever is
/// left and exit on their own.
pub struct Orchestrator {
    store: Arc<dyn StreamStore>,
    identity: Arc<ConsumerIdentity>,
    config: OrchestratorConfig,
    handler: Arc<dyn MessageHandler>,
    metrics: Arc<dyn MetricsSink>,
    state: LifecycleState,
    reader: Option<Reader>,
    stealer: Option<Stealer>,
    relays: Vec<JoinHandle<()>>,
    workers: JoinSet<()>,
}

impl Orchestrator {
    /// Validate the config and pick a fresh consumer name.
    pub fn new(
        store: Arc<dyn StreamStore>,
        config: OrchestratorConfig,
        handler: Arc<dyn MessageHandler>,
    ) -> StreamResult<Self> {
        config.validate()?;
        let identity = Arc::new(ConsumerIdentity::generate(
            config.stream_key.clone(),
            config.group_name.clone(),
        ));

        Ok(Self {
            store,
            identity,
            config,
            handler,
            metrics: Arc::new(NoopMetrics),
            state: LifecycleState::Created,
            reader: None,
            stealer: None,
            relays: Vec::new(),
            workers: JoinSet::new(),
        })
    }

    /// Report engine events to `metrics`.
    pub fn with_metrics(mut self, metrics: Arc<dyn MetricsSink>) -> Self {
        self.metrics = metrics;
        self
    }

    /// Use an explicit consumer name instead of a generated one.
    pub fn with_consumer_name(mut self, name: impl Into<String>) -> Self {
        self.identity = Arc::new(ConsumerIdentity::new(
            self.config.stream_key.clone(),
            self.config.group_name.clone(),
            name,
        ));
        self
    }

    pub fn identity(&self) -> &ConsumerIdentity {
        &self.identity
    }

    pub fn store(&self) -> Arc<dyn StreamStore> {
        self.store.clone()
    }

    pub fn state(&self) -> LifecycleState {
        self.state
    }

    fn expect_state(&self, expected: LifecycleState, operation: &'static str) -> StreamResult<()> {
        if self.state != expected {
            return Err(StreamError::InvalidState {
                operation,
                state: self.state.as_str(),
            });
        }
        Ok(())
    }

    /// Create the group, register this consumer and reap dead consumers.
    pub async fn initialize(&mut self) -> StreamResult<()> {
        self.expect_state(LifecycleState::Created, "initialize")?;

        Initializer::new(self.store.clone(), self.identity.clone())
            .initialize()
            .await?;

        let reaped = Reaper::new(
            self.store.clone(),
            self.identity.clone(),
            self.config.reaper_config(),
            self.metrics.clone(),
        )
        .reap_idle_consumers()
        .await?;
        if !reaped.is_empty() {
            info!(count = reaped.len(), consumers = ?reaped, "Reaped idle consumers");
        }

        self.state = LifecycleState::Initialized;
        Ok(())
    }

    /// Start the stealer, the reader, the relays and the worker pool.
    ///
    /// Returns immediately; the work happens on spawned tasks.
    pub fn run(&mut self) -> StreamResult<()> {
        self.expect_state(LifecycleState::Initialized, "run")?;

        let mut stealer = Stealer::new(
            self.store.clone(),
            self.identity.clone(),
            self.config.stealer_config(),
            self.metrics.clone(),
        );
        let mut reader = Reader::new(
            self.store.clone(),
            self.identity.clone(),
            self.config.reader_config(),
        );
        let stolen = stealer.run();
        let fresh = reader.run();

        let (tx, rx) = mpsc::channel(1);
        self.relays.push(tokio::spawn(relay(stolen, tx.clone())));
        self.relays.push(tokio::spawn(relay(fresh, tx)));

        let messages = Arc::new(Mutex::new(rx));
        for id in 0..self.config.handle_concurrency {
            let worker = Worker {
                messages: messages.clone(),
                handler: self.handler.clone(),
                metrics: self.metrics.clone(),
                handle_timeout: self.config.handle_timeout,
            };
            let span = info_span!(
                "worker",
                worker = id,
                stream = %self.identity.stream(),
                group = %self.identity.group(),
                handler = self.handler.name(),
            );
            self.workers.spawn(worker.run().instrument(span));
        }

        self.stealer = Some(stealer);
        self.reader = Some(reader);
        self.state = LifecycleState::Running;

        info!(
            stream = %self.identity.stream(),
            group = %self.identity.group(),
            consumer = %self.identity.name(),
            concurrency = self.config.handle_concurrency,
            "Orchestrator running"
        );
        Ok(())
    }

    /// Stop the loops, drain in-flight messages and wait for every task.
    pub async fn shutdown(&mut self) -> StreamResult<()> {
        self.expect_state(LifecycleState::Running, "shut down")?;
        self.state = LifecycleState::ShuttingDown;
        info!(consumer = %self.identity.name(), "Orchestrator shutting down");

        if let Some(mut stealer) = self.stealer.take() {
            stealer.shutdown().await;
        }
        if let Some(mut reader) = self.reader.take() {
            reader.shutdown().await;
        }

        for relay in self.relays.drain(..) {
            if let Err(e) = relay.await {
                error!(error = %e, "Relay task failed");
            }
        }
        while let Some(result) = self.workers.join_next().await {
            if let Err(e) = result {
                error!(error = %e, "Worker task failed");
            }
        }

        self.state = LifecycleState::Stopped;
        info!(consumer = %self.identity.name(), "Orchestrator stopped");
        Ok(())
    }
}

impl Drop for Orchestrator {
    fn drop(&mut self) {
        // A dropped JoinSet aborts its tasks mid-handler
        self.workers.detach_all();
    }
}

/// Forward one source into the shared channel; drops its sender when done.
async fn relay(mut source: mpsc::Receiver<Message>, sink: mpsc::Sender<Message>) {
    while let Some(message) = source.recv().await {
        if sink.send(message).await.is_err() {
            break;
        }
    }
}

struct Worker {
    messages: Arc<Mutex<mpsc::Receiver<Message>>>,
    handler: Arc<dyn MessageHandler>,
    metrics: Arc<dyn MetricsSink>,
    handle_timeout: Duration,
}

impl Worker {
    async fn run(self) {
        loop {
            // Lock held only for the receive
            let next = self.messages.lock().await.recv().await;
            let Some(message) = next else {
                break;
            };
            self.process(message).await;
        }
        debug!("Worker stopped");
    }

    async fn process(&self, message: Message) {
        self.metrics.message_received();
        let start = Instant::now();

        let handled = AssertUnwindSafe(self.handler.handle(&message)).catch_unwind();
        let outcome = match tokio::time::timeout(self.handle_timeout, handled).await {
            Ok(Ok(result)) => result,
            Ok(Err(_)) => Err(HandleError::transient("handler panicked")),
            Err(_) => Err(HandleError::timeout(self.handle_timeout)),
        };

        match outcome {
            Ok(()) => {
                self.metrics.message_handled(start.elapsed());
                self.ack(&message).await;
            }
            Err(e) if e.category().is_droppable() => {
                warn!(
                    entry_id = %message.entry_id(),
                    category = e.category().as_str(),
                    error = %e,
                    "Dropping unprocessable message"
                );
                self.metrics.message_dropped(e.category().as_str());
                self.ack(&message).await;
            }
            Err(e) => {
                error!(
                    entry_id = %message.entry_id(),
                    category = e.category().as_str(),
                    error = %e,
                    stolen = message.is_stolen(),
                    "Message handling failed, leaving it pending"
                );
                self.metrics.message_failed(e.category().as_str());
            }
        }
    }

    async fn ack(&self, message: &Message) {
        match message.ack().await {
            Ok(true) => {}
            Ok(false) => debug!(entry_id = %message.entry_id(), "Entry was already acknowledged"),
            Err(e) => {
                self.metrics.ack_failed();
                error!(
                    entry_id = %message.entry_id(),
                    error = %e,
                    "Failed to acknowledge message"
                );
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::metrics::testing::CountingMetrics;
    use crate::store::{MemoryStore, MockStreamStore};
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicUsize, Ordering};

    const STREAM: &str = "img:req";
    const GROUP: &str = "workers";

    struct Recording {
        calls: AtomicUsize,
        result: fn() -> Result<(), HandleError>,
    }

    #[async_trait]
    impl MessageHandler for Recording {
        async fn handle(&self, _message: &Message) -> Result<(), HandleError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            (self.result)()
        }

        fn name(&self) -> &'static str {
            "Recording"
        }
    }

    fn handler(result: fn() -> Result<(), HandleError>) -> Arc<Recording> {
        Arc::new(Recording {
            calls: AtomicUsize::new(0),
            result,
        })
    }

    fn config() -> OrchestratorConfig {
        OrchestratorConfig::new(STREAM, GROUP)
            .with_handle_concurrency(2)
            .with_handle_timeout(Duration::from_secs(1))
            .with_read_block_timeout(Duration::from_millis(100))
            .with_steal_interval(Duration::from_secs(1))
            .with_steal_min_idle_time(Duration::from_secs(5))
    }

    #[test]
    fn test_new_rejects_invalid_config() {
        let result = Orchestrator::new(
            Arc::new(MemoryStore::new()),
            config().with_handle_concurrency(0),
            handler(|| Ok(())),
        );
        assert!(matches!(result, Err(StreamError::Config(_))));
    }

    #[tokio::test]
    async fn test_wrong_state_transitions() {
        let mut orchestrator =
            Orchestrator::new(Arc::new(MemoryStore::new()), config(), handler(|| Ok(()))).unwrap();

        let err = orchestrator.run().unwrap_err();
        assert!(matches!(
            err,
            StreamError::InvalidState { operation: "run", state: "created" }
        ));
        assert!(orchestrator.shutdown().await.is_err());

        orchestrator.initialize().await.unwrap();
        assert!(orchestrator.initialize().await.is_err());
        assert_eq!(orchestrator.state(), LifecycleState::Initialized);
    }

    #[tokio::test]
    async fn test_initialize_failure_keeps_created_state() {
        let mut store = MockStreamStore::new();
        store
            .expect_group_create()
            .returning(|_, _, _, _| Err(StreamError::Protocol("WRONGTYPE".to_string())));

        let mut orchestrator =
            Orchestrator::new(Arc::new(store), config(), handler(|| Ok(()))).unwrap();
        assert!(orchestrator.initialize().await.is_err());
        assert_eq!(orchestrator.state(), LifecycleState::Created);
    }

    #[tokio::test(start_paused = true)]
    async fn test_initialize_reaps_dead_consumers() {
        let store = Arc::new(MemoryStore::new());
        store.group_create(STREAM, GROUP, "0", true).await.unwrap();
        store
            .group_create_consumer(STREAM, GROUP, "workers-consumer-old")
            .await
            .unwrap();
        tokio::time::advance(Duration::from_secs(10)).await;

        let metrics = Arc::new(CountingMetrics::default());
        let mut orchestrator = Orchestrator::new(
            store.clone(),
            config().with_reap_idle_threshold(Duration::from_secs(5)),
            handler(|| Ok(())),
        )
        .unwrap()
        .with_consumer_name("workers-consumer-new")
        .with_metrics(metrics.clone());
        orchestrator.initialize().await.unwrap();

        let names: Vec<String> = store
            .consumers_info(STREAM, GROUP)
            .await
            .unwrap()
            .into_iter()
            .map(|c| c.name)
            .collect();
        assert_eq!(names, vec!["workers-consumer-new".to_string()]);
        assert_eq!(CountingMetrics::get(&metrics.reaped), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_success_acks_message() {
        let store = Arc::new(MemoryStore::new());
        let recording = handler(|| Ok(()));
        let metrics = Arc::new(CountingMetrics::default());
        let mut orchestrator = Orchestrator::new(store.clone(), config(), recording.clone())
            .unwrap()
            .with_metrics(metrics.clone());
        orchestrator.initialize().await.unwrap();
        orchestrator.run().unwrap();

        store.append(STREAM, None, "msg", b"{}").await.unwrap();
        while CountingMetrics::get(&metrics.handled) == 0 {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }

        orchestrator.shutdown().await.unwrap();
        assert_eq!(orchestrator.state(), LifecycleState::Stopped);
        assert_eq!(recording.calls.load(Ordering::SeqCst), 1);
        assert_eq!(store.pending_count(STREAM, GROUP), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_droppable_error_acks_and_transient_does_not() {
        fn invalid() -> Result<(), HandleError> {
            Err(HandleError::invalid_payload("bad json"))
        }
        fn not_found() -> Result<(), HandleError> {
            Err(HandleError::not_found("gone"))
        }
        fn transient() -> Result<(), HandleError> {
            Err(HandleError::transient("db down"))
        }

        let cases: [(fn() -> Result<(), HandleError>, usize); 3] =
            [(invalid, 0), (not_found, 0), (transient, 1)];
        for (result, expected_pending) in cases {
            let store = Arc::new(MemoryStore::new());
            let recording = handler(result);
            let mut orchestrator =
                Orchestrator::new(store.clone(), config(), recording.clone()).unwrap();
            orchestrator.initialize().await.unwrap();
            orchestrator.run().unwrap();

            store.append(STREAM, None, "msg", b"{}").await.unwrap();
            while recording.calls.load(Ordering::SeqCst) == 0 {
                tokio::time::sleep(Duration::from_millis(10)).await;
            }

            orchestrator.shutdown().await.unwrap();
            assert_eq!(store.pending_count(STREAM, GROUP), expected_pending);
        }
    }

    struct Slow;

    #[async_trait]
    impl MessageHandler for Slow {
        async fn handle(&self, _message: &Message) -> Result<(), HandleError> {
            tokio::time::sleep(Duration::from_secs(60)).await;
            Ok(())
        }

        fn name(&self) -> &'static str {
            "Slow"
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_handler_timeout_leaves_entry_pending() {
        let store = Arc::new(MemoryStore::new());
        let metrics = Arc::new(CountingMetrics::default());
        let mut orchestrator = Orchestrator::new(
            store.clone(),
            config().with_steal_min_idle_time(Duration::from_secs(3600)),
            Arc::new(Slow),
        )
        .unwrap()
        .with_metrics(metrics.clone());
        orchestrator.initialize().await.unwrap();
        orchestrator.run().unwrap();

        store.append(STREAM, None, "msg", b"{}").await.unwrap();
        while CountingMetrics::get(&metrics.failed) == 0 {
            tokio::time::sleep(Duration::from_millis(100)).await;
        }

        orchestrator.shutdown().await.unwrap();
        assert_eq!(store.pending_count(STREAM, GROUP), 1);
        assert_eq!(CountingMetrics::get(&metrics.handled), 0);
    }

    /// Delegates to a `MemoryStore`; the first ack fails, the second reports
    /// the entry as already acknowledged without touching the store.
    struct FlakyAckStore {
        inner: MemoryStore,
        acks: AtomicUsize,
    }

    #[async_trait]
    impl StreamStore for FlakyAckStore {
        async fn group_create(
            &self,
            stream: &str,
            group: &str,
            start_id: &str,
            mkstream: bool,
        ) -> StreamResult<()> {
            self.inner.group_create(stream, group, start_id, mkstream).await
        }

        async fn group_create_consumer(
            &self,
            stream: &str,
            group: &str,
            consumer: &str,
        ) -> StreamResult<bool> {
            self.inner.group_create_consumer(stream, group, consumer).await
        }

        async fn group_delete_consumer(
            &self,
            stream: &str,
            group: &str,
            consumer: &str,
        ) -> StreamResult<u64> {
            self.inner.group_delete_consumer(stream, group, consumer).await
        }

        async fn group_read(
            &self,
            stream: &str,
            group: &str,
            consumer: &str,
            count: usize,
            block: Duration,
        ) -> StreamResult<Vec<crate::store::StreamEntry>> {
            self.inner.group_read(stream, group, consumer, count, block).await
        }

        async fn ack(&self, stream: &str, group: &str, entry_id: &str) -> StreamResult<bool> {
            match self.acks.fetch_add(1, Ordering::SeqCst) {
                0 => Err(StreamError::Protocol("connection reset".to_string())),
                1 => Ok(false),
                _ => self.inner.ack(stream, group, entry_id).await,
            }
        }

        async fn auto_claim(
            &self,
            stream: &str,
            group: &str,
            consumer: &str,
            min_idle: Duration,
            start_id: &str,
            count: usize,
        ) -> StreamResult<crate::store::AutoClaimed> {
            self.inner
                .auto_claim(stream, group, consumer, min_idle, start_id, count)
                .await
        }

        async fn pending_entry(
            &self,
            stream: &str,
            group: &str,
            entry_id: &str,
        ) -> StreamResult<Option<crate::store::PendingEntry>> {
            self.inner.pending_entry(stream, group, entry_id).await
        }

        async fn consumers_info(
            &self,
            stream: &str,
            group: &str,
        ) -> StreamResult<Vec<crate::store::ConsumerInfo>> {
            self.inner.consumers_info(stream, group).await
        }

        async fn append(
            &self,
            stream: &str,
            max_len: Option<usize>,
            field: &str,
            value: &[u8],
        ) -> StreamResult<String> {
            self.inner.append(stream, max_len, field, value).await
        }

        async fn ping(&self) -> StreamResult<()> {
            self.inner.ping().await
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_ack_failures_do_not_stop_the_worker() {
        let store = Arc::new(FlakyAckStore {
            inner: MemoryStore::new(),
            acks: AtomicUsize::new(0),
        });
        let recording = handler(|| Ok(()));
        let metrics = Arc::new(CountingMetrics::default());
        let mut orchestrator = Orchestrator::new(
            store.clone(),
            config()
                .with_handle_concurrency(1)
                .with_steal_min_idle_time(Duration::from_secs(3600)),
            recording.clone(),
        )
        .unwrap()
        .with_metrics(metrics.clone());
        orchestrator.initialize().await.unwrap();
        orchestrator.run().unwrap();

        for payload in [b"1", b"2", b"3"] {
            store.append(STREAM, None, "msg", payload).await.unwrap();
        }
        while CountingMetrics::get(&metrics.handled) < 3 {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }

        orchestrator.shutdown().await.unwrap();
        assert_eq!(recording.calls.load(Ordering::SeqCst), 3);
        assert_eq!(CountingMetrics::get(&metrics.ack_failed), 1);
        // The failed and the no-op ack both leave their entry for a later steal
        assert_eq!(store.inner.pending_count(STREAM, GROUP), 2);
    }

    struct Sleepy {
        finished: AtomicUsize,
    }

    #[async_trait]
    impl MessageHandler for Sleepy {
        async fn handle(&self, _message: &Message) -> Result<(), HandleError> {
            tokio::time::sleep(Duration::from_secs(1)).await;
            self.finished.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }

        fn name(&self) -> &'static str {
            "Sleepy"
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_dropped_orchestrator_finishes_in_flight_handler() {
        let store = Arc::new(MemoryStore::new());
        let sleepy = Arc::new(Sleepy {
            finished: AtomicUsize::new(0),
        });
        let metrics = Arc::new(CountingMetrics::default());
        let mut orchestrator = Orchestrator::new(store.clone(), config(), sleepy.clone())
            .unwrap()
            .with_metrics(metrics.clone());
        orchestrator.initialize().await.unwrap();
        orchestrator.run().unwrap();

        store.append(STREAM, None, "msg", b"{}").await.unwrap();
        while CountingMetrics::get(&metrics.received) == 0 {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        drop(orchestrator);

        tokio::time::sleep(Duration::from_secs(5)).await;
        assert_eq!(sleepy.finished.load(Ordering::SeqCst), 1);
        assert_eq!(store.pending_count(STREAM, GROUP), 0);
    }

    struct Panicking;

    #[async_trait]
    impl MessageHandler for Panicking {
        async fn handle(&self, _message: &Message) -> Result<(), HandleError> {
            panic!("boom");
        }

        fn name(&self) -> &'static str {
            "Panicking"
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_handler_panic_is_a_transient_failure() {
        let store = Arc::new(MemoryStore::new());
        let metrics = Arc::new(CountingMetrics::default());
        let mut orchestrator = Orchestrator::new(
            store.clone(),
            config().with_handle_concurrency(1),
            Arc::new(Panicking),
        )
        .unwrap()
        .with_metrics(metrics.clone());
        orchestrator.initialize().await.unwrap();
        orchestrator.run().unwrap();

        store.append(STREAM, None, "msg", b"1").await.unwrap();
        store.append(STREAM, None, "msg", b"2").await.unwrap();
        while CountingMetrics::get(&metrics.failed) < 2 {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }

        orchestrator.shutdown().await.unwrap();
        assert_eq!(store.pending_count(STREAM, GROUP), 2);
    }
}
