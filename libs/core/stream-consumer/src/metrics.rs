//! Consumer metrics
//!
//! The engine reports through an injected [`MetricsSink`]. [`NoopMetrics`] is
//! the default; [`PrometheusMetrics`] forwards to the `metrics` facade, which
//! [`init_metrics`] backs with a Prometheus recorder.

use metrics::{counter, histogram};
use metrics_exporter_prometheus::{BuildError, PrometheusBuilder, PrometheusHandle};
use once_cell::sync::OnceCell;
use std::time::Duration;
use tracing::info;

static PROMETHEUS_HANDLE: OnceCell<PrometheusHandle> = OnceCell::new();

/// Install the Prometheus recorder.
///
/// Call this once at startup. Subsequent calls return the existing handle.
pub fn init_metrics() -> Result<&'static PrometheusHandle, BuildError> {
    PROMETHEUS_HANDLE.get_or_try_init(|| {
        let handle = PrometheusBuilder::new().install_recorder()?;
        info!("Prometheus metrics initialized");
        Ok(handle)
    })
}

/// Get the Prometheus handle, if installed.
pub fn prometheus_handle() -> Option<&'static PrometheusHandle> {
    PROMETHEUS_HANDLE.get()
}

/// Render metrics in Prometheus text format (empty when not installed).
pub fn render_metrics() -> String {
    prometheus_handle()
        .map(|h| h.render())
        .unwrap_or_default()
}

/// Receiver of engine events.
pub trait MetricsSink: Send + Sync {
    /// A message was handed to a worker.
    fn message_received(&self) {}

    /// The handler succeeded and the entry was acknowledged.
    fn message_handled(&self, _duration: Duration) {}

    /// The handler failed with a retryable error (entry left pending).
    fn message_failed(&self, _category: &str) {}

    /// The handler failed with a droppable error (entry acknowledged).
    fn message_dropped(&self, _category: &str) {}

    /// The stealer dropped an entry over the delivery limit.
    fn poison_dropped(&self) {}

    /// The stealer reclaimed an idle entry.
    fn message_stolen(&self) {}

    /// An acknowledgment failed.
    fn ack_failed(&self) {}

    /// The reaper removed an idle consumer.
    fn consumer_reaped(&self) {}
}

/// Discards every event.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoopMetrics;

impl MetricsSink for NoopMetrics {}

/// Emits `stream_consumer_*` series labelled by stream and group.
#[derive(Debug, Clone)]
pub struct PrometheusMetrics {
    stream: String,
    group: String,
}

impl PrometheusMetrics {
    pub fn new(stream: impl Into<String>, group: impl Into<String>) -> Self {
        Self {
            stream: stream.into(),
            group: group.into(),
        }
    }

    fn count(&self, name: &'static str) {
        counter!(name, "stream" => self.stream.clone(), "group" => self.group.clone())
            .increment(1);
    }
}

impl MetricsSink for PrometheusMetrics {
    fn message_received(&self) {
        self.count("stream_consumer_messages_received_total");
    }

    fn message_handled(&self, duration: Duration) {
        counter!(
            "stream_consumer_messages_processed_total",
            "stream" => self.stream.clone(),
            "group" => self.group.clone(),
            "status" => "success"
        )
        .increment(1);

        histogram!(
            "stream_consumer_handle_duration_seconds",
            "stream" => self.stream.clone(),
            "group" => self.group.clone()
        )
        .record(duration.as_secs_f64());
    }

    fn message_failed(&self, category: &str) {
        counter!(
            "stream_consumer_messages_processed_total",
            "stream" => self.stream.clone(),
            "group" => self.group.clone(),
            "status" => "failed"
        )
        .increment(1);

        counter!(
            "stream_consumer_handle_errors_total",
            "stream" => self.stream.clone(),
            "group" => self.group.clone(),
            "category" => category.to_string()
        )
        .increment(1);
    }

    fn message_dropped(&self, category: &str) {
        counter!(
            "stream_consumer_messages_processed_total",
            "stream" => self.stream.clone(),
            "group" => self.group.clone(),
            "status" => "dropped"
        )
        .increment(1);

        counter!(
            "stream_consumer_handle_errors_total",
            "stream" => self.stream.clone(),
            "group" => self.group.clone(),
            "category" => category.to_string()
        )
        .increment(1);
    }

    fn poison_dropped(&self) {
        self.count("stream_consumer_poison_dropped_total");
    }

    fn message_stolen(&self) {
        self.count("stream_consumer_messages_stolen_total");
    }

    fn ack_failed(&self) {
        self.count("stream_consumer_ack_failures_total");
    }

    fn consumer_reaped(&self) {
        self.count("stream_consumer_consumers_reaped_total");
    }
}

#[cfg(test)]
pub(crate) mod testing {
    use super::MetricsSink;
    use std::sync::atomic::{AtomicU64, Ordering};
    use std::time::Duration;

    /// Counts events so tests can assert on them.
    #[derive(Debug, Default)]
    pub struct CountingMetrics {
        pub received: AtomicU64,
        pub handled: AtomicU64,
        pub failed: AtomicU64,
        pub dropped: AtomicU64,
        pub poison: AtomicU64,
        pub stolen: AtomicU64,
        pub ack_failed: AtomicU64,
        pub reaped: AtomicU64,
    }

    impl CountingMetrics {
        pub fn get(counter: &AtomicU64) -> u64 {
            counter.load(Ordering::SeqCst)
        }
    }

    impl MetricsSink for CountingMetrics {
        fn message_received(&self) {
            self.received.fetch_add(1, Ordering::SeqCst);
        }
        fn message_handled(&self, _duration: Duration) {
            self.handled.fetch_add(1, Ordering::SeqCst);
        }
        fn message_failed(&self, _category: &str) {
            self.failed.fetch_add(1, Ordering::SeqCst);
        }
        fn message_dropped(&self, _category: &str) {
            self.dropped.fetch_add(1, Ordering::SeqCst);
        }
        fn poison_dropped(&self) {
            self.poison.fetch_add(1, Ordering::SeqCst);
        }
        fn message_stolen(&self) {
            self.stolen.fetch_add(1, Ordering::SeqCst);
        }
        fn ack_failed(&self) {
            self.ack_failed.fetch_add(1, Ordering::SeqCst);
        }
        fn consumer_reaped(&self) {
            self.reaped.fetch_add(1, Ordering::SeqCst);
        }
    }
}
