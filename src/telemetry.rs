use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

/// Structured, in-process event hook for observability.
///
/// This crate is a library and does not print. Callers provide an implementation that
/// forwards these events to `tracing`, metrics, or custom sinks. [`TracingEventListener`]
/// is the stock forwarder.
pub trait HistoryEventListener: std::fmt::Debug + Send + Sync + 'static {
    fn on_event(&self, event: HistoryEvent);
}

/// Structured events emitted by the history core.
#[derive(Debug, Clone)]
pub enum HistoryEvent {
    TmpFileCreated { path: PathBuf },
    TmpFileReleased { path: PathBuf },
    TmpFileReleaseFailed { path: PathBuf, error: String },

    StoreBuilt {
        timestamps: usize,
        groups: usize,
        metrics: usize,
        duration: Duration,
    },
    StoreBuildFailed { error: String },

    ProducerFailed { error: String },
    FillRescheduled { queued: usize },
}

#[derive(Debug)]
pub struct NoopEventListener;

impl HistoryEventListener for NoopEventListener {
    #[inline]
    fn on_event(&self, _event: HistoryEvent) {}
}

pub fn noop_event_listener() -> Arc<dyn HistoryEventListener> {
    Arc::new(NoopEventListener)
}

/// Forwards events to `tracing`. Failures are logged at `warn`, everything else at `debug`.
#[derive(Debug, Default)]
pub struct TracingEventListener;

impl HistoryEventListener for TracingEventListener {
    fn on_event(&self, event: HistoryEvent) {
        match event {
            HistoryEvent::TmpFileCreated { path } => {
                tracing::debug!(path = %path.display(), "Created metric temp file");
            }
            HistoryEvent::TmpFileReleased { path } => {
                tracing::debug!(path = %path.display(), "Released metric temp file");
            }
            HistoryEvent::TmpFileReleaseFailed { path, error } => {
                tracing::warn!(path = %path.display(), error = %error, "Failed to remove metric temp file");
            }
            HistoryEvent::StoreBuilt {
                timestamps,
                groups,
                metrics,
                duration,
            } => {
                tracing::debug!(
                    timestamps,
                    groups,
                    metrics,
                    elapsed_ms = duration.as_millis() as u64,
                    "Built column-major store"
                );
            }
            HistoryEvent::StoreBuildFailed { error } => {
                tracing::warn!(error = %error, "Column-major store build failed");
            }
            HistoryEvent::ProducerFailed { error } => {
                tracing::warn!(error = %error, "Buffered iterator source failed");
            }
            HistoryEvent::FillRescheduled { queued } => {
                tracing::debug!(queued, "Buffered fill yielded, rescheduling");
            }
        }
    }
}

pub fn tracing_event_listener() -> Arc<dyn HistoryEventListener> {
    Arc::new(TracingEventListener)
}

/// Metrics instrumentation through the `metrics` facade.
///
/// Emitting is a no-op until the embedding application installs a recorder.
pub mod history_metrics {
    use super::*;

    use ::metrics::{describe_counter, describe_histogram, Unit};

    // --- metric names ---
    //
    // Counters are exposed as `<name>_total` by the Prometheus exporter.

    pub const INGEST_COLLECTIONS: &str = "monsoon_history_ingest_collections";
    pub const SEGMENT_ENTRIES_WRITTEN: &str = "monsoon_history_segment_entries_written";
    pub const TMPFILE_BYTES_WRITTEN: &str = "monsoon_history_tmpfile_bytes_written";
    pub const STORE_BUILD_DURATION_SECONDS: &str = "monsoon_history_store_build_duration_seconds";
    pub const BUFFERED_ITEMS_FILLED: &str = "monsoon_history_buffered_items_filled";

    #[inline]
    pub fn record_ingest_collection() {
        ::metrics::counter!(INGEST_COLLECTIONS).increment(1);
    }

    #[inline]
    pub fn record_segment_entry(stored_bytes: u64) {
        ::metrics::counter!(SEGMENT_ENTRIES_WRITTEN).increment(1);
        if stored_bytes > 0 {
            ::metrics::counter!(TMPFILE_BYTES_WRITTEN).increment(stored_bytes);
        }
    }

    #[inline]
    pub fn record_store_build(duration: Duration) {
        ::metrics::histogram!(STORE_BUILD_DURATION_SECONDS).record(duration.as_secs_f64());
    }

    #[inline]
    pub fn record_buffered_fill(items: u64) {
        if items > 0 {
            ::metrics::counter!(BUFFERED_ITEMS_FILLED).increment(items);
        }
    }

    /// Registers descriptions for every metric with the installed recorder.
    pub fn describe_all() {
        describe_counter!(
            INGEST_COLLECTIONS,
            Unit::Count,
            "Total number of collections ingested via ColumnMajorStoreBuilder::with."
        );
        describe_counter!(
            SEGMENT_ENTRIES_WRITTEN,
            Unit::Count,
            "Total number of run-length entries flushed by metric writers."
        );
        describe_counter!(
            TMPFILE_BYTES_WRITTEN,
            Unit::Bytes,
            "Total number of bytes appended to metric temp files (after compression)."
        );
        describe_counter!(
            BUFFERED_ITEMS_FILLED,
            Unit::Count,
            "Total number of items moved from a source into a buffered iterator queue."
        );

        describe_histogram!(
            STORE_BUILD_DURATION_SECONDS,
            Unit::Seconds,
            "Time spent padding and sealing writers in ColumnMajorStoreBuilder::build."
        );
    }
}
