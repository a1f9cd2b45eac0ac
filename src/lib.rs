#![doc = include_str!("../README.md")]
// Declare modules
pub mod buffer;
pub mod config;
pub mod dictionary;
pub mod encoding;
pub mod error;
pub mod segments;
pub mod storage;
pub mod telemetry;
pub mod tmpfile;
pub mod types;
pub mod window;

/// Read-ahead iterator over a fallible source.
pub use crate::buffer::BufferedIterator;
/// Store, iterator and temp-file settings.
pub use crate::config::{BufferConfig, HistoryConfig, TmpFileCompression, WindowConfig};
/// Incremental string dictionary.
pub use crate::dictionary::{Dictionary, DictionaryDelta, DictionaryWriter};
/// Error type for history operations.
pub use crate::error::{HistoryError, Result};
/// Run-length encoded per-metric storage.
pub use crate::segments::{MetricSegment, MetricWriter};
/// Column-major history store.
pub use crate::storage::{ColumnMajorStore, ColumnMajorStoreBuilder, MetricValues};
/// Structured event hook for observability.
pub use crate::telemetry::{HistoryEvent, HistoryEventListener, TracingEventListener};
/// Data model shared by every component.
pub use crate::types::{
    GroupMetrics, GroupName, Histogram, HistogramBucket, MetricName, MetricValue, SimpleGroupPath,
    Tags, TimeSeriesCollection, Timestamp,
};
/// Sliding-window iteration with interpolation.
pub use crate::window::{InterpolatedCollection, WindowedCollection, WindowedIterator};
