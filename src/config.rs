//! Configuration for stores and iterators.
//!
//! [`HistoryConfig`] is a plain struct with defaults. [`HistoryConfig::load`] layers an optional
//! TOML file and `MONSOON_*` environment variables on top of those defaults.

use crate::error::{HistoryError, Result};
use crate::telemetry::{noop_event_listener, HistoryEventListener};

use config::{Config, Environment, File};
use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

/// Compression applied to each record of a metric temp file.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TmpFileCompression {
    #[default]
    None,
    Lz4,
}

/// Settings for [`crate::BufferedIterator`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BufferConfig {
    /// Maximum number of queued items. Must be at least 1.
    pub capacity: usize,
    /// Soft deadline after which a fill task yields its pool thread and reschedules itself.
    pub fill_deadline: Duration,
    /// Size of the shared fill pool. `None` uses rayon's default.
    pub fill_threads: Option<usize>,
}

impl Default for BufferConfig {
    fn default() -> Self {
        BufferConfig {
            capacity: 16,
            fill_deadline: Duration::from_millis(50),
            fill_threads: None,
        }
    }
}

/// Settings for [`crate::WindowedIterator`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WindowConfig {
    pub look_back: Duration,
    pub look_forward: Duration,
}

impl Default for WindowConfig {
    fn default() -> Self {
        WindowConfig {
            look_back: Duration::from_secs(60),
            look_forward: Duration::from_secs(60),
        }
    }
}

#[derive(Debug, Clone)]
pub struct HistoryConfig {
    /// Directory for metric temp files. `None` uses the system temp dir.
    pub tmp_dir: Option<PathBuf>,
    pub compression: TmpFileCompression,
    /// Fan groups and metrics of a single `with()` call out over rayon.
    pub parallel_ingest: bool,
    pub buffer: BufferConfig,
    pub window: WindowConfig,
    /// Structured event hook for observability (no-op by default).
    pub event_listener: Arc<dyn HistoryEventListener>,
}

impl Default for HistoryConfig {
    fn default() -> Self {
        HistoryConfig {
            tmp_dir: None,
            compression: TmpFileCompression::None,
            parallel_ingest: true,
            buffer: BufferConfig::default(),
            window: WindowConfig::default(),
            event_listener: noop_event_listener(),
        }
    }
}

#[derive(Debug, Default, Deserialize)]
struct BufferFileConfig {
    capacity: Option<usize>,
    fill_deadline_ms: Option<u64>,
    fill_threads: Option<usize>,
}

#[derive(Debug, Default, Deserialize)]
struct WindowFileConfig {
    look_back_ms: Option<u64>,
    look_forward_ms: Option<u64>,
}

/// File/env view of the config. Every field optional for layering.
#[derive(Debug, Default, Deserialize)]
struct HistoryFileConfig {
    tmp_dir: Option<String>,
    compression: Option<TmpFileCompression>,
    parallel_ingest: Option<bool>,
    buffer: Option<BufferFileConfig>,
    window: Option<WindowFileConfig>,
}

impl HistoryConfig {
    /// Loads defaults, then `path` (TOML, if given), then `MONSOON_*` environment variables.
    ///
    /// Nested keys use `__`, e.g. `MONSOON_BUFFER__CAPACITY=64`.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let mut builder = Config::builder();
        if let Some(path) = path {
            if !path.exists() {
                return Err(HistoryError::Config(format!(
                    "config file not found: {}",
                    path.display()
                )));
            }
            builder = builder.add_source(File::from(path));
        }
        builder = builder.add_source(
            Environment::with_prefix("MONSOON")
                .prefix_separator("_")
                .separator("__")
                .try_parsing(true)
                .ignore_empty(true),
        );

        let partial: HistoryFileConfig = builder.build()?.try_deserialize()?;
        let mut cfg = HistoryConfig::default();
        cfg.merge(partial)?;
        Ok(cfg)
    }

    /// Overwrites only the fields that are `Some`.
    fn merge(&mut self, partial: HistoryFileConfig) -> Result<()> {
        if let Some(dir) = partial.tmp_dir {
            self.tmp_dir = Some(PathBuf::from(dir));
        }
        if let Some(c) = partial.compression {
            self.compression = c;
        }
        if let Some(b) = partial.parallel_ingest {
            self.parallel_ingest = b;
        }
        if let Some(buffer) = partial.buffer {
            if let Some(n) = buffer.capacity {
                if n == 0 {
                    return Err(HistoryError::Config(
                        "buffer.capacity must be at least 1".to_string(),
                    ));
                }
                self.buffer.capacity = n;
            }
            if let Some(ms) = buffer.fill_deadline_ms {
                self.buffer.fill_deadline = Duration::from_millis(ms);
            }
            if let Some(n) = buffer.fill_threads {
                self.buffer.fill_threads = Some(n);
            }
        }
        if let Some(window) = partial.window {
            if let Some(ms) = window.look_back_ms {
                self.window.look_back = Duration::from_millis(ms);
            }
            if let Some(ms) = window.look_forward_ms {
                self.window.look_forward = Duration::from_millis(ms);
            }
        }
        Ok(())
    }

    pub fn with_event_listener(mut self, listener: Arc<dyn HistoryEventListener>) -> Self {
        self.event_listener = listener;
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn defaults_match_documented_values() {
        let cfg = HistoryConfig::default();
        assert_eq!(cfg.buffer.capacity, 16);
        assert_eq!(cfg.buffer.fill_deadline, Duration::from_millis(50));
        assert_eq!(cfg.window.look_back, Duration::from_secs(60));
        assert_eq!(cfg.compression, TmpFileCompression::None);
        assert!(cfg.parallel_ingest);
    }

    #[test]
    fn toml_file_overrides_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("monsoon.toml");
        let mut f = std::fs::File::create(&path).unwrap();
        writeln!(
            f,
            r#"
compression = "lz4"
parallel_ingest = false

[buffer]
capacity = 4
fill_deadline_ms = 10

[window]
look_back_ms = 5000
"#
        )
        .unwrap();
        drop(f);

        let cfg = HistoryConfig::load(Some(&path)).unwrap();
        assert_eq!(cfg.compression, TmpFileCompression::Lz4);
        assert!(!cfg.parallel_ingest);
        assert_eq!(cfg.buffer.capacity, 4);
        assert_eq!(cfg.buffer.fill_deadline, Duration::from_millis(10));
        assert_eq!(cfg.window.look_back, Duration::from_secs(5));
        assert_eq!(cfg.window.look_forward, Duration::from_secs(60));
    }

    #[test]
    fn zero_capacity_is_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("bad.toml");
        std::fs::write(&path, "[buffer]\ncapacity = 0\n").unwrap();
        let err = HistoryConfig::load(Some(&path)).unwrap_err();
        assert!(matches!(err, HistoryError::Config(_)));
    }

    #[test]
    fn missing_file_is_an_error() {
        let err = HistoryConfig::load(Some(Path::new("/nonexistent/monsoon.toml"))).unwrap_err();
        assert!(matches!(err, HistoryError::Config(_)));
    }
}
