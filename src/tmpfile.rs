//! Append-only temp files holding the records of one metric segment.
//!
//! A [`TmpFileWriter`] appends records and keeps an in-memory offset table. Sealing it yields a
//! [`TmpFile`], a cheap cloneable handle. The file is unlinked when the last handle (including
//! the ones held by open [`RecordIter`]s) is dropped.

use crate::config::{HistoryConfig, TmpFileCompression};
use crate::encoding::crc32;
use crate::error::{HistoryError, Result};
use crate::telemetry::{history_metrics, HistoryEvent, HistoryEventListener};

use std::fs::File;
use std::io::{self, BufReader, BufWriter, Read, Write};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tempfile::NamedTempFile;

/// Where and how temp files are created. Shared by every writer of a store.
#[derive(Debug, Clone)]
pub struct TmpFileOptions {
    pub dir: Option<PathBuf>,
    pub compression: TmpFileCompression,
    pub events: Arc<dyn HistoryEventListener>,
}

impl From<&HistoryConfig> for TmpFileOptions {
    fn from(cfg: &HistoryConfig) -> Self {
        TmpFileOptions {
            dir: cfg.tmp_dir.clone(),
            compression: cfg.compression,
            events: Arc::clone(&cfg.event_listener),
        }
    }
}

impl Default for TmpFileOptions {
    fn default() -> Self {
        TmpFileOptions::from(&HistoryConfig::default())
    }
}

#[derive(Debug, Clone, Copy)]
struct RecordMeta {
    stored_len: u32,
    logical_len: u32,
    crc32: u32,
}

#[derive(Debug)]
pub struct TmpFileWriter {
    out: BufWriter<NamedTempFile>,
    path: PathBuf,
    records: Vec<RecordMeta>,
    options: Arc<TmpFileOptions>,
}

impl TmpFileWriter {
    pub fn create(options: Arc<TmpFileOptions>) -> Result<Self> {
        let mut builder = tempfile::Builder::new();
        builder.prefix("monsoon-").suffix(".metric");
        let file = match &options.dir {
            Some(dir) => builder.tempfile_in(dir)?,
            None => builder.tempfile()?,
        };
        let path = file.path().to_path_buf();
        options
            .events
            .on_event(HistoryEvent::TmpFileCreated { path: path.clone() });
        Ok(TmpFileWriter {
            out: BufWriter::new(file),
            path,
            records: Vec::new(),
            options,
        })
    }

    /// Appends one record. The checksum covers the stored (possibly compressed) bytes.
    pub fn append(&mut self, record: &[u8]) -> Result<()> {
        let logical_len = record_len(record.len())?;
        let compressed;
        let stored: &[u8] = match self.options.compression {
            TmpFileCompression::None => record,
            TmpFileCompression::Lz4 => {
                compressed = lz4_flex::block::compress_prepend_size(record);
                &compressed
            }
        };
        self.out.write_all(stored)?;
        self.records.push(RecordMeta {
            stored_len: record_len(stored.len())?,
            logical_len,
            crc32: crc32(stored),
        });
        history_metrics::record_segment_entry(stored.len() as u64);
        Ok(())
    }

    pub fn record_count(&self) -> usize {
        self.records.len()
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Flushes buffered bytes and turns the writer into a read-only shared handle.
    pub fn seal(self) -> Result<TmpFile> {
        let file = self.out.into_inner().map_err(|e| e.into_error())?;
        Ok(TmpFile {
            inner: Arc::new(TmpFileInner {
                file: Some(file),
                path: self.path,
                records: self.records,
                compression: self.options.compression,
                events: Arc::clone(&self.options.events),
            }),
        })
    }
}

fn record_len(n: usize) -> Result<u32> {
    n.try_into().map_err(|_| {
        HistoryError::InvalidArgument(format!("Record of {} bytes exceeds the record size limit", n))
    })
}

#[derive(Debug)]
struct TmpFileInner {
    file: Option<NamedTempFile>,
    path: PathBuf,
    records: Vec<RecordMeta>,
    compression: TmpFileCompression,
    events: Arc<dyn HistoryEventListener>,
}

impl Drop for TmpFileInner {
    fn drop(&mut self) {
        if let Some(file) = self.file.take() {
            let path = self.path.clone();
            match file.close() {
                Ok(()) => self.events.on_event(HistoryEvent::TmpFileReleased { path }),
                Err(e) => self.events.on_event(HistoryEvent::TmpFileReleaseFailed {
                    path,
                    error: e.to_string(),
                }),
            }
        }
    }
}

/// Sealed, shared temp file.
#[derive(Debug, Clone)]
pub struct TmpFile {
    inner: Arc<TmpFileInner>,
}

impl TmpFile {
    pub fn path(&self) -> &Path {
        &self.inner.path
    }

    pub fn record_count(&self) -> usize {
        self.inner.records.len()
    }

    /// Number of live handles on this file, readers included.
    pub fn handle_count(&self) -> usize {
        Arc::strong_count(&self.inner)
    }

    /// Opens an independent cursor over the records, in append order.
    pub fn records(&self) -> Result<RecordIter> {
        let file = File::open(&self.inner.path)?;
        Ok(RecordIter {
            handle: self.clone(),
            reader: BufReader::new(file),
            next: 0,
        })
    }
}

/// Sequential reader over the records of a [`TmpFile`]. Holds a handle, so the file outlives it.
#[derive(Debug)]
pub struct RecordIter {
    handle: TmpFile,
    reader: BufReader<File>,
    next: usize,
}

impl RecordIter {
    fn read_record(&mut self, meta: RecordMeta) -> Result<Vec<u8>> {
        let mut stored = vec![0u8; meta.stored_len as usize];
        self.reader.read_exact(&mut stored).map_err(|e| {
            if e.kind() == io::ErrorKind::UnexpectedEof {
                HistoryError::Truncated(format!(
                    "record {} of {} is shorter than {} bytes",
                    self.next,
                    self.handle.path().display(),
                    meta.stored_len
                ))
            } else {
                HistoryError::Io(e)
            }
        })?;

        let actual = crc32(&stored);
        if actual != meta.crc32 {
            return Err(HistoryError::corruption(format!(
                "checksum mismatch in record {} of {}: expected {:08x}, got {:08x}",
                self.next,
                self.handle.path().display(),
                meta.crc32,
                actual
            )));
        }

        let record = match self.handle.inner.compression {
            TmpFileCompression::None => stored,
            TmpFileCompression::Lz4 => lz4_flex::block::decompress_size_prepended(&stored)
                .map_err(|e| HistoryError::corruption(format!("LZ4 decompress: {}", e)))?,
        };
        if record.len() as u64 != u64::from(meta.logical_len) {
            return Err(HistoryError::LengthVerificationFailed {
                expected: u64::from(meta.logical_len),
                actual: record.len() as u64,
            });
        }
        Ok(record)
    }
}

impl Iterator for RecordIter {
    type Item = Result<Vec<u8>>;

    fn next(&mut self) -> Option<Self::Item> {
        let meta = *self.handle.inner.records.get(self.next)?;
        let item = self.read_record(meta);
        self.next = match item {
            Ok(_) => self.next + 1,
            // A failed record leaves the cursor in an unknown place; stop here.
            Err(_) => self.handle.inner.records.len(),
        };
        Some(item)
    }

    fn size_hint(&self) -> (usize, Option<usize>) {
        let n = self.handle.inner.records.len() - self.next;
        (n, Some(n))
    }
}
