//! Run-length encoded storage of one metric's values along the timestamp axis.
//!
//! A [`MetricWriter`] coalesces consecutive equal slots into runs and flushes every finished run
//! as one record of a temp file. [`MetricWriter::finish`] seals the file into an immutable
//! [`MetricSegment`] that can be iterated any number of times, concurrently.

use crate::dictionary::{Dictionary, DictionaryWriter};
use crate::encoding::{decode_segment_entry, encode_segment_entry, SizeVerifyingReader};
use crate::error::{HistoryError, Result};
use crate::tmpfile::{RecordIter, TmpFile, TmpFileOptions, TmpFileWriter};
use crate::types::MetricValue;

use std::sync::Arc;

#[derive(Debug)]
pub struct MetricWriter {
    options: Arc<TmpFileOptions>,
    file: Option<TmpFileWriter>,
    dictionary: DictionaryWriter,
    last: Option<MetricValue>,
    repeat: u32,
    written: u64,
    failed: bool,
}

impl MetricWriter {
    pub fn new(options: Arc<TmpFileOptions>) -> Self {
        MetricWriter {
            options,
            file: None,
            dictionary: DictionaryWriter::default(),
            last: None,
            repeat: 0,
            written: 0,
            failed: false,
        }
    }

    /// Appends one slot holding `value`.
    pub fn add(&mut self, value: &MetricValue) -> Result<()> {
        self.push(Some(value), 1)
    }

    /// Appends `count` absent slots.
    pub fn add_absent(&mut self, count: u64) -> Result<()> {
        self.push(None, count)
    }

    /// Pads with absent slots until the writer holds `target_len` slots.
    pub fn fix_backlog(&mut self, target_len: u64) -> Result<()> {
        let len = self.len();
        if len < target_len {
            self.add_absent(target_len - len)?;
        }
        Ok(())
    }

    /// Slots flushed plus slots in the pending run.
    pub fn len(&self) -> u64 {
        self.written + u64::from(self.repeat)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Flushes the pending run and seals the temp file.
    pub fn finish(mut self) -> Result<MetricSegment> {
        self.check_usable()?;
        if self.repeat > 0 {
            self.flush_run()?;
        }
        let file = self.file.take().map(TmpFileWriter::seal).transpose()?;
        Ok(MetricSegment {
            file,
            len: self.written,
        })
    }

    fn push(&mut self, value: Option<&MetricValue>, mut count: u64) -> Result<()> {
        self.check_usable()?;
        while count > 0 {
            if self.repeat > 0
                && (!same_slot(self.last.as_ref(), value) || self.repeat == u32::MAX)
            {
                self.flush_run()?;
            }
            if self.repeat == 0 {
                self.last = value.cloned();
            }
            let step = count.min(u64::from(u32::MAX - self.repeat));
            self.repeat += step as u32;
            count -= step;
        }
        Ok(())
    }

    fn flush_run(&mut self) -> Result<()> {
        let result = self.write_entry();
        if result.is_err() {
            // The dictionary may already have been reset for an entry that never landed.
            self.failed = true;
        }
        result
    }

    fn write_entry(&mut self) -> Result<()> {
        let record = encode_segment_entry(self.repeat, self.last.as_ref(), &mut self.dictionary)?;
        let file = match self.file.take() {
            Some(file) => file,
            None => TmpFileWriter::create(Arc::clone(&self.options))?,
        };
        self.file.insert(file).append(&record)?;
        self.written += u64::from(self.repeat);
        self.repeat = 0;
        Ok(())
    }

    fn check_usable(&self) -> Result<()> {
        if self.failed {
            return Err(HistoryError::InvalidArgument(
                "metric writer is unusable after a failed flush".to_string(),
            ));
        }
        Ok(())
    }
}

/// Runs only merge slots that read back identically, so floats compare by bits.
fn same_slot(a: Option<&MetricValue>, b: Option<&MetricValue>) -> bool {
    match (a, b) {
        (Some(a), Some(b)) => a.same_value(b),
        (None, None) => true,
        _ => false,
    }
}

/// Immutable run-length encoded segment. Cloning shares the underlying temp file.
#[derive(Debug, Clone)]
pub struct MetricSegment {
    file: Option<TmpFile>,
    len: u64,
}

impl MetricSegment {
    /// Total number of slots, absent ones included.
    pub fn len(&self) -> u64 {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// The backing temp file, if anything was ever written.
    pub fn tmp_file(&self) -> Option<&TmpFile> {
        self.file.as_ref()
    }

    /// Iterates the slots in axis order. Each iterator has its own cursor and dictionary state.
    pub fn iter(&self) -> SegmentIter {
        let state = match &self.file {
            None => IterState::Done,
            Some(file) => IterState::Pending(file.clone()),
        };
        SegmentIter {
            state,
            dictionary: Dictionary::default(),
            current: None,
            remaining: 0,
            yielded: 0,
            len: self.len,
        }
    }
}

impl<'a> IntoIterator for &'a MetricSegment {
    type Item = Result<Option<MetricValue>>;
    type IntoIter = SegmentIter;

    fn into_iter(self) -> SegmentIter {
        self.iter()
    }
}

#[derive(Debug)]
enum IterState {
    /// File not opened yet; opening is deferred to the first `next()`.
    Pending(TmpFile),
    Reading(RecordIter),
    Done,
}

/// Iterator over the slots of a [`MetricSegment`]. Absent slots are `Ok(None)`.
#[derive(Debug)]
pub struct SegmentIter {
    state: IterState,
    dictionary: Dictionary,
    current: Option<MetricValue>,
    remaining: u32,
    yielded: u64,
    len: u64,
}

impl SegmentIter {
    fn next_entry(&mut self) -> Option<Result<()>> {
        loop {
            match &mut self.state {
                IterState::Done => return None,
                IterState::Pending(file) => match file.records() {
                    Ok(records) => self.state = IterState::Reading(records),
                    Err(e) => return Some(Err(e)),
                },
                IterState::Reading(records) => {
                    let record = match records.next()? {
                        Ok(record) => record,
                        Err(e) => return Some(Err(e)),
                    };
                    return Some(self.decode(&record));
                }
            }
        }
    }

    fn decode(&mut self, record: &[u8]) -> Result<()> {
        let mut reader = SizeVerifyingReader::new(record, record.len() as u64);
        let (repeat, value) = decode_segment_entry(&mut reader, &mut self.dictionary)?;
        reader.finish()?;
        self.current = value;
        self.remaining = repeat;
        Ok(())
    }
}

impl Iterator for SegmentIter {
    type Item = Result<Option<MetricValue>>;

    fn next(&mut self) -> Option<Self::Item> {
        while self.remaining == 0 {
            match self.next_entry() {
                None => {
                    self.state = IterState::Done;
                    if self.yielded != self.len {
                        let err = HistoryError::LengthVerificationFailed {
                            expected: self.len,
                            actual: self.yielded,
                        };
                        self.yielded = self.len;
                        return Some(Err(err));
                    }
                    return None;
                }
                Some(Err(e)) => {
                    self.state = IterState::Done;
                    self.remaining = 0;
                    self.yielded = self.len;
                    return Some(Err(e));
                }
                Some(Ok(())) => {
                    let decoded = self.yielded + u64::from(self.remaining);
                    if decoded > self.len {
                        self.state = IterState::Done;
                        self.remaining = 0;
                        self.yielded = self.len;
                        return Some(Err(HistoryError::LengthVerificationFailed {
                            expected: self.len,
                            actual: decoded,
                        }));
                    }
                }
            }
        }
        self.remaining -= 1;
        self.yielded += 1;
        Some(Ok(self.current.clone()))
    }

    fn size_hint(&self) -> (usize, Option<usize>) {
        let n = (self.len - self.yielded.min(self.len)) as usize;
        (0, Some(n.saturating_add(1)))
    }
}
