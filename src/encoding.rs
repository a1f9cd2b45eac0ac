//! Binary encoding of metric values and run-length segment entries, plus the byte-level helpers
//! (fixed-width little-endian, varints, CRC32, length-verified reads) shared by the temp-file layer.

use crate::dictionary::{Dictionary, DictionaryDelta, DictionaryWriter};
use crate::error::{HistoryError, Result};
use crate::types::{Histogram, HistogramBucket, MetricValue};

use crc32fast::Hasher as Crc32;
use std::io::{self, Read};

const VALUE_EMPTY: u8 = 0;
const VALUE_BOOL: u8 = 1;
const VALUE_INT: u8 = 2;
const VALUE_FLOAT: u8 = 3;
const VALUE_STR: u8 = 4;
const VALUE_HISTOGRAM: u8 = 5;

const ENTRY_ABSENT: u8 = 0;
const ENTRY_PRESENT: u8 = 1;

/// Upper bound for collection sizes read from a record, so corrupt lengths cannot trigger
/// huge allocations.
const MAX_DECODED_ITEMS: u32 = 16 * 1024 * 1024;

// --- Segment entries ---

/// Encodes one run-length entry.
///
/// Present values are encoded through `dictionary`; the strings this assigned since the last
/// reset are attached as the entry's dictionary delta and the pending delta is then cleared.
pub(crate) fn encode_segment_entry(
    repeat: u32,
    value: Option<&MetricValue>,
    dictionary: &mut DictionaryWriter,
) -> Result<Vec<u8>> {
    if repeat == 0 {
        return Err(HistoryError::InvalidArgument(
            "Refusing to encode an entry with zero repeat count".to_string(),
        ));
    }

    let mut buf = Vec::with_capacity(16);
    write_u32(&mut buf, repeat);
    match value {
        None => buf.push(ENTRY_ABSENT),
        Some(v) => {
            buf.push(ENTRY_PRESENT);
            // The value must be encoded first: it is what grows the dictionary.
            let mut value_buf = Vec::new();
            encode_metric_value(v, dictionary, &mut value_buf)?;
            let delta = dictionary.encode();
            dictionary.reset();
            delta.write_to(&mut buf)?;
            buf.extend_from_slice(&value_buf);
        }
    }
    Ok(buf)
}

/// Decodes one run-length entry, applying its dictionary delta to `dictionary` before resolving
/// the value. Returns `(repeat, value)`; `None` marks an absent run.
pub(crate) fn decode_segment_entry<R: Read>(
    r: &mut R,
    dictionary: &mut Dictionary,
) -> Result<(u32, Option<MetricValue>)> {
    let repeat = read_u32(r)?;
    if repeat == 0 {
        return Err(HistoryError::corruption("Segment entry with zero repeat count"));
    }
    match read_u8(r)? {
        ENTRY_ABSENT => Ok((repeat, None)),
        ENTRY_PRESENT => {
            let delta = DictionaryDelta::read_from(r)?;
            dictionary.apply(delta)?;
            let value = decode_metric_value(r, dictionary)?;
            Ok((repeat, Some(value)))
        }
        other => Err(HistoryError::corruption(format!(
            "Bad presence marker {} in segment entry",
            other
        ))),
    }
}

// --- Metric values ---

pub(crate) fn encode_metric_value(
    value: &MetricValue,
    dictionary: &mut DictionaryWriter,
    out: &mut Vec<u8>,
) -> Result<()> {
    match value {
        MetricValue::Empty => out.push(VALUE_EMPTY),
        MetricValue::Bool(b) => {
            out.push(VALUE_BOOL);
            out.push(u8::from(*b));
        }
        MetricValue::Int(i) => {
            out.push(VALUE_INT);
            write_u64(out, *i as u64);
        }
        MetricValue::Float(f) => {
            out.push(VALUE_FLOAT);
            write_f64(out, *f);
        }
        MetricValue::Str(s) => {
            out.push(VALUE_STR);
            write_var_u32(out, dictionary.get_or_create(s));
        }
        MetricValue::Histogram(h) => {
            out.push(VALUE_HISTOGRAM);
            let n: u32 = h
                .buckets
                .len()
                .try_into()
                .map_err(|_| HistoryError::InvalidArgument("Histogram too large".to_string()))?;
            write_var_u32(out, n);
            for b in &h.buckets {
                write_f64(out, b.floor);
                write_f64(out, b.ceil);
                write_f64(out, b.count);
            }
        }
    }
    Ok(())
}

pub(crate) fn decode_metric_value<R: Read>(r: &mut R, dictionary: &Dictionary) -> Result<MetricValue> {
    let tag = read_u8(r)?;
    let value = match tag {
        VALUE_EMPTY => MetricValue::Empty,
        VALUE_BOOL => match read_u8(r)? {
            0 => MetricValue::Bool(false),
            1 => MetricValue::Bool(true),
            other => {
                return Err(HistoryError::corruption(format!("Bad boolean byte {}", other)));
            }
        },
        VALUE_INT => MetricValue::Int(read_u64(r)? as i64),
        VALUE_FLOAT => MetricValue::Float(read_f64(r)?),
        VALUE_STR => {
            let idx = read_var_u32(r)?;
            MetricValue::Str(dictionary.get_string(idx)?.to_string())
        }
        VALUE_HISTOGRAM => {
            let n = read_var_u32(r)?;
            check_item_count(n, "histogram buckets")?;
            let mut buckets = Vec::with_capacity(n as usize);
            for _ in 0..n {
                let floor = read_f64(r)?;
                let ceil = read_f64(r)?;
                let count = read_f64(r)?;
                buckets.push(HistogramBucket { floor, ceil, count });
            }
            MetricValue::Histogram(Histogram { buckets })
        }
        other => {
            return Err(HistoryError::corruption(format!("Unknown metric value tag {}", other)));
        }
    };
    Ok(value)
}

pub(crate) fn check_item_count(n: u32, what: &str) -> Result<()> {
    if n > MAX_DECODED_ITEMS {
        return Err(HistoryError::corruption(format!(
            "Refusing to decode {} {}",
            n, what
        )));
    }
    Ok(())
}

// --- Length verification ---

/// Reader that refuses to read past `expected` bytes and, on [`SizeVerifyingReader::finish`],
/// checks that exactly `expected` bytes were consumed.
#[derive(Debug)]
pub struct SizeVerifyingReader<R> {
    inner: R,
    expected: u64,
    consumed: u64,
}

impl<R: Read> SizeVerifyingReader<R> {
    pub fn new(inner: R, expected: u64) -> Self {
        Self {
            inner,
            expected,
            consumed: 0,
        }
    }

    pub fn consumed(&self) -> u64 {
        self.consumed
    }

    /// Verifies the whole region was consumed and returns the wrapped reader.
    pub fn finish(self) -> Result<R> {
        if self.consumed != self.expected {
            return Err(HistoryError::LengthVerificationFailed {
                expected: self.expected,
                actual: self.consumed,
            });
        }
        Ok(self.inner)
    }
}

impl<R: Read> Read for SizeVerifyingReader<R> {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        let remaining = self.expected - self.consumed;
        let max = (buf.len() as u64).min(remaining) as usize;
        if max == 0 {
            return Ok(0);
        }
        let n = self.inner.read(&mut buf[..max])?;
        self.consumed += n as u64;
        Ok(n)
    }
}

// --- Helpers (binary, varint, checksum) ---

pub fn write_u32(buf: &mut Vec<u8>, v: u32) {
    buf.extend_from_slice(&v.to_le_bytes());
}
pub fn write_u64(buf: &mut Vec<u8>, v: u64) {
    buf.extend_from_slice(&v.to_le_bytes());
}
pub fn write_f64(buf: &mut Vec<u8>, v: f64) {
    buf.extend_from_slice(&v.to_le_bytes());
}

/// `read_exact` that reports running out of bytes as a truncated record.
fn read_exact_or_truncated<R: Read>(r: &mut R, buf: &mut [u8]) -> Result<()> {
    r.read_exact(buf).map_err(|e| {
        if e.kind() == io::ErrorKind::UnexpectedEof {
            HistoryError::Truncated(format!("needed {} more bytes", buf.len()))
        } else {
            HistoryError::Io(e)
        }
    })
}

pub fn read_u8<R: Read>(r: &mut R) -> Result<u8> {
    let mut b = [0u8; 1];
    read_exact_or_truncated(r, &mut b)?;
    Ok(b[0])
}
pub fn read_u32<R: Read>(r: &mut R) -> Result<u32> {
    let mut b = [0u8; 4];
    read_exact_or_truncated(r, &mut b)?;
    Ok(u32::from_le_bytes(b))
}
pub fn read_u64<R: Read>(r: &mut R) -> Result<u64> {
    let mut b = [0u8; 8];
    read_exact_or_truncated(r, &mut b)?;
    Ok(u64::from_le_bytes(b))
}
pub fn read_f64<R: Read>(r: &mut R) -> Result<f64> {
    let mut b = [0u8; 8];
    read_exact_or_truncated(r, &mut b)?;
    Ok(f64::from_le_bytes(b))
}

#[inline]
pub fn crc32(bytes: &[u8]) -> u32 {
    let mut h = Crc32::new();
    h.update(bytes);
    h.finalize()
}

fn write_var_u64(buf: &mut Vec<u8>, mut v: u64) {
    while v >= 0x80 {
        buf.push((v as u8) | 0x80);
        v >>= 7;
    }
    buf.push(v as u8);
}

pub(crate) fn write_var_u32(buf: &mut Vec<u8>, v: u32) {
    write_var_u64(buf, v as u64);
}

fn read_var_u64<R: Read>(r: &mut R) -> Result<u64> {
    let mut out: u64 = 0;
    let mut shift: u32 = 0;
    for _ in 0..10 {
        let byte = read_u8(r)?;
        out |= ((byte & 0x7F) as u64) << shift;
        if (byte & 0x80) == 0 {
            return Ok(out);
        }
        shift = shift.saturating_add(7);
    }
    Err(HistoryError::corruption("Varint too long"))
}

pub(crate) fn read_var_u32<R: Read>(r: &mut R) -> Result<u32> {
    let v = read_var_u64(r)?;
    if v > u32::MAX as u64 {
        return Err(HistoryError::corruption("Varint does not fit in u32"));
    }
    Ok(v as u32)
}

pub(crate) fn write_string(buf: &mut Vec<u8>, s: &str) -> Result<()> {
    let n: u32 = s
        .len()
        .try_into()
        .map_err(|_| HistoryError::InvalidArgument("String too large".to_string()))?;
    write_var_u32(buf, n);
    buf.extend_from_slice(s.as_bytes());
    Ok(())
}

pub(crate) fn read_string<R: Read>(r: &mut R) -> Result<String> {
    let n = read_var_u32(r)?;
    check_item_count(n, "string bytes")?;
    let mut bytes = vec![0u8; n as usize];
    read_exact_or_truncated(r, &mut bytes)?;
    String::from_utf8(bytes).map_err(|e| HistoryError::corruption(format!("Invalid UTF-8: {}", e)))
}
