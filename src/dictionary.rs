//! Incremental string dictionary.
//!
//! Writers hand out small stable indices for strings and report only the strings added since
//! the last reset. Readers rebuild the full table by applying those deltas in entry order.

use crate::encoding::{check_item_count, read_string, read_var_u32, write_string, write_var_u32};
use crate::error::{HistoryError, Result};

use std::collections::HashMap;
use std::io::Read;

/// Strings newly assigned by a [`DictionaryWriter`], indices `first_index..first_index + len`.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DictionaryDelta {
    first_index: u32,
    strings: Vec<String>,
}

impl DictionaryDelta {
    pub fn first_index(&self) -> u32 {
        self.first_index
    }

    pub fn len(&self) -> usize {
        self.strings.len()
    }

    pub fn is_empty(&self) -> bool {
        self.strings.is_empty()
    }

    /// `(index, string)` pairs in index order.
    pub fn iter(&self) -> impl Iterator<Item = (u32, &str)> {
        self.strings
            .iter()
            .enumerate()
            .map(move |(i, s)| (self.first_index + i as u32, s.as_str()))
    }

    pub(crate) fn write_to(&self, buf: &mut Vec<u8>) -> Result<()> {
        let n: u32 = self
            .strings
            .len()
            .try_into()
            .map_err(|_| HistoryError::InvalidArgument("Dictionary delta too large".to_string()))?;
        write_var_u32(buf, self.first_index);
        write_var_u32(buf, n);
        for s in &self.strings {
            write_string(buf, s)?;
        }
        Ok(())
    }

    pub(crate) fn read_from<R: Read>(r: &mut R) -> Result<Self> {
        let first_index = read_var_u32(r)?;
        let n = read_var_u32(r)?;
        check_item_count(n, "dictionary strings")?;
        let mut strings = Vec::with_capacity(n.min(1024) as usize);
        for _ in 0..n {
            strings.push(read_string(r)?);
        }
        Ok(DictionaryDelta {
            first_index,
            strings,
        })
    }
}

/// Write side of the dictionary: string to index, plus the pending delta.
#[derive(Debug, Default)]
pub struct DictionaryWriter {
    indices: HashMap<String, u32>,
    pending: Vec<String>,
    pending_first: u32,
}

impl DictionaryWriter {
    /// Returns the index of `s`, assigning the next free index on first sight.
    pub fn get_or_create(&mut self, s: &str) -> u32 {
        if let Some(&idx) = self.indices.get(s) {
            return idx;
        }
        let idx = self.indices.len() as u32;
        self.indices.insert(s.to_string(), idx);
        self.pending.push(s.to_string());
        idx
    }

    /// Strings assigned since the last [`DictionaryWriter::reset`].
    pub fn encode(&self) -> DictionaryDelta {
        DictionaryDelta {
            first_index: self.pending_first,
            strings: self.pending.clone(),
        }
    }

    /// Clears the pending delta. Assigned indices are kept.
    pub fn reset(&mut self) {
        self.pending.clear();
        self.pending_first = self.indices.len() as u32;
    }

    pub fn len(&self) -> usize {
        self.indices.len()
    }

    pub fn is_empty(&self) -> bool {
        self.indices.is_empty()
    }
}

/// Read side of the dictionary: the full index to string table replayed so far.
#[derive(Debug, Clone, Default)]
pub struct Dictionary {
    strings: Vec<String>,
}

impl Dictionary {
    /// Extends this state with `delta`. The delta must start exactly where this state ends;
    /// anything else means entries are replayed out of order or were lost.
    pub fn apply(&mut self, delta: DictionaryDelta) -> Result<()> {
        let expected = self.strings.len() as u32;
        if delta.is_empty() {
            return Ok(());
        }
        if delta.first_index != expected {
            return Err(HistoryError::DictionaryOutOfOrder {
                expected,
                got: delta.first_index,
            });
        }
        self.strings.extend(delta.strings);
        Ok(())
    }

    /// Functional form of [`Dictionary::apply`]: returns the combined state.
    pub fn applied(&self, delta: DictionaryDelta) -> Result<Dictionary> {
        let mut next = self.clone();
        next.apply(delta)?;
        Ok(next)
    }

    pub fn get_string(&self, index: u32) -> Result<&str> {
        self.strings
            .get(index as usize)
            .map(String::as_str)
            .ok_or(HistoryError::UnknownDictionaryIndex(index))
    }

    pub fn len(&self) -> usize {
        self.strings.len()
    }

    pub fn is_empty(&self) -> bool {
        self.strings.is_empty()
    }
}
