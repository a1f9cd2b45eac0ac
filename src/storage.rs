//! Column-major storage of a chronological sequence of collections.
//!
//! The builder ingests one [`TimeSeriesCollection`] per call and keeps one run-length
//! [`MetricWriter`] per `(group, metric)`. Every segment is aligned to the shared timestamp
//! axis: slot `i` of every segment belongs to `timestamps()[i]`.

use crate::config::HistoryConfig;
use crate::error::{HistoryError, Result};
use crate::segments::{MetricSegment, MetricWriter, SegmentIter};
use crate::telemetry::{history_metrics, HistoryEvent, HistoryEventListener};
use crate::tmpfile::TmpFileOptions;
use crate::types::{GroupMetrics, GroupName, MetricName, MetricValue, Timestamp, TimeSeriesCollection};

use rayon::prelude::*;
use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::sync::{Arc, Mutex};
use std::time::Instant;

#[derive(Debug, Default)]
struct GroupWriter {
    metrics: HashMap<MetricName, Mutex<MetricWriter>>,
}

impl GroupWriter {
    fn write_one(&self, index: u64, metric: &MetricName, value: &MetricValue) -> Result<()> {
        let writer = self.metrics.get(metric).ok_or_else(|| {
            HistoryError::InvalidArgument(format!("no writer registered for metric {}", metric))
        })?;
        let mut writer = writer.lock()?;
        writer.fix_backlog(index)?;
        writer.add(value)
    }

    fn write(&self, index: u64, metrics: &GroupMetrics, parallel: bool) -> Result<()> {
        if parallel {
            metrics
                .par_iter()
                .try_for_each(|(metric, value)| self.write_one(index, metric, value))
        } else {
            metrics
                .iter()
                .try_for_each(|(metric, value)| self.write_one(index, metric, value))
        }
    }

    fn finish(self, len: u64) -> Result<HashMap<MetricName, MetricSegment>> {
        self.metrics
            .into_par_iter()
            .map(|(metric, writer)| -> Result<(MetricName, MetricSegment)> {
                let mut writer = writer.into_inner()?;
                writer.fix_backlog(len)?;
                Ok((metric, writer.finish()?))
            })
            .collect()
    }
}

/// Builds a [`ColumnMajorStore`]. Consumed by [`ColumnMajorStoreBuilder::build`].
#[derive(Debug)]
pub struct ColumnMajorStoreBuilder {
    options: Arc<TmpFileOptions>,
    parallel: bool,
    events: Arc<dyn HistoryEventListener>,
    timestamps: Vec<Timestamp>,
    groups: HashMap<GroupName, GroupWriter>,
    group_timestamps: HashMap<GroupName, BTreeSet<Timestamp>>,
    failure: Option<String>,
}

impl Default for ColumnMajorStoreBuilder {
    fn default() -> Self {
        Self::with_config(&HistoryConfig::default())
    }
}

impl ColumnMajorStoreBuilder {
    pub fn with_config(cfg: &HistoryConfig) -> Self {
        ColumnMajorStoreBuilder {
            options: Arc::new(TmpFileOptions::from(cfg)),
            parallel: cfg.parallel_ingest,
            events: Arc::clone(&cfg.event_listener),
            timestamps: Vec::new(),
            groups: HashMap::new(),
            group_timestamps: HashMap::new(),
            failure: None,
        }
    }

    /// Number of collections ingested so far.
    pub fn len(&self) -> usize {
        self.timestamps.len()
    }

    pub fn is_empty(&self) -> bool {
        self.timestamps.is_empty()
    }

    /// Ingests one collection at the next axis index.
    ///
    /// After an error the builder is unusable: further calls and `build()` fail.
    pub fn with(&mut self, tsc: &TimeSeriesCollection) -> Result<&mut Self> {
        self.check_usable()?;
        let index = self.timestamps.len() as u64;

        for (group, metrics) in tsc.groups() {
            self.group_timestamps
                .entry(group.clone())
                .or_default()
                .insert(tsc.timestamp());
            let writers = self.groups.entry(group.clone()).or_default();
            for metric in metrics.keys() {
                if !writers.metrics.contains_key(metric) {
                    let writer = MetricWriter::new(Arc::clone(&self.options));
                    writers.metrics.insert(metric.clone(), Mutex::new(writer));
                }
            }
        }

        let groups = &self.groups;
        let parallel = self.parallel;
        let write_group = |(group, metrics): (&GroupName, &GroupMetrics)| -> Result<()> {
            match groups.get(group) {
                Some(writers) => writers.write(index, metrics, parallel),
                None => Err(HistoryError::InvalidArgument(format!(
                    "no writers registered for group {}",
                    group
                ))),
            }
        };
        let result = if parallel {
            tsc.groups().par_iter().try_for_each(write_group)
        } else {
            tsc.groups().iter().try_for_each(write_group)
        };
        if let Err(e) = result {
            self.failure = Some(e.to_string());
            return Err(e);
        }

        self.timestamps.push(tsc.timestamp());
        history_metrics::record_ingest_collection();
        Ok(self)
    }

    /// Ingests every collection of `collections`, in order.
    pub fn with_all<'a, I>(&mut self, collections: I) -> Result<&mut Self>
    where
        I: IntoIterator<Item = &'a TimeSeriesCollection>,
    {
        for tsc in collections {
            self.with(tsc)?;
        }
        Ok(self)
    }

    /// Pads every writer to the axis length, seals all segments and returns the store.
    pub fn build(self) -> Result<ColumnMajorStore> {
        let started = Instant::now();
        let events = Arc::clone(&self.events);
        match self.build_inner() {
            Ok(store) => {
                let duration = started.elapsed();
                history_metrics::record_store_build(duration);
                events.on_event(HistoryEvent::StoreBuilt {
                    timestamps: store.timestamps.len(),
                    groups: store.groups.len(),
                    metrics: store.groups.values().map(HashMap::len).sum(),
                    duration,
                });
                Ok(store)
            }
            Err(e) => {
                events.on_event(HistoryEvent::StoreBuildFailed {
                    error: e.to_string(),
                });
                Err(e)
            }
        }
    }

    fn build_inner(self) -> Result<ColumnMajorStore> {
        self.check_usable()?;
        let len = self.timestamps.len() as u64;
        let groups = self
            .groups
            .into_par_iter()
            .map(|(group, writers)| -> Result<_> { Ok((group, writers.finish(len)?)) })
            .collect::<Result<HashMap<_, _>>>()?;

        Ok(ColumnMajorStore {
            timestamps: self.timestamps,
            groups,
            group_timestamps: self.group_timestamps,
        })
    }

    fn check_usable(&self) -> Result<()> {
        match &self.failure {
            Some(reason) => Err(HistoryError::InvalidArgument(format!(
                "builder is unusable after a failed ingestion: {}",
                reason
            ))),
            None => Ok(()),
        }
    }
}

/// Immutable, column-major history. Cheap to query concurrently.
#[derive(Debug, Clone)]
pub struct ColumnMajorStore {
    timestamps: Vec<Timestamp>,
    groups: HashMap<GroupName, HashMap<MetricName, MetricSegment>>,
    group_timestamps: HashMap<GroupName, BTreeSet<Timestamp>>,
}

impl ColumnMajorStore {
    pub fn builder() -> ColumnMajorStoreBuilder {
        ColumnMajorStoreBuilder::default()
    }

    /// Convenience for building a store from a sequence of collections in one go.
    pub fn from_collections<'a, I>(cfg: &HistoryConfig, collections: I) -> Result<Self>
    where
        I: IntoIterator<Item = &'a TimeSeriesCollection>,
    {
        let mut builder = ColumnMajorStoreBuilder::with_config(cfg);
        builder.with_all(collections)?;
        builder.build()
    }

    /// The timestamp axis, in ingestion order.
    pub fn timestamps(&self) -> &[Timestamp] {
        &self.timestamps
    }

    pub fn group_names(&self) -> BTreeSet<&GroupName> {
        self.groups.keys().collect()
    }

    /// Metric names of `group`; empty for unknown groups.
    pub fn metric_names(&self, group: &GroupName) -> BTreeSet<&MetricName> {
        self.groups
            .get(group)
            .map(|metrics| metrics.keys().collect())
            .unwrap_or_default()
    }

    /// Instants at which `group` reported; empty for unknown groups.
    pub fn group_timestamps(&self, group: &GroupName) -> BTreeSet<Timestamp> {
        self.group_timestamps.get(group).cloned().unwrap_or_default()
    }

    /// Lazily decoded values of one metric. Unknown groups/metrics give an empty view.
    pub fn metric_values(&self, group: &GroupName, metric: &MetricName) -> MetricValues<'_> {
        MetricValues {
            timestamps: &self.timestamps,
            segment: self.groups.get(group).and_then(|m| m.get(metric)),
        }
    }

    /// Reconstructs the ingested collections, one per axis entry.
    pub fn iter_collections(&self) -> CollectionIter<'_> {
        let columns = self
            .groups
            .iter()
            .flat_map(|(group, metrics)| {
                metrics
                    .iter()
                    .map(move |(metric, segment)| (group, metric, segment.iter()))
            })
            .collect();
        CollectionIter {
            timestamps: self.timestamps.iter(),
            columns,
            failed: false,
        }
    }
}

/// Map-like view `Timestamp -> MetricValue` of one metric, omitting absent slots.
#[derive(Debug, Clone, Copy)]
pub struct MetricValues<'a> {
    timestamps: &'a [Timestamp],
    segment: Option<&'a MetricSegment>,
}

impl<'a> MetricValues<'a> {
    /// `(timestamp, value)` pairs in axis order.
    pub fn iter(&self) -> MetricValuesIter<'a> {
        MetricValuesIter {
            timestamps: self.timestamps.iter(),
            slots: self.segment.map(MetricSegment::iter),
        }
    }

    /// True when the metric never held a value. Decodes the segment if it exists.
    pub fn is_empty(&self) -> Result<bool> {
        match self.iter().next() {
            None => Ok(true),
            Some(r) => r.map(|_| false),
        }
    }

    /// Value recorded at `ts`, if any. If the axis holds `ts` more than once the last wins.
    pub fn get(&self, ts: Timestamp) -> Result<Option<MetricValue>> {
        let mut found = None;
        for item in self.iter() {
            let (t, v) = item?;
            if t == ts {
                found = Some(v);
            } else if t > ts && found.is_some() {
                break;
            }
        }
        Ok(found)
    }

    pub fn to_map(&self) -> Result<BTreeMap<Timestamp, MetricValue>> {
        self.iter().collect()
    }
}

impl<'a> IntoIterator for MetricValues<'a> {
    type Item = Result<(Timestamp, MetricValue)>;
    type IntoIter = MetricValuesIter<'a>;

    fn into_iter(self) -> MetricValuesIter<'a> {
        self.iter()
    }
}

#[derive(Debug)]
pub struct MetricValuesIter<'a> {
    timestamps: std::slice::Iter<'a, Timestamp>,
    slots: Option<SegmentIter>,
}

impl<'a> Iterator for MetricValuesIter<'a> {
    type Item = Result<(Timestamp, MetricValue)>;

    fn next(&mut self) -> Option<Self::Item> {
        let slots = self.slots.as_mut()?;
        loop {
            let slot = slots.next();
            let ts = self.timestamps.next();
            match (slot, ts) {
                (None, None) => return None,
                (Some(Err(e)), _) => {
                    self.slots = None;
                    return Some(Err(e));
                }
                (Some(Ok(None)), Some(_)) => continue,
                (Some(Ok(Some(v))), Some(&t)) => return Some(Ok((t, v))),
                (slot, ts) => {
                    self.slots = None;
                    return Some(Err(HistoryError::corruption(format!(
                        "segment is not aligned with the timestamp axis (segment ended: {}, axis ended: {})",
                        slot.is_none(),
                        ts.is_none()
                    ))));
                }
            }
        }
    }
}

/// Row-major reconstruction of a [`ColumnMajorStore`].
#[derive(Debug)]
pub struct CollectionIter<'a> {
    timestamps: std::slice::Iter<'a, Timestamp>,
    columns: Vec<(&'a GroupName, &'a MetricName, SegmentIter)>,
    failed: bool,
}

impl<'a> Iterator for CollectionIter<'a> {
    type Item = Result<TimeSeriesCollection>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.failed {
            return None;
        }
        let ts = *self.timestamps.next()?;
        let mut tsc = TimeSeriesCollection::new(ts);
        for (group, metric, slots) in self.columns.iter_mut() {
            let slot = match slots.next() {
                Some(Ok(slot)) => slot,
                Some(Err(e)) => {
                    self.failed = true;
                    return Some(Err(e));
                }
                None => {
                    self.failed = true;
                    return Some(Err(HistoryError::corruption(format!(
                        "segment {}/{} ended before the timestamp axis",
                        group, metric
                    ))));
                }
            };
            if let Some(value) = slot {
                tsc.add_metric((*group).clone(), (*metric).clone(), value);
            }
        }
        Some(Ok(tsc))
    }

    fn size_hint(&self) -> (usize, Option<usize>) {
        if self.failed {
            (0, Some(0))
        } else {
            self.timestamps.size_hint()
        }
    }
}
