//! Plain data types exchanged with collectors and rule evaluation.

use std::collections::{BTreeMap, BTreeSet};
use std::fmt;

/// Timestamp type (milliseconds since epoch).
pub type Timestamp = u64;

/// Tag set attached to a group. Ordered so equality and hashing are canonical.
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Tags(BTreeMap<String, String>);

impl Tags {
    pub fn new() -> Self {
        Tags(BTreeMap::new())
    }

    pub fn insert(&mut self, key: impl Into<String>, value: impl Into<String>) -> &mut Self {
        self.0.insert(key.into(), value.into());
        self
    }

    pub fn get(&self, key: &str) -> Option<&str> {
        self.0.get(key).map(String::as_str)
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &str)> {
        self.0.iter().map(|(k, v)| (k.as_str(), v.as_str()))
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

impl<K: Into<String>, V: Into<String>> FromIterator<(K, V)> for Tags {
    fn from_iter<I: IntoIterator<Item = (K, V)>>(iter: I) -> Self {
        Tags(iter.into_iter().map(|(k, v)| (k.into(), v.into())).collect())
    }
}

/// Hierarchical group path, e.g. `["jvm", "memory"]`.
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct SimpleGroupPath {
    pub path: Vec<String>,
}

impl SimpleGroupPath {
    pub fn new<S: Into<String>>(path: impl IntoIterator<Item = S>) -> Self {
        SimpleGroupPath {
            path: path.into_iter().map(Into::into).collect(),
        }
    }
}

impl fmt::Display for SimpleGroupPath {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.path.join("."))
    }
}

/// Identity of a group of metrics: a path plus a tag set.
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct GroupName {
    pub path: SimpleGroupPath,
    pub tags: Tags,
}

impl GroupName {
    pub fn new<S: Into<String>>(path: impl IntoIterator<Item = S>) -> Self {
        GroupName {
            path: SimpleGroupPath::new(path),
            tags: Tags::new(),
        }
    }

    pub fn with_tags<S: Into<String>>(path: impl IntoIterator<Item = S>, tags: Tags) -> Self {
        GroupName {
            path: SimpleGroupPath::new(path),
            tags,
        }
    }
}

impl fmt::Display for GroupName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.path)?;
        if !self.tags.is_empty() {
            let rendered: Vec<String> = self
                .tags
                .iter()
                .map(|(k, v)| format!("{}={:?}", k, v))
                .collect();
            write!(f, "{{{}}}", rendered.join(", "))?;
        }
        Ok(())
    }
}

/// Hierarchical metric name within a group.
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct MetricName {
    pub path: Vec<String>,
}

impl MetricName {
    pub fn new<S: Into<String>>(path: impl IntoIterator<Item = S>) -> Self {
        MetricName {
            path: path.into_iter().map(Into::into).collect(),
        }
    }
}

impl fmt::Display for MetricName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.path.join("."))
    }
}

/// One bucket of a histogram: the range `[floor, ceil)` and its event count.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct HistogramBucket {
    pub floor: f64,
    pub ceil: f64,
    pub count: f64,
}

impl HistogramBucket {
    fn same_bits(&self, other: &HistogramBucket) -> bool {
        self.floor.to_bits() == other.floor.to_bits()
            && self.ceil.to_bits() == other.ceil.to_bits()
            && self.count.to_bits() == other.count.to_bits()
    }
}

/// Distribution value as reported by collectors.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Histogram {
    pub buckets: Vec<HistogramBucket>,
}

impl Histogram {
    pub fn new(buckets: Vec<HistogramBucket>) -> Self {
        Histogram { buckets }
    }

    /// Total number of events across all buckets.
    pub fn event_count(&self) -> f64 {
        self.buckets.iter().map(|b| b.count).sum()
    }
}

/// A single measured value.
///
/// `Empty` is the in-band "no value" of the collector model. It is distinct from a slot
/// that is absent from a metric segment, which is represented as `None` by readers.
#[derive(Debug, Clone, PartialEq)]
pub enum MetricValue {
    Bool(bool),
    Int(i64),
    Float(f64),
    Str(String),
    Histogram(Histogram),
    Empty,
}

impl MetricValue {
    /// Numeric view of the value. Booleans, strings and histograms are not numeric.
    pub fn as_f64(&self) -> Option<f64> {
        match self {
            MetricValue::Int(i) => Some(*i as f64),
            MetricValue::Float(f) => Some(*f),
            _ => None,
        }
    }

    pub fn is_numeric(&self) -> bool {
        matches!(self, MetricValue::Int(_) | MetricValue::Float(_))
    }

    pub fn is_empty(&self) -> bool {
        matches!(self, MetricValue::Empty)
    }

    /// Bitwise equality: `-0.0` differs from `0.0` and a NaN equals the same NaN.
    ///
    /// This is the equality under which a value survives storage unchanged.
    pub fn same_value(&self, other: &MetricValue) -> bool {
        match (self, other) {
            (MetricValue::Float(a), MetricValue::Float(b)) => a.to_bits() == b.to_bits(),
            (MetricValue::Histogram(a), MetricValue::Histogram(b)) => {
                a.buckets.len() == b.buckets.len()
                    && a.buckets.iter().zip(&b.buckets).all(|(x, y)| x.same_bits(y))
            }
            _ => self == other,
        }
    }
}

impl From<bool> for MetricValue {
    fn from(v: bool) -> Self {
        MetricValue::Bool(v)
    }
}

impl From<i64> for MetricValue {
    fn from(v: i64) -> Self {
        MetricValue::Int(v)
    }
}

impl From<f64> for MetricValue {
    fn from(v: f64) -> Self {
        MetricValue::Float(v)
    }
}

impl From<&str> for MetricValue {
    fn from(v: &str) -> Self {
        MetricValue::Str(v.to_string())
    }
}

impl From<String> for MetricValue {
    fn from(v: String) -> Self {
        MetricValue::Str(v)
    }
}

impl From<Histogram> for MetricValue {
    fn from(v: Histogram) -> Self {
        MetricValue::Histogram(v)
    }
}

/// Metrics of a single group at one instant.
pub type GroupMetrics = BTreeMap<MetricName, MetricValue>;

/// All groups and metrics observed at a single instant.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct TimeSeriesCollection {
    timestamp: Timestamp,
    groups: BTreeMap<GroupName, GroupMetrics>,
}

impl TimeSeriesCollection {
    pub fn new(timestamp: Timestamp) -> Self {
        TimeSeriesCollection {
            timestamp,
            groups: BTreeMap::new(),
        }
    }

    /// Builds a collection from `(group, metric, value)` triples. Later duplicates win.
    pub fn from_values<I>(timestamp: Timestamp, values: I) -> Self
    where
        I: IntoIterator<Item = (GroupName, MetricName, MetricValue)>,
    {
        let mut tsc = TimeSeriesCollection::new(timestamp);
        for (group, metric, value) in values {
            tsc.add_metric(group, metric, value);
        }
        tsc
    }

    pub fn timestamp(&self) -> Timestamp {
        self.timestamp
    }

    pub fn set_timestamp(&mut self, timestamp: Timestamp) -> &mut Self {
        self.timestamp = timestamp;
        self
    }

    pub fn add_metric(
        &mut self,
        group: GroupName,
        metric: MetricName,
        value: MetricValue,
    ) -> &mut Self {
        self.groups.entry(group).or_default().insert(metric, value);
        self
    }

    /// Adds (or overwrites) several metrics of one group. Creates the group even when
    /// `metrics` is empty.
    pub fn add_metrics<I>(&mut self, group: GroupName, metrics: I) -> &mut Self
    where
        I: IntoIterator<Item = (MetricName, MetricValue)>,
    {
        self.groups.entry(group).or_default().extend(metrics);
        self
    }

    /// Moves the metrics of `old` to `new`, replacing whatever `new` held.
    pub fn rename_group(&mut self, old: &GroupName, new: GroupName) -> &mut Self {
        if let Some(metrics) = self.groups.remove(old) {
            self.groups.insert(new, metrics);
        }
        self
    }

    pub fn is_empty(&self) -> bool {
        self.groups.is_empty()
    }

    pub fn groups(&self) -> &BTreeMap<GroupName, GroupMetrics> {
        &self.groups
    }

    pub fn group_names(&self) -> impl Iterator<Item = &GroupName> {
        self.groups.keys()
    }

    pub fn group_paths(&self) -> BTreeSet<&SimpleGroupPath> {
        self.groups.keys().map(|g| &g.path).collect()
    }

    pub fn metrics(&self, group: &GroupName) -> Option<&GroupMetrics> {
        self.groups.get(group)
    }

    pub fn get(&self, group: &GroupName, metric: &MetricName) -> Option<&MetricValue> {
        self.groups.get(group).and_then(|m| m.get(metric))
    }

    /// All `(group, metric, value)` triples in group/metric order.
    pub fn values(&self) -> impl Iterator<Item = (&GroupName, &MetricName, &MetricValue)> {
        self.groups
            .iter()
            .flat_map(|(g, metrics)| metrics.iter().map(move |(m, v)| (g, m, v)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn group(name: &str) -> GroupName {
        GroupName::new([name])
    }

    fn metric(name: &str) -> MetricName {
        MetricName::new([name])
    }

    #[test]
    fn from_values_groups_triples() {
        let tsc = TimeSeriesCollection::from_values(
            10,
            vec![
                (group("a"), metric("x"), MetricValue::Int(1)),
                (group("a"), metric("y"), MetricValue::from("up")),
                (group("b"), metric("x"), MetricValue::Float(0.5)),
            ],
        );

        assert_eq!(tsc.timestamp(), 10);
        assert_eq!(tsc.group_names().count(), 2);
        assert_eq!(tsc.get(&group("a"), &metric("y")), Some(&MetricValue::from("up")));
        assert_eq!(tsc.values().count(), 3);
    }

    #[test]
    fn rename_group_moves_metrics() {
        let mut tsc = TimeSeriesCollection::new(0);
        tsc.add_metric(group("old"), metric("x"), MetricValue::Bool(true));
        tsc.rename_group(&group("old"), group("new"));

        assert!(tsc.metrics(&group("old")).is_none());
        assert_eq!(tsc.get(&group("new"), &metric("x")), Some(&MetricValue::Bool(true)));
    }

    #[test]
    fn group_name_display_includes_tags() {
        let tags: Tags = [("host", "db1")].into_iter().collect();
        let name = GroupName::with_tags(["jvm", "memory"], tags);
        assert_eq!(name.to_string(), "jvm.memory{host=\"db1\"}");
    }

    #[test]
    fn same_value_compares_float_bits() {
        let zero = MetricValue::Float(0.0);
        let neg_zero = MetricValue::Float(-0.0);
        let nan = MetricValue::Float(f64::NAN);
        assert_eq!(zero, neg_zero);
        assert!(!zero.same_value(&neg_zero));
        assert_ne!(nan, nan.clone());
        assert!(nan.same_value(&nan.clone()));
        assert!(MetricValue::Int(3).same_value(&MetricValue::Int(3)));
        assert!(!MetricValue::Int(0).same_value(&zero));

        let bucket = |count: f64| HistogramBucket { floor: 0.0, ceil: 1.0, count };
        let h = |count: f64| MetricValue::Histogram(Histogram::new(vec![bucket(count)]));
        assert!(h(f64::NAN).same_value(&h(f64::NAN)));
        assert!(!h(0.0).same_value(&h(-0.0)));
    }
}
