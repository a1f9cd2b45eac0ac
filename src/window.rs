//! Sliding window over a chronological stream of collections.
//!
//! Every item is emitted together with the collections seen within `look_back` before it and
//! `look_forward` after it. When context exists on both sides, groups missing from the current
//! collection can be synthesised from their nearest neighbours.

use crate::config::WindowConfig;
use crate::types::{GroupMetrics, GroupName, MetricName, MetricValue, Timestamp, TimeSeriesCollection};

use std::collections::{BTreeSet, VecDeque};
use std::convert::Infallible;
use std::sync::Arc;
use std::time::Duration;

/// Infallible source adapter used by [`WindowedIterator::from_collections`].
pub type InfallibleSource<J> =
    std::iter::Map<J, fn(TimeSeriesCollection) -> Result<TimeSeriesCollection, Infallible>>;

pub struct WindowedIterator<I: Iterator> {
    source: I,
    lookahead: Option<I::Item>,
    exhausted: bool,
    /// Most recent first.
    past: VecDeque<Arc<TimeSeriesCollection>>,
    /// Oldest first.
    future: VecDeque<Arc<TimeSeriesCollection>>,
    look_back: u64,
    look_forward: u64,
}

fn duration_ms(d: Duration) -> u64 {
    u64::try_from(d.as_millis()).unwrap_or(u64::MAX)
}

impl<I, E> WindowedIterator<I>
where
    I: Iterator<Item = Result<TimeSeriesCollection, E>>,
{
    /// `source` must yield collections in chronological order with unique timestamps.
    pub fn new(source: I, look_back: Duration, look_forward: Duration) -> Self {
        WindowedIterator {
            source,
            lookahead: None,
            exhausted: false,
            past: VecDeque::new(),
            future: VecDeque::new(),
            look_back: duration_ms(look_back),
            look_forward: duration_ms(look_forward),
        }
    }

    pub fn with_config(source: I, cfg: &WindowConfig) -> Self {
        Self::new(source, cfg.look_back, cfg.look_forward)
    }

    /// True while another item (or source error) is pending.
    pub fn has_next(&mut self) -> bool {
        !self.future.is_empty() || self.peek_source()
    }

    pub fn look_back(&self) -> Duration {
        Duration::from_millis(self.look_back)
    }

    pub fn look_forward(&self) -> Duration {
        Duration::from_millis(self.look_forward)
    }

    fn peek_source(&mut self) -> bool {
        if self.lookahead.is_none() && !self.exhausted {
            self.lookahead = self.source.next();
            self.exhausted = self.lookahead.is_none();
        }
        self.lookahead.is_some()
    }

    fn pull(&mut self) -> Option<I::Item> {
        self.peek_source();
        self.lookahead.take()
    }
}

impl<J> WindowedIterator<InfallibleSource<J>>
where
    J: Iterator<Item = TimeSeriesCollection>,
{
    pub fn from_collections<C>(collections: C, look_back: Duration, look_forward: Duration) -> Self
    where
        C: IntoIterator<Item = TimeSeriesCollection, IntoIter = J>,
    {
        let ok: fn(TimeSeriesCollection) -> Result<TimeSeriesCollection, Infallible> = Ok;
        WindowedIterator::new(collections.into_iter().map(ok), look_back, look_forward)
    }
}

impl<I, E> Iterator for WindowedIterator<I>
where
    I: Iterator<Item = Result<TimeSeriesCollection, E>>,
{
    type Item = Result<WindowedCollection, E>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.future.is_empty() {
            match self.pull()? {
                Ok(tsc) => self.future.push_back(Arc::new(tsc)),
                Err(e) => return Some(Err(e)),
            }
        }
        let cur = self.future.pop_front()?;
        let ts = cur.timestamp();

        let oldest = ts.saturating_sub(self.look_back);
        while self.past.back().is_some_and(|p| p.timestamp() < oldest) {
            self.past.pop_back();
        }

        // Errors and out-of-window items stay in the lookahead until the window drains.
        let newest = ts.saturating_add(self.look_forward);
        while self.peek_source() {
            match &self.lookahead {
                Some(Ok(next)) if next.timestamp() <= newest => {}
                _ => break,
            }
            if let Some(Ok(next)) = self.lookahead.take() {
                self.future.push_back(Arc::new(next));
            }
        }

        let item = if !self.past.is_empty() && !self.future.is_empty() {
            WindowedCollection::Interpolated(InterpolatedCollection {
                cur: Arc::clone(&cur),
                past: self.past.iter().cloned().collect(),
                future: self.future.iter().cloned().collect(),
            })
        } else {
            WindowedCollection::Present(Arc::clone(&cur))
        };
        self.past.push_front(cur);
        Some(Ok(item))
    }
}

/// One step of a [`WindowedIterator`].
#[derive(Debug, Clone)]
pub enum WindowedCollection {
    /// No context on one of the sides: the collection as ingested.
    Present(Arc<TimeSeriesCollection>),
    Interpolated(InterpolatedCollection),
}

impl WindowedCollection {
    pub fn timestamp(&self) -> Timestamp {
        match self {
            WindowedCollection::Present(c) => c.timestamp(),
            WindowedCollection::Interpolated(c) => c.timestamp(),
        }
    }

    pub fn is_interpolated(&self) -> bool {
        matches!(self, WindowedCollection::Interpolated(_))
    }

    pub fn group_names(&self) -> BTreeSet<GroupName> {
        match self {
            WindowedCollection::Present(c) => c.group_names().cloned().collect(),
            WindowedCollection::Interpolated(c) => c.group_names(),
        }
    }

    pub fn metrics(&self, group: &GroupName) -> Option<GroupMetrics> {
        match self {
            WindowedCollection::Present(c) => c.metrics(group).cloned(),
            WindowedCollection::Interpolated(c) => c.metrics(group),
        }
    }

    pub fn get(&self, group: &GroupName, metric: &MetricName) -> Option<MetricValue> {
        match self {
            WindowedCollection::Present(c) => c.get(group, metric).cloned(),
            WindowedCollection::Interpolated(c) => c.get(group, metric),
        }
    }

    pub fn to_collection(&self) -> TimeSeriesCollection {
        match self {
            WindowedCollection::Present(c) => TimeSeriesCollection::clone(c),
            WindowedCollection::Interpolated(c) => c.to_collection(),
        }
    }
}

/// A collection with neighbours on both sides.
#[derive(Debug, Clone)]
pub struct InterpolatedCollection {
    cur: Arc<TimeSeriesCollection>,
    past: Vec<Arc<TimeSeriesCollection>>,
    future: Vec<Arc<TimeSeriesCollection>>,
}

impl InterpolatedCollection {
    pub fn timestamp(&self) -> Timestamp {
        self.cur.timestamp()
    }

    /// The collection as ingested.
    pub fn current(&self) -> &TimeSeriesCollection {
        &self.cur
    }

    /// Collections within the look-back window, most recent first.
    pub fn past(&self) -> &[Arc<TimeSeriesCollection>] {
        &self.past
    }

    /// Collections within the look-forward window, oldest first.
    pub fn future(&self) -> &[Arc<TimeSeriesCollection>] {
        &self.future
    }

    /// Groups of the current collection plus groups seen on both sides of it.
    pub fn group_names(&self) -> BTreeSet<GroupName> {
        let before: BTreeSet<&GroupName> = self.past.iter().flat_map(|c| c.group_names()).collect();
        let after: BTreeSet<&GroupName> = self.future.iter().flat_map(|c| c.group_names()).collect();
        self.cur
            .group_names()
            .chain(before.intersection(&after).copied())
            .cloned()
            .collect()
    }

    pub fn metrics(&self, group: &GroupName) -> Option<GroupMetrics> {
        if let Some(m) = self.cur.metrics(group) {
            return Some(m.clone());
        }
        let before = self.past.iter().find(|c| c.metrics(group).is_some())?;
        let after = self.future.iter().find(|c| c.metrics(group).is_some())?;
        let (before_metrics, after_metrics) = (before.metrics(group)?, after.metrics(group)?);

        let ts = self.timestamp();
        let metrics = before_metrics
            .iter()
            .filter_map(|(name, b)| {
                let a = after_metrics.get(name)?;
                let v = interpolate(ts, before.timestamp(), b, after.timestamp(), a);
                Some((name.clone(), v))
            })
            .collect();
        Some(metrics)
    }

    pub fn get(&self, group: &GroupName, metric: &MetricName) -> Option<MetricValue> {
        if self.cur.metrics(group).is_some() {
            return self.cur.get(group, metric).cloned();
        }
        self.metrics(group)?.remove(metric)
    }

    /// Materialises every group, synthesised ones included.
    pub fn to_collection(&self) -> TimeSeriesCollection {
        let mut tsc = TimeSeriesCollection::new(self.timestamp());
        for group in self.group_names() {
            if let Some(metrics) = self.metrics(&group) {
                tsc.add_metrics(group, metrics);
            }
        }
        tsc
    }
}

/// Value at `ts` between `before` (at `t0`) and `after` (at `t1`).
fn interpolate(ts: Timestamp, t0: Timestamp, before: &MetricValue, t1: Timestamp, after: &MetricValue) -> MetricValue {
    if let (Some(b), Some(a)) = (before.as_f64(), after.as_f64()) {
        let span = t1.saturating_sub(t0);
        if span == 0 {
            return before.clone();
        }
        let fraction = ts.saturating_sub(t0) as f64 / span as f64;
        let v = b + (a - b) * fraction;
        return match (before, after) {
            (MetricValue::Int(_), MetricValue::Int(_)) => MetricValue::Int(v.round() as i64),
            _ => MetricValue::Float(v),
        };
    }
    if ts.saturating_sub(t0) <= t1.saturating_sub(ts) {
        before.clone()
    } else {
        after.clone()
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
    fn numeric_values_interpolate_linearly() {
        assert_eq!(
            interpolate(15, 10, &MetricValue::Int(0), 20, &MetricValue::Int(5)),
            MetricValue::Int(3)
        );
        assert_eq!(
            interpolate(12, 10, &MetricValue::Int(0), 20, &MetricValue::Float(1.0)),
            MetricValue::Float(0.2)
        );
    }

    #[test]
    fn non_numeric_values_take_nearer_side() {
        let up = MetricValue::from("up");
        let down = MetricValue::from("down");
        assert_eq!(interpolate(12, 10, &up, 20, &down), up);
        assert_eq!(interpolate(18, 10, &up, 20, &down), down);
        assert_eq!(interpolate(15, 10, &up, 20, &down), up, "ties go to the past");
    }

    #[test]
    fn missing_group_is_synthesised_from_neighbours() {
        let g = group("g");
        let input = vec![
            TimeSeriesCollection::from_values(
                0,
                vec![
                    (g.clone(), metric("n"), MetricValue::Float(1.0)),
                    (g.clone(), metric("s"), MetricValue::from("a")),
                    (g.clone(), metric("only_before"), MetricValue::Int(1)),
                ],
            ),
            TimeSeriesCollection::from_values(
                30_000,
                vec![(group("other"), metric("x"), MetricValue::Bool(true))],
            ),
            TimeSeriesCollection::from_values(
                40_000,
                vec![
                    (g.clone(), metric("n"), MetricValue::Float(5.0)),
                    (g.clone(), metric("s"), MetricValue::from("b")),
                ],
            ),
        ];
        let mut it =
            WindowedIterator::from_collections(input, Duration::from_secs(60), Duration::from_secs(60));
        let _first = it.next().unwrap().unwrap();
        let middle = it.next().unwrap().unwrap();
        assert!(middle.is_interpolated());

        let tsc = middle.to_collection();
        assert_eq!(tsc.timestamp(), 30_000);
        assert_eq!(tsc.get(&g, &metric("n")), Some(&MetricValue::Float(4.0)));
        assert_eq!(tsc.get(&g, &metric("s")), Some(&MetricValue::from("b")));
        assert_eq!(tsc.get(&g, &metric("only_before")), None);
        assert_eq!(tsc.get(&group("other"), &metric("x")), Some(&MetricValue::Bool(true)));
    }

    #[test]
    fn source_error_surfaces_after_window_drains() {
        let source = vec![
            Ok(TimeSeriesCollection::new(0)),
            Ok(TimeSeriesCollection::new(1)),
            Err("broken"),
            Ok(TimeSeriesCollection::new(3)),
        ];
        let mut it = WindowedIterator::new(source.into_iter(), Duration::from_secs(1), Duration::from_secs(1));
        assert_eq!(it.next().unwrap().unwrap().timestamp(), 0);
        assert_eq!(it.next().unwrap().unwrap().timestamp(), 1);
        assert_eq!(it.next().unwrap().unwrap_err(), "broken");
        assert!(it.has_next());
        assert_eq!(it.next().unwrap().unwrap().timestamp(), 3);
        assert!(!it.has_next());
        assert!(it.next().is_none());
    }
}
