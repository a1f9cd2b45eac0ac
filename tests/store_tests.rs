use proptest::prelude::*;
use std::collections::BTreeMap;
use std::fs;
use std::path::Path;
use std::sync::{Arc, Mutex};
use tempfile::tempdir;

use monsoon_history::{
    ColumnMajorStore, ColumnMajorStoreBuilder, GroupName, HistoryConfig, HistoryError,
    HistoryEvent, HistoryEventListener, MetricName, MetricValue, Tags, TimeSeriesCollection,
    Timestamp, TmpFileCompression,
};

fn make_config(dir: &Path, compression: TmpFileCompression, parallel: bool) -> HistoryConfig {
    let mut cfg = HistoryConfig::default();
    cfg.tmp_dir = Some(dir.to_path_buf());
    cfg.compression = compression;
    cfg.parallel_ingest = parallel;
    cfg
}

fn group(i: u8) -> GroupName {
    let tags: Tags = [("host", format!("h{}", i % 2))].into_iter().collect();
    GroupName::with_tags(["svc".to_string(), format!("g{}", i)], tags)
}

fn metric(i: u8) -> MetricName {
    MetricName::new(["m".to_string(), format!("{}", i)])
}

fn files_in(dir: &Path) -> Vec<fs::DirEntry> {
    fs::read_dir(dir).unwrap().map(|e| e.unwrap()).collect()
}

/// Expected `ts -> value` per (group, metric), computed straight from the input.
fn expected_columns(
    input: &[TimeSeriesCollection],
) -> BTreeMap<(GroupName, MetricName), BTreeMap<Timestamp, MetricValue>> {
    let mut out: BTreeMap<_, BTreeMap<_, _>> = BTreeMap::new();
    for tsc in input {
        for (g, m, v) in tsc.values() {
            out.entry((g.clone(), m.clone()))
                .or_default()
                .insert(tsc.timestamp(), v.clone());
        }
    }
    out
}

/// Value-for-value comparison where floats compare by bits.
fn same_column(
    a: &BTreeMap<Timestamp, MetricValue>,
    b: &BTreeMap<Timestamp, MetricValue>,
) -> bool {
    a.len() == b.len()
        && a.iter()
            .zip(b)
            .all(|((ta, va), (tb, vb))| ta == tb && va.same_value(vb))
}

fn same_collection(a: &TimeSeriesCollection, b: &TimeSeriesCollection) -> bool {
    a.timestamp() == b.timestamp()
        && a.values().count() == b.values().count()
        && a.values()
            .zip(b.values())
            .all(|((ga, ma, va), (gb, mb, vb))| ga == gb && ma == mb && va.same_value(vb))
}

fn value_strategy() -> impl Strategy<Value = MetricValue> {
    prop_oneof![
        (0i64..3).prop_map(MetricValue::Int),
        any::<f64>().prop_map(MetricValue::Float),
        prop::sample::select(vec![0.0, -0.0, f64::NAN, -f64::NAN, f64::INFINITY])
            .prop_map(MetricValue::Float),
        any::<bool>().prop_map(MetricValue::Bool),
        prop::sample::select(vec!["up", "down", "degraded"]).prop_map(MetricValue::from),
        Just(MetricValue::Empty),
    ]
}

proptest! {
    #![proptest_config(ProptestConfig {
        cases: 32,
        max_shrink_iters: 1000,
        .. ProptestConfig::default()
    })]

    #[test]
    fn prop_store_roundtrips_every_value(
        rows in prop::collection::vec(
            prop::collection::vec((0u8..4, 0u8..3, value_strategy()), 0..8),
            0..60
        ),
        lz4 in any::<bool>(),
        parallel in any::<bool>(),
    ) {
        let dir = tempdir().unwrap();
        let compression = if lz4 { TmpFileCompression::Lz4 } else { TmpFileCompression::None };
        let cfg = make_config(dir.path(), compression, parallel);

        let input: Vec<TimeSeriesCollection> = rows
            .into_iter()
            .enumerate()
            .map(|(i, values)| {
                TimeSeriesCollection::from_values(
                    1_000 * i as Timestamp,
                    values.into_iter().map(|(g, m, v)| (group(g), metric(m), v)),
                )
            })
            .collect();

        let store = ColumnMajorStore::from_collections(&cfg, &input).unwrap();

        let axis: Vec<Timestamp> = input.iter().map(|c| c.timestamp()).collect();
        prop_assert_eq!(store.timestamps(), axis.as_slice());

        let expected = expected_columns(&input);
        for ((g, m), values) in &expected {
            let stored = store.metric_values(g, m).to_map().unwrap();
            prop_assert!(same_column(&stored, values), "{}/{}: {:?} != {:?}", g, m, stored, values);
        }
        let stored_columns: usize = store
            .group_names()
            .into_iter()
            .map(|g| store.metric_names(g).len())
            .sum();
        prop_assert_eq!(stored_columns, expected.len());

        let rebuilt: Vec<TimeSeriesCollection> =
            store.iter_collections().collect::<Result<_, _>>().unwrap();
        prop_assert_eq!(rebuilt.len(), input.len());
        for (r, i) in rebuilt.iter().zip(&input) {
            prop_assert!(same_collection(r, i), "{:?} != {:?}", r, i);
        }
    }
}

#[test]
fn test_signed_zero_and_nan_are_stored_exactly() {
    let dir = tempdir().unwrap();
    let cfg = make_config(dir.path(), TmpFileCompression::None, true);
    let floats = [0.0, -0.0, -0.0, f64::NAN, f64::NAN, 0.0];
    let input: Vec<_> = floats
        .iter()
        .enumerate()
        .map(|(t, &f)| {
            TimeSeriesCollection::from_values(
                t as Timestamp,
                vec![(group(0), metric(0), MetricValue::Float(f))],
            )
        })
        .collect();
    let store = ColumnMajorStore::from_collections(&cfg, &input).unwrap();

    let bits: Vec<u64> = store
        .metric_values(&group(0), &metric(0))
        .iter()
        .map(|r| match r.unwrap().1 {
            MetricValue::Float(f) => f.to_bits(),
            other => panic!("unexpected value {other:?}"),
        })
        .collect();
    assert_eq!(bits, floats.iter().map(|f| f.to_bits()).collect::<Vec<_>>());
}

#[test]
fn test_constant_metric_compacts_to_single_entry() {
    let dir = tempdir().unwrap();
    let cfg = make_config(dir.path(), TmpFileCompression::None, true);
    let input: Vec<_> = (0..1000u64)
        .map(|t| {
            TimeSeriesCollection::from_values(
                t * 10_000,
                vec![(group(0), metric(0), MetricValue::from("steady"))],
            )
        })
        .collect();
    let store = ColumnMajorStore::from_collections(&cfg, &input).unwrap();

    let files = files_in(dir.path());
    assert_eq!(files.len(), 1);
    // repeat + presence + one-string delta + value: far below one byte per slot.
    let size = files[0].metadata().unwrap().len();
    assert!(size < 32, "unexpected segment size {}", size);

    let values = store.metric_values(&group(0), &metric(0)).to_map().unwrap();
    assert_eq!(values.len(), 1000);
    assert!(values.values().all(|v| v == &MetricValue::from("steady")));
}

#[test]
fn test_every_segment_is_aligned_with_axis() {
    let dir = tempdir().unwrap();
    let cfg = make_config(dir.path(), TmpFileCompression::None, true);
    let mut builder = ColumnMajorStoreBuilder::with_config(&cfg);

    // g0 reports always, g1 only on even instants, g2 appears late and stops early.
    for t in 0..50u64 {
        let mut tsc = TimeSeriesCollection::new(t * 1000);
        tsc.add_metric(group(0), metric(0), MetricValue::Int(t as i64));
        if t % 2 == 0 {
            tsc.add_metric(group(1), metric(1), MetricValue::Float(t as f64 / 2.0));
        }
        if (20..30).contains(&t) {
            tsc.add_metric(group(2), metric(2), MetricValue::Bool(t % 3 == 0));
        }
        builder.with(&tsc).unwrap();
    }
    // Trailing instants without any values still extend the axis.
    builder.with(&TimeSeriesCollection::new(50_000)).unwrap();
    builder.with(&TimeSeriesCollection::new(51_000)).unwrap();
    assert_eq!(builder.len(), 52);

    let store = builder.build().unwrap();
    assert_eq!(store.timestamps().len(), 52);

    let g1 = store.metric_values(&group(1), &metric(1)).to_map().unwrap();
    assert_eq!(g1.len(), 25);
    assert!(g1.keys().all(|ts| (ts / 1000) % 2 == 0));

    let g2: Vec<Timestamp> = store
        .metric_values(&group(2), &metric(2))
        .iter()
        .map(|r| r.unwrap().0)
        .collect();
    assert_eq!(g2, (20..30u64).map(|t| t * 1000).collect::<Vec<_>>());
    assert_eq!(
        store.group_timestamps(&group(2)).into_iter().collect::<Vec<_>>(),
        g2
    );

    for tsc in store.iter_collections() {
        let tsc = tsc.unwrap();
        assert!(tsc.timestamp() >= 50_000 || tsc.get(&group(0), &metric(0)).is_some());
    }
}

#[test]
fn test_parallel_and_sequential_ingestion_agree() {
    let input: Vec<_> = (0..300u64)
        .map(|t| {
            let mut tsc = TimeSeriesCollection::new(t * 500);
            for g in 0..6u8 {
                for m in 0..6u8 {
                    let salt = t + u64::from(g) * 7 + u64::from(m) * 13;
                    if salt % 5 == 0 {
                        continue;
                    }
                    let value = match m % 3 {
                        0 => MetricValue::Int((salt / 4) as i64 % 4),
                        1 => MetricValue::from(format!("s{}", salt % 3)),
                        _ => MetricValue::Float((salt % 7) as f64),
                    };
                    tsc.add_metric(group(g), metric(m), value);
                }
            }
            tsc
        })
        .collect();

    let par_dir = tempdir().unwrap();
    let seq_dir = tempdir().unwrap();
    let par = ColumnMajorStore::from_collections(
        &make_config(par_dir.path(), TmpFileCompression::Lz4, true),
        &input,
    )
    .unwrap();
    let seq = ColumnMajorStore::from_collections(
        &make_config(seq_dir.path(), TmpFileCompression::None, false),
        &input,
    )
    .unwrap();

    assert_eq!(par.timestamps(), seq.timestamps());
    assert_eq!(par.group_names(), seq.group_names());
    for g in seq.group_names() {
        assert_eq!(par.metric_names(g), seq.metric_names(g));
        for m in seq.metric_names(g) {
            assert_eq!(
                par.metric_values(g, m).to_map().unwrap(),
                seq.metric_values(g, m).to_map().unwrap(),
                "column {}/{} differs",
                g,
                m
            );
        }
    }
}

#[test]
fn test_temp_files_live_as_long_as_any_store_handle() {
    let dir = tempdir().unwrap();
    let cfg = make_config(dir.path(), TmpFileCompression::None, true);
    let input: Vec<_> = (0..10u64)
        .map(|t| {
            TimeSeriesCollection::from_values(
                t,
                vec![
                    (group(0), metric(0), MetricValue::Int(t as i64)),
                    (group(1), metric(0), MetricValue::Int(1)),
                ],
            )
        })
        .collect();

    let store = ColumnMajorStore::from_collections(&cfg, &input).unwrap();
    assert_eq!(files_in(dir.path()).len(), 2);

    let copy = store.clone();
    drop(store);
    assert_eq!(files_in(dir.path()).len(), 2);
    assert_eq!(
        copy.metric_values(&group(0), &metric(0)).get(9).unwrap(),
        Some(MetricValue::Int(9))
    );

    drop(copy);
    assert!(files_in(dir.path()).is_empty());
}

#[test]
fn test_unwritable_tmp_dir_fails_ingestion_and_build() {
    let dir = tempdir().unwrap();
    let missing = dir.path().join("does-not-exist");
    let cfg = make_config(&missing, TmpFileCompression::None, true);
    let mut builder = ColumnMajorStoreBuilder::with_config(&cfg);

    // Writers only touch disk when a run is flushed: the second distinct value forces it.
    builder
        .with(&TimeSeriesCollection::from_values(0, vec![(group(0), metric(0), MetricValue::Int(1))]))
        .unwrap();
    let err = builder
        .with(&TimeSeriesCollection::from_values(1, vec![(group(0), metric(0), MetricValue::Int(2))]))
        .unwrap_err();
    assert!(matches!(err, HistoryError::Io(_)), "got {err:?}");

    assert!(builder.with(&TimeSeriesCollection::new(2)).is_err());
    assert!(builder.build().is_err());
}

#[derive(Debug, Default)]
struct RecordingListener {
    events: Mutex<Vec<HistoryEvent>>,
}

impl HistoryEventListener for RecordingListener {
    fn on_event(&self, event: HistoryEvent) {
        self.events.lock().unwrap().push(event);
    }
}

#[test]
fn test_store_lifecycle_emits_events() {
    let dir = tempdir().unwrap();
    let listener = Arc::new(RecordingListener::default());
    let cfg = make_config(dir.path(), TmpFileCompression::None, true)
        .with_event_listener(listener.clone());

    let input = vec![TimeSeriesCollection::from_values(
        5,
        vec![
            (group(0), metric(0), MetricValue::Bool(true)),
            (group(0), metric(1), MetricValue::Bool(false)),
        ],
    )];
    let store = ColumnMajorStore::from_collections(&cfg, &input).unwrap();
    drop(store);

    let events = listener.events.lock().unwrap();
    let created = events
        .iter()
        .filter(|e| matches!(e, HistoryEvent::TmpFileCreated { .. }))
        .count();
    let released = events
        .iter()
        .filter(|e| matches!(e, HistoryEvent::TmpFileReleased { .. }))
        .count();
    assert_eq!(created, 2);
    assert_eq!(released, 2);
    assert!(events.iter().any(|e| matches!(
        e,
        HistoryEvent::StoreBuilt { timestamps: 1, groups: 1, metrics: 2, .. }
    )));
}
