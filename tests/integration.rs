//! End-to-end ingest tests.

use chrono::{DateTime, Local, TimeZone};
use datalogger::{
    day_file_path, DayFile, Ingestor, LastValueCache, StateRecord, Value, ValueKind,
};
use proptest::prelude::*;
use serde_json::json;
use std::fs;
use std::path::PathBuf;
use tempfile::TempDir;

fn test_ingestor(dir: &TempDir) -> Ingestor {
    Ingestor::new(dir.path().join("hdf5"), dir.path().join("last_values.json"))
}

fn at(day: u32, h: u32, m: u32) -> DateTime<Local> {
    Local.with_ymd_and_hms(2026, 10, day, h, m, 0).unwrap()
}

fn day_path(ingestor: &Ingestor, day: u32) -> PathBuf {
    day_file_path(ingestor.output_dir(), at(day, 12, 0).date_naive())
}

// --- Scenarios ---

#[test]
fn test_first_value_is_appended() {
    let dir = TempDir::new().unwrap();
    let ingestor = test_ingestor(&dir);

    let stats = ingestor
        .ingest_at(&[StateRecord::new("sensor.temp", "21.5")], at(15, 12, 0))
        .unwrap();
    assert_eq!(stats.appended_points, 1);
    assert_eq!(stats.skipped_points, 0);
    assert_eq!(stats.file_path, day_path(&ingestor, 15));

    let ns = DayFile::read(&stats.file_path).unwrap();
    let series = ns.series("sensor.temp").unwrap();
    assert_eq!(series.kind(), ValueKind::Float);
    assert_eq!(series.len(), 1);
    assert_eq!(series.values().get(0), Some(Value::Float(21.5)));
    assert!(ns.resolve(&["sensor", "sensor.temp"]).is_some());
}

#[test]
fn test_unchanged_value_is_skipped() {
    let dir = TempDir::new().unwrap();
    let ingestor = test_ingestor(&dir);
    let batch = [StateRecord::new("sensor.temp", "21.5")];

    ingestor.ingest_at(&batch, at(15, 12, 0)).unwrap();
    let stats = ingestor.ingest_at(&batch, at(15, 12, 1)).unwrap();
    assert_eq!(stats.appended_points, 0);
    assert_eq!(stats.skipped_points, 1);

    let ns = DayFile::read(&stats.file_path).unwrap();
    assert_eq!(ns.series("sensor.temp").unwrap().len(), 1);
}

#[test]
fn test_non_numeric_value_on_float_series_stores_nan() {
    let dir = TempDir::new().unwrap();
    let ingestor = test_ingestor(&dir);

    ingestor
        .ingest_at(&[StateRecord::new("sensor.temp", "21.5")], at(15, 12, 0))
        .unwrap();
    let stats = ingestor
        .ingest_at(&[StateRecord::new("sensor.temp", "on")], at(15, 12, 1))
        .unwrap();
    assert_eq!(stats.appended_points, 1);

    let ns = DayFile::read(&stats.file_path).unwrap();
    let series = ns.series("sensor.temp").unwrap();
    assert_eq!(series.kind(), ValueKind::Float);
    assert_eq!(series.len(), 2);
    assert!(series.values().get(1).unwrap().as_f64().unwrap().is_nan());

    // The cache holds the raw value, so "on" again is a skip
    let stats = ingestor
        .ingest_at(&[StateRecord::new("sensor.temp", "on")], at(15, 12, 2))
        .unwrap();
    assert_eq!(stats.skipped_points, 1);
}

// --- Change detection ---

#[test]
fn test_mixed_batch_counts() {
    let dir = TempDir::new().unwrap();
    let ingestor = test_ingestor(&dir);

    ingestor
        .ingest_at(
            &[
                StateRecord::new("sensor.a", "1"),
                StateRecord::new("light.kitchen", "on"),
            ],
            at(15, 8, 0),
        )
        .unwrap();

    let stats = ingestor
        .ingest_at(
            &[
                StateRecord::new("sensor.a", "1"),
                StateRecord::new("light.kitchen", "off"),
                StateRecord::new("sensor.b", "7"),
                StateRecord::new("", "ignored"),
            ],
            at(15, 8, 1),
        )
        .unwrap();
    assert_eq!(stats.appended_points, 2);
    assert_eq!(stats.skipped_points, 1);

    let ns = DayFile::read(&stats.file_path).unwrap();
    let light = ns.series("light.kitchen").unwrap();
    assert_eq!(light.kind(), ValueKind::Text);
    assert_eq!(light.values().get(1).unwrap().as_text(), Some("off"));
    assert_eq!(ns.series_count(), 3);
    assert_eq!(ns.point_count(), 4);
}

#[test]
fn test_value_changing_back_is_appended() {
    let dir = TempDir::new().unwrap();
    let ingestor = test_ingestor(&dir);

    for (minute, value) in [(0, "1"), (1, "2"), (2, "1")] {
        let stats = ingestor
            .ingest_at(&[StateRecord::new("sensor.a", value)], at(15, 9, minute))
            .unwrap();
        assert_eq!(stats.appended_points, 1);
    }

    let ns = DayFile::read(day_path(&ingestor, 15)).unwrap();
    assert_eq!(ns.series("sensor.a").unwrap().len(), 3);
}

#[test]
fn test_unchanged_value_across_midnight_is_skipped() {
    let dir = TempDir::new().unwrap();
    let ingestor = test_ingestor(&dir);
    let batch = [
        StateRecord::new("sensor.temp", "21.5"),
        StateRecord::new("sensor.hum", "40"),
    ];

    ingestor.ingest_at(&batch, at(14, 23, 59)).unwrap();

    let next = [
        StateRecord::new("sensor.temp", "21.5"),
        StateRecord::new("sensor.hum", "41"),
    ];
    let stats = ingestor.ingest_at(&next, at(15, 0, 0)).unwrap();
    assert_eq!(stats.file_path, day_path(&ingestor, 15));
    assert_eq!(stats.appended_points, 1);
    assert_eq!(stats.skipped_points, 1);

    let today = DayFile::read(&stats.file_path).unwrap();
    assert!(today.series("sensor.temp").is_none());
    assert_eq!(today.series("sensor.hum").unwrap().len(), 1);

    let yesterday = DayFile::read(day_path(&ingestor, 14)).unwrap();
    assert_eq!(yesterday.series_count(), 2);
}

// --- Attributes and values ---

#[test]
fn test_static_attributes_are_recorded() {
    let dir = TempDir::new().unwrap();
    let ingestor = test_ingestor(&dir);

    let record = StateRecord::new("sensor.temp", "21.5")
        .with_attribute("unit_of_measurement", "°C")
        .with_attribute("friendly_name", "Living room")
        .with_attribute("rssi", -70);
    let stats = ingestor.ingest_at(&[record], at(15, 10, 0)).unwrap();

    let ns = DayFile::read(&stats.file_path).unwrap();
    let attrs = ns.attributes("sensor.temp").unwrap();
    assert_eq!(attrs["unit_of_measurement"], json!("°C"));
    assert_eq!(attrs["friendly_name"], json!("Living room"));
    assert_eq!(attrs["domain"], json!("sensor"));
    assert_eq!(attrs["entity_id"], json!("sensor.temp"));
    assert!(!attrs.contains_key("rssi"));
}

#[test]
fn test_attributes_are_overwritten() {
    let dir = TempDir::new().unwrap();
    let ingestor = test_ingestor(&dir);

    ingestor
        .ingest_at(
            &[StateRecord::new("sensor.temp", "1").with_attribute("friendly_name", "Old")],
            at(15, 10, 0),
        )
        .unwrap();
    let stats = ingestor
        .ingest_at(
            &[StateRecord::new("sensor.temp", "2").with_attribute("friendly_name", "New")],
            at(15, 10, 1),
        )
        .unwrap();

    let ns = DayFile::read(&stats.file_path).unwrap();
    assert_eq!(ns.attributes("sensor.temp").unwrap()["friendly_name"], json!("New"));
}

#[test]
fn test_long_text_is_truncated() {
    let dir = TempDir::new().unwrap();
    let ingestor = test_ingestor(&dir);

    let long = "ü".repeat(200);
    let stats = ingestor
        .ingest_at(&[StateRecord::new("input_text.note", long.as_str())], at(15, 11, 0))
        .unwrap();

    let ns = DayFile::read(&stats.file_path).unwrap();
    let stored = ns.series("input_text.note").unwrap().values().get(0).unwrap();
    let text = stored.as_text().unwrap();
    assert_eq!(text.len(), 256);
    assert!(long.starts_with(text));
}

#[test]
fn test_entity_without_dot_goes_to_unknown_domain() {
    let dir = TempDir::new().unwrap();
    let ingestor = test_ingestor(&dir);

    let stats = ingestor
        .ingest_at(&[StateRecord::new("sun", "above_horizon")], at(15, 11, 0))
        .unwrap();
    let ns = DayFile::read(&stats.file_path).unwrap();
    assert!(ns.resolve(&["unknown", "sun"]).is_some());
}

#[test]
fn test_records_from_state_api_json() {
    let dir = TempDir::new().unwrap();
    let ingestor = test_ingestor(&dir);

    let records: Vec<StateRecord> = serde_json::from_value(json!([
        {"entity_id": "sensor.temp", "state": "21.5",
         "attributes": {"unit_of_measurement": "°C"},
         "last_updated": "2026-10-15T10:00:00+00:00"},
        {"entity_id": "sensor.count", "state": 3, "attributes": null},
        {"entity_id": "sensor.none", "state": null}
    ]))
    .unwrap();

    let stats = ingestor.ingest_at(&records, at(15, 10, 0)).unwrap();
    assert_eq!(stats.appended_points, 3);

    let ns = DayFile::read(&stats.file_path).unwrap();
    assert_eq!(ns.series("sensor.count").unwrap().values().get(0), Some(Value::Float(3.0)));
    assert_eq!(ns.series("sensor.none").unwrap().kind(), ValueKind::Text);
}

// --- Cache ---

#[test]
fn test_cache_tracks_last_values() {
    let dir = TempDir::new().unwrap();
    let ingestor = test_ingestor(&dir);

    ingestor
        .ingest_at(
            &[
                StateRecord::new("sensor.a", "1"),
                StateRecord::new("sensor.b", "x"),
            ],
            at(15, 12, 0),
        )
        .unwrap();

    let values = LastValueCache::new(dir.path().join("last_values.json")).load();
    assert_eq!(values["sensor.a"], "1");
    assert_eq!(values["sensor.b"], "x");
}

#[test]
fn test_corrupt_cache_means_everything_appends() {
    let dir = TempDir::new().unwrap();
    let ingestor = test_ingestor(&dir);
    let batch = [StateRecord::new("sensor.a", "1")];

    ingestor.ingest_at(&batch, at(15, 12, 0)).unwrap();
    fs::write(ingestor.cache().path(), b"{\"sensor.a\": ").unwrap();

    let stats = ingestor.ingest_at(&batch, at(15, 12, 1)).unwrap();
    assert_eq!(stats.appended_points, 1);
    assert_eq!(stats.skipped_points, 0);

    // And the cache is healthy again afterwards
    let stats = ingestor.ingest_at(&batch, at(15, 12, 2)).unwrap();
    assert_eq!(stats.skipped_points, 1);
}

#[test]
fn test_unwritable_cache_does_not_fail_batch() {
    let dir = TempDir::new().unwrap();
    let cache_path = dir.path().join("last_values.json");
    fs::create_dir_all(cache_path.join("occupied")).unwrap();
    let ingestor = Ingestor::new(dir.path().join("hdf5"), &cache_path);

    let stats = ingestor
        .ingest_at(&[StateRecord::new("sensor.a", "1")], at(15, 12, 0))
        .unwrap();
    assert_eq!(stats.appended_points, 1);
}

// --- Properties ---

fn numeric_value() -> impl Strategy<Value = String> {
    (-1000i32..1000).prop_map(|n| format!("{}.{}", n, n.unsigned_abs() % 10))
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(24))]

    #[test]
    fn prop_series_grows_by_changes_only(values in proptest::collection::vec(numeric_value(), 1..12)) {
        let dir = TempDir::new().unwrap();
        let ingestor = test_ingestor(&dir);

        let mut expected = 0usize;
        let mut last: Option<&String> = None;
        for (i, value) in values.iter().enumerate() {
            let stats = ingestor
                .ingest_at(&[StateRecord::new("sensor.p", value.as_str())], at(15, 0, i as u32))
                .unwrap();
            let changed = last != Some(value);
            prop_assert_eq!(stats.appended_points, changed as u64);
            prop_assert_eq!(stats.skipped_points, (!changed) as u64);
            if changed {
                expected += 1;
            }
            last = Some(value);
        }

        let ns = DayFile::read(day_path(&ingestor, 15)).unwrap();
        let series = ns.series("sensor.p").unwrap();
        prop_assert_eq!(series.len(), expected);
        prop_assert_eq!(series.kind(), ValueKind::Float);
    }

    #[test]
    fn prop_kind_is_fixed_by_first_value(first in "x[a-z]{0,7}", rest in proptest::collection::vec(numeric_value(), 1..6)) {
        let dir = TempDir::new().unwrap();
        let ingestor = test_ingestor(&dir);

        ingestor
            .ingest_at(&[StateRecord::new("input_select.mode", first.as_str())], at(15, 1, 0))
            .unwrap();
        for (i, value) in rest.iter().enumerate() {
            ingestor
                .ingest_at(&[StateRecord::new("input_select.mode", value.as_str())], at(15, 1, 1 + i as u32))
                .unwrap();
        }

        let ns = DayFile::read(day_path(&ingestor, 15)).unwrap();
        prop_assert_eq!(ns.series("input_select.mode").unwrap().kind(), ValueKind::Text);
    }
}
