//! Backend contract, writer and replay tests.

use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use chrono::{DateTime, TimeZone, Utc};
use pretty_assertions::assert_eq;
use signalk_bus::Publisher;
use signalk_core::{Delta, PathValue, SingleValueMapped, Source, Update};
use signalk_protocol::codec::encode_delta;
use signalk_protocol::RawStamper;
use signalk_store::{
    group_deltas, replay, run_store_writer, DatabaseConfig, MemoryStore, SqliteStore, TimeRange,
    TimeSeriesStore,
};
use tokio::time::timeout;

const WAIT: Duration = Duration::from_secs(5);

fn at(secs: i64) -> DateTime<Utc> {
    Utc.timestamp_opt(1_714_560_000 + secs, 0).unwrap()
}

fn row(context: &str, path: &str, value: f64, secs: i64) -> SingleValueMapped {
    SingleValueMapped {
        context: context.to_string(),
        path: path.to_string(),
        value: serde_json::json!(value),
        timestamp: at(secs),
        source: Source::new("gps", "nmea0183"),
    }
}

fn check_contract(store: &dyn TimeSeriesStore) {
    let mut stamper = RawStamper::new("gps", "nmea0183");
    let raws = vec![
        stamper.stamp_at(at(0), Bytes::from_static(b"$IIHDT,1.0,T")).unwrap(),
        stamper.stamp_at(at(10), Bytes::from_static(b"$IIHDT,2.0,T")).unwrap(),
        stamper.stamp_at(at(20), Bytes::from_static(b"$IIHDT,3.0,T")).unwrap(),
    ];
    store.write_raw(&raws).unwrap();
    // a retried batch does not duplicate rows
    store.write_raw(&raws[..1]).unwrap();

    store
        .write_mapped(&[
            row("vessels.self", "navigation.headingTrue", 1.0, 0),
            row("vessels.self", "navigation.headingTrue", 2.0, 10),
            row("vessels.self", "navigation.speedOverGround", 3.5, 5),
            row("vessels.other", "navigation.headingTrue", 0.5, 20),
        ])
        .unwrap();

    let read = store.read_raw(TimeRange::all()).unwrap();
    assert_eq!(read, raws);
    let window = store.read_raw(TimeRange::between(at(5), at(20))).unwrap();
    assert_eq!(window.len(), 1);
    assert_eq!(window[0].payload, Bytes::from_static(b"$IIHDT,2.0,T"));

    let mapped = store.read_mapped(TimeRange::between(at(0), at(10))).unwrap();
    assert_eq!(mapped.len(), 2);
    assert_eq!(mapped[0].timestamp, at(0));
    assert_eq!(mapped[1].path, "navigation.speedOverGround");

    let latest = store.latest_mapped().unwrap();
    assert_eq!(
        latest
            .iter()
            .map(|v| (v.context.as_str(), v.path.as_str(), v.value.as_f64().unwrap()))
            .collect::<Vec<_>>(),
        vec![
            ("vessels.other", "navigation.headingTrue", 0.5),
            ("vessels.self", "navigation.headingTrue", 2.0),
            ("vessels.self", "navigation.speedOverGround", 3.5),
        ]
    );

    let deleted = store.delete(TimeRange::before(at(10))).unwrap();
    assert_eq!(deleted, 1 + 2);
    assert_eq!(store.read_raw(TimeRange::all()).unwrap().len(), 2);
    assert_eq!(store.read_mapped(TimeRange::all()).unwrap().len(), 2);
}

#[test]
fn test_sqlite_contract() {
    check_contract(&SqliteStore::open_in_memory().unwrap());
}

#[test]
fn test_memory_contract() {
    check_contract(&MemoryStore::new());
}

#[test]
fn test_group_deltas_rebuilds_updates() {
    let deltas = group_deltas(vec![
        row("vessels.self", "a", 1.0, 0),
        row("vessels.self", "b", 2.0, 0),
        row("vessels.self", "a", 3.0, 1),
        row("vessels.other", "a", 4.0, 1),
    ]);
    assert_eq!(deltas.len(), 3);
    assert_eq!(deltas[0].updates[0].values.len(), 2);
    assert_eq!(deltas[2].context, "vessels.other");
}

fn delta(value: f64, secs: i64) -> Delta {
    Delta::single(
        "vessels.self",
        Update {
            source: Source::new("gps", "nmea0183"),
            timestamp: at(secs),
            values: vec![
                PathValue {
                    path: "navigation.headingTrue".to_string(),
                    value: serde_json::json!(value),
                },
                PathValue {
                    path: "navigation.speedOverGround".to_string(),
                    value: serde_json::json!(value * 2.0),
                },
            ],
        },
    )
}

#[tokio::test]
async fn test_writer_persists_both_buses_then_replays() {
    let store = Arc::new(SqliteStore::open_in_memory().unwrap());
    let raw_bus = Publisher::new(100);
    let mapped_bus = Publisher::new(100);
    let config = DatabaseConfig {
        workers: 3,
        batch_flush_length: 4,
        ..DatabaseConfig::default()
    };

    let writer = tokio::spawn({
        let store = store.clone();
        let raw = raw_bus.subscribe();
        let mapped = mapped_bus.subscribe();
        async move { run_store_writer(Some(raw), Some(mapped), store, &config).await }
    });

    let mut stamper = RawStamper::new("gps", "nmea0183");
    for i in 0..5 {
        let raw = stamper.stamp_at(at(i), format!("$IIHDT,{i}.0,T")).unwrap();
        raw_bus.publish(raw.encode().unwrap()).unwrap();
        mapped_bus
            .publish(encode_delta(&delta(i as f64, i)).unwrap().into())
            .unwrap();
    }
    raw_bus.close();
    mapped_bus.close();

    let stats = timeout(WAIT, writer).await.unwrap().unwrap();
    assert_eq!(stats.received, 5 + 10);
    assert_eq!(stats.written, 15);
    assert_eq!(stats.lost_records, 0);

    // replay the stored window back onto fresh publishers
    let raw_out = Publisher::new(100);
    let mapped_out = Publisher::new(100);
    let raw_sub = raw_out.subscribe();
    let mapped_sub = mapped_out.subscribe();
    let replayed = replay(
        store,
        TimeRange::between(at(1), at(4)),
        Some(&raw_out),
        Some(&mapped_out),
    )
    .await
    .unwrap();
    assert_eq!(replayed.raw, 3);
    assert_eq!(replayed.mapped, 3);
    raw_out.close();
    mapped_out.close();

    let first = raw_sub.recv_raw().await.unwrap();
    assert_eq!(first.timestamp, at(1));
    assert_eq!(first.connector, "gps");

    let mut deltas = Vec::new();
    while let Some(d) = mapped_sub.recv_delta().await {
        deltas.push(d);
    }
    assert_eq!(deltas, vec![delta(1.0, 1), delta(2.0, 2), delta(3.0, 3)]);
}
