mod common;

use common::*;
use normcache::rusqlite::{params, Connection};
use normcache::{
    decode_record, encode_record, BackendKind, CacheError, CacheKey, CacheSettings, KeyPattern, Record, RecordCodecError, Scalar, Store, Value,
    Variables,
};
use serde_json::json;
use std::collections::BTreeMap;

fn settings(kind: BackendKind, lru_capacity: usize) -> CacheSettings {
    let path = match kind {
        BackendKind::Redb => temp_path("normcache_it", "redb"),
        _ => temp_path("normcache_it", "db"),
    };
    let mut settings = match kind {
        BackendKind::Redb => CacheSettings::redb(path),
        _ => CacheSettings::sqlite(path),
    };
    settings.store.lru_capacity = lru_capacity;
    settings
}

async fn survives_reopen(settings: CacheSettings) {
    let store = Store::open(&settings).unwrap();
    store.merge(scenario_a()).await.unwrap();
    store.close().unwrap();

    let reopened = Store::open(&settings).unwrap();
    let loaded = reopened.load_records(&[CacheKey::query_root(), CacheKey::new("Human:1000")]).await.unwrap();
    let expected: Vec<Option<Record>> = scenario_a().into_iter().map(Some).collect();
    // RecordSet iterates in key order: Human:1000 before QUERY_ROOT
    assert_eq!(loaded, vec![expected[1].clone(), expected[0].clone()]);
    assert_eq!(loaded[0].as_ref().and_then(|r| r.get("hero")), Some(&Value::reference("Human:1000")));

    let out = reopened.read_json(&hero_name(), CacheKey::query_root(), &Variables::new()).await.unwrap();
    assert_eq!(out.value, json!({"hero": {"name": "Luke Skywalker"}}));
    assert!(reopened.merge(scenario_a()).await.unwrap().is_empty());
}

#[tokio::test]
async fn sqlite_store_survives_reopen() {
    survives_reopen(settings(BackendKind::Sqlite, 0)).await;
}

#[tokio::test]
async fn sqlite_store_with_lru_survives_reopen() {
    survives_reopen(settings(BackendKind::Sqlite, 16)).await;
}

#[tokio::test]
async fn redb_store_survives_reopen() {
    survives_reopen(settings(BackendKind::Redb, 0)).await;
}

#[tokio::test]
async fn redb_store_with_lru_survives_reopen() {
    survives_reopen(settings(BackendKind::Redb, 16)).await;
}

#[test]
fn durable_backends_require_a_path() {
    let mut settings = CacheSettings::default();
    settings.store.backend = BackendKind::Sqlite;
    assert!(matches!(Store::open(&settings), Err(CacheError::Custom(_))));
}

fn corrupt(settings: &CacheSettings, key: &str, text: &str) {
    let path = settings.store.path.as_ref().unwrap();
    let raw = Connection::open(path).unwrap();
    raw.execute("INSERT OR REPLACE INTO records (key, record) VALUES (?1, ?2)", params![key, text]).unwrap();
}

#[tokio::test]
async fn undecodable_rows_are_reported_for_their_key_only() {
    let settings = settings(BackendKind::Sqlite, 0);
    let store = Store::open(&settings).unwrap();
    store.merge(scenario_a()).await.unwrap();
    corrupt(&settings, "Human:666", "{not json");

    let fine = store.load_records(&[CacheKey::new("Human:1000")]).await.unwrap();
    assert!(fine[0].is_some());
    let broken = store.load_records(&[CacheKey::new("Human:1000"), CacheKey::new("Human:666")]).await;
    assert!(matches!(broken, Err(CacheError::Codec(RecordCodecError::InvalidRecordEncoding { .. }))));

    let report = store.sweep(&[CacheKey::query_root()]).await.unwrap();
    assert_eq!(report.skipped, vec![CacheKey::new("Human:666")]);
    assert_eq!(report.reachable, 2);
    assert!(report.removed.is_empty());
}

#[tokio::test]
async fn merging_over_an_undecodable_row_replaces_it() {
    let settings = settings(BackendKind::Sqlite, 0);
    let store = Store::open(&settings).unwrap();
    store.merge(scenario_a()).await.unwrap();
    corrupt(&settings, "Human:1000", "[1, 2, 3]");

    let read = store.read_json(&hero_name(), CacheKey::query_root(), &Variables::new()).await;
    assert!(matches!(read, Err(CacheError::Codec(RecordCodecError::InvalidRecordShape { .. }))));

    let changed = store.merge(scenario_a()).await.unwrap();
    assert_eq!(changed.len(), 3);
    let out = store.read_json(&hero_name(), CacheKey::query_root(), &Variables::new()).await.unwrap();
    assert_eq!(out.value, json!({"hero": {"name": "Luke Skywalker"}}));
}

#[tokio::test]
async fn pattern_removal_and_clear_on_disk() {
    let mut settings = settings(BackendKind::Sqlite, 8);
    settings.store.vacuum_on_clear = true;
    let store = Store::open(&settings).unwrap();
    store.merge(scenario_a()).await.unwrap();

    assert_eq!(store.remove_records(&KeyPattern::new("human:*")).await.unwrap(), 1);
    let loaded = store.load_records(&[CacheKey::new("Human:1000")]).await.unwrap();
    assert!(loaded[0].is_none());

    store.clear().await.unwrap();
    assert_eq!(store.record_count().await.unwrap(), 0);
}

#[test]
fn records_round_trip_through_the_codec() {
    let mut address = BTreeMap::new();
    address.insert("city".to_string(), Value::string("Mos Eisley"));
    address.insert("coords".to_string(), Value::List(vec![Value::from(12), Value::from(-7)]));
    let mut record = Record::new("Human:1000");
    record.insert("name", "Luke Skywalker");
    record.insert("height", Value::Scalar(Scalar::Number(serde_json::Number::from_f64(1.72).unwrap())));
    record.insert("address", Value::Object(address));
    record.insert("friends", Value::List(vec![Value::reference("Human:1002"), Value::Null, Value::reference("Droid:2001")]));
    record.insert("ship", Value::reference("Starship:3000"));
    record.insert("nickname", "reference");

    let text = encode_record(&record).unwrap();
    assert_eq!(decode_record(record.key(), text.as_bytes()), Ok(record));
}
