//! Integration tests for the offline index builder: file formats,
//! deterministic output, and cooperation with live stores.

use docshard::index::{FILTER_INDEX_SUFFIX, SEARCH_INDEX_SUFFIX};
use docshard::{DocumentOps, DocumentStore, IndexBuilder, Query, ShardedStore, StoreConfig};
use serde_json::{json, Value};
use tempfile::TempDir;

fn doc(value: Value) -> docshard::Document {
    value.as_object().unwrap().clone()
}

#[tokio::test]
async fn test_side_file_formats() {
    let dir = TempDir::new().unwrap();
    let config = StoreConfig::new().directory_path(dir.path()).store_name("pkg");
    let store = DocumentStore::open(&config).await.unwrap();
    store
        .insert_many(vec![
            doc(json!({
                "packageUId": "pkgA.1.0.0",
                "devices": ["R7FA6M3"],
                "description": "ADC sample",
                "paths": ["src/adc.c"]
            })),
            doc(json!({
                "packageUId": "pkgA.1.0.0",
                "devices": ["R7FA6M3", "R7FA4M1"],
                "description": "Timer sample"
            })),
        ])
        .await
        .unwrap();
    store.save().await.unwrap();

    let stats = IndexBuilder::new(&config)
        .build_file(&dir.path().join("pkg"))
        .await
        .unwrap();
    assert_eq!(stats.records, 2);
    assert_eq!(stats.tombstones, 0);

    let filter: Value = serde_json::from_str(
        &std::fs::read_to_string(dir.path().join(format!("pkg{FILTER_INDEX_SUFFIX}"))).unwrap(),
    )
    .unwrap();
    assert_eq!(filter["devices"]["R7FA6M3"], json!([0, 1]));
    assert_eq!(filter["devices"]["R7FA4M1"], json!([1]));
    assert_eq!(filter["packageUId"]["pkgA.1.0.0"], json!([0, 1]));
    assert_eq!(filter["paths"]["src/adc.c"], json!([0]));

    let search: Value = serde_json::from_str(
        &std::fs::read_to_string(dir.path().join(format!("pkg{SEARCH_INDEX_SUFFIX}"))).unwrap(),
    )
    .unwrap();
    assert_eq!(search["search"]["adc"], json!([0]));
    assert_eq!(search["search"]["sample"], json!([0, 1]));
    assert_eq!(search["search"]["timer"], json!([1]));
}

#[tokio::test]
async fn test_rebuild_is_byte_identical() {
    let dir = TempDir::new().unwrap();
    let config = StoreConfig::new().directory_path(dir.path()).store_name("pkg");
    let store = DocumentStore::open(&config).await.unwrap();
    store
        .insert_many(vec![
            doc(json!({"devices": ["Z", "A", "M"], "name": "zeta alpha"})),
            doc(json!({"devices": "A", "name": "beta"})),
        ])
        .await
        .unwrap();
    store.save().await.unwrap();

    let builder = IndexBuilder::new(&config);
    let input = dir.path().join("pkg");
    builder.build_file(&input).await.unwrap();
    let filter_first =
        std::fs::read(dir.path().join(format!("pkg{FILTER_INDEX_SUFFIX}"))).unwrap();
    let search_first =
        std::fs::read(dir.path().join(format!("pkg{SEARCH_INDEX_SUFFIX}"))).unwrap();

    builder.build_file(&input).await.unwrap();
    let filter_second =
        std::fs::read(dir.path().join(format!("pkg{FILTER_INDEX_SUFFIX}"))).unwrap();
    let search_second =
        std::fs::read(dir.path().join(format!("pkg{SEARCH_INDEX_SUFFIX}"))).unwrap();

    assert_eq!(filter_first, filter_second);
    assert_eq!(search_first, search_second);
}

#[tokio::test]
async fn test_build_directory_covers_all_shards() {
    let dir = TempDir::new().unwrap();
    let config = StoreConfig::new().directory_path(dir.path());
    let store = ShardedStore::open(&config).await.unwrap();
    store
        .insert_many(vec![
            doc(json!({"packageUId": "pkgA", "devices": "R7FA6M3"})),
            doc(json!({"packageUId": "pkgB", "devices": "R7FA4M1"})),
        ])
        .await
        .unwrap();
    store.save().await.unwrap();

    let stats = IndexBuilder::new(&config)
        .build_directory(dir.path())
        .await
        .unwrap();
    assert_eq!(stats.len(), 2);
    assert_eq!(stats["pkgA"].records, 1);
    assert_eq!(stats["pkgB"].records, 1);
    assert!(dir.path().join(format!("pkgA{FILTER_INDEX_SUFFIX}")).exists());
    assert!(dir.path().join(format!("pkgB{SEARCH_INDEX_SUFFIX}")).exists());

    // a reloaded sharded store answers indexed queries after loadIndices
    let reloaded = ShardedStore::open(&config).await.unwrap();
    reloaded.use_all().await.unwrap();
    reloaded.load_indices().await.unwrap();
    let q = Query::parse(&json!({"devices": "R7FA4M1"})).unwrap();
    let found = reloaded.find(&q).await.unwrap();
    assert_eq!(found.len(), 1);
    assert_eq!(found[0].get("packageUId"), Some(&json!("pkgB")));
}

#[tokio::test]
async fn test_builder_skips_tombstones_but_keeps_positions() {
    let dir = TempDir::new().unwrap();
    let config = StoreConfig::new().directory_path(dir.path()).store_name("pkg");
    let store = DocumentStore::open(&config).await.unwrap();
    store
        .insert_many(vec![
            doc(json!({"_id": 1, "devices": "R7FA6M3"})),
            doc(json!({"_id": 2, "devices": "R7FA6M3"})),
            doc(json!({"_id": 3, "devices": "R7FA6M3"})),
        ])
        .await
        .unwrap();
    store
        .remove(&Query::empty().eq("_id", json!(2)))
        .await
        .unwrap();
    store.save().await.unwrap();

    let stats = IndexBuilder::new(&config)
        .build_file(&dir.path().join("pkg"))
        .await
        .unwrap();
    assert_eq!(stats.records, 2);
    assert_eq!(stats.tombstones, 1);

    let filter: Value = serde_json::from_str(
        &std::fs::read_to_string(dir.path().join(format!("pkg{FILTER_INDEX_SUFFIX}"))).unwrap(),
    )
    .unwrap();
    // position 1 is the hole left by the removed document
    assert_eq!(filter["devices"]["R7FA6M3"], json!([0, 2]));
}

#[tokio::test]
async fn test_missing_input_yields_empty_indices() {
    let dir = TempDir::new().unwrap();
    let config = StoreConfig::new().directory_path(dir.path());
    let stats = IndexBuilder::new(&config)
        .build_file(&dir.path().join("absent"))
        .await
        .unwrap();
    assert_eq!(stats, docshard::BuildStats::default());
    assert!(dir
        .path()
        .join(format!("absent{FILTER_INDEX_SUFFIX}"))
        .exists());
}
