/*!
File-backed catalog behaviour across process restarts.
*/

use chrono::{TimeZone, Utc};
use snapkeep_core::catalog::CATALOG_FORMAT_VERSION;
use snapkeep_core::{
    open_catalog, Catalog, CatalogConfig, Engine, EngineSettings, FileCatalog, MemoryProvider,
    Snapshot, SnapkeepError,
};
use tempfile::TempDir;

fn snapshot(id: &str, instance_id: &str, hour: u32) -> Snapshot {
    Snapshot::new(
        id,
        instance_id,
        format!("{instance_id}-snapshot-{hour}"),
        Utc.with_ymd_and_hms(2020, 1, 1, hour, 0, 0).unwrap(),
    )
}

#[tokio::test]
async fn test_catalog_survives_reopen() {
    let temp_dir = TempDir::new().unwrap();
    let path = temp_dir.path().join("catalog.json");

    {
        let catalog = FileCatalog::open(&path);
        catalog.append(snapshot("ami-2", "i-1", 2)).await.unwrap();
        catalog.append(snapshot("ami-1", "i-1", 1)).await.unwrap();
        catalog.append(snapshot("ami-3", "i-2", 1)).await.unwrap();
        catalog.remove("ami-3").await.unwrap();
    }

    let reopened = FileCatalog::open(&path);
    let ids: Vec<_> = reopened
        .list("i-1")
        .await
        .unwrap()
        .into_iter()
        .map(|s| s.id)
        .collect();
    assert_eq!(ids, vec!["ami-1", "ami-2"]);
    assert!(reopened.list("i-2").await.unwrap().is_empty());

    let raw: serde_json::Value = serde_json::from_slice(&std::fs::read(&path).unwrap()).unwrap();
    assert_eq!(raw["format_version"], CATALOG_FORMAT_VERSION);
    assert_eq!(raw["next_seq"], 4);
}

#[tokio::test]
async fn test_newer_catalog_format_is_refused() {
    let temp_dir = TempDir::new().unwrap();
    let path = temp_dir.path().join("catalog.json");
    std::fs::write(
        &path,
        r#"{ "format_version": 99, "next_seq": 1, "instances": {} }"#,
    )
    .unwrap();

    let catalog = FileCatalog::open(&path);
    let err = catalog.all().await.unwrap_err();
    assert!(matches!(err, SnapkeepError::InvalidFormat(_)));

    let err = catalog.append(snapshot("ami-1", "i-1", 1)).await.unwrap_err();
    assert!(matches!(err, SnapkeepError::InvalidFormat(_)));
    assert!(std::fs::read_to_string(&path).unwrap().contains("99"));
}

#[tokio::test]
async fn test_engine_over_configured_file_catalog() {
    let temp_dir = TempDir::new().unwrap();
    let uri = temp_dir.path().join("state/catalog.json");
    let config = CatalogConfig::from_uri(uri.to_str().unwrap()).unwrap();

    let catalog = open_catalog(&config).await.unwrap();
    let engine = Engine::new(MemoryProvider::new(), catalog, EngineSettings::default()).unwrap();
    let report = engine.backup(["i-1", "i-2"]).await;
    assert_eq!(report.snapshots().count(), 2);

    let reopened = FileCatalog::open(&uri);
    let all = reopened.all().await.unwrap();
    assert_eq!(all.len(), 2);
    for snapshot in report.snapshots() {
        assert_eq!(
            reopened.get(&snapshot.id).await.unwrap().as_ref(),
            Some(snapshot)
        );
    }
}
