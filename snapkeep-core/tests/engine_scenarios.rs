/*!
End-to-end engine scenarios against the in-memory provider.
*/

use async_trait::async_trait;
use chrono::{Duration as ChronoDuration, TimeZone, Utc};
use snapkeep_core::provider::ProviderResult;
use snapkeep_core::{
    BackupOutcome, Catalog, Engine, EngineSettings, MemoryCatalog, MemoryProvider, Provider,
    ProviderError, PruneOutcome, RetentionPolicy, Snapshot, SnapkeepError,
};
use snapkeep_retry::RetryPolicy;
use std::collections::BTreeSet;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

fn settings() -> EngineSettings {
    EngineSettings::default()
        .with_fan_out(1)
        .with_retry(RetryPolicy::immediate(3))
}

async fn seed(
    catalog: &MemoryCatalog,
    provider: &MemoryProvider,
    instance_id: &str,
    count: usize,
) {
    let base = Utc.with_ymd_and_hms(2020, 1, 1, 0, 0, 0).unwrap();
    for n in 1..=count {
        let id = format!("ami-{n}");
        let name = format!("{instance_id}-seed-{n}");
        provider.insert_image(&id, instance_id, &name);
        catalog
            .append(Snapshot::new(
                id,
                instance_id,
                name,
                base + ChronoDuration::days(n as i64),
            ))
            .await
            .unwrap();
    }
}

/// Creates the image, then stalls past the attempt timeout the first time
/// it is asked to image `slow_instance`
struct StallOnceProvider {
    inner: MemoryProvider,
    slow_instance: &'static str,
    stalled: AtomicBool,
}

#[async_trait]
impl Provider for StallOnceProvider {
    async fn create_image(&self, instance_id: &str, name: &str) -> ProviderResult<String> {
        let image_id = self.inner.create_image(instance_id, name).await?;
        if instance_id == self.slow_instance && !self.stalled.swap(true, Ordering::SeqCst) {
            tokio::time::sleep(Duration::from_secs(600)).await;
        }
        Ok(image_id)
    }

    async fn delete_image(&self, image_id: &str) -> ProviderResult<()> {
        self.inner.delete_image(image_id).await
    }

    async fn list_images(&self) -> ProviderResult<BTreeSet<String>> {
        self.inner.list_images().await
    }

    async fn find_image_by_name(&self, name: &str) -> ProviderResult<Option<String>> {
        self.inner.find_image_by_name(name).await
    }
}

#[tokio::test(start_paused = true)]
async fn test_timed_out_create_is_not_duplicated() {
    let provider = StallOnceProvider {
        inner: MemoryProvider::new(),
        slow_instance: "i-2",
        stalled: AtomicBool::new(false),
    };
    let settings = settings().with_retry(
        RetryPolicy::immediate(3).with_attempt_timeout(Duration::from_secs(30)),
    );
    let engine = Engine::new(provider, MemoryCatalog::in_memory(), settings).unwrap();

    let report = engine.backup(["i-1", "i-2"]).await;

    assert_eq!(report.snapshots().count(), 2);
    assert!(!report.has_failures());
    assert_eq!(engine.provider().inner.image_count(), 2);
    assert_eq!(engine.provider().inner.create_calls(), vec!["i-1", "i-2"]);
    for instance_id in ["i-1", "i-2"] {
        assert_eq!(engine.catalog().list(instance_id).await.unwrap().len(), 1);
    }
}

#[tokio::test]
async fn test_lost_create_response_is_adopted() {
    let provider = MemoryProvider::new();
    provider.lose_create_response("i-2");
    let engine = Engine::new(provider, MemoryCatalog::in_memory(), settings()).unwrap();

    let report = engine.backup(["i-1", "i-2"]).await;

    assert_eq!(report.snapshots().count(), 2);
    assert_eq!(engine.provider().image_count(), 2);
    assert_eq!(engine.provider().create_calls().len(), 2);
}

#[tokio::test]
async fn test_failure_for_one_instance_does_not_affect_another() {
    let provider = MemoryProvider::new();
    for _ in 0..3 {
        provider.fail_create("i-1", ProviderError::transient("RequestLimitExceeded"));
    }
    let engine = Engine::new(provider, MemoryCatalog::in_memory(), settings()).unwrap();

    let report = engine.backup(["i-1", "i-2"]).await;

    match &report.outcomes[0] {
        BackupOutcome::Failed { instance_id, error } => {
            assert_eq!(instance_id, "i-1");
            assert!(matches!(error, SnapkeepError::RetriesExhausted { attempts: 3, .. }));
        }
        other => panic!("unexpected outcome for i-1: {other:?}"),
    }
    assert!(report.outcomes[1].is_created());
    assert!(engine.catalog().list("i-1").await.unwrap().is_empty());
    assert_eq!(engine.catalog().list("i-2").await.unwrap().len(), 1);
}

#[tokio::test]
async fn test_every_created_snapshot_is_cataloged() {
    let engine = Engine::new(
        MemoryProvider::new(),
        MemoryCatalog::in_memory(),
        EngineSettings::default().with_fan_out(4),
    )
    .unwrap();
    let instances: Vec<String> = (0..12).map(|n| format!("i-{n}")).collect();

    let report = engine.backup(&instances).await;

    assert_eq!(report.outcomes.len(), 12);
    for (outcome, instance_id) in report.outcomes.iter().zip(&instances) {
        assert_eq!(outcome.instance_id(), instance_id);
    }
    for snapshot in report.snapshots() {
        let listed = engine.catalog().list(&snapshot.instance_id).await.unwrap();
        assert!(listed.contains(snapshot));
    }
}

#[tokio::test]
async fn test_retention_removes_two_oldest_of_five() {
    let provider = MemoryProvider::new();
    let catalog = MemoryCatalog::in_memory();
    seed(&catalog, &provider, "i-1", 5).await;
    let engine = Engine::new(provider, catalog, settings()).unwrap();

    let report = engine
        .enforce(&RetentionPolicy::new(3).unwrap(), "i-1")
        .await
        .unwrap();

    let removed: Vec<_> = report.removed().map(|s| s.id.as_str()).collect();
    assert_eq!(removed, vec!["ami-1", "ami-2"]);
    assert_eq!(engine.provider().delete_calls(), vec!["ami-1", "ami-2"]);

    let kept: Vec<_> = engine
        .catalog()
        .list("i-1")
        .await
        .unwrap()
        .into_iter()
        .map(|s| s.id)
        .collect();
    assert_eq!(kept, vec!["ami-3", "ami-4", "ami-5"]);
}

#[tokio::test]
async fn test_retention_below_limit_is_a_noop() {
    let provider = MemoryProvider::new();
    let catalog = MemoryCatalog::in_memory();
    seed(&catalog, &provider, "i-1", 2).await;
    let engine = Engine::new(provider, catalog, settings()).unwrap();

    let report = engine
        .enforce(&RetentionPolicy::new(3).unwrap(), "i-1")
        .await
        .unwrap();

    assert!(report.outcomes.is_empty());
    assert!(engine.provider().delete_calls().is_empty());
}

#[tokio::test]
async fn test_retention_keeps_entry_when_provider_delete_fails() {
    let provider = MemoryProvider::new();
    let catalog = MemoryCatalog::in_memory();
    seed(&catalog, &provider, "i-1", 3).await;
    for _ in 0..3 {
        provider.fail_delete("ami-1", ProviderError::transient("InternalError"));
    }
    let engine = Engine::new(provider, catalog, settings()).unwrap();

    let report = engine
        .enforce(&RetentionPolicy::new(2).unwrap(), "i-1")
        .await
        .unwrap();

    assert!(matches!(
        report.outcomes.as_slice(),
        [PruneOutcome::Failed { .. }]
    ));
    assert!(engine.catalog().get("ami-1").await.unwrap().is_some());
    assert_eq!(engine.provider().image_count(), 3);
}

#[tokio::test]
async fn test_enforce_all_reaches_every_instance() {
    let provider = MemoryProvider::new();
    let catalog = MemoryCatalog::in_memory();
    let base = Utc.with_ymd_and_hms(2020, 1, 1, 0, 0, 0).unwrap();
    for instance in ["i-1", "i-2", "i-3"] {
        for n in 1..=4 {
            let id = format!("{instance}-ami-{n}");
            provider.insert_image(&id, instance, &id);
            catalog
                .append(Snapshot::new(&id, instance, &id, base + ChronoDuration::hours(n)))
                .await
                .unwrap();
        }
    }
    let engine =
        Engine::new(provider, catalog, EngineSettings::default().with_fan_out(2)).unwrap();

    let batch = engine
        .enforce_all(&RetentionPolicy::new(1).unwrap())
        .await
        .unwrap();

    assert_eq!(batch.reports.len(), 3);
    assert_eq!(batch.removed_count(), 9);
    assert!(!batch.has_failures());
    for (instance_id, snapshots) in engine.catalog().all().await.unwrap() {
        assert_eq!(snapshots.len(), 1, "{instance_id} keeps only its newest");
        assert_eq!(snapshots[0].id, format!("{instance_id}-ami-4"));
    }
}

#[tokio::test]
async fn test_reconcile_removes_orphan_only() {
    let provider = MemoryProvider::new();
    let catalog = MemoryCatalog::in_memory();
    seed(&catalog, &provider, "i-1", 2).await;
    provider.insert_image("ami-9", "i-1", "manual");
    let engine = Engine::new(provider, catalog, settings()).unwrap();

    let report = engine.reconcile().await.unwrap();

    assert_eq!(report.orphans_removed, vec!["ami-9"]);
    assert!(report.dangling_found.is_empty());
    assert!(!report.has_failures());
    let expected: BTreeSet<String> = ["ami-1", "ami-2"].iter().map(|s| s.to_string()).collect();
    assert_eq!(engine.provider().image_ids(), expected);
}

#[tokio::test]
async fn test_reconcile_drops_dangling_entries() {
    let provider = MemoryProvider::new();
    let catalog = MemoryCatalog::in_memory();
    seed(&catalog, &provider, "i-1", 3).await;
    provider.remove_image("ami-2");
    let engine = Engine::new(provider, catalog, settings()).unwrap();

    let report = engine.reconcile().await.unwrap();

    assert_eq!(report.dangling_found, vec!["ami-2"]);
    assert!(report.orphans_removed.is_empty());
    assert!(engine.catalog().get("ami-2").await.unwrap().is_none());
}

#[tokio::test]
async fn test_reconcile_is_idempotent() {
    let provider = MemoryProvider::new();
    let catalog = MemoryCatalog::in_memory();
    seed(&catalog, &provider, "i-1", 3).await;
    provider.remove_image("ami-1");
    provider.insert_image("ami-7", "i-2", "stray");
    let engine = Engine::new(provider, catalog, settings()).unwrap();

    let first = engine.reconcile().await.unwrap();
    assert!(!first.is_clean());

    let second = engine.reconcile().await.unwrap();
    assert!(second.is_clean());
}

#[tokio::test]
async fn test_run_backs_up_then_prunes() {
    let provider = MemoryProvider::new();
    let catalog = MemoryCatalog::in_memory();
    seed(&catalog, &provider, "i-1", 3).await;
    let engine = Engine::new(
        provider,
        catalog,
        settings().with_retention(RetentionPolicy::new(3).unwrap()),
    )
    .unwrap();

    let report = engine.run(["i-1"]).await.unwrap();

    assert!(!report.has_failures());
    assert_eq!(report.backup.snapshots().count(), 1);
    assert_eq!(report.retention.removed_count(), 1);

    let kept = engine.catalog().list("i-1").await.unwrap();
    assert_eq!(kept.len(), 3);
    assert_eq!(kept[0].id, "ami-2");
    assert_eq!(&kept[2], report.backup.snapshots().next().unwrap());
}
