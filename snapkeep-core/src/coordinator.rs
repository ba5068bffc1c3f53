/*!
Snapshot coordinator: one backup run over a set of instances.

Each instance goes through create-then-record. The provider call is retried
under the engine's policy, but a retry never creates blindly: it first asks
the provider for an image carrying the name this run proposed, so an image
whose creation response was lost is adopted instead of duplicated.
*/

use chrono::{DateTime, Utc};
use futures::stream::{self, StreamExt};
use snapkeep_retry::with_policy;
use std::collections::HashSet;
use tracing::{error, info, info_span, warn, Instrument};
use uuid::Uuid;

use crate::catalog::Catalog;
use crate::engine::Engine;
use crate::observability::{record_provider_retry, record_snapshots_created, ProviderTimer};
use crate::provider::Provider;
use crate::snapshot::{snapshot_name, Snapshot};
use crate::SnapkeepError;

/// What happened to one instance during a backup run
#[derive(Debug)]
pub enum BackupOutcome {
    /// The image was created and recorded in the catalog
    Created(Snapshot),
    Failed {
        instance_id: String,
        error: SnapkeepError,
    },
    /// Shutdown was requested before work on this instance started
    Skipped { instance_id: String },
}

impl BackupOutcome {
    pub fn instance_id(&self) -> &str {
        match self {
            Self::Created(snapshot) => &snapshot.instance_id,
            Self::Failed { instance_id, .. } | Self::Skipped { instance_id } => instance_id,
        }
    }

    pub fn is_created(&self) -> bool {
        matches!(self, Self::Created(_))
    }
}

/// Per-instance outcomes of one backup run, in input order
#[derive(Debug)]
pub struct BackupReport {
    pub run_id: Uuid,
    pub started_at: DateTime<Utc>,
    pub outcomes: Vec<BackupOutcome>,
}

impl BackupReport {
    /// Snapshots created and recorded by this run
    pub fn snapshots(&self) -> impl Iterator<Item = &Snapshot> {
        self.outcomes.iter().filter_map(|outcome| match outcome {
            BackupOutcome::Created(snapshot) => Some(snapshot),
            _ => None,
        })
    }

    /// Instances that failed, with the reason
    pub fn failures(&self) -> impl Iterator<Item = (&str, &SnapkeepError)> {
        self.outcomes.iter().filter_map(|outcome| match outcome {
            BackupOutcome::Failed { instance_id, error } => Some((instance_id.as_str(), error)),
            _ => None,
        })
    }

    pub fn skipped(&self) -> impl Iterator<Item = &str> {
        self.outcomes.iter().filter_map(|outcome| match outcome {
            BackupOutcome::Skipped { instance_id } => Some(instance_id.as_str()),
            _ => None,
        })
    }

    pub fn has_failures(&self) -> bool {
        self.failures().next().is_some()
    }
}

impl<P: Provider, C: Catalog> Engine<P, C> {
    /// Create and record one snapshot for each distinct instance id
    ///
    /// Duplicate ids are collapsed (first occurrence wins). A failure for
    /// one instance never affects the others; every instance gets exactly
    /// one outcome.
    pub async fn backup<I, S>(&self, instance_ids: I) -> BackupReport
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let run_id = Uuid::new_v4();
        let started_at = Utc::now();

        let mut seen = HashSet::new();
        let instance_ids: Vec<String> = instance_ids
            .into_iter()
            .map(|id| id.as_ref().to_string())
            .filter(|id| seen.insert(id.clone()))
            .collect();

        let span = info_span!("backup", %run_id);
        let outcomes = async {
            info!(
                instances = instance_ids.len(),
                fan_out = self.settings().fan_out,
                "Starting backup run"
            );

            let outcomes: Vec<BackupOutcome> = stream::iter(instance_ids)
                .map(|instance_id| self.backup_instance(instance_id, run_id, started_at))
                .buffered(self.settings().fan_out)
                .collect()
                .await;

            let created = outcomes
                .iter()
                .filter(|outcome| outcome.is_created())
                .count();
            record_snapshots_created(created);
            info!(created, total = outcomes.len(), "Backup run complete");
            outcomes
        }
        .instrument(span)
        .await;

        BackupReport {
            run_id,
            started_at,
            outcomes,
        }
    }

    async fn backup_instance(
        &self,
        instance_id: String,
        run_id: Uuid,
        started_at: DateTime<Utc>,
    ) -> BackupOutcome {
        if instance_id.trim().is_empty() {
            return BackupOutcome::Failed {
                instance_id,
                error: SnapkeepError::validation("instance id cannot be empty"),
            };
        }
        if self.shutdown().is_triggered() {
            info!(instance_id = %instance_id, "Shutdown requested, skipping instance");
            return BackupOutcome::Skipped { instance_id };
        }

        let name = snapshot_name(&instance_id, started_at, run_id);
        let created = with_policy("create_image", &self.settings().retry, |attempt| {
            let (instance_id, name) = (&instance_id, &name);
            async move {
                if attempt > 1 {
                    record_provider_retry("create_image");
                    if let Some(image_id) = self.provider().find_image_by_name(name).await? {
                        info!(
                            instance_id = %instance_id,
                            image_id = %image_id,
                            attempt,
                            "Adopting image created by an earlier attempt"
                        );
                        return Ok(image_id);
                    }
                }
                let timer = ProviderTimer::start("create_image");
                let result = self.provider().create_image(instance_id, name).await;
                timer.finish(result.is_ok());
                result
            }
        })
        .await;

        let image_id = match created {
            Ok(image_id) => image_id,
            Err(e) => {
                let error = SnapkeepError::from(e);
                warn!(instance_id = %instance_id, error = %error, "Snapshot creation failed");
                return BackupOutcome::Failed { instance_id, error };
            }
        };

        let snapshot = Snapshot::new(image_id, instance_id, name, Utc::now());
        match self.catalog().append(snapshot.clone()).await {
            Ok(()) => {
                info!(
                    instance_id = %snapshot.instance_id,
                    image_id = %snapshot.id,
                    "Snapshot created"
                );
                BackupOutcome::Created(snapshot)
            }
            Err(e) => {
                error!(
                    instance_id = %snapshot.instance_id,
                    image_id = %snapshot.id,
                    error = %e,
                    "Image created but not recorded; run reconcile"
                );
                BackupOutcome::Failed {
                    instance_id: snapshot.instance_id.clone(),
                    error: SnapkeepError::RecordedInconsistent {
                        instance_id: snapshot.instance_id,
                        image_id: snapshot.id,
                        reason: e.to_string(),
                    },
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::catalog::MemoryCatalog;
    use crate::engine::EngineSettings;
    use crate::provider::{MemoryProvider, MockProvider, ProviderError};
    use snapkeep_retry::RetryPolicy;

    fn settings() -> EngineSettings {
        EngineSettings::default()
            .with_fan_out(1)
            .with_retry(RetryPolicy::immediate(3))
    }

    #[tokio::test]
    async fn test_duplicate_and_blank_ids() {
        let engine =
            Engine::new(MemoryProvider::new(), MemoryCatalog::in_memory(), settings()).unwrap();

        let report = engine.backup(["i-1", "", "i-1", "i-2"]).await;

        let ids: Vec<_> = report
            .outcomes
            .iter()
            .map(BackupOutcome::instance_id)
            .collect();
        assert_eq!(ids, vec!["i-1", "", "i-2"]);
        assert_eq!(report.snapshots().count(), 2);
        assert!(matches!(
            report.failures().next(),
            Some(("", SnapkeepError::Validation(_)))
        ));
        assert_eq!(engine.provider().create_calls(), vec!["i-1", "i-2"]);
    }

    #[tokio::test]
    async fn test_retry_checks_name_before_creating() {
        let mut provider = MockProvider::new();
        provider
            .expect_create_image()
            .times(1)
            .returning(|_, _| Err(ProviderError::transient("request timed out")));
        provider
            .expect_find_image_by_name()
            .times(1)
            .returning(|_| Ok(Some("ami-7".to_string())));

        let engine = Engine::new(provider, MemoryCatalog::in_memory(), settings()).unwrap();
        let report = engine.backup(["i-1"]).await;

        let created: Vec<_> = report.snapshots().map(|s| s.id.as_str()).collect();
        assert_eq!(created, vec!["ami-7"]);
        assert_eq!(engine.catalog().list("i-1").await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_permanent_error_is_not_retried() {
        let mut provider = MockProvider::new();
        provider
            .expect_create_image()
            .times(1)
            .returning(|_, _| Err(ProviderError::permanent("invalid instance id")));
        provider.expect_find_image_by_name().times(0);

        let engine = Engine::new(provider, MemoryCatalog::in_memory(), settings()).unwrap();
        let report = engine.backup(["i-bad"]).await;

        assert!(matches!(
            report.failures().next(),
            Some(("i-bad", SnapkeepError::Provider(_)))
        ));
        assert!(engine.catalog().all().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_catalog_failure_is_reported_as_inconsistent() {
        let catalog = MemoryCatalog::in_memory();
        catalog.store().set_read_only(true);
        let engine = Engine::new(MemoryProvider::new(), catalog, settings()).unwrap();

        let report = engine.backup(["i-1"]).await;

        let (_, error) = report.failures().next().unwrap();
        assert!(error.needs_reconcile());
        assert_eq!(engine.provider().image_count(), 1);
    }

    #[tokio::test]
    async fn test_back_to_back_runs_never_adopt_each_others_images() {
        let engine =
            Engine::new(MemoryProvider::new(), MemoryCatalog::in_memory(), settings()).unwrap();

        let first = engine.backup(["i-1"]).await;
        engine
            .provider()
            .fail_create("i-1", ProviderError::transient("RequestLimitExceeded"));
        let second = engine.backup(["i-1"]).await;
        let third = engine.backup(["i-1"]).await;

        let created: Vec<&Snapshot> = first
            .snapshots()
            .chain(second.snapshots())
            .chain(third.snapshots())
            .collect();
        let ids: Vec<_> = created.iter().map(|s| s.id.as_str()).collect();
        assert_eq!(ids, vec!["ami-1", "ami-2", "ami-3"]);
        assert!(created[1]
            .name
            .ends_with(&format!("{:08x}", second.run_id.as_fields().0)));
        assert_eq!(engine.provider().image_count(), 3);

        let recorded = engine.catalog().list("i-1").await.unwrap();
        assert_eq!(recorded.len(), 3);
        for snapshot in created {
            assert!(recorded.contains(snapshot));
        }
    }

    #[tokio::test]
    async fn test_shutdown_skips_pending_instances() {
        let engine =
            Engine::new(MemoryProvider::new(), MemoryCatalog::in_memory(), settings()).unwrap();
        engine.shutdown().trigger();

        let report = engine.backup(["i-1", "i-2"]).await;

        assert_eq!(report.skipped().count(), 2);
        assert!(!report.has_failures());
        assert!(engine.provider().create_calls().is_empty());
    }
}
