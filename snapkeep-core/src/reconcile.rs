/*!
Reconciler: make the catalog and the provider agree.

The catalog is read before the provider. An image created by a concurrent
backup after the catalog read therefore shows up as an orphan candidate, so
every candidate is looked up in the catalog again right before it is
deleted.
*/

use futures::stream::{self, StreamExt};
use std::collections::BTreeSet;
use tracing::{info, warn};

use crate::catalog::Catalog;
use crate::engine::{Engine, ProviderDelete};
use crate::observability::{record_dangling_found, record_orphans_removed};
use crate::provider::Provider;
use crate::snapshot::Snapshot;
use crate::{Result, SnapkeepError};

/// Differences between the catalog and the provider, before acting on them
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ReconcilePlan {
    /// Provider images with no catalog entry
    pub orphans: Vec<String>,
    /// Catalog entries with no provider image
    pub dangling: Vec<Snapshot>,
}

impl ReconcilePlan {
    pub fn is_empty(&self) -> bool {
        self.orphans.is_empty() && self.dangling.is_empty()
    }
}

/// What a reconcile pass did
#[derive(Debug, Default)]
pub struct ReconcileReport {
    /// Orphan images deleted at the provider
    pub orphans_removed: Vec<String>,
    /// Snapshot ids removed from the catalog because the provider lacks them
    pub dangling_found: Vec<String>,
    /// Orphans that disappeared at the provider before we deleted them
    pub already_absent: Vec<String>,
    /// Orphan candidates that were recorded in the catalog by the time of
    /// the recheck, and were left alone
    pub rechecked_kept: Vec<String>,
    pub failures: Vec<(String, SnapkeepError)>,
}

impl ReconcileReport {
    pub fn has_failures(&self) -> bool {
        !self.failures.is_empty()
    }

    /// True when nothing needed fixing
    pub fn is_clean(&self) -> bool {
        self.orphans_removed.is_empty()
            && self.dangling_found.is_empty()
            && self.already_absent.is_empty()
            && self.rechecked_kept.is_empty()
            && self.failures.is_empty()
    }
}

enum OrphanOutcome {
    Removed(String),
    AlreadyAbsent(String),
    Kept(String),
    Failed(String, SnapkeepError),
}

impl<P: Provider, C: Catalog> Engine<P, C> {
    /// Classify orphans and dangling entries without changing anything
    pub async fn plan_reconcile(&self) -> Result<ReconcilePlan> {
        let recorded: Vec<Snapshot> = self
            .catalog()
            .all()
            .await?
            .into_values()
            .flatten()
            .collect();
        let present = self.provider_inventory().await?;

        let recorded_ids: BTreeSet<&str> =
            recorded.iter().map(|s| s.id.as_str()).collect();
        let orphans = present
            .iter()
            .filter(|id| !recorded_ids.contains(id.as_str()))
            .cloned()
            .collect();
        let dangling = recorded
            .iter()
            .filter(|snapshot| !present.contains(&snapshot.id))
            .cloned()
            .collect();

        Ok(ReconcilePlan { orphans, dangling })
    }

    /// Delete orphan images and drop dangling catalog entries
    ///
    /// Running it twice without other activity in between leaves the second
    /// report clean.
    ///
    /// # Errors
    /// Fails only when either inventory cannot be read; per-image problems
    /// are collected in the report.
    pub async fn reconcile(&self) -> Result<ReconcileReport> {
        let plan = self.plan_reconcile().await?;
        info!(
            orphans = plan.orphans.len(),
            dangling = plan.dangling.len(),
            "Reconciling catalog with provider"
        );

        let mut report = ReconcileReport::default();

        let orphan_outcomes: Vec<OrphanOutcome> = stream::iter(plan.orphans)
            .map(|image_id| self.remove_orphan(image_id))
            .buffered(self.settings().fan_out)
            .collect()
            .await;
        for outcome in orphan_outcomes {
            match outcome {
                OrphanOutcome::Removed(id) => report.orphans_removed.push(id),
                OrphanOutcome::AlreadyAbsent(id) => report.already_absent.push(id),
                OrphanOutcome::Kept(id) => report.rechecked_kept.push(id),
                OrphanOutcome::Failed(id, e) => report.failures.push((id, e)),
            }
        }

        for snapshot in plan.dangling {
            match self.catalog().remove(&snapshot.id).await {
                Ok(Some(_)) => {
                    warn!(
                        instance_id = %snapshot.instance_id,
                        image_id = %snapshot.id,
                        "Removed dangling catalog entry"
                    );
                    report.dangling_found.push(snapshot.id);
                }
                Ok(None) => {}
                Err(e) => report.failures.push((snapshot.id, e)),
            }
        }

        record_orphans_removed(report.orphans_removed.len());
        record_dangling_found(report.dangling_found.len());
        info!(
            orphans_removed = report.orphans_removed.len(),
            dangling_found = report.dangling_found.len(),
            failures = report.failures.len(),
            "Reconcile complete"
        );
        Ok(report)
    }

    async fn remove_orphan(&self, image_id: String) -> OrphanOutcome {
        match self.catalog().get(&image_id).await {
            Ok(Some(_)) => {
                info!(image_id = %image_id, "Orphan candidate is now recorded, keeping it");
                return OrphanOutcome::Kept(image_id);
            }
            Ok(None) => {}
            Err(e) => return OrphanOutcome::Failed(image_id, e),
        }

        match self.delete_at_provider(&image_id).await {
            ProviderDelete::Deleted => {
                info!(image_id = %image_id, "Deleted orphan image");
                OrphanOutcome::Removed(image_id)
            }
            ProviderDelete::AlreadyAbsent => OrphanOutcome::AlreadyAbsent(image_id),
            ProviderDelete::Failed(e) => OrphanOutcome::Failed(image_id, e),
        }
    }
}
