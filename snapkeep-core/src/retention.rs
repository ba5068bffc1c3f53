/*!
Retention manager: keep at most N snapshots per instance.

Expired snapshots are removed in two steps: the image is deleted at the
provider first, and only a confirmed deletion (or a provider report that the
image is already gone) removes the catalog entry. A failed provider delete
leaves the entry in place for the next run.
*/

use futures::stream::{self, StreamExt};
use serde::{Deserialize, Serialize};
use tracing::{error, info, warn};

use crate::catalog::Catalog;
use crate::engine::{Engine, ProviderDelete};
use crate::observability::record_snapshots_pruned;
use crate::provider::Provider;
use crate::snapshot::Snapshot;
use crate::{Result, SnapkeepError};

/// Default number of snapshots kept per instance
pub const DEFAULT_MAX_SNAPSHOTS: usize = 7;

/// How many snapshots to keep per instance
#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq)]
#[serde(default)]
pub struct RetentionPolicy {
    max_snapshots_per_instance: usize,
}

impl RetentionPolicy {
    /// Create a policy; `max_snapshots_per_instance` must be at least 1
    pub fn new(max_snapshots_per_instance: usize) -> Result<Self> {
        let policy = Self {
            max_snapshots_per_instance,
        };
        policy.validate()?;
        Ok(policy)
    }

    pub fn max_snapshots_per_instance(&self) -> usize {
        self.max_snapshots_per_instance
    }

    /// Reject policies that would delete every snapshot
    pub fn validate(&self) -> Result<()> {
        if self.max_snapshots_per_instance < 1 {
            return Err(SnapkeepError::policy_violation(format!(
                "max_snapshots_per_instance must be at least 1, got {}",
                self.max_snapshots_per_instance
            )));
        }
        Ok(())
    }
}

impl Default for RetentionPolicy {
    fn default() -> Self {
        Self {
            max_snapshots_per_instance: DEFAULT_MAX_SNAPSHOTS,
        }
    }
}

/// The oldest snapshots beyond the policy limit
///
/// `snapshots` must be ordered oldest first, as returned by
/// [`Catalog::list`].
pub fn select_expired(policy: &RetentionPolicy, snapshots: &[Snapshot]) -> Vec<Snapshot> {
    let excess = snapshots
        .len()
        .saturating_sub(policy.max_snapshots_per_instance);
    snapshots[..excess].to_vec()
}

/// What happened to one expired snapshot
#[derive(Debug)]
pub enum PruneOutcome {
    /// Deleted at the provider and removed from the catalog
    Removed(Snapshot),
    /// The provider no longer had the image; the catalog entry was removed
    AlreadyAbsent(Snapshot),
    /// The provider delete failed; the catalog entry was kept
    Failed {
        snapshot: Snapshot,
        error: SnapkeepError,
    },
    /// Deleted at the provider, but the catalog entry could not be removed
    Unrecorded {
        snapshot: Snapshot,
        error: SnapkeepError,
    },
}

impl PruneOutcome {
    pub fn snapshot(&self) -> &Snapshot {
        match self {
            Self::Removed(snapshot) | Self::AlreadyAbsent(snapshot) => snapshot,
            Self::Failed { snapshot, .. } | Self::Unrecorded { snapshot, .. } => snapshot,
        }
    }

    /// True when the snapshot is gone from the catalog
    pub fn is_removed(&self) -> bool {
        matches!(self, Self::Removed(_) | Self::AlreadyAbsent(_))
    }

    pub fn error(&self) -> Option<&SnapkeepError> {
        match self {
            Self::Failed { error, .. } | Self::Unrecorded { error, .. } => Some(error),
            _ => None,
        }
    }
}

/// Retention result for one instance
#[derive(Debug)]
pub struct RetentionReport {
    pub instance_id: String,
    /// Snapshots the instance had before pruning
    pub before: usize,
    pub outcomes: Vec<PruneOutcome>,
}

impl RetentionReport {
    pub fn removed(&self) -> impl Iterator<Item = &Snapshot> {
        self.outcomes
            .iter()
            .filter(|outcome| outcome.is_removed())
            .map(PruneOutcome::snapshot)
    }

    pub fn failures(&self) -> impl Iterator<Item = &PruneOutcome> {
        self.outcomes.iter().filter(|outcome| outcome.error().is_some())
    }

    pub fn has_failures(&self) -> bool {
        self.failures().next().is_some()
    }
}

/// Retention results across several instances
#[derive(Debug, Default)]
pub struct RetentionBatchReport {
    pub reports: Vec<RetentionReport>,
    /// Instances that could not be processed at all (e.g. catalog unreadable)
    pub errors: Vec<(String, SnapkeepError)>,
    /// Instances not started because shutdown was requested
    pub skipped: Vec<String>,
}

impl RetentionBatchReport {
    pub fn removed_count(&self) -> usize {
        self.reports.iter().map(|report| report.removed().count()).sum()
    }

    pub fn has_failures(&self) -> bool {
        !self.errors.is_empty() || self.reports.iter().any(RetentionReport::has_failures)
    }
}

enum InstanceRetention {
    Done(RetentionReport),
    Error(String, SnapkeepError),
    Skipped(String),
}

impl<P: Provider, C: Catalog> Engine<P, C> {
    /// Snapshots `enforce` would remove for an instance, without acting
    pub async fn plan_retention(
        &self,
        policy: &RetentionPolicy,
        instance_id: &str,
    ) -> Result<Vec<Snapshot>> {
        policy.validate()?;
        let snapshots = self.catalog().list(instance_id).await?;
        Ok(select_expired(policy, &snapshots))
    }

    /// Bring one instance down to the policy limit
    ///
    /// Snapshots are removed oldest first. Each removal is reported
    /// individually; a failed delete does not stop the remaining ones.
    ///
    /// # Errors
    /// Returns `PolicyViolation` for an invalid policy, before any provider
    /// call, and catalog errors raised while listing the instance.
    pub async fn enforce(
        &self,
        policy: &RetentionPolicy,
        instance_id: &str,
    ) -> Result<RetentionReport> {
        policy.validate()?;
        let snapshots = self.catalog().list(instance_id).await?;
        let expired = select_expired(policy, &snapshots);

        let mut outcomes = Vec::with_capacity(expired.len());
        for snapshot in expired {
            outcomes.push(self.prune_snapshot(snapshot).await);
        }

        let report = RetentionReport {
            instance_id: instance_id.to_string(),
            before: snapshots.len(),
            outcomes,
        };
        let removed = report.removed().count();
        record_snapshots_pruned(removed);
        if !report.outcomes.is_empty() {
            info!(
                instance_id,
                before = report.before,
                removed,
                limit = policy.max_snapshots_per_instance(),
                "Retention enforced"
            );
        }
        Ok(report)
    }

    /// Enforce the policy on every instance in the catalog
    pub async fn enforce_all(&self, policy: &RetentionPolicy) -> Result<RetentionBatchReport> {
        policy.validate()?;
        let instance_ids: Vec<String> = self.catalog().all().await?.into_keys().collect();
        self.enforce_many(policy, instance_ids).await
    }

    /// Enforce the policy on the given instances with bounded fan-out
    ///
    /// A failure on one instance never blocks the others.
    pub async fn enforce_many<I, S>(
        &self,
        policy: &RetentionPolicy,
        instance_ids: I,
    ) -> Result<RetentionBatchReport>
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        policy.validate()?;
        let instance_ids: Vec<String> = instance_ids
            .into_iter()
            .map(|id| id.as_ref().to_string())
            .collect();

        let results: Vec<InstanceRetention> = stream::iter(instance_ids)
            .map(|instance_id| async move {
                if self.shutdown().is_triggered() {
                    return InstanceRetention::Skipped(instance_id);
                }
                match self.enforce(policy, &instance_id).await {
                    Ok(report) => InstanceRetention::Done(report),
                    Err(e) => {
                        warn!(
                            instance_id = %instance_id,
                            error = %e,
                            "Retention failed for instance"
                        );
                        InstanceRetention::Error(instance_id, e)
                    }
                }
            })
            .buffered(self.settings().fan_out)
            .collect()
            .await;

        let mut batch = RetentionBatchReport::default();
        for result in results {
            match result {
                InstanceRetention::Done(report) => batch.reports.push(report),
                InstanceRetention::Error(instance_id, e) => batch.errors.push((instance_id, e)),
                InstanceRetention::Skipped(instance_id) => batch.skipped.push(instance_id),
            }
        }
        Ok(batch)
    }

    async fn prune_snapshot(&self, snapshot: Snapshot) -> PruneOutcome {
        let already_absent = match self.delete_at_provider(&snapshot.id).await {
            ProviderDelete::Deleted => false,
            ProviderDelete::AlreadyAbsent => true,
            ProviderDelete::Failed(error) => {
                warn!(
                    instance_id = %snapshot.instance_id,
                    image_id = %snapshot.id,
                    error = %error,
                    "Keeping catalog entry, provider delete failed"
                );
                return PruneOutcome::Failed { snapshot, error };
            }
        };

        match self.catalog().remove(&snapshot.id).await {
            Ok(_) if already_absent => PruneOutcome::AlreadyAbsent(snapshot),
            Ok(_) => PruneOutcome::Removed(snapshot),
            Err(error) => {
                error!(
                    instance_id = %snapshot.instance_id,
                    image_id = %snapshot.id,
                    error = %error,
                    "Image deleted but catalog entry remains; run reconcile"
                );
                PruneOutcome::Unrecorded { snapshot, error }
            }
        }
    }
}
